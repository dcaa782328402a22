// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Transport orchestrator: turns the latest content of each Binding into a
//! delivered batch.
//!
//! Each cycle walks Idle -> Resolving -> Projecting -> Delivering -> Idle.
//! Binding updates arriving mid-cycle are picked up by a fresh cycle once the
//! current one finishes (the work queue re-queues a key that was dirtied while
//! being processed). Every resolve and deliver call is bounded by a timeout and
//! abandoned on shutdown; the batch is handed to the sink in one call, after
//! all objects have been prepared.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::{DeliverySink, ObjectResolver, Transport, strip_server_fields};
use crate::binding::{BindingProjector, ContentObserver};
use crate::error::{Error, ErrorClass, Result};
use crate::ownership::FieldOwnershipProjector;
use crate::policy::BindingSpec;
use crate::progress::ProgressHandle;
use crate::workqueue::WorkQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Resolving,
    Projecting,
    Delivering,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub resolve_timeout: Duration,
    pub deliver_timeout: Duration,
    /// Delay before a failed cycle is retried
    pub retry_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(5),
            deliver_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
        }
    }
}

pub struct TransportOrchestrator<T: Transport> {
    transport: T,
    resolver: Arc<dyn ObjectResolver>,
    sink: Arc<dyn DeliverySink<T::Wrapper>>,
    projector: FieldOwnershipProjector,
    config: OrchestratorConfig,
    /// Latest known content of each Binding
    bindings: RwLock<HashMap<String, BindingSpec>>,
    /// Destinations each Binding was last delivered to
    delivered: Mutex<HashMap<String, Vec<String>>>,
    states: Mutex<HashMap<String, CycleState>>,
    queue: Arc<WorkQueue<String>>,
    shutdown: watch::Receiver<bool>,
    progress: ProgressHandle,
}

impl<T: Transport> TransportOrchestrator<T> {
    pub fn new(
        transport: T,
        resolver: Arc<dyn ObjectResolver>,
        sink: Arc<dyn DeliverySink<T::Wrapper>>,
        projector: FieldOwnershipProjector,
        config: OrchestratorConfig,
        shutdown: watch::Receiver<bool>,
        progress: ProgressHandle,
    ) -> Self {
        Self {
            transport,
            resolver,
            sink,
            projector,
            config,
            bindings: RwLock::new(HashMap::new()),
            delivered: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            queue: Arc::new(WorkQueue::new()),
            shutdown,
            progress,
        }
    }

    /// A Binding was created or updated
    pub fn binding_changed(&self, name: &str, spec: BindingSpec) {
        self.bindings.write().insert(name.to_string(), spec);
        self.queue.add(name.to_string());
    }

    pub fn binding_deleted(&self, name: &str) {
        self.bindings.write().remove(name);
        self.queue.add(name.to_string());
    }

    pub fn state(&self, name: &str) -> CycleState {
        self.states
            .lock()
            .get(name)
            .copied()
            .unwrap_or(CycleState::Idle)
    }

    fn set_state(&self, name: &str, state: CycleState) {
        trace!(binding = %name, state = ?state, "Cycle state");
        let mut states = self.states.lock();
        if state == CycleState::Idle {
            states.remove(name);
        } else {
            states.insert(name.to_string(), state);
        }
    }

    /// Stop handing out work; in-flight steps are abandoned through the
    /// shutdown signal
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// Spawn workers draining the queue
    pub fn run(self: &Arc<Self>, workers: usize) -> Vec<tokio::task::JoinHandle<()>>
    where
        T: 'static,
    {
        (0..workers.max(1))
            .map(|worker| {
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move {
                    while let Some(name) = orchestrator.queue.get().await {
                        orchestrator.process(&name).await;
                        orchestrator.queue.done(&name);
                    }
                    trace!(worker, "Transport worker exiting");
                })
            })
            .collect()
    }

    async fn process(&self, name: &str) {
        match self.sync(name).await {
            Ok(()) => {}
            Err(Error::Cancelled) => debug!(binding = %name, "Cycle cancelled"),
            Err(e) => {
                warn!(binding = %name, error = %e, "Transport cycle failed, will retry");
                self.progress.cycle_failed(name, &e.to_string());
                self.queue
                    .requeue_after(name.to_string(), self.config.retry_delay);
            }
        }
    }

    /// Run one cycle for a Binding against its latest content. The Binding
    /// is back in [`CycleState::Idle`] when this returns, whatever the outcome.
    pub async fn sync(&self, name: &str) -> Result<()> {
        let result = self.cycle(name).await;
        self.set_state(name, CycleState::Idle);
        result
    }

    async fn cycle(&self, name: &str) -> Result<()> {
        let spec = self.bindings.read().get(name).cloned();
        let Some(spec) = spec else {
            return self.withdraw_all(name).await;
        };

        self.set_state(name, CycleState::Resolving);
        let mut resolved = Vec::new();
        for reference in BindingProjector::references(&spec.workload) {
            let found = self
                .step(
                    "resolve",
                    self.config.resolve_timeout,
                    self.resolver.resolve(&reference.gvr, &reference.key()),
                )
                .await?;
            match found {
                Some(obj) => resolved.push(obj),
                // Deleted since it was matched; the next Binding drops it
                None => debug!(binding = %name, object = %reference, "Referenced object no longer exists"),
            }
        }

        self.set_state(name, CycleState::Projecting);
        let mut objects: Vec<Value> = Vec::with_capacity(resolved.len());
        for obj in &resolved {
            self.check_cancelled()?;
            match self.projector.project(obj) {
                Ok(mut doc) => {
                    strip_server_fields(&mut doc);
                    objects.push(doc);
                }
                Err(e) if e.class() == ErrorClass::Structural => {
                    warn!(binding = %name, error = %e, "Excluding object from batch");
                }
                Err(e) => return Err(e),
            }
        }
        let count = objects.len();
        let wrapper = self.transport.wrap_objects(objects)?;

        self.set_state(name, CycleState::Delivering);
        let destinations: Vec<String> = spec
            .destinations
            .iter()
            .map(|d| d.cluster_id.clone())
            .collect();
        self.step(
            "deliver",
            self.config.deliver_timeout,
            self.sink.deliver(name, &destinations, &wrapper),
        )
        .await?;
        info!(
            binding = %name,
            objects = count,
            destinations = destinations.len(),
            "Delivered batch"
        );
        self.progress.delivered(name, destinations.len(), count);

        let previous = self
            .delivered
            .lock()
            .insert(name.to_string(), destinations.clone())
            .unwrap_or_default();
        let removed: Vec<String> = previous
            .into_iter()
            .filter(|d| !destinations.contains(d))
            .collect();
        if !removed.is_empty() {
            let result = self
                .step(
                    "withdraw",
                    self.config.deliver_timeout,
                    self.sink.withdraw(name, &removed),
                )
                .await;
            if let Err(e) = result {
                // Remember them so the retry withdraws again
                if let Some(current) = self.delivered.lock().get_mut(name) {
                    current.extend(removed);
                }
                return Err(e);
            }
            debug!(binding = %name, destinations = ?removed, "Withdrew from removed destinations");
        }
        Ok(())
    }

    async fn withdraw_all(&self, name: &str) -> Result<()> {
        let previous = self.delivered.lock().remove(name);
        let Some(destinations) = previous.filter(|d| !d.is_empty()) else {
            return Ok(());
        };
        self.set_state(name, CycleState::Delivering);
        let result = self
            .step(
                "withdraw",
                self.config.deliver_timeout,
                self.sink.withdraw(name, &destinations),
            )
            .await;
        match result {
            Ok(()) => {
                info!(binding = %name, "Binding deleted, withdrew from destinations");
                Ok(())
            }
            Err(e) => {
                self.delivered.lock().insert(name.to_string(), destinations);
                Err(e)
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Run one external call under a timeout, abandoning it on shutdown
    async fn step<F, R>(&self, operation: &'static str, timeout: Duration, call: F) -> Result<R>
    where
        F: Future<Output = Result<R>>,
    {
        self.check_cancelled()?;
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout { operation, timeout }),
            },
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        // Sender gone without signalling: never fires
        std::future::pending::<()>().await;
    }
}

impl<T: Transport> ContentObserver for TransportOrchestrator<T> {
    fn content_changed(&self, binding: &str) {
        if self.bindings.read().contains_key(binding) {
            self.queue.add(binding.to_string());
        }
    }
}
