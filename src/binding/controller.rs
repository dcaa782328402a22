// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Binding controller
//!
//! Keeps one Binding per BindingPolicy in step with the watched objects.
//! Object changes arrive through the work queue; a change that flips an
//! object's membership in a policy queues that policy for a full recompute,
//! while a change to an object that stays selected only re-triggers delivery
//! of the existing Binding. Work for one policy is never processed twice at
//! once (the queue hands each key to one worker at a time).

use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{BindingProjector, ObjectRef};
use crate::error::Result;
use crate::kubernetes::watch::{ObjectChange, ObjectEventSink};
use crate::kubernetes::{CatalogueEntry, Gvk, ObjectKey, WatchManager};
use crate::policy::{
    Binding, BindingPolicy, BindingPolicyStatus, BindingSpec, Candidate, CompiledRule, Destination,
    compile_rules, matches_any,
};
use crate::progress::ProgressHandle;
use crate::workqueue::WorkQueue;

/// Delay before retrying a failed Binding publish
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindingWork {
    Object { gvk: Gvk, key: ObjectKey },
    Policy(String),
}

impl ObjectEventSink for WorkQueue<BindingWork> {
    fn object_changed(&self, change: ObjectChange) {
        self.add(BindingWork::Object {
            gvk: change.gvk,
            key: change.key,
        });
    }
}

/// Persists Bindings and policy status
#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn apply_binding(&self, policy: &BindingPolicy, spec: &BindingSpec) -> Result<()>;
    async fn delete_binding(&self, name: &str) -> Result<()>;
    async fn update_status(&self, name: &str, status: &BindingPolicyStatus) -> Result<()>;
}

/// Told when objects selected by a Binding changed while membership did not
pub trait ContentObserver: Send + Sync {
    fn content_changed(&self, binding: &str);
}

struct PolicyState {
    policy: Arc<BindingPolicy>,
    rules: Arc<Vec<CompiledRule>>,
    errors: Vec<String>,
    uses_namespace_selectors: bool,
    /// Membership as of the last successful publish
    matched: HashSet<(Gvk, ObjectKey)>,
    published: Option<BindingSpec>,
    last_status: Option<BindingPolicyStatus>,
}

pub struct BindingController {
    watches: Arc<WatchManager>,
    store: Arc<dyn BindingStore>,
    observer: Arc<dyn ContentObserver>,
    queue: Arc<WorkQueue<BindingWork>>,
    policies: RwLock<HashMap<String, PolicyState>>,
    progress: ProgressHandle,
    retry_delay: Duration,
}

impl BindingController {
    pub fn new(
        watches: Arc<WatchManager>,
        store: Arc<dyn BindingStore>,
        observer: Arc<dyn ContentObserver>,
        queue: Arc<WorkQueue<BindingWork>>,
        progress: ProgressHandle,
    ) -> Self {
        Self {
            watches,
            store,
            observer,
            queue,
            policies: RwLock::new(HashMap::new()),
            progress,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// A policy was created or changed
    pub fn policy_changed(&self, policy: BindingPolicy) {
        let name = policy.name_any();
        let (rules, errors) = compile_rules(&name, &policy.spec.downsync);
        let uses_namespace_selectors = rules.iter().any(CompiledRule::uses_namespace_selectors);
        debug!(policy = %name, rules = rules.len(), errors = errors.len(), "Policy changed");

        {
            let mut policies = self.policies.write();
            let policy = Arc::new(policy);
            let rules = Arc::new(rules);
            match policies.get_mut(&name) {
                Some(state) => {
                    state.policy = policy;
                    state.rules = rules;
                    state.errors = errors;
                    state.uses_namespace_selectors = uses_namespace_selectors;
                }
                None => {
                    policies.insert(
                        name.clone(),
                        PolicyState {
                            policy,
                            rules,
                            errors,
                            uses_namespace_selectors,
                            matched: HashSet::new(),
                            published: None,
                            last_status: None,
                        },
                    );
                }
            }
        }
        self.queue.add(BindingWork::Policy(name));
    }

    pub fn policy_deleted(&self, name: &str) {
        self.policies.write().remove(name);
        self.queue.add(BindingWork::Policy(name.to_string()));
    }

    /// Watches for these types were stopped; their objects are gone
    pub fn types_stopped(&self, gvks: &[Gvk]) {
        let affected: Vec<String> = self
            .policies
            .read()
            .iter()
            .filter(|(_, state)| state.matched.iter().any(|(gvk, _)| gvks.contains(gvk)))
            .map(|(name, _)| name.clone())
            .collect();
        for name in affected {
            self.queue.add(BindingWork::Policy(name));
        }
    }

    /// Published Binding for a policy, if any
    pub fn binding(&self, name: &str) -> Option<BindingSpec> {
        self.policies.read().get(name).and_then(|s| s.published.clone())
    }

    /// Spawn workers draining the queue. They exit when the queue shuts down.
    pub fn run(self: &Arc<Self>, workers: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let controller = Arc::clone(self);
                tokio::spawn(async move {
                    while let Some(work) = controller.queue.get().await {
                        controller.process(&work).await;
                        controller.queue.done(&work);
                    }
                    trace!(worker, "Binding worker exiting");
                })
            })
            .collect()
    }

    pub async fn process(&self, work: &BindingWork) {
        match work {
            BindingWork::Object { gvk, key } => self.handle_object(gvk, key),
            BindingWork::Policy(name) => self.handle_policy(name).await,
        }
    }

    fn evaluate(&self, rules: &[CompiledRule], entry: &CatalogueEntry, obj: &DynamicObject) -> bool {
        let empty = Default::default();
        let labels = obj.metadata.labels.as_ref().unwrap_or(&empty);
        let namespace = obj
            .metadata
            .namespace
            .as_deref()
            .filter(|ns| entry.namespaced && !ns.is_empty());
        let candidate = Candidate {
            group: &entry.group,
            resource: &entry.resource,
            namespace,
            name: obj.metadata.name.as_deref().unwrap_or_default(),
            labels,
        };
        let ns_labels = namespace.and_then(|ns| self.watches.namespace_labels(ns));
        matches_any(rules, &candidate, ns_labels.as_ref())
    }

    /// A watched type the rules depend on whose initial list is still running
    fn unsynced_dependency(&self, rules: &[CompiledRule]) -> Option<Gvk> {
        let uses_namespace_selectors = rules.iter().any(CompiledRule::uses_namespace_selectors);
        self.watches
            .unsynced()
            .into_iter()
            .find(|entry| {
                (uses_namespace_selectors && entry.gvk() == Gvk::namespace())
                    || rules
                        .iter()
                        .any(|rule| rule.may_select(&entry.group, &entry.resource))
            })
            .map(|entry| entry.gvk())
    }

    fn handle_object(&self, gvk: &Gvk, key: &ObjectKey) {
        let entry = self.watches.entry(gvk);
        let obj = self.watches.get(gvk, key);
        let member = (gvk.clone(), key.clone());
        let namespace_changed = *gvk == Gvk::namespace();

        let mut recompute = Vec::new();
        let mut content = Vec::new();
        {
            let policies = self.policies.read();
            for (name, state) in policies.iter() {
                if namespace_changed && state.uses_namespace_selectors {
                    recompute.push(name.clone());
                    continue;
                }
                let now = match (&entry, &obj) {
                    (Some(entry), Some(obj)) => self.evaluate(&state.rules, entry, obj),
                    _ => false,
                };
                match (state.matched.contains(&member), now) {
                    (false, false) => {}
                    (true, true) => {
                        if state.published.is_some() {
                            content.push(name.clone());
                        }
                    }
                    _ => recompute.push(name.clone()),
                }
            }
        }

        for name in recompute {
            trace!(policy = %name, gvk = %gvk, object = %key, "Membership changed");
            self.queue.add(BindingWork::Policy(name));
        }
        for name in content {
            self.observer.content_changed(&name);
        }
    }

    async fn handle_policy(&self, name: &str) {
        let current = self.policies.read().get(name).map(|s| {
            (
                Arc::clone(&s.policy),
                Arc::clone(&s.rules),
                s.errors.clone(),
                s.published.clone(),
                s.last_status.clone(),
            )
        });

        let Some((policy, rules, errors, published, last_status)) = current else {
            match self.store.delete_binding(name).await {
                Ok(()) => info!(policy = %name, "Policy deleted, removed Binding"),
                Err(e) => {
                    warn!(policy = %name, error = %e, "Failed to delete Binding, will retry");
                    self.queue
                        .requeue_after(BindingWork::Policy(name.to_string()), self.retry_delay);
                }
            }
            return;
        };

        // Only recompute from fully listed caches
        if let Some(gvk) = self.unsynced_dependency(&rules) {
            debug!(policy = %name, gvk = %gvk, "Initial list pending, deferring recompute");
            self.queue
                .requeue_after(BindingWork::Policy(name.to_string()), self.retry_delay);
            return;
        }

        // Evaluate every watched object in a stable order
        let mut matched = HashSet::new();
        let mut refs = Vec::new();
        for (entry, objects) in self.watches.snapshot() {
            let gvk = entry.gvk();
            let gvr = entry.gvr();
            for obj in objects {
                if !self.evaluate(&rules, &entry, &obj) {
                    continue;
                }
                let namespace = obj.metadata.namespace.as_deref().filter(|_| entry.namespaced);
                let name = obj.metadata.name.as_deref().unwrap_or_default();
                matched.insert((gvk.clone(), ObjectKey::new(namespace, name)));
                refs.push(ObjectRef::new(gvr.clone(), namespace, name));
            }
        }

        let mut destinations: Vec<Destination> = policy
            .spec
            .destinations
            .iter()
            .map(|d| Destination {
                cluster_id: d.clone(),
            })
            .collect();
        destinations.sort();
        destinations.dedup();

        let spec = BindingSpec {
            workload: BindingProjector::project(&refs),
            destinations,
        };

        if published.as_ref() != Some(&spec) {
            if let Err(e) = self.store.apply_binding(&policy, &spec).await {
                // The previous Binding stays in place
                warn!(policy = %name, error = %e, "Failed to publish Binding, will retry");
                self.queue
                    .requeue_after(BindingWork::Policy(name.to_string()), self.retry_delay);
                return;
            }
            info!(
                policy = %name,
                objects = spec.workload.len(),
                destinations = spec.destinations.len(),
                "Published Binding"
            );
            self.progress.binding_published(name, spec.workload.len());
        }

        let status = BindingPolicyStatus {
            observed_generation: policy.metadata.generation.unwrap_or_default(),
            matched_objects: refs.len() as i64,
            errors,
        };

        {
            let mut policies = self.policies.write();
            if let Some(state) = policies.get_mut(name) {
                state.matched = matched;
                state.published = Some(spec);
            }
        }

        // Best-effort: never blocks matching
        if last_status.as_ref() != Some(&status) {
            match self.store.update_status(name, &status).await {
                Ok(()) => {
                    if let Some(state) = self.policies.write().get_mut(name) {
                        state.last_status = Some(status);
                    }
                }
                Err(e) => debug!(policy = %name, error = %e, "Failed to update policy status"),
            }
        }
    }
}

/// Stores Bindings as cluster objects owned by their policy
pub struct KubeBindingStore {
    client: Client,
    field_manager: String,
}

impl KubeBindingStore {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }
}

#[async_trait]
impl BindingStore for KubeBindingStore {
    async fn apply_binding(&self, policy: &BindingPolicy, spec: &BindingSpec) -> Result<()> {
        let name = policy.name_any();
        let api: Api<Binding> = Api::all(self.client.clone());
        let owner = policy.controller_owner_ref(&());
        let binding = json!({
            "apiVersion": Binding::api_version(&()),
            "kind": Binding::kind(&()),
            "metadata": {
                "name": name,
                "ownerReferences": owner.into_iter().collect::<Vec<_>>(),
            },
            "spec": spec,
        });
        api.patch(
            &name,
            &PatchParams::apply(&self.field_manager).force(),
            &Patch::Apply(&binding),
        )
        .await?;
        Ok(())
    }

    async fn delete_binding(&self, name: &str) -> Result<()> {
        let api: Api<Binding> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(&self, name: &str, status: &BindingPolicyStatus) -> Result<()> {
        let api: Api<BindingPolicy> = Api::all(self.client.clone());
        api.patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}
