// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Progress reporting for the control loops
//!
//! Discovery, the watch manager, the binding controller and the transport
//! orchestrator report what they did here. The `run` command follows the
//! updates with [`log_updates`]; nothing in the loops depends on anyone
//! listening.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::debug;

use crate::kubernetes::Gvk;

/// Progress update message
#[derive(Clone, Debug)]
pub enum ProgressUpdate {
    /// A discovery pass finished
    DiscoveryComplete { resource_types: usize, incomplete: bool },
    /// A watch was opened for a resource type
    WatchStarted { gvk: String },
    /// A watch was closed because its type is no longer served
    WatchStopped { gvk: String },
    /// A Binding was regenerated from its policy
    BindingPublished { policy: String, objects: usize },
    /// A Binding's wrapped payload was handed to its destinations
    Delivered {
        binding: String,
        destinations: usize,
        objects: usize,
    },
    /// A transport cycle failed and will be retried
    CycleFailed { binding: String, error: String },
}

/// Global progress reporter
pub struct ProgressReporter {
    sender: broadcast::Sender<ProgressUpdate>,
    /// Number of open watches
    active_watches: AtomicUsize,
    /// Deliveries since startup
    deliveries: AtomicUsize,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            sender,
            active_watches: AtomicUsize::new(0),
            deliveries: AtomicUsize::new(0),
        }
    }

    /// Subscribe to progress updates
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.sender.subscribe()
    }

    pub fn discovery_complete(&self, resource_types: usize, incomplete: bool) {
        let _ = self.sender.send(ProgressUpdate::DiscoveryComplete {
            resource_types,
            incomplete,
        });
    }

    pub fn watch_started(&self, gvk: &Gvk) {
        self.active_watches.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(ProgressUpdate::WatchStarted {
            gvk: gvk.to_string(),
        });
    }

    pub fn watch_stopped(&self, gvk: &Gvk) {
        // Saturating: never wraps below zero
        let _ = self
            .active_watches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let _ = self.sender.send(ProgressUpdate::WatchStopped {
            gvk: gvk.to_string(),
        });
    }

    pub fn binding_published(&self, policy: &str, objects: usize) {
        let _ = self.sender.send(ProgressUpdate::BindingPublished {
            policy: policy.to_string(),
            objects,
        });
    }

    pub fn delivered(&self, binding: &str, destinations: usize, objects: usize) {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(ProgressUpdate::Delivered {
            binding: binding.to_string(),
            destinations,
            objects,
        });
    }

    pub fn cycle_failed(&self, binding: &str, error: &str) {
        let _ = self.sender.send(ProgressUpdate::CycleFailed {
            binding: binding.to_string(),
            error: error.to_string(),
        });
    }

    /// Current counters (open watches, deliveries)
    pub fn counters(&self) -> (usize, usize) {
        (
            self.active_watches.load(Ordering::SeqCst),
            self.deliveries.load(Ordering::SeqCst),
        )
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to progress reporter
pub type ProgressHandle = Arc<ProgressReporter>;

/// Create a new progress reporter handle
pub fn create_progress_handle() -> ProgressHandle {
    Arc::new(ProgressReporter::new())
}

fn log_update(update: &ProgressUpdate) {
    match update {
        ProgressUpdate::DiscoveryComplete {
            resource_types,
            incomplete,
        } => debug!(resource_types, incomplete, "Discovery pass finished"),
        ProgressUpdate::WatchStarted { gvk } => debug!(gvk = %gvk, "Watch opened"),
        ProgressUpdate::WatchStopped { gvk } => debug!(gvk = %gvk, "Watch closed"),
        ProgressUpdate::BindingPublished { policy, objects } => {
            debug!(policy = %policy, objects, "Binding regenerated")
        }
        ProgressUpdate::Delivered {
            binding,
            destinations,
            objects,
        } => debug!(binding = %binding, destinations, objects, "Bundle delivered"),
        ProgressUpdate::CycleFailed { binding, error } => {
            debug!(binding = %binding, error = %error, "Transport cycle failed")
        }
    }
}

/// Log updates until shutdown or until the reporter goes away. Returns the
/// number of updates seen.
pub async fn log_updates(
    mut updates: broadcast::Receiver<ProgressUpdate>,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut seen = 0;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            update = updates.recv() => match update {
                Ok(update) => {
                    seen += 1;
                    log_update(&update);
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress log fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_log_updates_until_shutdown() {
        let reporter = create_progress_handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(log_updates(reporter.subscribe(), shutdown_rx));

        reporter.watch_started(&Gvk::new("", "v1", "ConfigMap"));
        reporter.delivered("b", 2, 3);
        tokio::time::sleep(Duration::from_millis(10)).await;

        shutdown_tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_log_updates_skips_lagged_and_stops_when_closed() {
        let reporter = create_progress_handle();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let updates = reporter.subscribe();

        // Overflow the channel before anyone reads
        for n in 0..150 {
            reporter.binding_published("p", n);
        }
        drop(reporter);

        assert_eq!(log_updates(updates, shutdown_rx).await, 100);
    }

    #[test]
    fn test_progress_reporter_default() {
        let reporter = ProgressReporter::default();
        assert_eq!(reporter.counters(), (0, 0));
    }

    #[test]
    fn test_watch_counter() {
        let reporter = ProgressReporter::new();
        let gvk = Gvk::new("apps", "v1", "Deployment");
        reporter.watch_started(&gvk);
        reporter.watch_started(&Gvk::new("", "v1", "ConfigMap"));
        assert_eq!(reporter.counters(), (2, 0));

        reporter.watch_stopped(&gvk);
        reporter.watch_stopped(&gvk);
        reporter.watch_stopped(&gvk);
        assert_eq!(reporter.counters(), (0, 0));
    }

    #[test]
    fn test_subscribe_receives_updates() {
        let reporter = ProgressReporter::new();
        let mut receiver = reporter.subscribe();

        reporter.delivered("policy-a", 2, 5);

        match receiver.try_recv().unwrap() {
            ProgressUpdate::Delivered {
                binding,
                destinations,
                objects,
            } => {
                assert_eq!(binding, "policy-a");
                assert_eq!(destinations, 2);
                assert_eq!(objects, 5);
            }
            other => panic!("Expected Delivered update, got {:?}", other),
        }
        assert_eq!(reporter.counters(), (0, 1));
    }

    #[test]
    fn test_multiple_updates() {
        let reporter = ProgressReporter::new();
        let mut receiver = reporter.subscribe();

        let gvk = Gvk::new("", "v1", "Secret");
        reporter.discovery_complete(40, true);
        reporter.watch_started(&gvk);
        reporter.binding_published("p", 3);
        reporter.cycle_failed("p", "timed out");
        reporter.watch_stopped(&gvk);

        let updates: Vec<_> = std::iter::from_fn(|| receiver.try_recv().ok()).collect();
        assert_eq!(updates.len(), 5);
        assert!(matches!(
            updates[0],
            ProgressUpdate::DiscoveryComplete {
                incomplete: true,
                ..
            }
        ));
        assert!(matches!(updates[1], ProgressUpdate::WatchStarted { .. }));
        assert!(matches!(updates[2], ProgressUpdate::BindingPublished { .. }));
        assert!(matches!(updates[3], ProgressUpdate::CycleFailed { .. }));
        assert!(matches!(updates[4], ProgressUpdate::WatchStopped { .. }));
    }

    #[test]
    fn test_send_without_subscribers_is_harmless() {
        let handle = create_progress_handle();
        handle.binding_published("nobody-listening", 0);
        assert_eq!(handle.counters(), (0, 0));
    }
}
