// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Watch manager: keeps one list+watch subscription per allowed resource type.
//!
//! Reconciliation compares the active subscriptions against a discovery
//! snapshot, stops the ones whose type disappeared and starts the new ones.
//! The subscription map is the only state shared with the binding workers and
//! every mutation of it happens under a single mutex:
//! - stopping signals cancellation and removes the entry in one critical
//!   section, then waits for the watch task to exit before any start runs
//! - starting inserts a fully built entry (fresh index, fresh cancel signal)
//!
//! Reconciliations are serialized (single-flight), so a type's slot is never
//! reused while its previous watch task may still write into an index.

use futures::StreamExt;
use futures::stream::BoxStream;
use kube::api::{DynamicObject, TypeMeta};
use kube::runtime::watcher;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::discovery::{CatalogueEntry, DiscoverySnapshot, DiscoverySource, ResourceFilter};
use super::{Gvk, Gvr, ObjectKey};
use crate::error::{Error, Result};
use crate::progress::ProgressHandle;

/// Stream of watch events for one resource type
pub type EventStream = BoxStream<'static, Result<watcher::Event<DynamicObject>, watcher::Error>>;

/// The watch boundary: opens an initial-list-then-watch stream for a type
pub trait WatchSource: Send + Sync {
    fn watch(&self, entry: &CatalogueEntry) -> EventStream;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

/// Notification that an object of a watched type changed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectChange {
    pub gvk: Gvk,
    pub key: ObjectKey,
    pub kind: ChangeKind,
}

/// Receives object changes from every watch. Implementations must only
/// enqueue work; they are called from the watch tasks.
pub trait ObjectEventSink: Send + Sync {
    fn object_changed(&self, change: ObjectChange);
}

type ObjectIndex = RwLock<BTreeMap<ObjectKey, Arc<DynamicObject>>>;

struct WatchedType {
    entry: CatalogueEntry,
    index: Arc<ObjectIndex>,
    synced: Arc<AtomicBool>,
    /// Set by the task when its stream ends without being cancelled
    ended: Arc<AtomicBool>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// What a reconciliation changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<Gvk>,
    pub stopped: Vec<Gvk>,
    /// Kept only because their group failed discovery this cycle
    pub retained: Vec<Gvk>,
}

pub struct WatchManager {
    source: Arc<dyn WatchSource>,
    filter: ResourceFilter,
    sink: Arc<dyn ObjectEventSink>,
    watches: Mutex<HashMap<Gvk, WatchedType>>,
    reconcile_lock: tokio::sync::Mutex<()>,
    progress: ProgressHandle,
}

impl WatchManager {
    pub fn new(
        source: Arc<dyn WatchSource>,
        filter: ResourceFilter,
        sink: Arc<dyn ObjectEventSink>,
        progress: ProgressHandle,
    ) -> Self {
        Self {
            source,
            filter,
            sink,
            watches: Mutex::new(HashMap::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
            progress,
        }
    }

    /// Run discovery and reconcile against its result.
    ///
    /// A discovery error aborts the cycle before any subscription is touched.
    pub async fn refresh(&self, discovery: &dyn DiscoverySource) -> Result<ReconcileReport> {
        let _guard = self.reconcile_lock.lock().await;
        let snapshot = discovery.discover().await?;
        if snapshot.is_incomplete() {
            warn!(
                failed_groups = ?snapshot.failed_groups,
                "Unable to retrieve the complete list of server APIs, continuing with partial list"
            );
        }
        self.progress.discovery_complete(
            self.filter.allowed(&snapshot).len(),
            snapshot.is_incomplete(),
        );
        Ok(self.reconcile_locked(&snapshot).await)
    }

    /// Reconcile active subscriptions against a catalogue snapshot
    pub async fn reconcile(&self, snapshot: &DiscoverySnapshot) -> ReconcileReport {
        let _guard = self.reconcile_lock.lock().await;
        self.reconcile_locked(snapshot).await
    }

    async fn reconcile_locked(&self, snapshot: &DiscoverySnapshot) -> ReconcileReport {
        let ended = self.remove_ended().await;
        let (to_start, mut to_stop, retained) = self.plan(snapshot);
        // An ended watch that is not reopened is reported like a stopped one
        for gvk in ended {
            if !to_start.iter().any(|e| e.gvk() == gvk) {
                to_stop.push(gvk);
            }
        }

        // Cancel first, remove bookkeeping after, in one critical section
        let mut stopping = Vec::with_capacity(to_stop.len());
        {
            let mut watches = self.watches.lock();
            for gvk in &to_stop {
                if let Some(watched) = watches.get(gvk) {
                    let _ = watched.cancel.send(true);
                }
                if let Some(watched) = watches.remove(gvk) {
                    stopping.push((gvk.clone(), watched.task));
                }
            }
        }

        for (gvk, task) in stopping {
            if let Err(e) = task.await {
                warn!(gvk = %gvk, error = %e, "Watch task ended abnormally");
            }
            info!(gvk = %gvk, "API removed, stopped watch");
            self.progress.watch_stopped(&gvk);
        }

        let mut started = Vec::with_capacity(to_start.len());
        for entry in to_start {
            let gvk = entry.gvk();
            self.start(entry);
            started.push(gvk);
        }

        let mut stopped = to_stop;
        stopped.sort();
        started.sort();

        debug!(
            started = started.len(),
            stopped = stopped.len(),
            retained = retained.len(),
            active = self.watches.lock().len(),
            "Watch reconciliation complete"
        );

        ReconcileReport {
            started,
            stopped,
            retained,
        }
    }

    /// Forget watches whose stream ended, so the plan treats them as unwatched
    async fn remove_ended(&self) -> Vec<Gvk> {
        let ended: Vec<(Gvk, JoinHandle<()>)> = {
            let mut watches = self.watches.lock();
            let gvks: Vec<Gvk> = watches
                .iter()
                .filter(|(_, w)| w.ended.load(Ordering::Acquire))
                .map(|(gvk, _)| gvk.clone())
                .collect();
            gvks.into_iter()
                .filter_map(|gvk| watches.remove(&gvk).map(|w| (gvk, w.task)))
                .collect()
        };

        let mut gvks = Vec::with_capacity(ended.len());
        for (gvk, task) in ended {
            if let Err(e) = task.await {
                warn!(gvk = %gvk, error = %e, "Watch task ended abnormally");
            }
            warn!(gvk = %gvk, "Watch stream had ended, dropping subscription");
            self.progress.watch_stopped(&gvk);
            gvks.push(gvk);
        }
        gvks
    }

    /// Split a snapshot into types to start, types to stop, and types kept
    /// because their group failed discovery
    fn plan(&self, snapshot: &DiscoverySnapshot) -> (Vec<CatalogueEntry>, Vec<Gvk>, Vec<Gvk>) {
        let watches = self.watches.lock();

        // Whatever is left in here at the end is no longer served
        let mut tracking: HashSet<Gvk> = watches.keys().cloned().collect();
        let mut to_start = Vec::new();
        let mut starting = HashSet::new();

        for entry in &snapshot.entries {
            if !self.filter.allows(entry) {
                continue;
            }
            let gvk = entry.gvk();
            if !watches.contains_key(&gvk) && starting.insert(gvk.clone()) {
                to_start.push(entry.clone());
            }
            tracking.remove(&gvk);
        }

        let mut retained = Vec::new();
        if snapshot.is_incomplete() {
            tracking.retain(|gvk| {
                let failed = snapshot.failed_groups.iter().any(|g| g == &gvk.group);
                if failed {
                    retained.push(gvk.clone());
                }
                !failed
            });
        }
        retained.sort();

        (to_start, tracking.into_iter().collect(), retained)
    }

    fn start(&self, entry: CatalogueEntry) {
        let gvk = entry.gvk();
        info!(
            group = %entry.group,
            version = %entry.version,
            kind = %entry.kind,
            "New API added, starting watch"
        );

        let index: Arc<ObjectIndex> = Arc::new(RwLock::new(BTreeMap::new()));
        let synced = Arc::new(AtomicBool::new(false));
        let ended = Arc::new(AtomicBool::new(false));
        let (cancel, cancel_rx) = watch::channel(false);

        let task = WatchTask {
            gvk: gvk.clone(),
            types: TypeMeta {
                api_version: entry.api_version(),
                kind: entry.kind.clone(),
            },
            index: Arc::clone(&index),
            synced: Arc::clone(&synced),
            ended: Arc::clone(&ended),
            sink: Arc::clone(&self.sink),
            relist: None,
        };
        let stream = self.source.watch(&entry);
        let handle = tokio::spawn(task.run(stream, cancel_rx));

        self.watches.lock().insert(
            gvk.clone(),
            WatchedType {
                entry,
                index,
                synced,
                ended,
                cancel,
                task: handle,
            },
        );
        self.progress.watch_started(&gvk);
    }

    /// Stop every subscription (process shutdown)
    pub async fn stop_all(&self) {
        let _guard = self.reconcile_lock.lock().await;
        let stopping: Vec<(Gvk, JoinHandle<()>)> = {
            let mut watches = self.watches.lock();
            for watched in watches.values() {
                let _ = watched.cancel.send(true);
            }
            watches.drain().map(|(gvk, w)| (gvk, w.task)).collect()
        };
        for (gvk, task) in stopping {
            let _ = task.await;
            self.progress.watch_stopped(&gvk);
        }
    }

    pub fn is_watching(&self, gvk: &Gvk) -> bool {
        self.watches
            .lock()
            .get(gvk)
            .is_some_and(|w| !w.ended.load(Ordering::Acquire))
    }

    /// Currently watched types, sorted
    pub fn active_gvks(&self) -> Vec<Gvk> {
        let mut gvks: Vec<Gvk> = self
            .watches
            .lock()
            .iter()
            .filter(|(_, w)| !w.ended.load(Ordering::Acquire))
            .map(|(gvk, _)| gvk.clone())
            .collect();
        gvks.sort();
        gvks
    }

    pub fn entry(&self, gvk: &Gvk) -> Option<CatalogueEntry> {
        self.watches.lock().get(gvk).map(|w| w.entry.clone())
    }

    pub fn entry_for_gvr(&self, gvr: &Gvr) -> Option<CatalogueEntry> {
        self.watches
            .lock()
            .values()
            .find(|w| w.entry.gvr() == *gvr)
            .map(|w| w.entry.clone())
    }

    /// Whether the initial list for a type has completed
    pub fn has_synced(&self, gvk: &Gvk) -> bool {
        self.watches
            .lock()
            .get(gvk)
            .is_some_and(|w| w.synced.load(Ordering::Acquire))
    }

    /// Watched types whose initial list has not completed yet
    pub fn unsynced(&self) -> Vec<CatalogueEntry> {
        let mut entries: Vec<CatalogueEntry> = self
            .watches
            .lock()
            .values()
            .filter(|w| !w.synced.load(Ordering::Acquire))
            .map(|w| w.entry.clone())
            .collect();
        entries.sort_by_key(|e| e.gvk());
        entries
    }

    pub fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        let index = self.watches.lock().get(gvk).map(|w| Arc::clone(&w.index))?;
        let found = index.read().get(key).cloned();
        found
    }

    /// Look up an object by collection. Errors if the collection is watched
    /// but not yet synced; an unwatched collection resolves to nothing.
    pub fn get_by_gvr(&self, gvr: &Gvr, key: &ObjectKey) -> Result<Option<Arc<DynamicObject>>> {
        let found = self
            .watches
            .lock()
            .values()
            .find(|w| w.entry.gvr() == *gvr)
            .map(|w| (Arc::clone(&w.index), w.synced.load(Ordering::Acquire)));
        match found {
            None => Ok(None),
            Some((_, false)) => Err(Error::NotSynced(gvr.to_string())),
            Some((index, true)) => Ok(index.read().get(key).cloned()),
        }
    }

    /// All watched types with their current objects, sorted by type then key
    pub fn snapshot(&self) -> Vec<(CatalogueEntry, Vec<Arc<DynamicObject>>)> {
        let mut indexes: Vec<(CatalogueEntry, Arc<ObjectIndex>)> = self
            .watches
            .lock()
            .values()
            .map(|w| (w.entry.clone(), Arc::clone(&w.index)))
            .collect();
        indexes.sort_by_key(|(entry, _)| entry.gvk());

        indexes
            .into_iter()
            .map(|(entry, index)| {
                let objects = index.read().values().cloned().collect();
                (entry, objects)
            })
            .collect()
    }

    /// Labels of a namespace, if namespaces are watched and it exists
    pub fn namespace_labels(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        self.get(&Gvk::namespace(), &ObjectKey::cluster(namespace))
            .map(|ns| ns.metadata.labels.clone().unwrap_or_default())
    }
}

/// State owned by one running watch
struct WatchTask {
    gvk: Gvk,
    types: TypeMeta,
    index: Arc<ObjectIndex>,
    synced: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
    sink: Arc<dyn ObjectEventSink>,
    /// Buffer for a (re)list in progress
    relist: Option<BTreeMap<ObjectKey, Arc<DynamicObject>>>,
}

impl WatchTask {
    async fn run(mut self, mut stream: EventStream, mut cancel: watch::Receiver<bool>) {
        loop {
            if *cancel.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = cancel.changed() => {
                    // Err means the manager dropped the sender
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => {
                        warn!(gvk = %self.gvk, error = %e, "Watch error");
                    }
                    None => {
                        warn!(gvk = %self.gvk, "Watch stream ended, reopening on next reconcile");
                        self.ended.store(true, Ordering::Release);
                        break;
                    }
                },
            }
        }
        trace!(gvk = %self.gvk, "Watch task exiting");
    }

    fn apply(&mut self, event: watcher::Event<DynamicObject>) {
        match event {
            watcher::Event::Init => {
                self.relist = Some(BTreeMap::new());
            }
            watcher::Event::InitApply(obj) => {
                let (key, obj) = self.prepare(obj);
                match self.relist.as_mut() {
                    Some(buffer) => {
                        buffer.insert(key, obj);
                    }
                    None => self.upsert(key, obj),
                }
            }
            watcher::Event::InitDone => {
                if let Some(buffer) = self.relist.take() {
                    self.replace(buffer);
                }
                self.synced.store(true, Ordering::Release);
            }
            watcher::Event::Apply(obj) => {
                let (key, obj) = self.prepare(obj);
                self.upsert(key, obj);
            }
            watcher::Event::Delete(obj) => {
                let (key, _) = self.prepare(obj);
                let removed = self.index.write().remove(&key);
                if removed.is_some() {
                    self.notify(key, ChangeKind::Deleted);
                }
            }
        }
    }

    /// Key the object and fill in apiVersion/kind, which list responses omit per item
    fn prepare(&self, mut obj: DynamicObject) -> (ObjectKey, Arc<DynamicObject>) {
        if obj.types.is_none() {
            obj.types = Some(self.types.clone());
        }
        let key = ObjectKey::new(
            obj.metadata.namespace.as_deref(),
            obj.metadata.name.as_deref().unwrap_or_default(),
        );
        (key, Arc::new(obj))
    }

    fn upsert(&self, key: ObjectKey, obj: Arc<DynamicObject>) {
        let old = self.index.write().insert(key.clone(), Arc::clone(&obj));
        match old {
            None => self.notify(key, ChangeKind::Added),
            Some(old) if semantically_equal(&old, &obj) => {
                trace!(gvk = %self.gvk, key = %key, "Skipping no-op update");
            }
            Some(_) => self.notify(key, ChangeKind::Updated),
        }
    }

    /// Swap in a completed relist and report the difference
    fn replace(&self, buffer: BTreeMap<ObjectKey, Arc<DynamicObject>>) {
        let mut changes = Vec::new();
        {
            let mut index = self.index.write();
            for (key, obj) in &buffer {
                match index.get(key) {
                    None => changes.push((key.clone(), ChangeKind::Added)),
                    Some(old) if semantically_equal(old, obj) => {}
                    Some(_) => changes.push((key.clone(), ChangeKind::Updated)),
                }
            }
            for key in index.keys() {
                if !buffer.contains_key(key) {
                    changes.push((key.clone(), ChangeKind::Deleted));
                }
            }
            *index = buffer;
        }
        for (key, kind) in changes {
            self.notify(key, kind);
        }
    }

    fn notify(&self, key: ObjectKey, kind: ChangeKind) {
        self.sink.object_changed(ObjectChange {
            gvk: self.gvk.clone(),
            key,
            kind,
        });
    }
}

/// Equality that ignores resourceVersion bumps and managedFields timestamps.
///
/// Field ownership itself is compared: delivered content is projected through
/// it, so a change of owner can change what is delivered.
pub fn semantically_equal(old: &DynamicObject, new: &DynamicObject) -> bool {
    if old.metadata.resource_version.is_some()
        && old.metadata.resource_version == new.metadata.resource_version
    {
        return true;
    }
    let mut old_meta = old.metadata.clone();
    let mut new_meta = new.metadata.clone();
    for meta in [&mut old_meta, &mut new_meta] {
        meta.resource_version = None;
        for entry in meta.managed_fields.iter_mut().flatten() {
            entry.time = None;
        }
    }
    old_meta == new_meta && old.data == new.data && old.types == new.types
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kubernetes::discovery::tests::entry;
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{FieldsV1, ManagedFieldsEntry, Time};
    use kube::api::ObjectMeta;
    use std::time::Duration;

    type Sender = mpsc::UnboundedSender<Result<watcher::Event<DynamicObject>, watcher::Error>>;

    /// Watch source backed by channels the test can push events into
    #[derive(Default)]
    pub(crate) struct FakeWatchSource {
        senders: Mutex<HashMap<Gvk, Sender>>,
        opened: Mutex<Vec<Gvk>>,
    }

    impl FakeWatchSource {
        pub(crate) fn send(&self, gvk: &Gvk, event: watcher::Event<DynamicObject>) {
            let senders = self.senders.lock();
            let sender = senders.get(gvk).expect("no watch opened for gvk");
            sender.unbounded_send(Ok(event)).expect("watch task gone");
        }

        /// Send a whole initial list for a type
        pub(crate) fn init(&self, gvk: &Gvk, objects: Vec<DynamicObject>) {
            self.send(gvk, watcher::Event::Init);
            for obj in objects {
                self.send(gvk, watcher::Event::InitApply(obj));
            }
            self.send(gvk, watcher::Event::InitDone);
        }

        /// End a type's stream as the server side would
        fn close(&self, gvk: &Gvk) {
            self.senders.lock().remove(gvk);
        }

        fn is_closed(&self, gvk: &Gvk) -> bool {
            self.senders.lock().get(gvk).is_none_or(|s| s.is_closed())
        }

        fn opened(&self) -> Vec<Gvk> {
            self.opened.lock().clone()
        }
    }

    impl WatchSource for FakeWatchSource {
        fn watch(&self, entry: &CatalogueEntry) -> EventStream {
            let (tx, rx) = mpsc::unbounded();
            self.senders.lock().insert(entry.gvk(), tx);
            self.opened.lock().push(entry.gvk());
            rx.boxed()
        }
    }

    #[derive(Default)]
    pub(crate) struct CollectingSink {
        pub(crate) changes: Mutex<Vec<ObjectChange>>,
    }

    impl ObjectEventSink for CollectingSink {
        fn object_changed(&self, change: ObjectChange) {
            self.changes.lock().push(change);
        }
    }

    struct FixedDiscovery(Mutex<Option<Result<DiscoverySnapshot>>>);

    #[async_trait]
    impl DiscoverySource for FixedDiscovery {
        async fn discover(&self) -> Result<DiscoverySnapshot> {
            self.0
                .lock()
                .take()
                .unwrap_or_else(|| Ok(DiscoverySnapshot::default()))
        }
    }

    pub(crate) fn object(
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        resource_version: &str,
        labels: &[(&str, &str)],
    ) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: namespace.map(String::from),
                resource_version: Some(resource_version.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            data: serde_json::json!({}),
        }
    }

    fn manager() -> (WatchManager, Arc<FakeWatchSource>, Arc<CollectingSink>) {
        let source = Arc::new(FakeWatchSource::default());
        let sink = Arc::new(CollectingSink::default());
        let manager = WatchManager::new(
            source.clone(),
            ResourceFilter::default(),
            sink.clone(),
            crate::progress::create_progress_handle(),
        );
        (manager, source, sink)
    }

    fn five_types() -> Vec<CatalogueEntry> {
        vec![
            entry("", "v1", "ConfigMap", "configmaps"),
            entry("", "v1", "Secret", "secrets"),
            entry("apps", "v1", "Deployment", "deployments"),
            entry("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles"),
            entry("metrics.example.com", "v1beta1", "Sample", "samples"),
        ]
    }

    /// Let spawned watch tasks drain their channels
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn allowed_gvks(entries: &[CatalogueEntry]) -> Vec<Gvk> {
        let filter = ResourceFilter::default();
        let mut gvks: Vec<Gvk> = entries
            .iter()
            .filter(|e| filter.allows(e))
            .map(|e| e.gvk())
            .collect();
        gvks.sort();
        gvks.dedup();
        gvks
    }

    #[tokio::test]
    async fn test_reconcile_tracks_latest_snapshot() {
        let (manager, source, _) = manager();

        let c1 = vec![
            entry("", "v1", "ConfigMap", "configmaps"),
            entry("apps", "v1", "Deployment", "deployments"),
            entry("", "v1", "Event", "events"),
        ];
        let report = manager.reconcile(&DiscoverySnapshot::complete(c1.clone())).await;
        assert_eq!(report.started.len(), 2);
        assert_eq!(manager.active_gvks(), allowed_gvks(&c1));

        let c2 = vec![
            entry("apps", "v1", "Deployment", "deployments"),
            entry("", "v1", "Secret", "secrets"),
        ];
        let report = manager.reconcile(&DiscoverySnapshot::complete(c2.clone())).await;
        assert_eq!(report.started, vec![Gvk::new("", "v1", "Secret")]);
        assert_eq!(report.stopped, vec![Gvk::new("", "v1", "ConfigMap")]);
        assert_eq!(manager.active_gvks(), allowed_gvks(&c2));

        // The Deployment watch was not reopened
        let deployments = source
            .opened()
            .iter()
            .filter(|g| g.kind == "Deployment")
            .count();
        assert_eq!(deployments, 1);
    }

    #[tokio::test]
    async fn test_stopped_watch_task_exits() {
        let (manager, source, _) = manager();
        let cm = Gvk::new("", "v1", "ConfigMap");

        manager
            .reconcile(&DiscoverySnapshot::complete(vec![entry("", "v1", "ConfigMap", "configmaps")]))
            .await;
        assert!(!source.is_closed(&cm));

        manager.reconcile(&DiscoverySnapshot::complete(vec![])).await;
        // The task was awaited, so its stream receiver is gone
        assert!(source.is_closed(&cm));
        assert!(!manager.is_watching(&cm));
        assert!(manager.active_gvks().is_empty());
    }

    #[tokio::test]
    async fn test_ended_stream_is_reopened_on_reconcile() {
        let (manager, source, _) = manager();
        let cm = Gvk::new("", "v1", "ConfigMap");
        let deploy = Gvk::new("apps", "v1", "Deployment");
        let both = DiscoverySnapshot::complete(vec![
            entry("", "v1", "ConfigMap", "configmaps"),
            entry("apps", "v1", "Deployment", "deployments"),
        ]);
        manager.reconcile(&both).await;

        source.close(&cm);
        source.close(&deploy);
        settle().await;
        assert!(!manager.is_watching(&cm));

        // ConfigMaps are still served, Deployments are not
        let report = manager
            .reconcile(&DiscoverySnapshot::complete(vec![entry("", "v1", "ConfigMap", "configmaps")]))
            .await;
        assert_eq!(report.started, vec![cm.clone()]);
        assert_eq!(report.stopped, vec![deploy.clone()]);
        assert!(manager.is_watching(&cm));
        assert_eq!(manager.active_gvks(), vec![cm.clone()]);

        let reopened = source.opened().iter().filter(|g| **g == cm).count();
        assert_eq!(reopened, 2);
        assert!(!source.is_closed(&cm));
    }

    #[tokio::test]
    async fn test_incomplete_discovery_keeps_listed_and_failed_group_watches() {
        let (manager, _, _) = manager();
        let all = five_types();
        manager.reconcile(&DiscoverySnapshot::complete(all.clone())).await;
        assert_eq!(manager.active_gvks().len(), 5);

        // Cycle 2: the metrics group is unavailable and secrets vanished
        let partial = vec![
            entry("", "v1", "ConfigMap", "configmaps"),
            entry("apps", "v1", "Deployment", "deployments"),
            entry("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles"),
        ];
        let snapshot = DiscoverySnapshot {
            entries: partial.clone(),
            failed_groups: vec!["metrics.example.com".to_string()],
        };
        let discovery = FixedDiscovery(Mutex::new(Some(Ok(snapshot))));
        let report = manager.refresh(&discovery).await.unwrap();

        let active = manager.active_gvks();
        for gvk in allowed_gvks(&partial) {
            assert!(active.contains(&gvk), "lost watch for {}", gvk);
        }
        assert!(active.contains(&Gvk::new("metrics.example.com", "v1beta1", "Sample")));
        assert_eq!(report.stopped, vec![Gvk::new("", "v1", "Secret")]);
        assert_eq!(report.retained, vec![Gvk::new("metrics.example.com", "v1beta1", "Sample")]);
    }

    #[tokio::test]
    async fn test_failed_discovery_leaves_watches_untouched() {
        let (manager, _, _) = manager();
        manager.reconcile(&DiscoverySnapshot::complete(five_types())).await;
        let before = manager.active_gvks();

        let err = Error::InvalidGroupVersion("boom".into());
        let discovery = FixedDiscovery(Mutex::new(Some(Err(err))));
        assert!(manager.refresh(&discovery).await.is_err());
        assert_eq!(manager.active_gvks(), before);
    }

    #[tokio::test]
    async fn test_events_routed_to_sink_with_noop_updates_suppressed() {
        let (manager, source, sink) = manager();
        let cm = Gvk::new("", "v1", "ConfigMap");
        manager
            .reconcile(&DiscoverySnapshot::complete(vec![entry("", "v1", "ConfigMap", "configmaps")]))
            .await;

        source.init(&cm, vec![object("v1", "ConfigMap", Some("ns1"), "cm-a", "1", &[])]);
        settle().await;
        assert!(manager.has_synced(&cm));

        // Same content, only resourceVersion moved
        source.send(
            &cm,
            watcher::Event::Apply(object("v1", "ConfigMap", Some("ns1"), "cm-a", "2", &[])),
        );
        // Real change
        source.send(
            &cm,
            watcher::Event::Apply(object("v1", "ConfigMap", Some("ns1"), "cm-a", "3", &[("app", "web")])),
        );
        source.send(
            &cm,
            watcher::Event::Delete(object("v1", "ConfigMap", Some("ns1"), "cm-a", "3", &[])),
        );
        settle().await;

        let kinds: Vec<ChangeKind> = sink.changes.lock().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Added, ChangeKind::Updated, ChangeKind::Deleted]
        );
        assert!(manager.get(&cm, &ObjectKey::new(Some("ns1"), "cm-a")).is_none());
    }

    #[tokio::test]
    async fn test_relist_reports_removed_objects() {
        let (manager, source, sink) = manager();
        let cm = Gvk::new("", "v1", "ConfigMap");
        manager
            .reconcile(&DiscoverySnapshot::complete(vec![entry("", "v1", "ConfigMap", "configmaps")]))
            .await;

        source.init(
            &cm,
            vec![
                object("v1", "ConfigMap", Some("ns1"), "a", "1", &[]),
                object("v1", "ConfigMap", Some("ns1"), "b", "1", &[]),
            ],
        );
        settle().await;
        sink.changes.lock().clear();

        // Watch restarted: "b" is gone
        source.init(&cm, vec![object("v1", "ConfigMap", Some("ns1"), "a", "1", &[])]);
        settle().await;

        let changes = sink.changes.lock().clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, ObjectKey::new(Some("ns1"), "b"));
        assert_eq!(changes[0].kind, ChangeKind::Deleted);
    }

    #[tokio::test]
    async fn test_lookups() {
        let (manager, source, _) = manager();
        let cm = Gvk::new("", "v1", "ConfigMap");
        let ns = Gvk::namespace();
        manager
            .reconcile(&DiscoverySnapshot::complete(vec![
                entry("", "v1", "ConfigMap", "configmaps"),
                entry("", "v1", "Namespace", "namespaces"),
            ]))
            .await;

        let key = ObjectKey::new(Some("ns1"), "cm-a");
        let gvr = Gvr::new("", "v1", "configmaps");
        assert!(matches!(manager.get_by_gvr(&gvr, &key), Err(Error::NotSynced(_))));

        source.init(&cm, vec![object("v1", "ConfigMap", Some("ns1"), "cm-a", "1", &[])]);
        source.init(&ns, vec![object("v1", "Namespace", None, "ns1", "1", &[("env", "prod")])]);
        settle().await;

        assert!(manager.get_by_gvr(&gvr, &key).unwrap().is_some());
        assert!(
            manager
                .get_by_gvr(&Gvr::new("", "v1", "secrets"), &key)
                .unwrap()
                .is_none()
        );
        assert_eq!(
            manager.namespace_labels("ns1").unwrap().get("env").map(String::as_str),
            Some("prod")
        );
        assert!(manager.namespace_labels("missing").is_none());

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0.kind, "ConfigMap");
        assert_eq!(snapshot[0].1.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_all() {
        let (manager, source, _) = manager();
        manager.reconcile(&DiscoverySnapshot::complete(five_types())).await;
        manager.stop_all().await;
        assert!(manager.active_gvks().is_empty());
        for entry in five_types() {
            assert!(source.is_closed(&entry.gvk()));
        }
    }

    fn managed(manager: &str, fields: serde_json::Value, time: &str) -> ManagedFieldsEntry {
        ManagedFieldsEntry {
            manager: Some(manager.to_string()),
            operation: Some("Apply".to_string()),
            fields_type: Some("FieldsV1".to_string()),
            fields_v1: Some(FieldsV1(fields)),
            time: Some(Time(time.parse().unwrap())),
            ..Default::default()
        }
    }

    #[test]
    fn test_semantically_equal_ignores_resource_version_and_timestamps() {
        let a = object("v1", "ConfigMap", Some("ns"), "x", "1", &[("a", "b")]);
        let mut b = object("v1", "ConfigMap", Some("ns"), "x", "2", &[("a", "b")]);
        assert!(semantically_equal(&a, &b));

        let owned = serde_json::json!({"f:data": {"f:k": {}}});
        let mut a = a;
        a.metadata.managed_fields = Some(vec![managed("kubectl", owned.clone(), "2025-01-01T00:00:00Z")]);
        b.metadata.managed_fields = Some(vec![managed("kubectl", owned, "2025-01-02T00:00:00Z")]);
        assert!(semantically_equal(&a, &b));

        b.data = serde_json::json!({"data": {"k": "v"}});
        assert!(!semantically_equal(&a, &b));
    }

    #[tokio::test]
    async fn test_ownership_change_is_reported() {
        let (manager, source, sink) = manager();
        let deploy = Gvk::new("apps", "v1", "Deployment");
        manager
            .reconcile(&DiscoverySnapshot::complete(vec![entry("apps", "v1", "Deployment", "deployments")]))
            .await;

        let replicas = serde_json::json!({"f:spec": {"f:replicas": {}}});
        let mut scaled = object("apps/v1", "Deployment", Some("ns1"), "web", "1", &[]);
        scaled.data = serde_json::json!({"spec": {"replicas": 3}});
        scaled.metadata.managed_fields = Some(vec![managed("hpa", replicas.clone(), "2025-01-01T00:00:00Z")]);
        source.init(&deploy, vec![scaled.clone()]);
        settle().await;
        sink.changes.lock().clear();

        // Same content, but kubectl now owns spec.replicas
        let mut claimed = scaled;
        claimed.metadata.resource_version = Some("2".to_string());
        claimed.metadata.managed_fields = Some(vec![managed("kubectl", replicas, "2025-01-01T00:00:00Z")]);
        source.send(&deploy, watcher::Event::Apply(claimed));
        settle().await;

        let kinds: Vec<ChangeKind> = sink.changes.lock().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Updated]);
    }
}
