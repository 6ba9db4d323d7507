//! Dashlite store: the single in-memory index of every known resource.
//!
//! All mutations go through [`Store::apply_snapshot`], [`Store::apply_event`]
//! and the watch helpers. Each mutation runs under one lock, diffs against the
//! previous state and hands the resulting [`ChangeEvent`]s to the registered
//! listeners before the lock is released, so listeners observe changes in the
//! exact order the store made them.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use dashlite_core::{
    rollup, ChangeEvent, EventType, NamespaceRollup, PodMetrics, Resource, ResourceKind, ResourceRef,
};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Receives every batch of changes produced by a single store mutation.
///
/// Called with the store lock held: implementations must not call back into
/// the store and should only enqueue.
pub trait ChangeListener: Send + Sync {
    fn on_changes(&self, events: &[ChangeEvent]);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("resource {got} does not match kind {expected}")]
    KindMismatch { expected: ResourceKind, got: ResourceRef },
    #[error("{0:?} events cannot be applied")]
    InvalidEventType(EventType),
}

/// Immutable point-in-time copy of the store.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub epoch: u64,
    pub items: Vec<Resource>,
}

/// Borrowed view handed to [`Store::read_consistent`].
pub struct StoreView<'a> {
    items: &'a FxHashMap<ResourceRef, Resource>,
    epoch: u64,
}

impl<'a> StoreView<'a> {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, r: &ResourceRef) -> Option<&'a Resource> {
        self.items.get(r)
    }

    /// Resources of `kind`, restricted to `namespace` when given, ordered by
    /// reference.
    pub fn matching(&self, kind: ResourceKind, namespace: Option<&str>) -> Vec<&'a Resource> {
        let mut out: Vec<&Resource> = self
            .items
            .iter()
            .filter(|(r, _)| r.kind == kind && namespace.map_or(true, |ns| r.scope() == ns))
            .map(|(_, v)| v)
            .collect();
        out.sort_by(|a, b| a.reference().cmp(&b.reference()));
        out
    }
}

#[derive(Default)]
struct Inner {
    items: FxHashMap<ResourceRef, Resource>,
    epoch: u64,
    listeners: Vec<Arc<dyn ChangeListener>>,
    synced: FxHashSet<ResourceKind>,
}

impl Inner {
    /// Bumps the epoch and notifies listeners; returns the events for the caller.
    fn commit(&mut self, events: Vec<ChangeEvent>, epoch_tx: &watch::Sender<u64>) -> Vec<ChangeEvent> {
        if events.is_empty() {
            return events;
        }
        self.epoch = self.epoch.saturating_add(1);
        for ev in &events {
            counter!("store_events_total", 1u64, "event_type" => event_label(ev.event_type));
        }
        for l in &self.listeners {
            l.on_changes(&events);
        }
        let _ = epoch_tx.send(self.epoch);
        events
    }
}

fn event_label(t: EventType) -> &'static str {
    match t {
        EventType::Added => "added",
        EventType::Modified => "modified",
        EventType::Deleted => "deleted",
        EventType::Initial => "initial",
    }
}

pub struct Store {
    inner: Mutex<Inner>,
    snap: ArcSwap<StoreSnapshot>,
    epoch_tx: watch::Sender<u64>,
    epoch_rx: watch::Receiver<u64>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        Self {
            inner: Mutex::new(Inner::default()),
            snap: ArcSwap::from_pointee(StoreSnapshot::default()),
            epoch_tx,
            epoch_rx,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.lock().listeners.push(listener);
    }

    /// Replaces every resource of `kind` in `namespace` (all namespaces when
    /// `None`) with `resources`.
    ///
    /// Emits DELETED for references that disappeared, then ADDED/MODIFIED in
    /// input order. Resources equal to the stored value produce no event.
    /// Resources of another kind or outside `namespace` are skipped.
    pub fn apply_snapshot(&self, kind: ResourceKind, namespace: Option<&str>, resources: Vec<Resource>) -> Vec<ChangeEvent> {
        let mut inner = self.lock();

        let incoming: Vec<Resource> = resources
            .into_iter()
            .filter(|r| {
                let ok = r.kind() == kind && namespace.map_or(true, |ns| r.scope() == ns);
                if !ok {
                    warn!(kind = %kind, resource = %r.reference(), "store: snapshot item outside its slice skipped");
                }
                ok
            })
            .collect();
        let keep: FxHashSet<ResourceRef> = incoming.iter().map(Resource::reference).collect();

        let mut gone: Vec<ResourceRef> = inner
            .items
            .keys()
            .filter(|r| r.kind == kind && namespace.map_or(true, |ns| r.scope() == ns) && !keep.contains(*r))
            .cloned()
            .collect();
        gone.sort();

        let mut events = Vec::new();
        for r in gone {
            if let Some(old) = inner.items.remove(&r) {
                events.push(ChangeEvent::new(EventType::Deleted, old));
            }
        }
        for res in incoming {
            if let Some(ev) = upsert_locked(&mut inner.items, res) {
                events.push(ev);
            }
        }
        inner.synced.insert(kind);
        debug!(kind = %kind, ns = ?namespace, events = events.len(), "store: snapshot applied");
        inner.commit(events, &self.epoch_tx)
    }

    /// Applies one incremental change and emits exactly one event of the same
    /// type, even when the change is a no-op for the index.
    pub fn apply_event(&self, kind: ResourceKind, event_type: EventType, mut resource: Resource) -> Result<ChangeEvent, StoreError> {
        if resource.kind() != kind {
            return Err(StoreError::KindMismatch { expected: kind, got: resource.reference() });
        }
        let mut inner = self.lock();
        let r = resource.reference();
        let ev = match event_type {
            EventType::Added | EventType::Modified => {
                carry_metrics(&inner.items, &r, &mut resource);
                inner.items.insert(r, resource.clone());
                ChangeEvent::new(event_type, resource)
            }
            EventType::Deleted => {
                let last = inner.items.remove(&r).unwrap_or(resource);
                ChangeEvent::new(EventType::Deleted, last)
            }
            EventType::Initial => return Err(StoreError::InvalidEventType(event_type)),
        };
        let mut out = inner.commit(vec![ev], &self.epoch_tx);
        out.pop().ok_or(StoreError::InvalidEventType(event_type))
    }

    /// Watch-style apply: ADDED when new, MODIFIED when changed, nothing when
    /// the stored value is identical.
    pub fn upsert(&self, resource: Resource) -> Option<ChangeEvent> {
        let mut inner = self.lock();
        let ev = upsert_locked(&mut inner.items, resource)?;
        inner.commit(vec![ev], &self.epoch_tx).pop()
    }

    /// Removes a resource if present.
    pub fn remove(&self, r: &ResourceRef) -> Option<ChangeEvent> {
        let mut inner = self.lock();
        let old = inner.items.remove(r)?;
        inner.commit(vec![ChangeEvent::new(EventType::Deleted, old)], &self.epoch_tx).pop()
    }

    /// Replaces the metrics of every known pod in `namespace`; pods absent
    /// from `metrics` lose their sample.
    pub fn merge_pod_metrics(&self, namespace: &str, metrics: &HashMap<String, PodMetrics>) -> Vec<ChangeEvent> {
        let mut inner = self.lock();
        let mut events = Vec::new();
        let mut refs: Vec<ResourceRef> = inner
            .items
            .keys()
            .filter(|r| r.kind == ResourceKind::Pod && r.namespace == namespace)
            .cloned()
            .collect();
        refs.sort();
        for r in refs {
            if let Some(Resource::Pod(pod)) = inner.items.get_mut(&r) {
                let next = metrics.get(&r.name).cloned();
                if pod.metrics != next {
                    pod.metrics = next;
                    events.push(ChangeEvent::new(EventType::Modified, Resource::Pod(pod.clone())));
                }
            }
        }
        inner.commit(events, &self.epoch_tx)
    }

    /// Runs `f` against a point-in-time view with mutations held off.
    pub fn read_consistent<R>(&self, f: impl FnOnce(&StoreView<'_>) -> R) -> R {
        let inner = self.lock();
        let view = StoreView { items: &inner.items, epoch: inner.epoch };
        f(&view)
    }

    pub fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> Vec<Resource> {
        self.read_consistent(|v| v.matching(kind, namespace).into_iter().cloned().collect())
    }

    pub fn get(&self, r: &ResourceRef) -> Option<Resource> {
        self.read_consistent(|v| v.get(r).cloned())
    }

    /// Namespaces that hold at least one known resource, plus Namespace objects.
    pub fn namespaces(&self) -> Vec<String> {
        self.read_consistent(|v| {
            let set: BTreeSet<String> = v.items.keys().map(|r| r.scope().to_string()).collect();
            set.into_iter().collect()
        })
    }

    pub fn rollups(&self) -> Vec<NamespaceRollup> {
        self.read_consistent(|v| {
            let set: BTreeSet<&str> = v.items.keys().filter(|r| r.kind.is_controller()).map(|r| r.namespace.as_str()).collect();
            set.into_iter().map(|ns| rollup(ns, v.items.values())).collect()
        })
    }

    /// Whether a full listing of `kind` has been applied at least once.
    pub fn is_synced(&self, kind: ResourceKind) -> bool {
        self.lock().synced.contains(&kind)
    }

    pub fn mark_synced(&self, kind: ResourceKind) {
        self.lock().synced.insert(kind);
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }

    /// Cheap shared snapshot; rebuilt only when the epoch moved since the last
    /// call.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        let cur = self.snap.load_full();
        let inner = self.lock();
        if cur.epoch == inner.epoch {
            return cur;
        }
        let mut items: Vec<Resource> = inner.items.values().cloned().collect();
        let epoch = inner.epoch;
        drop(inner);
        items.sort_by(|a, b| a.reference().cmp(&b.reference()));
        let next = Arc::new(StoreSnapshot { epoch, items });
        self.snap.store(Arc::clone(&next));
        next
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Listings never carry usage; only `merge_pod_metrics` may clear a sample.
fn carry_metrics(items: &FxHashMap<ResourceRef, Resource>, r: &ResourceRef, res: &mut Resource) {
    if let (Resource::Pod(incoming), Some(Resource::Pod(stored))) = (res, items.get(r)) {
        if incoming.metrics.is_none() {
            incoming.metrics = stored.metrics.clone();
        }
    }
}

fn upsert_locked(items: &mut FxHashMap<ResourceRef, Resource>, mut res: Resource) -> Option<ChangeEvent> {
    let r = res.reference();
    carry_metrics(items, &r, &mut res);
    match items.get(&r) {
        Some(old) if *old == res => None,
        Some(_) => {
            items.insert(r, res.clone());
            Some(ChangeEvent::new(EventType::Modified, res))
        }
        None => {
            items.insert(r, res.clone());
            Some(ChangeEvent::new(EventType::Added, res))
        }
    }
}
