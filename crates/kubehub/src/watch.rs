//! Watch-driven store updates with bounded reconnects.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashlite_core::{EventType, ResourceKind};
use dashlite_store::Store;
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::retry::exponential_backoff;
use crate::{ClusterSource, WatchEvent};

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive failed reconnects before a watcher gives up.
    pub max_retries: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { backoff_initial: Duration::from_millis(500), backoff_max: Duration::from_secs(30), max_retries: 10 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WatchState {
    Connecting,
    Live,
    Backoff { attempt: u32 },
    /// Reconnect budget exhausted; the watcher has stopped.
    Failed,
    Stopped,
}

/// Shared view of every watcher's state, read by the health endpoint.
#[derive(Debug, Default)]
pub struct WatchStatus {
    states: Mutex<BTreeMap<ResourceKind, WatchState>>,
}

impl WatchStatus {
    pub fn get(&self, kind: ResourceKind) -> Option<WatchState> {
        self.lock().get(&kind).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<ResourceKind, WatchState> {
        self.lock().clone()
    }

    pub fn any_failed(&self) -> bool {
        self.lock().values().any(|s| *s == WatchState::Failed)
    }

    fn set(&self, kind: ResourceKind, state: WatchState) {
        self.lock().insert(kind, state);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ResourceKind, WatchState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Starts one watcher per resource kind feeding `store`.
pub fn spawn_watchers(
    source: Arc<dyn ClusterSource>,
    store: Arc<Store>,
    cfg: WatchConfig,
    shutdown: CancellationToken,
) -> (Arc<WatchStatus>, Vec<JoinHandle<()>>) {
    let status = Arc::new(WatchStatus::default());
    let handles = ResourceKind::ALL
        .into_iter()
        .map(|kind| {
            let (source, store, cfg, status, shutdown) =
                (Arc::clone(&source), Arc::clone(&store), cfg.clone(), Arc::clone(&status), shutdown.clone());
            tokio::spawn(async move { run_watch(source, store, kind, cfg, status, shutdown).await })
        })
        .collect();
    (status, handles)
}

async fn run_watch(
    source: Arc<dyn ClusterSource>,
    store: Arc<Store>,
    kind: ResourceKind,
    cfg: WatchConfig,
    status: Arc<WatchStatus>,
    shutdown: CancellationToken,
) {
    let mut failures: u32 = 0;
    loop {
        if failures == 0 {
            status.set(kind, WatchState::Connecting);
        }
        let mut stream = source.watch(kind);
        info!(kind = %kind, attempt = failures, "watch: started");
        let cause = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    status.set(kind, WatchState::Stopped);
                    debug!(kind = %kind, "watch: stopped");
                    return;
                }
                next = stream.next() => match next {
                    Some(Ok(ev)) => {
                        status.set(kind, WatchState::Live);
                        failures = 0;
                        apply(&store, kind, ev);
                    }
                    Some(Err(e)) => break Some(e),
                    None => break None,
                }
            }
        };

        failures += 1;
        if failures > cfg.max_retries {
            error!(kind = %kind, failures, "watch: reconnect budget exhausted, giving up");
            status.set(kind, WatchState::Failed);
            return;
        }
        let delay = exponential_backoff(cfg.backoff_initial, cfg.backoff_max, failures);
        match &cause {
            Some(e) => warn!(kind = %kind, error = %e, attempt = failures, delay_ms = %delay.as_millis(), "watch: stream failed; reconnecting"),
            None => warn!(kind = %kind, attempt = failures, delay_ms = %delay.as_millis(), "watch: stream ended; reconnecting"),
        }
        status.set(kind, WatchState::Backoff { attempt: failures });
        tokio::select! {
            _ = shutdown.cancelled() => {
                status.set(kind, WatchState::Stopped);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn apply(store: &Store, kind: ResourceKind, ev: WatchEvent) {
    match ev {
        WatchEvent::Applied(r) => {
            store.upsert(r);
        }
        WatchEvent::Deleted(r) => {
            if let Err(e) = store.apply_event(kind, EventType::Deleted, r) {
                warn!(kind = %kind, error = %e, "watch: delete not applied");
            }
        }
        WatchEvent::Restarted(list) => {
            debug!(kind = %kind, count = list.len(), "watch: relist");
            store.apply_snapshot(kind, None, list);
        }
    }
}
