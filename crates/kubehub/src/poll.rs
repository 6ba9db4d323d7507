//! Interval-driven store refresh, used in poll mode and for pod metrics.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashlite_core::{Resource, ResourceKind};
use dashlite_store::Store;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Fetcher;

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
}

const NAMESPACED: [ResourceKind; 3] = [ResourceKind::Deployment, ResourceKind::StatefulSet, ResourceKind::Pod];

/// Refreshes namespaces, controllers and pods on every tick via snapshots.
///
/// A failed slice keeps its previous contents; namespaces that disappeared
/// have their slices emptied.
pub fn spawn_poller(fetcher: Fetcher, store: Arc<Store>, cfg: PollConfig, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = cfg.interval.as_secs(), "poll: started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => poll_once(&fetcher, &store).await,
            }
        }
        debug!("poll: stopped");
    })
}

/// One full refresh pass.
pub async fn poll_once(fetcher: &Fetcher, store: &Store) {
    let t0 = Instant::now();
    let namespaces = match fetcher.namespaces().await {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "poll: namespace listing failed; skipping pass");
            return;
        }
    };
    let names: BTreeSet<String> = namespaces.iter().map(|n| n.name.clone()).collect();
    store.apply_snapshot(ResourceKind::Namespace, None, namespaces.into_iter().map(Resource::from).collect());

    let slices = names.iter().flat_map(|ns| NAMESPACED.into_iter().map(move |kind| (kind, ns.as_str())));
    let results = join_all(slices.map(|(kind, ns)| async move { (kind, ns, fetcher.fetch(kind, ns).await) })).await;
    let mut failed = 0usize;
    for (kind, ns, res) in results {
        match res {
            Ok(items) => {
                store.apply_snapshot(kind, Some(ns), items);
            }
            Err(e) => {
                failed += 1;
                warn!(kind = %kind, ns = %ns, error = %e, "poll: slice failed; keeping previous state");
            }
        }
    }
    for kind in NAMESPACED {
        store.mark_synced(kind);
    }

    let stale: Vec<String> = store.namespaces().into_iter().filter(|ns| !names.contains(ns)).collect();
    for ns in &stale {
        for kind in NAMESPACED {
            store.apply_snapshot(kind, Some(ns), Vec::new());
        }
    }
    debug!(namespaces = names.len(), failed, dropped = stale.len(), took_ms = t0.elapsed().as_millis() as u64, "poll: pass done");
}

/// Merges pod metrics for every namespace holding pods, on its own interval.
pub fn spawn_metrics_poller(fetcher: Fetcher, store: Arc<Store>, cfg: PollConfig, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => poll_metrics_once(&fetcher, &store).await,
            }
        }
        debug!("poll: metrics stopped");
    })
}

pub async fn poll_metrics_once(fetcher: &Fetcher, store: &Store) {
    let namespaces: BTreeSet<String> = store
        .list(ResourceKind::Pod, None)
        .iter()
        .map(|p| p.namespace().to_string())
        .collect();
    let results = join_all(namespaces.iter().map(|ns| async move { (ns, fetcher.pod_metrics(ns).await) })).await;
    for (ns, res) in results {
        match res {
            Ok(samples) => {
                let changed = store.merge_pod_metrics(ns, &samples);
                debug!(ns = %ns, changed = changed.len(), "poll: metrics merged");
            }
            // metrics are best effort; pods keep their previous sample
            Err(e) => debug!(ns = %ns, error = %e, "poll: metrics unavailable"),
        }
    }
}
