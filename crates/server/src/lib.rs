//! Dashlite server: wires the store, hub, cluster sync and API behind an axum
//! router.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashlite_api::{DashboardApi, IdentityResolver, InProcApi};
use dashlite_core::AccessFilter;
use dashlite_hub::Hub;
use dashlite_kubehub::{
    spawn_metrics_poller, spawn_poller, spawn_watchers, ClusterSource, Fetcher, PollConfig, WatchStatus,
};
use dashlite_store::Store;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod config;
mod routes;
mod ws;

pub use config::{Config, SyncMode};
pub use routes::router;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub api: Arc<dyn DashboardApi>,
    pub hub: Arc<Hub>,
    pub store: Arc<Store>,
    pub identities: Arc<IdentityResolver>,
    /// Present in watch mode.
    pub watch: Option<Arc<WatchStatus>>,
}

/// Running background work plus the state the router serves.
pub struct Services {
    pub state: AppState,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Services {
    /// Builds every component from `cfg` and starts cluster sync, the metrics
    /// poller and hub keepalive. All tasks stop when `shutdown` is cancelled.
    pub fn start(cfg: &Config, source: Arc<dyn ClusterSource>, shutdown: &CancellationToken) -> Result<Self> {
        let access: Arc<dyn AccessFilter> = Arc::new(cfg.access_filter()?);
        let fetcher = Fetcher::new(Arc::clone(&source), cfg.retry_policy());
        let store = Arc::new(Store::new());
        let hub = Hub::new(Arc::clone(&store), Arc::clone(&access), cfg.hub_config());

        let mut tasks = vec![hub.spawn_keepalive(shutdown.clone())];
        let watch = match cfg.kubernetes.mode {
            SyncMode::Watch => {
                let (status, handles) = spawn_watchers(source, Arc::clone(&store), cfg.watch_config(), shutdown.clone());
                tasks.extend(handles);
                Some(status)
            }
            SyncMode::Poll => {
                let interval = Duration::from_secs(cfg.kubernetes.poll_interval_secs);
                tasks.push(spawn_poller(fetcher.clone(), Arc::clone(&store), PollConfig { interval }, shutdown.clone()));
                None
            }
        };
        let interval = Duration::from_secs(cfg.kubernetes.metrics_interval_secs);
        tasks.push(spawn_metrics_poller(fetcher.clone(), Arc::clone(&store), PollConfig { interval }, shutdown.clone()));

        let api: Arc<dyn DashboardApi> = Arc::new(InProcApi::new(fetcher, access, cfg.ttl_policy()));
        info!(mode = ?cfg.kubernetes.mode, mock = cfg.kubernetes.mock, tasks = tasks.len(), "server: services started");
        Ok(Self {
            state: AppState { api, hub, store, identities: Arc::new(cfg.identity_resolver()), watch },
            tasks,
        })
    }

    /// Closes every stream connection and waits for background tasks.
    pub async fn stop(self, shutdown: &CancellationToken) {
        shutdown.cancel();
        self.state.hub.shutdown();
        for t in self.tasks {
            let _ = t.await;
        }
        info!("server: services stopped");
    }
}
