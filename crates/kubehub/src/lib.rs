//! Dashlite kubehub: everything that talks to the cluster API.
//!
//! [`ClusterSource`] is the seam between the dashboard and the cluster; the
//! production implementation is [`KubeSource`]; [`StaticSource`] serves
//! in-memory fixtures for mock mode and tests.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use dashlite_core::{ControllerResource, FetchError, NamespaceResource, PodMetrics, PodResource, Resource, ResourceKind};
use futures::stream::BoxStream;

mod fetcher;
pub mod fixture;
mod kube_source;
pub mod normalize;
mod poll;
mod retry;
mod watch;

pub use fetcher::Fetcher;
pub use fixture::StaticSource;
pub use kube_source::KubeSource;
pub use poll::{poll_metrics_once, poll_once, spawn_metrics_poller, spawn_poller, PollConfig};
pub use retry::RetryPolicy;
pub use watch::{spawn_watchers, WatchConfig, WatchState, WatchStatus};

/// One item of a cluster watch stream, already normalized.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Applied(Resource),
    Deleted(Resource),
    /// Full relist after (re)connecting.
    Restarted(Vec<Resource>),
}

/// Read access to the cluster.
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<NamespaceResource>, FetchError>;
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<ControllerResource>, FetchError>;
    async fn list_statefulsets(&self, namespace: &str) -> Result<Vec<ControllerResource>, FetchError>;
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodResource>, FetchError>;
    /// Samples keyed by pod name.
    async fn list_pod_metrics(&self, namespace: &str) -> Result<HashMap<String, PodMetrics>, FetchError>;
    /// Cluster-wide watch for `kind`. The stream ends or yields an error when
    /// the connection is lost; callers re-open it.
    fn watch(&self, kind: ResourceKind) -> BoxStream<'static, Result<WatchEvent, FetchError>>;
}
