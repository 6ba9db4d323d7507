use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashlite_core::{ControllerResource, FetchError, NamespaceResource, PodMetrics, PodResource, Resource, ResourceKind};
use metrics::histogram;
use tracing::debug;

use crate::{ClusterSource, RetryPolicy};

/// Cluster reads with per-attempt timeouts and bounded retries.
///
/// Every call covers one `(kind, namespace)` slice and reports its own
/// error; containing failures per slice is up to the aggregating caller.
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn ClusterSource>,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(source: Arc<dyn ClusterSource>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    pub fn source(&self) -> &Arc<dyn ClusterSource> {
        &self.source
    }

    pub async fn namespaces(&self) -> Result<Vec<NamespaceResource>, FetchError> {
        let t0 = Instant::now();
        let out = self.retry.run("namespaces", || self.source.list_namespaces()).await;
        observe("namespaces", "", t0, out.as_ref().map(|v| v.len()));
        out
    }

    pub async fn deployments(&self, namespace: &str) -> Result<Vec<ControllerResource>, FetchError> {
        let t0 = Instant::now();
        let out = self.retry.run("deployments", || self.source.list_deployments(namespace)).await;
        observe("deployments", namespace, t0, out.as_ref().map(|v| v.len()));
        out
    }

    pub async fn statefulsets(&self, namespace: &str) -> Result<Vec<ControllerResource>, FetchError> {
        let t0 = Instant::now();
        let out = self.retry.run("statefulsets", || self.source.list_statefulsets(namespace)).await;
        observe("statefulsets", namespace, t0, out.as_ref().map(|v| v.len()));
        out
    }

    pub async fn pods(&self, namespace: &str) -> Result<Vec<PodResource>, FetchError> {
        let t0 = Instant::now();
        let out = self.retry.run("pods", || self.source.list_pods(namespace)).await;
        observe("pods", namespace, t0, out.as_ref().map(|v| v.len()));
        out
    }

    pub async fn pod_metrics(&self, namespace: &str) -> Result<HashMap<String, PodMetrics>, FetchError> {
        let t0 = Instant::now();
        let out = self.retry.run("metrics", || self.source.list_pod_metrics(namespace)).await;
        observe("metrics", namespace, t0, out.as_ref().map(|v| v.len()));
        out
    }

    /// Lists one slice as generic resources. `namespace` is ignored for
    /// Namespace objects.
    pub async fn fetch(&self, kind: ResourceKind, namespace: &str) -> Result<Vec<Resource>, FetchError> {
        Ok(match kind {
            ResourceKind::Namespace => self.namespaces().await?.into_iter().map(Resource::from).collect(),
            ResourceKind::Deployment => self.deployments(namespace).await?.into_iter().map(Resource::from).collect(),
            ResourceKind::StatefulSet => self.statefulsets(namespace).await?.into_iter().map(Resource::from).collect(),
            ResourceKind::Pod => self.pods(namespace).await?.into_iter().map(Resource::from).collect(),
        })
    }
}

fn observe(what: &'static str, namespace: &str, t0: Instant, out: Result<usize, &FetchError>) {
    histogram!("fetch_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => what);
    let took_ms = t0.elapsed().as_millis() as u64;
    match out {
        Ok(count) => debug!(kind = what, ns = %namespace, count, took_ms, "fetch: ok"),
        Err(e) => debug!(kind = what, ns = %namespace, error = %e, took_ms, "fetch: failed"),
    }
}
