//! Dashlite request/response API façade (in-process).
//!
//! This crate defines the read operations the HTTP surface serves. Every call
//! takes the caller's [`Identity`]; namespace-scoped data the identity may not
//! see is filtered out silently. Reads go through the TTL cache in front of
//! the fetcher, and a failing `(kind, namespace)` slice degrades to an empty
//! slice instead of failing the whole answer.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashlite_cache::{CacheCategory, CacheKey, TtlCache, TtlPolicy};
use dashlite_core::{
    rollup, AccessFilter, ControllerResource, FetchError, Identity, LabelSelector, NamespaceResource, NamespaceRollup,
    PodMetrics, PodResource, Resource, ResourceKind, UsageTotals,
};
use dashlite_kubehub::normalize::merge_metrics;
use dashlite_kubehub::Fetcher;
use futures::future::join_all;
use metrics::histogram;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

mod identity;

pub use identity::{bearer_token, IdentityResolver};

/// API errors, serializable for transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum DashError {
    #[error("upstream_unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl DashError {
    pub fn code(&self) -> &'static str {
        match self {
            DashError::UpstreamUnavailable(_) => "upstream_unavailable",
            DashError::NotFound(_) => "not_found",
            DashError::Unauthorized(_) => "unauthorized",
            DashError::Forbidden(_) => "forbidden",
            DashError::Validation(_) => "validation",
            DashError::Internal(_) => "internal",
        }
    }

    /// HTTP status the boundary answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            DashError::UpstreamUnavailable(_) => 503,
            DashError::NotFound(_) => 404,
            DashError::Unauthorized(_) => 401,
            DashError::Forbidden(_) => 403,
            DashError::Validation(_) => 400,
            DashError::Internal(_) => 500,
        }
    }
}

impl From<FetchError> for DashError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Unauthenticated(m) => DashError::Unauthorized(m),
            FetchError::Forbidden(m) => DashError::Forbidden(m),
            FetchError::NotFound(m) => DashError::NotFound(m),
            FetchError::Transient(_) | FetchError::Timeout(_) => DashError::UpstreamUnavailable(e.to_string()),
        }
    }
}

pub type DashResult<T> = Result<T, DashError>;

/// A controller with the pods it owns, metrics merged in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerDetail {
    #[serde(flatten)]
    pub controller: ControllerResource,
    pub pods: Vec<PodResource>,
    /// Summed over pods that reported metrics.
    pub usage: UsageTotals,
}

/// Read-only dashboard API surface.
#[async_trait::async_trait]
pub trait DashboardApi: Send + Sync {
    /// Namespaces visible to `who`.
    async fn list_namespaces(&self, who: &Identity) -> DashResult<Vec<NamespaceResource>>;

    /// Per-namespace replica rollups for every visible namespace.
    async fn namespace_summaries(&self, who: &Identity) -> DashResult<Vec<NamespaceRollup>>;

    /// Deployments and StatefulSets in `namespace` (or every visible one),
    /// restricted to names matching any of `patterns`.
    async fn list_controllers(
        &self,
        who: &Identity,
        namespace: Option<&str>,
        patterns: &[String],
    ) -> DashResult<Vec<ControllerResource>>;

    /// Looks the name up among Deployments first, then StatefulSets.
    async fn controller_detail(&self, who: &Identity, namespace: &str, name: &str) -> DashResult<ControllerDetail>;

    async fn list_pods(
        &self,
        who: &Identity,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> DashResult<Vec<PodResource>>;

    async fn pod_detail(&self, who: &Identity, namespace: &str, name: &str) -> DashResult<PodResource>;

    /// Drops every cached entry.
    async fn clear_cache(&self) -> DashResult<()>;
}

/// Keeps controllers whose name matches one of `patterns` from its start.
/// No patterns, or a `.*` pattern, keeps everything.
pub fn filter_by_patterns(controllers: Vec<ControllerResource>, patterns: &[String]) -> DashResult<Vec<ControllerResource>> {
    if patterns.is_empty() || patterns.iter().any(|p| p == ".*") {
        return Ok(controllers);
    }
    let compiled = patterns
        .iter()
        .map(|p| Regex::new(&format!("^(?:{p})")).map_err(|e| DashError::Validation(format!("pattern {p:?}: {e}"))))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(controllers
        .into_iter()
        .filter(|c| compiled.iter().any(|re| re.is_match(&c.reference.name)))
        .collect())
}

fn category(kind: ResourceKind) -> CacheCategory {
    match kind {
        ResourceKind::Namespace => CacheCategory::Namespaces,
        ResourceKind::Deployment => CacheCategory::Deployments,
        ResourceKind::StatefulSet => CacheCategory::StatefulSets,
        ResourceKind::Pod => CacheCategory::Pods,
    }
}

// ----------------- In-process implementation -----------------

type Slice = Arc<Vec<Resource>>;
type MetricsSlice = Arc<HashMap<String, PodMetrics>>;

/// In-process implementation over a [`Fetcher`] with a TTL cache in front.
pub struct InProcApi {
    fetcher: Fetcher,
    access: Arc<dyn AccessFilter>,
    lists: TtlCache<Slice, FetchError>,
    metrics: TtlCache<MetricsSlice, FetchError>,
}

impl InProcApi {
    pub fn new(fetcher: Fetcher, access: Arc<dyn AccessFilter>, ttl: TtlPolicy) -> Self {
        Self { fetcher, access, lists: TtlCache::new(ttl.clone()), metrics: TtlCache::new(ttl) }
    }

    async fn slice(&self, kind: ResourceKind, namespace: &str) -> Result<Slice, FetchError> {
        let key = CacheKey::new(category(kind), namespace);
        let (fetcher, ns) = (self.fetcher.clone(), namespace.to_string());
        self.lists
            .get_or_compute(&key, move || async move { fetcher.fetch(kind, &ns).await.map(Arc::new) })
            .await
    }

    /// A slice that failed is logged and treated as empty.
    async fn slice_or_empty(&self, kind: ResourceKind, namespace: &str) -> Slice {
        match self.slice(kind, namespace).await {
            Ok(s) => s,
            Err(FetchError::NotFound(_)) => Slice::default(),
            Err(e) => {
                warn!(kind = %kind, ns = %namespace, error = %e, "api: slice unavailable; serving empty");
                Slice::default()
            }
        }
    }

    async fn pod_metrics(&self, namespace: &str) -> MetricsSlice {
        let key = CacheKey::new(CacheCategory::Metrics, namespace);
        let (fetcher, ns) = (self.fetcher.clone(), namespace.to_string());
        let res = self
            .metrics
            .get_or_compute(&key, move || async move { fetcher.pod_metrics(&ns).await.map(Arc::new) })
            .await;
        res.unwrap_or_else(|e| {
            debug!(ns = %namespace, error = %e, "api: metrics unavailable");
            MetricsSlice::default()
        })
    }

    async fn all_namespaces(&self) -> DashResult<Vec<NamespaceResource>> {
        let list = self.slice(ResourceKind::Namespace, "").await?;
        Ok(list.iter().filter_map(Resource::as_namespace).cloned().collect())
    }

    /// Namespaces a call covers: the requested one if visible, otherwise
    /// every visible namespace.
    async fn scope(&self, who: &Identity, namespace: Option<&str>) -> DashResult<Vec<String>> {
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) if self.access.is_allowed(who, ns) => Ok(vec![ns.to_string()]),
            Some(ns) => {
                debug!(user = %who.username, ns = %ns, "api: namespace filtered by access");
                Ok(Vec::new())
            }
            None => {
                let names: Vec<String> = self.all_namespaces().await?.into_iter().map(|n| n.name).collect();
                Ok(self.access.allowed_namespaces(who, &names))
            }
        }
    }

    async fn controllers_in(&self, namespaces: &[String]) -> Vec<ControllerResource> {
        let slices = namespaces
            .iter()
            .flat_map(|ns| [ResourceKind::Deployment, ResourceKind::StatefulSet].map(|k| (k, ns.as_str())));
        let fetched = join_all(slices.map(|(kind, ns)| self.slice_or_empty(kind, ns))).await;
        fetched.iter().flat_map(|s| s.iter().filter_map(Resource::as_controller).cloned()).collect()
    }

    async fn find_controller(&self, namespace: &str, name: &str) -> DashResult<Option<ControllerResource>> {
        for kind in [ResourceKind::Deployment, ResourceKind::StatefulSet] {
            let slice = match self.slice(kind, namespace).await {
                Ok(s) => s,
                Err(FetchError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            if let Some(c) = slice.iter().filter_map(Resource::as_controller).find(|c| c.reference.name == name) {
                return Ok(Some(c.clone()));
            }
        }
        Ok(None)
    }

    fn pods_of(slice: &Slice) -> Vec<PodResource> {
        slice.iter().filter_map(Resource::as_pod).cloned().collect()
    }
}

fn observe(op: &'static str, t0: Instant) -> u64 {
    histogram!("api_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    t0.elapsed().as_millis() as u64
}

#[async_trait::async_trait]
impl DashboardApi for InProcApi {
    async fn list_namespaces(&self, who: &Identity) -> DashResult<Vec<NamespaceResource>> {
        let t0 = Instant::now();
        let all = self.all_namespaces().await?;
        let names: Vec<String> = all.iter().map(|n| n.name.clone()).collect();
        let allowed = self.access.allowed_namespaces(who, &names);
        let out: Vec<NamespaceResource> = all.into_iter().filter(|n| allowed.contains(&n.name)).collect();
        info!(user = %who.username, total = names.len(), visible = out.len(), took_ms = observe("list_namespaces", t0), "api: namespaces");
        Ok(out)
    }

    async fn namespace_summaries(&self, who: &Identity) -> DashResult<Vec<NamespaceRollup>> {
        let t0 = Instant::now();
        let namespaces = self.scope(who, None).await?;
        let controllers: Vec<Resource> =
            self.controllers_in(&namespaces).await.into_iter().map(Resource::from).collect();
        let out: Vec<NamespaceRollup> = namespaces.iter().map(|ns| rollup(ns, &controllers)).collect();
        info!(user = %who.username, namespaces = out.len(), took_ms = observe("namespace_summaries", t0), "api: summaries");
        Ok(out)
    }

    async fn list_controllers(
        &self,
        who: &Identity,
        namespace: Option<&str>,
        patterns: &[String],
    ) -> DashResult<Vec<ControllerResource>> {
        let t0 = Instant::now();
        let namespaces = self.scope(who, namespace).await?;
        let controllers = filter_by_patterns(self.controllers_in(&namespaces).await, patterns)?;
        info!(
            user = %who.username,
            ns = %namespace.unwrap_or("(all)"),
            count = controllers.len(),
            took_ms = observe("list_controllers", t0),
            "api: controllers"
        );
        Ok(controllers)
    }

    async fn controller_detail(&self, who: &Identity, namespace: &str, name: &str) -> DashResult<ControllerDetail> {
        let t0 = Instant::now();
        let not_found = || DashError::NotFound(format!("controller {namespace}/{name}"));
        if !self.access.is_allowed(who, namespace) {
            return Err(not_found());
        }
        let controller = self.find_controller(namespace, name).await?.ok_or_else(not_found)?;
        let (pods, metrics) =
            tokio::join!(self.slice_or_empty(ResourceKind::Pod, namespace), self.pod_metrics(namespace));
        let mut pods: Vec<PodResource> = Self::pods_of(&pods).into_iter().filter(|p| p.is_owned_by(&controller)).collect();
        merge_metrics(&mut pods, &metrics);
        let usage = pods.iter().filter_map(|p| p.metrics.as_ref()).map(PodMetrics::totals).fold(
            UsageTotals::default(),
            |mut acc, t| {
                acc.cpu_millicores += t.cpu_millicores;
                acc.memory_mb += t.memory_mb;
                acc
            },
        );
        info!(
            ns = %namespace,
            name = %name,
            kind = %controller.reference.kind,
            pods = pods.len(),
            took_ms = observe("controller_detail", t0),
            "api: controller detail"
        );
        Ok(ControllerDetail { controller, pods, usage })
    }

    async fn list_pods(
        &self,
        who: &Identity,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> DashResult<Vec<PodResource>> {
        let t0 = Instant::now();
        let namespaces = self.scope(who, namespace).await?;
        let slices = join_all(namespaces.iter().map(|ns| self.slice_or_empty(ResourceKind::Pod, ns))).await;
        let pods: Vec<PodResource> = slices
            .iter()
            .flat_map(Self::pods_of)
            .filter(|p| selector.matches(&p.labels))
            .collect();
        info!(
            user = %who.username,
            ns = %namespace.unwrap_or("(all)"),
            selector = %selector,
            count = pods.len(),
            took_ms = observe("list_pods", t0),
            "api: pods"
        );
        Ok(pods)
    }

    async fn pod_detail(&self, who: &Identity, namespace: &str, name: &str) -> DashResult<PodResource> {
        let t0 = Instant::now();
        let not_found = || DashError::NotFound(format!("pod {namespace}/{name}"));
        if !self.access.is_allowed(who, namespace) {
            return Err(not_found());
        }
        let slice = self.slice(ResourceKind::Pod, namespace).await.map_err(|e| match e {
            FetchError::NotFound(_) => not_found(),
            other => other.into(),
        })?;
        let mut pod = Self::pods_of(&slice).into_iter().find(|p| p.reference.name == name).ok_or_else(not_found)?;
        pod.metrics = self.pod_metrics(namespace).await.get(name).cloned();
        debug!(ns = %namespace, name = %name, took_ms = observe("pod_detail", t0), "api: pod detail");
        Ok(pod)
    }

    async fn clear_cache(&self) -> DashResult<()> {
        let entries = self.lists.len() + self.metrics.len();
        self.lists.invalidate_all();
        self.metrics.invalidate_all();
        info!(entries, "api: cache cleared");
        Ok(())
    }
}
