use std::collections::HashMap;
use std::fmt::Debug;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashlite_core::{ControllerResource, FetchError, NamespaceResource, PodMetrics, PodResource, Resource, ResourceKind};
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    Client,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::{normalize, ClusterSource, WatchEvent};

/// [`ClusterSource`] backed by a live API server.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
    metrics: ApiResource,
}

impl KubeSource {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        Self { client, metrics: ApiResource::from_gvk_with_plural(&gvk, "pods") }
    }

    /// Uses the in-cluster service account or the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        info!("kube: client ready");
        Ok(Self::new(client))
    }
}

/// Classifies API failures; anything that is not a definitive answer from the
/// API server is transient.
pub(crate) fn map_kube_error(e: kube::Error) -> FetchError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            401 => FetchError::Unauthenticated(resp.message),
            403 => FetchError::Forbidden(resp.message),
            404 | 410 => FetchError::NotFound(resp.message),
            code => FetchError::Transient(format!("{code}: {}", resp.message)),
        },
        other => FetchError::Transient(other.to_string()),
    }
}

async fn list_typed<K, T>(api: Api<K>, f: fn(&K) -> T) -> Result<Vec<T>, FetchError>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    let list = api.list(&ListParams::default()).await.map_err(map_kube_error)?;
    Ok(list.items.iter().map(f).collect())
}

fn watch_typed<K>(api: Api<K>, f: fn(&K) -> Resource) -> BoxStream<'static, Result<WatchEvent, FetchError>>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher::watcher(api, watcher::Config::default())
        .map(move |ev| match ev {
            Ok(Event::Applied(o)) => Ok(WatchEvent::Applied(f(&o))),
            Ok(Event::Deleted(o)) => Ok(WatchEvent::Deleted(f(&o))),
            Ok(Event::Restarted(list)) => Ok(WatchEvent::Restarted(list.iter().map(f).collect())),
            Err(e) => Err(FetchError::Transient(e.to_string())),
        })
        .boxed()
}

#[async_trait]
impl ClusterSource for KubeSource {
    async fn list_namespaces(&self) -> Result<Vec<NamespaceResource>, FetchError> {
        list_typed(Api::<Namespace>::all(self.client.clone()), normalize::namespace).await
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<ControllerResource>, FetchError> {
        list_typed(Api::<Deployment>::namespaced(self.client.clone(), namespace), normalize::deployment).await
    }

    async fn list_statefulsets(&self, namespace: &str) -> Result<Vec<ControllerResource>, FetchError> {
        list_typed(Api::<StatefulSet>::namespaced(self.client.clone(), namespace), normalize::statefulset).await
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodResource>, FetchError> {
        list_typed(Api::<Pod>::namespaced(self.client.clone(), namespace), normalize::pod).await
    }

    async fn list_pod_metrics(&self, namespace: &str) -> Result<HashMap<String, PodMetrics>, FetchError> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &self.metrics);
        let list = api.list(&ListParams::default()).await.map_err(map_kube_error)?;
        let mut out = HashMap::with_capacity(list.items.len());
        for obj in &list.items {
            let Some(name) = obj.metadata.name.clone() else { continue };
            match normalize::pod_metrics(&obj.data) {
                Some(m) => {
                    out.insert(name, m);
                }
                None => debug!(ns = %namespace, pod = %name, "kube: unreadable pod metrics skipped"),
            }
        }
        Ok(out)
    }

    fn watch(&self, kind: ResourceKind) -> BoxStream<'static, Result<WatchEvent, FetchError>> {
        let client = self.client.clone();
        match kind {
            ResourceKind::Namespace => {
                watch_typed(Api::<Namespace>::all(client), |n| Resource::Namespace(normalize::namespace(n)))
            }
            ResourceKind::Deployment => {
                watch_typed(Api::<Deployment>::all(client), |d| Resource::Controller(normalize::deployment(d)))
            }
            ResourceKind::StatefulSet => {
                watch_typed(Api::<StatefulSet>::all(client), |s| Resource::Controller(normalize::statefulset(s)))
            }
            ResourceKind::Pod => watch_typed(Api::<Pod>::all(client), |p| Resource::Pod(normalize::pod(p))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("code {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn maps_api_status_codes() {
        assert!(matches!(map_kube_error(api_err(401)), FetchError::Unauthenticated(_)));
        assert!(matches!(map_kube_error(api_err(403)), FetchError::Forbidden(_)));
        assert!(matches!(map_kube_error(api_err(404)), FetchError::NotFound(_)));
        let e = map_kube_error(api_err(503));
        assert!(e.is_retryable());
    }
}
