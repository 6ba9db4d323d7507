//! Conversion from API objects to the canonical resource model.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashlite_core::quantity::{parse_cpu_millicores, parse_memory_mb};
use dashlite_core::{
    ContainerInfo, ContainerUsage, ControllerResource, NamespaceResource, OwnerRef, PodMetrics, PodResource,
    Replicas, ResourceKind, ResourceRef,
};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, Namespace, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;

fn ident(meta: &ObjectMeta) -> (String, String) {
    (meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default())
}

fn container(c: &Container) -> ContainerInfo {
    ContainerInfo::new(c.name.clone(), c.image.clone().unwrap_or_default())
}

fn main_container(spec: Option<&PodSpec>) -> Option<ContainerInfo> {
    spec.and_then(|s| s.containers.first()).map(container)
}

pub fn deployment(d: &Deployment) -> ControllerResource {
    let (ns, name) = ident(&d.metadata);
    let status = d.status.as_ref();
    ControllerResource {
        reference: ResourceRef::new(ResourceKind::Deployment, ns, name),
        replicas: Replicas {
            desired: d.spec.as_ref().and_then(|s| s.replicas),
            ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
            available: status.and_then(|s| s.available_replicas).unwrap_or(0),
            updated: status.and_then(|s| s.updated_replicas).unwrap_or(0),
        },
        main_container: main_container(d.spec.as_ref().and_then(|s| s.template.spec.as_ref())),
        labels: d.metadata.labels.clone().unwrap_or_default(),
    }
}

pub fn statefulset(s: &StatefulSet) -> ControllerResource {
    let (ns, name) = ident(&s.metadata);
    let status = s.status.as_ref();
    ControllerResource {
        reference: ResourceRef::new(ResourceKind::StatefulSet, ns, name),
        replicas: Replicas {
            desired: s.spec.as_ref().and_then(|sp| sp.replicas),
            ready: status.and_then(|st| st.ready_replicas).unwrap_or(0),
            available: status.and_then(|st| st.available_replicas).unwrap_or(0),
            updated: status.and_then(|st| st.updated_replicas).unwrap_or(0),
        },
        main_container: main_container(s.spec.as_ref().and_then(|sp| sp.template.spec.as_ref())),
        labels: s.metadata.labels.clone().unwrap_or_default(),
    }
}

pub fn pod(p: &Pod) -> PodResource {
    let (ns, name) = ident(&p.metadata);
    let status = p.status.as_ref();
    let owners = p.metadata.owner_references.as_deref().unwrap_or_default();
    let owner = owners.iter().find(|o| o.controller == Some(true)).or_else(|| owners.first());
    PodResource {
        reference: ResourceRef::new(ResourceKind::Pod, ns, name),
        phase: status.and_then(|s| s.phase.clone()).unwrap_or_else(|| "Unknown".to_string()),
        owner_ref: owner.map(|o| OwnerRef { kind: o.kind.clone(), name: o.name.clone() }),
        containers: p.spec.as_ref().map(|s| s.containers.iter().map(container).collect()).unwrap_or_default(),
        metrics: None,
        started_at: status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
        labels: p.metadata.labels.clone().unwrap_or_default(),
        pod_ip: status.and_then(|s| s.pod_ip.clone()),
        host_ip: status.and_then(|s| s.host_ip.clone()),
        terminating: p.metadata.deletion_timestamp.is_some(),
    }
}

pub fn namespace(n: &Namespace) -> NamespaceResource {
    NamespaceResource {
        name: n.metadata.name.clone().unwrap_or_default(),
        phase: n.status.as_ref().and_then(|s| s.phase.clone()).unwrap_or_else(|| "Unknown".to_string()),
        labels: n.metadata.labels.clone().unwrap_or_default(),
        created_at: n.metadata.creation_timestamp.as_ref().map(|t| t.0),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawUsage {
    cpu: Option<String>,
    memory: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawContainerMetrics {
    name: String,
    #[serde(default)]
    usage: RawUsage,
}

#[derive(Debug, Deserialize)]
struct RawPodMetrics {
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    containers: Vec<RawContainerMetrics>,
}

/// Parses the body of a `metrics.k8s.io/v1beta1` PodMetrics object.
///
/// Unparseable quantities become absent values; an unreadable document yields
/// `None`.
pub fn pod_metrics(data: &serde_json::Value) -> Option<PodMetrics> {
    let raw: RawPodMetrics = serde_json::from_value(data.clone()).ok()?;
    Some(PodMetrics {
        containers: raw
            .containers
            .into_iter()
            .map(|c| ContainerUsage {
                name: c.name,
                cpu_millicores: c.usage.cpu.as_deref().and_then(parse_cpu_millicores),
                memory_mb: c.usage.memory.as_deref().and_then(parse_memory_mb),
            })
            .collect(),
        timestamp: raw.timestamp,
    })
}

/// Attaches samples to pods by name; pods without a sample keep none.
pub fn merge_metrics(pods: &mut [PodResource], metrics: &HashMap<String, PodMetrics>) {
    for p in pods {
        p.metrics = metrics.get(&p.reference.name).cloned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_json() -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web-7d9f-abcde",
                "namespace": "shop",
                "labels": {"app": "web"},
                "ownerReferences": [{
                    "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "web-7d9f",
                    "uid": "u1", "controller": true
                }]
            },
            "spec": {"containers": [
                {"name": "app", "image": "registry:5000/shop/web:2.1.0"},
                {"name": "sidecar", "image": "envoy"}
            ]},
            "status": {"phase": "Running", "podIP": "10.0.0.7", "hostIP": "192.168.1.2",
                       "startTime": "2024-05-01T10:00:00Z"}
        })
    }

    #[test]
    fn normalizes_pod() {
        let p: Pod = serde_json::from_value(pod_json()).unwrap();
        let r = pod(&p);
        assert_eq!(r.reference, ResourceRef::new(ResourceKind::Pod, "shop", "web-7d9f-abcde"));
        assert_eq!(r.phase, "Running");
        assert_eq!(r.owner_ref, Some(OwnerRef { kind: "ReplicaSet".into(), name: "web-7d9f".into() }));
        assert_eq!(r.containers[0].image_tag, "2.1.0");
        assert_eq!(r.containers[1].image_tag, "latest");
        assert_eq!(r.pod_ip.as_deref(), Some("10.0.0.7"));
        assert!(r.started_at.is_some());
        assert!(!r.terminating);
    }

    #[test]
    fn normalizes_deployment_without_desired() {
        let d: Deployment = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "api", "namespace": "shop"},
            "status": {"readyReplicas": 2}
        }))
        .unwrap();
        let c = deployment(&d);
        assert_eq!(c.replicas.desired, None);
        assert_eq!(c.replicas.ready, 2);
        assert_eq!(c.main_container, None);
        assert_eq!(c.derived_status(), dashlite_core::DerivedStatus::Error);
    }

    #[test]
    fn normalizes_statefulset() {
        let s: StatefulSet = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": {"name": "db", "namespace": "shop"},
            "spec": {
                "replicas": 3, "serviceName": "db",
                "selector": {"matchLabels": {"app": "db"}},
                "template": {"spec": {"containers": [{"name": "pg", "image": "postgres:16"}]}}
            },
            "status": {"replicas": 3, "readyReplicas": 3, "availableReplicas": 3, "updatedReplicas": 3}
        }))
        .unwrap();
        let c = statefulset(&s);
        assert_eq!(c.reference.kind, ResourceKind::StatefulSet);
        assert_eq!(c.main_container.as_ref().unwrap().image_tag, "16");
        assert_eq!(c.derived_status(), dashlite_core::DerivedStatus::Healthy);
    }

    #[test]
    fn metrics_keep_absent_values_absent() {
        let m = pod_metrics(&serde_json::json!({
            "timestamp": "2024-05-01T10:00:00Z",
            "window": "30s",
            "containers": [
                {"name": "app", "usage": {"cpu": "250m", "memory": "512Mi"}},
                {"name": "sidecar", "usage": {"cpu": "bogus", "memory": "1Gi"}}
            ]
        }))
        .unwrap();
        assert_eq!(m.containers[0].cpu_millicores, Some(250));
        assert_eq!(m.containers[1].cpu_millicores, None);
        let totals = m.totals();
        assert_eq!(totals.cpu_millicores, 250);
        assert_eq!(totals.memory_mb, 1536.0);
    }
}
