//! Dashlite core types: the canonical resource model shared by the fetcher,
//! the store, the fan-out hub and the request façade.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod access;
mod error;
pub mod quantity;
pub mod selector;
pub mod status;

pub use access::{AccessFilter, AllowAll, Identity, PatternAccessFilter};
pub use error::FetchError;
pub use selector::LabelSelector;
pub use status::{derive_status, rollup, DerivedStatus, NamespaceRollup, PodStatus};

pub type Labels = BTreeMap<String, String>;

/// Kinds of cluster resources tracked by the dashboard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Namespace,
    Deployment,
    StatefulSet,
    Pod,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Namespace,
        ResourceKind::Deployment,
        ResourceKind::StatefulSet,
        ResourceKind::Pod,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Pod => "Pod",
        }
    }

    pub fn is_controller(self) -> bool {
        matches!(self, ResourceKind::Deployment | ResourceKind::StatefulSet)
    }

    pub fn is_namespaced(self) -> bool {
        !matches!(self, ResourceKind::Namespace)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    /// Accepts the kind name as well as the lowercase singular/plural resource
    /// names clients tend to send (`pods`, `deployment`, `statefulsets`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "namespace" | "namespaces" | "ns" => Ok(ResourceKind::Namespace),
            "deployment" | "deployments" | "deploy" => Ok(ResourceKind::Deployment),
            "statefulset" | "statefulsets" | "sts" => Ok(ResourceKind::StatefulSet),
            "pod" | "pods" | "po" => Ok(ResourceKind::Pod),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// Identity of a resource; the merge/diff key everywhere.
///
/// `namespace` is empty for cluster-scoped kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = if kind.is_namespaced() { namespace.into() } else { String::new() };
        Self { kind, namespace, name: name.into() }
    }

    /// Namespace used for filtering and access checks. A Namespace resource
    /// is scoped by its own name.
    pub fn scope(&self) -> &str {
        if self.kind.is_namespaced() { &self.namespace } else { &self.name }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub image: String,
    pub image_tag: String,
}

impl ContainerInfo {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let image = image.into();
        let image_tag = image_tag(&image);
        Self { name: name.into(), image, image_tag }
    }
}

/// Tag of an image reference: the text after the last `:`.
///
/// A trailing segment containing `/` belongs to a registry port
/// (`registry:5000/app`), in which case the image is untagged and `latest`
/// is reported.
pub fn image_tag(image: &str) -> String {
    let without_digest = image.split('@').next().unwrap_or(image);
    match without_digest.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() && !tag.contains('/') => tag.to_string(),
        _ => "latest".to_string(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Replicas {
    /// `None` when the API object carries no desired count.
    pub desired: Option<i32>,
    pub ready: i32,
    pub available: i32,
    pub updated: i32,
}

/// A Deployment or StatefulSet.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ControllerResource {
    #[serde(flatten)]
    pub reference: ResourceRef,
    pub replicas: Replicas,
    pub main_container: Option<ContainerInfo>,
    #[serde(default)]
    pub labels: Labels,
}

impl ControllerResource {
    pub fn derived_status(&self) -> DerivedStatus {
        derive_status(self.replicas.desired, self.replicas.ready)
    }

    pub fn controller_type(&self) -> &'static str {
        match self.reference.kind {
            ResourceKind::StatefulSet => "statefulset",
            _ => "deployment",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerUsage {
    pub name: String,
    pub cpu_millicores: Option<u64>,
    pub memory_mb: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct UsageTotals {
    pub cpu_millicores: u64,
    pub memory_mb: f64,
}

/// Best-effort usage sample from the metrics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodMetrics {
    pub containers: Vec<ContainerUsage>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl PodMetrics {
    /// Sum over containers; absent values contribute nothing.
    pub fn totals(&self) -> UsageTotals {
        self.containers.iter().fold(UsageTotals::default(), |mut acc, c| {
            acc.cpu_millicores += c.cpu_millicores.unwrap_or(0);
            acc.memory_mb += c.memory_mb.unwrap_or(0.0);
            acc
        })
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.timestamp.map(|ts| (now - ts).num_seconds().max(0))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PodResource {
    #[serde(flatten)]
    pub reference: ResourceRef,
    pub phase: String,
    pub owner_ref: Option<OwnerRef>,
    pub containers: Vec<ContainerInfo>,
    pub metrics: Option<PodMetrics>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Labels,
    pub pod_ip: Option<String>,
    pub host_ip: Option<String>,
    #[serde(default)]
    pub terminating: bool,
}

impl PodResource {
    pub fn status(&self) -> PodStatus {
        PodStatus::from_phase(&self.phase, self.terminating)
    }

    /// Whether this pod was created by `controller`.
    ///
    /// Deployment pods are owned by a ReplicaSet named `<deployment>-<hash>`;
    /// StatefulSet pods are owned directly. Without owner data the pod's own
    /// generated name is matched instead.
    pub fn is_owned_by(&self, controller: &ControllerResource) -> bool {
        let c = &controller.reference;
        if c.namespace != self.reference.namespace {
            return false;
        }
        match (&self.owner_ref, c.kind) {
            (Some(owner), ResourceKind::Deployment) => match owner.kind.as_str() {
                "ReplicaSet" => is_generated_from(&owner.name, &c.name, 1),
                "Deployment" => owner.name == c.name,
                _ => false,
            },
            (Some(owner), ResourceKind::StatefulSet) => owner.kind == "StatefulSet" && owner.name == c.name,
            (None, ResourceKind::Deployment) => is_generated_from(&self.reference.name, &c.name, 2),
            (None, ResourceKind::StatefulSet) => self
                .reference
                .name
                .strip_prefix(c.name.as_str())
                .and_then(|rest| rest.strip_prefix('-'))
                .is_some_and(|ordinal| !ordinal.is_empty() && ordinal.bytes().all(|b| b.is_ascii_digit())),
            _ => false,
        }
    }
}

/// `name` is `<base>-<s1>-...-<sN>` with exactly `segments` non-empty
/// generated suffix segments.
fn is_generated_from(name: &str, base: &str, segments: usize) -> bool {
    let Some(rest) = name.strip_prefix(base).and_then(|r| r.strip_prefix('-')) else {
        return false;
    };
    let parts: Vec<&str> = rest.split('-').collect();
    parts.len() == segments && parts.iter().all(|p| !p.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceResource {
    pub name: String,
    pub phase: String,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: Option<DateTime<Utc>>,
}

/// Any resource the store indexes.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Namespace(NamespaceResource),
    Controller(ControllerResource),
    Pod(PodResource),
}

impl Resource {
    pub fn reference(&self) -> ResourceRef {
        match self {
            Resource::Namespace(n) => ResourceRef::new(ResourceKind::Namespace, "", n.name.clone()),
            Resource::Controller(c) => c.reference.clone(),
            Resource::Pod(p) => p.reference.clone(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Namespace(_) => ResourceKind::Namespace,
            Resource::Controller(c) => c.reference.kind,
            Resource::Pod(_) => ResourceKind::Pod,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Resource::Namespace(n) => &n.name,
            Resource::Controller(c) => &c.reference.name,
            Resource::Pod(p) => &p.reference.name,
        }
    }

    /// Namespace the resource lives in; empty for Namespace resources.
    pub fn namespace(&self) -> &str {
        match self {
            Resource::Namespace(_) => "",
            Resource::Controller(c) => &c.reference.namespace,
            Resource::Pod(p) => &p.reference.namespace,
        }
    }

    /// Namespace used for subscription filters and access checks.
    pub fn scope(&self) -> &str {
        match self {
            Resource::Namespace(n) => &n.name,
            _ => self.namespace(),
        }
    }

    pub fn as_controller(&self) -> Option<&ControllerResource> {
        match self {
            Resource::Controller(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_pod(&self) -> Option<&PodResource> {
        match self {
            Resource::Pod(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_namespace(&self) -> Option<&NamespaceResource> {
        match self {
            Resource::Namespace(n) => Some(n),
            _ => None,
        }
    }
}

impl From<NamespaceResource> for Resource {
    fn from(v: NamespaceResource) -> Self { Resource::Namespace(v) }
}

impl From<ControllerResource> for Resource {
    fn from(v: ControllerResource) -> Self { Resource::Controller(v) }
}

impl From<PodResource> for Resource {
    fn from(v: PodResource) -> Self { Resource::Pod(v) }
}

// ---- wire views ----
//
// Derived fields (controller status, pod status, usage totals) are computed
// at serialization time and never stored.

#[derive(Serialize)]
struct ControllerView<'a> {
    #[serde(flatten)]
    reference: &'a ResourceRef,
    controller_type: &'static str,
    replicas: &'a Replicas,
    main_container: &'a Option<ContainerInfo>,
    labels: &'a Labels,
    status: DerivedStatus,
}

#[derive(Serialize)]
struct PodView<'a> {
    #[serde(flatten)]
    reference: &'a ResourceRef,
    phase: &'a str,
    status: PodStatus,
    owner_ref: &'a Option<OwnerRef>,
    containers: &'a [ContainerInfo],
    metrics: &'a Option<PodMetrics>,
    usage: Option<UsageTotals>,
    started_at: &'a Option<DateTime<Utc>>,
    labels: &'a Labels,
    pod_ip: &'a Option<String>,
    host_ip: &'a Option<String>,
}

impl Serialize for ControllerResource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ControllerView {
            reference: &self.reference,
            controller_type: self.controller_type(),
            replicas: &self.replicas,
            main_container: &self.main_container,
            labels: &self.labels,
            status: self.derived_status(),
        }
        .serialize(serializer)
    }
}

impl Serialize for PodResource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        PodView {
            reference: &self.reference,
            phase: &self.phase,
            status: self.status(),
            owner_ref: &self.owner_ref,
            containers: &self.containers,
            metrics: &self.metrics,
            usage: self.metrics.as_ref().map(PodMetrics::totals),
            started_at: &self.started_at,
            labels: &self.labels,
            pod_ip: &self.pod_ip,
            host_ip: &self.host_ip,
        }
        .serialize(serializer)
    }
}

impl Serialize for Resource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Resource::Namespace(n) => n.serialize(serializer),
            Resource::Controller(c) => c.serialize(serializer),
            Resource::Pod(p) => p.serialize(serializer),
        }
    }
}

// ---- change events ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Initial,
}

/// A single resource change as produced by the store.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChangeEvent {
    pub event_type: EventType,
    pub resource_kind: ResourceKind,
    pub resource: Resource,
}

impl ChangeEvent {
    pub fn new(event_type: EventType, resource: Resource) -> Self {
        Self { event_type, resource_kind: resource.kind(), resource }
    }
}

pub mod prelude {
    pub use super::{
        ChangeEvent, ContainerInfo, ControllerResource, DerivedStatus, EventType, FetchError,
        NamespaceResource, OwnerRef, PodMetrics, PodResource, Replicas, Resource, ResourceKind,
        ResourceRef,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(ns: &str, name: &str) -> ControllerResource {
        ControllerResource {
            reference: ResourceRef::new(ResourceKind::Deployment, ns, name),
            replicas: Replicas { desired: Some(1), ready: 1, available: 1, updated: 1 },
            main_container: None,
            labels: Labels::new(),
        }
    }

    fn pod(ns: &str, name: &str, owner: Option<(&str, &str)>) -> PodResource {
        PodResource {
            reference: ResourceRef::new(ResourceKind::Pod, ns, name),
            phase: "Running".into(),
            owner_ref: owner.map(|(k, n)| OwnerRef { kind: k.into(), name: n.into() }),
            containers: vec![],
            metrics: None,
            started_at: None,
            labels: Labels::new(),
            pod_ip: None,
            host_ip: None,
            terminating: false,
        }
    }

    #[test]
    fn image_tag_takes_text_after_last_colon() {
        assert_eq!(image_tag("nginx:1.25"), "1.25");
        assert_eq!(image_tag("registry-minor:5000/project/postgres:staging-a1dcf6ff"), "staging-a1dcf6ff");
        assert_eq!(image_tag("redis"), "latest");
        assert_eq!(image_tag("registry:5000/app"), "latest");
        assert_eq!(image_tag("app:v2@sha256:abcd"), "v2");
    }

    #[test]
    fn namespace_refs_drop_namespace() {
        let r = ResourceRef::new(ResourceKind::Namespace, "ignored", "prod");
        assert_eq!(r.namespace, "");
        assert_eq!(r.scope(), "prod");
        assert_eq!(r.to_string(), "Namespace/prod");
    }

    #[test]
    fn kind_parses_plural_forms() {
        assert_eq!("pods".parse::<ResourceKind>().ok(), Some(ResourceKind::Pod));
        assert_eq!("StatefulSet".parse::<ResourceKind>().ok(), Some(ResourceKind::StatefulSet));
        assert!("services".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn replicaset_owner_matches_generated_name() {
        let web = deployment("ns", "web");
        assert!(pod("ns", "web-7d9f-abcde", Some(("ReplicaSet", "web-7d9f"))).is_owned_by(&web));
        // a sibling deployment with a longer name must not be matched
        assert!(!pod("ns", "web-api-5c-x", Some(("ReplicaSet", "web-api-5c"))).is_owned_by(&web));
        assert!(!pod("other", "web-7d9f-abcde", Some(("ReplicaSet", "web-7d9f"))).is_owned_by(&web));
    }

    #[test]
    fn ownerless_pods_fall_back_to_pod_name() {
        let web = deployment("ns", "web");
        assert!(pod("ns", "web-7d9f-abcde", None).is_owned_by(&web));
        assert!(!pod("ns", "web-abcde", None).is_owned_by(&web));

        let mut db = deployment("ns", "db");
        db.reference.kind = ResourceKind::StatefulSet;
        assert!(pod("ns", "db-0", None).is_owned_by(&db));
        assert!(pod("ns", "db-1", Some(("StatefulSet", "db"))).is_owned_by(&db));
        assert!(!pod("ns", "db-x", None).is_owned_by(&db));
    }

    #[test]
    fn controller_serializes_derived_status() {
        let mut c = deployment("ns", "web");
        c.replicas.desired = Some(0);
        let v = serde_json::to_value(Resource::Controller(c)).expect("serialize");
        assert_eq!(v["status"], "scaled_zero");
        assert_eq!(v["controller_type"], "deployment");
        assert_eq!(v["kind"], "Deployment");
        assert_eq!(v["namespace"], "ns");
    }

    #[test]
    fn change_event_wire_shape() {
        let ev = ChangeEvent::new(EventType::Initial, Resource::Pod(pod("ns", "p", None)));
        let v = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(v["event_type"], "INITIAL");
        assert_eq!(v["resource_kind"], "Pod");
        assert_eq!(v["resource"]["status"], "running");
    }
}
