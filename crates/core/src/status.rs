use serde::{Deserialize, Serialize};

use crate::{ControllerResource, Resource};

/// Health of a controller derived from its replica counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DerivedStatus {
    Healthy,
    Progressing,
    ScaledZero,
    Error,
}

/// `None` desired means the object is missing its spec: treated as an error.
pub fn derive_status(desired: Option<i32>, ready: i32) -> DerivedStatus {
    match desired {
        None => DerivedStatus::Error,
        Some(0) => DerivedStatus::ScaledZero,
        Some(d) if ready == d => DerivedStatus::Healthy,
        Some(_) => DerivedStatus::Progressing,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PodStatus {
    Running,
    Succeeded,
    Pending,
    Failed,
    Terminating,
    Error,
}

impl PodStatus {
    pub fn from_phase(phase: &str, terminating: bool) -> Self {
        if terminating {
            return PodStatus::Terminating;
        }
        match phase.to_ascii_lowercase().as_str() {
            "running" => PodStatus::Running,
            "succeeded" => PodStatus::Succeeded,
            "pending" => PodStatus::Pending,
            "failed" => PodStatus::Failed,
            _ => PodStatus::Error,
        }
    }
}

/// Namespace-level view over the controllers it contains.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceRollup {
    pub namespace: String,
    pub controllers: u32,
    pub desired: i64,
    pub ready: i64,
    pub status: DerivedStatus,
}

/// Sums replica counts of every controller in `namespace` and classifies the
/// namespace: `healthy` when ready covers desired (with more than one ready
/// pod), `progressing` while `1 < ready < desired`, otherwise `scaled_zero`.
/// Unknown desired counts contribute zero.
pub fn rollup<'a>(namespace: &str, resources: impl IntoIterator<Item = &'a Resource>) -> NamespaceRollup {
    let (mut controllers, mut desired, mut ready) = (0u32, 0i64, 0i64);
    for c in resources.into_iter().filter_map(Resource::as_controller) {
        if c.reference.namespace == namespace {
            controllers += 1;
            desired += i64::from(c.replicas.desired.unwrap_or(0));
            ready += i64::from(c.replicas.ready);
        }
    }
    let status = if desired > 0 && ready > 1 && ready >= desired {
        DerivedStatus::Healthy
    } else if ready > 1 && ready < desired {
        DerivedStatus::Progressing
    } else {
        DerivedStatus::ScaledZero
    };
    NamespaceRollup { namespace: namespace.to_string(), controllers, desired, ready, status }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Labels, Replicas, ResourceKind, ResourceRef};

    fn ctrl(name: &str, desired: Option<i32>, ready: i32) -> Resource {
        Resource::Controller(ControllerResource {
            reference: ResourceRef::new(ResourceKind::Deployment, "ns", name),
            replicas: Replicas { desired, ready, available: ready, updated: ready },
            main_container: None,
            labels: Labels::new(),
        })
    }

    #[test]
    fn status_table() {
        assert_eq!(derive_status(Some(0), 0), DerivedStatus::ScaledZero);
        assert_eq!(derive_status(Some(3), 3), DerivedStatus::Healthy);
        assert_eq!(derive_status(Some(3), 1), DerivedStatus::Progressing);
        assert_eq!(derive_status(Some(1), 0), DerivedStatus::Progressing);
        assert_eq!(derive_status(None, 2), DerivedStatus::Error);
    }

    #[test]
    fn pod_status_prefers_terminating() {
        assert_eq!(PodStatus::from_phase("Running", true), PodStatus::Terminating);
        assert_eq!(PodStatus::from_phase("Pending", false), PodStatus::Pending);
        assert_eq!(PodStatus::from_phase("Unknown", false), PodStatus::Error);
    }

    #[test]
    fn rollup_sums_replicas() {
        let items = vec![ctrl("a", Some(3), 3), ctrl("b", Some(2), 1), ctrl("unknown", None, 0)];
        let r = rollup("ns", &items);
        assert_eq!((r.controllers, r.desired, r.ready), (3, 5, 4));
        assert_eq!(r.status, DerivedStatus::Progressing);

        let healthy = vec![ctrl("a", Some(2), 2), ctrl("b", Some(0), 0)];
        assert_eq!(rollup("ns", &healthy).status, DerivedStatus::Healthy);
    }

    #[test]
    fn rollup_single_ready_pod_is_not_healthy() {
        let items = vec![ctrl("single", Some(1), 1)];
        assert_eq!(rollup("ns", &items).status, DerivedStatus::ScaledZero);
        assert_eq!(rollup("other", &items).controllers, 0);
        assert_eq!(rollup("other", &items).status, DerivedStatus::ScaledZero);
    }
}
