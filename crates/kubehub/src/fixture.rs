//! In-memory cluster used for mock mode and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use dashlite_core::{
    ContainerInfo, ContainerUsage, ControllerResource, FetchError, NamespaceResource, OwnerRef, PodMetrics, PodResource,
    Replicas, Resource, ResourceKind, ResourceRef,
};
use futures::stream::{self, BoxStream, StreamExt};

use crate::{ClusterSource, WatchEvent};

/// Source call names, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Namespaces,
    Deployments,
    StatefulSets,
    Pods,
    Metrics,
}

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, NamespaceResource>,
    controllers: BTreeMap<ResourceRef, ControllerResource>,
    pods: BTreeMap<ResourceRef, PodResource>,
    metrics: HashMap<(String, String), PodMetrics>,
    failures: HashMap<(Op, String), VecDeque<FetchError>>,
    calls: HashMap<(Op, String), usize>,
    watch_scripts: HashMap<ResourceKind, VecDeque<Vec<Result<WatchEvent, FetchError>>>>,
    watch_opens: HashMap<ResourceKind, usize>,
}

/// A [`ClusterSource`] over fixed, mutable fixtures.
///
/// Watches replay the current objects as a relist and then stay open, unless
/// a script was queued with [`StaticSource::script_watch`]; a scripted stream
/// ends after its last item.
#[derive(Default)]
pub struct StaticSource {
    state: Mutex<State>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_namespace(&self, name: &str) -> &Self {
        self.lock().namespaces.insert(
            name.to_string(),
            NamespaceResource { name: name.to_string(), phase: "Active".into(), labels: Default::default(), created_at: None },
        );
        self
    }

    pub fn remove_namespace(&self, name: &str) -> &Self {
        let mut st = self.lock();
        st.namespaces.remove(name);
        st.controllers.retain(|r, _| r.namespace != name);
        st.pods.retain(|r, _| r.namespace != name);
        drop(st);
        self
    }

    pub fn put_controller(&self, c: ControllerResource) -> &Self {
        self.lock().controllers.insert(c.reference.clone(), c);
        self
    }

    pub fn put_pod(&self, p: PodResource) -> &Self {
        self.lock().pods.insert(p.reference.clone(), p);
        self
    }

    pub fn remove(&self, r: &ResourceRef) -> &Self {
        let mut st = self.lock();
        st.controllers.remove(r);
        st.pods.remove(r);
        drop(st);
        self
    }

    pub fn put_metrics(&self, namespace: &str, pod: &str, m: PodMetrics) -> &Self {
        self.lock().metrics.insert((namespace.to_string(), pod.to_string()), m);
        self
    }

    /// Makes the next call of `op` for `namespace` fail with `err`.
    /// Namespace listing uses `""`.
    pub fn fail_next(&self, op: Op, namespace: &str, err: FetchError) -> &Self {
        self.lock().failures.entry((op, namespace.to_string())).or_default().push_back(err);
        self
    }

    pub fn calls(&self, op: Op, namespace: &str) -> usize {
        self.lock().calls.get(&(op, namespace.to_string())).copied().unwrap_or(0)
    }

    /// Queues one watch session for `kind`.
    pub fn script_watch(&self, kind: ResourceKind, items: Vec<Result<WatchEvent, FetchError>>) -> &Self {
        self.lock().watch_scripts.entry(kind).or_default().push_back(items);
        self
    }

    pub fn watch_opens(&self, kind: ResourceKind) -> usize {
        self.lock().watch_opens.get(&kind).copied().unwrap_or(0)
    }

    /// Current objects of `kind` as resources.
    pub fn resources(&self, kind: ResourceKind) -> Vec<Resource> {
        let st = self.lock();
        match kind {
            ResourceKind::Namespace => st.namespaces.values().cloned().map(Resource::from).collect(),
            ResourceKind::Pod => st.pods.values().cloned().map(Resource::from).collect(),
            k => st.controllers.values().filter(|c| c.reference.kind == k).cloned().map(Resource::from).collect(),
        }
    }

    /// A small multi-namespace cluster for mock mode.
    pub fn demo() -> Self {
        let src = Self::new();
        for ns in ["default", "kube-system", "project-app1-staging", "project-app2-prod"] {
            src.put_namespace(ns);
        }
        let deploy = |ns: &str, name: &str, image: &str, desired: i32, ready: i32| ControllerResource {
            reference: ResourceRef::new(ResourceKind::Deployment, ns, name),
            replicas: Replicas { desired: Some(desired), ready, available: ready, updated: ready },
            main_container: Some(ContainerInfo::new(name, image)),
            labels: [("app".to_string(), name.to_string())].into_iter().collect(),
        };
        src.put_controller(deploy("project-app1-staging", "frontend", "registry.local/app1/frontend:1.4.2", 2, 2));
        src.put_controller(deploy("project-app1-staging", "backend", "registry.local/app1/backend:1.4.0", 3, 1));
        src.put_controller(deploy("project-app2-prod", "api", "registry.local/app2/api:2.0.1", 3, 3));
        src.put_controller(deploy("project-app2-prod", "worker", "registry.local/app2/worker:2.0.1", 0, 0));
        src.put_controller(ControllerResource {
            reference: ResourceRef::new(ResourceKind::StatefulSet, "project-app2-prod", "postgres"),
            replicas: Replicas { desired: Some(1), ready: 1, available: 1, updated: 1 },
            main_container: Some(ContainerInfo::new("postgres", "postgres:16.2")),
            labels: [("app".to_string(), "postgres".to_string())].into_iter().collect(),
        });

        let now = Utc::now();
        let pods = [
            ("project-app1-staging", "frontend-6b7c9d-a1b2c", "ReplicaSet", "frontend-6b7c9d", "Running", "registry.local/app1/frontend:1.4.2"),
            ("project-app1-staging", "frontend-6b7c9d-d3e4f", "ReplicaSet", "frontend-6b7c9d", "Running", "registry.local/app1/frontend:1.4.2"),
            ("project-app1-staging", "backend-58f4c-x9y8z", "ReplicaSet", "backend-58f4c", "Running", "registry.local/app1/backend:1.4.0"),
            ("project-app1-staging", "backend-58f4c-q7w6e", "ReplicaSet", "backend-58f4c", "Pending", "registry.local/app1/backend:1.4.0"),
            ("project-app2-prod", "api-7f8e9-k1l2m", "ReplicaSet", "api-7f8e9", "Running", "registry.local/app2/api:2.0.1"),
            ("project-app2-prod", "api-7f8e9-n3o4p", "ReplicaSet", "api-7f8e9", "Running", "registry.local/app2/api:2.0.1"),
            ("project-app2-prod", "api-7f8e9-r5s6t", "ReplicaSet", "api-7f8e9", "Running", "registry.local/app2/api:2.0.1"),
            ("project-app2-prod", "postgres-0", "StatefulSet", "postgres", "Running", "postgres:16.2"),
        ];
        for (i, (ns, name, owner_kind, owner, phase, image)) in pods.into_iter().enumerate() {
            src.put_pod(PodResource {
                reference: ResourceRef::new(ResourceKind::Pod, ns, name),
                phase: phase.into(),
                owner_ref: Some(OwnerRef { kind: owner_kind.into(), name: owner.into() }),
                containers: vec![ContainerInfo::new("app", image)],
                metrics: None,
                started_at: Some(now),
                labels: Default::default(),
                pod_ip: Some(format!("10.0.0.{}", i + 10)),
                host_ip: Some("192.168.0.10".into()),
                terminating: false,
            });
            if phase == "Running" {
                src.put_metrics(
                    ns,
                    name,
                    PodMetrics {
                        containers: vec![ContainerUsage {
                            name: "app".into(),
                            cpu_millicores: Some(50 + 25 * i as u64),
                            memory_mb: Some(128.0 + 32.0 * i as f64),
                        }],
                        timestamp: Some(now),
                    },
                );
            }
        }
        src
    }

    fn call(&self, op: Op, namespace: &str) -> Result<(), FetchError> {
        let mut st = self.lock();
        let key = (op, namespace.to_string());
        *st.calls.entry(key.clone()).or_default() += 1;
        match st.failures.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ClusterSource for StaticSource {
    async fn list_namespaces(&self) -> Result<Vec<NamespaceResource>, FetchError> {
        self.call(Op::Namespaces, "")?;
        Ok(self.lock().namespaces.values().cloned().collect())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<ControllerResource>, FetchError> {
        self.call(Op::Deployments, namespace)?;
        Ok(controllers_in(&self.lock(), ResourceKind::Deployment, namespace))
    }

    async fn list_statefulsets(&self, namespace: &str) -> Result<Vec<ControllerResource>, FetchError> {
        self.call(Op::StatefulSets, namespace)?;
        Ok(controllers_in(&self.lock(), ResourceKind::StatefulSet, namespace))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodResource>, FetchError> {
        self.call(Op::Pods, namespace)?;
        Ok(self.lock().pods.values().filter(|p| p.reference.namespace == namespace).cloned().collect())
    }

    async fn list_pod_metrics(&self, namespace: &str) -> Result<HashMap<String, PodMetrics>, FetchError> {
        self.call(Op::Metrics, namespace)?;
        Ok(self
            .lock()
            .metrics
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, pod), m)| (pod.clone(), m.clone()))
            .collect())
    }

    fn watch(&self, kind: ResourceKind) -> BoxStream<'static, Result<WatchEvent, FetchError>> {
        let scripted = {
            let mut st = self.lock();
            *st.watch_opens.entry(kind).or_default() += 1;
            st.watch_scripts.get_mut(&kind).and_then(VecDeque::pop_front)
        };
        match scripted {
            Some(items) => stream::iter(items).boxed(),
            None => {
                let relist = WatchEvent::Restarted(self.resources(kind));
                stream::iter([Ok(relist)]).chain(stream::pending()).boxed()
            }
        }
    }
}

fn controllers_in(st: &State, kind: ResourceKind, namespace: &str) -> Vec<ControllerResource> {
    st.controllers
        .values()
        .filter(|c| c.reference.kind == kind && c.reference.namespace == namespace)
        .cloned()
        .collect()
}
