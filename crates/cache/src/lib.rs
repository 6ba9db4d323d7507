//! Dashlite TTL cache.
//!
//! Entries expire per category. A miss starts exactly one computation per key;
//! concurrent readers of the same key join it instead of issuing their own
//! upstream call. Failed computations are handed to every waiter and never
//! cached, and an expired value is never served as a fallback.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Resource categories with independently configurable TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheCategory {
    Namespaces,
    Deployments,
    StatefulSets,
    Pods,
    Metrics,
}

impl CacheCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheCategory::Namespaces => "namespaces",
            CacheCategory::Deployments => "deployments",
            CacheCategory::StatefulSets => "statefulsets",
            CacheCategory::Pods => "pods",
            CacheCategory::Metrics => "metrics",
        }
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "namespaces" => Ok(CacheCategory::Namespaces),
            "deployments" => Ok(CacheCategory::Deployments),
            "statefulsets" => Ok(CacheCategory::StatefulSets),
            "pods" => Ok(CacheCategory::Pods),
            "metrics" => Ok(CacheCategory::Metrics),
            other => Err(format!("unknown cache category: {other}")),
        }
    }
}

/// `(category, scope)`; scope is a namespace or `""` for cluster-wide data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub category: CacheCategory,
    pub scope: String,
}

impl CacheKey {
    pub fn new(category: CacheCategory, scope: impl Into<String>) -> Self {
        Self { category, scope: scope.into() }
    }

    pub fn cluster(category: CacheCategory) -> Self {
        Self::new(category, "")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope.is_empty() {
            write!(f, "{}", self.category)
        } else {
            write!(f, "{}:{}", self.category, self.scope)
        }
    }
}

#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub default: Duration,
    pub per_category: HashMap<CacheCategory, Duration>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self { default: Duration::from_secs(30), per_category: HashMap::new() }
    }
}

impl TtlPolicy {
    pub fn new(default: Duration) -> Self {
        Self { default, per_category: HashMap::new() }
    }

    pub fn with(mut self, category: CacheCategory, ttl: Duration) -> Self {
        self.per_category.insert(category, ttl);
        self
    }

    pub fn ttl_for(&self, category: CacheCategory) -> Duration {
        self.per_category.get(&category).copied().unwrap_or(self.default)
    }
}

type Inflight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct Entry<V> {
    value: V,
    computed_at: Instant,
}

struct Slot<V, E> {
    entry: Option<Entry<V>>,
    /// Computation currently filling this slot, tagged with a generation id so
    /// a result is only stored by the computation the slot still expects, and
    /// with its start time, which becomes the entry's age.
    inflight: Option<(u64, Instant, Inflight<V, E>)>,
}

impl<V, E> Slot<V, E> {
    fn empty() -> Self {
        Self { entry: None, inflight: None }
    }
}

pub struct TtlCache<V, E> {
    slots: Mutex<HashMap<CacheKey, Slot<V, E>>>,
    policy: TtlPolicy,
    next_gen: AtomicU64,
}

impl<V, E> TtlCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(policy: TtlPolicy) -> Self {
        Self { slots: Mutex::new(HashMap::new()), policy, next_gen: AtomicU64::new(1) }
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    /// Returns the cached value for `key` if younger than its category TTL,
    /// otherwise computes it (once, shared by concurrent callers).
    pub async fn get_or_compute<F, Fut>(&self, key: &CacheKey, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let ttl = self.policy.ttl_for(key.category);
        self.get_or_compute_with_ttl(key, ttl, compute).await
    }

    pub async fn get_or_compute_with_ttl<F, Fut>(&self, key: &CacheKey, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (gen, fut) = {
            let mut slots = self.lock();
            let slot = slots.entry(key.clone()).or_insert_with(Slot::empty);
            if let Some(entry) = &slot.entry {
                if entry.computed_at.elapsed() < ttl {
                    counter!("cache_hits_total", 1u64, "category" => key.category.as_str());
                    return Ok(entry.value.clone());
                }
            }
            counter!("cache_misses_total", 1u64, "category" => key.category.as_str());
            match &slot.inflight {
                Some((gen, _, fut)) => {
                    debug!(key = %key, "cache: joining in-flight compute");
                    (*gen, fut.clone())
                }
                None => {
                    let gen = self.next_gen.fetch_add(1, Ordering::Relaxed);
                    let fut = compute().boxed().shared();
                    slot.inflight = Some((gen, Instant::now(), fut.clone()));
                    debug!(key = %key, gen, "cache: compute started");
                    (gen, fut)
                }
            }
        };

        let result = fut.await;

        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(key) {
            let started = match &slot.inflight {
                Some((current, started, _)) if *current == gen => Some(*started),
                _ => None,
            };
            if let Some(started) = started {
                slot.inflight = None;
                slot.entry = match &result {
                    Ok(value) => Some(Entry { value: value.clone(), computed_at: started }),
                    Err(_) => None,
                };
            }
            if slot.entry.is_none() && slot.inflight.is_none() {
                slots.remove(key);
            }
        }
        result
    }

    /// Drops one key. A computation already running for it still answers its
    /// waiters but its result is not stored.
    pub fn invalidate(&self, key: &CacheKey) {
        self.lock().remove(key);
    }

    pub fn invalidate_prefix(&self, category: CacheCategory) {
        self.lock().retain(|k, _| k.category != category);
    }

    pub fn invalidate_all(&self) {
        let mut slots = self.lock();
        let n = slots.len();
        slots.clear();
        debug!(entries = n, "cache: cleared");
    }

    /// Number of keys holding a value or a running computation.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot<V, E>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_falls_back_to_default() {
        let p = TtlPolicy::new(Duration::from_secs(30)).with(CacheCategory::Metrics, Duration::from_secs(5));
        assert_eq!(p.ttl_for(CacheCategory::Metrics), Duration::from_secs(5));
        assert_eq!(p.ttl_for(CacheCategory::Pods), Duration::from_secs(30));
    }

    #[test]
    fn category_names_round_trip() {
        for c in [
            CacheCategory::Namespaces,
            CacheCategory::Deployments,
            CacheCategory::StatefulSets,
            CacheCategory::Pods,
            CacheCategory::Metrics,
        ] {
            assert_eq!(c.as_str().parse::<CacheCategory>(), Ok(c));
        }
        assert_eq!(CacheKey::new(CacheCategory::Pods, "ns").to_string(), "pods:ns");
        assert_eq!(CacheKey::cluster(CacheCategory::Namespaces).to_string(), "namespaces");
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_prefix_only_drops_category() {
        let cache: TtlCache<u32, String> = TtlCache::new(TtlPolicy::default());
        let pods = CacheKey::new(CacheCategory::Pods, "a");
        let deploys = CacheKey::new(CacheCategory::Deployments, "a");
        cache.get_or_compute(&pods, || async { Ok(1) }).await.unwrap();
        cache.get_or_compute(&deploys, || async { Ok(2) }).await.unwrap();
        cache.invalidate_prefix(CacheCategory::Pods);
        assert_eq!(cache.len(), 1);
        let v = cache.get_or_compute(&deploys, || async { Ok(99) }).await.unwrap();
        assert_eq!(v, 2);
    }
}
