#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use dashlite_core::{ContainerInfo, FetchError, PodResource, Resource, ResourceKind, ResourceRef};
use dashlite_kubehub::{spawn_watchers, StaticSource, WatchConfig, WatchEvent, WatchState, WatchStatus};
use dashlite_store::Store;
use tokio_util::sync::CancellationToken;

fn pod(name: &str) -> PodResource {
    PodResource {
        reference: ResourceRef::new(ResourceKind::Pod, "shop", name),
        phase: "Running".into(),
        owner_ref: None,
        containers: vec![ContainerInfo::new("app", "nginx:1.25")],
        metrics: None,
        started_at: None,
        labels: Default::default(),
        pod_ip: None,
        host_ip: None,
        terminating: false,
    }
}

fn cfg() -> WatchConfig {
    WatchConfig { backoff_initial: Duration::from_millis(100), backoff_max: Duration::from_secs(1), max_retries: 2 }
}

fn pod_names(store: &Store) -> Vec<String> {
    store.list(ResourceKind::Pod, None).iter().map(|r| r.name().to_string()).collect()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

fn state(status: &WatchStatus) -> Option<WatchState> {
    status.get(ResourceKind::Pod)
}

#[tokio::test(start_paused = true)]
async fn relist_then_live_events() {
    let src = Arc::new(StaticSource::new());
    src.script_watch(
        ResourceKind::Pod,
        vec![
            Ok(WatchEvent::Restarted(vec![pod("a").into(), pod("b").into()])),
            Ok(WatchEvent::Applied(pod("c").into())),
            Ok(WatchEvent::Deleted(pod("a").into())),
        ],
    );
    src.put_pod(pod("b")).put_pod(pod("c"));
    let store = Arc::new(Store::new());
    let shutdown = CancellationToken::new();
    let (status, handles) = spawn_watchers(src.clone(), store.clone(), cfg(), shutdown.clone());

    wait_until(|| pod_names(&store) == ["b", "c"]).await;
    assert!(store.is_synced(ResourceKind::Pod));

    shutdown.cancel();
    for h in handles {
        let _ = h.await;
    }
    assert_eq!(state(&status), Some(WatchState::Stopped));
}

#[tokio::test(start_paused = true)]
async fn reconnect_relists_and_drops_missed_deletes() {
    let src = Arc::new(StaticSource::new());
    src.script_watch(ResourceKind::Pod, vec![Ok(WatchEvent::Restarted(vec![pod("old").into()]))]);
    src.put_pod(pod("fresh"));
    let store = Arc::new(Store::new());
    let shutdown = CancellationToken::new();
    let (status, _handles) = spawn_watchers(src.clone(), store.clone(), cfg(), shutdown.clone());

    // the scripted session ends; the reconnect relists the fixture contents
    wait_until(|| pod_names(&store) == ["fresh"]).await;
    assert_eq!(src.watch_opens(ResourceKind::Pod), 2);
    assert_eq!(state(&status), Some(WatchState::Live));
    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_retry_budget() {
    let src = Arc::new(StaticSource::new());
    for _ in 0..3 {
        src.script_watch(ResourceKind::Pod, vec![Err(FetchError::Transient("connection reset".into()))]);
    }
    let store = Arc::new(Store::new());
    let shutdown = CancellationToken::new();
    let (status, _handles) = spawn_watchers(src.clone(), store.clone(), cfg(), shutdown.clone());

    wait_until(|| state(&status) == Some(WatchState::Failed)).await;
    assert!(status.any_failed());
    assert_eq!(src.watch_opens(ResourceKind::Pod), 3);
    assert!(!store.is_synced(ResourceKind::Pod));
    // other kinds are unaffected
    assert_eq!(status.get(ResourceKind::Deployment), Some(WatchState::Live));
    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn a_healthy_event_resets_the_budget() {
    let src = Arc::new(StaticSource::new());
    let fail = || -> Vec<Result<WatchEvent, FetchError>> { vec![Err(FetchError::Transient("reset".into()))] };
    src.script_watch(ResourceKind::Pod, fail());
    src.script_watch(ResourceKind::Pod, fail());
    src.script_watch(ResourceKind::Pod, vec![Ok(WatchEvent::Applied(Resource::from(pod("x"))))]);
    src.script_watch(ResourceKind::Pod, fail());
    let store = Arc::new(Store::new());
    let shutdown = CancellationToken::new();
    let (status, _handles) = spawn_watchers(src.clone(), store.clone(), cfg(), shutdown.clone());

    // four scripted sessions, then the default relist stream
    wait_until(|| src.watch_opens(ResourceKind::Pod) == 5 && state(&status) == Some(WatchState::Live)).await;
    assert!(!status.any_failed());
    shutdown.cancel();
}
