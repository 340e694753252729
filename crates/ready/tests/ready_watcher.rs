#![forbid(unsafe_code)]

use std::time::Duration;

use ces_kubehub::{AccessError, MemoryAccessor, ResourceEvent, WatchStatus};
use ces_ready::{predicates::pod_ready, ReadyConfig, ReadyError, ReadyWatcher, Readiness, WaitTarget};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;

fn pod(name: &str, ready: bool, rv: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some([("dogu.name".to_string(), "ldap".to_string())].into()),
            resource_version: Some(rv.into()),
            ..Default::default()
        },
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: if ready { "True".into() } else { "False".into() },
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn fast() -> ReadyWatcher {
    ReadyWatcher::new(ReadyConfig {
        timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(1),
        backoff_factor: 2.0,
        max_backoff: Duration::from_millis(5),
        max_read_attempts: 4,
        watch_retry_interval: Duration::from_millis(5),
    })
}

fn ldap_pods() -> WaitTarget { WaitTarget::labeled("dogu.name", "ldap") }

fn broken() -> ResourceEvent<Pod> {
    ResourceEvent::Error(WatchStatus { code: 500, reason: "InternalError".into(), message: "connection reset".into() })
}

#[tokio::test]
async fn already_ready_returns_without_watch() {
    let pods = MemoryAccessor::with_objects([pod("ldap-0", true, "10")]);
    fast()
        .wait_until_ready(&CancellationToken::new(), &pods, &ldap_pods(), pod_ready, None)
        .await
        .expect("ready");
    assert!(pods.watch_calls().is_empty());
}

#[tokio::test]
async fn watch_starts_from_observed_version_and_succeeds() {
    let pods = MemoryAccessor::with_objects([pod("ldap-0", false, "10")]);
    pods.push_watch(vec![Ok(ResourceEvent::Modified(pod("ldap-0", false, "11"))), Ok(ResourceEvent::Modified(pod("ldap-0", true, "12")))]);
    let target = WaitTarget::named("ldap-0", "dogu.name");
    fast().wait_until_ready(&CancellationToken::new(), &pods, &target, pod_ready, None).await.expect("ready");
    let calls = pods.watch_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], ("dogu.name=ldap-0".to_string(), "10".to_string()));
}

#[tokio::test]
async fn deleted_event_aborts_even_if_ready() {
    let pods = MemoryAccessor::with_objects([pod("ldap-0", false, "1")]);
    pods.push_watch(vec![Ok(ResourceEvent::Deleted(pod("ldap-0", true, "2")))]);
    let err = fast()
        .wait_until_ready(&CancellationToken::new(), &pods, &ldap_pods(), pod_ready, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReadyError::Deleted { .. }), "{err}");
}

#[tokio::test]
async fn recoverable_error_reopens_watch_from_last_version() {
    let pods = MemoryAccessor::with_objects([pod("ldap-0", false, "1")]);
    pods.push_watch(vec![Ok(ResourceEvent::Bookmark("42".into())), Ok(broken())]);
    pods.push_watch(vec![Ok(ResourceEvent::Modified(pod("ldap-0", true, "43")))]);
    fast().wait_until_ready(&CancellationToken::new(), &pods, &ldap_pods(), pod_ready, None).await.expect("ready");
    let calls = pods.watch_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1, "42");
}

#[tokio::test]
async fn stream_error_and_stream_end_are_recoverable() {
    let pods = MemoryAccessor::with_objects([pod("ldap-0", false, "1")]);
    pods.push_watch(vec![Err(AccessError::Other("reset by peer".into()))]);
    pods.push_watch(vec![]);
    pods.push_watch(vec![Ok(ResourceEvent::Added(pod("ldap-1", true, "5")))]);
    fast().wait_until_ready(&CancellationToken::new(), &pods, &ldap_pods(), pod_ready, None).await.expect("ready");
    assert_eq!(pods.watch_calls().len(), 3);
}

#[tokio::test]
async fn expired_watch_is_fatal() {
    let pods = MemoryAccessor::with_objects([pod("ldap-0", false, "1")]);
    pods.push_watch(vec![Ok(ResourceEvent::Error(WatchStatus {
        code: 410,
        reason: "Expired".into(),
        message: "too old resource version: 1 (300)".into(),
    }))]);
    pods.push_watch(vec![Ok(ResourceEvent::Modified(pod("ldap-0", true, "400")))]);
    let err = fast()
        .wait_until_ready(&CancellationToken::new(), &pods, &ldap_pods(), pod_ready, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReadyError::Expired { .. }), "{err}");
    assert_eq!(pods.watch_calls().len(), 1);
}

#[tokio::test]
async fn not_found_is_retried_on_initial_read() {
    let pods = MemoryAccessor::with_objects([pod("ldap-0", true, "1")]);
    pods.fail_next_get(AccessError::NotFound("pod ldap-0".into()));
    pods.fail_next_get(AccessError::NotFound("pod ldap-0".into()));
    let target = WaitTarget::named("ldap-0", "dogu.name");
    fast().wait_until_ready(&CancellationToken::new(), &pods, &target, pod_ready, None).await.expect("ready");
    assert_eq!(pods.get_calls(), 3);
}

#[tokio::test]
async fn named_not_found_gives_up_after_bounded_attempts() {
    let pods = MemoryAccessor::<Pod>::new();
    let target = WaitTarget::named("ldap-0", "dogu.name");
    let err = fast().wait_until_ready(&CancellationToken::new(), &pods, &target, pod_ready, None).await.unwrap_err();
    assert!(matches!(err, ReadyError::NotFound { attempts: 4, .. }), "{err}");
    assert_eq!(pods.get_calls(), 4);
}

#[tokio::test]
async fn empty_selection_watches_for_the_pod_to_appear() {
    let pods = MemoryAccessor::<Pod>::new();
    pods.push_watch(vec![Ok(ResourceEvent::Added(pod("ldap-0", false, "3"))), Ok(ResourceEvent::Modified(pod("ldap-0", true, "4")))]);
    fast().wait_until_ready(&CancellationToken::new(), &pods, &ldap_pods(), pod_ready, None).await.expect("ready");
    assert_eq!(pods.get_calls(), 1);
    assert_eq!(pods.watch_calls(), vec![("dogu.name=ldap".to_string(), "0".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn empty_selection_waits_for_the_full_timeout() {
    let pods = MemoryAccessor::<Pod>::new();
    let watcher = ReadyWatcher::new(ReadyConfig::default());
    let started = tokio::time::Instant::now();
    let err = watcher.wait_until_ready(&CancellationToken::new(), &pods, &ldap_pods(), pod_ready, None).await.unwrap_err();
    assert!(matches!(err, ReadyError::Timeout { .. }), "{err}");
    assert!(started.elapsed() >= ReadyConfig::default().timeout);
    assert_eq!(pods.get_calls(), 1);
}

#[tokio::test]
async fn other_read_errors_are_fatal_immediately() {
    let pods = MemoryAccessor::with_objects([pod("ldap-0", true, "1")]);
    pods.fail_next_get(AccessError::Other("forbidden".into()));
    let err = fast()
        .wait_until_ready(&CancellationToken::new(), &pods, &ldap_pods(), pod_ready, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReadyError::Read { .. }), "{err}");
    assert_eq!(pods.get_calls(), 1);
}

#[tokio::test]
async fn predicate_failure_stops_the_wait() {
    let pods = MemoryAccessor::with_objects([pod("ldap-0", false, "1")]);
    pods.push_watch(vec![Ok(ResourceEvent::Modified(pod("ldap-0", false, "2")))]);
    let err = fast()
        .wait_until_ready(
            &CancellationToken::new(),
            &pods,
            &ldap_pods(),
            |p: &Pod| match p.metadata.resource_version.as_deref() {
                Some("2") => Readiness::Failed("image pull backoff".into()),
                _ => Readiness::Pending,
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReadyError::Failed { ref reason, .. } if reason == "image pull backoff"), "{err}");
}

#[tokio::test]
async fn per_call_timeout_overrides_default() {
    let pods = MemoryAccessor::with_objects([pod("ldap-0", false, "1")]);
    let started = std::time::Instant::now();
    let err = fast()
        .wait_until_ready(&CancellationToken::new(), &pods, &ldap_pods(), pod_ready, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, ReadyError::Timeout { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn cancellation_unblocks_the_wait() {
    let pods = MemoryAccessor::with_objects([pod("ldap-0", false, "1")]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let err = fast().wait_until_ready(&cancel, &pods, &ldap_pods(), pod_ready, None).await.unwrap_err();
    assert!(matches!(err, ReadyError::Cancelled { .. }), "{err}");
}
