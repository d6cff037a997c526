//! Event loop tests on a paused tokio clock

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rvoip_fork_core::testing::RecordingTransactionLayer;
use rvoip_fork_core::{
    ForkContextConfig, ForkContextListener, ForkError, ForkId, ForkManagerConfig, ForkRuntime, ForkRuntimeHandle,
    InMemoryForkStore, Method, Response,
};
use tokio::task::JoinHandle;

use common::{AOR, contact, request};

#[derive(Default)]
struct FinishedLog {
    forks: Mutex<Vec<(ForkId, Vec<String>)>>,
}

impl ForkContextListener for FinishedLog {
    fn on_fork_context_finished(&self, fork: ForkId, keys: &[String]) {
        self.forks.lock().push((fork, keys.to_vec()));
    }
}

fn start(config: ForkManagerConfig) -> (RecordingTransactionLayer, Arc<FinishedLog>, ForkRuntimeHandle, JoinHandle<()>) {
    let layer = RecordingTransactionLayer::new();
    let finished = Arc::new(FinishedLog::default());
    let runtime = ForkRuntime::new(config, Arc::new(layer.clone()))
        .unwrap()
        .with_listener(finished.clone());
    let handle = runtime.handle();
    let join = runtime.spawn();
    (layer, finished, handle, join)
}

fn response(status: u16) -> Option<Response> {
    Some(rvoip_fork_core::message::response(status))
}

#[tokio::test(start_paused = true)]
async fn test_call_answered_through_the_loop() {
    let (layer, finished, handle, _join) = start(ForkManagerConfig::default());
    let fork = handle
        .fork(
            request(Method::Invite),
            vec![AOR.to_string()],
            vec![contact("a", "10.0.0.1", 1.0), contact("b", "10.0.0.2", 1.0)],
        )
        .await
        .unwrap();

    let branches = layer.sent_branches(fork);
    assert_eq!(branches.len(), 2);
    let summary = handle.summary(fork).await.unwrap();
    assert_eq!(summary.branches.len(), 2);
    assert!(!summary.finished);

    handle.response(branches[1], response(180)).unwrap();
    handle.response(branches[1], response(200)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(layer.upstream_statuses(fork), vec![180, 200]);
    assert_eq!(layer.cancel_count(branches[0]), 1);
    assert_eq!(finished.forks.lock().clone(), vec![(fork, vec![AOR.to_string()])]);
    assert!(matches!(handle.summary(fork).await, Err(ForkError::ForkNotFound(id)) if id == fork));

    let stats = handle.stats().await.unwrap();
    let calls = stats.iter().find(|s| s.name == "count-call-forks").unwrap();
    assert_eq!((calls.started, calls.finished), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn test_urgent_error_waits_for_its_timer() {
    let (layer, _finished, handle, _join) = start(ForkManagerConfig::default());
    let fork = handle
        .fork(
            request(Method::Invite),
            vec![AOR.to_string()],
            vec![contact("a", "10.0.0.1", 1.0), contact("b", "10.0.0.2", 1.0)],
        )
        .await
        .unwrap();
    let branches = layer.sent_branches(fork);

    handle.response(branches[0], response(488)).unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(layer.upstream_statuses(fork).is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(layer.upstream_statuses(fork), vec![488]);
}

#[tokio::test(start_paused = true)]
async fn test_stale_timer_is_ignored_after_finish() {
    let (layer, _finished, handle, _join) = start(ForkManagerConfig::default());
    let fork = handle
        .fork(request(Method::Options), vec![AOR.to_string()], vec![contact("a", "10.0.0.1", 1.0)])
        .await
        .unwrap();
    let branches = layer.sent_branches(fork);

    // Answered well before the decision timer; its expiry must not answer again
    handle.response(branches[0], response(200)).unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(layer.upstream_statuses(fork), vec![200]);
}

#[tokio::test(start_paused = true)]
async fn test_register_reaches_fork_late_call() {
    let config = ForkManagerConfig {
        call: rvoip_fork_core::ForkContextConfig::default().with_fork_late(true),
        ..Default::default()
    };
    let (layer, _finished, handle, _join) = start(config);
    let fork = handle
        .fork(request(Method::Invite), vec![AOR.to_string()], vec![contact("a", "10.0.0.1", 1.0)])
        .await
        .unwrap();

    handle.new_register(AOR, contact("b", "10.0.0.2", 1.0)).unwrap();
    let summary = handle.summary(fork).await.unwrap();
    assert_eq!(summary.branches.len(), 2);
    assert_eq!(layer.sent_branches(fork).len(), 2);

    // Nobody answers before the delivery deadline
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(layer.upstream_statuses(fork), vec![408]);
    assert!(handle.summary(fork).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_handle_fails_after_shutdown() {
    let (_layer, _finished, handle, join) = start(ForkManagerConfig::default());
    handle.shutdown().unwrap();
    join.await.unwrap();

    assert!(matches!(handle.shutdown(), Err(ForkError::RuntimeStopped)));
    assert!(matches!(handle.stats().await, Err(ForkError::RuntimeStopped)));
}

/// Poll `check` on a running clock until it holds
async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_message_fork_round_trips_through_the_store_writer() {
    let config = ForkManagerConfig {
        message: ForkContextConfig::default()
            .with_fork_late(true)
            .with_delivery_timeout(Duration::from_secs(3600)),
        ..Default::default()
    };
    let layer = RecordingTransactionLayer::new();
    let store = Arc::new(InMemoryForkStore::new());
    let runtime = ForkRuntime::new(config, Arc::new(layer.clone()))
        .unwrap()
        .with_store(store.clone());
    let handle = runtime.handle();
    let _join = runtime.spawn();

    let fork = handle
        .fork(
            request(Method::Message),
            vec![AOR.to_string()],
            vec![contact("<urn:uuid:a>", "10.0.0.1", 1.0), contact("<urn:uuid:b>", "10.0.0.2", 1.0)],
        )
        .await
        .unwrap();
    wait_for(|| store.len() == 1).await;

    let branches = layer.sent_branches(fork);
    handle.response(branches[0], response(200)).unwrap();
    handle.response(branches[1], None).unwrap();
    let mut offloaded = false;
    for _ in 0..400 {
        if matches!(handle.summary(fork).await, Err(ForkError::InvalidState(_))) {
            offloaded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(offloaded, "answered fork never left memory");

    handle.new_register(AOR, contact("<urn:uuid:b>", "10.0.0.9", 1.0)).unwrap();
    wait_for(|| layer.sent_branches(fork).len() == 3).await;
    assert_eq!(
        layer.sent_uris(fork).last().map(String::as_str),
        Some("sip:bob@10.0.0.9")
    );

    let retry = layer.sent_branches(fork)[2];
    handle.response(retry, response(200)).unwrap();
    wait_for(|| store.is_empty()).await;
    assert!(matches!(handle.summary(fork).await, Err(ForkError::ForkNotFound(_))));
    assert_eq!(layer.upstream_statuses(fork), vec![200]);
}
