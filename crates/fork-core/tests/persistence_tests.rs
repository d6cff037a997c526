//! Message fork persistence and restart tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rvoip_fork_core::{
    BranchHandle, ForkContextConfig, ForkContextListener, ForkError, ForkId, ForkManagerConfig, ForkMessageRecord,
    ForkStore, ForkTimer, InMemoryForkStore, JsonDirForkStore, Method,
};
use uuid::Uuid;

use common::{AOR, Harness, contact, request};

#[derive(Default)]
struct FinishedKeys {
    keys: Mutex<Vec<Vec<String>>>,
}

impl ForkContextListener for FinishedKeys {
    fn on_fork_context_finished(&self, _fork: ForkId, keys: &[String]) {
        self.keys.lock().push(keys.to_vec());
    }
}

fn store_and_forward() -> ForkManagerConfig {
    ForkManagerConfig {
        message: ForkContextConfig::default()
            .with_fork_late(true)
            .with_delivery_timeout(Duration::from_secs(3600)),
        ..Default::default()
    }
}

/// Fork a message, deliver it to one of two devices, restart, then deliver it
/// to the other device after it registers again.
fn restart_round_trip(store: Arc<dyn ForkStore>) {
    let mut before = Harness::new(store_and_forward()).with_store(store.clone());
    let fork = before.fork(
        Method::Message,
        vec![
            contact("<urn:uuid:a>", "10.0.0.1", 1.0),
            contact("<urn:uuid:b>", "10.0.0.2", 1.0),
        ],
    );
    let stored = store.load_all().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(Some(stored[0].0), before.manager.persisted_uuid(fork));
    assert_eq!(stored[0].1.delivered_count, 0);

    before.respond(before.handles(fork)[0], 200);
    let saved = store.find_by_uuid(stored[0].0).unwrap().unwrap();
    assert_eq!(saved.delivered_count, 1);
    assert_eq!(saved.keys, vec![AOR.to_string()]);
    let statuses: Vec<u16> = saved.branches.iter().map(|b| b.status).collect();
    assert_eq!(statuses, vec![200, 0]);
    let exported = before.manager.fork(fork).unwrap().to_record().unwrap();
    assert_eq!(exported, saved);
    // Device b never answered: the fork stays in memory
    assert!(!before.manager.is_offloaded(fork));
    drop(before);

    let mut after = Harness::new(store_and_forward()).with_store(store.clone());
    assert_eq!(after.manager.restore_from_store().unwrap(), 1);
    let restored_id = after.manager.forks_for_key(AOR)[0];
    assert!(after.manager.is_offloaded(restored_id));
    assert!(after.manager.fork(restored_id).is_none());
    assert_eq!(after.manager.persisted_uuid(restored_id), Some(stored[0].0));

    let remaining = after.timers.pending_delay(restored_id, ForkTimer::Late).unwrap();
    assert!(remaining <= Duration::from_secs(3600));
    assert!(remaining > Duration::from_secs(3500));

    // The delivered device is left alone, but its REGISTER loads the fork
    assert!(after
        .manager
        .on_new_register(AOR, &contact("<urn:uuid:a>", "10.0.0.1", 1.0))
        .is_empty());
    let restored = after.manager.fork(restored_id).unwrap();
    assert_eq!(restored.message().unwrap().delivered_count(), 1);
    assert_eq!(restored.current_priority(), 1.0);
    assert_eq!(restored.request(), &request(Method::Message));
    assert_eq!(restored.request().body.as_ref(), b"hello bob");
    assert_eq!(restored.message().unwrap().expiration(), saved.expiration_date);
    assert!(!restored.has_incoming());
    let uids: Vec<&str> = restored.branches().map(|b| b.uid()).collect();
    assert_eq!(uids, vec!["<urn:uuid:a>", "<urn:uuid:b>"]);
    assert_eq!(restored.to_record().unwrap(), saved);

    // The other one gets the message
    let dispatched = after
        .manager
        .on_new_register(AOR, &contact("<urn:uuid:b>", "10.0.0.7", 1.0));
    assert_eq!(dispatched.len(), 1);
    assert_eq!(after.layer.sent_uris(restored_id), vec!["sip:bob@10.0.0.7".to_string()]);

    let (_, branch) = dispatched[0];
    after.respond(BranchHandle { fork: restored_id, branch }, 200);
    // Nothing left to answer upstream after a restart
    assert!(after.layer.upstream().is_empty());
    after.settle();
    assert!(after.manager.is_empty());
    assert!(store.load_all().unwrap().is_empty());
    assert_eq!(after.manager.stats().message.started(), 1);
    assert_eq!(after.manager.stats().message.finished(), 1);
}

#[test]
fn test_restart_round_trip_in_memory() {
    restart_round_trip(Arc::new(InMemoryForkStore::new()));
}

#[test]
fn test_restart_round_trip_json_dir() {
    let dir = tempfile::tempdir().unwrap();
    restart_round_trip(Arc::new(JsonDirForkStore::open(dir.path()).unwrap()));
}

#[test]
fn test_expired_record_finishes_at_restore() {
    let store = Arc::new(InMemoryForkStore::new());
    let mut before = Harness::new(store_and_forward()).with_store(store.clone());
    let fork = before.fork(Method::Message, vec![contact("<urn:uuid:a>", "10.0.0.1", 1.0)]);
    let uuid = before.manager.persisted_uuid(fork).unwrap();
    drop(before);

    let mut record = store.find_by_uuid(uuid).unwrap().unwrap();
    record.expiration_date = Some(Utc::now() - chrono::Duration::seconds(10));
    store.save(uuid, &record).unwrap();

    let finished = Arc::new(FinishedKeys::default());
    let mut after = Harness::new(store_and_forward())
        .with_store(store.clone())
        .with_listener(finished.clone());
    assert_eq!(after.manager.restore_from_store().unwrap(), 1);
    let restored = after.manager.forks_for_key(AOR)[0];
    assert_eq!(
        after.timers.pending_delay(restored, ForkTimer::Late),
        Some(Duration::ZERO)
    );

    // Expires without ever being loaded
    after.settle();
    assert!(after.manager.is_empty());
    assert!(after.manager.forks_for_key(AOR).is_empty());
    assert!(store.is_empty());
    assert_eq!(finished.keys.lock().clone(), vec![vec![AOR.to_string()]]);
    assert_eq!(after.manager.stats().message.started(), 0);
}

#[test]
fn test_finished_and_broken_records_are_dropped() {
    let mut scratch = Harness::new(store_and_forward());
    let fork = scratch.fork(Method::Message, vec![contact("<urn:uuid:a>", "10.0.0.1", 1.0)]);
    let template = scratch.manager.fork(fork).unwrap().to_record().unwrap();

    let store = Arc::new(InMemoryForkStore::new());
    let mut broken = template.clone();
    broken.branches[0].contact = "not a sip uri".to_string();
    let finished = ForkMessageRecord {
        is_finished: true,
        ..template
    };
    store.save(Uuid::new_v4(), &broken).unwrap();
    store.save(Uuid::new_v4(), &finished).unwrap();

    let mut h = Harness::new(store_and_forward()).with_store(store.clone());
    assert_eq!(h.manager.restore_from_store().unwrap(), 0);
    assert!(h.manager.is_empty());
    assert!(store.is_empty());
}

#[test]
fn test_restore_needs_a_store() {
    let mut h = Harness::new(store_and_forward());
    assert!(matches!(
        h.manager.restore_from_store(),
        Err(ForkError::InvalidState(_))
    ));
}

#[test]
fn test_calls_are_never_persisted() {
    let store = Arc::new(InMemoryForkStore::new());
    let config = ForkManagerConfig {
        call: ForkContextConfig::default().with_fork_late(true),
        ..store_and_forward()
    };
    let mut h = Harness::new(config).with_store(store.clone());
    let fork = h.fork(Method::Invite, vec![contact("a", "10.0.0.1", 1.0)]);
    assert!(h.manager.persisted_uuid(fork).is_none());
    assert!(store.is_empty());
}

/// Fork a message to two devices; `a` takes it, `b` is unreachable
fn answered_by_everyone(store: &Arc<InMemoryForkStore>) -> (Harness, ForkId) {
    let mut h = Harness::new(store_and_forward()).with_store(store.clone());
    let fork = h.fork(
        Method::Message,
        vec![
            contact("<urn:uuid:a>", "10.0.0.1", 1.0),
            contact("<urn:uuid:b>", "10.0.0.2", 1.0),
        ],
    );
    let branches = h.handles(fork);
    h.respond(branches[0], 200);
    assert!(!h.manager.is_offloaded(fork));
    h.manager.on_response(branches[1], None);
    (h, fork)
}

#[test]
fn test_answered_message_fork_waits_in_store_for_register() {
    let store = Arc::new(InMemoryForkStore::new());
    let (mut h, fork) = answered_by_everyone(&store);

    assert_eq!(h.layer.upstream_statuses(fork), vec![200]);
    assert!(h.manager.is_offloaded(fork));
    assert!(h.manager.fork(fork).is_none());
    assert_eq!((h.manager.len(), h.manager.offloaded_count()), (1, 1));
    assert!(matches!(h.manager.summary(fork), Err(ForkError::InvalidState(_))));
    assert_eq!(h.manager.forks_for_key(AOR), &[fork]);
    let uuid = h.manager.persisted_uuid(fork).unwrap();
    let stored = store.find_by_uuid(uuid).unwrap().unwrap();
    let statuses: Vec<u16> = stored.branches.iter().map(|b| b.status).collect();
    assert_eq!(statuses, vec![200, 503]);
    // Only the deadline is left armed
    let pending = h.timers.pending_for(fork);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].timer, ForkTimer::Late);
    assert!(pending[0].delay > Duration::from_secs(3500));
    assert_eq!(h.manager.stats().message.finished(), 1);

    // The unreachable device is back on a new address
    let dispatched = h
        .manager
        .on_new_register(AOR, &contact("<urn:uuid:b>", "10.0.0.9", 1.0));
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].0, fork);
    assert!(!h.manager.is_offloaded(fork));
    assert_eq!(
        h.layer.sent_uris(fork).last().map(String::as_str),
        Some("sip:bob@10.0.0.9")
    );
    assert_eq!(h.manager.stats().message.started(), 2);

    h.respond(BranchHandle { fork, branch: dispatched[0].1 }, 200);
    h.settle();
    assert!(h.manager.is_empty());
    assert!(store.is_empty());
    assert_eq!(h.layer.upstream_statuses(fork), vec![200]);
}

#[test]
fn test_delivered_device_sends_loaded_fork_back_to_store() {
    let store = Arc::new(InMemoryForkStore::new());
    let (mut h, fork) = answered_by_everyone(&store);
    assert!(h.manager.is_offloaded(fork));

    assert!(h
        .manager
        .on_new_register(AOR, &contact("<urn:uuid:a>", "10.0.0.1", 1.0))
        .is_empty());
    assert!(h.manager.is_offloaded(fork));
    assert_eq!(h.manager.stats().message.started(), 2);

    // Known to be delivered: not even loaded this time
    assert!(h
        .manager
        .on_new_register(AOR, &contact("<urn:uuid:a>", "10.0.0.1", 1.0))
        .is_empty());
    assert_eq!(h.manager.stats().message.started(), 2);
    assert_eq!(store.len(), 1);
}

#[test]
fn test_deadline_reached_in_store_finishes_the_fork() {
    let store = Arc::new(InMemoryForkStore::new());
    let (mut h, fork) = answered_by_everyone(&store);
    assert!(h.manager.is_offloaded(fork));
    let upstream_before = h.layer.upstream().len();

    assert!(h.fire(fork, ForkTimer::Late));
    assert!(h.manager.is_empty());
    assert!(h.manager.forks_for_key(AOR).is_empty());
    assert!(store.is_empty());
    assert_eq!(h.layer.upstream().len(), upstream_before);
    assert!(h.manager.on_new_register(AOR, &contact("<urn:uuid:b>", "10.0.0.9", 1.0)).is_empty());
}

#[test]
fn test_fork_missing_from_store_is_dropped_on_load() {
    let store = Arc::new(InMemoryForkStore::new());
    let (mut h, fork) = answered_by_everyone(&store);
    let uuid = h.manager.persisted_uuid(fork).unwrap();
    store.delete_by_uuid(uuid).unwrap();

    assert!(h
        .manager
        .on_new_register(AOR, &contact("<urn:uuid:b>", "10.0.0.9", 1.0))
        .is_empty());
    assert!(h.manager.is_empty());
    assert!(h.manager.forks_for_key(AOR).is_empty());
}
