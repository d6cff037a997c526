//! Shared helpers for fork-core integration tests

#![allow(dead_code)]

use std::sync::Arc;

use rvoip_fork_core::message::response;
use rvoip_fork_core::testing::{ManualTimerScheduler, RecordingTransactionLayer};
use rvoip_fork_core::{
    BranchHandle, ContactTarget, ForkContextListener, ForkId, ForkManager, ForkManagerConfig, ForkServices, ForkStore, ForkTimer,
    Method, Request, parse_uri,
};
use rvoip_sip_core::TypedHeader;
use rvoip_sip_core::types::{Address, CSeq, CallId, From, To};

/// Address-of-record every test forks to
pub const AOR: &str = "sip:bob@example.com";

pub struct Harness {
    pub layer: RecordingTransactionLayer,
    pub timers: Arc<ManualTimerScheduler>,
    pub manager: ForkManager,
}

impl Harness {
    pub fn new(config: ForkManagerConfig) -> Self {
        let layer = RecordingTransactionLayer::new();
        let timers = Arc::new(ManualTimerScheduler::new());
        let services = ForkServices::with_seed(Arc::new(layer.clone()), timers.clone(), 7);
        let manager = ForkManager::new(config, services).expect("valid config");
        Self { layer, timers, manager }
    }

    pub fn with_store(mut self, store: Arc<dyn ForkStore>) -> Self {
        self.manager = self.manager.with_store(store);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ForkContextListener>) -> Self {
        self.manager = self.manager.with_listener(listener);
        self
    }

    pub fn fork(&mut self, method: Method, contacts: Vec<ContactTarget>) -> ForkId {
        self.manager.create_fork(request(method), vec![AOR.to_string()], contacts)
    }

    /// Handles of the live branches of `fork`, highest priority first
    pub fn handles(&self, fork: ForkId) -> Vec<BranchHandle> {
        self.manager
            .fork(fork)
            .map(|context| {
                context
                    .branches()
                    .map(|b| BranchHandle { fork, branch: b.id() })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn respond(&mut self, branch: BranchHandle, status: u16) {
        self.manager.on_response(branch, Some(response(status)));
    }

    pub fn fire(&mut self, fork: ForkId, timer: ForkTimer) -> bool {
        self.timers.fire(&mut self.manager, fork, timer)
    }

    /// Deliver pending finish notifications
    pub fn settle(&mut self) -> usize {
        self.timers.run_immediate(&mut self.manager)
    }

    /// Expire every pending timer of every fork, a bounded number of rounds
    pub fn expire_all(&mut self) {
        for _ in 0..16 {
            let pending = self.timers.pending();
            if pending.is_empty() {
                return;
            }
            for armed in pending {
                if let Some(token) = self.timers.take(armed.fork, armed.timer) {
                    self.manager.on_timer(armed.fork, armed.timer, token);
                }
            }
        }
    }
}

pub fn request(method: Method) -> Request {
    let aor = parse_uri(AOR).expect("valid uri");
    let mut from = From::new(Address::new(parse_uri("sip:alice@example.com").expect("valid uri")));
    from.set_tag("alice-1");
    let body: &'static str = if method == Method::Message { "hello bob" } else { "" };
    Request::new(method.clone(), aor.clone())
        .with_header(TypedHeader::From(from))
        .with_header(TypedHeader::To(To::new(Address::new(aor))))
        .with_header(TypedHeader::CallId(CallId::new("fork-test-call")))
        .with_header(TypedHeader::CSeq(CSeq::new(1, method)))
        .with_body(body)
}

pub fn contact(uid: &str, host: &str, priority: f32) -> ContactTarget {
    let uri = parse_uri(&format!("sip:bob@{}", host)).expect("valid uri");
    ContactTarget::new(uid, uri, priority)
}
