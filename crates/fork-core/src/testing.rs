//! Deterministic collaborator doubles
//!
//! [`RecordingTransactionLayer`] stands in for the transaction layer and keeps
//! everything the engine asked of it: requests sent on branches, CANCELs with
//! their Reason, responses sent upstream. [`ManualTimerScheduler`] never fires
//! on its own; tests take the armed tokens and deliver them to a
//! [`ForkManager`] when they choose to.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rvoip_sip_core::TypedHeader;

use crate::fork::ForkId;
use crate::manager::ForkManager;
use crate::message::{Reason, Request, Response, ResponseExt, response};
use crate::timer::{ForkTimer, TimerScheduler, TimerToken};
use crate::transaction::{BranchHandle, IncomingTransaction, OutgoingTransaction, TransactionLayer};

/// A response sent on an incoming transaction
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    /// Fork the transaction was bound to when the response was sent
    pub fork: Option<ForkId>,
    pub response: Response,
}

#[derive(Debug, Default)]
struct TransactionLog {
    upstream: Vec<UpstreamResponse>,
    sent: Vec<(BranchHandle, Request)>,
    cancels: Vec<(BranchHandle, Option<Reason>)>,
    bound: Vec<ForkId>,
    fail_response_creation: bool,
}

/// Transaction layer that records instead of sending
#[derive(Debug, Clone, Default)]
pub struct RecordingTransactionLayer {
    log: Arc<Mutex<TransactionLog>>,
}

impl RecordingTransactionLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create_response` fail, as when no response object can be built
    pub fn set_fail_response_creation(&self, fail: bool) {
        self.log.lock().fail_response_creation = fail;
    }

    pub fn upstream(&self) -> Vec<UpstreamResponse> {
        self.log.lock().upstream.clone()
    }

    /// Status codes sent upstream for `fork`, in order
    pub fn upstream_statuses(&self, fork: ForkId) -> Vec<u16> {
        self.log
            .lock()
            .upstream
            .iter()
            .filter(|u| u.fork == Some(fork))
            .map(|u| u.response.code())
            .collect()
    }

    /// Final responses sent upstream for `fork`
    pub fn final_responses(&self, fork: ForkId) -> Vec<Response> {
        self.log
            .lock()
            .upstream
            .iter()
            .filter(|u| u.fork == Some(fork) && u.response.is_final())
            .map(|u| u.response.clone())
            .collect()
    }

    pub fn sent(&self) -> Vec<(BranchHandle, Request)> {
        self.log.lock().sent.clone()
    }

    /// Branches of `fork` a request was sent on, in sending order
    pub fn sent_branches(&self, fork: ForkId) -> Vec<BranchHandle> {
        self.log
            .lock()
            .sent
            .iter()
            .filter(|(handle, _)| handle.fork == fork)
            .map(|(handle, _)| *handle)
            .collect()
    }

    /// Destination URIs requests were sent to for `fork`
    pub fn sent_uris(&self, fork: ForkId) -> Vec<String> {
        self.log
            .lock()
            .sent
            .iter()
            .filter(|(handle, _)| handle.fork == fork)
            .map(|(_, request)| request.uri.to_string())
            .collect()
    }

    pub fn cancels(&self) -> Vec<(BranchHandle, Option<Reason>)> {
        self.log.lock().cancels.clone()
    }

    /// How many CANCELs were sent on `branch`
    pub fn cancel_count(&self, branch: BranchHandle) -> usize {
        self.log
            .lock()
            .cancels
            .iter()
            .filter(|(handle, _)| *handle == branch)
            .count()
    }

    pub fn bound_forks(&self) -> Vec<ForkId> {
        self.log.lock().bound.clone()
    }

    pub fn clear(&self) {
        let mut log = self.log.lock();
        log.upstream.clear();
        log.sent.clear();
        log.cancels.clear();
        log.bound.clear();
    }
}

impl TransactionLayer for RecordingTransactionLayer {
    fn create_incoming_transaction(&self, request: &Request) -> Box<dyn IncomingTransaction> {
        Box::new(RecordingIncoming {
            log: self.log.clone(),
            request: request.clone(),
            fork: None,
        })
    }

    fn create_outgoing_transaction(&self, branch: BranchHandle) -> Box<dyn OutgoingTransaction> {
        Box::new(RecordingOutgoing {
            log: self.log.clone(),
            handle: branch,
            branch_id: format!("z9hG4bK-{}-{}", branch.branch.index, branch.branch.generation),
        })
    }
}

struct RecordingIncoming {
    log: Arc<Mutex<TransactionLog>>,
    request: Request,
    fork: Option<ForkId>,
}

/// Dialog headers a response copies from its request
fn is_copied(header: &TypedHeader) -> bool {
    matches!(
        header,
        TypedHeader::Via(_) | TypedHeader::From(_) | TypedHeader::To(_) | TypedHeader::CallId(_) | TypedHeader::CSeq(_)
    )
}

impl IncomingTransaction for RecordingIncoming {
    fn bind_fork(&mut self, fork: ForkId) {
        self.fork = Some(fork);
        self.log.lock().bound.push(fork);
    }

    fn create_response(&self, status: u16, reason_phrase: &str) -> Option<Response> {
        if self.log.lock().fail_response_creation {
            return None;
        }
        let mut created = response(status).with_reason(reason_phrase);
        for header in self.request.headers.iter().filter(|h| is_copied(h)) {
            created = created.with_header(header.clone());
        }
        Some(created)
    }

    fn send_response(&mut self, response: &Response) {
        self.log.lock().upstream.push(UpstreamResponse {
            fork: self.fork,
            response: response.clone(),
        });
    }
}

struct RecordingOutgoing {
    log: Arc<Mutex<TransactionLog>>,
    handle: BranchHandle,
    branch_id: String,
}

impl OutgoingTransaction for RecordingOutgoing {
    fn branch_id(&self) -> &str {
        &self.branch_id
    }

    fn send(&mut self, request: &Request) {
        self.log.lock().sent.push((self.handle, request.clone()));
    }

    fn cancel(&mut self, reason: Option<&Reason>) {
        self.log.lock().cancels.push((self.handle, reason.cloned()));
    }
}

/// A timer armed through [`ManualTimerScheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub fork: ForkId,
    pub timer: ForkTimer,
    pub token: TimerToken,
    pub delay: Duration,
}

#[derive(Debug, Default)]
struct ManualTimers {
    next_token: u64,
    scheduled: Vec<ArmedTimer>,
    cancelled: HashSet<TimerToken>,
    fired: HashSet<TimerToken>,
}

impl ManualTimers {
    fn is_pending(&self, token: TimerToken) -> bool {
        !self.cancelled.contains(&token) && !self.fired.contains(&token)
    }
}

/// Timer scheduler driven by hand
#[derive(Debug, Default)]
pub struct ManualTimerScheduler {
    state: Mutex<ManualTimers>,
}

impl ManualTimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest token armed for `timer` of `fork`, pending or not
    pub fn token_for(&self, fork: ForkId, timer: ForkTimer) -> Option<TimerToken> {
        self.state
            .lock()
            .scheduled
            .iter()
            .rev()
            .find(|t| t.fork == fork && t.timer == timer)
            .map(|t| t.token)
    }

    pub fn is_cancelled(&self, token: TimerToken) -> bool {
        self.state.lock().cancelled.contains(&token)
    }

    /// Timers neither cancelled nor fired yet
    pub fn pending(&self) -> Vec<ArmedTimer> {
        let state = self.state.lock();
        state
            .scheduled
            .iter()
            .filter(|t| state.is_pending(t.token))
            .copied()
            .collect()
    }

    pub fn pending_for(&self, fork: ForkId) -> Vec<ArmedTimer> {
        self.pending().into_iter().filter(|t| t.fork == fork).collect()
    }

    /// Delay of the pending arming of `timer`, if any
    pub fn pending_delay(&self, fork: ForkId, timer: ForkTimer) -> Option<Duration> {
        self.pending()
            .into_iter()
            .rev()
            .find(|t| t.fork == fork && t.timer == timer)
            .map(|t| t.delay)
    }

    /// Mark the pending arming of `timer` as fired and return its token
    pub fn take(&self, fork: ForkId, timer: ForkTimer) -> Option<TimerToken> {
        let mut state = self.state.lock();
        let token = state
            .scheduled
            .iter()
            .rev()
            .find(|t| t.fork == fork && t.timer == timer && state.is_pending(t.token))
            .map(|t| t.token)?;
        state.fired.insert(token);
        Some(token)
    }

    /// Expire the pending arming of `timer` on `manager`. Returns false when
    /// nothing was armed.
    pub fn fire(&self, manager: &mut ForkManager, fork: ForkId, timer: ForkTimer) -> bool {
        match self.take(fork, timer) {
            Some(token) => {
                manager.on_timer(fork, timer, token);
                true
            }
            None => false,
        }
    }

    /// Expire every pending zero-delay timer, including those armed while
    /// doing so. Returns how many fired.
    pub fn run_immediate(&self, manager: &mut ForkManager) -> usize {
        let mut count = 0;
        loop {
            let due: Vec<ArmedTimer> = self
                .pending()
                .into_iter()
                .filter(|t| t.delay.is_zero())
                .collect();
            if due.is_empty() {
                return count;
            }
            for armed in due {
                self.state.lock().fired.insert(armed.token);
                manager.on_timer(armed.fork, armed.timer, armed.token);
                count += 1;
            }
        }
    }
}

impl TimerScheduler for ManualTimerScheduler {
    fn schedule(&self, fork: ForkId, timer: ForkTimer, delay: Duration) -> TimerToken {
        let mut state = self.state.lock();
        state.next_token += 1;
        let token = TimerToken(state.next_token);
        state.scheduled.push(ArmedTimer {
            fork,
            timer,
            token,
            delay,
        });
        token
    }

    fn cancel(&self, token: TimerToken) {
        self.state.lock().cancelled.insert(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchId;
    use crate::message::{Method, call_completed_elsewhere, parse_uri};
    use rvoip_sip_core::types::headers::HeaderName;
    use rvoip_sip_core::types::{Address, CallId, To};

    #[test]
    fn test_created_response_carries_request_dialog_headers() {
        let layer = RecordingTransactionLayer::new();
        let bob = parse_uri("sip:bob@example.com").unwrap();
        let request = Request::new(Method::Invite, bob.clone())
            .with_header(TypedHeader::CallId(CallId::new("abc")))
            .with_header(TypedHeader::To(To::new(Address::new(bob))))
            .with_body("v=0");
        let incoming = layer.create_incoming_transaction(&request);
        let mut response = incoming.create_response(180, "Ringing").unwrap();
        assert_eq!(response.reason_phrase(), "Ringing");
        assert_eq!(response.header(&HeaderName::CallId), request.header(&HeaderName::CallId));
        assert!(response.body.is_empty());
        assert!(response.set_to_tag("xyz"));
        match response.header(&HeaderName::To) {
            Some(TypedHeader::To(to)) => assert_eq!(to.tag(), Some("xyz")),
            other => panic!("unexpected To header {:?}", other),
        }
    }

    #[test]
    fn test_outgoing_records_cancel_reason() {
        let layer = RecordingTransactionLayer::new();
        let handle = BranchHandle {
            fork: ForkId::new(),
            branch: BranchId { index: 2, generation: 1 },
        };
        let mut outgoing = layer.create_outgoing_transaction(handle);
        assert_eq!(outgoing.branch_id(), "z9hG4bK-2-1");
        outgoing.cancel(Some(&call_completed_elsewhere()));
        assert_eq!(layer.cancel_count(handle), 1);
        assert_eq!(layer.cancels()[0].1, Some(call_completed_elsewhere()));
    }

    #[test]
    fn test_take_skips_cancelled_tokens() {
        let scheduler = ManualTimerScheduler::new();
        let fork = ForkId::new();
        let first = scheduler.schedule(fork, ForkTimer::Late, Duration::from_secs(1));
        scheduler.cancel(first);
        assert_eq!(scheduler.take(fork, ForkTimer::Late), None);

        let second = scheduler.schedule(fork, ForkTimer::Late, Duration::from_secs(2));
        assert_eq!(scheduler.pending_delay(fork, ForkTimer::Late), Some(Duration::from_secs(2)));
        assert_eq!(scheduler.take(fork, ForkTimer::Late), Some(second));
        assert!(scheduler.pending().is_empty());
    }
}
