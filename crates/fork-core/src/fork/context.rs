//! Shared fork context algorithms
//!
//! [`ForkCore`] holds the state every fork kind shares and implements the base
//! algorithms: branch creation and priority ordering, tier dispatch, the
//! REGISTER dispatch rules, best branch selection and the finish sequence.
//! [`ForkContext`] pairs a core with its [`ForkKind`] policy and routes every
//! event to the policy of that kind.

use std::cmp::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::branch::{BranchArena, BranchId, BranchInfo, ContactTarget};
use crate::config::ForkContextConfig;
use crate::message::{Request, Response, ResponseExt, Uri, UriExt};
use crate::stats::StatPair;
use crate::timer::{ForkTimer, ForkTimers, TimerToken};
use crate::transaction::{BranchHandle, IncomingTransaction};

use super::{
    BasicFork, CallFork, ForkContextListener, ForkId, ForkServices, ForkType, MessageFork,
    URGENT_CODES, UrgentCodes,
};

/// `current_priority` before the first tier is started
pub(crate) const NO_PRIORITY: f32 = -1.0;

/// Per-kind policy state
#[derive(Debug)]
pub enum ForkKind {
    Call(CallFork),
    Message(MessageFork),
    Basic(BasicFork),
}

impl ForkKind {
    pub fn fork_type(&self) -> ForkType {
        match self {
            ForkKind::Call(_) => ForkType::Call,
            ForkKind::Message(_) => ForkType::Message,
            ForkKind::Basic(_) => ForkType::Basic,
        }
    }
}

/// Result of delivering a timer expiry to a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The token is not the current arming of that timer
    Stale,
    Handled,
    /// The finish notification went out; the context can be dropped
    Finished,
}

/// What a policy decided about a REGISTER for a pending fork
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegisterAction {
    Ignore,
    Dispatch,
    /// Dispatch, then cancel the new branch right away
    DispatchThenCancel,
}

/// State and algorithms shared by all fork kinds
pub(crate) struct ForkCore {
    pub(crate) id: ForkId,
    pub(crate) fork_type: ForkType,
    pub(crate) config: Arc<ForkContextConfig>,
    pub(crate) services: ForkServices,
    pub(crate) request: Request,
    pub(crate) incoming: Option<Box<dyn IncomingTransaction>>,
    pub(crate) branches: BranchArena,
    /// Every live branch, sorted by descending priority
    pub(crate) waiting: Vec<BranchId>,
    /// Branches of the tier being attempted
    pub(crate) current: Vec<BranchId>,
    pub(crate) current_priority: f32,
    pub(crate) finished: bool,
    finish_notified: bool,
    /// Whether forwarding a final response finishes the fork
    pub(crate) finish_on_final: bool,
    pub(crate) last_response: Option<Response>,
    pub(crate) keys: Vec<String>,
    pub(crate) timers: ForkTimers,
    listener: Option<Weak<dyn ForkContextListener>>,
    stat_counter: Option<Weak<StatPair>>,
}

impl ForkCore {
    pub(crate) fn new(
        id: ForkId,
        fork_type: ForkType,
        request: Request,
        config: Arc<ForkContextConfig>,
        services: ForkServices,
        incoming: Option<Box<dyn IncomingTransaction>>,
    ) -> Self {
        let finish_on_final = match fork_type {
            ForkType::Basic => true,
            ForkType::Call | ForkType::Message => !config.fork_late,
        };
        let timers = ForkTimers::new(id, services.timers.clone());
        Self {
            id,
            fork_type,
            config,
            services,
            request,
            incoming,
            branches: BranchArena::new(),
            waiting: Vec::new(),
            current: Vec::new(),
            current_priority: NO_PRIORITY,
            finished: false,
            finish_notified: false,
            finish_on_final,
            last_response: None,
            keys: Vec::new(),
            timers,
            listener: None,
            stat_counter: None,
        }
    }

    pub(crate) fn branch(&self, id: BranchId) -> Option<&BranchInfo> {
        self.branches.get(id)
    }

    pub(crate) fn branch_status(&self, id: BranchId) -> u16 {
        self.branches.get(id).map_or(0, |b| b.status)
    }

    /// Live branches in priority order
    pub(crate) fn iter_branches(&self) -> impl Iterator<Item = &BranchInfo> + '_ {
        self.waiting.iter().filter_map(move |id| self.branches.get(*id))
    }

    pub(crate) fn find_branch_by_uid(&self, uid: &str) -> Option<BranchId> {
        if uid.is_empty() {
            return None;
        }
        self.iter_branches().find(|b| b.uid == uid).map(|b| b.id())
    }

    pub(crate) fn find_branch_by_dest(&self, dest: &Uri) -> Option<BranchId> {
        self.iter_branches()
            .find(|b| b.request.uri.same_destination(dest))
            .map(|b| b.id())
    }

    /// Create a branch and insert it, without queueing it for dispatch
    pub(crate) fn create_branch(&mut self, request: Request, contact: ContactTarget) -> BranchId {
        // A finally answered branch of the same device is superseded
        let old_id = self.find_branch_by_uid(&contact.uid);
        let mut superseded = None;
        if let Some(old_id) = old_id {
            if self.branch_status(old_id) >= 200 {
                superseded = self.remove_branch(old_id);
            }
        }

        let id = self.branches.next_id();
        let transaction = self
            .services
            .transactions
            .create_outgoing_transaction(BranchHandle { fork: self.id, branch: id });

        if self.waiting.is_empty() {
            if let Some(incoming) = self.incoming.as_mut() {
                incoming.bind_fork(self.id);
            }
        }

        let mut branch = BranchInfo::new(id, request, contact, Some(transaction));
        match superseded.as_mut() {
            Some(old) => {
                debug!(
                    "ForkContext [{}]: new fork branch {} clears out old branch {}",
                    self.id,
                    id,
                    old.id()
                );
                branch.inherit_from(old);
            }
            None => {
                if let Some(old) = old_id.and_then(|old_id| self.branches.get_mut(old_id)) {
                    branch.inherit_from(old);
                }
            }
        }

        self.branches.insert_with(|_| branch)
    }

    /// Queue a created branch by priority, dispatching it right away when it
    /// belongs to a tier that was already started
    pub(crate) fn enqueue_branch(&mut self, id: BranchId) {
        let Some(priority) = self.branches.get(id).map(|b| b.priority) else {
            return;
        };
        self.waiting.push(id);
        let branches = &self.branches;
        let priority_of = |id: &BranchId| branches.get(*id).map_or(f32::MIN, |b| b.priority);
        self.waiting
            .sort_by(|a, b| priority_of(b).partial_cmp(&priority_of(a)).unwrap_or(Ordering::Equal));

        if self.current_priority != NO_PRIORITY && self.current_priority <= priority {
            self.current.push(id);
            self.dispatch(id);
        }
        debug!("ForkContext [{}]: new fork branch {}", self.id, id);
    }

    /// Inject the branch request into its transaction
    pub(crate) fn dispatch(&mut self, id: BranchId) {
        let Some(branch) = self.branches.get_mut(id) else {
            return;
        };
        match branch.transaction.as_mut() {
            Some(transaction) => {
                debug!(
                    "ForkContext [{}]: sending {} to {} ({})",
                    self.id,
                    branch.request.method,
                    branch.request.uri,
                    transaction.branch_id()
                );
                transaction.send(&branch.request);
            }
            None => warn!(
                "ForkContext [{}]: {} has no transaction, request not sent",
                self.id, id
            ),
        }
    }

    pub(crate) fn remove_branch(&mut self, id: BranchId) -> Option<BranchInfo> {
        self.waiting.retain(|b| *b != id);
        self.current.retain(|b| *b != id);
        let removed = self.branches.remove(id);
        if removed.is_some() {
            debug!("ForkContext [{}]: {} removed", self.id, id);
        }
        removed
    }

    pub(crate) fn should_dispatch(&self, dest: &Uri, uid: &str) -> (bool, Option<BranchId>) {
        if let Some(target_gr) = self.request.uri.param("gr") {
            if !target_gr.is_empty() && !uid.contains(target_gr.as_str()) {
                debug!(
                    "ForkContext [{}]: request targets GRUU {}, ignoring instance {}",
                    self.id, target_gr, uid
                );
                return (false, None);
            }
        }

        let by_uid = self.find_branch_by_uid(uid);
        let by_dest = self.find_branch_by_dest(dest);
        if let Some(existing) = by_uid {
            let code = self.branch_status(existing);
            if code == 503 || code == 408 {
                debug!(
                    "ForkContext [{}]: instance failed to receive the request previously",
                    self.id
                );
                return (true, Some(existing));
            } else if code >= 200 {
                debug!("ForkContext [{}]: instance has already answered the request", self.id);
                return (false, None);
            } else if by_dest.is_none() {
                debug!("ForkContext [{}]: instance reconnected", self.id);
                return (true, Some(existing));
            }
        }
        if by_dest.is_some() {
            debug!("ForkContext [{}]: pending transaction for this destination", self.id);
            return (false, None);
        }
        (true, None)
    }

    pub(crate) fn start(&mut self) {
        if self.finished {
            error!("ForkContext [{}]: start() called on a finished fork, ignoring", self.id);
            return;
        }
        self.timers.reset(ForkTimer::NextBranches);
        self.next_branches();
        debug!(
            "ForkContext [{}]: started forking branches with priority {}",
            self.id, self.current_priority
        );

        for id in self.current.clone() {
            self.dispatch(id);
        }

        if !self.config.current_branches_timeout.is_zero() && self.has_next_branches() {
            self.timers
                .set(ForkTimer::NextBranches, self.config.current_branches_timeout);
        }
    }

    fn next_branches(&mut self) {
        self.current.clear();
        let next = if self.current_priority == NO_PRIORITY {
            self.iter_branches().next().map(|b| b.priority)
        } else {
            self.iter_branches()
                .find(|b| b.priority < self.current_priority)
                .map(|b| b.priority)
        };
        if let Some(priority) = next {
            self.current_priority = priority;
        }

        let tier = self.current_priority;
        self.current = self
            .iter_branches()
            .filter(|b| b.priority == tier)
            .map(|b| b.id())
            .collect();
    }

    pub(crate) fn has_next_branches(&self) -> bool {
        !self.finished
            && ((self.current_priority == NO_PRIORITY && !self.waiting.is_empty())
                || self.iter_branches().any(|b| b.priority < self.current_priority))
    }

    pub(crate) fn on_next_branches(&mut self) {
        if self.has_next_branches() {
            self.start();
        }
    }

    /// Every branch has a final status. With `ignore_errors`, 503 and 408
    /// do not count as final.
    pub(crate) fn all_branches_answered(&self, ignore_errors: bool) -> bool {
        self.iter_branches().all(|b| is_answered(b.status, ignore_errors))
    }

    pub(crate) fn all_current_branches_answered(&self, ignore_errors: bool) -> bool {
        self.current
            .iter()
            .filter_map(|id| self.branches.get(*id))
            .all(|b| is_answered(b.status, ignore_errors))
    }

    pub(crate) fn find_best_branch(
        &self,
        urgent: Option<UrgentCodes<'_>>,
        avoid_503_and_408: bool,
    ) -> Option<BranchId> {
        if avoid_503_and_408 {
            self.best_branch_pass(urgent, true)
                .or_else(|| self.best_branch_pass(urgent, false))
        } else {
            self.best_branch_pass(urgent, false)
        }
    }

    fn best_branch_pass(&self, urgent: Option<UrgentCodes<'_>>, ignore_503_and_408: bool) -> Option<BranchId> {
        let considered = |code: u16| code >= 200 && !(ignore_503_and_408 && (code == 503 || code == 408));

        let mut best: Option<&BranchInfo> = None;
        for branch in self.iter_branches().filter(|b| considered(b.status)) {
            match best {
                Some(current) if branch.status / 100 >= current.status / 100 => {}
                _ => best = Some(branch),
            }
        }
        let best = best?;

        if let Some(urgent) = urgent {
            if let Some(urgent_branch) = self
                .iter_branches()
                .find(|b| considered(b.status) && urgent.contains(b.status))
            {
                return Some(urgent_branch.id());
            }
        }
        Some(best.id())
    }

    pub(crate) fn notify_branch_completed(&self, id: BranchId) {
        if let Some(branch) = self.branches.get(id) {
            if branch.status >= 200 {
                branch.notify_completed();
            }
        }
    }

    /// Forward the last response received on a branch
    pub(crate) fn forward_branch_response(&mut self, id: BranchId) -> Option<Response> {
        let branch = self.branches.get(id)?;
        let Some(response) = branch.last_response.clone() else {
            error!(
                "ForkContext [{}]: forward_branch_response(): no response received on {}",
                self.id, id
            );
            return None;
        };
        if self.incoming.is_none() {
            return None;
        }

        let code = response.code();
        let sent = self.forward_response(response);
        if code >= 200 {
            if let Some(branch) = self.branches.get_mut(id) {
                branch.transaction = None;
            }
        }
        sent
    }

    /// Send a response upstream. A final response releases the incoming
    /// transaction, so at most one final response is ever sent.
    pub(crate) fn forward_response(&mut self, response: Response) -> Option<Response> {
        let incoming = self.incoming.as_mut()?;
        incoming.send_response(&response);
        debug!(
            "ForkContext [{}]: forwarded {} {}",
            self.id,
            response.code(),
            response.reason_phrase()
        );

        let code = response.code();
        self.last_response = Some(response.clone());
        if code >= 200 {
            self.incoming = None;
            if self.finish_on_final {
                self.set_finished();
            }
        }
        Some(response)
    }

    pub(crate) fn forward_custom_response(&mut self, status: u16, phrase: &str) -> Option<Response> {
        let Some(incoming) = self.incoming.as_ref() else {
            error!(
                "ForkContext [{}]: cannot forward SIP response [{} {}]: no incoming transaction",
                self.id, status, phrase
            );
            return None;
        };
        match incoming.create_response(status, phrase) {
            Some(response) => self.forward_response(response),
            None => {
                error!(
                    "ForkContext [{}]: response could not be created, finishing without forwarding any response",
                    self.id
                );
                self.set_finished();
                None
            }
        }
    }

    pub(crate) fn last_response_code(&self) -> u16 {
        self.last_response.as_ref().map_or(0, |r| r.code())
    }

    /// Start the next tier once every branch of the current one answered.
    /// Returns whether a tier was started.
    pub(crate) fn advance_tier(&mut self) -> bool {
        if self.current_priority == NO_PRIORITY
            || !self.all_current_branches_answered(false)
            || !self.has_next_branches()
        {
            return false;
        }
        debug!(
            "ForkContext [{}]: tier {} fully answered, starting the next one",
            self.id, self.current_priority
        );
        self.start();
        true
    }

    pub(crate) fn check_finished(&mut self) {
        if self.incoming.is_none() && !self.config.fork_late {
            self.set_finished();
            return;
        }
        if self.advance_tier() {
            return;
        }

        let terminated = if self.config.fork_late {
            !self.iter_branches().any(|b| b.needs_delivery())
        } else {
            self.all_branches_answered(false)
        };
        if terminated {
            if let Some(best) = self.find_best_branch(Some(UrgentCodes::Only(URGENT_CODES)), false) {
                self.forward_branch_response(best);
            }
            self.set_finished();
        }
    }

    /// Mark the fork finished. The listener is notified by a zero-delay timer.
    pub(crate) fn set_finished(&mut self) {
        if self.finish_notified || self.timers.is_running(ForkTimer::Finish) {
            return;
        }
        self.finished = true;
        self.timers.reset(ForkTimer::Late);
        self.timers.reset(ForkTimer::NextBranches);
        self.timers.set(ForkTimer::Finish, Duration::ZERO);
    }

    fn on_finished(&mut self) {
        self.finish_notified = true;
        info!("ForkContext [{}]: {} finished", self.id, self.fork_type);
        match self.listener.as_ref().and_then(Weak::upgrade) {
            Some(listener) => listener.on_fork_context_finished(self.id, &self.keys),
            None => error!("ForkContext [{}]: no listener to notify of the end of the fork", self.id),
        }
    }
}

impl Drop for ForkCore {
    fn drop(&mut self) {
        if let Some(counter) = &self.stat_counter {
            match counter.upgrade() {
                Some(counter) => counter.incr_finish(),
                None => error!("ForkContext [{}]: stat counter dropped before the fork", self.id),
            }
        }
    }
}

fn is_answered(code: u16, ignore_errors: bool) -> bool {
    code >= 200 && !(ignore_errors && (code == 503 || code == 408))
}

/// One request's fan-out session
#[derive(Debug)]
pub struct ForkContext {
    pub(crate) core: ForkCore,
    pub(crate) kind: ForkKind,
}

impl ForkContext {
    /// New context for `request`. A fork-late context arms its delivery
    /// deadline right away.
    pub fn new(
        fork_type: ForkType,
        request: Request,
        config: Arc<ForkContextConfig>,
        services: ForkServices,
    ) -> Self {
        let incoming = services.transactions.create_incoming_transaction(&request);
        let mut core = ForkCore::new(ForkId::new(), fork_type, request, config, services, Some(incoming));
        if core.config.fork_late {
            let deadline = core.config.delivery_timeout;
            core.timers.set(ForkTimer::Late, deadline);
        }
        let kind = match fork_type {
            ForkType::Call => ForkKind::Call(CallFork::new()),
            ForkType::Message => ForkKind::Message(MessageFork::new(&mut core)),
            ForkType::Basic => ForkKind::Basic(BasicFork::new(&mut core)),
        };
        debug!("New {} [{}]", fork_type, core.id);
        Self { core, kind }
    }

    pub fn with_listener(mut self, listener: Weak<dyn ForkContextListener>) -> Self {
        self.core.listener = Some(listener);
        self
    }

    /// Count this context in `counter` for its whole lifetime
    pub fn with_stat_counter(mut self, counter: &Arc<StatPair>) -> Self {
        counter.incr_start();
        self.core.stat_counter = Some(Arc::downgrade(counter));
        self
    }

    pub fn id(&self) -> ForkId {
        self.core.id
    }

    pub fn fork_type(&self) -> ForkType {
        self.core.fork_type
    }

    pub fn kind(&self) -> &ForkKind {
        &self.kind
    }

    pub fn config(&self) -> &ForkContextConfig {
        &self.core.config
    }

    pub fn request(&self) -> &Request {
        &self.core.request
    }

    pub fn is_finished(&self) -> bool {
        self.core.finished
    }

    pub fn has_incoming(&self) -> bool {
        self.core.incoming.is_some()
    }

    pub fn keys(&self) -> &[String] {
        &self.core.keys
    }

    pub fn add_key(&mut self, key: impl Into<String>) {
        self.core.keys.push(key.into());
    }

    pub fn branch(&self, id: BranchId) -> Option<&BranchInfo> {
        self.core.branch(id)
    }

    pub fn branch_mut(&mut self, id: BranchId) -> Option<&mut BranchInfo> {
        self.core.branches.get_mut(id)
    }

    /// Live branches, highest priority first
    pub fn branches(&self) -> impl Iterator<Item = &BranchInfo> + '_ {
        self.core.iter_branches()
    }

    pub fn current_branches(&self) -> &[BranchId] {
        &self.core.current
    }

    /// Priority of the tier being attempted, -1 before `start()`
    pub fn current_priority(&self) -> f32 {
        self.core.current_priority
    }

    pub fn last_response(&self) -> Option<&Response> {
        self.core.last_response.as_ref()
    }

    /// Status of the last response sent upstream, 0 when none
    pub fn last_response_code(&self) -> u16 {
        self.core.last_response_code()
    }

    pub fn is_timer_running(&self, timer: ForkTimer) -> bool {
        self.core.timers.is_running(timer)
    }

    pub fn call(&self) -> Option<&CallFork> {
        match &self.kind {
            ForkKind::Call(call) => Some(call),
            _ => None,
        }
    }

    pub fn message(&self) -> Option<&MessageFork> {
        match &self.kind {
            ForkKind::Message(message) => Some(message),
            _ => None,
        }
    }

    /// Whether forwarding a final response ends this fork
    pub fn should_finish(&self) -> bool {
        self.core.finish_on_final
    }

    /// Add a branch towards `contact`, carrying `request` retargeted for it
    pub fn add_branch(&mut self, request: Request, contact: ContactTarget) -> BranchId {
        let id = self.core.create_branch(request, contact);
        if let ForkKind::Message(message) = &mut self.kind {
            message.on_new_branch(&mut self.core, id);
        }
        self.core.enqueue_branch(id);
        id
    }

    pub fn should_dispatch(&self, dest: &Uri, uid: &str) -> (bool, Option<BranchId>) {
        self.core.should_dispatch(dest, uid)
    }

    /// Start the next priority tier
    pub fn start(&mut self) {
        match &self.kind {
            ForkKind::Call(call) if call.is_completed(&self.core) => {
                debug!("ForkContext [{}]: call already completed, not starting", self.core.id)
            }
            _ => self.core.start(),
        }
    }

    pub fn has_next_branches(&self) -> bool {
        self.core.has_next_branches()
    }

    pub fn find_best_branch(&self, urgent: Option<UrgentCodes<'_>>, avoid_503_and_408: bool) -> Option<BranchId> {
        self.core.find_best_branch(urgent, avoid_503_and_408)
    }

    pub fn all_branches_answered(&self, ignore_errors: bool) -> bool {
        self.core.all_branches_answered(ignore_errors)
    }

    pub fn all_current_branches_answered(&self, ignore_errors: bool) -> bool {
        self.core.all_current_branches_answered(ignore_errors)
    }

    pub fn check_finished(&mut self) {
        self.core.check_finished();
    }

    pub fn set_finished(&mut self) {
        self.core.set_finished();
    }

    pub fn forward_custom_response(&mut self, status: u16, phrase: &str) -> Option<Response> {
        self.core.forward_custom_response(status, phrase)
    }

    /// A response, or `None` when the branch transaction failed without one
    pub fn on_response(&mut self, branch: BranchId, response: Option<Response>) {
        if !self.core.branches.contains(branch) {
            debug!(
                "ForkContext [{}]: response for stale {}, ignoring",
                self.core.id, branch
            );
            return;
        }
        let response = response.unwrap_or_else(|| {
            debug!(
                "ForkContext [{}]: {} failed without response, assuming 503",
                self.core.id, branch
            );
            crate::message::response(503)
        });
        if let Some(info) = self.core.branches.get_mut(branch) {
            info.record_response(response);
        }
        self.core.notify_branch_completed(branch);

        match &mut self.kind {
            ForkKind::Call(call) => call.on_response(&mut self.core, branch),
            ForkKind::Message(message) => message.on_response(&mut self.core, branch),
            ForkKind::Basic(basic) => basic.on_response(&mut self.core, branch),
        }
    }

    /// Answer to a CANCEL sent on a branch
    pub fn on_cancel_response(&mut self, branch: BranchId, status: u16) {
        let Some(info) = self.core.branches.get_mut(branch) else {
            return;
        };
        if (200..300).contains(&status) {
            info.cancel_completed = true;
        }
        self.core.check_finished();
    }

    /// CANCEL received from the caller
    pub fn on_cancel(&mut self, cancel: Option<&Request>) {
        if let ForkKind::Call(call) = &mut self.kind {
            call.on_cancel(&mut self.core, cancel);
        }
        if self.core.finish_on_final {
            self.core.set_finished();
        }
    }

    /// A device of the target registered. `dispatch` adds and starts a branch
    /// for it and is only invoked when the policy accepts the device.
    pub fn on_new_register<F>(&mut self, dest: &Uri, uid: &str, dispatch: F) -> Option<BranchId>
    where
        F: FnOnce(&mut ForkContext) -> Option<BranchId>,
    {
        let action = match &self.kind {
            ForkKind::Call(call) => match call.register_action(&self.core, dest, uid) {
                Some(action) => action,
                None => return None,
            },
            ForkKind::Message(message) => message.register_action(&self.core, dest, uid),
            ForkKind::Basic(_) => return None,
        };

        let dispatched = match action {
            RegisterAction::Ignore => None,
            RegisterAction::Dispatch | RegisterAction::DispatchThenCancel => dispatch(self),
        };

        if let ForkKind::Call(call) = &mut self.kind {
            if let (RegisterAction::DispatchThenCancel, Some(id)) = (action, dispatched) {
                call.cancel_branch(&mut self.core, id);
            }
            self.core.check_finished();
        }
        dispatched
    }

    /// Internal failure: answer upstream with `status`
    pub fn process_internal_error(&mut self, status: u16, phrase: &str) {
        match &mut self.kind {
            ForkKind::Call(call) => call.process_internal_error(&mut self.core, status, phrase),
            ForkKind::Message(_) => {
                self.core.forward_custom_response(status, phrase);
            }
            ForkKind::Basic(basic) => basic.process_internal_error(&mut self.core, status, phrase),
        }
    }

    /// Self-generated provisional response (call forks only)
    pub fn send_response(&mut self, status: u16, phrase: &str, add_to_tag: bool) {
        match &mut self.kind {
            ForkKind::Call(call) => call.send_response(&mut self.core, status, phrase, add_to_tag),
            _ => warn!(
                "ForkContext [{}]: send_response() is only supported by call forks",
                self.core.id
            ),
        }
    }

    /// Deliver a timer expiry
    pub fn on_timer(&mut self, timer: ForkTimer, token: TimerToken) -> TimerOutcome {
        if !self.core.timers.fire(timer, token) {
            debug!("ForkContext [{}]: stale {} timer, ignoring", self.core.id, timer);
            return TimerOutcome::Stale;
        }

        match timer {
            ForkTimer::Finish => {
                self.core.on_finished();
                return TimerOutcome::Finished;
            }
            ForkTimer::Late => self.process_late_timeout(),
            ForkTimer::NextBranches => self.core.on_next_branches(),
            _ => self.on_policy_timer(timer),
        }
        TimerOutcome::Handled
    }

    fn on_policy_timer(&mut self, timer: ForkTimer) {
        match (timer, &mut self.kind) {
            (ForkTimer::Urgent, ForkKind::Call(call)) => call.on_urgent_timer(&mut self.core),
            (ForkTimer::Push, ForkKind::Call(call)) => call.on_push_timer(&self.core),
            (ForkTimer::Acceptance, ForkKind::Message(message)) => message.on_acceptance_timer(&mut self.core),
            (ForkTimer::Decision, ForkKind::Basic(basic)) => basic.on_decision_timer(&mut self.core),
            (timer, kind) => warn!(
                "ForkContext [{}]: {} timer has no meaning for {}",
                self.core.id,
                timer,
                kind.fork_type()
            ),
        }
    }

    fn process_late_timeout(&mut self) {
        debug!("ForkContext [{}]: late timeout", self.core.id);
        match &mut self.kind {
            ForkKind::Call(call) => call.on_late_timeout(&mut self.core),
            ForkKind::Message(message) => message.on_late_timeout(&mut self.core),
            ForkKind::Basic(_) => {}
        }
        self.core.set_finished();
    }
}

impl std::fmt::Debug for ForkCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkCore")
            .field("id", &self.id)
            .field("fork_type", &self.fork_type)
            .field("branches", &self.waiting.len())
            .field("current_priority", &self.current_priority)
            .field("finished", &self.finished)
            .field("has_incoming", &self.incoming.is_some())
            .field("keys", &self.keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Method, RequestExt, parse_uri, response};
    use crate::testing::{ManualTimerScheduler, RecordingTransactionLayer};
    use pretty_assertions::assert_eq;

    struct Fixture {
        layer: RecordingTransactionLayer,
        timers: Arc<ManualTimerScheduler>,
        context: ForkContext,
    }

    fn fixture(fork_type: ForkType, target: &str, config: ForkContextConfig) -> Fixture {
        let layer = RecordingTransactionLayer::new();
        let timers = Arc::new(ManualTimerScheduler::new());
        let services = ForkServices::new(Arc::new(layer.clone()), timers.clone());
        let method = match fork_type {
            ForkType::Call => Method::Invite,
            ForkType::Message => Method::Message,
            ForkType::Basic => Method::Options,
        };
        let request = Request::new(method, parse_uri(target).unwrap());
        let context = ForkContext::new(fork_type, request, Arc::new(config), services);
        Fixture { layer, timers, context }
    }

    fn add(context: &mut ForkContext, uid: &str, uri: &str, priority: f32) -> BranchId {
        let uri = parse_uri(uri).unwrap();
        let request = context.request().retarget(uri.clone());
        context.add_branch(request, ContactTarget::new(uid, uri, priority))
    }

    /// Record a response without running any policy
    fn answer(context: &mut ForkContext, id: BranchId, status: u16) {
        context
            .core
            .branches
            .get_mut(id)
            .unwrap()
            .record_response(response(status));
    }

    #[test]
    fn test_best_branch_prefers_lowest_class() {
        let mut f = fixture(ForkType::Call, "sip:bob@example.com", ForkContextConfig::default());
        let a = add(&mut f.context, "a", "sip:bob@10.0.0.1", 1.0);
        let b = add(&mut f.context, "b", "sip:bob@10.0.0.2", 1.0);
        let c = add(&mut f.context, "c", "sip:bob@10.0.0.3", 1.0);
        answer(&mut f.context, a, 404);
        answer(&mut f.context, b, 486);
        answer(&mut f.context, c, 200);

        assert_eq!(f.context.find_best_branch(None, false), Some(c));
        assert_eq!(
            f.context.find_best_branch(Some(UrgentCodes::Only(URGENT_CODES)), false),
            Some(c)
        );
    }

    #[test]
    fn test_urgent_code_overrides_baseline() {
        let mut f = fixture(ForkType::Call, "sip:bob@example.com", ForkContextConfig::default());
        let a = add(&mut f.context, "a", "sip:bob@10.0.0.1", 1.0);
        let b = add(&mut f.context, "b", "sip:bob@10.0.0.2", 1.0);
        answer(&mut f.context, a, 404);
        answer(&mut f.context, b, 488);

        assert_eq!(f.context.find_best_branch(None, false), Some(a));
        assert_eq!(f.context.find_best_branch(Some(UrgentCodes::Only(&[488])), false), Some(b));
    }

    #[test]
    fn test_best_branch_avoids_503_and_408_when_possible() {
        let mut f = fixture(ForkType::Call, "sip:bob@example.com", ForkContextConfig::default());
        let a = add(&mut f.context, "a", "sip:bob@10.0.0.1", 1.0);
        let b = add(&mut f.context, "b", "sip:bob@10.0.0.2", 1.0);
        let c = add(&mut f.context, "c", "sip:bob@10.0.0.3", 1.0);
        answer(&mut f.context, a, 408);
        answer(&mut f.context, b, 503);
        assert_eq!(f.context.find_best_branch(None, true), Some(a));

        answer(&mut f.context, c, 486);
        assert_eq!(f.context.find_best_branch(None, true), Some(c));
        assert_eq!(f.context.find_best_branch(None, false), Some(a));
    }

    #[test]
    fn test_no_best_branch_without_final_status() {
        let mut f = fixture(ForkType::Call, "sip:bob@example.com", ForkContextConfig::default());
        let a = add(&mut f.context, "a", "sip:bob@10.0.0.1", 1.0);
        answer(&mut f.context, a, 180);
        assert_eq!(f.context.find_best_branch(Some(UrgentCodes::All), false), None);
    }

    #[test]
    fn test_branches_are_kept_in_priority_order() {
        let mut f = fixture(ForkType::Call, "sip:bob@example.com", ForkContextConfig::default());
        add(&mut f.context, "low", "sip:bob@10.0.0.1", 0.5);
        add(&mut f.context, "high-1", "sip:bob@10.0.0.2", 1.0);
        add(&mut f.context, "mid", "sip:bob@10.0.0.3", 0.7);
        add(&mut f.context, "high-2", "sip:bob@10.0.0.4", 1.0);

        let uids: Vec<&str> = f.context.branches().map(|b| b.uid()).collect();
        assert_eq!(uids, vec!["high-1", "high-2", "mid", "low"]);
        assert_eq!(f.context.current_priority(), NO_PRIORITY);
        assert!(f.layer.sent().is_empty());
    }

    #[test]
    fn test_start_dispatches_one_tier_at_a_time() {
        let config = ForkContextConfig::default().with_current_branches_timeout(Duration::from_secs(10));
        let mut f = fixture(ForkType::Call, "sip:bob@example.com", config);
        add(&mut f.context, "a", "sip:bob@10.0.0.1", 1.0);
        add(&mut f.context, "b", "sip:bob@10.0.0.2", 1.0);
        let low = add(&mut f.context, "c", "sip:bob@10.0.0.3", 0.5);

        f.context.start();
        let id = f.context.id();
        assert_eq!(f.context.current_priority(), 1.0);
        assert_eq!(f.context.current_branches().len(), 2);
        assert_eq!(f.layer.sent_branches(id).len(), 2);
        assert!(f.context.is_timer_running(ForkTimer::NextBranches));

        let token = f.timers.take(id, ForkTimer::NextBranches).unwrap();
        assert_eq!(f.context.on_timer(ForkTimer::NextBranches, token), TimerOutcome::Handled);
        assert_eq!(f.context.current_priority(), 0.5);
        assert_eq!(f.context.current_branches(), &[low]);
        assert_eq!(f.layer.sent_branches(id).len(), 3);
        assert!(!f.context.has_next_branches());
        assert!(!f.context.is_timer_running(ForkTimer::NextBranches));
    }

    #[test]
    fn test_branch_added_to_started_tier_is_dispatched() {
        let mut f = fixture(ForkType::Call, "sip:bob@example.com", ForkContextConfig::default());
        add(&mut f.context, "a", "sip:bob@10.0.0.1", 1.0);
        f.context.start();
        let late = add(&mut f.context, "b", "sip:bob@10.0.0.2", 1.0);
        let lower = add(&mut f.context, "c", "sip:bob@10.0.0.3", 0.2);

        let sent = f.layer.sent_branches(f.context.id());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].branch, late);
        assert!(!f.context.current_branches().contains(&lower));
    }

    #[test]
    fn test_incoming_is_bound_once() {
        let mut f = fixture(ForkType::Call, "sip:bob@example.com", ForkContextConfig::default());
        add(&mut f.context, "a", "sip:bob@10.0.0.1", 1.0);
        add(&mut f.context, "b", "sip:bob@10.0.0.2", 1.0);
        assert_eq!(f.layer.bound_forks(), vec![f.context.id()]);
    }

    #[test]
    fn test_answered_branch_is_superseded_by_same_uid() {
        let mut f = fixture(ForkType::Call, "sip:bob@example.com", ForkContextConfig::default());
        let old = add(&mut f.context, "<urn:uuid:1>", "sip:bob@10.0.0.1", 1.0);
        answer(&mut f.context, old, 503);

        let new = add(&mut f.context, "<urn:uuid:1>", "sip:bob@10.0.0.9", 1.0);
        assert!(f.context.branch(old).is_none());
        assert_eq!(f.context.branches().count(), 1);
        assert_eq!(f.context.branch(new).unwrap().cleared_count(), 1);
    }

    #[test]
    fn test_should_dispatch_rules() {
        let mut f = fixture(ForkType::Call, "sip:bob@example.com", ForkContextConfig::default());
        let failed = add(&mut f.context, "failed", "sip:bob@10.0.0.1", 1.0);
        let answered = add(&mut f.context, "answered", "sip:bob@10.0.0.2", 1.0);
        let pending = add(&mut f.context, "pending", "sip:bob@10.0.0.3", 1.0);
        answer(&mut f.context, failed, 503);
        answer(&mut f.context, answered, 486);
        answer(&mut f.context, pending, 180);

        let uri = |s: &str| parse_uri(s).unwrap();
        assert_eq!(
            f.context.should_dispatch(&uri("sip:bob@10.0.0.1"), "failed"),
            (true, Some(failed))
        );
        assert_eq!(f.context.should_dispatch(&uri("sip:bob@10.0.0.7"), "answered"), (false, None));
        // Reconnected from another socket
        assert_eq!(
            f.context.should_dispatch(&uri("sip:bob@10.0.0.8"), "pending"),
            (true, Some(pending))
        );
        // Same socket, transaction still in flight
        assert_eq!(f.context.should_dispatch(&uri("sip:bob@10.0.0.3"), "pending"), (false, None));
        assert_eq!(f.context.should_dispatch(&uri("sip:bob@10.0.0.2"), "other"), (false, None));
        assert_eq!(f.context.should_dispatch(&uri("sip:bob@10.0.0.5"), "new"), (true, None));
    }

    #[test]
    fn test_should_dispatch_honours_gruu() {
        let f = fixture(
            ForkType::Call,
            "sip:bob@example.com;gr=urn:uuid:abc",
            ForkContextConfig::default(),
        );
        let dest = parse_uri("sip:bob@10.0.0.1").unwrap();
        assert_eq!(f.context.should_dispatch(&dest, "<urn:uuid:other>"), (false, None));
        assert_eq!(f.context.should_dispatch(&dest, "<urn:uuid:abc>"), (true, None));
    }

    #[test]
    fn test_set_finished_defers_notification() {
        let mut f = fixture(ForkType::Basic, "sip:bob@example.com", ForkContextConfig::default());
        f.context.set_finished();
        f.context.set_finished();
        assert!(f.context.is_finished());

        let id = f.context.id();
        let finishes: Vec<_> = f
            .timers
            .pending_for(id)
            .into_iter()
            .filter(|t| t.timer == ForkTimer::Finish)
            .collect();
        assert_eq!(finishes.len(), 1);
        assert_eq!(finishes[0].delay, Duration::ZERO);

        let token = f.timers.take(id, ForkTimer::Finish).unwrap();
        assert_eq!(f.context.on_timer(ForkTimer::Finish, token), TimerOutcome::Finished);
        assert_eq!(f.context.on_timer(ForkTimer::Finish, token), TimerOutcome::Stale);
    }

    #[test]
    fn test_out_of_range_deadline_leaves_no_expiration() {
        let config = ForkContextConfig::default()
            .with_fork_late(true)
            .with_delivery_timeout(Duration::from_secs(u64::MAX / 2));
        let f = fixture(ForkType::Message, "sip:bob@example.com", config);
        assert_eq!(f.context.message().unwrap().expiration(), None);
        assert!(f.context.is_timer_running(ForkTimer::Acceptance));
        assert!(f.context.is_timer_running(ForkTimer::Late));
    }

    #[test]
    fn test_start_after_finish_is_ignored() {
        let mut f = fixture(ForkType::Basic, "sip:bob@example.com", ForkContextConfig::default());
        add(&mut f.context, "a", "sip:bob@10.0.0.1", 1.0);
        f.context.set_finished();
        f.context.start();
        assert!(f.layer.sent().is_empty());
    }

    #[test]
    fn test_missing_response_counts_as_503() {
        let mut f = fixture(ForkType::Basic, "sip:bob@example.com", ForkContextConfig::default());
        let a = add(&mut f.context, "a", "sip:bob@10.0.0.1", 1.0);
        f.context.start();
        f.context.on_response(a, None);
        assert_eq!(f.context.branch(a).unwrap().status(), 503);
        assert_eq!(f.layer.upstream_statuses(f.context.id()), vec![503]);
    }

    #[test]
    fn test_response_creation_failure_finishes() {
        let mut f = fixture(ForkType::Basic, "sip:bob@example.com", ForkContextConfig::default());
        add(&mut f.context, "a", "sip:bob@10.0.0.1", 1.0);
        f.layer.set_fail_response_creation(true);
        assert!(f.context.forward_custom_response(500, "Server Internal Error").is_none());
        assert!(f.context.is_finished());
        assert!(f.layer.upstream().is_empty());
    }
}
