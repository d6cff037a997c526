//! Store-and-forward policy for MESSAGE
//!
//! A message fork tries to reach every device of the recipient at least once
//! before its delivery deadline. In fork-late mode the sender is answered
//! `202 Accepted` after the urgent timeout while delivery continues, and the
//! whole state can be exported to a [`ForkMessageRecord`] and restored after a
//! restart.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::branch::{BranchId, BranchInfo};
use crate::config::ForkContextConfig;
use crate::errors::ForkResult;
use crate::message::{Method, RequestExt, ResponseExt, Uri};
use crate::persistence::ForkMessageRecord;
use crate::stats::StatPair;
use crate::timer::ForkTimer;

use super::context::{ForkContext, ForkCore, ForkKind, RegisterAction};
use super::{ForkContextListener, ForkId, ForkServices, ForkType, URGENT_CODES, UrgentCodes};

#[derive(Debug, Default)]
pub struct MessageFork {
    is_message: bool,
    delivered_count: u32,
    expiration: Option<DateTime<Utc>>,
}

impl MessageFork {
    pub(crate) fn new(core: &mut ForkCore) -> Self {
        let mut expiration = None;
        if core.config.message_deadline_enabled() {
            let deadline = core.config.delivery_timeout;
            expiration = chrono::Duration::from_std(deadline)
                .ok()
                .and_then(|deadline| Utc::now().checked_add_signed(deadline));
            if expiration.is_none() {
                warn!(
                    "ForkMessageContext [{}]: delivery timeout {:?} is out of range, no expiration date",
                    core.id, deadline
                );
            }
            let acceptance = core.config.urgent_timeout;
            core.timers.set(ForkTimer::Acceptance, acceptance);
        }
        Self {
            is_message: core.request.method == Method::Message,
            delivered_count: 0,
            expiration,
        }
    }

    /// Whether the forked request is a MESSAGE (and not, e.g., a REFER)
    pub fn is_message(&self) -> bool {
        self.is_message
    }

    /// Number of devices that accepted the message with a 2xx
    pub fn delivered_count(&self) -> u32 {
        self.delivered_count
    }

    /// Absolute delivery deadline, when one applies
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    pub(crate) fn on_new_branch(&mut self, core: &mut ForkCore, branch: BranchId) {
        let Some(uid) = core.branch(branch).map(|b| b.uid.clone()) else {
            return;
        };
        if uid.is_empty() {
            error!("ForkMessageContext [{}]: no unique id found for contact", core.id);
            return;
        }
        // The new branch is not queued yet, so this only finds its predecessor
        if let Some(previous) = core.find_branch_by_uid(&uid) {
            core.remove_branch(previous);
        }
    }

    pub(crate) fn on_response(&mut self, core: &mut ForkCore, branch: BranchId) {
        debug!("ForkMessageContext [{}]: on_response()", core.id);
        let code = core.branch_status(branch);

        if (101..300).contains(&code) {
            if code >= 200 {
                self.delivered_count += 1;
                if core.timers.is_running(ForkTimer::Acceptance) {
                    if core.incoming.is_some() && self.is_message {
                        self.log_received_from_user(core, code);
                    }
                    core.timers.reset(ForkTimer::Acceptance);
                }
            }
            self.log_delivered_to_user(core, branch);
            core.forward_branch_response(branch);
        } else if code >= 300 && !core.config.fork_late && UrgentCodes::Only(URGENT_CODES).contains(code) {
            // Without fork-late nothing is retried: urgent errors go back now
            self.log_delivered_to_user(core, branch);
            core.forward_branch_response(branch);
        } else {
            self.log_delivered_to_user(core, branch);
        }

        core.check_finished();
        if core.timers.is_running(ForkTimer::Acceptance) && core.all_branches_answered(false) && !core.finished {
            self.on_acceptance_timer(core);
        }
    }

    pub(crate) fn on_acceptance_timer(&mut self, core: &mut ForkCore) {
        debug!("ForkMessageContext [{}]: on_acceptance_timer()", core.id);
        self.accept_message(core);
        core.timers.reset(ForkTimer::Acceptance);
    }

    /// Tell the sender the message is queued
    fn accept_message(&self, core: &mut ForkCore) {
        if core.incoming.is_none() {
            return;
        }
        core.forward_custom_response(202, crate::message::reason_phrase(202));
        if self.is_message {
            self.log_received_from_user(core, 202);
        }
    }

    /// Deadline reached: answer the sender if nobody did yet
    pub(crate) fn on_late_timeout(&mut self, core: &mut ForkCore) {
        if core.incoming.is_none() {
            return;
        }
        match core.find_best_branch(Some(UrgentCodes::Only(URGENT_CODES)), true) {
            Some(best) if core.branch_status(best) != 503 => {
                core.forward_branch_response(best);
            }
            _ => {
                core.forward_custom_response(408, crate::message::reason_phrase(408));
            }
        }
    }

    pub(crate) fn register_action(&self, core: &ForkCore, dest: &Uri, uid: &str) -> RegisterAction {
        debug!("ForkMessageContext [{}]: on_new_register()", core.id);
        let (dispatch, _) = core.should_dispatch(dest, uid);
        if !dispatch {
            return RegisterAction::Ignore;
        }

        if !uid.is_empty() {
            match core.find_branch_by_uid(uid).and_then(|id| core.branch(id)) {
                None => {
                    debug!("ForkMessageContext [{}]: this is a new client instance", core.id);
                    return RegisterAction::Dispatch;
                }
                Some(branch) if branch.needs_delivery() => {
                    debug!(
                        "ForkMessageContext [{}]: this client is reconnecting but was not delivered before",
                        core.id
                    );
                    return RegisterAction::Dispatch;
                }
                Some(_) => {}
            }
        }

        debug!(
            "ForkMessageContext [{}]: message has been delivered {} times",
            core.id, self.delivered_count
        );
        if self.delivered_count == 0 {
            RegisterAction::Dispatch
        } else {
            RegisterAction::Ignore
        }
    }

    fn log_delivered_to_user(&self, core: &ForkCore, branch: BranchId) {
        if !self.is_message {
            return;
        }
        let Some(branch) = core.branch(branch) else {
            return;
        };
        let (status, reason) = branch
            .last_response
            .as_ref()
            .map_or((branch.status, ""), |r| (r.code(), r.reason_phrase()));
        info!(
            target: crate::logging::MESSAGE_LOG_TARGET,
            fork = %core.id,
            report = "delivered_to_user",
            destination = %branch.request.uri,
            status,
            reason,
            priority = %branch.request.priority(),
            "message event"
        );
    }

    fn log_received_from_user(&self, core: &ForkCore, status: u16) {
        info!(
            target: crate::logging::MESSAGE_LOG_TARGET,
            fork = %core.id,
            report = "received_from_user",
            status,
            priority = %core.request.priority(),
            "message event"
        );
    }

    fn to_record(&self, core: &ForkCore) -> ForkMessageRecord {
        ForkMessageRecord {
            is_message: self.is_message,
            is_finished: core.finished,
            delivered_count: self.delivered_count,
            current_priority: core.current_priority,
            expiration_date: self.expiration,
            request: core.request.clone(),
            keys: core.keys.clone(),
            branches: core.iter_branches().map(BranchInfo::to_record).collect(),
        }
    }
}

impl ForkContext {
    /// Flat persisted form of a message fork, `None` for other kinds
    pub fn to_record(&self) -> Option<ForkMessageRecord> {
        match &self.kind {
            ForkKind::Message(message) => Some(message.to_record(&self.core)),
            _ => None,
        }
    }

    /// Rebuild message fork `id` from its persisted form. The delivery
    /// deadline is re-armed for the time that remains, possibly zero. A
    /// restored fork has no incoming transaction: the sender was answered
    /// before.
    pub fn restore_message(
        id: ForkId,
        record: &ForkMessageRecord,
        config: Arc<ForkContextConfig>,
        services: ForkServices,
        listener: Weak<dyn ForkContextListener>,
        counter: &Arc<StatPair>,
    ) -> ForkResult<Self> {
        let request = record.request.clone();
        let mut core = ForkCore::new(id, ForkType::Message, request, config, services, None);

        core.finished = record.is_finished;
        core.current_priority = record.current_priority;
        core.keys = record.keys.clone();
        for branch in &record.branches {
            let id = core.branches.next_id();
            let restored = BranchInfo::restore(id, branch)?;
            let id = core.branches.insert_with(|_| restored);
            core.waiting.push(id);
        }

        let remaining = time_left(record.expiration_date);
        core.timers.set(ForkTimer::Late, remaining);

        let message = MessageFork {
            is_message: record.is_message,
            delivered_count: record.delivered_count,
            expiration: record.expiration_date,
        };
        debug!(
            "ForkMessageContext [{}]: restored with {} branches, {:?} before deadline",
            core.id,
            core.waiting.len(),
            remaining
        );

        Ok(ForkContext {
            core,
            kind: ForkKind::Message(message),
        }
        .with_listener(listener)
        .with_stat_counter(counter))
    }
}

/// Time until `expiration`. Past or missing deadlines leave no time.
pub(crate) fn time_left(expiration: Option<DateTime<Utc>>) -> Duration {
    expiration
        .and_then(|expiration| (expiration - Utc::now()).to_std().ok())
        .unwrap_or(Duration::ZERO)
}
