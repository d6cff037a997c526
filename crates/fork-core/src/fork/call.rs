//! INVITE forking policy
//!
//! A call fork forwards ringing feedback as it arrives, lets the first 2xx win
//! and cancels every other device, treats 6xx as a global decline, and holds
//! other errors back until every branch answered or an urgent timer expires.

use serde::Serialize;
use tracing::{debug, info};

use crate::branch::{BranchId, BranchInfo, ForkStatus};
use crate::message::{Reason, Request, RequestExt, Response, ResponseExt, Uri, busy_everywhere, call_completed_elsewhere};
use crate::timer::ForkTimer;

use super::context::{ForkCore, RegisterAction};
use super::{URGENT_CODES, URGENT_CODES_WITHOUT_603, UrgentCodes};

/// Call event log entry, updated as the call progresses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallLog {
    pub status_code: u16,
    pub reason_phrase: String,
    pub completed: bool,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
pub struct CallFork {
    cancelled: bool,
    cancel_reason: Option<Reason>,
    log: CallLog,
}

impl CallFork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The caller cancelled, or the call was answered or declined globally
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Reason sent with the CANCELs of this fork
    pub fn cancel_reason(&self) -> Option<&Reason> {
        self.cancel_reason.as_ref()
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }

    pub(crate) fn is_completed(&self, core: &ForkCore) -> bool {
        core.last_response_code() >= 200 || self.cancelled || core.incoming.is_none()
    }

    fn urgent_codes(core: &ForkCore) -> UrgentCodes<'static> {
        if core.config.treat_all_errors_as_urgent {
            UrgentCodes::All
        } else if core.config.treat_decline_as_urgent {
            UrgentCodes::Only(URGENT_CODES)
        } else {
            UrgentCodes::Only(URGENT_CODES_WITHOUT_603)
        }
    }

    pub(crate) fn on_response(&mut self, core: &mut ForkCore, branch: BranchId) {
        debug!("ForkCallContext [{}]: on_response()", core.id);
        let code = core.branch_status(branch);
        let urgent = Self::urgent_codes(core);

        if code >= 600 && !core.config.fork_no_global_decline {
            let sent = core.forward_branch_response(branch);
            self.log_response(core, sent.as_ref());
            self.cancelled = true;
            self.cancel_others_with_status(core, Some(branch), ForkStatus::DeclineElsewhere);
        } else if code >= 300 {
            // In fork-late mode 503 and 408 come from i/o errors and timeouts:
            // those devices may still register again.
            if core.all_branches_answered(core.config.fork_late) {
                if let Some(best) = core.find_best_branch(Some(urgent), core.config.fork_late) {
                    let sent = core.forward_branch_response(best);
                    self.log_response(core, sent.as_ref());
                }
            } else if urgent.contains(code) && !core.timers.is_running(ForkTimer::Urgent) {
                let delay = core.config.urgent_timeout;
                core.timers.set(ForkTimer::Urgent, delay);
            }
        } else if code >= 200 {
            let sent = core.forward_branch_response(branch);
            self.log_response(core, sent.as_ref());
            self.cancelled = true;
            self.cancel_others_with_status(core, Some(branch), ForkStatus::AcceptedElsewhere);
        } else if code >= 100 {
            let sent = core.forward_branch_response(branch);
            self.log_response(core, sent.as_ref());
        }

        core.check_finished();
    }

    pub(crate) fn on_cancel(&mut self, core: &mut ForkCore, cancel: Option<&Request>) {
        self.log.cancelled = true;
        self.log.completed = true;
        self.cancelled = true;
        self.cancel_others(core, None, cancel);
        // The transaction layer answers the CANCEL and terminates the INVITE
        core.incoming = None;
        self.flush_log(core);
    }

    /// Cancel every branch but `except`, with the Reason of `received_cancel`
    /// if the caller gave one
    pub(crate) fn cancel_others(
        &mut self,
        core: &mut ForkCore,
        except: Option<BranchId>,
        received_cancel: Option<&Request>,
    ) {
        if self.cancel_reason.is_none() {
            self.cancel_reason = received_cancel.and_then(RequestExt::reason);
        }
        self.cancel_all(core, except, ForkStatus::Standard);
    }

    pub(crate) fn cancel_others_with_status(
        &mut self,
        core: &mut ForkCore,
        except: Option<BranchId>,
        status: ForkStatus,
    ) {
        if self.cancel_reason.is_none() {
            self.cancel_reason = match status {
                ForkStatus::AcceptedElsewhere => Some(call_completed_elsewhere()),
                ForkStatus::DeclineElsewhere => Some(busy_everywhere()),
                ForkStatus::Standard => None,
            };
        }
        self.cancel_all(core, except, status);
    }

    fn cancel_all(&mut self, core: &mut ForkCore, except: Option<BranchId>, status: ForkStatus) {
        for id in core.waiting.clone() {
            if Some(id) == except {
                continue;
            }
            match self.cancel_branch(core, id) {
                Some(removed) => removed.notify_canceled(status),
                None => {
                    if let Some(branch) = core.branch(id) {
                        branch.notify_canceled(status);
                    }
                }
            }
        }
        core.timers.reset(ForkTimer::NextBranches);
    }

    /// CANCEL a pending branch, at most once. Outside fork-late mode the
    /// branch is also removed and returned.
    pub(crate) fn cancel_branch(
        &mut self,
        core: &mut ForkCore,
        id: BranchId,
    ) -> Option<BranchInfo> {
        if let Some(branch) = core.branches.get_mut(id) {
            if branch.status < 200 && !branch.cancel_sent {
                if let Some(transaction) = branch.transaction.as_mut() {
                    debug!("ForkCallContext [{}]: cancelling {}", core.id, id);
                    transaction.cancel(self.cancel_reason.as_ref());
                    branch.cancel_sent = true;
                }
            }
        }
        if core.config.fork_late {
            None
        } else {
            core.remove_branch(id)
        }
    }

    /// `None` stops the REGISTER handling without re-checking the fork
    pub(crate) fn register_action(&self, core: &ForkCore, dest: &Uri, uid: &str) -> Option<RegisterAction> {
        debug!("ForkCallContext [{}]: on_new_register()", core.id);
        let completed = self.is_completed(core);
        if completed && !core.config.fork_late {
            return None;
        }

        let (dispatch, existing) = core.should_dispatch(dest, uid);
        if !completed && dispatch {
            return Some(RegisterAction::Dispatch);
        }
        if dispatch {
            // A device in the middle of an Apple push cycle gets one more
            // dispatch, cancelled right away, so that it stops waiting
            let apple_push = existing
                .and_then(|id| core.branch(id))
                .and_then(|branch| branch.push_context())
                .is_some_and(|push| push.is_apple());
            if apple_push {
                return Some(RegisterAction::DispatchThenCancel);
            }
        }
        Some(RegisterAction::Ignore)
    }

    fn is_ringing_somewhere(core: &ForkCore) -> bool {
        core.iter_branches().any(|b| (180..200).contains(&b.status))
    }

    pub(crate) fn on_urgent_timer(&mut self, core: &mut ForkCore) {
        debug!("ForkCallContext [{}]: time to send urgent replies", core.id);
        if Self::is_ringing_somewhere(core) {
            return;
        }
        let urgent = Self::urgent_codes(core);
        if let Some(best) = core.find_best_branch(Some(urgent), core.config.fork_late) {
            let sent = core.forward_branch_response(best);
            self.log_response(core, sent.as_ref());
        }
    }

    pub(crate) fn on_late_timeout(&mut self, core: &mut ForkCore) {
        if core.incoming.is_some() {
            let urgent = Self::urgent_codes(core);
            let best = core
                .find_best_branch(Some(urgent), core.config.fork_late)
                .filter(|id| !matches!(core.branch_status(*id), 0 | 503));
            let sent = match best {
                Some(best) => core.forward_branch_response(best),
                None => core.forward_custom_response(408, crate::message::reason_phrase(408)),
            };
            self.log_response(core, sent.as_ref());
        }

        // Pending branches are cancelled whether or not the caller was answered
        self.cancel_others(core, None, None);
    }

    pub(crate) fn on_push_timer(&self, core: &ForkCore) {
        if !self.is_completed(core) && core.last_response_code() < 180 {
            debug!("ForkCallContext [{}]: push timer, no uac response", core.id);
        }
    }

    /// Self-generated response, e.g. 110 Push sent or 180 Ringing on behalf of
    /// a device being woken up
    pub(crate) fn send_response(&mut self, core: &mut ForkCore, code: u16, phrase: &str, add_to_tag: bool) {
        if !core.config.permit_self_generated_provisional_response {
            debug!(
                "ForkCallContext [{}]: self-generated provisional responses are disabled",
                core.id
            );
            return;
        }
        if core.last_response_code() > code {
            return;
        }
        let Some(incoming) = core.incoming.as_ref() else {
            return;
        };
        let Some(mut response) = incoming.create_response(code, phrase) else {
            return;
        };
        if add_to_tag {
            let tag = core.services.new_tag();
            response.set_to_tag(&tag);
        }

        core.timers.reset(ForkTimer::Push);
        if !core.config.push_response_timeout.is_zero() {
            let delay = core.config.push_response_timeout;
            core.timers.set(ForkTimer::Push, delay);
        }
        let sent = core.forward_response(response);
        self.log_response(core, sent.as_ref());
    }

    pub(crate) fn process_internal_error(&mut self, core: &mut ForkCore, status: u16, phrase: &str) {
        let sent = core.forward_custom_response(status, phrase);
        self.log_response(core, sent.as_ref());
        self.cancel_others(core, None, None);
    }

    fn log_response(&mut self, core: &ForkCore, response: Option<&Response>) {
        let Some(response) = response else {
            return;
        };
        self.log.status_code = response.code();
        self.log.reason_phrase = response.reason_phrase().to_string();
        if response.is_final() {
            self.log.completed = true;
            self.flush_log(core);
        }
    }

    fn flush_log(&self, core: &ForkCore) {
        info!(
            target: crate::logging::CALL_LOG_TARGET,
            fork = %core.id,
            uri = %core.request.uri,
            status = self.log.status_code,
            reason = %self.log.reason_phrase,
            completed = self.log.completed,
            cancelled = self.log.cancelled,
            "call event"
        );
    }
}
