//! Fallback policy for requests that are neither calls nor messages
//!
//! No ringing, no late dispatch: the fork waits for every branch, or for the
//! decision timer, then forwards the best response it has.

use tracing::debug;

use crate::branch::BranchId;
use crate::timer::ForkTimer;

use super::context::ForkCore;
use super::{URGENT_CODES, UrgentCodes};

#[derive(Debug, Default)]
pub struct BasicFork;

impl BasicFork {
    pub(crate) fn new(core: &mut ForkCore) -> Self {
        let delay = core.config.delivery_timeout;
        core.timers.set(ForkTimer::Decision, delay);
        BasicFork
    }

    pub(crate) fn on_response(&mut self, core: &mut ForkCore, branch: BranchId) {
        let code = core.branch_status(branch);
        if code < 200 {
            return;
        }
        if code < 300 {
            // A success is forwarded as is, never traded for an urgent error
            core.timers.reset(ForkTimer::Decision);
            core.forward_branch_response(branch);
            core.set_finished();
        } else if core.advance_tier() {
            debug!("ForkBasicContext [{}]: moved on to the next tier", core.id);
        } else if core.all_branches_answered(false) {
            self.finish_incoming(core);
        }
    }

    pub(crate) fn on_decision_timer(&mut self, core: &mut ForkCore) {
        debug!("ForkBasicContext [{}]: decision timer expired", core.id);
        self.finish_incoming(core);
    }

    pub(crate) fn process_internal_error(&mut self, core: &mut ForkCore, status: u16, phrase: &str) {
        core.timers.reset(ForkTimer::Decision);
        core.forward_custom_response(status, phrase);
    }

    fn finish_incoming(&mut self, core: &mut ForkCore) {
        core.timers.reset(ForkTimer::Decision);
        match core.find_best_branch(Some(UrgentCodes::Only(URGENT_CODES)), false) {
            Some(best) => {
                core.forward_branch_response(best);
            }
            None => {
                core.forward_custom_response(408, crate::message::reason_phrase(408));
            }
        }
        core.set_finished();
    }
}
