//! Transaction layer collaborator interfaces
//!
//! The fork engine drives SIP transactions but does not implement them. The
//! transaction layer creates one [`IncomingTransaction`] per forked request
//! and one [`OutgoingTransaction`] per branch. Outgoing transactions only know
//! their branch through a [`BranchHandle`], a non-owning, generation-checked
//! reference: responses reported for a branch that was removed meanwhile are
//! detected and dropped by the fork instead of reaching a freed branch.
//!
//! Responses, CANCEL answers and transaction failures travel back to the
//! engine as [`ForkEvent`](crate::runtime::ForkEvent)s. A transaction failure
//! (timeout, connection error) is reported as a missing response and treated as
//! a synthetic 503.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::branch::BranchId;
use crate::fork::ForkId;
use crate::message::{Reason, Request, Response};

/// Non-owning reference from a transaction to its branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchHandle {
    pub fork: ForkId,
    pub branch: BranchId,
}

impl fmt::Display for BranchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.fork, self.branch)
    }
}

/// Server side of the forked request
pub trait IncomingTransaction: Send + Sync {
    /// Route CANCELs received for this transaction to `fork`
    fn bind_fork(&mut self, fork: ForkId);

    /// Build a response to the original request. `None` means no response
    /// object could be produced, which the fork treats as fatal.
    fn create_response(&self, status: u16, reason_phrase: &str) -> Option<Response>;

    /// Send a response upstream. Must be safe to call while the transaction is
    /// being torn down.
    fn send_response(&mut self, response: &Response);
}

/// Client side transaction of one branch
pub trait OutgoingTransaction: Send + Sync {
    /// Via branch parameter of this transaction
    fn branch_id(&self) -> &str;

    /// Inject the branch request into the transaction layer
    fn send(&mut self, request: &Request);

    /// Send a CANCEL, with a Reason header when one is given. The answer to the
    /// CANCEL comes back as `ForkEvent::CancelResponse`.
    fn cancel(&mut self, reason: Option<&Reason>);
}

/// Factory for transactions
pub trait TransactionLayer: Send + Sync {
    fn create_incoming_transaction(&self, request: &Request) -> Box<dyn IncomingTransaction>;

    fn create_outgoing_transaction(&self, branch: BranchHandle) -> Box<dyn OutgoingTransaction>;
}
