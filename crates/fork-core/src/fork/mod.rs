//! Fork contexts
//!
//! One [`ForkContext`] fans a single incoming request out to every registered
//! device of the target user and decides which response, if any, goes back
//! upstream. The shared algorithms (branch bookkeeping, priority tiers, best
//! branch selection, finishing) live in [`context`]; the per-kind policies are
//! a closed set of variants:
//!
//! - [`CallFork`]: INVITE forking. Ringing feedback, single winner, CANCEL
//!   propagation, urgent error handling.
//! - [`MessageFork`]: store-and-forward for MESSAGE. Delivery counting,
//!   acceptance timer, persistence and restore.
//! - [`BasicFork`]: everything else. One decision timer, no late dispatch.
//!
//! ## State machine
//!
//! ```text
//! Created ──start()──▶ Dispatching (tier N) ──responses──▶ Forwarding final ──▶ Finished
//!                          │      ▲                                              ▲
//!                          │      └── next tier timer                           │
//!                          └──────────── late / urgent / decision timers ────────┘
//! ```
//!
//! `Finished` is terminal. The listener is notified from a zero-delay timer,
//! never from inside the callback that finished the fork.

mod basic;
mod call;
pub mod context;
mod message;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timer::TimerScheduler;
use crate::transaction::TransactionLayer;

pub use basic::BasicFork;
pub use call::{CallFork, CallLog};
pub use context::{ForkContext, ForkKind, TimerOutcome};
pub use message::MessageFork;
pub(crate) use message::time_left;

/// Unique identifier of a fork context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForkId(pub Uuid);

impl ForkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ForkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of fork, chosen by the router from the request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForkType {
    Call,
    Message,
    Basic,
}

impl fmt::Display for ForkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkType::Call => f.write_str("ForkCallContext"),
            ForkType::Message => f.write_str("ForkMessageContext"),
            ForkType::Basic => f.write_str("ForkBasicContext"),
        }
    }
}

/// Notified once, asynchronously, when a fork context is finished
pub trait ForkContextListener: Send + Sync {
    fn on_fork_context_finished(&self, fork: ForkId, keys: &[String]);
}

/// Status codes forwarded early instead of waiting for every branch
pub const URGENT_CODES: &[u16] = &[401, 407, 415, 420, 484, 488, 606, 603];

/// [`URGENT_CODES`] when declines are not urgent
pub const URGENT_CODES_WITHOUT_603: &[u16] = &[401, 407, 415, 420, 484, 488, 606];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrgentCodes<'a> {
    /// Every code is urgent
    All,
    Only(&'a [u16]),
}

impl UrgentCodes<'_> {
    pub fn contains(&self, code: u16) -> bool {
        match self {
            UrgentCodes::All => true,
            UrgentCodes::Only(codes) => codes.contains(&code),
        }
    }
}

/// Collaborators shared by every fork context of a proxy
#[derive(Clone)]
pub struct ForkServices {
    pub transactions: Arc<dyn TransactionLayer>,
    pub timers: Arc<dyn TimerScheduler>,
    rng: Arc<Mutex<SmallRng>>,
}

impl ForkServices {
    pub fn new(transactions: Arc<dyn TransactionLayer>, timers: Arc<dyn TimerScheduler>) -> Self {
        Self {
            transactions,
            timers,
            rng: Arc::new(Mutex::new(SmallRng::from_entropy())),
        }
    }

    /// Same as [`ForkServices::new`] with a fixed seed, for reproducible tags
    pub fn with_seed(
        transactions: Arc<dyn TransactionLayer>,
        timers: Arc<dyn TimerScheduler>,
        seed: u64,
    ) -> Self {
        Self {
            transactions,
            timers,
            rng: Arc::new(Mutex::new(SmallRng::seed_from_u64(seed))),
        }
    }

    /// Random token for To tags of self-generated responses
    pub fn new_tag(&self) -> String {
        let mut rng = self.rng.lock();
        (0..12).map(|_| rng.sample(Alphanumeric) as char).collect()
    }
}

impl fmt::Debug for ForkServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkServices")
            .field("transactions", &"Arc<dyn TransactionLayer>")
            .field("timers", &"Arc<dyn TimerScheduler>")
            .finish()
    }
}
