//! One-shot fork timers
//!
//! Fork contexts never block: every delay is a one-shot timer armed through a
//! [`TimerScheduler`] and delivered back to the owning context as
//! `(ForkTimer, TimerToken)`. A context keeps at most one armed token per
//! [`ForkTimer`] kind in its [`ForkTimers`] table; re-arming or resetting a kind
//! forgets the previous token, so an expiry that was already in flight is
//! recognised as stale and ignored.
//!
//! ```text
//! ForkContext ──set(kind, delay)──▶ TimerScheduler ──(later)──▶ ForkEvent::Timer
//!      ▲                                                             │
//!      └────────────── on_timer(kind, token) ◀── ForkManager ◀───────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fork::ForkId;

/// Timer kinds a fork context may arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForkTimer {
    /// Fork-late / delivery deadline
    Late,
    /// Zero-delay finish notification
    Finish,
    /// Start of the next priority tier
    NextBranches,
    /// Call: forward an urgent error even though other branches are still pending
    Urgent,
    /// Call: no device answered after a push notification
    Push,
    /// Message: answer 202 Accepted to the sender
    Acceptance,
    /// Basic: force a decision
    Decision,
}

impl fmt::Display for ForkTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identifies one arming of a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerToken(pub u64);

/// Timer seam between fork contexts and the event loop
pub trait TimerScheduler: Send + Sync {
    /// Arm a one-shot timer. Its expiry must be delivered to the fork on the
    /// event loop, never synchronously from within this call.
    fn schedule(&self, fork: ForkId, timer: ForkTimer, delay: Duration) -> TimerToken;

    /// Best-effort cancellation. Safe to call on expired or unknown tokens.
    fn cancel(&self, token: TimerToken);
}

/// Armed timers of one fork context
pub struct ForkTimers {
    fork: ForkId,
    scheduler: Arc<dyn TimerScheduler>,
    armed: HashMap<ForkTimer, TimerToken>,
}

impl ForkTimers {
    pub fn new(fork: ForkId, scheduler: Arc<dyn TimerScheduler>) -> Self {
        Self {
            fork,
            scheduler,
            armed: HashMap::new(),
        }
    }

    /// Arm `timer`, disarming any previous arming of the same kind
    pub fn set(&mut self, timer: ForkTimer, delay: Duration) {
        self.reset(timer);
        let token = self.scheduler.schedule(self.fork, timer, delay);
        self.armed.insert(timer, token);
    }

    /// Disarm `timer`. Idempotent.
    pub fn reset(&mut self, timer: ForkTimer) {
        if let Some(token) = self.armed.remove(&timer) {
            self.scheduler.cancel(token);
        }
    }

    pub fn is_running(&self, timer: ForkTimer) -> bool {
        self.armed.contains_key(&timer)
    }

    /// Consume an expiry. Returns false when `token` is not the current arming
    /// of `timer`.
    pub fn fire(&mut self, timer: ForkTimer, token: TimerToken) -> bool {
        match self.armed.get(&timer) {
            Some(current) if *current == token => {
                self.armed.remove(&timer);
                true
            }
            _ => false,
        }
    }

    pub fn reset_all(&mut self) {
        for (_, token) in self.armed.drain() {
            self.scheduler.cancel(token);
        }
    }
}

impl Drop for ForkTimers {
    fn drop(&mut self) {
        self.reset_all();
    }
}
