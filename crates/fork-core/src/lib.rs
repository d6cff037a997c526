//! # RVoIP Fork Core
//!
//! Request forking engine for SIP proxies.
//!
//! A proxy that receives a request for a user with several registered devices
//! forks it: one branch per device, dispatched by priority tier, with one
//! response chosen and sent back upstream. This crate implements that fan-out
//! session and its policies.
//!
//! ## Features
//!
//! - **Call forking** (INVITE): ringing feedback, first 2xx wins, CANCEL with
//!   Reason to the other devices, 6xx global decline, urgent error timer
//! - **Message store-and-forward** (MESSAGE): delivery counting, 202 Accepted
//!   after the urgent timeout, durable records restored at start-up
//! - **Fork-late**: keep a fork alive until its deadline and dispatch to
//!   devices as they register again
//! - **Priority tiers**: q-value groups started one after another
//!
//! ## Architecture
//!
//! - `fork`: fork contexts and their per-kind policies
//! - `branch`: branches and the generation-checked branch arena
//! - `manager`: the fork table, REGISTER dispatch and persistence hooks
//! - `runtime`: tokio event loop and timer scheduler
//! - `transaction`, `timer`, `persistence`: collaborator seams
//! - `testing` (feature `testing`): recording doubles for those seams

pub mod branch;
pub mod config;
pub mod errors;
pub mod fork;
pub mod logging;
pub mod manager;
pub mod message;
pub mod persistence;
pub mod runtime;
pub mod stats;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod timer;
pub mod transaction;

// Re-export key types
pub use branch::{BranchId, BranchInfo, BranchListener, ContactTarget, ForkStatus, PushContext, PushPlatform};
pub use config::{ForkContextConfig, ForkManagerConfig};
pub use errors::{ForkError, ForkResult};
pub use fork::{
    ForkContext, ForkContextListener, ForkId, ForkKind, ForkServices, ForkType, TimerOutcome, URGENT_CODES,
    UrgentCodes,
};
pub use manager::{ForkManager, ForkStats, ForkSummary};
pub use message::{Method, Reason, Request, RequestExt, Response, ResponseExt, StatusCode, Uri, UriExt, parse_uri};
pub use persistence::{
    ForkMessageRecord, ForkStore, InMemoryForkStore, JsonDirForkStore, StoreJob, StoreOutcome, StoreWriter,
};
pub use runtime::{ForkEvent, ForkRuntime, ForkRuntimeHandle, TokioTimerScheduler};
pub use timer::{ForkTimer, TimerScheduler, TimerToken};
pub use transaction::{BranchHandle, IncomingTransaction, OutgoingTransaction, TransactionLayer};
