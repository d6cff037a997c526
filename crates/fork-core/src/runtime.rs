//! Tokio event loop for the fork engine
//!
//! Fork contexts are not thread-safe and do not need to be: every event that
//! touches them goes through one unbounded channel and is processed by a
//! single [`ForkRuntime`] task, in arrival order. Timer expiries travel through
//! the same channel, so a zero-delay timer always runs on a later loop turn
//! than the code that armed it. So do fork store outcomes: the store is only
//! touched by a background writer, never by the loop itself.
//!
//! ```text
//!  transaction layer ─┐
//!  registrar ─────────┤
//!  store writer ──────┼──▶ mpsc<ForkEvent> ──▶ ForkRuntime::run ──▶ ForkManager
//!  TokioTimerScheduler┘                                               │
//!          ▲                                                          │
//!          └────────────────────── schedule / cancel ◀────────────────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::branch::ContactTarget;
use crate::config::ForkManagerConfig;
use crate::errors::{ForkError, ForkResult};
use crate::fork::{ForkContextListener, ForkId, ForkServices};
use crate::manager::{ForkManager, ForkSummary};
use crate::message::{Request, Response};
use crate::persistence::{ForkStore, StoreOutcome, StoreWriter};
use crate::stats::StatSnapshot;
use crate::timer::{ForkTimer, TimerScheduler, TimerToken};
use crate::transaction::{BranchHandle, TransactionLayer};

/// Everything the fork engine reacts to
#[derive(Debug)]
pub enum ForkEvent {
    /// Fork `request` to `contacts`; the new fork id is sent on `reply`
    NewRequest {
        request: Request,
        keys: Vec<String>,
        contacts: Vec<ContactTarget>,
        reply: Option<oneshot::Sender<ForkId>>,
    },
    /// Response on a branch. `None` when the transaction failed without one.
    Response {
        branch: BranchHandle,
        response: Option<Response>,
    },
    /// Answer to a CANCEL sent on a branch
    CancelResponse { branch: BranchHandle, status: u16 },
    /// CANCEL from the caller
    Cancel {
        fork: ForkId,
        request: Option<Request>,
    },
    /// A device registered for `key`
    NewRegister { key: String, contact: ContactTarget },
    /// A fork store job completed
    Store(StoreOutcome),
    Timer {
        fork: ForkId,
        timer: ForkTimer,
        token: TimerToken,
    },
    Summary {
        fork: ForkId,
        reply: oneshot::Sender<ForkResult<ForkSummary>>,
    },
    Stats {
        reply: oneshot::Sender<Vec<StatSnapshot>>,
    },
    Shutdown,
}

/// Timer scheduler backed by `tokio::time::sleep` tasks
pub struct TokioTimerScheduler {
    events: mpsc::UnboundedSender<ForkEvent>,
    next_token: AtomicU64,
    tasks: DashMap<TimerToken, JoinHandle<()>>,
}

impl TokioTimerScheduler {
    pub fn new(events: mpsc::UnboundedSender<ForkEvent>) -> Self {
        Self {
            events,
            next_token: AtomicU64::new(1),
            tasks: DashMap::new(),
        }
    }

    /// Forget an expired timer. Called by the loop when its event is processed.
    pub fn complete(&self, token: TimerToken) {
        self.tasks.remove(&token);
    }

    /// Number of armed timers
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }
}

impl TimerScheduler for TokioTimerScheduler {
    fn schedule(&self, fork: ForkId, timer: ForkTimer, delay: Duration) -> TimerToken {
        let token = TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The loop is gone when this fails; nothing left to notify
            let _ = events.send(ForkEvent::Timer { fork, timer, token });
        });
        self.tasks.insert(token, handle);
        token
    }

    fn cancel(&self, token: TimerToken) {
        if let Some((_, handle)) = self.tasks.remove(&token) {
            handle.abort();
        }
    }
}

/// Cloneable entry point for collaborators
#[derive(Debug, Clone)]
pub struct ForkRuntimeHandle {
    events: mpsc::UnboundedSender<ForkEvent>,
}

impl ForkRuntimeHandle {
    pub fn send(&self, event: ForkEvent) -> ForkResult<()> {
        self.events.send(event).map_err(|_| ForkError::RuntimeStopped)
    }

    /// Fork a request and wait for the fork id
    pub async fn fork(
        &self,
        request: Request,
        keys: Vec<String>,
        contacts: Vec<ContactTarget>,
    ) -> ForkResult<ForkId> {
        let (reply, rx) = oneshot::channel();
        self.send(ForkEvent::NewRequest {
            request,
            keys,
            contacts,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| ForkError::RuntimeStopped)
    }

    pub fn response(&self, branch: BranchHandle, response: Option<Response>) -> ForkResult<()> {
        self.send(ForkEvent::Response { branch, response })
    }

    pub fn cancel_response(&self, branch: BranchHandle, status: u16) -> ForkResult<()> {
        self.send(ForkEvent::CancelResponse { branch, status })
    }

    pub fn cancel(&self, fork: ForkId, request: Option<Request>) -> ForkResult<()> {
        self.send(ForkEvent::Cancel { fork, request })
    }

    pub fn new_register(&self, key: impl Into<String>, contact: ContactTarget) -> ForkResult<()> {
        self.send(ForkEvent::NewRegister {
            key: key.into(),
            contact,
        })
    }

    pub async fn summary(&self, fork: ForkId) -> ForkResult<ForkSummary> {
        let (reply, rx) = oneshot::channel();
        self.send(ForkEvent::Summary { fork, reply })?;
        rx.await.map_err(|_| ForkError::RuntimeStopped)?
    }

    pub async fn stats(&self) -> ForkResult<Vec<StatSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(ForkEvent::Stats { reply })?;
        rx.await.map_err(|_| ForkError::RuntimeStopped)
    }

    pub fn shutdown(&self) -> ForkResult<()> {
        self.send(ForkEvent::Shutdown)
    }
}

/// Single-task owner of the fork table
pub struct ForkRuntime {
    manager: ForkManager,
    scheduler: Arc<TokioTimerScheduler>,
    events: mpsc::UnboundedReceiver<ForkEvent>,
    handle: ForkRuntimeHandle,
}

impl ForkRuntime {
    /// Must be called within a tokio runtime: timers spawn tasks
    pub fn new(config: ForkManagerConfig, transactions: Arc<dyn TransactionLayer>) -> ForkResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(TokioTimerScheduler::new(tx.clone()));
        let services = ForkServices::new(transactions, scheduler.clone());
        let manager = ForkManager::new(config, services)?;
        Ok(Self {
            manager,
            scheduler,
            events: rx,
            handle: ForkRuntimeHandle { events: tx },
        })
    }

    /// Persist message forks in `store`. Store jobs run one at a time on
    /// tokio's blocking pool and report back through the event channel.
    pub fn with_store(mut self, store: Arc<dyn ForkStore>) -> Self {
        let events = self.handle.events.clone();
        let (writer, _task) = StoreWriter::spawn(store, move |outcome| {
            // The loop is gone when this fails; the job itself is done
            let _ = events.send(ForkEvent::Store(outcome));
        });
        self.manager = self.manager.with_store_writer(writer);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ForkContextListener>) -> Self {
        self.manager = self.manager.with_listener(listener);
        self
    }

    pub fn handle(&self) -> ForkRuntimeHandle {
        self.handle.clone()
    }

    pub fn manager(&self) -> &ForkManager {
        &self.manager
    }

    /// Register the forks found in the store. Call before [`Self::spawn`].
    pub fn restore_from_store(&mut self) -> ForkResult<usize> {
        self.manager.restore_from_store()
    }

    /// Process events until shutdown
    pub async fn run(mut self) {
        info!("Fork runtime started");
        while let Some(event) = self.events.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        info!("Fork runtime stopped with {} forks in memory", self.manager.len());
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Returns false on shutdown
    fn handle_event(&mut self, event: ForkEvent) -> bool {
        match event {
            ForkEvent::NewRequest {
                request,
                keys,
                contacts,
                reply,
            } => {
                let id = self.manager.create_fork(request, keys, contacts);
                if let Some(reply) = reply {
                    let _ = reply.send(id);
                }
            }
            ForkEvent::Response { branch, response } => self.manager.on_response(branch, response),
            ForkEvent::CancelResponse { branch, status } => self.manager.on_cancel_response(branch, status),
            ForkEvent::Cancel { fork, request } => self.manager.on_cancel(fork, request.as_ref()),
            ForkEvent::NewRegister { key, contact } => {
                let dispatched = self.manager.on_new_register(&key, &contact);
                debug!("REGISTER for {} dispatched to {} forks", key, dispatched.len());
            }
            ForkEvent::Store(outcome) => {
                let dispatched = self.manager.on_store_outcome(outcome);
                if !dispatched.is_empty() {
                    debug!("Loaded fork dispatched {} branches", dispatched.len());
                }
            }
            ForkEvent::Timer { fork, timer, token } => {
                self.scheduler.complete(token);
                self.manager.on_timer(fork, timer, token);
            }
            ForkEvent::Summary { fork, reply } => {
                let _ = reply.send(self.manager.summary(fork));
            }
            ForkEvent::Stats { reply } => {
                let _ = reply.send(self.manager.stats().snapshot());
            }
            ForkEvent::Shutdown => return false,
        }
        true
    }
}
