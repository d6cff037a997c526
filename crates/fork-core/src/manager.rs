//! Fork table
//!
//! The [`ForkManager`] owns every live fork context, indexed by id and by
//! routing key (typically the address-of-record of the target user). It turns
//! collaborator events into context calls, removes contexts once their finish
//! notification went out, and keeps fork-late message forks in the
//! [`ForkStore`] so that they survive a restart.
//!
//! A saved message fork whose branches have all answered has nothing to do
//! until a device registers or its deadline passes. It is offloaded: the
//! context is dropped and only its store id, routing keys and deadline timer
//! stay in memory. The next REGISTER on one of its keys loads it back.
//!
//! ```text
//!   request ──▶ create_fork ──▶ ForkContext ──▶ branches ──▶ devices
//!   REGISTER ─▶ on_new_register(key) ──┘   │  ▲
//!                                 save/offload│  │load
//!                                          ▼  │
//!                                        ForkStore (message, fork-late)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rvoip_sip_core::types::uri::Host;
use serde::Serialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::branch::{BranchId, ContactTarget};
use crate::config::{ForkContextConfig, ForkManagerConfig};
use crate::errors::{ForkError, ForkResult};
use crate::fork::{ForkContext, ForkContextListener, ForkId, ForkServices, ForkType, TimerOutcome, time_left};
use crate::message::{Method, Request, RequestExt, Response, Uri};
use crate::persistence::{ForkMessageRecord, ForkStore, StoreJob, StoreOutcome, StoreWriter};
use crate::stats::{StatPair, StatSnapshot};
use crate::timer::{ForkTimer, ForkTimers, TimerToken};
use crate::transaction::BranchHandle;

/// Live fork counters, one pair per kind
#[derive(Debug)]
pub struct ForkStats {
    pub call: Arc<StatPair>,
    pub message: Arc<StatPair>,
    pub basic: Arc<StatPair>,
}

impl Default for ForkStats {
    fn default() -> Self {
        Self {
            call: Arc::new(StatPair::new("count-call-forks")),
            message: Arc::new(StatPair::new("count-message-forks")),
            basic: Arc::new(StatPair::new("count-basic-forks")),
        }
    }
}

impl ForkStats {
    fn for_type(&self, fork_type: ForkType) -> &Arc<StatPair> {
        match fork_type {
            ForkType::Call => &self.call,
            ForkType::Message => &self.message,
            ForkType::Basic => &self.basic,
        }
    }

    pub fn snapshot(&self) -> Vec<StatSnapshot> {
        vec![self.call.snapshot(), self.message.snapshot(), self.basic.snapshot()]
    }
}

/// Diagnostic view of a fork
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForkSummary {
    pub id: ForkId,
    pub fork_type: ForkType,
    pub finished: bool,
    pub has_incoming: bool,
    pub last_response_code: u16,
    pub branches: Vec<BranchSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchSummary {
    pub uid: String,
    pub uri: String,
    pub priority: f32,
    pub status: u16,
}

/// Collects finish notifications until the manager drains them
#[derive(Default)]
struct FinishedForks {
    queue: Mutex<Vec<ForkId>>,
    forward_to: Option<Arc<dyn ForkContextListener>>,
}

impl ForkContextListener for FinishedForks {
    fn on_fork_context_finished(&self, fork: ForkId, keys: &[String]) {
        self.queue.lock().push(fork);
        if let Some(listener) = &self.forward_to {
            listener.on_fork_context_finished(fork, keys);
        }
    }
}

/// A device a message fork refused on REGISTER
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeliveredDevice {
    uid: String,
    host: Host,
    port: Option<u16>,
}

impl DeliveredDevice {
    fn matches(&self, dest: &Uri, uid: &str) -> bool {
        if !uid.is_empty() || !self.uid.is_empty() {
            self.uid == uid
        } else {
            self.host == dest.host && self.port == dest.port
        }
    }
}

struct PersistedFork {
    uuid: Uuid,
    /// Last record handed to the store
    queued: ForkMessageRecord,
    /// Last record the store confirmed
    saved: Option<ForkMessageRecord>,
}

/// A message fork that only lives in the store
struct OffloadedFork {
    uuid: Uuid,
    keys: Vec<String>,
    late: ForkTimers,
    /// Devices that registered while the record was away
    pending: Vec<ContactTarget>,
    loading: bool,
}

pub struct ForkManager {
    call_config: Arc<ForkContextConfig>,
    message_config: Arc<ForkContextConfig>,
    basic_config: Arc<ForkContextConfig>,
    services: ForkServices,
    forks: HashMap<ForkId, ForkContext>,
    by_key: HashMap<String, Vec<ForkId>>,
    stats: ForkStats,
    store: Option<StoreWriter>,
    persisted: HashMap<ForkId, PersistedFork>,
    offloaded: HashMap<ForkId, OffloadedFork>,
    already_delivered: HashMap<ForkId, Vec<DeliveredDevice>>,
    finished: Arc<FinishedForks>,
}

impl ForkManager {
    pub fn new(config: ForkManagerConfig, services: ForkServices) -> ForkResult<Self> {
        config.validate()?;
        Ok(Self {
            call_config: Arc::new(config.call),
            message_config: Arc::new(config.message),
            basic_config: Arc::new(config.basic),
            services,
            forks: HashMap::new(),
            by_key: HashMap::new(),
            stats: ForkStats::default(),
            store: None,
            persisted: HashMap::new(),
            offloaded: HashMap::new(),
            already_delivered: HashMap::new(),
            finished: Arc::new(FinishedForks::default()),
        })
    }

    /// Persist fork-late message forks in `store`, accessed on the caller's
    /// thread
    pub fn with_store(self, store: Arc<dyn ForkStore>) -> Self {
        self.with_store_writer(StoreWriter::direct(store))
    }

    /// Persist fork-late message forks through `writer`. Outcomes of a
    /// background writer must be fed back through [`Self::on_store_outcome`].
    pub fn with_store_writer(mut self, writer: StoreWriter) -> Self {
        self.store = Some(writer);
        self
    }

    /// Also notify `listener` when a fork finishes
    pub fn with_listener(mut self, listener: Arc<dyn ForkContextListener>) -> Self {
        self.finished = Arc::new(FinishedForks {
            queue: Mutex::new(Vec::new()),
            forward_to: Some(listener),
        });
        self
    }

    /// Fork kind used for a request method
    pub fn fork_type_for(method: &Method) -> ForkType {
        match method {
            Method::Invite => ForkType::Call,
            Method::Message => ForkType::Message,
            _ => ForkType::Basic,
        }
    }

    fn config_for(&self, fork_type: ForkType) -> Arc<ForkContextConfig> {
        match fork_type {
            ForkType::Call => self.call_config.clone(),
            ForkType::Message => self.message_config.clone(),
            ForkType::Basic => self.basic_config.clone(),
        }
    }

    fn listener(&self) -> Weak<dyn ForkContextListener> {
        let listener: Arc<dyn ForkContextListener> = self.finished.clone();
        Arc::downgrade(&listener)
    }

    pub fn stats(&self) -> &ForkStats {
        &self.stats
    }

    /// Live forks, offloaded ones included
    pub fn len(&self) -> usize {
        self.forks.len() + self.offloaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forks.is_empty() && self.offloaded.is_empty()
    }

    /// Whether fork `id` currently lives in the store only
    pub fn is_offloaded(&self, id: ForkId) -> bool {
        self.offloaded.contains_key(&id)
    }

    pub fn offloaded_count(&self) -> usize {
        self.offloaded.len()
    }

    pub fn fork(&self, id: ForkId) -> Option<&ForkContext> {
        self.forks.get(&id)
    }

    pub fn fork_mut(&mut self, id: ForkId) -> Option<&mut ForkContext> {
        self.forks.get_mut(&id)
    }

    /// Forks waiting on routing key `key`
    pub fn forks_for_key(&self, key: &str) -> &[ForkId] {
        self.by_key.get(key).map_or(&[], Vec::as_slice)
    }

    pub fn summary(&self, id: ForkId) -> ForkResult<ForkSummary> {
        if self.offloaded.contains_key(&id) {
            return Err(ForkError::InvalidState(format!("fork {} is offloaded to the store", id)));
        }
        let context = self.forks.get(&id).ok_or(ForkError::ForkNotFound(id))?;
        Ok(ForkSummary {
            id,
            fork_type: context.fork_type(),
            finished: context.is_finished(),
            has_incoming: context.has_incoming(),
            last_response_code: context.last_response_code(),
            branches: context
                .branches()
                .map(|b| BranchSummary {
                    uid: b.uid().to_string(),
                    uri: b.request().uri.to_string(),
                    priority: b.priority(),
                    status: b.status(),
                })
                .collect(),
        })
    }

    /// Store id of a persisted fork
    pub fn persisted_uuid(&self, id: ForkId) -> Option<Uuid> {
        self.persisted
            .get(&id)
            .map(|p| p.uuid)
            .or_else(|| self.offloaded.get(&id).map(|o| o.uuid))
    }

    /// Fork `request` to `contacts` and start the first priority tier
    pub fn create_fork(&mut self, request: Request, keys: Vec<String>, contacts: Vec<ContactTarget>) -> ForkId {
        let fork_type = Self::fork_type_for(&request.method);
        let mut context = ForkContext::new(fork_type, request, self.config_for(fork_type), self.services.clone())
            .with_listener(self.listener())
            .with_stat_counter(self.stats.for_type(fork_type));
        for key in keys {
            context.add_key(key);
        }
        for contact in contacts {
            let branch_request = context.request().retarget(contact.uri.clone());
            context.add_branch(branch_request, contact);
        }

        let id = context.id();
        info!(
            "Created {} [{}] with {} branches",
            fork_type,
            id,
            context.branches().count()
        );
        self.insert(context);
        if let Some(context) = self.forks.get_mut(&id) {
            context.start();
        }
        self.after_event(id);
        id
    }

    fn insert(&mut self, context: ForkContext) {
        let id = context.id();
        for key in context.keys() {
            self.by_key.entry(key.clone()).or_default().push(id);
        }
        self.forks.insert(id, context);
    }

    pub fn on_response(&mut self, handle: BranchHandle, response: Option<Response>) {
        match self.forks.get_mut(&handle.fork) {
            Some(context) => context.on_response(handle.branch, response),
            None => {
                debug!("Response for unknown fork {}, ignoring", handle.fork);
                return;
            }
        }
        self.after_event(handle.fork);
    }

    pub fn on_cancel_response(&mut self, handle: BranchHandle, status: u16) {
        let Some(context) = self.forks.get_mut(&handle.fork) else {
            return;
        };
        context.on_cancel_response(handle.branch, status);
        self.after_event(handle.fork);
    }

    pub fn on_cancel(&mut self, fork: ForkId, cancel: Option<&Request>) {
        let Some(context) = self.forks.get_mut(&fork) else {
            debug!("CANCEL for unknown fork {}, ignoring", fork);
            return;
        };
        context.on_cancel(cancel);
        self.after_event(fork);
    }

    pub fn on_timer(&mut self, fork: ForkId, timer: ForkTimer, token: TimerToken) {
        if let Some(offloaded) = self.offloaded.get_mut(&fork) {
            if offloaded.late.fire(timer, token) {
                info!("Fork [{}]: delivery deadline reached while in store", fork);
                self.finish_offloaded(fork);
            }
            return;
        }
        let Some(context) = self.forks.get_mut(&fork) else {
            return;
        };
        if context.on_timer(timer, token) != TimerOutcome::Stale {
            self.after_event(fork);
        }
    }

    /// A device registered for `key`: offer it to every fork waiting on that
    /// key. Returns the branches that were created. With a background store
    /// writer, offloaded forks dispatch later, from [`Self::on_store_outcome`].
    pub fn on_new_register(&mut self, key: &str, contact: &ContactTarget) -> Vec<(ForkId, BranchId)> {
        let mut dispatched = Vec::new();
        for id in self.forks_for_key(key).to_vec() {
            dispatched.extend(self.offer(id, contact));
        }
        dispatched
    }

    fn offer(&mut self, id: ForkId, contact: &ContactTarget) -> Vec<(ForkId, BranchId)> {
        if self.is_already_delivered(id, &contact.uri, &contact.uid) {
            debug!("Fork [{}]: {} already refused, skipping", id, contact.uid);
            return Vec::new();
        }
        if self.offloaded.contains_key(&id) {
            return self.reload(id, contact);
        }
        self.register_on(id, contact)
            .map(|branch| vec![(id, branch)])
            .unwrap_or_default()
    }

    fn register_on(&mut self, id: ForkId, contact: &ContactTarget) -> Option<BranchId> {
        let context = self.forks.get_mut(&id)?;
        if context.is_finished() {
            return None;
        }
        let is_message = context.fork_type() == ForkType::Message;
        let branch = context.on_new_register(&contact.uri, &contact.uid, |context| {
            let request = context.request().retarget(contact.uri.clone());
            let branch = context.add_branch(request, contact.clone());
            if !context.current_branches().contains(&branch) && !context.is_timer_running(ForkTimer::NextBranches) {
                context.start();
            }
            Some(branch)
        });

        if branch.is_none() && is_message {
            self.already_delivered.entry(id).or_default().push(DeliveredDevice {
                uid: contact.uid.clone(),
                host: contact.uri.host.clone(),
                port: contact.uri.port,
            });
        }
        self.after_event(id);
        branch
    }

    fn is_already_delivered(&self, id: ForkId, dest: &Uri, uid: &str) -> bool {
        self.already_delivered
            .get(&id)
            .is_some_and(|devices| devices.iter().any(|d| d.matches(dest, uid)))
    }

    /// Ask the store for an offloaded fork on behalf of `contact`
    fn reload(&mut self, id: ForkId, contact: &ContactTarget) -> Vec<(ForkId, BranchId)> {
        let Some(writer) = self.store.clone() else {
            return Vec::new();
        };
        let Some(offloaded) = self.offloaded.get_mut(&id) else {
            return Vec::new();
        };
        offloaded.pending.push(contact.clone());
        if offloaded.loading {
            return Vec::new();
        }
        offloaded.loading = true;
        debug!("Fork [{}]: loading {} from store for {}", id, offloaded.uuid, contact.uid);
        match writer.submit(StoreJob::Load {
            fork: id,
            id: offloaded.uuid,
        }) {
            Some(outcome) => self.on_store_outcome(outcome),
            None => Vec::new(),
        }
    }

    /// Completion of a store job. Returns the branches created for devices
    /// that registered while their fork was being loaded.
    pub fn on_store_outcome(&mut self, outcome: StoreOutcome) -> Vec<(ForkId, BranchId)> {
        match outcome {
            StoreOutcome::Saved { fork, record } => {
                if let Some(persisted) = self.persisted.get_mut(&fork) {
                    // An older save completing late does not count
                    if persisted.queued == record {
                        persisted.saved = Some(record);
                    }
                }
                self.offload_if_idle(fork);
                Vec::new()
            }
            StoreOutcome::Loaded { fork, record } => self.on_loaded(fork, record),
        }
    }

    fn on_loaded(&mut self, id: ForkId, loaded: ForkResult<Option<ForkMessageRecord>>) -> Vec<(ForkId, BranchId)> {
        let Some(offloaded) = self.offloaded.remove(&id) else {
            debug!("Fork [{}] ended while being loaded from store", id);
            return Vec::new();
        };
        let restored = match loaded {
            Ok(Some(record)) => ForkContext::restore_message(
                id,
                &record,
                self.message_config.clone(),
                self.services.clone(),
                self.listener(),
                &self.stats.message,
            )
            .map(|context| (context, record)),
            Ok(None) => Err(ForkError::persistence(format!("no fork stored with id {}", offloaded.uuid))),
            Err(e) => Err(e),
        };

        match restored {
            Ok((context, record)) => {
                info!("Fork [{}] loaded back from store {}", id, offloaded.uuid);
                self.persisted.insert(
                    id,
                    PersistedFork {
                        uuid: offloaded.uuid,
                        queued: record.clone(),
                        saved: Some(record),
                    },
                );
                // Its keys never left the key index
                self.forks.insert(id, context);
                let mut dispatched = Vec::new();
                for contact in &offloaded.pending {
                    dispatched.extend(self.offer(id, contact));
                }
                dispatched
            }
            Err(e) => {
                error!("Fork [{}]: cannot load {} from store, dropping it: {}", id, offloaded.uuid, e);
                self.offloaded.insert(id, offloaded);
                self.finish_offloaded(id);
                Vec::new()
            }
        }
    }

    /// Drop the context of a saved message fork that waits for nothing but a
    /// REGISTER or its deadline
    fn offload_if_idle(&mut self, id: ForkId) {
        let (Some(context), Some(persisted)) = (self.forks.get(&id), self.persisted.get(&id)) else {
            return;
        };
        let expiration = context.message().and_then(|m| m.expiration());
        let idle = !context.is_finished()
            && !context.has_incoming()
            && expiration.is_some()
            && context.all_branches_answered(false);
        if !idle || persisted.saved.is_none() || persisted.saved != context.to_record() {
            return;
        }

        let uuid = persisted.uuid;
        let keys = context.keys().to_vec();
        self.persisted.remove(&id);
        self.forks.remove(&id);
        let mut late = ForkTimers::new(id, self.services.timers.clone());
        late.set(ForkTimer::Late, time_left(expiration));
        info!("Fork [{}]: every branch answered, offloaded to store as {}", id, uuid);
        self.offloaded.insert(
            id,
            OffloadedFork {
                uuid,
                keys,
                late,
                pending: Vec::new(),
                loading: false,
            },
        );
    }

    fn finish_offloaded(&mut self, id: ForkId) {
        let Some(offloaded) = self.offloaded.get(&id) else {
            return;
        };
        let keys = offloaded.keys.clone();
        self.finished.on_fork_context_finished(id, &keys);
        self.reap_finished();
    }

    /// Register the message forks found in the store. They stay offloaded
    /// until a device registers on one of their keys or their deadline
    /// passes. Reads the whole store on the caller's thread: call it before
    /// the event loop starts. Returns how many forks were registered.
    pub fn restore_from_store(&mut self) -> ForkResult<usize> {
        let Some(writer) = self.store.clone() else {
            return Err(ForkError::InvalidState("no fork store configured".to_string()));
        };
        let mut restored = 0;
        for (uuid, record) in writer.store().load_all()? {
            if record.is_finished {
                writer.submit(StoreJob::Delete { id: uuid });
                continue;
            }
            if let Err(e) = record.validate() {
                error!("Cannot restore fork {} from store, dropping it: {}", uuid, e);
                writer.submit(StoreJob::Delete { id: uuid });
                continue;
            }

            let id = ForkId::new();
            let mut late = ForkTimers::new(id, self.services.timers.clone());
            late.set(ForkTimer::Late, time_left(record.expiration_date));
            for key in &record.keys {
                self.by_key.entry(key.clone()).or_default().push(id);
            }
            self.offloaded.insert(
                id,
                OffloadedFork {
                    uuid,
                    keys: record.keys,
                    late,
                    pending: Vec::new(),
                    loading: false,
                },
            );
            restored += 1;
        }
        info!("Restored {} message forks from store", restored);
        Ok(restored)
    }

    fn after_event(&mut self, id: ForkId) {
        self.persist(id);
        self.offload_if_idle(id);
        self.reap_finished();
    }

    /// Save a fork-late message fork whose record changed since the last save
    fn persist(&mut self, id: ForkId) {
        let Some(writer) = self.store.clone() else {
            return;
        };
        let Some(context) = self.forks.get(&id) else {
            return;
        };
        if !context.config().fork_late || context.is_finished() {
            return;
        }
        let Some(record) = context.to_record() else {
            return;
        };

        let uuid = match self.persisted.get_mut(&id) {
            Some(persisted) if persisted.queued == record => return,
            Some(persisted) => {
                persisted.queued = record.clone();
                persisted.uuid
            }
            None => {
                let uuid = Uuid::new_v4();
                debug!("Fork [{}] saved in store as {}", id, uuid);
                self.persisted.insert(
                    id,
                    PersistedFork {
                        uuid,
                        queued: record.clone(),
                        saved: None,
                    },
                );
                uuid
            }
        };
        if let Some(outcome) = writer.submit(StoreJob::Save {
            fork: id,
            id: uuid,
            record,
        }) {
            self.on_store_outcome(outcome);
        }
    }

    fn reap_finished(&mut self) {
        let finished: Vec<ForkId> = std::mem::take(&mut *self.finished.queue.lock());
        for id in finished {
            let (keys, uuid) = if let Some(context) = self.forks.remove(&id) {
                (context.keys().to_vec(), self.persisted.remove(&id).map(|p| p.uuid))
            } else if let Some(offloaded) = self.offloaded.remove(&id) {
                (offloaded.keys, Some(offloaded.uuid))
            } else {
                continue;
            };
            for key in &keys {
                if let Some(ids) = self.by_key.get_mut(key) {
                    ids.retain(|f| *f != id);
                    if ids.is_empty() {
                        self.by_key.remove(key);
                    }
                }
            }
            self.already_delivered.remove(&id);
            if let (Some(uuid), Some(writer)) = (uuid, &self.store) {
                writer.submit(StoreJob::Delete { id: uuid });
            }
            debug!("Fork [{}] removed from fork table", id);
        }
    }
}

impl std::fmt::Debug for ForkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkManager")
            .field("forks", &self.forks.len())
            .field("keys", &self.by_key.len())
            .field("persisted", &self.persisted.len())
            .field("offloaded", &self.offloaded.len())
            .finish()
    }
}
