//! Fork branches
//!
//! A [`BranchInfo`] is one outgoing attempt to reach a registered device. Its
//! identity (uid, destination, priority) is fixed at creation; its status and
//! last response are only updated by the owning fork context when a response
//! arrives. Branches live in a [`BranchArena`] owned by the context and are
//! addressed by generation-checked [`BranchId`]s.

use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::errors::ForkResult;
use crate::message::{Request, Response, ResponseExt, Uri, parse_uri};
use crate::transaction::OutgoingTransaction;

/// Index of a branch in its fork's arena, plus the generation of the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch#{}.{}", self.index, self.generation)
    }
}

/// Why a branch was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForkStatus {
    Standard,
    AcceptedElsewhere,
    DeclineElsewhere,
}

/// Push notification platform of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushPlatform {
    Apple,
    Firebase,
    Other(String),
}

/// Push notification state attached to a branch by the push module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushContext {
    pub platform: PushPlatform,
    pub device_token: String,
}

impl PushContext {
    pub fn new(platform: PushPlatform, device_token: impl Into<String>) -> Self {
        Self {
            platform,
            device_token: device_token.into(),
        }
    }

    pub fn is_apple(&self) -> bool {
        self.platform == PushPlatform::Apple
    }
}

/// Observer of one device's branches. Moves to the replacing branch when a
/// branch is superseded by a new one for the same uid.
pub trait BranchListener: Send + Sync {
    fn on_branch_completed(&self, _branch: &BranchInfo) {}

    fn on_branch_canceled(&self, _branch: &BranchInfo, _status: ForkStatus) {}
}

/// A registered destination the request can be forked to
#[derive(Debug, Clone)]
pub struct ContactTarget {
    /// Device instance id (`+sip.instance`), may be empty
    pub uid: String,
    pub uri: Uri,
    /// q-value, higher is preferred
    pub priority: f32,
    pub push_context: Weak<PushContext>,
}

impl ContactTarget {
    pub fn new(uid: impl Into<String>, uri: Uri, priority: f32) -> Self {
        Self {
            uid: uid.into(),
            uri,
            priority,
            push_context: Weak::new(),
        }
    }

    pub fn with_push_context(mut self, push_context: &Arc<PushContext>) -> Self {
        self.push_context = Arc::downgrade(push_context);
        self
    }
}

/// One outgoing attempt to reach a device
pub struct BranchInfo {
    id: BranchId,
    pub(crate) uid: String,
    pub(crate) contact: ContactTarget,
    pub(crate) priority: f32,
    pub(crate) request: Request,
    pub(crate) last_response: Option<Response>,
    pub(crate) status: u16,
    pub(crate) transaction: Option<Box<dyn OutgoingTransaction>>,
    pub(crate) cleared_count: u32,
    pub(crate) cancel_sent: bool,
    pub(crate) cancel_completed: bool,
    pub(crate) listener: Option<Arc<dyn BranchListener>>,
    pub(crate) push_context: Weak<PushContext>,
}

impl BranchInfo {
    pub(crate) fn new(
        id: BranchId,
        request: Request,
        contact: ContactTarget,
        transaction: Option<Box<dyn OutgoingTransaction>>,
    ) -> Self {
        Self {
            id,
            uid: contact.uid.clone(),
            priority: contact.priority,
            push_context: contact.push_context.clone(),
            contact,
            request,
            last_response: None,
            status: 0,
            transaction,
            cleared_count: 0,
            cancel_sent: false,
            cancel_completed: false,
            listener: None,
        }
    }

    pub fn id(&self) -> BranchId {
        self.id
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn contact(&self) -> &ContactTarget {
        &self.contact
    }

    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }

    /// Status of the last response, 0 when nothing was received yet
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn cleared_count(&self) -> u32 {
        self.cleared_count
    }

    pub fn is_cancel_completed(&self) -> bool {
        self.cancel_completed
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn push_context(&self) -> Option<Arc<PushContext>> {
        self.push_context.upgrade()
    }

    pub fn set_listener(&mut self, listener: Arc<dyn BranchListener>) {
        self.listener = Some(listener);
    }

    /// Whether this device may still need the request: nothing final was
    /// received, or the last attempt failed with a retryable 503/408.
    pub fn needs_delivery(&self) -> bool {
        !self.cancel_completed && (self.status < 200 || self.status == 503 || self.status == 408)
    }

    pub(crate) fn record_response(&mut self, response: Response) {
        self.status = response.code();
        self.last_response = Some(response);
    }

    /// Take over the device state of a branch this one supersedes
    pub(crate) fn inherit_from(&mut self, old: &mut BranchInfo) {
        self.cleared_count = old.cleared_count + 1;
        self.listener = old.listener.take();
        self.push_context = old.push_context.clone();
    }

    pub(crate) fn notify_completed(&self) {
        if let Some(listener) = &self.listener {
            listener.on_branch_completed(self);
        }
    }

    pub(crate) fn notify_canceled(&self, status: ForkStatus) {
        if let Some(listener) = &self.listener {
            listener.on_branch_canceled(self, status);
        }
    }

    pub fn to_record(&self) -> BranchRecord {
        BranchRecord {
            uid: self.uid.clone(),
            priority: self.priority,
            request: self.request.clone(),
            status: self.status,
            contact: self.contact.uri.to_string(),
            cleared_count: self.cleared_count,
        }
    }

    /// Rebuild a branch from its persisted form. Restored branches have no
    /// transaction: they only inform later dispatch decisions.
    pub(crate) fn restore(id: BranchId, record: &BranchRecord) -> ForkResult<Self> {
        let request = record.request.clone();
        let contact = ContactTarget::new(record.uid.clone(), parse_uri(&record.contact)?, record.priority);
        let mut branch = Self::new(id, request, contact, None);
        branch.status = record.status;
        branch.cleared_count = record.cleared_count;
        Ok(branch)
    }
}

impl fmt::Debug for BranchInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchInfo")
            .field("id", &self.id)
            .field("uid", &self.uid)
            .field("uri", &self.request.uri.to_string())
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("has_transaction", &self.transaction.is_some())
            .field("cleared_count", &self.cleared_count)
            .field("cancel_completed", &self.cancel_completed)
            .finish()
    }
}

/// Flat persisted form of a branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub uid: String,
    pub priority: f32,
    pub request: Request,
    pub status: u16,
    pub contact: String,
    #[serde(default)]
    pub cleared_count: u32,
}

struct Slot {
    generation: u32,
    branch: Option<BranchInfo>,
}

/// Storage for the branches of one fork
#[derive(Default)]
pub struct BranchArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl BranchArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_with(&mut self, build: impl FnOnce(BranchId) -> BranchInfo) -> BranchId {
        let id = match self.free.pop() {
            Some(index) => BranchId {
                index,
                generation: self.slots[index as usize].generation,
            },
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    branch: None,
                });
                BranchId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.slots[id.index as usize].branch = Some(build(id));
        self.len += 1;
        id
    }

    /// Reserve the id the next insertion will use
    pub fn next_id(&self) -> BranchId {
        match self.free.last() {
            Some(&index) => BranchId {
                index,
                generation: self.slots[index as usize].generation,
            },
            None => BranchId {
                index: self.slots.len() as u32,
                generation: 0,
            },
        }
    }

    pub fn get(&self, id: BranchId) -> Option<&BranchInfo> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.branch.as_ref())
    }

    pub fn get_mut(&mut self, id: BranchId) -> Option<&mut BranchInfo> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.branch.as_mut())
    }

    pub fn contains(&self, id: BranchId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: BranchId) -> Option<BranchInfo> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let branch = slot.branch.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(branch)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
