//! Message fork persistence
//!
//! A message fork in fork-late mode can outlive the process: its flat
//! [`ForkMessageRecord`] is written to a [`ForkStore`] and reloaded at
//! start-up. Two stores are provided, an in-memory one and one that keeps a
//! JSON file per fork in a directory.
//!
//! Stores are blocking. The fork table reaches them through a [`StoreWriter`]:
//! either directly, or through a background task that runs one [`StoreJob`]
//! at a time on tokio's blocking pool and reports each [`StoreOutcome`] back
//! to the event loop.
//!
//! ```text
//! ForkManager ──StoreJob──▶ mpsc ──▶ writer task ──spawn_blocking──▶ ForkStore
//!      ▲                                  │
//!      └──── ForkEvent::Store(outcome) ◀──┘
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::branch::BranchRecord;
use crate::errors::{ForkError, ForkResult};
use crate::fork::ForkId;
use crate::message::{Request, parse_uri};

/// Flat form of a message fork
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkMessageRecord {
    pub is_message: bool,
    pub is_finished: bool,
    pub delivered_count: u32,
    pub current_priority: f32,
    /// Absolute delivery deadline, UTC
    pub expiration_date: Option<DateTime<Utc>>,
    /// The forked request. Its body is kept as raw bytes.
    pub request: Request,
    pub keys: Vec<String>,
    pub branches: Vec<BranchRecord>,
}

impl ForkMessageRecord {
    /// Check that the record can be turned back into a fork
    pub fn validate(&self) -> ForkResult<()> {
        for branch in &self.branches {
            parse_uri(&branch.contact)?;
        }
        Ok(())
    }
}

/// Durable storage of message forks
pub trait ForkStore: Send + Sync {
    /// Insert the record under `id`, replacing any previous version
    fn save(&self, id: Uuid, record: &ForkMessageRecord) -> ForkResult<()>;

    fn find_by_uuid(&self, id: Uuid) -> ForkResult<Option<ForkMessageRecord>>;

    fn delete_by_uuid(&self, id: Uuid) -> ForkResult<()>;

    /// Every stored record, for restoration at start-up
    fn load_all(&self) -> ForkResult<Vec<(Uuid, ForkMessageRecord)>>;
}

/// In-memory fork store
#[derive(Debug, Default, Clone)]
pub struct InMemoryForkStore {
    records: Arc<DashMap<Uuid, ForkMessageRecord>>,
}

impl InMemoryForkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ForkStore for InMemoryForkStore {
    fn save(&self, id: Uuid, record: &ForkMessageRecord) -> ForkResult<()> {
        self.records.insert(id, record.clone());
        Ok(())
    }

    fn find_by_uuid(&self, id: Uuid) -> ForkResult<Option<ForkMessageRecord>> {
        Ok(self.records.get(&id).map(|entry| entry.clone()))
    }

    fn delete_by_uuid(&self, id: Uuid) -> ForkResult<()> {
        self.records.remove(&id);
        Ok(())
    }

    fn load_all(&self) -> ForkResult<Vec<(Uuid, ForkMessageRecord)>> {
        Ok(self
            .records
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect())
    }
}

/// One `<uuid>.json` file per fork in a directory
#[derive(Debug, Clone)]
pub struct JsonDirForkStore {
    dir: PathBuf,
}

impl JsonDirForkStore {
    /// Open the store, creating the directory if needed
    pub fn open(dir: impl AsRef<Path>) -> ForkResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_of(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn write(&self, id: Uuid, record: &ForkMessageRecord) -> ForkResult<()> {
        let json = serde_json::to_vec_pretty(record)?;
        // Write then rename so that a crash never leaves a truncated record
        let tmp = self.dir.join(format!("{}.json.tmp", id));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.path_of(id))?;
        Ok(())
    }
}

impl ForkStore for JsonDirForkStore {
    fn save(&self, id: Uuid, record: &ForkMessageRecord) -> ForkResult<()> {
        self.write(id, record)?;
        debug!("Saved fork record {} in {}", id, self.dir.display());
        Ok(())
    }

    fn find_by_uuid(&self, id: Uuid) -> ForkResult<Option<ForkMessageRecord>> {
        let path = self.path_of(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn delete_by_uuid(&self, id: Uuid) -> ForkResult<()> {
        match fs::remove_file(self.path_of(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_all(&self) -> ForkResult<Vec<(Uuid, ForkMessageRecord)>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                warn!("Skipping unexpected file {} in fork store", path.display());
                continue;
            };
            match fs::read(&path).map_err(ForkError::from).and_then(|bytes| {
                serde_json::from_slice::<ForkMessageRecord>(&bytes).map_err(ForkError::from)
            }) {
                Ok(record) => records.push((id, record)),
                Err(e) => warn!("Skipping unreadable fork record {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }
}

/// One store access requested by the fork table
#[derive(Debug)]
pub enum StoreJob {
    Save {
        fork: ForkId,
        id: Uuid,
        record: ForkMessageRecord,
    },
    Delete {
        id: Uuid,
    },
    /// Read back an offloaded fork
    Load {
        fork: ForkId,
        id: Uuid,
    },
}

/// What the fork table needs to hear about a finished [`StoreJob`]
#[derive(Debug)]
pub enum StoreOutcome {
    /// `record` is now durable
    Saved { fork: ForkId, record: ForkMessageRecord },
    Loaded {
        fork: ForkId,
        record: ForkResult<Option<ForkMessageRecord>>,
    },
}

impl StoreJob {
    /// Run against `store`. Failed writes are logged; the fork stays in memory.
    pub fn run(self, store: &dyn ForkStore) -> Option<StoreOutcome> {
        match self {
            StoreJob::Save { fork, id, record } => match store.save(id, &record) {
                Ok(()) => Some(StoreOutcome::Saved { fork, record }),
                Err(e) => {
                    warn!("Fork [{}]: saving {} in store failed, kept in memory: {}", fork, id, e);
                    None
                }
            },
            StoreJob::Delete { id } => {
                if let Err(e) = store.delete_by_uuid(id) {
                    warn!("Cannot delete fork {} from store: {}", id, e);
                }
                None
            }
            StoreJob::Load { fork, id } => Some(StoreOutcome::Loaded {
                fork,
                record: store.find_by_uuid(id),
            }),
        }
    }
}

/// Access path from the fork table to its [`ForkStore`]
#[derive(Clone)]
pub struct StoreWriter {
    store: Arc<dyn ForkStore>,
    queue: Option<mpsc::UnboundedSender<StoreJob>>,
}

impl StoreWriter {
    /// Run every job on the caller's thread
    pub fn direct(store: Arc<dyn ForkStore>) -> Self {
        Self { store, queue: None }
    }

    /// Run jobs in submission order on tokio's blocking pool, handing outcomes
    /// to `outcomes`. Must be called within a tokio runtime. The task ends
    /// once every clone of the writer is dropped and the queue is drained.
    pub fn spawn<F>(store: Arc<dyn ForkStore>, outcomes: F) -> (Self, JoinHandle<()>)
    where
        F: Fn(StoreOutcome) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<StoreJob>();
        let worker_store = store.clone();
        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let store = worker_store.clone();
                match tokio::task::spawn_blocking(move || job.run(store.as_ref())).await {
                    Ok(Some(outcome)) => outcomes(outcome),
                    Ok(None) => {}
                    Err(e) => error!("Fork store job failed to complete: {}", e),
                }
            }
            debug!("Fork store writer stopped");
        });
        (
            Self {
                store,
                queue: Some(tx),
            },
            task,
        )
    }

    pub fn store(&self) -> &Arc<dyn ForkStore> {
        &self.store
    }

    pub fn is_direct(&self) -> bool {
        self.queue.is_none()
    }

    /// Run or queue `job`. A direct writer returns the outcome right away,
    /// a background one delivers it later.
    pub fn submit(&self, job: StoreJob) -> Option<StoreOutcome> {
        match &self.queue {
            None => job.run(self.store.as_ref()),
            Some(queue) => {
                if let Err(e) = queue.send(job) {
                    error!("Fork store writer is gone, dropping {:?}", e.0);
                }
                None
            }
        }
    }
}

impl fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreWriter")
            .field("direct", &self.is_direct())
            .finish()
    }
}
