//! Fork statistics counters
//!
//! Each fork kind owns a [`StatPair`]: `start` is incremented when a fork
//! context is built and `finish` when it is dropped, so `start - finish` is the
//! number of forks alive. Contexts only hold a `Weak` reference and log an error
//! if the counters went away first.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct StatPair {
    name: String,
    start: AtomicU64,
    finish: AtomicU64,
}

impl StatPair {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: AtomicU64::new(0),
            finish: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn incr_start(&self) {
        self.start.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_finish(&self) {
        self.finish.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) -> u64 {
        self.start.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> u64 {
        self.finish.load(Ordering::Relaxed)
    }

    pub fn in_progress(&self) -> u64 {
        self.started().saturating_sub(self.finished())
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            name: self.name.clone(),
            started: self.started(),
            finished: self.finished(),
        }
    }
}

/// Point-in-time copy of a [`StatPair`], suitable for export
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatSnapshot {
    pub name: String,
    pub started: u64,
    pub finished: u64,
}
