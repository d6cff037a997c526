//! Error types for the fork-core library
//!
//! The fork engine itself never surfaces errors to transaction-layer callbacks:
//! branch failures become SIP status codes and internal inconsistencies are
//! logged and ignored. These types cover the outer surfaces only, that is
//! configuration, the persistence store, the message codec and the runtime
//! handle.

use thiserror::Error;

use crate::fork::ForkId;

#[derive(Error, Debug)]
pub enum ForkError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid SIP message: {0}")]
    InvalidMessage(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Fork not found: {0}")]
    ForkNotFound(ForkId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Fork runtime is not running")]
    RuntimeStopped,
}

impl ForkError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceError(message.into())
    }
}

pub type ForkResult<T> = std::result::Result<T, ForkError>;
