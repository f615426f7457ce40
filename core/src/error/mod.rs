//! Error types for the operation log engine.
//!
//! Each concern has its own enum. [`OpLogError`] is the umbrella returned by the
//! orchestrating components and converts from all of them.

use oplog_proto::{DecodeError, OpId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out acquiring lock {0}")]
    Timeout(String),
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    /// The backend refused a write for lack of space
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("background task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

impl From<DecodeError> for StorageError {
    fn from(err: DecodeError) -> Self { StorageError::Corrupt(err.to_string()) }
}

/// Failures of the external state store
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateError {
    #[error("entity not found: {0}")]
    EntityNotFound(String),
    #[error("invalid payload for {op_id}: {reason}")]
    InvalidPayload { op_id: OpId, reason: String },
    #[error("state error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("operation schema version {found} is older than the minimum supported {min}")]
    VersionTooOld { found: u32, min: u32 },
    #[error("operation schema version {found} is too far ahead of {current}; update required")]
    VersionUnsupported { found: u32, current: u32 },
    #[error("invalid migration registry: {0}")]
    InvalidRegistry(String),
    #[error("migration from v{from} failed: {reason}")]
    Failed { from: u32, reason: String },
}

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("compaction phase {phase} exceeded its time budget")]
    Timeout { phase: &'static str },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("transport request failed: {0}")]
    Request(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum OpLogError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Compaction(#[from] CompactionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("capture queue did not drain within {0:?}")]
    FlushTimeout(std::time::Duration),
    #[error("partial apply: {applied} applied, {failed_op} and {remaining} later ops failed: {cause}")]
    PartialApply { applied: usize, failed_op: OpId, remaining: usize, cause: StateError },
}
