// ABOUTME: Durable log store capability used by the delivery channel.
// ABOUTME: Defines the LogStore trait, the LogBatch read result, and StoreError.

use thiserror::Error;

use crate::log::Log;

/// Errors reported by a log store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    LockPoisoned,
}

/// A set of records read from the store under one batch id.
#[derive(Debug, Clone, PartialEq)]
pub struct LogBatch {
    pub batch_id: String,
    pub logs: Vec<Log>,
}

/// Durable, group-partitioned record storage.
///
/// Rows returned by `get_logs` become *pending*: later reads skip them until
/// the batch is deleted or `clear_pending_state` forgets every pending batch.
/// `count` includes pending rows. Implementations use interior mutability so
/// the channel can share them behind an `Arc`.
pub trait LogStore: Send + Sync {
    /// Persist a record for a group and return its row id.
    fn put(&self, group: &str, log: &Log) -> Result<i64, StoreError>;

    /// Read up to `limit` non-pending records for a group, oldest first.
    /// Returns `None` when there is nothing to read.
    fn get_logs(&self, group: &str, limit: usize) -> Result<Option<LogBatch>, StoreError>;

    /// Delete the rows of a batch previously returned by `get_logs`.
    fn delete_batch(&self, group: &str, batch_id: &str) -> Result<(), StoreError>;

    /// Delete every row of a group, pending or not.
    fn delete_group(&self, group: &str) -> Result<(), StoreError>;

    /// Number of stored rows for a group, pending rows included.
    fn count(&self, group: &str) -> Result<usize, StoreError>;

    /// Forget every pending batch so its rows can be read again.
    fn clear_pending_state(&self) -> Result<(), StoreError>;
}
