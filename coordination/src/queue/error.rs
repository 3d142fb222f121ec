//! Queue error types

use tracing::error;

use crate::error::{ErrorKind, TaskError};

/// Error type for queue operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict on task {task_id}: {reason}")]
    Conflict { task_id: String, reason: String },

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A record in the store could not be encoded or decoded. The store
    /// itself is reachable.
    #[error("Corrupt task record: {0}")]
    Corrupted(String),
}

impl QueueError {
    pub(crate) fn conflict(task_id: &str, reason: impl Into<String>) -> Self {
        Self::Conflict {
            task_id: task_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Machine-readable kind for persisting this error on a task.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict { .. } | Self::NotFound(_) => ErrorKind::Conflict,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::Corrupted(_) => ErrorKind::StorageCorrupted,
        }
    }

    /// Whether the backing store could not be reached.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl From<QueueError> for TaskError {
    fn from(err: QueueError) -> Self {
        TaskError::new(err.kind(), err.to_string())
    }
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Error type for backing store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Duplicate task id: {0}")]
    Duplicate(String),

    #[cfg(feature = "durable")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(id) => {
                QueueError::Validation(format!("task id {} already exists", id))
            }
            StoreError::Serialization(reason) | StoreError::Deserialization(reason) => {
                error!(reason = %reason, "Corrupt task record in store");
                QueueError::Corrupted(reason)
            }
            other => QueueError::StorageUnavailable(other.to_string()),
        }
    }
}
