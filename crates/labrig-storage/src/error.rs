//! Storage error types for labrig-storage.
//!
//! [`StorageError`] wraps the lock-domain and validation errors from
//! `labrig-core` so callers can match on them directly, plus the backend
//! failure modes (SQLite, migrations, corrupt rows).

use labrig_core::{CoreError, LockError};
use thiserror::Error;

/// Errors produced by registry operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The lock operation was refused (conflict, not owner, not found).
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The change would violate a record invariant.
    #[error(transparent)]
    Invalid(#[from] CoreError),

    /// SQLite reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Applying schema migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// A stored row could not be turned back into a record.
    #[error("corrupt record: {reason}")]
    Corrupt { reason: String },

    /// A writer panicked while holding the store's connection.
    #[error("registry connection poisoned")]
    Poisoned,
}

impl StorageError {
    /// Returns the lock error if this is a refused lock operation.
    pub fn as_lock_error(&self) -> Option<&LockError> {
        match self {
            StorageError::Lock(err) => Some(err),
            _ => None,
        }
    }
}
