//! Storage error taxonomy.

use std::time::Duration;

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A single key in a batch had no row. Only that key's caller sees this.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The whole multi-key storage call failed; every caller in the batch
    /// sees this. Retryable by re-issuing `load`.
    #[error("batch load failed: {0}")]
    BatchLoad(String),

    /// A storage call exceeded its configured timeout.
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    /// Node creation referenced a parent that does not exist.
    #[error("parent node not found: {0}")]
    ParentNotFound(String),

    /// Stored depth disagrees with the parent chain.
    #[error("depth mismatch for {node_id}: stored {stored}, expected {expected}")]
    DepthMismatch {
        /// Offending node.
        node_id: String,
        /// Depth read from the row.
        stored: u32,
        /// Parent depth + 1.
        expected: u32,
    },

    /// Attempted an illegal status transition.
    #[error("invalid status transition for {node_id}: {from} -> {to}")]
    InvalidTransition {
        /// Offending node.
        node_id: String,
        /// Current status.
        from: &'static str,
        /// Requested status.
        to: &'static str,
    },

    /// Attempted to delete a node that still has children.
    #[error("node {0} has children and cannot be deleted")]
    HasChildren(String),

    /// A stored column could not be decoded.
    #[error("corrupt row for {node_id}: {reason}")]
    CorruptRow {
        /// Offending node.
        node_id: String,
        /// What failed to decode.
        reason: String,
    },

    /// Invariant violation inside the store itself.
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether this is a transient SQLite BUSY/LOCKED failure worth retrying.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
