//! Cache and lock error taxonomy.

use std::time::Duration;

/// Result alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the caching layer.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The remote tier could not be reached. Not fatal: the cache degrades
    /// to local-only operation.
    #[error("remote cache unavailable: {0}")]
    Unavailable(String),

    /// A lock was not acquired within its window. The caller decides
    /// whether to skip or fall back to unlocked execution.
    #[error("lock on {resource} not acquired within {ttl:?}")]
    LockTimeout {
        /// Contested resource name.
        resource: String,
        /// Requested hold TTL.
        ttl: Duration,
    },

    /// Cached value failed to (de)serialize.
    #[error("cache serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// Invariant violation inside the cache itself.
    #[error("internal: {0}")]
    Internal(String),
}
