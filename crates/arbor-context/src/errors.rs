//! Context-assembly error taxonomy.

use arbor_cache::CacheError;
use arbor_store::StoreError;

/// Result alias for context operations.
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors surfaced by context assembly.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Storage failure while loading chain or reference nodes.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Caching or locking failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The tree data is corrupted: a chain exceeded the depth ceiling, a
    /// parent pointer dangles, or stored depths disagree. Fatal to the
    /// request and never retried.
    #[error("tree integrity violation at {node_id}: {reason}")]
    TreeIntegrity {
        /// Node at which the violation was detected.
        node_id: String,
        /// What was violated.
        reason: String,
    },
}
