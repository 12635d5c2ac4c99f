//! Two-tier caching and cross-instance coordination for Arbor.
//!
//! - [`tiered::TieredCache`] — process-local tier with a short TTL over a
//!   shared remote tier with a longer one; writes broadcast invalidation
//!   notices so other instances evict their local copies.
//! - [`remote`] — the `RemoteCache`/`InvalidationBus` trait seams plus
//!   in-process implementations used by tests and single-instance deploys.
//! - [`lock::DistributedLock`] — TTL-bounded mutual exclusion across
//!   instances, used to serialize cache rebuilds for hot keys.

pub mod entry;
pub mod errors;
pub mod key;
pub mod lock;
pub mod remote;
pub mod tiered;

pub use entry::CacheEntry;
pub use errors::{CacheError, Result};
pub use key::cache_key;
pub use lock::{DistributedLock, LockBackend, LockConfig, LockOutcome, MemoryLockBackend};
pub use remote::{Invalidation, InvalidationBus, MemoryBus, MemoryRemote, RemoteCache};
pub use tiered::{CacheConfig, CacheMetrics, TieredCache};
