//! SQLite storage for Arbor conversation trees.
//!
//! Layers, bottom up:
//! - [`pool::ConnectionPool`] — keyed, reusable SQLite handles with an
//!   idle-timeout sweep and an unpooled overflow fallback.
//! - [`repo::NodeRepo`] — stateless row-level operations; every method
//!   takes `&Connection`.
//! - [`loader::BatchLoader`] — coalesces concurrent single-key lookups
//!   into one multi-key query per flush window.

pub mod errors;
pub mod loader;
pub mod migrations;
pub mod pool;
pub mod repo;

pub use errors::{Result, StoreError};
pub use loader::{BatchFetch, BatchLoader, LoaderConfig, NodeFetcher};
pub use pool::{ConnectionPool, PoolConfig, PoolMetrics};
pub use repo::{CreateNodeOptions, NodeRepo};
