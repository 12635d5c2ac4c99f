//! Keyed SQLite connection pool.
//!
//! The pool keeps at most one reusable handle per pool key. A handle is
//! reused only while it is idle and younger than the idle timeout; past the
//! distinct-handle ceiling the pool opens an unpooled one-off connection
//! instead of blocking — availability over strict admission control.
//!
//! Checkout is RAII: [`ConnectionPool::with_connection`] releases the handle
//! in all cases, including panics inside the operation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{Result, StoreError};

/// Key used when the caller does not name a pool.
pub const DEFAULT_POOL_KEY: &str = "default";

const BUSY_MAX_RETRIES: u32 = 32;

/// Where the pool's connections point.
#[derive(Clone, Debug)]
pub enum Database {
    /// On-disk database file (WAL journal).
    File(PathBuf),
    /// Named in-memory database shared by every connection in this process.
    /// Useful for tests and ephemeral deployments.
    SharedMemory(String),
}

/// Pool tuning knobs.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Target database.
    pub database: Database,
    /// Ceiling on distinct pooled handles; beyond it checkouts fall back to
    /// unpooled one-off connections.
    pub max_handles: usize,
    /// A parked handle older than this is discarded instead of reused.
    pub idle_timeout: Duration,
    /// How often the background sweeper evicts idle handles.
    pub sweep_interval: Duration,
    /// SQLite busy timeout applied to every new connection.
    pub busy_timeout: Duration,
}

impl PoolConfig {
    /// Config for an on-disk database with defaults.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            database: Database::File(path.into()),
            ..Self::base()
        }
    }

    /// Config for a process-shared in-memory database with defaults.
    #[must_use]
    pub fn shared_memory(tag: impl Into<String>) -> Self {
        Self {
            database: Database::SharedMemory(tag.into()),
            ..Self::base()
        }
    }

    fn base() -> Self {
        Self {
            database: Database::SharedMemory("arbor".into()),
            max_handles: 8,
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// A parked connection plus its bookkeeping.
struct Handle {
    conn: Connection,
    pool_key: String,
    created_at: Instant,
    last_used_at: Instant,
    request_count: u64,
}

#[derive(Default)]
struct Stats {
    hits: u64,
    misses: u64,
    unpooled: u64,
    acquires: u64,
    acquire_total_micros: u64,
}

struct Inner {
    handles: HashMap<String, Handle>,
    /// Pooled handles currently checked out (they are absent from `handles`).
    active: usize,
    stats: Stats,
}

/// Point-in-time view of one parked handle.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleInfo {
    /// Pool key the handle serves.
    pub pool_key: String,
    /// Seconds since the handle was opened.
    pub age_secs: f64,
    /// Seconds since the handle was last used.
    pub idle_secs: f64,
    /// Checkouts served by this handle.
    pub request_count: u64,
}

/// Point-in-time pool metrics for the health surface.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    /// Parked + checked-out pooled handles.
    pub total_handles: usize,
    /// Handles currently checked out.
    pub active: usize,
    /// Handles parked and reusable.
    pub idle: usize,
    /// Checkouts served by a reused handle.
    pub hits: u64,
    /// Checkouts that had to open a new pooled handle.
    pub misses: u64,
    /// Checkouts served by an unpooled one-off connection.
    pub unpooled: u64,
    /// hits / (hits + misses), 0 when no checkouts yet.
    pub hit_rate: f64,
    /// Mean checkout latency in microseconds over the pool's lifetime.
    pub avg_acquire_micros: f64,
    /// Per-handle ages for the parked handles.
    pub handles: Vec<HandleInfo>,
}

/// Keyed SQLite connection pool. Construct once, share via `Arc`.
pub struct ConnectionPool {
    inner: Mutex<Inner>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a pool. No connections are opened until first checkout.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                handles: HashMap::new(),
                active: 0,
                stats: Stats::default(),
            }),
            config,
        }
    }

    /// Check out a handle for `pool_key` (default pool when `None`), run
    /// `op`, and release the handle in all cases.
    pub fn with_connection<T>(
        &self,
        pool_key: Option<&str>,
        op: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let key = pool_key.unwrap_or(DEFAULT_POOL_KEY);
        let start = Instant::now();
        match self.checkout(key)? {
            Checkout::Pooled(handle) => {
                self.record_acquire(start);
                self.run_released(key, handle, op)
            }
            Checkout::Unpooled(conn) => {
                self.record_acquire(start);
                op(&conn)
            }
        }
    }

    /// Like [`with_connection`](Self::with_connection) but retries the whole
    /// checkout + operation on `SQLITE_BUSY`/`SQLITE_LOCKED`, with linear
    /// backoff plus jitter. Use for write paths.
    pub fn with_write<T>(
        &self,
        pool_key: Option<&str>,
        mut op: impl FnMut(&Connection) -> Result<T>,
    ) -> Result<T> {
        let mut attempts: u32 = 0;
        loop {
            match self.with_connection(pool_key, &mut op) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_busy() && attempts < BUSY_MAX_RETRIES => {
                    attempts += 1;
                    let base_ms = u64::from(attempts).saturating_mul(10).min(500);
                    let jitter_range = base_ms / 4;
                    let jitter = if jitter_range > 0 {
                        rand::random::<u64>() % (jitter_range * 2 + 1)
                    } else {
                        0
                    };
                    let backoff_ms = base_ms.saturating_sub(jitter_range) + jitter;
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Discard parked handles idle longer than the configured timeout.
    /// Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.handles.len();
        let timeout = self.config.idle_timeout;
        inner
            .handles
            .retain(|_, h| h.last_used_at.elapsed() <= timeout);
        let evicted = before - inner.handles.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle pool handles");
            counter!("db_pool_evictions_total").increment(evicted as u64);
        }
        evicted
    }

    /// Spawn the background sweeper. The task runs until the pool is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = pool.upgrade() else { break };
                let _ = pool.evict_idle();
            }
        })
    }

    /// Point-in-time metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.lock();
        let stats = &inner.stats;
        let lookups = stats.hits + stats.misses;
        let handles: Vec<HandleInfo> = inner
            .handles
            .values()
            .map(|h| HandleInfo {
                pool_key: h.pool_key.clone(),
                age_secs: h.created_at.elapsed().as_secs_f64(),
                idle_secs: h.last_used_at.elapsed().as_secs_f64(),
                request_count: h.request_count,
            })
            .collect();
        PoolMetrics {
            total_handles: inner.handles.len() + inner.active,
            active: inner.active,
            idle: inner.handles.len(),
            hits: stats.hits,
            misses: stats.misses,
            unpooled: stats.unpooled,
            hit_rate: if lookups > 0 {
                stats.hits as f64 / lookups as f64
            } else {
                0.0
            },
            avg_acquire_micros: if stats.acquires > 0 {
                stats.acquire_total_micros as f64 / stats.acquires as f64
            } else {
                0.0
            },
            handles,
        }
    }

    // ── internals ───────────────────────────────────────────────────────

    fn checkout(&self, key: &str) -> Result<Checkout> {
        enum Plan {
            Reuse(Handle),
            OpenPooled,
            OpenUnpooled,
        }

        let plan = {
            let mut inner = self.inner.lock();
            if let Some(handle) = inner.handles.remove(key) {
                if handle.last_used_at.elapsed() <= self.config.idle_timeout {
                    inner.active += 1;
                    inner.stats.hits += 1;
                    Plan::Reuse(handle)
                } else {
                    // Stale — drop it and open fresh below.
                    inner.active += 1;
                    inner.stats.misses += 1;
                    Plan::OpenPooled
                }
            } else if inner.handles.len() + inner.active < self.config.max_handles {
                inner.active += 1;
                inner.stats.misses += 1;
                Plan::OpenPooled
            } else {
                inner.stats.unpooled += 1;
                Plan::OpenUnpooled
            }
        };

        match plan {
            Plan::Reuse(mut handle) => {
                handle.request_count += 1;
                counter!("db_pool_hits_total").increment(1);
                Ok(Checkout::Pooled(handle))
            }
            Plan::OpenPooled => {
                counter!("db_pool_misses_total").increment(1);
                match self.open_connection() {
                    Ok(conn) => Ok(Checkout::Pooled(Handle {
                        conn,
                        pool_key: key.to_owned(),
                        created_at: Instant::now(),
                        last_used_at: Instant::now(),
                        request_count: 1,
                    })),
                    Err(err) => {
                        self.inner.lock().active -= 1;
                        Err(err)
                    }
                }
            }
            Plan::OpenUnpooled => {
                counter!("db_pool_unpooled_total").increment(1);
                warn!(
                    pool_key = key,
                    max = self.config.max_handles,
                    "pool at capacity, using unpooled connection"
                );
                Ok(Checkout::Unpooled(self.open_connection()?))
            }
        }
    }

    /// Run `op` with the handle and release it in all cases via a drop guard.
    fn run_released<T>(
        &self,
        key: &str,
        handle: Handle,
        op: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        struct Guard<'p> {
            pool: &'p ConnectionPool,
            key: &'p str,
            handle: Option<Handle>,
        }
        impl Drop for Guard<'_> {
            fn drop(&mut self) {
                if let Some(handle) = self.handle.take() {
                    self.pool.release(self.key, handle);
                }
            }
        }

        let guard = Guard {
            pool: self,
            key,
            handle: Some(handle),
        };
        let handle_ref = guard
            .handle
            .as_ref()
            .ok_or_else(|| StoreError::Internal("checked-out handle vanished".into()))?;
        op(&handle_ref.conn)
    }

    fn release(&self, key: &str, mut handle: Handle) {
        handle.last_used_at = Instant::now();
        let mut inner = self.inner.lock();
        inner.active = inner.active.saturating_sub(1);
        // At most one reusable handle per key; if a concurrent checkout
        // already parked one, or the pool shrank below us, drop this one.
        if !inner.handles.contains_key(key) && inner.handles.len() < self.config.max_handles {
            let _ = inner.handles.insert(key.to_owned(), handle);
        }
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = match &self.config.database {
            Database::File(path) => {
                let conn = Connection::open(path)?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn
            }
            Database::SharedMemory(tag) => {
                let uri = format!("file:{tag}?mode=memory&cache=shared");
                Connection::open_with_flags(
                    uri,
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_CREATE
                        | OpenFlags::SQLITE_OPEN_URI
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?
            }
        };
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(self.config.busy_timeout)?;
        Ok(conn)
    }

    fn record_acquire(&self, start: Instant) {
        let micros = start.elapsed().as_micros() as u64;
        let mut inner = self.inner.lock();
        inner.stats.acquires += 1;
        inner.stats.acquire_total_micros += micros;
    }
}

enum Checkout {
    Pooled(Handle),
    Unpooled(Connection),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_pool() -> ConnectionPool {
        ConnectionPool::new(PoolConfig::shared_memory(format!("t_{}", Uuid::now_v7())))
    }

    #[test]
    fn checkout_runs_operation() {
        let pool = test_pool();
        let answer: i64 = pool
            .with_connection(None, |conn| {
                Ok(conn.query_row("SELECT 41 + 1", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(answer, 42);
    }

    #[test]
    fn second_checkout_reuses_handle() {
        let pool = test_pool();
        pool.with_connection(None, |_| Ok(())).unwrap();
        pool.with_connection(None, |_| Ok(())).unwrap();

        let m = pool.metrics();
        assert_eq!(m.misses, 1);
        assert_eq!(m.hits, 1);
        assert!(m.hit_rate > 0.49);
        assert_eq!(m.idle, 1);
        assert_eq!(m.active, 0);
    }

    #[test]
    fn distinct_keys_get_distinct_handles() {
        let pool = test_pool();
        pool.with_connection(Some("a"), |_| Ok(())).unwrap();
        pool.with_connection(Some("b"), |_| Ok(())).unwrap();

        let m = pool.metrics();
        assert_eq!(m.misses, 2);
        assert_eq!(m.idle, 2);
    }

    #[test]
    fn capacity_overflow_falls_back_to_unpooled() {
        let mut config = PoolConfig::shared_memory(format!("t_{}", Uuid::now_v7()));
        config.max_handles = 1;
        let pool = ConnectionPool::new(config);

        pool.with_connection(Some("a"), |_| Ok(())).unwrap();
        // Pool is full with key "a" — "b" must still succeed, unpooled.
        pool.with_connection(Some("b"), |_| Ok(())).unwrap();

        let m = pool.metrics();
        assert_eq!(m.unpooled, 1);
        assert_eq!(m.idle, 1);
    }

    #[test]
    fn stale_handle_is_not_reused() {
        let mut config = PoolConfig::shared_memory(format!("t_{}", Uuid::now_v7()));
        config.idle_timeout = Duration::ZERO;
        let pool = ConnectionPool::new(config);

        pool.with_connection(None, |_| Ok(())).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        pool.with_connection(None, |_| Ok(())).unwrap();

        let m = pool.metrics();
        assert_eq!(m.hits, 0);
        assert_eq!(m.misses, 2);
    }

    #[test]
    fn release_happens_on_error() {
        let pool = test_pool();
        let result: Result<()> =
            pool.with_connection(None, |_| Err(StoreError::Internal("boom".into())));
        assert!(result.is_err());

        let m = pool.metrics();
        assert_eq!(m.active, 0);
        assert_eq!(m.idle, 1);
    }

    #[test]
    fn release_happens_on_panic() {
        let pool = Arc::new(test_pool());
        let p2 = Arc::clone(&pool);
        let outcome = std::thread::spawn(move || {
            p2.with_connection(None, |_| -> Result<()> { panic!("operation panicked") })
        })
        .join();
        assert!(outcome.is_err());

        let m = pool.metrics();
        assert_eq!(m.active, 0);
        assert_eq!(m.idle, 1);
    }

    #[test]
    fn evict_idle_removes_stale_handles() {
        let mut config = PoolConfig::shared_memory(format!("t_{}", Uuid::now_v7()));
        config.idle_timeout = Duration::ZERO;
        let pool = ConnectionPool::new(config);

        pool.with_connection(None, |_| Ok(())).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.metrics().idle, 0);
    }

    #[test]
    fn evict_idle_keeps_fresh_handles() {
        let pool = test_pool();
        pool.with_connection(None, |_| Ok(())).unwrap();
        assert_eq!(pool.evict_idle(), 0);
        assert_eq!(pool.metrics().idle, 1);
    }

    #[tokio::test]
    async fn sweeper_evicts_in_background() {
        let mut config = PoolConfig::shared_memory(format!("t_{}", Uuid::now_v7()));
        config.idle_timeout = Duration::from_millis(1);
        config.sweep_interval = Duration::from_millis(10);
        let pool = Arc::new(ConnectionPool::new(config));
        pool.with_connection(None, |_| Ok(())).unwrap();

        let sweeper = pool.spawn_sweeper();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.metrics().idle, 0);
        sweeper.abort();
    }

    #[test]
    fn shared_memory_state_is_visible_across_handles() {
        let pool = test_pool();
        pool.with_connection(Some("writer"), |conn| {
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")?;
            Ok(())
        })
        .unwrap();
        let x: i64 = pool
            .with_connection(Some("reader"), |conn| {
                Ok(conn.query_row("SELECT x FROM t", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(x, 7);
    }

    #[test]
    fn file_database_persists_between_checkouts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PoolConfig::file(dir.path().join("arbor.db"));
        config.idle_timeout = Duration::ZERO; // force a brand-new connection
        let pool = ConnectionPool::new(config);

        pool.with_connection(None, |conn| {
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (3);")?;
            Ok(())
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let x: i64 = pool
            .with_connection(None, |conn| {
                Ok(conn.query_row("SELECT x FROM t", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(x, 3);
    }

    #[test]
    fn metrics_track_acquire_latency() {
        let pool = test_pool();
        pool.with_connection(None, |_| Ok(())).unwrap();
        let m = pool.metrics();
        assert!(m.avg_acquire_micros >= 0.0);
        assert_eq!(m.total_handles, 1);
    }

    #[test]
    fn with_write_passes_through_non_busy_errors() {
        let pool = test_pool();
        let result: Result<()> = pool.with_write(None, |_| Err(StoreError::Internal("x".into())));
        assert!(matches!(result, Err(StoreError::Internal(_))));
    }

    #[test]
    fn handle_info_reports_key_and_count() {
        let pool = test_pool();
        pool.with_connection(Some("hot"), |_| Ok(())).unwrap();
        pool.with_connection(Some("hot"), |_| Ok(())).unwrap();
        let m = pool.metrics();
        assert_eq!(m.handles.len(), 1);
        assert_eq!(m.handles[0].pool_key, "hot");
        assert_eq!(m.handles[0].request_count, 2);
    }
}
