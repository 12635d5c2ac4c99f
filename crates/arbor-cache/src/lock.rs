//! TTL-bounded mutual exclusion across instances.
//!
//! The backend is a trait so the shared-store implementation can be swapped
//! for [`MemoryLockBackend`] in tests. Acquisition is non-blocking with a
//! short retry window; losers get [`LockOutcome::NotAcquired`] instead of
//! queueing, because for cache rebuilds the winner's result will show up in
//! the cache anyway.
//!
//! Locks carry a unique token so release is tied to the holder that
//! acquired them, and a TTL so a crashed holder cannot wedge the resource.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{CacheError, Result};

/// Storage seam for lock state.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Atomically take the lock if free (or expired). Returns whether this
    /// token now holds it.
    async fn try_acquire(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Release the lock, but only if `token` still holds it. Returns
    /// whether a release happened.
    async fn release(&self, resource: &str, token: &str) -> Result<bool>;
}

/// Tuning for lock acquisition.
#[derive(Clone, Debug)]
pub struct LockConfig {
    /// How long a held lock survives if its holder disappears.
    pub ttl: Duration,
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Base pause between attempts; jittered to spread contenders out.
    pub retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            max_attempts: 3,
            retry_delay: Duration::from_millis(50),
        }
    }
}

/// What happened to a guarded closure.
#[derive(Debug)]
pub enum LockOutcome<T> {
    /// The lock was held for the duration of the closure; here is its
    /// result.
    Completed(T),
    /// Another holder kept the lock through every attempt.
    NotAcquired,
}

impl<T> LockOutcome<T> {
    /// The completed value, if the lock was won.
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::NotAcquired => None,
        }
    }

    /// The completed value, or [`CacheError::LockTimeout`] when the lock
    /// was never won. For callers that cannot fall back to unlocked
    /// execution.
    pub fn required(self, resource: &str, ttl: Duration) -> Result<T> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::NotAcquired => Err(CacheError::LockTimeout {
                resource: resource.to_owned(),
                ttl,
            }),
        }
    }
}

/// Lock manager: acquire, run, always release.
pub struct DistributedLock {
    backend: std::sync::Arc<dyn LockBackend>,
    config: LockConfig,
}

impl DistributedLock {
    /// Create a manager over a backend.
    #[must_use]
    pub fn new(backend: std::sync::Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    /// Run `work` while holding the lock on `resource`.
    ///
    /// The lock is released after `work` finishes, success or error. If it
    /// cannot be won within the configured attempts, `work` never runs and
    /// the outcome is [`LockOutcome::NotAcquired`].
    pub async fn with_lock<T, F, Fut>(&self, resource: &str, work: F) -> Result<LockOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let token = Uuid::now_v7().simple().to_string();

        let mut acquired = false;
        for attempt in 0..self.config.max_attempts {
            if self
                .backend
                .try_acquire(resource, &token, self.config.ttl)
                .await?
            {
                acquired = true;
                break;
            }
            if attempt + 1 < self.config.max_attempts {
                tokio::time::sleep(jittered(self.config.retry_delay)).await;
            }
        }

        if !acquired {
            debug!(resource, "lock not acquired, yielding to current holder");
            metrics::counter!("lock_contended_total").increment(1);
            return Ok(LockOutcome::NotAcquired);
        }

        let started = Instant::now();
        let value = work().await;

        if started.elapsed() >= self.config.ttl {
            // The TTL lapsed mid-work; another holder may have taken over.
            warn!(
                resource,
                held_ms = started.elapsed().as_millis() as u64,
                "lock work outlived its TTL"
            );
        }
        match self.backend.release(resource, &token).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(resource, "lock already expired at release");
            }
            Err(err) => {
                // The TTL will reap it; the work itself is done.
                warn!(resource, error = %err, "lock release failed");
            }
        }

        Ok(LockOutcome::Completed(value))
    }
}

fn jittered(base: Duration) -> Duration {
    let jitter = rand::rng().random_range(0.75..=1.25);
    base.mul_f64(jitter)
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process backend
// ─────────────────────────────────────────────────────────────────────────────

/// In-process [`LockBackend`]: a map of resource to holder token and
/// expiry. Shared between instances under test the same way a real shared
/// store would be.
#[derive(Default)]
pub struct MemoryLockBackend {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockBackend {
    /// Create a backend with no locks held.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock();
        let now = Instant::now();
        match held.get(resource) {
            Some((_, expires_at)) if *expires_at > now => Ok(false),
            _ => {
                let _ = held.insert(resource.to_owned(), (token.to_owned(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release(&self, resource: &str, token: &str) -> Result<bool> {
        let mut held = self.held.lock();
        match held.get(resource) {
            Some((holder, _)) if holder == token => {
                let _ = held.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
