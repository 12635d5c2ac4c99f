//! Cached context builds.
//!
//! `get_context` fronts the builder with the tiered cache and serializes
//! rebuilds of a hot key behind the distributed lock, so a cache-miss
//! stampede triggers one build. Lock losers poll briefly for the winner's
//! write and fall back to an unlocked build rather than queueing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use arbor_cache::key::{cache_key, node_key_prefix};
use arbor_cache::{
    CacheError, CacheMetrics, DistributedLock, LockBackend, LockConfig, LockOutcome, TieredCache,
};

use crate::builder::{BuildOptions, BuiltContext, ContextBuilder};
use crate::errors::Result;

/// Tuning for the cached entry point.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Cache-key namespace.
    pub domain: String,
    /// How long a lock loser polls for the winner's cached result before
    /// building unlocked.
    pub winner_wait: Duration,
    /// Poll interval during that wait.
    pub poll_interval: Duration,
    /// Lock acquisition tuning.
    pub lock: LockConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            domain: "context".into(),
            winner_wait: Duration::from_millis(250),
            poll_interval: Duration::from_millis(25),
            lock: LockConfig::default(),
        }
    }
}

/// Builder + cache + lock, composed into the cached `get_context` entry
/// point.
pub struct ContextService {
    builder: ContextBuilder,
    cache: Arc<TieredCache<BuiltContext>>,
    lock: DistributedLock,
    config: ServiceConfig,
}

impl ContextService {
    /// Compose a service. All collaborators are injected; tests construct
    /// fresh instances per case.
    #[must_use]
    pub fn new(
        builder: ContextBuilder,
        cache: Arc<TieredCache<BuiltContext>>,
        lock_backend: Arc<dyn LockBackend>,
        config: ServiceConfig,
    ) -> Self {
        let lock = DistributedLock::new(lock_backend, config.lock.clone());
        Self {
            builder,
            cache,
            lock,
            config,
        }
    }

    /// Get the assembled context for `node_id`, from cache when possible.
    ///
    /// Key shape: `{domain}:{node_id}:{hash(options)}`. On a miss the
    /// build runs under the distributed lock with a double-check, so
    /// concurrent misses for the same key produce one build.
    pub async fn get_context(
        &self,
        node_id: &str,
        options: &BuildOptions,
    ) -> Result<BuiltContext> {
        let key = cache_key(&self.config.domain, node_id, options).map_err(CacheError::from)?;

        if let Some(hit) = self.cache.get(&key).await? {
            metrics::counter!("context_cache_hits_total").increment(1);
            return Ok(hit);
        }
        metrics::counter!("context_cache_misses_total").increment(1);

        let outcome = self
            .lock
            .with_lock(&key, || async {
                // Double-check: a previous holder may have written while
                // this caller was contending.
                match self.cache.get(&key).await {
                    Ok(Some(hit)) => return Ok(hit),
                    Ok(None) => {}
                    Err(err) => return Err(err.into()),
                }
                let built = self.builder.build_context(node_id, options).await?;
                self.cache.set(&key, built.clone()).await?;
                Ok(built)
            })
            .await?;

        match outcome {
            LockOutcome::Completed(result) => result,
            LockOutcome::NotAcquired => {
                if let Some(hit) = self.wait_for_populated(&key).await? {
                    return Ok(hit);
                }
                debug!(key, "no winner result within wait, building unlocked");
                metrics::counter!("context_unlocked_fallback_builds_total").increment(1);
                self.builder.build_context(node_id, options).await
            }
        }
    }

    /// Evict every cached context for `node_id`, across all option sets
    /// and instances. Call after the node or any descendant changes.
    pub async fn invalidate_node(&self, node_id: &str) -> Result<usize> {
        let prefix = node_key_prefix(&self.config.domain, node_id);
        Ok(self.cache.clear_prefix(&prefix).await?)
    }

    /// Snapshot of the underlying cache counters.
    #[must_use]
    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    /// Poll the cache for the lock winner's write.
    async fn wait_for_populated(&self, key: &str) -> Result<Option<BuiltContext>> {
        let deadline = Instant::now() + self.config.winner_wait;
        while Instant::now() < deadline {
            tokio::time::sleep(self.config.poll_interval).await;
            if let Some(hit) = self.cache.get(key).await? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
