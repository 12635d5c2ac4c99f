//! Two-tier cache with cross-instance invalidation.
//!
//! Reads hit the process-local tier first, then the shared remote tier;
//! remote hits repopulate the local tier. Writes go to both tiers and
//! broadcast an invalidation notice so other instances drop their local
//! copies immediately instead of waiting out the short local TTL.
//!
//! The remote tier is best-effort: when it is unreachable the cache keeps
//! serving from the local tier alone and logs the degradation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entry::CacheEntry;
use crate::errors::Result;
use crate::remote::{Invalidation, InvalidationBus, RemoteCache};

/// Topic that invalidation notices travel on.
const INVALIDATION_TOPIC: &str = "cache.invalidation";

/// Tuning for a [`TieredCache`].
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Namespace for log lines and metrics labels.
    pub name: String,
    /// TTL for the process-local tier. Short, so instances that miss an
    /// invalidation notice converge quickly anyway.
    pub local_ttl: Duration,
    /// TTL for the shared remote tier.
    pub remote_ttl: Duration,
    /// Upper bound on local entries; inserting past it evicts the least
    /// recently accessed entry.
    pub max_local_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "cache".into(),
            local_ttl: Duration::from_secs(5),
            remote_ttl: Duration::from_secs(300),
            max_local_entries: 1024,
        }
    }
}

/// Point-in-time counters for one cache instance.
#[derive(Clone, Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    /// Reads served from the local tier.
    pub local_hits: u64,
    /// Reads served from the remote tier.
    pub remote_hits: u64,
    /// Reads that missed both tiers.
    pub misses: u64,
    /// Invalidation notices published by this instance.
    pub broadcasts_sent: u64,
    /// Foreign notices that evicted a local entry.
    pub broadcasts_applied: u64,
    /// Remote operations that failed and were degraded past.
    pub remote_errors: u64,
    /// Serialized bytes written, before remote storage.
    pub raw_bytes: u64,
    /// Bytes the remote tier reported storing.
    pub stored_bytes: u64,
    /// Approximate stored/raw ratio over writes. 1.0 before any write, and
    /// under a remote that stores values as-is.
    pub compression_ratio: f64,
    /// Current local entry count.
    pub local_entries: usize,
}

#[derive(Default)]
struct Counters {
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    broadcasts_sent: AtomicU64,
    broadcasts_applied: AtomicU64,
    remote_errors: AtomicU64,
    bytes_raw: AtomicU64,
    bytes_stored: AtomicU64,
}

/// Process-local tier over a shared remote tier, with invalidation
/// broadcast between instances.
pub struct TieredCache<V> {
    config: CacheConfig,
    /// Unique per instance so it can ignore its own broadcasts.
    instance_id: String,
    local: Mutex<HashMap<String, CacheEntry<V>>>,
    remote: Arc<dyn RemoteCache>,
    bus: Arc<dyn InvalidationBus>,
    counters: Counters,
    version: AtomicU64,
}

impl<V> TieredCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create a cache and start its invalidation listener.
    ///
    /// The listener holds only a [`Weak`] reference, so dropping the last
    /// [`Arc`] shuts it down.
    pub async fn new(
        config: CacheConfig,
        remote: Arc<dyn RemoteCache>,
        bus: Arc<dyn InvalidationBus>,
    ) -> Result<Arc<Self>> {
        let instance_id = format!("inst_{}", Uuid::now_v7().simple());
        let mut rx = bus.subscribe(INVALIDATION_TOPIC).await?;

        let cache = Arc::new(Self {
            config,
            instance_id,
            local: Mutex::new(HashMap::new()),
            remote,
            bus,
            counters: Counters::default(),
            version: AtomicU64::new(0),
        });

        let weak: Weak<Self> = Arc::downgrade(&cache);
        drop(tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                let Some(cache) = weak.upgrade() else { break };
                cache.apply_invalidation(&notice);
            }
        }));

        Ok(cache)
    }

    /// This instance's broadcast identity.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Read a key: local tier, then remote. A remote hit repopulates the
    /// local tier. Remote failures degrade to a local-only miss.
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        {
            let mut local = self.local.lock();
            match local.get_mut(key) {
                Some(entry) if !entry.is_expired() => {
                    entry.touch();
                    let _ = self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("cache_local_hits_total", "cache" => self.config.name.clone())
                        .increment(1);
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => {
                    let _ = local.remove(key);
                }
                None => {}
            }
        }

        match self.remote.get(key).await {
            Ok(Some(serialized)) => {
                let value: V = serde_json::from_str(&serialized)?;
                let size = serialized.len();
                self.store_local(key, value.clone(), Some(size), Some(size));
                let _ = self.counters.remote_hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("cache_remote_hits_total", "cache" => self.config.name.clone())
                    .increment(1);
                Ok(Some(value))
            }
            Ok(None) => {
                let _ = self.counters.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("cache_misses_total", "cache" => self.config.name.clone())
                    .increment(1);
                Ok(None)
            }
            Err(err) => {
                self.note_remote_error("get", key, &err);
                let _ = self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Write a key to both tiers with the default remote TTL and broadcast
    /// the change.
    pub async fn set(&self, key: &str, value: V) -> Result<()> {
        self.set_with_ttl(key, value, None).await
    }

    /// Write a key with an explicit remote TTL; `None` falls back to the
    /// configured default. The local tier always uses its own short TTL.
    pub async fn set_with_ttl(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()> {
        let serialized = serde_json::to_string(&value)?;
        let raw = serialized.len();
        let ttl = ttl.unwrap_or(self.config.remote_ttl);

        let stored = match self.remote.set(key, serialized, ttl).await {
            Ok(stored) => stored,
            Err(err) => {
                self.note_remote_error("set", key, &err);
                // The local copy is kept uncompressed.
                raw
            }
        };
        self.store_local(key, value, Some(raw), Some(stored));
        let _ = self
            .counters
            .bytes_raw
            .fetch_add(raw as u64, Ordering::Relaxed);
        let _ = self
            .counters
            .bytes_stored
            .fetch_add(stored as u64, Ordering::Relaxed);

        self.broadcast(key.to_owned()).await;
        Ok(())
    }

    /// Remove a key from both tiers and broadcast the eviction.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let _ = self.local.lock().remove(key);

        if let Err(err) = self.remote.delete(key).await {
            self.note_remote_error("delete", key, &err);
        }

        self.broadcast(key.to_owned()).await;
        Ok(())
    }

    /// Remove every key under a prefix from both tiers. The broadcast key
    /// carries a trailing `*` so other instances evict by prefix too.
    pub async fn clear_prefix(&self, prefix: &str) -> Result<usize> {
        let local_removed = {
            let mut local = self.local.lock();
            let before = local.len();
            local.retain(|k, _| !k.starts_with(prefix));
            before - local.len()
        };

        let remote_removed = match self.remote.delete_prefix(prefix).await {
            Ok(n) => n,
            Err(err) => {
                self.note_remote_error("clear_prefix", prefix, &err);
                0
            }
        };

        self.broadcast(format!("{prefix}*")).await;
        debug!(
            cache = %self.config.name,
            prefix,
            local_removed,
            remote_removed,
            "cache prefix cleared"
        );
        Ok(local_removed.max(remote_removed))
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let raw_bytes = self.counters.bytes_raw.load(Ordering::Relaxed);
        let stored_bytes = self.counters.bytes_stored.load(Ordering::Relaxed);
        CacheMetrics {
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            remote_hits: self.counters.remote_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            broadcasts_sent: self.counters.broadcasts_sent.load(Ordering::Relaxed),
            broadcasts_applied: self.counters.broadcasts_applied.load(Ordering::Relaxed),
            remote_errors: self.counters.remote_errors.load(Ordering::Relaxed),
            raw_bytes,
            stored_bytes,
            compression_ratio: if raw_bytes == 0 {
                1.0
            } else {
                stored_bytes as f64 / raw_bytes as f64
            },
            local_entries: self.local.lock().len(),
        }
    }

    fn store_local(
        &self,
        key: &str,
        value: V,
        raw_bytes: Option<usize>,
        stored_bytes: Option<usize>,
    ) {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let mut local = self.local.lock();

        if local.len() >= self.config.max_local_entries && !local.contains_key(key) {
            let oldest = local
                .iter()
                .min_by_key(|(_, entry)| entry.last_access_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                let _ = local.remove(&oldest);
            }
        }

        let _ = local.insert(
            key.to_owned(),
            CacheEntry::new(value, self.config.local_ttl, version, raw_bytes, stored_bytes),
        );
    }

    async fn broadcast(&self, key: String) {
        let notice = Invalidation {
            key,
            instance_id: self.instance_id.clone(),
        };
        match self.bus.publish(INVALIDATION_TOPIC, notice).await {
            Ok(()) => {
                let _ = self
                    .counters
                    .broadcasts_sent
                    .fetch_add(1, Ordering::Relaxed);
                metrics::counter!("cache_broadcasts_sent_total", "cache" => self.config.name.clone())
                    .increment(1);
            }
            Err(err) => {
                warn!(cache = %self.config.name, error = %err, "invalidation broadcast failed");
            }
        }
    }

    /// Evict local entries named by a foreign notice. Own notices are
    /// ignored; the local tier already reflects the write.
    fn apply_invalidation(&self, notice: &Invalidation) {
        if notice.instance_id == self.instance_id {
            return;
        }

        let mut local = self.local.lock();
        let evicted = if let Some(prefix) = notice.key.strip_suffix('*') {
            let before = local.len();
            local.retain(|k, _| !k.starts_with(prefix));
            before - local.len()
        } else {
            usize::from(local.remove(&notice.key).is_some())
        };
        drop(local);

        if evicted > 0 {
            let _ = self
                .counters
                .broadcasts_applied
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                cache = %self.config.name,
                key = %notice.key,
                from = %notice.instance_id,
                evicted,
                "applied foreign invalidation"
            );
        }
    }

    fn note_remote_error(&self, op: &str, key: &str, err: &crate::errors::CacheError) {
        let _ = self.counters.remote_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cache_remote_errors_total", "cache" => self.config.name.clone())
            .increment(1);
        warn!(
            cache = %self.config.name,
            op,
            key,
            error = %err,
            "remote tier unavailable, serving local-only"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    #![allow(unused_results)]

    use super::*;
    use crate::remote::{MemoryBus, MemoryRemote};
    use tokio::task::yield_now;

    fn config(name: &str) -> CacheConfig {
        CacheConfig {
            name: name.into(),
            ..CacheConfig::default()
        }
    }

    async fn cache(
        name: &str,
        remote: &Arc<MemoryRemote>,
        bus: &Arc<MemoryBus>,
    ) -> Arc<TieredCache<String>> {
        TieredCache::new(
            config(name),
            Arc::clone(remote) as Arc<dyn RemoteCache>,
            Arc::clone(bus) as Arc<dyn InvalidationBus>,
        )
        .await
        .unwrap()
    }

    /// Let the spawned invalidation listeners drain the bus.
    async fn settle() {
        for _ in 0..10 {
            yield_now().await;
        }
    }

    #[tokio::test]
    async fn set_then_get_hits_local_tier() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let cache = cache("t", &remote, &bus).await;

        cache.set("k", "v".to_owned()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_owned()));

        let metrics = cache.metrics();
        assert_eq!(metrics.local_hits, 1);
        assert_eq!(metrics.remote_hits, 0);
    }

    #[tokio::test]
    async fn remote_hit_repopulates_local() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let writer = cache("writer", &remote, &bus).await;
        let reader = cache("reader", &remote, &bus).await;

        writer.set("k", "v".to_owned()).await.unwrap();

        // First read on the other instance goes to the remote tier.
        assert_eq!(reader.get("k").await.unwrap(), Some("v".to_owned()));
        assert_eq!(reader.metrics().remote_hits, 1);

        // Second read is local.
        assert_eq!(reader.get("k").await.unwrap(), Some("v".to_owned()));
        assert_eq!(reader.metrics().local_hits, 1);
    }

    #[tokio::test]
    async fn miss_on_both_tiers() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let cache = cache("t", &remote, &bus).await;

        assert_eq!(cache.get("absent").await.unwrap(), None);
        assert_eq!(cache.metrics().misses, 1);
    }

    #[tokio::test]
    async fn foreign_write_evicts_local_copy() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let a = cache("a", &remote, &bus).await;
        let b = cache("b", &remote, &bus).await;

        a.set("k", "old".to_owned()).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), Some("old".to_owned()));

        // B now holds "old" locally. A's overwrite must evict it.
        a.set("k", "new".to_owned()).await.unwrap();
        settle().await;

        assert_eq!(b.get("k").await.unwrap(), Some("new".to_owned()));
        assert!(b.metrics().broadcasts_applied >= 1);
    }

    #[tokio::test]
    async fn own_broadcast_does_not_evict() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let cache = cache("t", &remote, &bus).await;

        cache.set("k", "v".to_owned()).await.unwrap();
        settle().await;

        // Still a local hit: the writer keeps its own fresh copy.
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_owned()));
        assert_eq!(cache.metrics().local_hits, 1);
        assert_eq!(cache.metrics().broadcasts_applied, 0);
    }

    #[tokio::test]
    async fn delete_removes_from_both_tiers_and_broadcasts() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let a = cache("a", &remote, &bus).await;
        let b = cache("b", &remote, &bus).await;

        a.set("k", "v".to_owned()).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), Some("v".to_owned()));

        a.delete("k").await.unwrap();
        settle().await;

        assert_eq!(a.get("k").await.unwrap(), None);
        assert_eq!(b.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_prefix_evicts_matching_keys_everywhere() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let a = cache("a", &remote, &bus).await;
        let b = cache("b", &remote, &bus).await;

        a.set("ctx:nd_1:aaa", "1".to_owned()).await.unwrap();
        a.set("ctx:nd_1:bbb", "2".to_owned()).await.unwrap();
        a.set("ctx:nd_2:ccc", "3".to_owned()).await.unwrap();
        b.get("ctx:nd_1:aaa").await.unwrap();
        b.get("ctx:nd_2:ccc").await.unwrap();

        let removed = a.clear_prefix("ctx:nd_1:").await.unwrap();
        assert_eq!(removed, 2);
        settle().await;

        assert_eq!(a.get("ctx:nd_1:aaa").await.unwrap(), None);
        assert_eq!(b.get("ctx:nd_1:aaa").await.unwrap(), None);
        assert_eq!(b.get("ctx:nd_2:ccc").await.unwrap(), Some("3".to_owned()));
    }

    #[tokio::test]
    async fn remote_outage_degrades_to_local_only() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let cache = cache("t", &remote, &bus).await;

        remote.set_unavailable(true);

        // Writes and reads still succeed through the local tier.
        cache.set("k", "v".to_owned()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_owned()));
        assert!(cache.metrics().remote_errors >= 1);

        // Remote recovers; a fresh key flows through both tiers again.
        remote.set_unavailable(false);
        cache.set("k2", "v2".to_owned()).await.unwrap();
        assert_eq!(remote.get("k2").await.unwrap(), Some("\"v2\"".to_owned()));
    }

    #[tokio::test]
    async fn expired_local_entry_falls_through_to_remote() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let cache = TieredCache::<String>::new(
            CacheConfig {
                local_ttl: Duration::ZERO,
                ..config("t")
            },
            Arc::clone(&remote) as Arc<dyn RemoteCache>,
            Arc::clone(&bus) as Arc<dyn InvalidationBus>,
        )
        .await
        .unwrap();

        cache.set("k", "v".to_owned()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_owned()));
        assert_eq!(cache.metrics().remote_hits, 1);
        assert_eq!(cache.metrics().local_hits, 0);
    }

    #[tokio::test]
    async fn local_tier_evicts_least_recently_used_at_capacity() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let cache = TieredCache::<String>::new(
            CacheConfig {
                max_local_entries: 2,
                ..config("t")
            },
            Arc::clone(&remote) as Arc<dyn RemoteCache>,
            Arc::clone(&bus) as Arc<dyn InvalidationBus>,
        )
        .await
        .unwrap();

        cache.set("a", "1".to_owned()).await.unwrap();
        cache.set("b", "2".to_owned()).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", "3".to_owned()).await.unwrap();

        assert_eq!(cache.metrics().local_entries, 2);
        // "a" was touched most recently, so "b" went.
        assert_eq!(cache.metrics().local_hits, 1);
        assert!(cache.local.lock().contains_key("a"));
        assert!(!cache.local.lock().contains_key("b"));
    }

    #[tokio::test]
    async fn requested_ttl_overrides_remote_default() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let cache = cache("t", &remote, &bus).await;

        cache
            .set_with_ttl("short", "v".to_owned(), Some(Duration::ZERO))
            .await
            .unwrap();
        cache.set("long", "v".to_owned()).await.unwrap();

        // The remote honored the per-write TTL; the default write is intact.
        assert_eq!(remote.get("short").await.unwrap(), None);
        assert_eq!(remote.get("long").await.unwrap(), Some("\"v\"".to_owned()));

        // The local tier keeps serving the short-TTL key within its own TTL.
        assert_eq!(cache.get("short").await.unwrap(), Some("v".to_owned()));
    }

    #[tokio::test]
    async fn set_accumulates_size_accounting() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let cache = cache("t", &remote, &bus).await;

        // "v" serializes to `"v"`, three bytes.
        cache.set("k", "v".to_owned()).await.unwrap();

        let metrics = cache.metrics();
        assert_eq!(metrics.raw_bytes, 3);
        assert_eq!(metrics.stored_bytes, 3);
        assert!((metrics.compression_ratio - 1.0).abs() < f64::EPSILON);
    }

    /// Remote that reports half the input size, the way a compressing
    /// implementation would.
    struct HalvingRemote {
        inner: MemoryRemote,
    }

    #[async_trait::async_trait]
    impl RemoteCache for HalvingRemote {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<usize> {
            let stored = self.inner.set(key, value, ttl).await?;
            Ok(stored / 2)
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
            self.inner.delete_prefix(prefix).await
        }
    }

    #[tokio::test]
    async fn compressing_remote_lowers_the_ratio() {
        let remote = Arc::new(HalvingRemote {
            inner: MemoryRemote::new(),
        });
        let bus = Arc::new(MemoryBus::new());
        let cache = TieredCache::<String>::new(
            config("t"),
            Arc::clone(&remote) as Arc<dyn RemoteCache>,
            Arc::clone(&bus) as Arc<dyn InvalidationBus>,
        )
        .await
        .unwrap();

        // "vvvv" serializes to six bytes; the remote reports three stored.
        cache.set("k", "vvvv".to_owned()).await.unwrap();

        let metrics = cache.metrics();
        assert_eq!(metrics.raw_bytes, 6);
        assert_eq!(metrics.stored_bytes, 3);
        assert!((metrics.compression_ratio - 0.5).abs() < f64::EPSILON);
    }
}
