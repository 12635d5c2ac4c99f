//! Remote-tier and invalidation-bus seams.
//!
//! Both are explicit traits so the shared-store-backed implementations can
//! be swapped for the in-process ones in tests and single-instance
//! deployments. Values cross the remote boundary as serialized JSON
//! strings; the tiered cache owns (de)serialization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::{CacheError, Result};

/// Invalidation notice published on every cache write or delete.
///
/// `instance_id` lets subscribers ignore their own broadcasts. A key ending
/// in `*` is a prefix eviction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invalidation {
    /// Affected key, or prefix followed by `*`.
    pub key: String,
    /// Originating instance.
    pub instance_id: String,
}

/// Shared key-value tier visible to every instance.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Read a key. `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Write a key with a TTL. Returns the stored size in bytes, which a
    /// compressing implementation reports smaller than the input.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<usize>;
    /// Delete a key.
    async fn delete(&self, key: &str) -> Result<()>;
    /// Delete all keys under a prefix, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Broadcast channel carrying invalidation notices between instances.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    /// Publish a notice on a topic.
    async fn publish(&self, topic: &str, notice: Invalidation) -> Result<()>;
    /// Subscribe to a topic.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Invalidation>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process implementations
// ─────────────────────────────────────────────────────────────────────────────

/// In-process [`RemoteCache`]. Multiple caches sharing one `MemoryRemote`
/// behave like instances sharing one remote store.
#[derive(Default)]
pub struct MemoryRemote {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    /// When set, every operation fails — simulates an unreachable remote.
    unavailable: AtomicBool,
}

impl MemoryRemote {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated unavailability.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("remote store is down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteCache for MemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_up()?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                let _ = entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<usize> {
        self.check_up()?;
        let stored = value.len();
        let _ = self
            .entries
            .lock()
            .insert(key.to_owned(), (value, Instant::now() + ttl));
        Ok(stored)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_up()?;
        let _ = self.entries.lock().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.check_up()?;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }
}

const BUS_CHANNEL_CAPACITY: usize = 256;

/// In-process [`InvalidationBus`]: per-topic fan-out over bounded mpsc
/// channels. A subscriber that stops draining loses notices rather than
/// blocking publishers.
#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<Invalidation>>>>,
}

impl MemoryBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvalidationBus for MemoryBus {
    async fn publish(&self, topic: &str, notice: Invalidation) -> Result<()> {
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|tx| !tx.is_closed());
            for tx in subscribers.iter() {
                // Slow subscribers drop notices; their local tier simply
                // expires at its short TTL instead.
                let _ = tx.try_send(notice.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Invalidation>> {
        let (tx, rx) = mpsc::channel(BUS_CHANNEL_CAPACITY);
        self.topics
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
