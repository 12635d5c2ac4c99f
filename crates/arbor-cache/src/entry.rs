//! Local-tier entry bookkeeping.

use std::time::{Duration, Instant};

/// A cached value plus access metadata. Owned by the cache; callers only
/// ever see the value.
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,
    /// When this entry was created.
    pub created_at: Instant,
    /// When this entry stops being served.
    pub expires_at: Instant,
    /// How often the entry was read.
    pub access_count: u64,
    /// Last read time.
    pub last_access_at: Instant,
    /// Bumped on every overwrite of the same key.
    pub version: u64,
    /// Serialized size in bytes before remote storage, when known.
    pub raw_bytes: Option<usize>,
    /// Size the remote tier reported storing, when known. Smaller than
    /// `raw_bytes` under a compressing remote.
    pub stored_bytes: Option<usize>,
}

impl<V> CacheEntry<V> {
    /// Create a fresh entry expiring after `ttl`.
    pub fn new(
        value: V,
        ttl: Duration,
        version: u64,
        raw_bytes: Option<usize>,
        stored_bytes: Option<usize>,
    ) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            expires_at: now + ttl,
            access_count: 0,
            last_access_at: now,
            version,
            raw_bytes,
            stored_bytes,
        }
    }

    /// Whether the entry has outlived its TTL.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Record a read.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_access_at = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_not_expired() {
        let entry = CacheEntry::new("v", Duration::from_secs(60), 1, None, None);
        assert!(!entry.is_expired());
        assert_eq!(entry.access_count, 0);
        assert_eq!(entry.version, 1);
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let entry = CacheEntry::new("v", Duration::ZERO, 1, None, None);
        assert!(entry.is_expired());
    }

    #[test]
    fn touch_updates_access_metadata() {
        let mut entry = CacheEntry::new("v", Duration::from_secs(60), 1, Some(42), Some(21));
        let before = entry.last_access_at;
        entry.touch();
        entry.touch();
        assert_eq!(entry.access_count, 2);
        assert!(entry.last_access_at >= before);
        assert_eq!(entry.raw_bytes, Some(42));
        assert_eq!(entry.stored_bytes, Some(21));
    }
}
