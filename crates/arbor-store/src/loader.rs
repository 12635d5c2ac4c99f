//! Batch query loader.
//!
//! Collapses many single-key lookups issued within a short window into one
//! multi-key storage call. Concurrent `load` calls for the same key inside
//! the same open batch share one underlying fetch. A batch flushes when it
//! reaches the configured size or after the flush delay, whichever first.
//!
//! Error semantics: a key with no row rejects only that key's callers with
//! [`StoreError::KeyNotFound`]; a failed fetch rejects every caller in the
//! batch with [`StoreError::BatchLoad`] and clears the pending set so a
//! retry can re-enqueue.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use arbor_core::ChatNode;

use crate::errors::{Result, StoreError};
use crate::pool::ConnectionPool;
use crate::repo::NodeRepo;

/// One multi-key storage call. Missing keys are simply absent from the map.
#[async_trait]
pub trait BatchFetch<K, V>: Send + Sync {
    /// Fetch all `keys` in one round trip.
    async fn fetch(&self, keys: &[K]) -> Result<HashMap<K, V>>;
}

/// Loader tuning knobs.
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    /// Flush as soon as this many distinct keys are queued.
    pub max_batch_size: usize,
    /// Flush this long after the first key of a batch was queued.
    pub flush_delay: Duration,
    /// Ceiling on one underlying fetch; converts hangs into errors.
    pub fetch_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            flush_delay: Duration::from_millis(5),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

type Waiter<V> = oneshot::Sender<Result<V>>;

struct LoaderState<K, V> {
    /// Distinct keys in arrival order.
    queue: Vec<K>,
    /// Waiters per queued key.
    pending: HashMap<K, Vec<Waiter<V>>>,
    /// Whether a delayed flush is already scheduled for the open batch.
    flush_scheduled: bool,
}

/// Generic batch loader. Cheap to clone; clones share one queue.
pub struct BatchLoader<K, V> {
    fetcher: Arc<dyn BatchFetch<K, V>>,
    config: LoaderConfig,
    state: Arc<Mutex<LoaderState<K, V>>>,
}

impl<K, V> Clone for BatchLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<K, V> BatchLoader<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a loader over the given fetcher.
    #[must_use]
    pub fn new(fetcher: Arc<dyn BatchFetch<K, V>>, config: LoaderConfig) -> Self {
        Self {
            fetcher,
            config,
            state: Arc::new(Mutex::new(LoaderState {
                queue: Vec::new(),
                pending: HashMap::new(),
                flush_scheduled: false,
            })),
        }
    }

    /// Load one key. Resolves when the key's batch is processed.
    pub async fn load(&self, key: K) -> Result<V> {
        let (tx, rx) = oneshot::channel();
        let flush_now = {
            let mut state = self.state.lock();
            match state.pending.get_mut(&key) {
                Some(waiters) => {
                    // Same key already queued in this batch — share its fetch.
                    waiters.push(tx);
                    counter!("batch_loader_dedups_total").increment(1);
                    false
                }
                None => {
                    state.queue.push(key.clone());
                    let _ = state.pending.insert(key.clone(), vec![tx]);
                    if state.queue.len() >= self.config.max_batch_size {
                        true
                    } else {
                        if !state.flush_scheduled {
                            state.flush_scheduled = true;
                            self.schedule_delayed_flush();
                        }
                        false
                    }
                }
            }
        };

        if flush_now {
            self.flush().await;
        }

        rx.await
            .map_err(|_| StoreError::Internal("batch loader dropped a waiter".into()))?
    }

    /// Load many keys, preserving input order in the result.
    pub async fn load_many(&self, keys: Vec<K>) -> Vec<Result<V>> {
        futures::future::join_all(keys.into_iter().map(|k| self.load(k))).await
    }

    /// Number of keys queued in the open batch.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn schedule_delayed_flush(&self) {
        let loader = self.clone();
        let delay = self.config.flush_delay;
        drop(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            loader.flush().await;
        }));
    }

    /// Take the open batch and resolve every waiter in it.
    async fn flush(&self) {
        let (keys, mut pending) = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;
            (
                std::mem::take(&mut state.queue),
                std::mem::take(&mut state.pending),
            )
        };
        if keys.is_empty() {
            return;
        }
        debug!(batch_size = keys.len(), "flushing batch");
        counter!("batch_loader_flushes_total").increment(1);

        let fetched = tokio::time::timeout(self.config.fetch_timeout, self.fetcher.fetch(&keys))
            .await
            .map_err(|_| StoreError::Timeout(self.config.fetch_timeout))
            .and_then(|inner| inner);

        match fetched {
            Ok(values) => {
                for key in &keys {
                    let Some(waiters) = pending.remove(key) else {
                        continue;
                    };
                    match values.get(key) {
                        Some(value) => {
                            for waiter in waiters {
                                let _ = waiter.send(Ok(value.clone()));
                            }
                        }
                        None => {
                            counter!("batch_loader_missing_keys_total").increment(1);
                            for waiter in waiters {
                                let _ = waiter.send(Err(StoreError::KeyNotFound(key.to_string())));
                            }
                        }
                    }
                }
            }
            Err(err) => {
                counter!("batch_loader_failures_total").increment(1);
                let message = err.to_string();
                for waiters in pending.into_values() {
                    for waiter in waiters {
                        let _ = waiter.send(Err(StoreError::BatchLoad(message.clone())));
                    }
                }
            }
        }
    }
}

/// [`BatchFetch`] implementation for chat nodes, backed by the pool.
pub struct NodeFetcher {
    pool: Arc<ConnectionPool>,
    pool_key: Option<String>,
}

impl NodeFetcher {
    /// Create a fetcher over `pool`, using `pool_key` for checkouts.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>, pool_key: Option<String>) -> Self {
        Self { pool, pool_key }
    }
}

#[async_trait]
impl BatchFetch<String, ChatNode> for NodeFetcher {
    async fn fetch(&self, keys: &[String]) -> Result<HashMap<String, ChatNode>> {
        self.pool.with_connection(self.pool_key.as_deref(), |conn| {
            let nodes = NodeRepo::get_many(conn, keys)?;
            Ok(nodes.into_iter().map(|n| (n.id.clone(), n)).collect())
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counting fetcher: value = "v:<key>", "miss" keys are absent,
    /// "fail" anywhere fails the whole batch.
    struct TestFetcher {
        calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl TestFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                batch_sizes: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BatchFetch<String, String> for TestFetcher {
        async fn fetch(&self, keys: &[String]) -> Result<HashMap<String, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().push(keys.len());
            if keys.iter().any(|k| k == "fail") {
                return Err(StoreError::Internal("storage down".into()));
            }
            Ok(keys
                .iter()
                .filter(|k| *k != "miss")
                .map(|k| (k.clone(), format!("v:{k}")))
                .collect())
        }
    }

    fn loader(fetcher: Arc<TestFetcher>) -> BatchLoader<String, String> {
        BatchLoader::new(fetcher, LoaderConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn load_resolves_value() {
        let fetcher = TestFetcher::new();
        let loader = loader(Arc::clone(&fetcher));
        let value = loader.load("a".to_owned()).await.unwrap();
        assert_eq!(value, "v:a");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_same_key_shares_one_call() {
        let fetcher = TestFetcher::new();
        let loader = loader(Arc::clone(&fetcher));

        let (r1, r2) = tokio::join!(loader.load("k".to_owned()), loader.load("k".to_owned()));
        assert_eq!(r1.unwrap(), "v:k");
        assert_eq!(r2.unwrap(), "v:k");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*fetcher.batch_sizes.lock(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_coalesce_into_one_batch() {
        let fetcher = TestFetcher::new();
        let loader = loader(Arc::clone(&fetcher));

        let results = loader
            .load_many(vec!["a".to_owned(), "b".to_owned(), "c".to_owned()])
            .await;
        let values: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec!["v:a", "v:b", "v:c"]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*fetcher.batch_sizes.lock(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_size_triggers_immediate_flush() {
        let fetcher = TestFetcher::new();
        let config = LoaderConfig {
            max_batch_size: 2,
            // Long delay: only the size trigger can flush in this test.
            flush_delay: Duration::from_secs(3600),
            ..LoaderConfig::default()
        };
        let loader = BatchLoader::new(
            fetcher.clone() as Arc<dyn BatchFetch<String, String>>,
            config,
        );

        let (r1, r2) = tokio::join!(loader.load("a".to_owned()), loader.load("b".to_owned()));
        assert!(r1.is_ok() && r2.is_ok());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_key_rejects_only_that_caller() {
        let fetcher = TestFetcher::new();
        let loader = loader(Arc::clone(&fetcher));

        let (hit, miss) = tokio::join!(loader.load("a".to_owned()), loader.load("miss".to_owned()));
        assert_eq!(hit.unwrap(), "v:a");
        assert_matches!(miss, Err(StoreError::KeyNotFound(k)) if k == "miss");
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_rejects_whole_batch_and_allows_retry() {
        let fetcher = TestFetcher::new();
        let loader = loader(Arc::clone(&fetcher));

        let (r1, r2) = tokio::join!(loader.load("a".to_owned()), loader.load("fail".to_owned()));
        assert_matches!(r1, Err(StoreError::BatchLoad(_)));
        assert_matches!(r2, Err(StoreError::BatchLoad(_)));

        // Pending set was cleared — a retry re-enqueues and succeeds.
        assert_eq!(loader.queued(), 0);
        let retry = loader.load("a".to_owned()).await.unwrap();
        assert_eq!(retry, "v:a");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_loads_use_separate_batches() {
        let fetcher = TestFetcher::new();
        let loader = loader(Arc::clone(&fetcher));

        let _ = loader.load("a".to_owned()).await.unwrap();
        let _ = loader.load("a".to_owned()).await.unwrap();
        // Each await completed before the next began — two fetches.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    struct HangingFetcher;

    #[async_trait]
    impl BatchFetch<String, String> for HangingFetcher {
        async fn fetch(&self, _keys: &[String]) -> Result<HashMap<String, String>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_fetch_times_out() {
        let config = LoaderConfig {
            fetch_timeout: Duration::from_millis(50),
            ..LoaderConfig::default()
        };
        let loader: BatchLoader<String, String> =
            BatchLoader::new(Arc::new(HangingFetcher), config);

        let result = loader.load("a".to_owned()).await;
        assert_matches!(result, Err(StoreError::BatchLoad(msg)) if msg.contains("timed out"));
    }

    #[tokio::test]
    async fn node_fetcher_round_trip() {
        use crate::migrations::run_migrations;
        use crate::pool::PoolConfig;
        use arbor_core::NodeKind;
        use crate::repo::CreateNodeOptions;

        let pool = Arc::new(ConnectionPool::new(PoolConfig::shared_memory(format!(
            "t_{}",
            uuid::Uuid::now_v7()
        ))));
        let node = pool
            .with_connection(None, |conn| {
                run_migrations(conn)?;
                NodeRepo::create(
                    conn,
                    &CreateNodeOptions {
                        session_id: "sess_1",
                        parent_id: None,
                        prompt: "hello",
                        model: "gpt-4o",
                        temperature: 0.5,
                        max_tokens: 128,
                        system_prompt: None,
                        kind: NodeKind::Conversational,
                    },
                )
            })
            .unwrap();

        let fetcher = NodeFetcher::new(Arc::clone(&pool), None);
        let loader: BatchLoader<String, ChatNode> =
            BatchLoader::new(Arc::new(fetcher), LoaderConfig::default());

        let loaded = loader.load(node.id.clone()).await.unwrap();
        assert_eq!(loaded, node);

        let missing = loader.load("nd_missing".to_owned()).await;
        assert_matches!(missing, Err(StoreError::KeyNotFound(_)));
    }
}
