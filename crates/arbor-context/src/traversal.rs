//! Ancestor-chain traversal and in-text reference resolution.
//!
//! Two traversal paths produce the same root-to-target ordering:
//! [`ChainWalker::ancestor_chain`] hops parent pointers through the batch
//! loader (so concurrent requests for the same session coalesce), and
//! [`ChainWalker::ancestor_chain_recursive`] issues one recursive query.
//! Both verify the depth invariant (`child.depth == parent.depth + 1`) and
//! abort with [`ContextError::TreeIntegrity`] instead of hanging on
//! corrupted cyclic data.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use arbor_core::ChatNode;
use arbor_store::{BatchLoader, ConnectionPool, NodeRepo, StoreError};

use crate::errors::{ContextError, Result};

/// Ceiling on chain length. Real chains are far shorter; anything past
/// this is corrupted data.
pub const MAX_CHAIN_DEPTH: usize = 256;

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@node_([A-Za-z0-9_-]+)").expect("mention regex is valid"));
static HASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#(nd_[0-9a-fA-F-]+)").expect("hash regex is valid"));
static WIKI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[node:([A-Za-z0-9_-]+)\]\]").expect("wiki regex is valid"));

/// Ancestor-chain traversal over the batch loader plus a recursive-query
/// fallback on the pool.
pub struct ChainWalker {
    loader: BatchLoader<String, ChatNode>,
    pool: Arc<ConnectionPool>,
    pool_key: Option<String>,
}

impl ChainWalker {
    /// Create a walker over `loader`, with `pool` for the recursive path.
    #[must_use]
    pub fn new(
        loader: BatchLoader<String, ChatNode>,
        pool: Arc<ConnectionPool>,
        pool_key: Option<String>,
    ) -> Self {
        Self {
            loader,
            pool,
            pool_key,
        }
    }

    /// Ancestor chain from root to `node_id` via repeated parent hops
    /// through the batch loader.
    ///
    /// Hops from concurrent traversals of the same session land in shared
    /// batches, so fan-out stays one storage round trip per loader flush
    /// rather than one per ancestor.
    pub async fn ancestor_chain(&self, node_id: &str) -> Result<Vec<ChatNode>> {
        let mut chain: Vec<ChatNode> = Vec::new();
        let mut current = self.loader.load(node_id.to_owned()).await?;

        loop {
            if chain.len() >= MAX_CHAIN_DEPTH {
                return Err(ContextError::TreeIntegrity {
                    node_id: node_id.to_owned(),
                    reason: format!("ancestor chain exceeds {MAX_CHAIN_DEPTH} hops"),
                });
            }

            let Some(parent_id) = current.parent_id.clone() else {
                if current.depth != 0 {
                    return Err(ContextError::TreeIntegrity {
                        node_id: current.id.clone(),
                        reason: format!("root node has depth {}", current.depth),
                    });
                }
                chain.push(current);
                break;
            };

            let parent = match self.loader.load(parent_id.clone()).await {
                Ok(parent) => parent,
                Err(StoreError::KeyNotFound(_)) => {
                    return Err(ContextError::TreeIntegrity {
                        node_id: current.id.clone(),
                        reason: format!("parent {parent_id} does not exist"),
                    });
                }
                Err(err) => return Err(err.into()),
            };
            if current.depth != parent.depth + 1 {
                return Err(ContextError::TreeIntegrity {
                    node_id: current.id.clone(),
                    reason: format!(
                        "depth {} does not follow parent depth {}",
                        current.depth, parent.depth
                    ),
                });
            }

            chain.push(current);
            current = parent;
        }

        chain.reverse();
        debug!(node_id, chain_len = chain.len(), "resolved ancestor chain");
        Ok(chain)
    }

    /// Same chain as [`Self::ancestor_chain`], fetched in a single
    /// recursive query.
    pub fn ancestor_chain_recursive(&self, node_id: &str) -> Result<Vec<ChatNode>> {
        let chain = self.pool.with_connection(self.pool_key.as_deref(), |conn| {
            NodeRepo::ancestor_chain(conn, node_id, MAX_CHAIN_DEPTH as u32)
        })?;

        if chain.is_empty() {
            return Err(StoreError::KeyNotFound(node_id.to_owned()).into());
        }
        // A cycle makes the bounded recursion emit more rows than the
        // ceiling allows for a straight chain.
        if chain.len() > MAX_CHAIN_DEPTH {
            return Err(ContextError::TreeIntegrity {
                node_id: node_id.to_owned(),
                reason: format!("ancestor chain exceeds {MAX_CHAIN_DEPTH} hops"),
            });
        }
        if let Some(root) = chain.first() {
            if root.depth != 0 {
                return Err(ContextError::TreeIntegrity {
                    node_id: root.id.clone(),
                    reason: format!("root node has depth {}", root.depth),
                });
            }
        }
        for pair in chain.windows(2) {
            if pair[1].depth != pair[0].depth + 1 {
                return Err(ContextError::TreeIntegrity {
                    node_id: pair[1].id.clone(),
                    reason: format!(
                        "depth {} does not follow parent depth {}",
                        pair[1].depth, pair[0].depth
                    ),
                });
            }
        }
        Ok(chain)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reference resolution
// ─────────────────────────────────────────────────────────────────────────────

/// A node referenced from within a chain prompt, tagged with the node that
/// referenced it.
#[derive(Clone, Debug)]
pub struct ResolvedReference {
    /// Chain node whose prompt contained the mention.
    pub source_node_id: String,
    /// The referenced node.
    pub node: ChatNode,
}

/// Outcome of reference resolution over a chain.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    /// Resolved references in first-mention order.
    pub resolved: Vec<ResolvedReference>,
    /// Mentions whose ids had no row. Dropped, not fatal.
    pub unresolved: usize,
}

/// Extracts and batch-loads node mentions embedded in prompt text.
///
/// Recognized syntaxes: `@node_<id>`, `#<id>`, `[[node:<id>]]`. The bare
/// hash form only matches `nd_`-shaped ids so ordinary hashtags in prompt
/// text do not trigger lookups.
pub struct RefResolver {
    loader: BatchLoader<String, ChatNode>,
}

impl RefResolver {
    /// Create a resolver over `loader`.
    #[must_use]
    pub fn new(loader: BatchLoader<String, ChatNode>) -> Self {
        Self { loader }
    }

    /// All distinct node ids mentioned in `text`, in match order.
    #[must_use]
    pub fn extract_ids(text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        collect_ids(text, &mut seen, &mut ids);
        ids
    }

    /// Resolve every mention in the chain's prompts plus `forced` ids,
    /// deduplicated in chain order. Unresolvable ids are counted and
    /// dropped; storage failures propagate.
    pub async fn resolve(&self, chain: &[ChatNode], forced: &[String]) -> Result<ReferenceSet> {
        let mut seen = HashSet::new();
        // (referenced id, source node id), first mention wins.
        let mut wanted: Vec<(String, String)> = Vec::new();

        for node in chain {
            let mut ids = Vec::new();
            collect_ids(&node.prompt, &mut seen, &mut ids);
            wanted.extend(ids.into_iter().map(|id| (id, node.id.clone())));
        }
        let target_id = chain.last().map(|n| n.id.clone()).unwrap_or_default();
        for id in forced {
            if seen.insert(id.clone()) {
                wanted.push((id.clone(), target_id.clone()));
            }
        }

        if wanted.is_empty() {
            return Ok(ReferenceSet::default());
        }

        let ids: Vec<String> = wanted.iter().map(|(id, _)| id.clone()).collect();
        let results = self.loader.load_many(ids).await;

        let mut set = ReferenceSet::default();
        for ((id, source_node_id), result) in wanted.into_iter().zip(results) {
            match result {
                Ok(node) => set.resolved.push(ResolvedReference {
                    source_node_id,
                    node,
                }),
                Err(StoreError::KeyNotFound(_)) => {
                    set.unresolved += 1;
                    debug!(ref_id = %id, source = %source_node_id, "dropping unresolvable reference");
                }
                Err(err) => return Err(err.into()),
            }
        }
        metrics::counter!("context_unresolved_references_total")
            .increment(set.unresolved as u64);
        Ok(set)
    }
}

fn collect_ids(text: &str, seen: &mut HashSet<String>, out: &mut Vec<String>) {
    for re in [&*MENTION_RE, &*HASH_RE, &*WIKI_RE] {
        for cap in re.captures_iter(text) {
            if let Some(m) = cap.get(1) {
                let id = m.as_str().to_owned();
                if seen.insert(id.clone()) {
                    out.push(id);
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
