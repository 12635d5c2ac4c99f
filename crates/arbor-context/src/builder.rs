//! Context assembly: chain, references, siblings, budget.
//!
//! Produces the cacheable [`BuiltContext`] for a target node: the linear
//! ancestor conversation, supplementary referenced nodes, optional sibling
//! previews, all trimmed to the requested token ceiling with recency
//! priority.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use arbor_core::text::preview;
use arbor_core::{AssembledContext, ChatNode, ContextEntry, NodeKind};
use arbor_store::{BatchLoader, ConnectionPool, LoaderConfig, NodeFetcher, NodeRepo};

use crate::budget::TokenBudget;
use crate::errors::Result;
use crate::traversal::{ChainWalker, RefResolver};

/// Byte ceiling on sibling preview text.
const SIBLING_PREVIEW_BYTES: usize = 160;

/// Options for one context build. Serialized into the cache key, so every
/// field that changes the output must live here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptions {
    /// Token ceiling for the assembled context.
    pub max_tokens: u32,
    /// Whether to append previews of same-parent branches.
    pub include_siblings: bool,
    /// Node ids to include as references even without an in-text mention.
    #[serde(default)]
    pub include_references: Vec<String>,
    /// Target model identifier. Affects cost/limit lookups only.
    pub model: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            max_tokens: 8192,
            include_siblings: false,
            include_references: Vec::new(),
            model: "gpt-4o".into(),
        }
    }
}

/// An assembled context plus the telemetry of what went into it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltContext {
    /// The ordered entries and token total.
    pub context: AssembledContext,
    /// Chain nodes whose entries survived the budget, root-to-target order.
    pub used_node_ids: Vec<String>,
    /// Referenced nodes whose entries survived the budget.
    pub used_reference_ids: Vec<String>,
    /// References that did not make it: unresolvable ids plus entries cut
    /// by the budget.
    pub dropped_references: usize,
}

/// Who contributed a candidate entry. Parallel to the candidate list.
enum EntryOwner {
    /// A chain node (may own several entries).
    Node(String),
    /// A resolved reference.
    Reference(String),
    /// A sibling preview.
    Sibling,
}

/// Assembles contexts for target nodes.
pub struct ContextBuilder {
    walker: ChainWalker,
    resolver: RefResolver,
    budget: TokenBudget,
    pool: Arc<ConnectionPool>,
    pool_key: Option<String>,
}

impl ContextBuilder {
    /// Create a builder from already-wired parts.
    #[must_use]
    pub fn new(
        walker: ChainWalker,
        resolver: RefResolver,
        budget: TokenBudget,
        pool: Arc<ConnectionPool>,
        pool_key: Option<String>,
    ) -> Self {
        Self {
            walker,
            resolver,
            budget,
            pool,
            pool_key,
        }
    }

    /// Wire a builder over a pool: walker and resolver share one batch
    /// loader, budget uses the default heuristic estimator.
    #[must_use]
    pub fn from_pool(
        pool: Arc<ConnectionPool>,
        pool_key: Option<String>,
        loader_config: LoaderConfig,
    ) -> Self {
        let fetcher = NodeFetcher::new(Arc::clone(&pool), pool_key.clone());
        let loader: BatchLoader<String, ChatNode> =
            BatchLoader::new(Arc::new(fetcher), loader_config);
        Self::new(
            ChainWalker::new(loader.clone(), Arc::clone(&pool), pool_key.clone()),
            RefResolver::new(loader),
            TokenBudget::default(),
            pool,
            pool_key,
        )
    }

    /// Assemble the context for `node_id` under `options`.
    ///
    /// Entry order: ancestor chain (system prompt first when the root
    /// carries one), then resolved references, then sibling previews; the
    /// token budget then keeps the most recent entries that fit.
    pub async fn build_context(
        &self,
        node_id: &str,
        options: &BuildOptions,
    ) -> Result<BuiltContext> {
        let started = Instant::now();
        let chain = self.walker.ancestor_chain(node_id).await?;

        let mut candidates: Vec<ContextEntry> = Vec::new();
        let mut owners: Vec<EntryOwner> = Vec::new();

        for node in &chain {
            match &node.kind {
                NodeKind::UserNote { title, .. } => {
                    candidates.push(ContextEntry::user(format!(
                        "[note: {title}]\n{}",
                        node.prompt
                    )));
                    owners.push(EntryOwner::Node(node.id.clone()));
                }
                NodeKind::Conversational => {
                    if node.is_root()
                        && let Some(system_prompt) = &node.system_prompt
                    {
                        candidates.push(ContextEntry::system(system_prompt.clone()));
                        owners.push(EntryOwner::Node(node.id.clone()));
                    }
                    if !node.prompt.is_empty() {
                        candidates.push(ContextEntry::user(node.prompt.clone()));
                        owners.push(EntryOwner::Node(node.id.clone()));
                    }
                    if let Some(response) = &node.response
                        && !response.is_empty()
                    {
                        candidates.push(ContextEntry::assistant(response.clone()));
                        owners.push(EntryOwner::Node(node.id.clone()));
                    }
                }
            }
        }

        let refs = self
            .resolver
            .resolve(&chain, &options.include_references)
            .await?;
        for reference in &refs.resolved {
            candidates.push(ContextEntry::user(format!(
                "[referenced from {}] {}",
                reference.source_node_id,
                reference_body(&reference.node)
            )));
            owners.push(EntryOwner::Reference(reference.node.id.clone()));
        }

        if options.include_siblings {
            if let Some(target) = chain.last() {
                let siblings = self
                    .pool
                    .with_connection(self.pool_key.as_deref(), |conn| {
                        NodeRepo::siblings_of(conn, target)
                    })?;
                for sibling in &siblings {
                    candidates.push(ContextEntry::user(format!(
                        "[alternate branch {}] {}",
                        sibling.id,
                        preview(&sibling.prompt, SIBLING_PREVIEW_BYTES, "…")
                    )));
                    owners.push(EntryOwner::Sibling);
                }
            }
        }

        let selection = self.budget.select_within(&candidates, options.max_tokens);

        let mut seen_nodes = HashSet::new();
        let mut used_node_ids = Vec::new();
        let mut used_reference_ids = Vec::new();
        for &index in &selection.kept_indices {
            match &owners[index] {
                EntryOwner::Node(id) => {
                    if seen_nodes.insert(id.clone()) {
                        used_node_ids.push(id.clone());
                    }
                }
                EntryOwner::Reference(id) => used_reference_ids.push(id.clone()),
                EntryOwner::Sibling => {}
            }
        }
        let dropped_references =
            refs.unresolved + (refs.resolved.len() - used_reference_ids.len());

        metrics::counter!("context_builds_total").increment(1);
        metrics::histogram!("context_build_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        debug!(
            node_id,
            chain_len = chain.len(),
            entries = selection.entries.len(),
            dropped_entries = selection.dropped,
            total_tokens = selection.total_tokens,
            dropped_references,
            "assembled context"
        );

        Ok(BuiltContext {
            context: AssembledContext {
                entries: selection.entries,
                total_tokens: selection.total_tokens,
            },
            used_node_ids,
            used_reference_ids,
            dropped_references,
        })
    }
}

fn reference_body(node: &ChatNode) -> String {
    match &node.response {
        Some(response) if !response.is_empty() => format!("{}\n{response}", node.prompt),
        _ => node.prompt.clone(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
