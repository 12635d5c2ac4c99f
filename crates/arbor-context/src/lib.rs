//! Context assembly for Arbor conversation trees.
//!
//! Pipeline, in order:
//! - [`traversal::ChainWalker`] — root-to-target ancestor chain through the
//!   batch loader (or a single recursive query), with corruption guards.
//! - [`traversal::RefResolver`] — `@node_`, `#`, and `[[node:]]` mentions
//!   in chain prompts, batch-loaded into supplementary entries.
//! - [`budget::TokenBudget`] — heuristic token estimation and
//!   recency-first selection under a ceiling.
//! - [`builder::ContextBuilder`] — assembles the ordered entry list.
//! - [`service::ContextService`] — the cached entry point: tiered cache in
//!   front of the builder, with a distributed lock serializing rebuilds.

pub mod budget;
pub mod builder;
pub mod errors;
pub mod service;
pub mod traversal;

pub use budget::{BudgetSelection, HeuristicEstimator, TokenBudget, TokenEstimator};
pub use builder::{BuildOptions, BuiltContext, ContextBuilder};
pub use errors::{ContextError, Result};
pub use service::{ContextService, ServiceConfig};
pub use traversal::{ChainWalker, MAX_CHAIN_DEPTH, RefResolver, ReferenceSet, ResolvedReference};
