//! Foundation types for the Arbor branching-conversation engine.
//!
//! A conversation in Arbor is a tree of [`ChatNode`]s rather than a linear
//! transcript: any node can spawn several divergent follow-ups. This crate
//! holds the data model shared by the storage, context-assembly, and caching
//! crates, plus small text utilities. It has no I/O.

pub mod context;
pub mod node;
pub mod text;

pub use context::{AssembledContext, ContextEntry, Role};
pub use node::{ChatNode, NodeKind, NodeStatus, new_node_id};
