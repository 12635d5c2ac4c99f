//! The [`ChatNode`] struct — one prompt/response pair in a conversation tree.
//!
//! Nodes form a directed tree via `parent_id`. A node's `depth` always
//! equals its parent's depth + 1 (0 for roots); storage validates this on
//! creation and traversal re-checks it as a corruption guard.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix for node IDs (`nd_` + UUID v7).
pub const NODE_ID_PREFIX: &str = "nd_";

/// Generate a new node ID.
#[must_use]
pub fn new_node_id() -> String {
    format!("{NODE_ID_PREFIX}{}", Uuid::now_v7())
}

/// Generation lifecycle of a node.
///
/// Created in `Pending`, mutated in place to `Streaming`, then one of the
/// terminal states. Nodes are never re-parented.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Created, generation not yet started.
    Pending,
    /// Model response is being streamed.
    Streaming,
    /// Response landed; token counts and cost are recorded.
    Completed,
    /// Generation failed.
    Failed,
    /// Generation was cancelled by the user.
    Cancelled,
}

impl NodeStatus {
    /// Whether a transition from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::{Cancelled, Completed, Failed, Pending, Streaming};
        matches!(
            (self, next),
            (Pending, Streaming | Failed | Cancelled) | (Streaming, Completed | Failed | Cancelled)
        )
    }

    /// Storage representation (snake_case, matches the serde rename).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Streaming => "streaming",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<NodeStatus> {
        match s {
            "pending" => Some(NodeStatus::Pending),
            "streaming" => Some(NodeStatus::Streaming),
            "completed" => Some(NodeStatus::Completed),
            "failed" => Some(NodeStatus::Failed),
            "cancelled" => Some(NodeStatus::Cancelled),
            _ => None,
        }
    }
}

/// What kind of node this is.
///
/// A tagged enum instead of an open metadata bag, so the user-note special
/// case in context assembly is checked exhaustively by the type system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeKind {
    /// An ordinary prompt/response turn.
    Conversational,
    /// A user-authored note: free text with no model response. Included in
    /// assembled context as plain text, never sent for generation.
    #[serde(rename_all = "camelCase")]
    UserNote {
        /// Short note title.
        title: String,
        /// Free-form tags.
        #[serde(default)]
        tags: Vec<String>,
    },
}

/// A single prompt/response pair in the conversation tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatNode {
    /// Unique node ID (`nd_` + UUID v7).
    pub id: String,
    /// Parent node ID (`None` for tree roots).
    pub parent_id: Option<String>,
    /// Owning conversation tree.
    pub session_id: String,
    /// Ancestor-chain length: parent depth + 1, 0 for roots.
    pub depth: u32,
    /// User prompt (or note body for [`NodeKind::UserNote`]).
    pub prompt: String,
    /// Model response; `None` until generation completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Generation lifecycle state.
    pub status: NodeStatus,
    /// Model identifier. Immutable after creation.
    pub model: String,
    /// Sampling temperature. Immutable after creation.
    pub temperature: f64,
    /// Generation token ceiling. Immutable after creation.
    pub max_tokens: u32,
    /// Prompt token count, recorded once the response lands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    /// Response token count, recorded once the response lands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_tokens: Option<u32>,
    /// Generation cost in USD, recorded once the response lands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    /// System prompt; only meaningful when this node is a chain root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Node kind discriminator.
    pub kind: NodeKind,
    /// ISO 8601 creation time.
    pub created_at: String,
    /// ISO 8601 last-update time.
    pub updated_at: String,
}

impl ChatNode {
    /// Whether this node is a tree root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether this node is a user-note pseudo-node.
    #[must_use]
    pub fn is_user_note(&self) -> bool {
        matches!(self.kind, NodeKind::UserNote { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
