//! Assembled-context types: the ordered message list sent to a model.
//!
//! [`AssembledContext`] is the cacheable artifact produced by context
//! assembly. Invariant: at most one [`Role::System`] entry, and if present
//! it is first.

use serde::{Deserialize, Serialize};

/// Role of a context entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System instruction; at most one per context, always first.
    System,
    /// User-authored content.
    User,
    /// Model-authored content.
    Assistant,
}

/// One `{role, content}` pair in an assembled context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Entry role.
    pub role: Role,
    /// Entry text.
    pub content: String,
}

impl ContextEntry {
    /// Create a system entry.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a user entry.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant entry.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered sequence of context entries plus the total token estimate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledContext {
    /// Entries in chronological order.
    pub entries: Vec<ContextEntry>,
    /// Estimated token total for all entries.
    pub total_tokens: u32,
}

impl AssembledContext {
    /// Check the system-entry invariant: at most one system entry, and if
    /// present it is the first entry.
    #[must_use]
    pub fn system_invariant_holds(&self) -> bool {
        let system_count = self
            .entries
            .iter()
            .filter(|e| e.role == Role::System)
            .count();
        match system_count {
            0 => true,
            1 => self.entries[0].role == Role::System,
            _ => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
