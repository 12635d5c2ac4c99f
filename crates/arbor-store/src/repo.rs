//! Node repository — row-level operations on the `nodes` table.
//!
//! Stateless, every method takes `&Connection` (checkout and transactions
//! are the caller's concern). Creation validates the depth invariant
//! against the parent row; status updates validate the lifecycle.

use rusqlite::{Connection, OptionalExtension, params};

use arbor_core::{ChatNode, NodeKind, NodeStatus, new_node_id};

use crate::errors::{Result, StoreError};

const NODE_COLUMNS: &str = "id, session_id, parent_id, depth, prompt, response, status, model, \
     temperature, max_tokens, prompt_tokens, response_tokens, cost_usd, system_prompt, kind, \
     created_at, updated_at";

/// Options for creating a node. Depth is computed from the parent, never
/// supplied by the caller.
pub struct CreateNodeOptions<'a> {
    /// Owning conversation tree.
    pub session_id: &'a str,
    /// Parent node; `None` creates a root.
    pub parent_id: Option<&'a str>,
    /// User prompt (or note body for user notes).
    pub prompt: &'a str,
    /// Model identifier.
    pub model: &'a str,
    /// Sampling temperature.
    pub temperature: f64,
    /// Generation token ceiling.
    pub max_tokens: u32,
    /// System prompt; only meaningful on roots.
    pub system_prompt: Option<&'a str>,
    /// Node kind.
    pub kind: NodeKind,
}

/// Node repository — stateless, every method takes `&Connection`.
pub struct NodeRepo;

impl NodeRepo {
    /// Create a node in `pending` state.
    ///
    /// Computes `depth` as parent depth + 1 (0 for roots); a missing parent
    /// is `StoreError::ParentNotFound`.
    pub fn create(conn: &Connection, opts: &CreateNodeOptions<'_>) -> Result<ChatNode> {
        let depth = match opts.parent_id {
            None => 0,
            Some(parent_id) => {
                let parent = Self::get(conn, parent_id)?
                    .ok_or_else(|| StoreError::ParentNotFound(parent_id.to_owned()))?;
                parent.depth + 1
            }
        };

        let id = new_node_id();
        let now = chrono::Utc::now().to_rfc3339();
        let kind_json = serde_json::to_string(&opts.kind)
            .map_err(|e| StoreError::Internal(format!("kind serialization failed: {e}")))?;
        let _ = conn.execute(
            "INSERT INTO nodes (id, session_id, parent_id, depth, prompt, status, model, \
             temperature, max_tokens, system_prompt, kind, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id,
                opts.session_id,
                opts.parent_id,
                depth,
                opts.prompt,
                NodeStatus::Pending.as_str(),
                opts.model,
                opts.temperature,
                opts.max_tokens,
                opts.system_prompt,
                kind_json,
                now,
                now
            ],
        )?;

        Ok(ChatNode {
            id,
            parent_id: opts.parent_id.map(String::from),
            session_id: opts.session_id.to_owned(),
            depth,
            prompt: opts.prompt.to_owned(),
            response: None,
            status: NodeStatus::Pending,
            model: opts.model.to_owned(),
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
            prompt_tokens: None,
            response_tokens: None,
            cost_usd: None,
            system_prompt: opts.system_prompt.map(String::from),
            kind: opts.kind.clone(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Get a node by ID.
    pub fn get(conn: &Connection, node_id: &str) -> Result<Option<ChatNode>> {
        let row = conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                params![node_id],
                Self::map_row,
            )
            .optional()?;
        row.transpose_decode()
    }

    /// Get many nodes in one `IN` query. Result order is unspecified;
    /// callers match rows back to keys by ID.
    pub fn get_many(conn: &Connection, ids: &[String]) -> Result<Vec<ChatNode>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE id IN ({placeholders})"
        ))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawNode::decode).collect()
    }

    /// Children of a node, ordered by creation time.
    pub fn children_of(conn: &Connection, node_id: &str) -> Result<Vec<ChatNode>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE parent_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![node_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawNode::decode).collect()
    }

    /// Same-parent nodes excluding `node` itself, ordered by creation time.
    /// For roots this is the session's other roots.
    pub fn siblings_of(conn: &Connection, node: &ChatNode) -> Result<Vec<ChatNode>> {
        let mut out = match &node.parent_id {
            Some(parent_id) => Self::children_of(conn, parent_id)?,
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {NODE_COLUMNS} FROM nodes \
                     WHERE session_id = ?1 AND parent_id IS NULL ORDER BY created_at ASC"
                ))?;
                let rows = stmt
                    .query_map(params![node.session_id], Self::map_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(RawNode::decode)
                    .collect::<Result<Vec<_>>>()?
            }
        };
        out.retain(|n| n.id != node.id);
        Ok(out)
    }

    /// Ancestor chain from root to `node_id` via a recursive CTE.
    ///
    /// `max_hops` bounds the walk; a corrupted cyclic chain yields more than
    /// `max_hops` rows, which the caller must treat as an integrity error.
    pub fn ancestor_chain(
        conn: &Connection,
        node_id: &str,
        max_hops: u32,
    ) -> Result<Vec<ChatNode>> {
        let mut stmt = conn.prepare(&format!(
            "WITH RECURSIVE chain(node_id, hop) AS (
                 SELECT id, 0 FROM nodes WHERE id = ?1
                 UNION ALL
                 SELECT nodes.parent_id, chain.hop + 1
                 FROM nodes JOIN chain ON nodes.id = chain.node_id
                 WHERE nodes.parent_id IS NOT NULL AND chain.hop < ?2
             )
             SELECT {NODE_COLUMNS} FROM nodes
             JOIN chain ON nodes.id = chain.node_id
             ORDER BY chain.hop DESC"
        ))?;
        let rows = stmt
            .query_map(params![node_id, max_hops], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawNode::decode).collect()
    }

    /// Transition a node from `pending` to `streaming`.
    pub fn set_streaming(conn: &Connection, node_id: &str) -> Result<()> {
        Self::transition(conn, node_id, NodeStatus::Streaming, |_| Ok(()))
    }

    /// Record the landed response: text, token counts, and cost. Transitions
    /// `streaming` to `completed`. These values are written once and never
    /// recomputed retroactively.
    pub fn complete_response(
        conn: &Connection,
        node_id: &str,
        response: &str,
        prompt_tokens: u32,
        response_tokens: u32,
        cost_usd: f64,
    ) -> Result<()> {
        Self::transition(conn, node_id, NodeStatus::Completed, |conn| {
            let _ = conn.execute(
                "UPDATE nodes SET response = ?1, prompt_tokens = ?2, response_tokens = ?3, \
                 cost_usd = ?4 WHERE id = ?5",
                params![response, prompt_tokens, response_tokens, cost_usd, node_id],
            )?;
            Ok(())
        })
    }

    /// Mark generation as failed.
    pub fn fail(conn: &Connection, node_id: &str) -> Result<()> {
        Self::transition(conn, node_id, NodeStatus::Failed, |_| Ok(()))
    }

    /// Mark generation as cancelled.
    pub fn cancel(conn: &Connection, node_id: &str) -> Result<()> {
        Self::transition(conn, node_id, NodeStatus::Cancelled, |_| Ok(()))
    }

    /// Delete a leaf node. Deleting a node that still has children is
    /// `StoreError::HasChildren`; the application guarantees leaf-only
    /// deletion and this guard catches violations.
    pub fn delete(conn: &Connection, node_id: &str) -> Result<bool> {
        let child_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE parent_id = ?1",
            params![node_id],
            |row| row.get(0),
        )?;
        if child_count > 0 {
            return Err(StoreError::HasChildren(node_id.to_owned()));
        }
        let changed = conn.execute("DELETE FROM nodes WHERE id = ?1", params![node_id])?;
        Ok(changed > 0)
    }

    fn transition(
        conn: &Connection,
        node_id: &str,
        to: NodeStatus,
        extra: impl FnOnce(&Connection) -> Result<()>,
    ) -> Result<()> {
        let node = Self::get(conn, node_id)?
            .ok_or_else(|| StoreError::KeyNotFound(node_id.to_owned()))?;
        if !node.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                node_id: node_id.to_owned(),
                from: node.status.as_str(),
                to: to.as_str(),
            });
        }
        extra(conn)?;
        let now = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            "UPDATE nodes SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![to.as_str(), now, node_id],
        )?;
        Ok(())
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawNode> {
        Ok(RawNode {
            id: row.get(0)?,
            session_id: row.get(1)?,
            parent_id: row.get(2)?,
            depth: row.get(3)?,
            prompt: row.get(4)?,
            response: row.get(5)?,
            status: row.get(6)?,
            model: row.get(7)?,
            temperature: row.get(8)?,
            max_tokens: row.get(9)?,
            prompt_tokens: row.get(10)?,
            response_tokens: row.get(11)?,
            cost_usd: row.get(12)?,
            system_prompt: row.get(13)?,
            kind: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }
}

/// Row as read from SQLite, before status/kind decoding.
struct RawNode {
    id: String,
    session_id: String,
    parent_id: Option<String>,
    depth: u32,
    prompt: String,
    response: Option<String>,
    status: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    prompt_tokens: Option<u32>,
    response_tokens: Option<u32>,
    cost_usd: Option<f64>,
    system_prompt: Option<String>,
    kind: String,
    created_at: String,
    updated_at: String,
}

impl RawNode {
    fn decode(self) -> Result<ChatNode> {
        let status = NodeStatus::parse(&self.status).ok_or_else(|| StoreError::CorruptRow {
            node_id: self.id.clone(),
            reason: format!("unknown status {:?}", self.status),
        })?;
        let kind: NodeKind =
            serde_json::from_str(&self.kind).map_err(|e| StoreError::CorruptRow {
                node_id: self.id.clone(),
                reason: format!("kind decode failed: {e}"),
            })?;
        Ok(ChatNode {
            id: self.id,
            parent_id: self.parent_id,
            session_id: self.session_id,
            depth: self.depth,
            prompt: self.prompt,
            response: self.response,
            status,
            model: self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            prompt_tokens: self.prompt_tokens,
            response_tokens: self.response_tokens,
            cost_usd: self.cost_usd,
            system_prompt: self.system_prompt,
            kind,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

trait TransposeDecode {
    fn transpose_decode(self) -> Result<Option<ChatNode>>;
}

impl TransposeDecode for Option<RawNode> {
    fn transpose_decode(self) -> Result<Option<ChatNode>> {
        self.map(RawNode::decode).transpose()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
