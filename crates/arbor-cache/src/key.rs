//! Cache key derivation.
//!
//! Keys are `{domain}:{node_id}:{hash(options)}` so distinct build
//! parameters for the same node never collide.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex chars of the options digest kept in the key.
const HASH_LEN: usize = 16;

/// Stable short hash of any serializable options value.
///
/// Hashes the canonical JSON encoding; identical options always produce
/// the same digest within one schema version.
pub fn hash_options<T: Serialize>(options: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(options)?;
    let digest = Sha256::digest(&json);
    let mut hex = String::with_capacity(HASH_LEN);
    for byte in digest.iter().take(HASH_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    Ok(hex)
}

/// Derive the full cache key for a node + options pair.
pub fn cache_key<T: Serialize>(
    domain: &str,
    node_id: &str,
    options: &T,
) -> Result<String, serde_json::Error> {
    Ok(format!(
        "{domain}:{node_id}:{}",
        hash_options(options)?
    ))
}

/// Prefix that matches every key for one node in a domain, regardless of
/// options. Used for node-level invalidation.
#[must_use]
pub fn node_key_prefix(domain: &str, node_id: &str) -> String {
    format!("{domain}:{node_id}:")
}
