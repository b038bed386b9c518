//! Canonical JSON and SHA-256 content digests.
//!
//! Datasets and candidate templates are identified by the digest of their
//! canonical form so that two processes always agree on identity.

use sha2::{Digest, Sha256};

use crate::domain::error::Result;

/// Recursively sort object keys by UTF-16 code unit order.
fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sort_keys).collect())
        }
        other => other.clone(),
    }
}

/// Compact JSON with sorted keys.
pub fn canonical_json(value: &serde_json::Value) -> Result<String> {
    Ok(serde_json::to_string(&sort_keys(value))?)
}

/// SHA-256 hex digest of the canonical JSON form of `value`.
pub fn compute_digest(value: &serde_json::Value) -> Result<String> {
    let canonical = canonical_json(value)?;
    Ok(digest_bytes(canonical.as_bytes()))
}

/// SHA-256 hex digest of raw bytes.
pub fn digest_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// First 12 hex characters of a digest.
pub fn short(digest: &str) -> &str {
    &digest[..12.min(digest.len())]
}
