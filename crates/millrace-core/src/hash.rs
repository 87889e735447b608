//! Content addressing: canonical JSON serialization and SHA-256 hashing.
//!
//! Two structurally-identical JSON values must always produce the same hash
//! regardless of object key insertion order, so canonicalization recursively
//! sorts object keys before hashing. Hashes are hex-encoded and never
//! truncated.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Recursively sort all object keys, producing a canonical value.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical serialized form of a JSON value (sorted keys, compact).
pub fn canonical_string(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Hex-encoded SHA-256 of the canonical serialized form.
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(value).as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
