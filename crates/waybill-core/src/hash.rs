//! Canonical JSON encoding and SHA-256 content hashing.
//!
//! Snapshot hashes are computed over a canonical encoding: object keys
//! sorted recursively, arrays kept in order, no whitespace. Two payloads that
//! differ only in key order therefore hash identically.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub fn canonical_json(value: &Value) -> crate::Result<Vec<u8>> {
    Ok(serde_json::to_vec(&sorted(value))?)
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for k in keys {
                out.insert(k.clone(), sorted(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash of the canonical encoding of `value`.
pub fn content_hash(value: &Value) -> crate::Result<String> {
    Ok(sha256_hex(&canonical_json(value)?))
}
