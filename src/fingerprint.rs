//! Canonical call fingerprinting for the idempotent response cache.

use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};

/// Recursively sort object keys so that serialization is independent of
/// insertion order. Array order is preserved.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        other => other.clone(),
    }
}

/// Derive the cache key for a call: SHA-1 over the canonical serialization
/// of `(method, params, userId)`, hex-encoded, under the given namespace
/// prefix.
pub fn cache_key(prefix: &str, method: &str, params: &Value, user_id: &str) -> String {
    let canonical = canonicalize(&json!({
        "method": method,
        "params": params,
        "userId": user_id,
    }));
    let serialized = canonical.to_string();
    let hash = hex::encode(Sha1::digest(serialized.as_bytes()));
    format!("{prefix}{hash}")
}
