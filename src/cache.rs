//! Idempotent response cache keyed by canonical call fingerprints.
//!
//! The cache is best-effort: lookup and store failures are swallowed and
//! the call proceeds against the upstream.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::fingerprint;
use crate::storage::KvStore;

/// Stored cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    #[serde(rename = "cachedAt")]
    pub cached_at: DateTime<Utc>,
}

/// Cache hit: the upstream response plus the entry's remaining lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub data: Value,
    /// Remaining seconds, `-1` when the store reports no expiry.
    pub ttl: i64,
}

pub struct ResponseCache {
    kv: Arc<dyn KvStore>,
    enabled: bool,
    ttl_seconds: u64,
    prefix: String,
}

impl ResponseCache {
    pub fn new(
        kv: Arc<dyn KvStore>,
        enabled: bool,
        ttl_seconds: u64,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            enabled,
            ttl_seconds,
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, method: &str, params: &Value, user_id: &str) -> String {
        fingerprint::cache_key(&self.prefix, method, params, user_id)
    }

    /// Look up a call. `None` on miss, when disabled, on a store failure,
    /// or when the stored entry no longer parses.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        if !self.enabled {
            return None;
        }
        let raw = self.kv.get(key).await.ok()??;
        let entry: CacheEntry = serde_json::from_str(&raw).ok()?;
        let ttl = self.kv.ttl(key).await.unwrap_or(-1);
        Some(CachedResponse {
            data: entry.data,
            ttl,
        })
    }

    /// Store a successful upstream response under the call's key.
    pub async fn set(&self, key: &str, data: &Value) -> Result<(), StoreError> {
        if !self.enabled {
            return Ok(());
        }
        let entry = CacheEntry {
            data: data.clone(),
            cached_at: Utc::now(),
        };
        let serialized =
            serde_json::to_string(&entry).map_err(|e| StoreError(format!("cache encode: {e}")))?;
        self.kv.set_ex(key, &serialized, self.ttl_seconds).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKvStore;
    use serde_json::json;

    fn cache(enabled: bool) -> ResponseCache {
        ResponseCache::new(Arc::new(InMemoryKvStore::new()), enabled, 300, "c:")
    }

    #[tokio::test]
    async fn stores_and_returns_responses_with_ttl() {
        let cache = cache(true);
        let key = cache.key("echo", &json!({"ping": "pong"}), "u1");

        assert!(cache.get(&key).await.is_none());

        cache.set(&key, &json!({"stat": "ok"})).await.unwrap();
        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.data, json!({"stat": "ok"}));
        assert!(hit.ttl > 0 && hit.ttl <= 300);
    }

    #[tokio::test]
    async fn disabled_cache_never_hits() {
        let cache = cache(false);
        let key = cache.key("echo", &json!({}), "u1");
        cache.set(&key, &json!({"stat": "ok"})).await.unwrap();
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn unparseable_entry_is_a_miss() {
        let kv = Arc::new(InMemoryKvStore::new());
        let cache = ResponseCache::new(kv.clone(), true, 300, "c:");
        let key = cache.key("echo", &json!({}), "u1");
        kv.set_ex(&key, "not json", 300).await.unwrap();
        assert!(cache.get(&key).await.is_none());
    }
}
