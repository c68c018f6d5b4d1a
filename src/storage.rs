//! Storage boundaries: the durable job record store, the credential store,
//! and the key-value store backing the cache and rate limiter.
//!
//! All three are external collaborators; the in-memory implementations here
//! exist for embedded deployments and tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{Credential, JobPatch, JobRecord};

/// Durable job-record store.
///
/// Records are mutated via targeted field updates only; `archive` stores a
/// separate terminal snapshot when the archiving policies are enabled.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn init(&self, record: JobRecord) -> Result<(), StoreError>;
    async fn update(&self, job_id: &str, patch: JobPatch) -> Result<(), StoreError>;
    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;
    async fn archive(&self, job_id: &str, doc: Value) -> Result<(), StoreError>;
}

/// Read-only lookup of caller credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<Credential>, StoreError>;
}

/// Key-value store with atomic increment and TTL semantics.
///
/// `ttl` follows the usual store convention: remaining seconds, `-1` for a
/// key without expiry, `-2` for a missing key.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), StoreError>;
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), StoreError>;
    async fn ttl(&self, key: &str) -> Result<i64, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory job store.
#[derive(Default)]
pub struct InMemoryJobStore {
    records: Mutex<HashMap<String, JobRecord>>,
    archived: Mutex<HashMap<String, Value>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived terminal snapshot for a job, if any.
    pub async fn archived(&self, job_id: &str) -> Option<Value> {
        self.archived.lock().await.get(job_id).cloned()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn init(&self, record: JobRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .insert(record.job_id.clone(), record);
        Ok(())
    }

    async fn update(&self, job_id: &str, patch: JobPatch) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(job_id) {
            if let Some(state) = patch.state {
                record.state = state;
            }
            if let Some(attempts) = patch.attempts {
                record.attempts = attempts;
            }
            if let Some(returnvalue) = patch.returnvalue {
                record.returnvalue = Some(returnvalue);
            }
            if let Some(reason) = patch.failed_reason {
                record.failed_reason = Some(reason);
            }
            if let Some(stacktrace) = patch.stacktrace {
                record.stacktrace = Some(stacktrace);
            }
            if let Some(failed_at) = patch.failed_at {
                record.failed_at = Some(failed_at);
            }
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.lock().await.get(job_id).cloned())
    }

    async fn archive(&self, job_id: &str, doc: Value) -> Result<(), StoreError> {
        self.archived.lock().await.insert(job_id.to_string(), doc);
        Ok(())
    }
}

/// In-memory credential store.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    credentials: Mutex<HashMap<String, Credential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, user_id: impl Into<String>, credential: Credential) {
        self.credentials
            .lock()
            .await
            .insert(user_id.into(), credential);
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self, user_id: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.credentials.lock().await.get(user_id).cloned())
    }
}

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory key-value store with expiry.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, KvEntry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        let expired = entries.get(key).is_some_and(KvEntry::is_expired);
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        self.entries.lock().await.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock().await;
        let current = match entries.get(key) {
            Some(entry) if !entry.is_expired() => entry.value.parse::<i64>().unwrap_or(0),
            _ => 0,
        };
        let next = current + 1;
        let expires_at = entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .and_then(|entry| entry.expires_at);
        entries.insert(
            key.to_string(),
            KvEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_seconds));
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => Ok(-2),
            Some(entry) => match entry.expires_at {
                Some(at) => Ok(at.saturating_duration_since(Instant::now()).as_secs() as i64),
                None => Ok(-1),
            },
            None => Ok(-2),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Job, JobState, JobTarget};
    use serde_json::json;

    #[tokio::test]
    async fn patch_applies_targeted_updates_only() {
        let store = InMemoryJobStore::new();
        let job = Job::new("echo", json!({}), "u1", JobTarget::Rest);
        store.init(JobRecord::init(&job, "dispatch_rest")).await.unwrap();

        store
            .update(&job.job_id, JobPatch::retrying(1, "boom"))
            .await
            .unwrap();
        let record = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Retrying);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.failed_reason.as_deref(), Some("boom"));
        // Untouched fields survive the patch.
        assert_eq!(record.method, "echo");
        assert!(record.returnvalue.is_none());

        store
            .update(&job.job_id, JobPatch::completed(json!({"ok": true})))
            .await
            .unwrap();
        let record = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.returnvalue, Some(json!({"ok": true})));
        // Previous failure detail is not cleared by a targeted update.
        assert_eq!(record.failed_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn update_on_missing_record_is_a_noop() {
        let store = InMemoryJobStore::new();
        store
            .update("absent", JobPatch::completed(json!(null)))
            .await
            .unwrap();
        assert!(store.get("absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn kv_incr_and_ttl_semantics() {
        let kv = InMemoryKvStore::new();
        assert_eq!(kv.incr("counter").await.unwrap(), 1);
        assert_eq!(kv.incr("counter").await.unwrap(), 2);
        assert_eq!(kv.ttl("counter").await.unwrap(), -1);

        kv.expire("counter", 60).await.unwrap();
        assert!(kv.ttl("counter").await.unwrap() > 0);

        assert_eq!(kv.ttl("missing").await.unwrap(), -2);

        kv.set_ex("k", "v", 60).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
