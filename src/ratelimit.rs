//! Per-user fixed-window rate limiter.
//!
//! One counter per `(user, unix second)`; the window never slides. Counter
//! keys expire two seconds after first touch, so a burst that straddles a
//! window boundary is admitted fresh in the next window.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::storage::KvStore;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Position within the current window, when the counter was reachable.
    pub count: Option<i64>,
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    limit: u32,
    prefix: String,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, limit: u32, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            limit,
            prefix: prefix.into(),
        }
    }

    /// Check the caller against the current one-second window.
    ///
    /// A limit of zero disables the limiter. A store failure admits the
    /// call: the limiter protects throughput, it is not a security gate.
    pub async fn admit(&self, user_id: &str) -> Admission {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.admit_at(user_id, now).await
    }

    /// Admission against an explicit window, for reproducible checks.
    pub async fn admit_at(&self, user_id: &str, window_second: u64) -> Admission {
        if self.limit == 0 {
            return Admission {
                allowed: true,
                count: None,
            };
        }

        let key = format!("{}{}:{}", self.prefix, user_id, window_second);
        match self.kv.incr(&key).await {
            Ok(count) => {
                if count == 1 {
                    // Expiry failure leaves a stale counter behind; the next
                    // window uses a new key either way.
                    let _ = self.kv.expire(&key, 2).await;
                }
                Admission {
                    allowed: count <= self.limit as i64,
                    count: Some(count),
                }
            }
            Err(_) => Admission {
                allowed: true,
                count: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::storage::InMemoryKvStore;
    use async_trait::async_trait;

    struct FailingKv;

    #[async_trait]
    impl KvStore for FailingKv {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError("down".into()))
        }
        async fn set_ex(&self, _key: &str, _value: &str, _ttl: u64) -> Result<(), StoreError> {
            Err(StoreError("down".into()))
        }
        async fn incr(&self, _key: &str) -> Result<i64, StoreError> {
            Err(StoreError("down".into()))
        }
        async fn expire(&self, _key: &str, _ttl: u64) -> Result<(), StoreError> {
            Err(StoreError("down".into()))
        }
        async fn ttl(&self, _key: &str) -> Result<i64, StoreError> {
            Err(StoreError("down".into()))
        }
        async fn del(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError("down".into()))
        }
    }

    #[tokio::test]
    async fn admits_exactly_the_limit_per_window() {
        let limiter = RateLimiter::new(Arc::new(InMemoryKvStore::new()), 3, "rl:");
        let mut admitted = 0;
        for _ in 0..8 {
            if limiter.admit_at("u1", 100).await.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn windows_are_independent_per_user_and_second() {
        let limiter = RateLimiter::new(Arc::new(InMemoryKvStore::new()), 1, "rl:");
        assert!(limiter.admit_at("u1", 100).await.allowed);
        assert!(!limiter.admit_at("u1", 100).await.allowed);
        // Next second opens a fresh window.
        assert!(limiter.admit_at("u1", 101).await.allowed);
        // Other users are unaffected.
        assert!(limiter.admit_at("u2", 100).await.allowed);
    }

    #[tokio::test]
    async fn zero_limit_disables_the_limiter() {
        let limiter = RateLimiter::new(Arc::new(InMemoryKvStore::new()), 0, "rl:");
        for _ in 0..20 {
            let admission = limiter.admit_at("u1", 100).await;
            assert!(admission.allowed);
            assert_eq!(admission.count, None);
        }
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(FailingKv), 1, "rl:");
        let admission = limiter.admit_at("u1", 100).await;
        assert!(admission.allowed);
        assert_eq!(admission.count, None);
    }
}
