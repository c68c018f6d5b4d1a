//! One attempt at executing a job: credential lookup, cache consult,
//! upstream call, cache fill.
//!
//! Retry policy lives in the worker loop; the processor only reports
//! success or failure for a single attempt.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};

use crate::cache::ResponseCache;
use crate::error::ProcessError;
use crate::observe::{ObsEvent, ObsSink};
use crate::storage::{CredentialStore, JobStore};
use crate::types::Job;
use crate::upstream::UpstreamClient;

/// Result of a successful attempt.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub from_cache: bool,
    pub result: Value,
    /// Remaining cache lifetime, on a cache hit.
    pub cache_ttl: Option<i64>,
    pub response_time_ms: u64,
}

pub struct JobProcessor {
    credentials: Arc<dyn CredentialStore>,
    upstream: Arc<dyn UpstreamClient>,
    cache: ResponseCache,
    job_store: Arc<dyn JobStore>,
    obs: Arc<dyn ObsSink>,
    max_attempts: u32,
    archive_failures: bool,
}

impl JobProcessor {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        upstream: Arc<dyn UpstreamClient>,
        cache: ResponseCache,
        job_store: Arc<dyn JobStore>,
        obs: Arc<dyn ObsSink>,
        max_attempts: u32,
        archive_failures: bool,
    ) -> Self {
        Self {
            credentials,
            upstream,
            cache,
            job_store,
            obs,
            max_attempts,
            archive_failures,
        }
    }

    /// Run one attempt. `attempts_made` is the number of attempts already
    /// consumed before this one.
    pub async fn process(
        &self,
        job: &Job,
        attempts_made: u32,
    ) -> Result<ProcessOutcome, ProcessError> {
        let credential = match self.credentials.get(&job.user_id).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                return Err(ProcessError::CredentialNotFound {
                    user_id: job.user_id.clone(),
                })
            }
            Err(e) => return Err(ProcessError::Store(e)),
        };
        if !credential.is_valid_shape() {
            return Err(ProcessError::InvalidCredential {
                user_id: job.user_id.clone(),
            });
        }

        let cache_key = self.cache.key(&job.method, &job.params, &job.user_id);
        if let Some(hit) = self.cache.get(&cache_key).await {
            self.obs.emit(
                ObsEvent::info("cache_hit", "serving cached response")
                    .job_id(&job.job_id)
                    .user_id(&job.user_id)
                    .trace_id(job.trace_id.as_deref())
                    .detail(json!({"method": job.method, "ttl": hit.ttl})),
            );
            return Ok(ProcessOutcome {
                from_cache: true,
                result: hit.data,
                cache_ttl: Some(hit.ttl),
                response_time_ms: 0,
            });
        }

        let started = Instant::now();
        let outcome = self
            .upstream
            .call(job.target, &job.method, &job.params, &credential)
            .await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                if let Err(e) = self.cache.set(&cache_key, &result).await {
                    self.obs.emit(
                        ObsEvent::warn("cache_write_failed", "response not cached")
                            .job_id(&job.job_id)
                            .user_id(&job.user_id)
                            .detail(json!({"error": e.to_string()})),
                    );
                }
                self.obs.emit(
                    ObsEvent::info("api_call", "upstream call succeeded")
                        .job_id(&job.job_id)
                        .user_id(&job.user_id)
                        .trace_id(job.trace_id.as_deref())
                        .detail(json!({
                            "method": job.method,
                            "response_time_ms": response_time_ms,
                        })),
                );
                Ok(ProcessOutcome {
                    from_cache: false,
                    result,
                    cache_ttl: None,
                    response_time_ms,
                })
            }
            Err(error) => {
                let current_attempt = attempts_made + 1;
                let exhausted = current_attempt >= self.max_attempts;
                self.obs.emit(
                    ObsEvent::error("attempt_failed", "upstream call failed")
                        .job_id(&job.job_id)
                        .user_id(&job.user_id)
                        .trace_id(job.trace_id.as_deref())
                        .detail(json!({
                            "method": job.method,
                            "attempt": current_attempt,
                            "max_attempts": self.max_attempts,
                            "status": error.upstream_status(),
                            "error": error.to_string(),
                        })),
                );
                if exhausted && self.archive_failures {
                    let doc = json!({
                        "state": "failed",
                        "error": error.to_string(),
                        "method": job.method,
                        "params": job.params,
                        "userId": job.user_id,
                        "failedAt": Utc::now(),
                        "attempts_made": current_attempt,
                        "max_attempts": self.max_attempts,
                    });
                    if let Err(e) = self.job_store.archive(&job.job_id, doc).await {
                        self.obs.emit(
                            ObsEvent::warn("archive_failed", "failure not archived")
                                .job_id(&job.job_id)
                                .detail(json!({"error": e.to_string()})),
                        );
                    }
                }
                Err(error)
            }
        }
    }
}
