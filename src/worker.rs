//! Worker loop: consumes one queue, drives the retry state machine and
//! emits the terminal callback.
//!
//! Delivery guarantees hinge on ack ordering. A message is acknowledged
//! only after its durable-state transition succeeded; when the record
//! store is unreachable on that path the message is left unacked and the
//! broker's redelivery is the recovery mechanism.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::callback::CallbackDelivery;
use crate::error::ProcessError;
use crate::observe::{ObsEvent, ObsSink};
use crate::processor::{JobProcessor, ProcessOutcome};
use crate::queue::{sanitize_queue_name, Broker, Delivery, QUEUE_DLQ};
use crate::ratelimit::RateLimiter;
use crate::storage::JobStore;
use crate::types::{CallbackErrorDetail, CallbackPayload, Job, JobPatch, JobState, MessageMeta};

/// Callback coordinates for a job, restored from the durable record when
/// the message itself does not carry them.
struct CallbackContext {
    url: Option<String>,
    secret: Option<String>,
    meta: Option<Value>,
    trace_id: Option<String>,
}

pub struct WorkerLoop {
    queue: String,
    broker: Arc<dyn Broker>,
    processor: Arc<JobProcessor>,
    rate_limiter: Arc<RateLimiter>,
    job_store: Arc<dyn JobStore>,
    callbacks: Arc<CallbackDelivery>,
    obs: Arc<dyn ObsSink>,
    max_attempts: u32,
    concurrency: usize,
    requeue_delay: Duration,
    archive_completions: bool,
}

impl WorkerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: impl Into<String>,
        broker: Arc<dyn Broker>,
        processor: Arc<JobProcessor>,
        rate_limiter: Arc<RateLimiter>,
        job_store: Arc<dyn JobStore>,
        callbacks: Arc<CallbackDelivery>,
        obs: Arc<dyn ObsSink>,
        max_attempts: u32,
        requeue_delay: Duration,
        archive_completions: bool,
    ) -> Self {
        Self {
            queue: sanitize_queue_name(&queue.into()),
            broker,
            processor,
            rate_limiter,
            job_store,
            callbacks,
            obs,
            max_attempts,
            concurrency: 1,
            requeue_delay,
            archive_completions,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Spawn the consumer tasks. They run until the broker closes.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|_| {
                let worker = Arc::clone(self);
                tokio::spawn(async move { worker.run().await })
            })
            .collect()
    }

    pub async fn run(&self) {
        while let Some(delivery) = self.broker.next(&self.queue).await {
            self.handle_delivery(delivery).await;
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let job: Job = match serde_json::from_slice(&delivery.payload) {
            Ok(job) => job,
            Err(e) => {
                // Malformed payloads can never succeed; redelivering them
                // would loop forever.
                self.obs.emit(
                    ObsEvent::error("malformed_payload", "dropping undecodable message")
                        .queue(&self.queue)
                        .detail(json!({"error": e.to_string()})),
                );
                let _ = self.broker.ack(delivery.delivery_tag).await;
                return;
            }
        };
        let attempts_made = delivery.meta.attempts;

        let admission = self.rate_limiter.admit(&job.user_id).await;
        if !admission.allowed {
            self.obs.emit(
                ObsEvent::warn("rate_limited", "requeueing after delay")
                    .job_id(&job.job_id)
                    .user_id(&job.user_id)
                    .queue(&self.queue)
                    .trace_id(job.trace_id.as_deref())
                    .detail(json!({"count": admission.count})),
            );
            self.requeue_unchanged(&delivery).await;
            let _ = self.broker.ack(delivery.delivery_tag).await;
            return;
        }

        match self.processor.process(&job, attempts_made).await {
            Ok(outcome) => {
                self.handle_success(&job, &delivery, attempts_made, outcome)
                    .await
            }
            Err(error) => {
                self.handle_failure(&job, &delivery, attempts_made, error)
                    .await
            }
        }
    }

    /// Put a denied message back on its queue untouched. The attempt
    /// counter does not move; being throttled is not a failure.
    async fn requeue_unchanged(&self, delivery: &Delivery) {
        let broker = Arc::clone(&self.broker);
        let obs = Arc::clone(&self.obs);
        let queue = delivery.queue.clone();
        let payload = delivery.payload.clone();
        let meta = delivery.meta;
        let delay = self.requeue_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = broker.publish(&queue, payload, meta).await {
                obs.emit(
                    ObsEvent::error("requeue_failed", "rate-limited message lost")
                        .queue(&queue)
                        .detail(json!({"error": e.to_string()})),
                );
            }
        });
    }

    async fn handle_success(
        &self,
        job: &Job,
        delivery: &Delivery,
        attempts_made: u32,
        outcome: ProcessOutcome,
    ) {
        let mut patch = JobPatch::completed(outcome.result.clone());
        patch.attempts = Some(attempts_made + 1);
        if let Err(e) = self.job_store.update(&job.job_id, patch).await {
            self.obs.emit(
                ObsEvent::error("store_update_failed", "completion not persisted")
                    .job_id(&job.job_id)
                    .user_id(&job.user_id)
                    .queue(&self.queue)
                    .detail(json!({"error": e.to_string()})),
            );
            // Left unacked; the broker redelivers and the cached response
            // makes the replay cheap.
            return;
        }

        self.obs.emit(
            ObsEvent::info("job_completed", "job completed")
                .job_id(&job.job_id)
                .user_id(&job.user_id)
                .queue(&self.queue)
                .trace_id(job.trace_id.as_deref())
                .detail(json!({
                    "from_cache": outcome.from_cache,
                    "response_time_ms": outcome.response_time_ms,
                })),
        );

        let context = self.callback_context(job).await;
        let payload = CallbackPayload {
            job_id: job.job_id.clone(),
            user_id: job.user_id.clone(),
            queue: self.queue.clone(),
            state: JobState::Completed,
            result: Some(outcome.result.clone()),
            error: None,
            from_cache: outcome.from_cache,
            attempts_made,
            max_attempts: self.max_attempts,
            timestamp: Utc::now(),
            trace_id: context.trace_id.clone(),
            meta: context.meta.clone(),
        };
        self.callbacks
            .deliver(context.url.as_deref(), context.secret.as_deref(), &payload)
            .await;

        if self.archive_completions {
            let doc = json!({
                "state": "completed",
                "method": job.method,
                "params": job.params,
                "userId": job.user_id,
                "result": outcome.result,
                "from_cache": outcome.from_cache,
                "completedAt": Utc::now(),
            });
            if let Err(e) = self.job_store.archive(&job.job_id, doc).await {
                self.obs.emit(
                    ObsEvent::warn("archive_failed", "completion not archived")
                        .job_id(&job.job_id)
                        .detail(json!({"error": e.to_string()})),
                );
            }
        }

        let _ = self.broker.ack(delivery.delivery_tag).await;
    }

    async fn handle_failure(
        &self,
        job: &Job,
        delivery: &Delivery,
        attempts_made: u32,
        error: ProcessError,
    ) {
        let next_attempt = attempts_made + 1;

        if next_attempt < self.max_attempts {
            let patch = JobPatch::retrying(next_attempt, error.to_string());
            if let Err(e) = self.job_store.update(&job.job_id, patch).await {
                self.obs.emit(
                    ObsEvent::error("store_update_failed", "retry state not persisted")
                        .job_id(&job.job_id)
                        .queue(&self.queue)
                        .detail(json!({"error": e.to_string()})),
                );
                return;
            }
            self.obs.emit(
                ObsEvent::warn("job_retrying", "scheduling another attempt")
                    .job_id(&job.job_id)
                    .user_id(&job.user_id)
                    .queue(&self.queue)
                    .trace_id(job.trace_id.as_deref())
                    .detail(json!({
                        "attempt": next_attempt,
                        "max_attempts": self.max_attempts,
                        "error": error.to_string(),
                    })),
            );
            let meta = MessageMeta {
                attempts: next_attempt,
                failed: false,
            };
            match self
                .broker
                .publish(&delivery.queue, delivery.payload.clone(), meta)
                .await
            {
                Ok(()) => {
                    let _ = self.broker.ack(delivery.delivery_tag).await;
                }
                Err(e) => {
                    // No ack: redelivery retries with the old counter, so
                    // the attempt is not consumed twice.
                    self.obs.emit(
                        ObsEvent::error("republish_failed", "retry not republished")
                            .job_id(&job.job_id)
                            .queue(&self.queue)
                            .detail(json!({"error": e.to_string()})),
                    );
                }
            }
            return;
        }

        // Attempts exhausted.
        let stacktrace = truncate(&format!("{error:?}"), 4000);
        let mut patch = JobPatch::failed(error.to_string(), stacktrace);
        patch.attempts = Some(next_attempt);
        if let Err(e) = self.job_store.update(&job.job_id, patch).await {
            self.obs.emit(
                ObsEvent::error("store_update_failed", "failure state not persisted")
                    .job_id(&job.job_id)
                    .queue(&self.queue)
                    .detail(json!({"error": e.to_string()})),
            );
            return;
        }

        self.obs.emit(
            ObsEvent::error("job_failed", "job dead-lettered")
                .job_id(&job.job_id)
                .user_id(&job.user_id)
                .queue(&self.queue)
                .trace_id(job.trace_id.as_deref())
                .detail(json!({
                    "attempts": next_attempt,
                    "status": error.upstream_status(),
                    "error": error.to_string(),
                })),
        );

        let meta = MessageMeta {
            attempts: next_attempt,
            failed: true,
        };
        if let Err(e) = self
            .broker
            .publish(QUEUE_DLQ, delivery.payload.clone(), meta)
            .await
        {
            self.obs.emit(
                ObsEvent::error("dlq_publish_failed", "dead-letter publish failed")
                    .job_id(&job.job_id)
                    .detail(json!({"error": e.to_string()})),
            );
        }
        let _ = self.broker.ack(delivery.delivery_tag).await;

        let context = self.callback_context(job).await;
        let payload = CallbackPayload {
            job_id: job.job_id.clone(),
            user_id: job.user_id.clone(),
            queue: self.queue.clone(),
            state: JobState::Failed,
            result: None,
            error: Some(CallbackErrorDetail {
                message: error.to_string(),
                code: error.upstream_status().map(|s| s.to_string()),
            }),
            from_cache: false,
            attempts_made: next_attempt,
            max_attempts: self.max_attempts,
            timestamp: Utc::now(),
            trace_id: context.trace_id.clone(),
            meta: context.meta.clone(),
        };
        self.callbacks
            .deliver(context.url.as_deref(), context.secret.as_deref(), &payload)
            .await;
    }

    /// Callback coordinates, preferring the message and falling back to
    /// the durable record for anything the message lacks.
    async fn callback_context(&self, job: &Job) -> CallbackContext {
        let mut context = CallbackContext {
            url: job.callback_url.clone(),
            secret: job.callback_secret.clone(),
            meta: job.meta.clone(),
            trace_id: job.trace_id.clone(),
        };
        if context.url.is_some() && context.meta.is_some() {
            return context;
        }

        match self.job_store.get(&job.job_id).await {
            Ok(Some(record)) => {
                if context.url.is_none() && record.callback_url.is_some() {
                    context.url = record.callback_url;
                    context.secret = context.secret.or(record.callback_secret);
                    self.obs.emit(
                        ObsEvent::info("callback_url_restored", "callback url from record")
                            .job_id(&job.job_id),
                    );
                }
                if context.meta.is_none() {
                    context.meta = record.meta;
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.obs.emit(
                    ObsEvent::warn("record_read_failed", "callback context incomplete")
                        .job_id(&job.job_id)
                        .detail(json!({"error": e.to_string()})),
                );
            }
        }
        context
    }
}

/// Truncate to at most `max` characters, marking the cut.
fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((index, _)) => format!("{}…", &s[..index]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc…");
        // Multibyte boundary.
        assert_eq!(truncate("ééééé", 2), "éé…");
    }
}
