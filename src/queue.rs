//! Queue routing and the broker boundary.
//!
//! The broker is an external at-least-once system; this module defines the
//! trait the pipeline consumes it through, plus an in-memory implementation
//! for embedded deployments and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::BrokerError;
use crate::types::{Job, JobTarget, MessageMeta};

pub const QUEUE_REST: &str = "dispatch_rest";
pub const QUEUE_UPLOAD: &str = "dispatch_upload";
pub const QUEUE_REPLACE: &str = "dispatch_replace";
pub const QUEUE_DLQ: &str = "dispatch_dlq";

/// Map a job target to its work queue.
pub fn queue_for_target(target: JobTarget) -> &'static str {
    match target {
        JobTarget::Rest => QUEUE_REST,
        JobTarget::Upload => QUEUE_UPLOAD,
        JobTarget::Replace => QUEUE_REPLACE,
    }
}

/// Queue names come from configuration in some deployments; colons collide
/// with the key namespacing convention and are replaced.
pub fn sanitize_queue_name(name: &str) -> String {
    name.replace(':', "_")
}

/// One received message. `delivery_tag` identifies it for acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub payload: Vec<u8>,
    pub meta: MessageMeta,
    pub delivery_tag: u64,
}

/// Broker boundary: publish, consume, acknowledge.
///
/// `next` returns `None` only when the broker is closed. Unacknowledged
/// deliveries are the broker's to redeliver.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, queue: &str, payload: Vec<u8>, meta: MessageMeta)
        -> Result<(), BrokerError>;
    async fn next(&self, queue: &str) -> Option<Delivery>;
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;
}

/// Serialize a job and publish it to the queue its target maps to.
/// Returns the queue name.
pub async fn publish_job(broker: &dyn Broker, job: &Job) -> Result<String, BrokerError> {
    let queue = queue_for_target(job.target);
    let payload =
        serde_json::to_vec(job).map_err(|e| BrokerError::Other(format!("encode job: {e}")))?;
    broker.publish(queue, payload, MessageMeta::default()).await?;
    Ok(queue.to_string())
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Vec<(Vec<u8>, MessageMeta, u64)>>,
    unacked: HashMap<u64, String>,
}

/// In-memory broker with FIFO queues and explicit acks.
#[derive(Default)]
pub struct InMemoryBroker {
    inner: Mutex<BrokerState>,
    notify: Notify,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the broker; pending and future `next` calls return `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, Vec::len)
    }

    pub async fn unacked_count(&self) -> usize {
        self.inner.lock().await.unacked.len()
    }

    /// Remove and return every message waiting on a queue, without acking
    /// semantics. Test helper.
    pub async fn drain(&self, queue: &str) -> Vec<(Vec<u8>, MessageMeta)> {
        let mut state = self.inner.lock().await;
        state
            .queues
            .remove(queue)
            .unwrap_or_default()
            .into_iter()
            .map(|(payload, meta, _)| (payload, meta))
            .collect()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        meta: MessageMeta,
    ) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .lock()
            .await
            .queues
            .entry(queue.to_string())
            .or_default()
            .push((payload, meta, tag));
        self.notify.notify_waiters();
        Ok(())
    }

    async fn next(&self, queue: &str) -> Option<Delivery> {
        loop {
            {
                let mut state = self.inner.lock().await;
                if let Some(messages) = state.queues.get_mut(queue) {
                    if !messages.is_empty() {
                        let (payload, meta, tag) = messages.remove(0);
                        state.unacked.insert(tag, queue.to_string());
                        return Some(Delivery {
                            queue: queue.to_string(),
                            payload,
                            meta,
                            delivery_tag: tag,
                        });
                    }
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            // The notify can race a publish that happened between the lock
            // drop and the wait; the timeout bounds the stall.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner.lock().await.unacked.remove(&delivery_tag);
        Ok(())
    }
}
