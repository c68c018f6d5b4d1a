//! A queued dispatch pipeline for a rate-limited, OAuth 1.0a REST API.
//!
//! Jobs are routed to per-target queues, executed by worker loops against
//! the upstream API, and reported back over **signed webhook callbacks**.
//! Successful responses are cached under canonical call fingerprints so
//! identical submissions short-circuit the upstream.
//!
//! ## Guarantees
//! - At-least-once processing (acks follow durable state transitions)
//! - Bounded retries with a dead-letter queue
//! - At most one terminal callback per processed job
//! - Per-user fixed-window rate limiting ahead of every upstream call
//!
//! ## Non-Guarantees
//! - Exactly-once execution of upstream calls
//! - Rate-limit enforcement when the counter store is down (fails open)
//! - Callback delivery (best-effort with bounded retries)
//!
//! The broker and the durable stores are external collaborators reached
//! through the [`Broker`], [`JobStore`], [`CredentialStore`] and
//! [`KvStore`] traits; in-memory implementations of each are included for
//! embedded usage and tests.

mod cache;
mod callback;
mod config;
mod error;
mod fingerprint;
mod observe;
mod processor;
mod queue;
mod ratelimit;
mod signing;
mod storage;
mod types;
mod upstream;
mod worker;

#[cfg(feature = "redis")]
mod storage_redis;

pub use cache::{CacheEntry, CachedResponse, ResponseCache};
pub use callback::{CallbackDelivery, CallbackResult};
pub use config::{
    CacheConfig, CallbackConfig, Config, JobsConfig, RateLimitConfig, UpstreamConfig, WorkerConfig,
};
pub use error::{BrokerError, ProcessError, SigningError, StoreError};
pub use fingerprint::{cache_key, canonicalize};
pub use observe::{NoopSink, ObsEvent, ObsLevel, ObsSink, TracingSink};
pub use processor::{JobProcessor, ProcessOutcome};
pub use queue::{
    publish_job, queue_for_target, sanitize_queue_name, Broker, Delivery, InMemoryBroker,
    QUEUE_DLQ, QUEUE_REPLACE, QUEUE_REST, QUEUE_UPLOAD,
};
pub use ratelimit::{Admission, RateLimiter};
pub use signing::{
    compute_callback_signature, percent_encode, verify_callback_signature, RequestSigner,
};
pub use storage::{
    CredentialStore, InMemoryCredentialStore, InMemoryJobStore, InMemoryKvStore, JobStore, KvStore,
};
pub use types::{
    CallbackErrorDetail, CallbackPayload, Credential, Job, JobPatch, JobRecord, JobState,
    JobTarget, MessageMeta,
};
pub use upstream::{HttpUpstreamClient, MockUpstreamClient, UpstreamClient};
pub use worker::WorkerLoop;

#[cfg(feature = "redis")]
pub use storage_redis::RedisKvStore;
