//! End-to-end pipeline tests: in-memory broker and stores, a scripted
//! upstream, and a real HTTP callback receiver.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use upstream_dispatcher::{
    publish_job, Broker, CallbackConfig, CallbackDelivery, Credential, InMemoryBroker,
    InMemoryCredentialStore, InMemoryJobStore, InMemoryKvStore, Job, JobProcessor, JobRecord,
    JobStore,
    JobState, JobTarget, MessageMeta, MockUpstreamClient, ProcessError, RateLimiter,
    ResponseCache, TracingSink, WorkerLoop, QUEUE_DLQ, QUEUE_REST,
};

/// Poll until `check` passes or five seconds elapse.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for at least `min` requests at the receiver, then return them.
async fn received(receiver: &MockServer, min: usize) -> Vec<wiremock::Request> {
    eventually("callback requests", move || async move {
        receiver.received_requests().await.unwrap().len() >= min
    })
    .await;
    receiver.received_requests().await.unwrap()
}

struct Fixture {
    broker: Arc<InMemoryBroker>,
    credentials: Arc<InMemoryCredentialStore>,
    job_store: Arc<InMemoryJobStore>,
    upstream: Arc<MockUpstreamClient>,
    workers: Vec<JoinHandle<()>>,
}

impl Fixture {
    async fn start(rate_limit_per_second: u32) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let job_store = Arc::new(InMemoryJobStore::new());
        let upstream = Arc::new(MockUpstreamClient::new());
        let kv = Arc::new(InMemoryKvStore::new());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let obs = Arc::new(TracingSink);

        credentials.put("u1", Credential::new("tok", "sec")).await;

        let processor = Arc::new(JobProcessor::new(
            credentials.clone(),
            upstream.clone(),
            ResponseCache::new(kv.clone(), true, 300, "test:cache:"),
            job_store.clone(),
            obs.clone(),
            3,
            true,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            rate_limit_per_second,
            "test:rl:",
        ));
        let callbacks = Arc::new(CallbackDelivery::new(
            CallbackConfig {
                enabled: true,
                attempts: 2,
                delay: Duration::from_millis(20),
            },
            obs.clone(),
        ));

        let worker = Arc::new(WorkerLoop::new(
            QUEUE_REST,
            broker.clone(),
            processor,
            rate_limiter,
            job_store.clone(),
            callbacks,
            obs,
            3,
            Duration::from_millis(50),
            false,
        ));
        let workers = worker.spawn();

        Self {
            broker,
            credentials,
            job_store,
            upstream,
            workers,
        }
    }

    async fn submit(&self, job: &Job) {
        self.job_store
            .init(JobRecord::init(job, QUEUE_REST))
            .await
            .unwrap();
        publish_job(self.broker.as_ref(), job).await.unwrap();
    }

    async fn wait_for_state(&self, job_id: &str, state: JobState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(record) = self.job_store.get(job_id).await.unwrap() {
                if record.state == state {
                    return;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} never reached {state:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn shutdown(self) {
        self.broker.close();
        for handle in self.workers {
            handle.await.unwrap();
        }
    }
}

fn upstream_failure() -> ProcessError {
    ProcessError::Upstream {
        status: Some(500),
        detail: "internal error".into(),
    }
}

#[tokio::test]
async fn completed_job_reaches_the_callback_receiver() {
    let fx = Fixture::start(1000).await;
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .and(body_string_contains("\"state\":\"completed\""))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&receiver)
        .await;

    let job = Job::new("test.echo", json!({"ping": "pong"}), "u1", JobTarget::Rest)
        .with_callback(format!("{}/cb", receiver.uri()), Some("s3cret".into()))
        .with_trace_id("trace-1");
    fx.submit(&job).await;
    fx.wait_for_state(&job.job_id, JobState::Completed).await;

    let record = fx.job_store.get(&job.job_id).await.unwrap().unwrap();
    let returned = record.returnvalue.unwrap();
    assert_eq!(returned["echo"], json!({"ping": "pong"}));
    assert_eq!(record.attempts, 1);

    // The receiver saw exactly one signed callback.
    let requests = received(&receiver, 1).await;
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.contains_key("X-Signature"));
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["job_id"], job.job_id.as_str());
    assert_eq!(body["trace_id"], "trace-1");
    assert_eq!(body["from_cache"], false);
    assert_eq!(body["max_attempts"], 3);

    fx.shutdown().await;
}

#[tokio::test]
async fn identical_submission_is_served_from_cache() {
    let fx = Fixture::start(1000).await;
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&receiver)
        .await;

    let first = Job::new("test.echo", json!({"ping": "pong"}), "u1", JobTarget::Rest)
        .with_callback(format!("{}/cb", receiver.uri()), None);
    let second = Job::new("test.echo", json!({"ping": "pong"}), "u1", JobTarget::Rest)
        .with_callback(format!("{}/cb", receiver.uri()), None);

    fx.submit(&first).await;
    fx.wait_for_state(&first.job_id, JobState::Completed).await;
    fx.submit(&second).await;
    fx.wait_for_state(&second.job_id, JobState::Completed).await;

    // One upstream call served both jobs.
    assert_eq!(fx.upstream.call_count(), 1);

    let requests = received(&receiver, 2).await;
    let cached = requests.iter().any(|r| {
        let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
        body["from_cache"] == true
    });
    assert!(cached, "no callback reported a cache hit");

    fx.shutdown().await;
}

#[tokio::test]
async fn failing_job_retries_then_succeeds() {
    let fx = Fixture::start(1000).await;
    fx.upstream.push_failure(upstream_failure());

    let job = Job::new("test.echo", json!({"n": 1}), "u1", JobTarget::Rest);
    fx.submit(&job).await;
    fx.wait_for_state(&job.job_id, JobState::Completed).await;

    assert_eq!(fx.upstream.call_count(), 2);
    let record = fx.job_store.get(&job.job_id).await.unwrap().unwrap();
    assert_eq!(record.attempts, 2);
    // The retry left its trace in the record.
    assert!(record.failed_reason.is_some());

    fx.shutdown().await;
}

#[tokio::test]
async fn exhausted_job_is_dead_lettered_once() {
    let fx = Fixture::start(1000).await;
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&receiver)
        .await;

    fx.upstream.push_failure(upstream_failure());
    fx.upstream.push_failure(upstream_failure());
    fx.upstream.push_failure(upstream_failure());

    let job = Job::new("test.echo", json!({"n": 2}), "u1", JobTarget::Rest)
        .with_callback(format!("{}/cb", receiver.uri()), None);
    fx.submit(&job).await;
    fx.wait_for_state(&job.job_id, JobState::Failed).await;

    assert_eq!(fx.upstream.call_count(), 3);

    let record = fx.job_store.get(&job.job_id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts, 3);
    assert!(record.stacktrace.is_some());
    assert!(record.failed_at.is_some());

    // Exactly one dead-letter message, marked as failed with the final
    // attempt count.
    let broker = &fx.broker;
    eventually("dead-letter message", move || async move {
        broker.queue_depth(QUEUE_DLQ).await >= 1
    })
    .await;
    let dead = fx.broker.drain(QUEUE_DLQ).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead[0].1,
        MessageMeta {
            attempts: 3,
            failed: true
        }
    );
    let dead_job: Job = serde_json::from_slice(&dead[0].0).unwrap();
    assert_eq!(dead_job.job_id, job.job_id);

    // Exactly one terminal failure callback.
    let requests = received(&receiver, 1).await;
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["state"], "failed");
    assert_eq!(body["attempts_made"], 3);
    assert_eq!(body["error"]["code"], "500");

    fx.shutdown().await;
}

#[tokio::test]
async fn rate_limited_jobs_are_requeued_and_complete() {
    // One admission per second forces the second job through the requeue
    // path at least once.
    let fx = Fixture::start(1).await;

    let first = Job::new("test.echo", json!({"n": 1}), "u1", JobTarget::Rest);
    let second = Job::new("test.echo", json!({"n": 2}), "u1", JobTarget::Rest);
    fx.submit(&first).await;
    fx.submit(&second).await;

    fx.wait_for_state(&first.job_id, JobState::Completed).await;
    fx.wait_for_state(&second.job_id, JobState::Completed).await;

    // Being throttled consumed no attempts.
    let record = fx.job_store.get(&second.job_id).await.unwrap().unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(fx.upstream.call_count(), 2);

    fx.shutdown().await;
}

#[tokio::test]
async fn malformed_payload_is_dropped_and_the_worker_survives() {
    let fx = Fixture::start(1000).await;

    fx.broker
        .publish(QUEUE_REST, b"not json".to_vec(), MessageMeta::default())
        .await
        .unwrap();

    let job = Job::new("test.echo", json!({}), "u1", JobTarget::Rest);
    fx.submit(&job).await;
    fx.wait_for_state(&job.job_id, JobState::Completed).await;

    // Both messages end up acknowledged; nothing is stuck in flight.
    let broker = &fx.broker;
    eventually("all messages acked", move || async move {
        broker.unacked_count().await == 0
    })
    .await;
    assert_eq!(fx.broker.queue_depth(QUEUE_REST).await, 0);

    fx.shutdown().await;
}

#[tokio::test]
async fn unknown_user_is_dead_lettered_without_upstream_calls() {
    let fx = Fixture::start(1000).await;
    // Another user's credential must not leak across callers.
    fx.credentials
        .put("someone-else", Credential::new("t2", "s2"))
        .await;

    let job = Job::new("test.echo", json!({}), "nobody", JobTarget::Rest);
    fx.submit(&job).await;
    fx.wait_for_state(&job.job_id, JobState::Failed).await;

    assert_eq!(fx.upstream.call_count(), 0);
    let record = fx.job_store.get(&job.job_id).await.unwrap().unwrap();
    assert!(record
        .failed_reason
        .as_deref()
        .unwrap()
        .contains("credential not found"));

    fx.shutdown().await;
}
