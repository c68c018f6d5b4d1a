use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which upstream call shape a job targets.
///
/// The target determines both the queue the job is routed to and the
/// upstream URL it is executed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTarget {
    /// Plain authenticated REST call.
    Rest,
    /// Binary upload.
    Upload,
    /// Binary replace.
    Replace,
}

impl JobTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTarget::Rest => "rest",
            JobTarget::Upload => "upload",
            JobTarget::Replace => "replace",
        }
    }
}

/// Lifecycle state of a job.
///
/// Mutated only by the worker loop; monotonic except `Retrying` → `Retrying`.
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Retrying,
    Completed,
    Failed,
}

/// The unit of work, as published to the broker.
///
/// All fields are immutable once queued. `trace_id`, `request_meta` and
/// `meta` are opaque pass-through data the pipeline never interprets.
/// Serialized field names match the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "jobId")]
    pub job_id: String,

    pub method: String,

    #[serde(default)]
    pub params: Value,

    #[serde(rename = "userId")]
    pub user_id: String,

    pub target: JobTarget,

    /// Upstream URL override recorded at intake, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(rename = "callbackUrl", default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,

    #[serde(rename = "callbackSecret", default, skip_serializing_if = "Option::is_none")]
    pub callback_secret: Option<String>,

    #[serde(rename = "traceId", default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    #[serde(rename = "requestMeta", default, skip_serializing_if = "Option::is_none")]
    pub request_meta: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Job {
    /// Create a new job with a generated id.
    pub fn new(
        method: impl Into<String>,
        params: Value,
        user_id: impl Into<String>,
        target: JobTarget,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
            user_id: user_id.into(),
            target,
            url: None,
            callback_url: None,
            callback_secret: None,
            trace_id: None,
            request_meta: None,
            meta: None,
        }
    }

    /// Attach a callback URL and optional signing secret.
    pub fn with_callback(mut self, url: impl Into<String>, secret: Option<String>) -> Self {
        self.callback_url = Some(url.into());
        self.callback_secret = secret;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Intake validation rules. An empty list means the job is acceptable.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.method.trim().is_empty() {
            errors.push("method is required".to_string());
        }
        if self.user_id.trim().is_empty() {
            errors.push("userId is required".to_string());
        }
        match &self.params {
            Value::Null | Value::Object(_) => {}
            _ => errors.push("params must be an object".to_string()),
        }
        if let Some(meta) = &self.meta {
            if !meta.is_object() {
                errors.push("meta must be an object".to_string());
            }
        }
        errors
    }
}

/// Message metadata carried alongside the payload, not inside it.
///
/// `attempts` is the single source of truth for the retry counter; the
/// durable record's copy is informational only. `failed` marks messages
/// published to the dead-letter queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(default)]
    pub attempts: u32,

    #[serde(default)]
    pub failed: bool,
}

/// Caller's upstream access token pair, owned by an external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub access_secret: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, access_secret: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            access_secret: access_secret.into(),
            nsid: None,
            username: None,
        }
    }

    /// A credential with an empty token or secret is malformed.
    pub fn is_valid_shape(&self) -> bool {
        !self.access_token.is_empty() && !self.access_secret.is_empty()
    }
}

/// Durable job record.
///
/// Only the worker loop mutates it, via targeted field updates (`JobPatch`);
/// the record is never replaced wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "jobId")]
    pub job_id: String,

    pub user_id: String,
    pub method: String,
    pub params: Value,
    pub target: JobTarget,
    pub queue: String,

    #[serde(rename = "callbackUrl", default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,

    #[serde(rename = "callbackSecret", default, skip_serializing_if = "Option::is_none")]
    pub callback_secret: Option<String>,

    pub state: JobState,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,

    /// Informational copy of the attempt counter; the message metadata is
    /// authoritative.
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returnvalue: Option<Value>,

    #[serde(rename = "failedReason", default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,

    #[serde(rename = "failedAt", default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,

    #[serde(rename = "requestMeta", default, skip_serializing_if = "Option::is_none")]
    pub request_meta: Option<Value>,
}

impl JobRecord {
    /// Initial record for a freshly enqueued job.
    pub fn init(job: &Job, queue: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job.job_id.clone(),
            user_id: job.user_id.clone(),
            method: job.method.clone(),
            params: job.params.clone(),
            target: job.target,
            queue: queue.into(),
            callback_url: job.callback_url.clone(),
            callback_secret: job.callback_secret.clone(),
            state: JobState::Queued,
            created_at: now,
            updated_at: now,
            attempts: 0,
            returnvalue: None,
            failed_reason: None,
            stacktrace: None,
            failed_at: None,
            meta: job.meta.clone(),
            request_meta: job.request_meta.clone(),
        }
    }
}

/// Targeted field update for a job record.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub attempts: Option<u32>,
    pub returnvalue: Option<Value>,
    pub failed_reason: Option<String>,
    pub stacktrace: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn completed(returnvalue: Value) -> Self {
        Self {
            state: Some(JobState::Completed),
            returnvalue: Some(returnvalue),
            ..Self::default()
        }
    }

    pub fn retrying(attempts: u32, failed_reason: impl Into<String>) -> Self {
        Self {
            state: Some(JobState::Retrying),
            attempts: Some(attempts),
            failed_reason: Some(failed_reason.into()),
            ..Self::default()
        }
    }

    pub fn failed(failed_reason: impl Into<String>, stacktrace: impl Into<String>) -> Self {
        Self {
            state: Some(JobState::Failed),
            failed_reason: Some(failed_reason.into()),
            stacktrace: Some(stacktrace.into()),
            failed_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

/// Error detail carried inside a failure callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackErrorDetail {
    pub message: String,
    pub code: Option<String>,
}

/// Body of the terminal webhook callback.
///
/// Exactly one terminal payload (state `completed` or `failed`) is produced
/// per job; intermediate retries never trigger a callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub job_id: String,
    pub user_id: String,
    pub queue: String,
    pub state: JobState,
    pub result: Option<Value>,
    pub error: Option<CallbackErrorDetail>,
    pub from_cache: bool,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub timestamp: DateTime<Utc>,
    pub trace_id: Option<String>,
    pub meta: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_serializes_with_wire_field_names() {
        let job = Job::new("echo", json!({"ping": "pong"}), "user-1", JobTarget::Rest)
            .with_callback("http://localhost/cb", Some("s3cret".into()))
            .with_trace_id("trace-1");

        let wire = serde_json::to_value(&job).unwrap();
        assert!(wire.get("jobId").is_some());
        assert_eq!(wire["userId"], "user-1");
        assert_eq!(wire["target"], "rest");
        assert_eq!(wire["callbackUrl"], "http://localhost/cb");
        assert_eq!(wire["traceId"], "trace-1");
        // Absent optionals are omitted, not null.
        assert!(wire.get("meta").is_none());
    }

    #[test]
    fn job_deserializes_with_missing_optionals() {
        let job: Job = serde_json::from_value(json!({
            "jobId": "j1",
            "method": "echo",
            "userId": "u1",
            "target": "upload",
        }))
        .unwrap();
        assert_eq!(job.target, JobTarget::Upload);
        assert!(job.params.is_null());
        assert!(job.callback_url.is_none());
    }

    #[test]
    fn message_meta_defaults() {
        let meta: MessageMeta = serde_json::from_value(json!({})).unwrap();
        assert_eq!(meta.attempts, 0);
        assert!(!meta.failed);
    }

    #[test]
    fn validation_catches_bad_fields() {
        let mut job = Job::new("", json!([1, 2]), " ", JobTarget::Rest);
        job.meta = Some(json!("not-an-object"));
        let errors = job.validation_errors();
        assert_eq!(errors.len(), 4);

        let ok = Job::new("echo", json!({}), "u1", JobTarget::Rest);
        assert!(ok.validation_errors().is_empty());
    }

    #[test]
    fn credential_shape_check() {
        assert!(Credential::new("tok", "sec").is_valid_shape());
        assert!(!Credential::new("", "sec").is_valid_shape());
        assert!(!Credential::new("tok", "").is_valid_shape());
    }
}
