//! Terminal webhook callback delivery.
//!
//! Best-effort with bounded retries: exhaustion is reported, never
//! propagated, so a dead callback receiver can't fail a completed job.

use serde_json::json;

use crate::config::CallbackConfig;
use crate::observe::{ObsEvent, ObsSink};
use crate::signing;
use crate::types::CallbackPayload;

/// What happened to one callback.
#[derive(Debug, Clone)]
pub struct CallbackResult {
    pub sent: bool,
    /// POST attempts actually made.
    pub attempts: u32,
    /// Last HTTP status received, if any response arrived.
    pub status: Option<u16>,
    pub reason: Option<String>,
}

impl CallbackResult {
    fn skipped(reason: &str) -> Self {
        Self {
            sent: false,
            attempts: 0,
            status: None,
            reason: Some(reason.to_string()),
        }
    }
}

pub struct CallbackDelivery {
    http: reqwest::Client,
    config: CallbackConfig,
    obs: std::sync::Arc<dyn ObsSink>,
}

impl CallbackDelivery {
    pub fn new(config: CallbackConfig, obs: std::sync::Arc<dyn ObsSink>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            obs,
        }
    }

    /// Deliver a terminal payload. The body is serialized once; when a
    /// secret is present the hex HMAC-SHA256 of that exact body rides in
    /// `X-Signature`.
    pub async fn deliver(
        &self,
        url: Option<&str>,
        secret: Option<&str>,
        payload: &CallbackPayload,
    ) -> CallbackResult {
        if !self.config.enabled {
            return CallbackResult::skipped("disabled");
        }
        let Some(url) = url else {
            return CallbackResult::skipped("no callback url");
        };

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                self.obs.emit(
                    ObsEvent::error("callback_encode_failed", "callback body not serializable")
                        .job_id(&payload.job_id)
                        .detail(json!({"error": e.to_string()})),
                );
                return CallbackResult::skipped("encode failed");
            }
        };
        let signature = secret.map(|s| signing::compute_callback_signature(s, &body));

        let mut last_status = None;
        let mut last_reason = None;
        for attempt in 1..=self.config.attempts.max(1) {
            let mut request = self
                .http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
            if let Some(signature) = &signature {
                request = request.header("X-Signature", signature.clone());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    last_status = Some(status.as_u16());
                    if status.is_success() {
                        self.obs.emit(
                            ObsEvent::info("callback_delivered", "callback accepted")
                                .job_id(&payload.job_id)
                                .user_id(&payload.user_id)
                                .trace_id(payload.trace_id.as_deref())
                                .detail(json!({"attempt": attempt, "status": status.as_u16()})),
                        );
                        return CallbackResult {
                            sent: true,
                            attempts: attempt,
                            status: last_status,
                            reason: None,
                        };
                    }
                    last_reason = Some(format!("http {}", status.as_u16()));
                }
                Err(e) => {
                    last_reason = Some(e.to_string());
                }
            }

            self.obs.emit(
                ObsEvent::warn("callback_attempt_failed", "callback attempt failed")
                    .job_id(&payload.job_id)
                    .user_id(&payload.user_id)
                    .detail(json!({
                        "attempt": attempt,
                        "status": last_status,
                        "reason": last_reason,
                    })),
            );

            if attempt < self.config.attempts {
                tokio::time::sleep(self.config.delay).await;
            }
        }

        self.obs.emit(
            ObsEvent::error("callback_exhausted", "callback delivery gave up")
                .job_id(&payload.job_id)
                .user_id(&payload.user_id)
                .detail(json!({
                    "attempts": self.config.attempts,
                    "status": last_status,
                    "reason": last_reason,
                })),
        );
        CallbackResult {
            sent: false,
            attempts: self.config.attempts.max(1),
            status: last_status,
            reason: last_reason,
        }
    }
}
