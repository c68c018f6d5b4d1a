//! Upstream API client: signed REST calls plus the two token-exchange
//! endpoints of the OAuth 1.0a handshake.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::UpstreamConfig;
use crate::error::ProcessError;
use crate::signing::RequestSigner;
use crate::types::{Credential, JobTarget};

/// Executes one upstream call on behalf of a caller.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn call(
        &self,
        target: JobTarget,
        method: &str,
        params: &Value,
        credential: &Credential,
    ) -> Result<Value, ProcessError>;
}

/// Turn a JSON parameter value into its query-string form. Strings pass
/// through unquoted; everything else uses its JSON serialization.
fn stringify_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Real HTTP client. All REST-style calls are GETs against the endpoint
/// selected by the job target, with the OAuth signature carried in the
/// `Authorization` header.
pub struct HttpUpstreamClient {
    signer: RequestSigner,
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpUpstreamClient {
    pub fn new(signer: RequestSigner, config: UpstreamConfig) -> Self {
        Self {
            signer,
            http: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self, target: JobTarget) -> &str {
        match target {
            JobTarget::Rest => &self.config.rest_url,
            JobTarget::Upload => &self.config.upload_url,
            JobTarget::Replace => &self.config.replace_url,
        }
    }

    fn query_params(method: &str, params: &Value) -> Vec<(String, String)> {
        let mut query = vec![
            ("method".to_string(), method.to_string()),
            ("format".to_string(), "json".to_string()),
            ("nojsoncallback".to_string(), "1".to_string()),
        ];
        if let Value::Object(map) = params {
            for (key, value) in map {
                query.push((key.clone(), stringify_param(value)));
            }
        }
        query
    }

    /// First leg of the OAuth handshake. Returns the decoded
    /// form-urlencoded response as an object.
    pub async fn request_token(&self, oauth_callback: &str) -> Result<Value, ProcessError> {
        let oauth_params = self
            .signer
            .oauth_params(&[("oauth_callback", oauth_callback)]);
        self.token_exchange(&self.config.request_token_url, oauth_params, "")
            .await
    }

    /// Final leg of the OAuth handshake: trade an authorized request token
    /// and verifier for the caller's access token pair.
    pub async fn access_token(
        &self,
        oauth_token: &str,
        oauth_token_secret: &str,
        oauth_verifier: &str,
    ) -> Result<Value, ProcessError> {
        let oauth_params = self.signer.oauth_params(&[
            ("oauth_token", oauth_token),
            ("oauth_verifier", oauth_verifier),
        ]);
        self.token_exchange(&self.config.access_token_url, oauth_params, oauth_token_secret)
            .await
    }

    async fn token_exchange(
        &self,
        url: &str,
        oauth_params: std::collections::BTreeMap<String, String>,
        token_secret: &str,
    ) -> Result<Value, ProcessError> {
        let header = self
            .signer
            .signed_header("POST", url, &[], &oauth_params, token_secret);

        let response = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, header)
            .send()
            .await
            .map_err(|e| ProcessError::Upstream {
                status: None,
                detail: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ProcessError::Upstream {
                status: Some(status.as_u16()),
                detail: body,
            });
        }
        Ok(decode_form_body(&body))
    }
}

/// Decode an `application/x-www-form-urlencoded` body into an object.
fn decode_form_body(body: &str) -> Value {
    let mut map = Map::new();
    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).unwrap_or_default().into_owned();
        let value = urlencoding::decode(value).unwrap_or_default().into_owned();
        map.insert(key, Value::String(value));
    }
    Value::Object(map)
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn call(
        &self,
        target: JobTarget,
        method: &str,
        params: &Value,
        credential: &Credential,
    ) -> Result<Value, ProcessError> {
        let base_url = self.endpoint(target).to_string();
        let query = Self::query_params(method, params);
        let oauth_params = self
            .signer
            .oauth_params(&[("oauth_token", credential.access_token.as_str())]);
        let header = self.signer.signed_header(
            "GET",
            &base_url,
            &query,
            &oauth_params,
            &credential.access_secret,
        );

        let response = self
            .http
            .get(&base_url)
            .query(&query)
            .header(reqwest::header::AUTHORIZATION, header)
            .send()
            .await
            .map_err(|e| ProcessError::Upstream {
                status: None,
                detail: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ProcessError::Upstream {
                status: Some(status.as_u16()),
                detail: body,
            });
        }

        // Some endpoints answer with bare text even on success.
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

/// Scripted client for tests. Responses are consumed in order; when the
/// script is empty the call echoes its input.
#[derive(Default)]
pub struct MockUpstreamClient {
    responses: Mutex<VecDeque<Result<Value, ProcessError>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockUpstreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Value) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_failure(&self, error: ProcessError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl UpstreamClient for MockUpstreamClient {
    async fn call(
        &self,
        _target: JobTarget,
        method: &str,
        params: &Value,
        _credential: &Credential,
    ) -> Result<Value, ProcessError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        match self.responses.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => Ok(json!({
                "stat": "ok",
                "method": method,
                "echo": params,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_stringify_like_a_query_string() {
        assert_eq!(stringify_param(&json!("plain")), "plain");
        assert_eq!(stringify_param(&json!(42)), "42");
        assert_eq!(stringify_param(&json!(true)), "true");
        assert_eq!(stringify_param(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn query_includes_envelope_fields() {
        let query =
            HttpUpstreamClient::query_params("test.echo", &json!({"ping": "pong", "n": 3}));
        assert!(query.contains(&("method".to_string(), "test.echo".to_string())));
        assert!(query.contains(&("format".to_string(), "json".to_string())));
        assert!(query.contains(&("nojsoncallback".to_string(), "1".to_string())));
        assert!(query.contains(&("ping".to_string(), "pong".to_string())));
        assert!(query.contains(&("n".to_string(), "3".to_string())));
    }

    #[test]
    fn form_body_decodes_to_object() {
        let decoded = decode_form_body("oauth_token=a%20b&oauth_token_secret=xyz");
        assert_eq!(decoded["oauth_token"], "a b");
        assert_eq!(decoded["oauth_token_secret"], "xyz");
    }

    #[tokio::test]
    async fn mock_scripts_then_echoes() {
        let mock = MockUpstreamClient::new();
        mock.push_response(json!({"stat": "ok", "scripted": true}));

        let cred = Credential::new("t", "s");
        let first = mock
            .call(JobTarget::Rest, "m", &json!({}), &cred)
            .await
            .unwrap();
        assert_eq!(first["scripted"], true);

        let second = mock
            .call(JobTarget::Rest, "m", &json!({"a": 1}), &cred)
            .await
            .unwrap();
        assert_eq!(second["echo"], json!({"a": 1}));
        assert_eq!(mock.call_count(), 2);
    }
}
