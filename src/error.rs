use thiserror::Error;

/// Construction-time faults in the OAuth signer.
///
/// These indicate misconfiguration, not runtime conditions; they should not
/// occur once a deployment is wired up correctly.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("consumer key is required")]
    MissingConsumerKey,

    #[error("consumer secret is required")]
    MissingConsumerSecret,
}

/// A durable-store or key-value-store operation failed.
///
/// Callers decide whether this is fatal: cache and rate-limit paths swallow
/// it (fail-open), job-record writes on the critical path propagate it.
#[derive(Debug, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Failures raised while processing a single job attempt.
///
/// The worker loop applies the same retry policy to every variant: it has no
/// channel back to the caller other than the terminal callback, so it cannot
/// usefully distinguish permanent from transient faults here.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("credential not found for user {user_id}")]
    CredentialNotFound { user_id: String },

    #[error("invalid credential shape for user {user_id}")]
    InvalidCredential { user_id: String },

    /// Non-2xx or network fault from the upstream API. The response body is
    /// carried as the failure detail.
    #[error("upstream call failed: {detail}")]
    Upstream { status: Option<u16>, detail: String },

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProcessError {
    /// HTTP status of the upstream response, when one was received.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            ProcessError::Upstream { status, .. } => *status,
            _ => None,
        }
    }
}

/// Errors from the message broker boundary.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker (or an in-memory queue) has been closed.
    #[error("broker is closed")]
    Closed,

    #[error("broker error: {0}")]
    Other(String),
}
