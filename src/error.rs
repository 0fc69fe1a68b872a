use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

/// Failures of the OAuth token lifecycle.
///
/// Absence of tokens is normally reported as `None` by the store and client;
/// these variants exist for callers that want to tell a rejected credential
/// apart from a network fault.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No tokens stored; login required")]
    NoTokens,

    #[error("Stored tokens are expired and could not be refreshed")]
    Expired,

    #[error("Token refresh rejected by provider: {status} {body}")]
    RefreshFailed { status: u16, body: String },

    #[error("Code exchange rejected by provider: {status} {body}")]
    ExchangeFailed { status: u16, body: String },

    #[error("No PKCE verifier found. Start the login flow first")]
    MissingVerifier,

    #[error("Authorization code is empty")]
    EmptyCode,

    #[error("Network error talking to the token endpoint: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Malformed token response: {0}")]
    InvalidTokenResponse(String),

    #[error("Token storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl AuthError {
    /// Whether retrying the same operation later could succeed without the
    /// user logging in again.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Network(_))
    }
}

/// Errors surfaced by the proxy to its HTTP callers.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("OAuth expired; please authenticate using the CLI")]
    Unauthenticated,

    #[error("Upstream rate limited the request")]
    RateLimited { body: Value },

    #[error("Upstream server error {status}")]
    ServerError { status: StatusCode, body: Value },

    #[error("Upstream rejected the request with {status}")]
    ClientError { status: StatusCode, body: Value },

    #[error("Failed to connect to upstream: {0}")]
    Transport(String),

    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Classify a non-success upstream response. Non-JSON bodies are wrapped in
    /// the standard error envelope so callers always receive JSON.
    pub fn from_status(status: StatusCode, text: &str) -> Self {
        let body = serde_json::from_str::<Value>(text)
            .unwrap_or_else(|_| error_envelope("api_error", text));
        if status == StatusCode::TOO_MANY_REQUESTS {
            UpstreamError::RateLimited { body }
        } else if status.is_server_error() {
            UpstreamError::ServerError { status, body }
        } else {
            UpstreamError::ClientError { status, body }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Unauthenticated => StatusCode::UNAUTHORIZED,
            UpstreamError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            UpstreamError::ServerError { status, .. } => *status,
            UpstreamError::ClientError { status, .. } => *status,
            UpstreamError::Transport(_) => StatusCode::BAD_GATEWAY,
            UpstreamError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            UpstreamError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn body(&self) -> Value {
        match self {
            UpstreamError::RateLimited { body }
            | UpstreamError::ServerError { body, .. }
            | UpstreamError::ClientError { body, .. } => body.clone(),
            UpstreamError::Unauthenticated => {
                error_envelope("authentication_error", &self.to_string())
            }
            UpstreamError::InvalidRequest(_) => {
                error_envelope("invalid_request_error", &self.to_string())
            }
            UpstreamError::Transport(_) | UpstreamError::InvalidResponse(_) => {
                error_envelope("api_error", &self.to_string())
            }
        }
    }
}

impl IntoResponse for UpstreamError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

pub fn error_envelope(kind: &str, message: &str) -> Value {
    json!({ "error": { "type": kind, "message": message } })
}
