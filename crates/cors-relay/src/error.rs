//! Relay error taxonomy and its mapping to client-visible responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Everything that can fail a relay before response headers are committed.
///
/// Failures after the status line has been sent are logged by the body stream
/// instead and never become a `RelayError`.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no target URL provided")]
    MissingTarget,

    #[error("invalid target URL: {0}")]
    MalformedTarget(String),

    #[error("target host not allowed: {0}")]
    ForbiddenTarget(String),

    #[error("resolver did not answer within {0}s")]
    ResolverTimeout(u64),

    #[error("resolver unreachable: {0}")]
    ResolverConnect(String),

    #[error("resolver returned status {status}: {body}")]
    ResolverUpstream { status: u16, body: String },

    #[error("resolver returned an unusable destination: {0}")]
    ResolverInvalidResponse(String),

    #[error("upstream connection failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream did not respond within {0}s")]
    UpstreamTimeout(u64),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MissingTarget | RelayError::MalformedTarget(_) => StatusCode::BAD_REQUEST,
            RelayError::ForbiddenTarget(_) => StatusCode::FORBIDDEN,
            RelayError::ResolverTimeout(_) | RelayError::UpstreamTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            RelayError::ResolverConnect(_)
            | RelayError::ResolverUpstream { .. }
            | RelayError::ResolverInvalidResponse(_)
            | RelayError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable machine-readable name, used in the JSON body and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::MissingTarget => "missing_target",
            RelayError::MalformedTarget(_) => "malformed_target",
            RelayError::ForbiddenTarget(_) => "forbidden_target",
            RelayError::ResolverTimeout(_) => "resolver_timeout",
            RelayError::ResolverConnect(_) => "resolver_connect",
            RelayError::ResolverUpstream { .. } => "resolver_upstream",
            RelayError::ResolverInvalidResponse(_) => "resolver_invalid_response",
            RelayError::UpstreamConnect(_) => "upstream_connect",
            RelayError::UpstreamTimeout(_) => "upstream_timeout",
        }
    }

    /// Client errors are the caller's fault and logged at a lower level.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });
        (self.status(), axum::Json(body)).into_response()
    }
}
