//! Error types for auth-rs

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::warn;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
///
/// Denied credentials and unknown identities are not errors: they travel as
/// [`crate::backend::Verdict::Denied`]. These variants cover malformed
/// requests and faults that the caller must see as such.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed lookup request (missing header, unsupported method, ...)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Identity provider unreachable or answered with an unexpected status
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Identity provider answered with a body we cannot interpret
    #[error("Unexpected backend response: {0}")]
    BackendResponse(String),

    /// Downstream server name could not be resolved
    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },
}

impl GatewayError {
    /// HTTP status reported to the calling mail component
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendResponse(_) | GatewayError::Resolve { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Config(_) | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::BackendResponse(e.to_string())
        } else {
            GatewayError::BackendUnavailable(e.to_string())
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            GatewayError::BadRequest(reason) => (status, reason.clone()).into_response(),
            other => {
                warn!("Lookup failed: {}", other);
                let reason = status.canonical_reason().unwrap_or("Error");
                (status, reason).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::BackendUnavailable("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Resolve {
                host: "imap".into(),
                reason: "nxdomain".into()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_backend_details_not_echoed() {
        let response =
            GatewayError::BackendResponse("secret internals".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
