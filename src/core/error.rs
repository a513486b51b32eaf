//! Error types and handling for the Genspark proxy server.
//!
//! This module provides a unified error type [`AppError`] that wraps various error sources
//! and implements proper HTTP response conversion.

use crate::core::error_types::{
    FailureReason, ERROR_TYPE_API, ERROR_TYPE_AUTHENTICATION, ERROR_TYPE_INVALID_REQUEST,
    ERROR_TYPE_RATE_LIMIT, ERROR_TYPE_TIMEOUT, ERROR_TYPE_TRANSLATION, ERROR_TYPE_UPSTREAM,
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the application.
///
/// All errors in the application should be converted to this type for consistent handling.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP request errors from the reqwest client
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication/authorization failures
    #[error("Unauthorized")]
    Unauthorized,

    /// Client provided invalid data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Inbound rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Request timeout errors
    #[error("Gateway timeout")]
    Timeout,

    /// Fatal upstream condition that switching credentials will not fix
    #[error("Upstream failure ({0}): {msg}", msg = .0.message())]
    Upstream(FailureReason),

    /// Upstream answered with an unexpected HTTP status
    #[error("Upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    /// Media fetch/decode/upload or payload build failure
    #[error("Translation error: {0}")]
    Translation(String),

    /// The pool never had (or no longer has) any usable credential
    #[error("No credentials available")]
    NoCredentials,

    /// Every credential was tried and failed recoverably
    #[error("All credentials temporarily unavailable after {attempts} attempts (last: {last})")]
    CredentialsExhausted {
        attempts: usize,
        last: FailureReason,
    },

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, ERROR_TYPE_API),
            AppError::Request(e) => {
                if e.is_timeout() {
                    (StatusCode::GATEWAY_TIMEOUT, ERROR_TYPE_TIMEOUT)
                } else {
                    (StatusCode::BAD_GATEWAY, ERROR_TYPE_UPSTREAM)
                }
            }
            AppError::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, ERROR_TYPE_API),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, ERROR_TYPE_AUTHENTICATION),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, ERROR_TYPE_INVALID_REQUEST),
            AppError::RateLimitExceeded(_) => (StatusCode::TOO_MANY_REQUESTS, ERROR_TYPE_RATE_LIMIT),
            AppError::Timeout => (StatusCode::GATEWAY_TIMEOUT, ERROR_TYPE_TIMEOUT),
            AppError::Upstream(reason) => match reason {
                FailureReason::ServiceUnavailable | FailureReason::ServerOverloaded => {
                    (StatusCode::SERVICE_UNAVAILABLE, ERROR_TYPE_UPSTREAM)
                }
                _ => (StatusCode::BAD_GATEWAY, ERROR_TYPE_UPSTREAM),
            },
            AppError::UpstreamStatus { .. } => (StatusCode::BAD_GATEWAY, ERROR_TYPE_UPSTREAM),
            AppError::Translation(_) => (StatusCode::INTERNAL_SERVER_ERROR, ERROR_TYPE_TRANSLATION),
            AppError::NoCredentials => (StatusCode::SERVICE_UNAVAILABLE, ERROR_TYPE_UPSTREAM),
            AppError::CredentialsExhausted { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, ERROR_TYPE_RATE_LIMIT)
            }
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, ERROR_TYPE_API),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();

        let error_message = match &self {
            AppError::Unauthorized => "Unauthorized".to_string(),
            AppError::Timeout => "Gateway timeout".to_string(),
            AppError::Upstream(reason) => reason.message().to_string(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "Request failed");
        } else {
            tracing::warn!(status = %status, error = %self, "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
