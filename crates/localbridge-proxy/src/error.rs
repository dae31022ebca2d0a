//! Proxy error types.
//!
//! Failures that happen before a request is queued (authentication,
//! validation, a full queue) are answered with an Anthropic error body through
//! [`ResponseError`]. Backend failures never reach the client this way; the
//! translator turns them into a regular message envelope instead.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use localbridge_queue::QueueError;
use thiserror::Error;

use crate::types::ErrorResponse;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid or missing API key")]
    Unauthorized,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("server is busy: {max_pending} requests already waiting")]
    QueueFull { max_pending: usize },

    #[error("backend request timed out after {timeout_ms} ms")]
    BackendTimeout { timeout_ms: u64 },

    #[error("backend returned {status}: {body}")]
    BackendHttp { status: u16, body: String },

    #[error("backend request failed: {0}")]
    BackendTransport(#[from] reqwest::Error),

    #[error("backend response could not be decoded: {0}")]
    BackendDecode(String),

    #[error("request was dropped before the backend was called")]
    Abandoned,

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<QueueError> for ProxyError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full { max_pending } => Self::QueueFull { max_pending },
            QueueError::Abandoned => Self::Abandoned,
        }
    }
}

impl ProxyError {
    /// Anthropic `error.type` for this failure.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized => "authentication_error",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::QueueFull { .. } | Self::Abandoned => "overloaded_error",
            Self::BackendTimeout { .. } => "timeout_error",
            Self::BackendHttp { .. } | Self::BackendTransport(_) | Self::BackendDecode(_) => {
                "api_error"
            }
            Self::Config(_) => "api_error",
        }
    }

    /// Text shown to the caller in place of model output.
    pub fn describe(&self) -> String {
        format!("[localbridge] {}", self)
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::QueueFull { .. } | Self::Abandoned => StatusCode::SERVICE_UNAVAILABLE,
            Self::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BackendHttp { .. } | Self::BackendTransport(_) | Self::BackendDecode(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse::new(
            self.error_type(),
            self.to_string(),
        ))
    }
}
