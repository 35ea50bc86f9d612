//! API error handling.
//!
//! Maps supervisor errors onto HTTP status codes with a JSON body.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::Error;

/// Seconds a client should wait before retrying a not-ready stream.
pub const RETRY_AFTER_SECS: u64 = 2;

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Stable machine-readable code, e.g. `OUTPUT_NOT_READY`.
    pub code: String,
    /// Text for humans.
    pub message: String,
}

/// An error a handler returns; rendered as status plus JSON body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    /// Sent as `Retry-After` when set.
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "WORKER_LAUNCH_FAILED", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let retry_after = err.is_retryable().then_some(RETRY_AFTER_SECS);
        let mut api_err = match err {
            Error::ChannelNotFound(id) => {
                ApiError::not_found(format!("Channel '{}' not found", id))
            }
            Error::OutputNotReady { channel_id } => ApiError::service_unavailable(
                "OUTPUT_NOT_READY",
                format!("Stream for channel '{}' is not ready yet", channel_id),
            ),
            Error::WorkerLaunchFailed { .. } => {
                tracing::warn!("{}", err);
                ApiError::bad_gateway(err.to_string())
            }
            Error::ShuttingDown => {
                ApiError::service_unavailable("SHUTTING_DOWN", "Server is shutting down")
            }
            Error::Configuration(msg) => ApiError::bad_request(msg),
            Error::Io(_) | Error::IoPath { .. } => {
                tracing::error!(error = %err, "Request failed on a filesystem error");
                ApiError::internal("storage error")
            }
            _ => {
                tracing::error!(error = %err, "Request failed with an internal error");
                ApiError::internal("internal error")
            }
        };
        api_err.retry_after = retry_after;
        api_err
    }
}

/// Handler result.
pub type ApiResult<T> = Result<T, ApiError>;
