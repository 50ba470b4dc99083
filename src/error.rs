//! Crate-wide error taxonomy and its mapping onto the admin/webhook HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Every error kind a caller of [`crate::collector`] can observe.
#[derive(Debug, Error)]
pub enum AppError {
    /// Unknown action, invalid granularity, malformed date, or unknown cat_id.
    #[error("validation error: {0}")]
    Validation(String),

    /// Connection refused / DNS failure reaching the upstream managed-task service.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// HTTP deadline or webhook rendezvous deadline elapsed.
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Non-200 response or malformed body from the upstream service.
    #[error("upstream error: {0}")]
    UpstreamError(String),

    /// The circuit breaker rejected the call without contacting upstream.
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    /// Login rate-limit window exceeded.
    #[error("rate limited")]
    RateLimited,

    /// Missing log id, rule, or job.
    #[error("not found: {0}")]
    NotFound(String),

    /// Wraps `sqlx` failures that aren't a meaningful domain error on their own.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Wraps `redis` failures.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Anything else; logged with full context, surfaced as a bare 500.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            AppError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "ValidationError",
            AppError::UpstreamUnavailable(_) => "UpstreamUnavailable",
            AppError::UpstreamTimeout(_) => "UpstreamTimeout",
            AppError::UpstreamError(_) => "UpstreamError",
            AppError::CircuitOpen(_) => "CircuitOpen",
            AppError::RateLimited => "RateLimited",
            AppError::NotFound(_) => "NotFound",
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => "Internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "request failed");
        } else {
            tracing::warn!(error = %self, kind = self.kind(), "request rejected");
        }
        let body = Json(json!({ "error": self.kind(), "message": self.to_string() }));
        (status, body).into_response()
    }
}

/// Convenience alias used throughout the collection fabric.
pub type AppResult<T> = Result<T, AppError>;
