//! Application error types and result alias.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Source directory missing: {0}")]
    SourceMissing(String),

    #[error("Target not writable: {0}")]
    TargetUnwritable(String),

    #[error("Copy failed: {0}")]
    CopyFailed(String),

    #[error("OpenList authentication failed: {0}")]
    Auth(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Mass-delete protection tripped: {0}")]
    ProtectionTripped(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Duplicate admission, run already in flight, etc.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Map error variant to an HTTP status code.
    fn status(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidTask(_) | Self::InvalidCron(_) => StatusCode::BAD_REQUEST,
            Self::SourceMissing(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::TargetUnwritable(_) | Self::CopyFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Remote(_) => StatusCode::BAD_GATEWAY,
            Self::ProtectionTripped(_) => StatusCode::CONFLICT,
            Self::Cancelled => StatusCode::CONFLICT,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Io(_) | Self::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Return a user-facing message. Wrapped foreign errors (Io, Json) are
    /// flattened so internals do not leak into API responses.
    fn user_message(&self) -> String {
        match self {
            Self::Io(_) => "IO operation failed".to_string(),
            Self::Json(_) => "Invalid JSON".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.user_message();

        tracing::error!(error = %self, status = %status, "Request error");

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}
