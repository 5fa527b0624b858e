//! Error handling for turretd

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict (e.g. tracking session already active)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Servo daemon did not answer within the deadline.
    /// The move may still have been executed - there is no read-back.
    #[error("Servo command {seq} timed out")]
    ServoTimeout { seq: u64 },

    /// Servo daemon not running / not yet READY
    #[error("Servo link not ready: {0}")]
    ServoNotReady(String),

    /// Servo daemon answered with ERR
    #[error("Servo error: {0}")]
    Servo(String),

    /// Video producer failed to come up within the startup window
    #[error("Stream startup failed: {0}")]
    StreamStartup(String),

    /// Child process fault (spawn failure, unexpected exit)
    #[error("Process error: {0}")]
    Process(String),

    /// Detector reported a fatal fault
    #[error("Detector error: {0}")]
    Detector(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            Error::ServoTimeout { seq } => (
                StatusCode::GATEWAY_TIMEOUT,
                "SERVO_TIMEOUT",
                format!("Servo command {} timed out", seq),
            ),
            Error::ServoNotReady(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVO_NOT_READY",
                msg.clone(),
            ),
            Error::Servo(msg) => (StatusCode::BAD_GATEWAY, "SERVO_ERROR", msg.clone()),
            Error::StreamStartup(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STREAM_STARTUP",
                msg.clone(),
            ),
            Error::Process(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "PROCESS_ERROR",
                msg.clone(),
            ),
            Error::Detector(msg) => (StatusCode::BAD_GATEWAY, "DETECTOR_ERROR", msg.clone()),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", e.to_string()),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
