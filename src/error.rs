//! # Error Handling
//!
//! This module defines the two error families used by the service and how they're
//! converted to HTTP responses.
//!
//! ## Two Layers of Errors:
//! - **VoiceError**: Failures inside the live voice pipeline (capture, transport,
//!   playback, teardown). Derived with `thiserror` so every variant gets a
//!   `Display` message from its `#[error(...)]` attribute.
//! - **AppError**: Failures surfaced to HTTP clients. Each variant maps to a status
//!   code and a JSON body.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **Purpose**: Forces you to handle both success and failure cases
//! - **No exceptions**: A failing release step returns `Err`, it does not unwind the caller
//!
//! ### Traits for Error Conversion
//! - **From trait**: `?` converts a `VoiceError` into an `AppError` automatically
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings

use crate::coach::ConnectionState;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Errors raised by the voice pipeline.
///
/// ## Error Categories:
/// - **Capture**: `PermissionDenied`, `DeviceUnavailable` - the pipeline must not start
/// - **Lifecycle**: `AlreadyActive`, `Cancelled` - start() rejected or overtaken by stop()
/// - **Transport**: `Transport` - backend connection problems
/// - **Playback**: `Decode`, `OutputClosed` - a chunk could not be scheduled
/// - **Teardown**: a single release step failed (the others still ran)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("a session is already {0}")]
    AlreadyActive(ConnectionState),

    #[error("session start cancelled by stop()")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("undecodable audio chunk: {0}")]
    Decode(String),

    #[error("audio output is closed")]
    OutputClosed,

    #[error("teardown step failed: {0}")]
    Teardown(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VoiceError {
    /// Whether this error came from acquiring the microphone.
    pub fn is_capture_failure(&self) -> bool {
        matches!(self, VoiceError::PermissionDenied | VoiceError::DeviceUnavailable(_))
    }
}

/// Custom error types for HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **Conflict**: The request clashes with the current session state (409 errors)
/// - **Unavailable**: The audio device or backend can't be used right now (503 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::Conflict("A session is already connected".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (transport failures, teardown problems, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Session is already connecting or connected
    Conflict(String),

    /// Microphone or backend currently unusable
    Unavailable(String),

    /// The conversational backend refused or dropped the session
    BadGateway(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),
}

/// Implementation of the Display trait for AppError.
///
/// ## Rust Concepts:
/// - **match**: Pattern matching to handle each error variant
/// - **write!**: Macro for formatting strings (like printf in C)
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
            AppError::BadGateway(msg) => write!(f, "Backend error: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl AppError {
    /// Map each error type to HTTP status code, machine-readable type and message.
    fn parts(&self) -> (actix_web::http::StatusCode, &'static str, String) {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.clone()),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "backend_error", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "conflict",
///     "message": "a session is already connected",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": message,           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()  // When the error occurred
            }
        }))
    }
}

/// Pipeline errors reaching an HTTP handler.
///
/// ## Mapping:
/// - A second start() while a session is live is a 409, not a server fault
/// - Missing microphone / denied permission is a 503 the user can fix and retry
/// - A backend that refuses or fails the session is a 502
/// - Everything else is a 500
impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::AlreadyActive(_) | VoiceError::Cancelled => AppError::Conflict(err.to_string()),
            VoiceError::PermissionDenied | VoiceError::DeviceUnavailable(_) => {
                AppError::Unavailable(err.to_string())
            }
            VoiceError::Transport(_) => AppError::BadGateway(err.to_string()),
            VoiceError::Config(msg) => AppError::ConfigError(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Automatic conversion from anyhow::Error to AppError.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Automatic conversion from JSON parsing errors to AppError.
///
/// ## Why BadRequest:
/// JSON parsing errors are almost always due to the client sending malformed data.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}
