//! # Error Handling
//!
//! Three error families live here:
//! - **AppError**: failures on the HTTP surface, converted to JSON responses
//! - **RelayError**: why a relay session could not start or had to end
//! - **AudioError**: capture, playback and codec failures on the client side
//!
//! ## Relay error taxonomy:
//! | Variant | When | Client sees |
//! |---|---|---|
//! | MissingCredential | no `api_key`, no header, no server default | one error notice, then close |
//! | AtCapacity | all session slots taken | one error notice, then close |
//! | UpstreamConnect / UpstreamTimeout | upstream socket never opened | error notice, then close |
//! | UpstreamClosed / Upstream | upstream went away mid-session | error notice, then close |
//!
//! A single upstream frame that fails to parse is not a session error: the
//! session logs it and drops the frame.
//!
//! None of these are retried by the relay. A client that wants a new voice
//! session connects again.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "VAD threshold must be between 0.0 and 1.0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always caused by the client, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Reasons a relay session fails to start or has to end.
///
/// The `Display` text is what the client receives in its `error` notice.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// No credential in the query string, headers or server config.
    #[error("No OpenAI API key provided")]
    MissingCredential,

    /// Every session slot is in use.
    #[error("Relay is at capacity, try again later")]
    AtCapacity,

    /// The upstream URL or credential could not be turned into a request.
    #[error("Invalid upstream request: {0}")]
    InvalidUpstreamRequest(String),

    /// The upstream socket failed to open.
    #[error("Failed to connect to OpenAI: {0}")]
    UpstreamConnect(String),

    /// The upstream socket did not open within the configured bound.
    #[error("Timed out connecting to OpenAI after {0}s")]
    UpstreamTimeout(u64),

    /// The upstream closed the connection after it was open.
    #[error("OpenAI connection closed: {0}")]
    UpstreamClosed(String),

    /// Transport error on the open upstream socket.
    #[error("OpenAI connection error: {0}")]
    Upstream(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Errors raised by the audio codec, capture, playback and voice client.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// The platform refused microphone access.
    #[error("Microphone permission denied")]
    PermissionDenied,

    /// No usable input or output device.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to open audio input stream: {0}")]
    InputStream(String),

    #[error("Failed to open audio output stream: {0}")]
    OutputStream(String),

    /// `start()` called while a capture is running.
    #[error("Audio capture is already active")]
    AlreadyActive,

    #[error("Failed to set up resampling: {0}")]
    Resample(String),

    #[error("Invalid PCM data: {0}")]
    InvalidPcm(String),

    #[error("Invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("WAV encoding failed: {0}")]
    Wav(#[from] std::io::Error),

    /// The platform decoder rejected a clip.
    #[error("Failed to decode audio clip: {0}")]
    Decode(String),

    /// The voice client lost or could not open its relay socket.
    #[error("Relay connection failed: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;

    #[test]
    fn test_missing_credential_message_is_client_facing() {
        assert_eq!(RelayError::MissingCredential.to_string(), "No OpenAI API key provided");
    }

    #[test]
    fn test_upstream_failures_name_the_cause() {
        assert_eq!(
            RelayError::UpstreamTimeout(10).to_string(),
            "Timed out connecting to OpenAI after 10s"
        );
        assert_eq!(
            RelayError::UpstreamClosed("1000".into()).to_string(),
            "OpenAI connection closed: 1000"
        );
    }

    #[test]
    fn test_app_error_response_shape() {
        let err = AppError::ValidationError("bad threshold".to_string());
        let response = err.error_response();
        assert_eq!(response.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let body = response.into_body().try_into_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "validation_error");
        assert_eq!(json["error"]["message"], "bad threshold");
    }
}
