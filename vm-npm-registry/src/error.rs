//! # Error Handling and Response Types
//!
//! This module provides error handling for the npm registry front-end. It defines
//! the crate-wide error type, the machine-readable error classification and the
//! HTTP status mapping used at the serving boundary.
//!
//! ## Key Types
//!
//! - [`AppError`]: Main error enum covering all failures of the metadata and tarball engine
//! - [`ApiErrorResponse`]: Standardized JSON error response format
//! - [`ErrorCode`]: Machine-readable error classification
//! - [`AppResult<T>`]: Convenience type alias for Results using `AppError`
//!
//! ## Error Classifications
//!
//! "Not found" is not an error inside the engine: metadata and artifact lookups
//! return `Ok(None)` and the serving boundary turns that into a 404. What remains
//! maps onto HTTP status codes as follows:
//!
//! - **Validation Errors** (400 Bad Request): malformed coordinates or documents
//! - **Not Found** (404 Not Found): unknown repositories
//! - **Upstream Errors** (502 Bad Gateway): transport faults talking to the remote registry
//! - **Internal Errors** (500 Internal Server Error): store and I/O faults
//!
//! ## Error Response Format
//!
//! ```json
//! {
//!   "error": "Human-readable error message",
//!   "code": "machine_readable_error_code",
//!   "details": {...},
//!   "timestamp": "2024-01-01T12:00:00Z"
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

/// Standardized error response structure for consistent API error handling
#[derive(Serialize, Debug)]
pub struct ApiErrorResponse {
    pub error: String,          // Human-readable error message
    pub code: String,           // Machine-readable error code
    pub details: Option<Value>, // Additional error details
    pub timestamp: String,      // ISO 8601 timestamp
}

/// Error code classification for machine-readable error types
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCode {
    ValidationError, // Malformed request coordinates or documents
    NotFound,        // Missing resources
    UpstreamError,   // Remote registry faults
    InternalError,   // Store and server-side errors
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::UpstreamError => "upstream_error",
            ErrorCode::InternalError => "internal_error",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Application-specific error types with error codes
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Base64 decoding error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Metadata store error: {0}")]
    Store(String),

    #[error("Upstream registry error: {0}")]
    Upstream(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Get the appropriate error code for this error type
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AppError::BadRequest(_) | AppError::Json(_) | AppError::Base64(_) => {
                ErrorCode::ValidationError
            }
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::Http(_) | AppError::Upstream(_) => ErrorCode::UpstreamError,
            AppError::Store(_) | AppError::InternalError(_) => ErrorCode::InternalError,
            AppError::Io(_) | AppError::Anyhow(_) => ErrorCode::InternalError,
        }
    }

    /// Whether this error signals invalid input rather than a fault.
    ///
    /// Callers use this to fall back from package-metadata handling to
    /// tarball handling when a path does not parse as package coordinates.
    pub fn is_invalid_input(&self) -> bool {
        self.error_code() == ErrorCode::ValidationError
    }

    /// Get additional error details if available
    pub fn details(&self) -> Option<Value> {
        match self {
            AppError::Anyhow(e) => e
                .source()
                .map(|source| json!({"source": source.to_string()})),
            AppError::Http(e) => e.url().map(|url| json!({"url": url.as_str()})),
            _ => None,
        }
    }

    /// Create a standardized error response
    pub fn to_error_response(&self) -> ApiErrorResponse {
        let code = self.error_code();
        ApiErrorResponse {
            error: self.to_string(),
            code: code.as_str().to_string(),
            details: self.details(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let error_response = self.to_error_response();
        let status = self.error_code().http_status();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            if let AppError::Anyhow(ref e) = self {
                tracing::error!(source = ?e.source(), "Internal server error details");
            }
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        tracing::debug!(status = %status, code = %error_response.code, "Returning standardized error response");

        (status, axum::Json(error_response)).into_response()
    }
}

/// Convenient result type for application operations.
///
/// This type alias provides a standard Result type using [`AppError`] for all
/// application-level operations, reducing boilerplate in function signatures.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map_to_statuses() {
        assert_eq!(
            AppError::BadRequest("x".into()).error_code().http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("x".into()).error_code().http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Upstream("x".into()).error_code().http_status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::Store("x".into()).error_code().http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_invalid_input_classification() {
        assert!(AppError::BadRequest("bad path".into()).is_invalid_input());
        let json_err = serde_json::from_str::<Value>("{").unwrap_err();
        assert!(AppError::from(json_err).is_invalid_input());
        assert!(!AppError::Store("disk".into()).is_invalid_input());
    }

    #[test]
    fn test_error_response_shape() {
        let response = AppError::NotFound("Package not found: left-pad".into()).to_error_response();
        assert_eq!(response.code, "not_found");
        assert_eq!(response.error, "Package not found: left-pad");
        assert!(response.details.is_none());
        assert!(!response.timestamp.is_empty());
    }
}
