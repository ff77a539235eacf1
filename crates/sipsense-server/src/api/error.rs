//! API error types and response handling.
//!
//! This module provides a unified error type for all API handlers
//! with automatic conversion to appropriate HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use sipsense_core::SipsenseError;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
///
/// Each variant maps to a specific HTTP status code and produces a
/// consistent JSON error response.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - Invalid input from client.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - Resource does not exist.
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - Operation not valid in the current link state.
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Current connection state, when relevant.
        state: Option<String>,
    },

    /// 422 Unprocessable Entity - Well-formed request with unusable values.
    Unprocessable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 424 Failed Dependency - A prerequisite (selected device, calibration) is missing.
    FailedDependency {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional additional details.
        details: Option<String>,
    },

    /// 500 Internal Server Error - Unexpected server-side error.
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional details.
        details: Option<String>,
    },

    /// 502, 503 or 504 - The radio or the peripheral failed.
    Upstream {
        /// One of 502, 503, 504.
        status: StatusCode,
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., `CONNECTION_TIMEOUT`).
    pub error: String,

    /// Human-readable error message.
    pub message: String,

    /// Optional additional details.
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::FailedDependency { .. } => StatusCode::FAILED_DEPENDENCY,
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream { status, .. } => *status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_response = match self {
            Self::BadRequest {
                error_code,
                message,
            }
            | Self::NotFound {
                error_code,
                message,
            }
            | Self::Unprocessable {
                error_code,
                message,
            }
            | Self::Upstream {
                error_code,
                message,
                ..
            } => ErrorResponse {
                error: error_code,
                message,
                details: None,
            },

            Self::Conflict {
                error_code,
                message,
                state,
            } => ErrorResponse {
                error: error_code,
                message,
                details: state.map(|s| serde_json::json!({ "connection_state": s })),
            },

            Self::FailedDependency {
                error_code,
                message,
                details,
            } => ErrorResponse {
                error: error_code,
                message,
                details: details.map(|d| serde_json::json!(d)),
            },

            Self::InternalError {
                error_code,
                message,
                details,
            } => {
                tracing::error!(
                    error_code = %error_code,
                    message = %message,
                    details = ?details,
                    "Internal server error"
                );
                ErrorResponse {
                    error: error_code,
                    message,
                    details: details.map(|d| serde_json::json!(d)),
                }
            }
        };

        (status, Json(error_response)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::NotFound { message, .. } => write!(f, "Not Found: {message}"),
            Self::Conflict { message, .. } => write!(f, "Conflict: {message}"),
            Self::Unprocessable { message, .. } => write!(f, "Unprocessable: {message}"),
            Self::FailedDependency { message, .. } => {
                write!(f, "Failed Dependency: {message}")
            }
            Self::InternalError { message, .. } => {
                write!(f, "Internal Error: {message}")
            }
            Self::Upstream {
                status, message, ..
            } => write!(f, "Upstream Error ({status}): {message}"),
        }
    }
}

impl std::error::Error for ApiError {}

/// Convert from engine errors, using the status each error declares.
impl From<SipsenseError> for ApiError {
    fn from(err: SipsenseError) -> Self {
        use sipsense_core::ConnectionError;

        let error_code = err.error_code().to_string();
        let message = err.to_string();
        match err.http_status_code() {
            400 => Self::BadRequest {
                error_code,
                message,
            },
            404 => Self::NotFound {
                error_code,
                message,
            },
            409 => Self::Conflict {
                error_code,
                message,
                state: match &err {
                    SipsenseError::Connection(ConnectionError::InvalidState(state)) => {
                        Some(state.to_string())
                    }
                    _ => None,
                },
            },
            422 => Self::Unprocessable {
                error_code,
                message,
            },
            424 => Self::FailedDependency {
                error_code,
                message,
                details: None,
            },
            code @ (502 | 503 | 504) => Self::Upstream {
                status: StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY),
                error_code,
                message,
            },
            _ => Self::InternalError {
                error_code,
                message,
                details: std::error::Error::source(&err).map(ToString::to_string),
            },
        }
    }
}

impl From<sipsense_core::ConnectionError> for ApiError {
    fn from(err: sipsense_core::ConnectionError) -> Self {
        Self::from(SipsenseError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use sipsense_core::{CalibrationError, ConnectionError, ConnectionState};

    use super::*;

    #[test]
    fn bad_request_display() {
        let err = ApiError::BadRequest {
            error_code: "invalid_device_id".to_string(),
            message: "Test message".to_string(),
        };
        assert!(err.to_string().contains("Bad Request"));
    }

    #[test]
    fn engine_errors_keep_their_status() {
        let cases = [
            (SipsenseError::NoActiveDevice, StatusCode::FAILED_DEPENDENCY),
            (
                SipsenseError::Connection(ConnectionError::Timeout),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                SipsenseError::Connection(ConnectionError::NotReady),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SipsenseError::Calibration(CalibrationError::InvalidProfile("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                SipsenseError::AlertNotFound(uuid::Uuid::nil()),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn invalid_state_reports_the_state() {
        let err = ApiError::from(ConnectionError::InvalidState(ConnectionState::Connected));
        let ApiError::Conflict { state, .. } = err else {
            panic!("expected conflict");
        };
        assert_eq!(state.as_deref(), Some("connected"));
    }

    #[test]
    fn error_response_serialization() {
        let response = ErrorResponse {
            error: "NO_ACTIVE_DEVICE".to_string(),
            message: "Test message".to_string(),
            details: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("NO_ACTIVE_DEVICE"));
    }
}
