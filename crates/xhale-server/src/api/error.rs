//! API error types and response handling.
//!
//! Every handler returns [`ApiResult`]; core errors convert into the variant
//! matching their HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use xhale_core::{ManagerError, StoreError, XhaleError};

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
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

    /// 409 Conflict - The session is in the wrong state for the request.
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Connection state at the time of the request.
        state: Option<String>,
    },

    /// 422 Unprocessable Entity - Configuration is unusable.
    Unprocessable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 424 Failed Dependency - The sensor or the document store failed.
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

    /// 503 Service Unavailable - Bluetooth or the session manager is down.
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "not_connected",
    "message": "No sensor is connected",
    "details": null
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "device_not_found").
    #[schema(example = "not_connected")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "No sensor is connected")]
    pub message: String,

    /// Optional additional details for debugging.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Shorthand for a 400 response.
    pub fn bad_request(error_code: &str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            error_code: error_code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match self {
            Self::BadRequest { error_code, message } => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: None,
                },
            ),

            Self::NotFound { error_code, message } => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: None,
                },
            ),

            Self::Conflict {
                error_code,
                message,
                state,
            } => (
                StatusCode::CONFLICT,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: state.map(|state| serde_json::json!({ "state": state })),
                },
            ),

            Self::Unprocessable { error_code, message } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: None,
                },
            ),

            Self::FailedDependency {
                error_code,
                message,
                details,
            } => (
                StatusCode::FAILED_DEPENDENCY,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: details.map(serde_json::Value::from),
                },
            ),

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

                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: error_code,
                        message,
                        details: details.map(serde_json::Value::from),
                    },
                )
            }

            Self::ServiceUnavailable { error_code, message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: None,
                },
            ),
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
            Self::InternalError { message, .. } => write!(f, "Internal Error: {message}"),
            Self::ServiceUnavailable { message, .. } => {
                write!(f, "Service Unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl From<XhaleError> for ApiError {
    fn from(err: XhaleError) -> Self {
        let error_code = err.error_code().to_string();
        let message = err.to_string();
        match err.http_status_code() {
            400 => Self::BadRequest { error_code, message },
            404 => Self::NotFound { error_code, message },
            409 => {
                let state = match &err {
                    XhaleError::SessionBusy(state) => Some(state.clone()),
                    _ => None,
                };
                Self::Conflict {
                    error_code,
                    message,
                    state,
                }
            }
            422 => Self::Unprocessable { error_code, message },
            424 => Self::FailedDependency {
                error_code,
                message,
                details: None,
            },
            503 => Self::ServiceUnavailable { error_code, message },
            _ => Self::InternalError {
                error_code,
                message,
                details: None,
            },
        }
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        Self::from(XhaleError::from(err))
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::from(XhaleError::from(err))
    }
}
