//! API error types with HTTP status code mapping.
//!
//! [`ApiError`] is the unified error type for all API endpoints. It implements
//! `axum::response::IntoResponse` to produce structured JSON error responses
//! with appropriate HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use labrig_core::{CoreError, LockError};
use labrig_storage::StorageError;

/// Structured error detail in API responses.
#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorDetail {
    /// Machine-readable error code (e.g., "NOT_FOUND", "ALREADY_LOCKED").
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured details (e.g., the current lock holder).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API errors with HTTP status code mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Machine not found (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request (400).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The machine is held by someone else (423).
    #[error("{message}")]
    AlreadyLocked {
        message: String,
        current_owner: String,
    },

    /// Release attempted by a non-holder without force (403).
    #[error("{0}")]
    NotOwner(String),

    /// Registration would break a record invariant (422).
    #[error("invalid machine: {0}")]
    InvalidMachine(String),

    /// Not enough free machines for a lock-N request (503).
    #[error("{message}")]
    InsufficientMachines {
        message: String,
        requested: usize,
        available: usize,
    },

    /// Internal server error (500).
    #[error("internal error: {0}")]
    InternalError(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Option<serde_json::Value>) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", None),
            ApiError::AlreadyLocked { current_owner, .. } => (
                StatusCode::LOCKED,
                "ALREADY_LOCKED",
                Some(serde_json::json!({ "current_owner": current_owner })),
            ),
            ApiError::NotOwner(_) => (StatusCode::FORBIDDEN, "NOT_OWNER", None),
            ApiError::InvalidMachine(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_MACHINE", None)
            }
            ApiError::InsufficientMachines {
                requested,
                available,
                ..
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "INSUFFICIENT_MACHINES",
                Some(serde_json::json!({ "requested": requested, "available": available })),
            ),
            ApiError::InternalError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, details) = self.parts();
        let message = match &self {
            ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::NotOwner(msg)
            | ApiError::InvalidMachine(msg)
            | ApiError::InternalError(msg) => msg.clone(),
            ApiError::AlreadyLocked { message, .. }
            | ApiError::InsufficientMachines { message, .. } => message.clone(),
        };

        if status.is_server_error() {
            tracing::error!(code, "{}", message);
        }

        let body = serde_json::json!({
            "success": false,
            "error": ApiErrorDetail {
                code: code.to_string(),
                message,
                details,
            },
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<LockError> for ApiError {
    fn from(err: LockError) -> Self {
        let message = err.to_string();
        match err {
            LockError::AlreadyLocked { current_owner, .. } => ApiError::AlreadyLocked {
                message,
                current_owner: current_owner.to_string(),
            },
            LockError::NotOwner { .. } => ApiError::NotOwner(message),
            LockError::NotFound(_) => ApiError::NotFound(message),
            LockError::InsufficientMachines {
                requested,
                available,
            } => ApiError::InsufficientMachines {
                message,
                requested,
                available,
            },
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match &err {
            CoreError::InvalidName { .. } | CoreError::InvalidOwner { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            CoreError::InvariantViolation { .. } => ApiError::InvalidMachine(err.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Lock(lock) => lock.into(),
            StorageError::Invalid(core) => core.into(),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}
