//! Error handling module for the fleet sync engine.
//!
//! One error type for the whole engine, mapped onto HTTP statuses and the
//! failure envelope of the local API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::models::InviteError;

/// Machine-readable codes carried in the failure envelope.
pub mod codes {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const CONFLICT: &str = "CONFLICT";
    pub const SYNC_FAILURE: &str = "SYNC_FAILURE";
    pub const SCOPE_NOT_SET: &str = "SCOPE_NOT_SET";
    pub const SCOPE_CHANGED: &str = "SCOPE_CHANGED";
    pub const AUDIT_MISSING: &str = "AUDIT_MISSING";
    pub const CODE_NOT_FOUND: &str = "CODE_NOT_FOUND";
    pub const CODE_ALREADY_USED: &str = "CODE_ALREADY_USED";
    pub const CODE_EXPIRED: &str = "CODE_EXPIRED";
    pub const CODE_MALFORMED_LENGTH: &str = "CODE_MALFORMED_LENGTH";
    pub const CODE_INVALID_CHARACTER: &str = "CODE_INVALID_CHARACTER";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
}

/// Application error type.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Authentication required or session role mismatch
    Unauthorized(String),
    /// Resource not found
    NotFound(String),
    /// Malformed input rejected before touching the network
    Validation(String),
    /// Identity conflict (e.g. attempt to rewrite an established cloud id)
    Conflict(String),
    /// Invite code rejected for a specific reason
    Invite(InviteError),
    /// Network, auth or quota failure talking to the cloud store (retryable)
    Sync(String),
    /// A cloud call was attempted with no tenant scope established
    ScopeNotSet(String),
    /// The tenant scope changed while an operation for another tenant was in flight
    ScopeChanged(String),
    /// Override-type mutation committed without its audit entry
    AuditMissing(String),
    /// Database error
    Database(String),
    /// Internal error
    Internal(String),
    /// Bad request
    BadRequest(String),
}

impl AppError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Invite(reason) => match reason {
                InviteError::NotFound => StatusCode::NOT_FOUND,
                InviteError::AlreadyUsed => StatusCode::CONFLICT,
                InviteError::Expired => StatusCode::GONE,
                InviteError::MalformedLength | InviteError::InvalidCharacter => {
                    StatusCode::BAD_REQUEST
                }
            },
            AppError::Sync(_) => StatusCode::BAD_GATEWAY,
            AppError::ScopeNotSet(_) => StatusCode::PRECONDITION_FAILED,
            AppError::ScopeChanged(_) => StatusCode::CONFLICT,
            AppError::AuditMissing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => codes::UNAUTHORIZED,
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::Validation(_) => codes::VALIDATION_ERROR,
            AppError::Conflict(_) => codes::CONFLICT,
            AppError::Invite(reason) => match reason {
                InviteError::NotFound => codes::CODE_NOT_FOUND,
                InviteError::AlreadyUsed => codes::CODE_ALREADY_USED,
                InviteError::Expired => codes::CODE_EXPIRED,
                InviteError::MalformedLength => codes::CODE_MALFORMED_LENGTH,
                InviteError::InvalidCharacter => codes::CODE_INVALID_CHARACTER,
            },
            AppError::Sync(_) => codes::SYNC_FAILURE,
            AppError::ScopeNotSet(_) => codes::SCOPE_NOT_SET,
            AppError::ScopeChanged(_) => codes::SCOPE_CHANGED,
            AppError::AuditMissing(_) => codes::AUDIT_MISSING,
            AppError::Database(_) => codes::DATABASE_ERROR,
            AppError::Internal(_) => codes::INTERNAL_ERROR,
            AppError::BadRequest(_) => codes::BAD_REQUEST,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            AppError::Invite(reason) => reason.to_string(),
            AppError::Unauthorized(msg)
            | AppError::NotFound(msg)
            | AppError::Validation(msg)
            | AppError::Conflict(msg)
            | AppError::Sync(msg)
            | AppError::ScopeNotSet(msg)
            | AppError::ScopeChanged(msg)
            | AppError::AuditMissing(msg)
            | AppError::Database(msg)
            | AppError::Internal(msg)
            | AppError::BadRequest(msg) => msg.clone(),
        }
    }

    /// Whether the sync retry policy may try this operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Sync(_))
    }

    /// Whether the error means the pass must stop touching the cloud for this tenant.
    pub fn is_scope_violation(&self) -> bool {
        matches!(self, AppError::ScopeNotSet(_) | AppError::ScopeChanged(_))
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<InviteError> for AppError {
    fn from(reason: InviteError) -> Self {
        AppError::Invite(reason)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        AppError::Database(format!("Database error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON error: {:?}", err);
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        tracing::warn!("Cloud request error: {:?}", err);
        AppError::Sync(format!("Cloud request failed: {}", err))
    }
}

/// Error details in the response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Error response envelope.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetails,
    pub revision_id: i64,
}

impl ErrorResponse {
    pub fn new(error: &AppError, revision_id: i64) -> Self {
        let details = match error {
            AppError::Invite(reason) => Some(serde_json::json!({ "reason": reason.as_str() })),
            _ => None,
        };

        Self {
            success: false,
            error: ErrorDetails {
                code: error.error_code().to_string(),
                message: error.message(),
                details,
            },
            revision_id,
        }
    }
}

/// An error paired with the store revision it was observed at.
pub struct AppErrorWithRevision {
    pub error: AppError,
    pub revision_id: i64,
}

impl IntoResponse for AppErrorWithRevision {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        let body = ErrorResponse::new(&self.error, self.revision_id);
        (status, Json(body)).into_response()
    }
}
