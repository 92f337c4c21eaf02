use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::services::StoreError;

/// Why a state-changing request conflicts with the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Resume requested but no emergency stop is active
    NoActiveStop,
    /// Stop requires a human and the requester is an automated actor
    ManualResumeRequired,
    /// Compare-and-set kept losing to concurrent writers
    ConcurrentModification,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoActiveStop => write!(f, "no active emergency stop"),
            Self::ManualResumeRequired => write!(f, "manual resume required"),
            Self::ConcurrentModification => write!(f, "concurrent modification"),
        }
    }
}

/// Errors raised by the safety engine components
#[derive(Debug, Error)]
pub enum SafetyError {
    /// Malformed input, rejected before anything is written
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("State conflict for user '{user_id}': {reason}")]
    StateConflict {
        user_id: String,
        reason: ConflictReason,
    },

    #[error(
        "Safety check failed: recent failure rate {:.0}% exceeds {:.0}%",
        .failure_rate * 100.0,
        .threshold * 100.0
    )]
    SafetyCheckFailure { failure_rate: f64, threshold: f64 },

    #[error("Corrupted record at {key}: {reason}")]
    CorruptedRecord { key: String, reason: String },
}

impl SafetyError {
    pub fn conflict(user_id: &str, reason: ConflictReason) -> Self {
        Self::StateConflict {
            user_id: user_id.to_string(),
            reason,
        }
    }
}

/// Application-level error type
#[derive(Debug)]
pub enum AppError {
    /// Validation error
    Validation(String),
    /// Not found error
    NotFound(String),
    /// Conflict with current state (e.g., resume without an active stop)
    Conflict(String),
    /// Resume refused by the failure-rate safety check
    SafetyCheckFailed(String),
    /// Backing store unreachable or timed out
    StoreUnavailable(String),
    /// Internal server error
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
    meta: ErrorMeta,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ErrorMeta {
    request_id: String,
}

impl AppError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "STATE_CONFLICT",
            Self::SafetyCheckFailed(_) => "SAFETY_CHECK_FAILED",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "Validation error: {msg}"),
            Self::NotFound(msg) => write!(f, "Not found: {msg}"),
            Self::Conflict(msg) => write!(f, "Conflict: {msg}"),
            Self::SafetyCheckFailed(msg) => write!(f, "{msg}"),
            Self::StoreUnavailable(msg) => write!(f, "Store unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let error_response = ErrorResponse {
            error: ErrorBody {
                code: self.error_code().to_string(),
                message: self.to_string(),
                details: None,
            },
            meta: ErrorMeta {
                request_id: uuid::Uuid::new_v4().to_string(),
            },
        };

        match self {
            Self::Internal(_) => HttpResponse::InternalServerError().json(error_response),
            Self::Validation(_) => HttpResponse::BadRequest().json(error_response),
            Self::NotFound(_) => HttpResponse::NotFound().json(error_response),
            Self::Conflict(_) => HttpResponse::Conflict().json(error_response),
            Self::SafetyCheckFailed(_) => {
                HttpResponse::UnprocessableEntity().json(error_response)
            }
            Self::StoreUnavailable(_) => {
                HttpResponse::ServiceUnavailable().json(error_response)
            }
        }
    }
}

impl From<SafetyError> for AppError {
    fn from(err: SafetyError) -> Self {
        match err {
            SafetyError::Validation(msg) => Self::Validation(msg),
            SafetyError::StoreUnavailable(e) => Self::StoreUnavailable(e.to_string()),
            e @ SafetyError::StateConflict { .. } => Self::Conflict(e.to_string()),
            e @ SafetyError::SafetyCheckFailure { .. } => Self::SafetyCheckFailed(e.to_string()),
            e @ SafetyError::CorruptedRecord { .. } => Self::Internal(e.to_string()),
        }
    }
}
