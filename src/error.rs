use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::dlq::DlqError;
use crate::idempotency::IdempotencyError;
use crate::retry::RetryError;
use crate::store::StoreError;
use crate::types::{ApiErrorCode, ApiErrorResponse};
use crate::verifier::VerificationError;

/// Failure taxonomy of one pass through the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("verification failed: {0}")]
    Verification(#[from] VerificationError),
    #[error("duplicate event {event_id}: {reason}")]
    DuplicateEvent { event_id: String, reason: String },
    #[error("processing timed out after {timeout_ms} ms")]
    ProcessingTimeout { timeout_ms: u64 },
    #[error("{0}")]
    Processing(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("event {event_id} exceeded {attempts} attempts")]
    MaxAttemptsExceeded { event_id: String, attempts: u32 },
    #[error("{0} not found")]
    NotFound(String),
}

impl PipelineError {
    /// Whether another attempt could succeed. Verification failures and
    /// duplicates never will.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::ProcessingTimeout { .. }
                | PipelineError::Processing(_)
                | PipelineError::StoreUnavailable(_)
        )
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::StoreUnavailable(err.to_string())
    }
}

impl From<DlqError> for PipelineError {
    fn from(err: DlqError) -> Self {
        match err {
            DlqError::NotFound(id) => PipelineError::NotFound(format!("dead letter {id}")),
            other => PipelineError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<RetryError> for PipelineError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::NotFound(id) => PipelineError::NotFound(format!("retry entry {id}")),
            other => PipelineError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<IdempotencyError> for PipelineError {
    fn from(err: IdempotencyError) -> Self {
        match err {
            IdempotencyError::DuplicateEvent { event_id, reason } => {
                PipelineError::DuplicateEvent { event_id, reason }
            }
            IdempotencyError::ProcessingInProgress { event_id, .. } => {
                PipelineError::DuplicateEvent {
                    event_id,
                    reason: "event is currently being processed".to_string(),
                }
            }
            IdempotencyError::MaxAttemptsExceeded { event_id, attempts } => {
                PipelineError::MaxAttemptsExceeded { event_id, attempts }
            }
            IdempotencyError::RecordNotFound(event_id) => {
                PipelineError::NotFound(format!("idempotency record {event_id}"))
            }
            other => PipelineError::StoreUnavailable(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    Unauthorized(String),
    VerificationFailed(String),
    NotFound(String),
    Conflict(String),
    StoreUnavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Verification(inner) => Self::VerificationFailed(inner.to_string()),
            PipelineError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            err @ PipelineError::DuplicateEvent { .. } => Self::Conflict(err.to_string()),
            err @ PipelineError::MaxAttemptsExceeded { .. } => Self::Conflict(err.to_string()),
            PipelineError::StoreUnavailable(message) => Self::StoreUnavailable(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<DlqError> for ApiError {
    fn from(err: DlqError) -> Self {
        PipelineError::from(err).into()
    }
}

impl From<RetryError> for ApiError {
    fn from(err: RetryError) -> Self {
        PipelineError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Validation(message) => {
                (StatusCode::BAD_REQUEST, ApiErrorCode::Validation, message)
            }
            ApiError::Unauthorized(message) => {
                (StatusCode::UNAUTHORIZED, ApiErrorCode::Unauthorized, message)
            }
            ApiError::VerificationFailed(message) => (
                StatusCode::UNAUTHORIZED,
                ApiErrorCode::VerificationFailed,
                message,
            ),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, ApiErrorCode::NotFound, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, ApiErrorCode::Conflict, message),
            ApiError::StoreUnavailable(message) => {
                tracing::error!(error = %message, "store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ApiErrorCode::StoreUnavailable,
                    "store unavailable".to_string(),
                )
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiErrorCode::Internal,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(ApiErrorResponse { code, message })).into_response()
    }
}
