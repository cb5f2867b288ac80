//! Error model shared by the queue and its stores.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobStatus;

/// Result type used by job record operations.
pub type DomainResult<T> = Result<T, DomainError>;

/// Result type used by queue store operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Record-level error.
///
/// Deterministic failures only (validation, illegal state changes). Anything
/// about reaching storage belongs to [`QueueError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed enqueue request).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The status state machine does not allow this move.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Queue store error.
///
/// Only `Unavailable` describes connectivity; callers decide whether to retry
/// it. Job-level outcomes (handler errors, timeouts) are never reported here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The backing store cannot be reached. Nothing was dropped or created.
    #[error("queue store unavailable: {0}")]
    Unavailable(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {job_id}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    /// A stored record could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(String),
}

impl QueueError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Lift a record-level error, attaching the job it concerns.
    pub fn from_domain(job_id: JobId, err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => Self::Validation(msg),
            DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::InvalidTransition { from, to } => {
                Self::InvalidTransition { job_id, from, to }
            }
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<DomainError> for QueueError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::InvalidTransition { from, to } => Self::Validation(format!(
                "invalid status transition: {from} -> {to}"
            )),
        }
    }
}
