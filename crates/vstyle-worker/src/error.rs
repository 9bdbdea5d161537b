//! Worker and service error types.

use std::time::Duration;

use thiserror::Error;
use vstyle_models::{JobId, JobStatus, QueueName};
use vstyle_queue::QueueError;

pub type WorkResult<T> = Result<T, WorkError>;

/// Failure raised by a work function, or by the runner around it.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Work failed: {0}")]
    Failed(String),

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Work function panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkError::Transient(_) | WorkError::TimedOut(_) | WorkError::Io(_)
        )
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors returned synchronously to queue service callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Unknown queue: {0}")]
    UnknownQueue(QueueName),

    #[error("No work function registered for {queue}/{kind}")]
    UnknownKind { queue: QueueName, kind: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {id} is already {status}")]
    AlreadyTerminal { id: JobId, status: JobStatus },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl ServiceError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }
}
