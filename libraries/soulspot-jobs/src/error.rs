/// Job execution errors
use crate::queue::QueueError;
use soulspot_core::{JobType, SoulSpotError};
use soulspot_metadata::MetadataError;
use soulspot_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using `JobError`
pub type Result<T> = std::result::Result<T, JobError>;

/// Job error types
#[derive(Error, Debug)]
pub enum JobError {
    /// No handler registered for the job's type
    #[error("No handler registered for job type {0}")]
    NoHandler(JobType),

    /// Payload does not match what the handler expects
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Download backend or metadata provider failed
    #[error("Provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the job's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Failed(String),
}

impl JobError {
    /// Whether running the job again could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JobError::InvalidPayload(_)
                | JobError::NoHandler(_)
                | JobError::Cancelled
                | JobError::NotFound(_)
        )
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::InvalidPayload(err.to_string())
    }
}

impl From<SoulSpotError> for JobError {
    fn from(err: SoulSpotError) -> Self {
        match err {
            SoulSpotError::Provider(msg) => JobError::Provider(msg),
            SoulSpotError::Cancelled => JobError::Cancelled,
            SoulSpotError::InvalidInput(msg) => JobError::InvalidPayload(msg),
            SoulSpotError::NotFound { entity, id } => {
                JobError::NotFound(format!("{} {}", entity, id))
            }
            other => JobError::Failed(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for JobError {
    fn from(err: tokio::task::JoinError) -> Self {
        JobError::Failed(format!("Blocking task failed: {}", err))
    }
}
