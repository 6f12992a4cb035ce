//! Orchestrator error types.

use thiserror::Error;
use vscale_firestore::StoreError;
use vscale_media::MediaError;
use vscale_models::ModelError;
use vscale_queue::QueueError;
use vscale_storage::StorageError;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The artifact reference was rejected; never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Object store, job store or queue unavailable after retries.
    #[error("Transient storage failure: {0}")]
    TransientStorage(String),

    /// Reassembly could not produce the final artifact. The job stays IN_PROGRESS.
    #[error("Aggregation failed: {0}")]
    AggregationFailed(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Job store error: {0}")]
    Store(StoreError),

    #[error("Queue error: {0}")]
    Queue(QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn aggregation_failed(msg: impl Into<String>) -> Self {
        Self::AggregationFailed(msg.into())
    }

    /// Check if the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TransientStorage(_) | OrchestratorError::AggregationFailed(_)
        )
    }
}

impl From<ModelError> for OrchestratorError {
    fn from(e: ModelError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

impl From<StorageError> for OrchestratorError {
    fn from(e: StorageError) -> Self {
        if e.is_retryable() {
            Self::TransientStorage(e.to_string())
        } else {
            Self::Storage(e)
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        if e.is_retryable() {
            Self::TransientStorage(e.to_string())
        } else {
            Self::Store(e)
        }
    }
}

impl From<QueueError> for OrchestratorError {
    fn from(e: QueueError) -> Self {
        if e.is_retryable() {
            Self::TransientStorage(e.to_string())
        } else {
            Self::Queue(e)
        }
    }
}
