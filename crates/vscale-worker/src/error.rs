//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The frame transform failed; the message is redelivered.
    #[error("Transform failed: {0}")]
    Transform(#[source] vscale_media::MediaError),

    #[error("Transform timed out after {0} seconds")]
    TransformTimeout(u64),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] vscale_storage::StorageError),

    #[error("Job store error: {0}")]
    Store(#[from] vscale_firestore::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] vscale_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Check if redelivering the message may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Transform(_) | WorkerError::TransformTimeout(_) | WorkerError::Io(_) => {
                true
            }
            WorkerError::Storage(e) => e.is_retryable(),
            WorkerError::Store(e) => e.is_retryable(),
            WorkerError::Queue(e) => e.is_retryable(),
            WorkerError::ConfigError(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Transform(_) => "transform",
            WorkerError::TransformTimeout(_) => "timeout",
            WorkerError::ConfigError(_) => "config",
            WorkerError::Storage(_) => "storage",
            WorkerError::Store(_) => "store",
            WorkerError::Queue(_) => "queue",
            WorkerError::Io(_) => "io",
        }
    }
}
