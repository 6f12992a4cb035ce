//! Job store abstraction.
//!
//! The store is the shared source of truth for job and segment state. Every
//! mutation is narrow and conditional so that concurrent writers (workers
//! completing different segments, orchestrators racing to aggregate) never
//! overwrite each other.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use vscale_models::{Job, JobId, SegmentCompletion};

use crate::error::FirestoreError;

/// Result type for job store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by a job store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error("Concurrent update on {0}")]
    Conflict(String),

    #[error("Aggregation lease for job {0} is not held by this caller")]
    LeaseLost(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Job store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Whether repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }
}

impl From<FirestoreError> for StoreError {
    fn from(e: FirestoreError) -> Self {
        match e {
            FirestoreError::AlreadyExists(m) => StoreError::AlreadyExists(m),
            FirestoreError::PreconditionFailed(m) => StoreError::Conflict(m),
            FirestoreError::InvalidDocument(m) => StoreError::Corrupt(m),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Outcome of marking one segment complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentUpdate {
    /// The segment went from UNPROCESSED to COMPLETE.
    Applied,
    /// The segment was already COMPLETE; nothing was written.
    AlreadyComplete,
    /// No (live) job with this id.
    UnknownJob,
    /// The job exists but has no segment with this name.
    UnknownSegment,
}

/// Outcome of trying to become the single aggregator of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationClaim {
    /// The caller holds the lease until the returned instant.
    Acquired { expires_at: DateTime<Utc> },
    /// Another owner holds an unexpired lease.
    HeldByOther { owner: String },
    /// The job is already COMPLETE.
    AlreadyComplete,
    /// No (live) job with this id.
    UnknownJob,
}

/// Terminal fields written when a job completes.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFinalization {
    pub result_artifact: String,
    pub time_end: DateTime<Utc>,
    /// Retention deadline for the job and its segment records
    pub expires_at: DateTime<Utc>,
}

/// Durable, concurrency-safe record of jobs and their segments.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job with all of its segments.
    ///
    /// The job becomes visible to `get_job` only once every segment is
    /// stored.
    async fn create_job(&self, job: &Job) -> StoreResult<()>;

    /// Point read by id. Missing and expired records both read as `None`.
    async fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>>;

    /// Mark one segment COMPLETE, only if it is currently UNPROCESSED.
    ///
    /// Never touches other segments or job-level fields.
    async fn complete_segment(
        &self,
        id: &JobId,
        segment_name: &str,
        completion: &SegmentCompletion,
    ) -> StoreResult<SegmentUpdate>;

    /// Try to take the aggregation lease of an IN_PROGRESS job.
    ///
    /// Succeeds when no lease is held, the held lease has expired, or the
    /// caller already owns it.
    async fn claim_aggregation(
        &self,
        id: &JobId,
        owner: &str,
        lease: Duration,
    ) -> StoreResult<AggregationClaim>;

    /// Push the expiry of a lease still held by `owner` to `lease` from now.
    ///
    /// Fails with `LeaseLost` once the job is complete or another owner has
    /// taken the lease over.
    async fn renew_aggregation(
        &self,
        id: &JobId,
        owner: &str,
        lease: Duration,
    ) -> StoreResult<DateTime<Utc>>;

    /// Give up a lease held by `owner`. A lease held by someone else is left alone.
    async fn release_aggregation(&self, id: &JobId, owner: &str) -> StoreResult<()>;

    /// Move the job to COMPLETE, only while `owner` still holds the lease.
    ///
    /// Fails with `LeaseLost` otherwise. Clears the lease and stamps the
    /// retention deadline on the job and its segments.
    async fn finalize_job(
        &self,
        id: &JobId,
        owner: &str,
        finalization: &JobFinalization,
    ) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firestore_error_mapping() {
        assert!(matches!(
            StoreError::from(FirestoreError::PreconditionFailed("x".into())),
            StoreError::Conflict(_)
        ));
        assert!(StoreError::from(FirestoreError::RateLimited(5)).is_retryable());
        assert!(!StoreError::from(FirestoreError::invalid_document("x")).is_retryable());
        assert!(!StoreError::LeaseLost("j".into()).is_retryable());
    }
}
