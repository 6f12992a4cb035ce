//! Job intake and status evaluation.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use vscale_firestore::{AggregationClaim, JobFinalization, JobStore, StoreError};
use vscale_media::{FfmpegReassembler, FfmpegSplitter, ReassemblyTool, SegmentSplitter};
use vscale_models::{
    segment_name, ArtifactRef, DispatchMessage, Job, JobId, JobStatus, JobStatusView,
};
use vscale_queue::{DispatchQueue, QueueError};
use vscale_storage::{ObjectStore, StorageError};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::reassembly::ReassemblyEngine;
use crate::retry::{retry_if, RetryConfig};

/// Entry point for clients: submit a source artifact, poll its job.
///
/// Holds no per-job state; every decision is taken from the job store, so
/// any number of orchestrator instances may serve the same jobs.
pub struct Orchestrator {
    config: OrchestratorConfig,
    storage: Arc<dyn ObjectStore>,
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
    splitter: Arc<dyn SegmentSplitter>,
    reassembly: ReassemblyEngine,
    retry: RetryConfig,
    instance_id: String,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        storage: Arc<dyn ObjectStore>,
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
        splitter: Arc<dyn SegmentSplitter>,
        tool: Arc<dyn ReassemblyTool>,
    ) -> Self {
        let retry = RetryConfig::new("orchestrator").with_max_retries(config.max_retries);
        let reassembly = ReassemblyEngine::new(storage.clone(), tool, config.work_dir.clone())
            .with_retry(retry.clone());

        Self {
            config,
            storage,
            jobs,
            queue,
            splitter,
            reassembly,
            retry,
            instance_id: format!("orchestrator-{}", Uuid::new_v4()),
        }
    }

    /// Orchestrator backed by the ffmpeg splitter and reassembler.
    pub fn with_ffmpeg(
        config: OrchestratorConfig,
        storage: Arc<dyn ObjectStore>,
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
    ) -> Self {
        let splitter = FfmpegSplitter::new(config.chunk_size).with_timeout(config.media_timeout);
        let tool = FfmpegReassembler::new().with_timeout(config.media_timeout);
        Self::new(config, storage, jobs, queue, Arc::new(splitter), Arc::new(tool))
    }

    /// Override the backoff used for storage, store and queue calls.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.reassembly = self.reassembly.with_retry(retry.clone());
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Split `source` into segments, persist the job and dispatch one
    /// message per segment.
    ///
    /// The job is stored before any message is published, so a worker never
    /// sees a dispatch for a job that does not exist yet. Returns without
    /// waiting for any segment.
    #[instrument(skip_all, fields(source = %source, job_id = tracing::field::Empty))]
    pub async fn submit(&self, source: &str) -> OrchestratorResult<JobId> {
        let source = ArtifactRef::parse(source)?;
        let job_id = JobId::new();
        tracing::Span::current().record("job_id", job_id.as_str());

        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("split-{}-", job_id))
            .tempdir_in(&self.config.work_dir)?;

        let local_source = scratch.path().join("source.mp4");
        let downloaded = retry_if(
            &self.retry.named("download_source"),
            StorageError::is_retryable,
            || self.storage.download_file(source.as_str(), &local_source),
        )
        .await
        .into_result();
        match downloaded {
            Ok(()) => {}
            Err(StorageError::NotFound(key)) => {
                return Err(OrchestratorError::invalid_input(format!(
                    "source artifact not found: {}",
                    key
                )))
            }
            Err(e) => return Err(e.into()),
        }

        let pieces = self
            .splitter
            .split(&local_source, &scratch.path().join("segments"), &job_id)
            .await?;
        tokio::fs::remove_file(&local_source).await?;

        let mut names = Vec::with_capacity(pieces.len());
        for (index, path) in pieces.iter().enumerate() {
            let name = segment_name(&job_id, index);
            retry_if(
                &self.retry.named("upload_segment"),
                StorageError::is_retryable,
                || self.storage.upload_file(path, &name),
            )
            .await
            .into_result()?;
            tokio::fs::remove_file(path).await?;
            names.push(name);
        }
        drop(scratch);

        let job = Job::new(job_id.clone(), source, names);
        retry_if(
            &self.retry.named("create_job"),
            StoreError::is_retryable,
            || self.jobs.create_job(&job),
        )
        .await
        .into_result()?;

        for segment in &job.segments {
            let message = DispatchMessage::new(job_id.clone(), segment.name.clone());
            retry_if(
                &self.retry.named("publish_dispatch"),
                QueueError::is_retryable,
                || self.queue.publish(&message),
            )
            .await
            .into_result()?;
        }

        counter!("vscale_jobs_submitted_total").increment(1);
        counter!("vscale_segments_dispatched_total").increment(job.segments.len() as u64);
        info!(
            job_id = %job_id,
            source = %job.source,
            segments = job.segments.len(),
            "Job submitted"
        );
        Ok(job_id)
    }

    /// Current status of a job.
    ///
    /// Unknown and expired ids report NONE. While any segment is
    /// unprocessed this is a single read. The first caller to see every
    /// segment complete takes the aggregation lease and reassembles; other
    /// callers keep seeing IN_PROGRESS until it finishes. A failed
    /// aggregation is logged and reported as IN_PROGRESS so the next query
    /// retries it.
    ///
    /// Errors only when the job store stays unreachable.
    #[instrument(skip_all, fields(job_id = %id))]
    pub async fn query(&self, id: &JobId) -> OrchestratorResult<JobStatusView> {
        let Some(job) = self.load(id).await? else {
            return Ok(JobStatusView::none(id));
        };

        match job.status {
            JobStatus::Complete => return Ok(job.status_view()),
            JobStatus::None => return Ok(JobStatusView::none(id)),
            JobStatus::InProgress => {}
        }

        if !job.all_segments_complete() {
            debug!(
                completed = job.completed_segments(),
                total = job.segments.len(),
                "Job still in progress"
            );
            return Ok(JobStatusView::in_progress(id));
        }

        self.aggregate(job).await
    }

    async fn load(&self, id: &JobId) -> OrchestratorResult<Option<Job>> {
        Ok(retry_if(
            &self.retry.named("get_job"),
            StoreError::is_retryable,
            || self.jobs.get_job(id),
        )
        .await
        .into_result()?)
    }

    /// Guarded transition to COMPLETE.
    async fn aggregate(&self, job: Job) -> OrchestratorResult<JobStatusView> {
        // Unique per attempt: two queries in this process must not share a lease.
        let owner = format!("{}:{}", self.instance_id, Uuid::new_v4());

        let claim = retry_if(
            &self.retry.named("claim_aggregation"),
            StoreError::is_retryable,
            || {
                self.jobs
                    .claim_aggregation(&job.id, &owner, self.config.aggregation_lease)
            },
        )
        .await
        .into_result()?;

        match claim {
            AggregationClaim::Acquired { expires_at } => {
                debug!(%owner, %expires_at, "Aggregation lease acquired");
            }
            AggregationClaim::HeldByOther { owner: holder } => {
                debug!(%holder, "Aggregation already running elsewhere");
                return Ok(JobStatusView::in_progress(&job.id));
            }
            AggregationClaim::AlreadyComplete => return self.reread(&job.id).await,
            AggregationClaim::UnknownJob => return Ok(JobStatusView::none(&job.id)),
        }

        counter!("vscale_aggregations_total", "outcome" => "started").increment(1);
        match self.finish(&job, &owner).await {
            Ok(view) => Ok(view),
            Err(OrchestratorError::Store(StoreError::LeaseLost(_))) => {
                warn!(job_id = %job.id, "Aggregation lease lost, abandoning reassembly");
                counter!("vscale_aggregations_total", "outcome" => "lease_lost").increment(1);
                self.reread(&job.id).await
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Aggregation failed, job stays in progress");
                counter!("vscale_aggregations_total", "outcome" => "failed").increment(1);
                if let Err(release) = self.jobs.release_aggregation(&job.id, &owner).await {
                    warn!(
                        job_id = %job.id,
                        error = %release,
                        "Could not release aggregation lease, it will expire"
                    );
                }
                Ok(JobStatusView::in_progress(&job.id))
            }
        }
    }

    /// Reassemble, finalize, then clean up. Runs only under the lease.
    async fn finish(&self, job: &Job, owner: &str) -> OrchestratorResult<JobStatusView> {
        let result_artifact = tokio::select! {
            result = self.reassembly.reassemble(job) => result?,
            lost = self.hold_lease(&job.id, owner) => return Err(lost),
        };

        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.config.job_retention)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let finalization = JobFinalization {
            result_artifact: result_artifact.clone(),
            time_end: job.latest_segment_end().unwrap_or(now),
            expires_at: now + retention,
        };

        retry_if(
            &self.retry.named("finalize_job"),
            StoreError::is_retryable,
            || self.jobs.finalize_job(&job.id, owner, &finalization),
        )
        .await
        .into_result()?;

        counter!("vscale_aggregations_total", "outcome" => "completed").increment(1);
        info!(
            job_id = %job.id,
            result = %result_artifact,
            segments = job.segments.len(),
            "Job complete"
        );

        self.cleanup(job).await;

        Ok(JobStatusView {
            id: job.id.to_string(),
            status: JobStatus::Complete,
            result_artifact,
        })
    }

    /// Renew the aggregation lease; resolves only once it can no longer be
    /// kept. Transient renewal failures are retried while the last
    /// successful renewal still covers the next attempt.
    async fn hold_lease(&self, id: &JobId, owner: &str) -> OrchestratorError {
        let lease = self.config.aggregation_lease;
        let period = self.config.lease_renewal_interval();
        let mut held_until = tokio::time::Instant::now() + lease;
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let sent = tokio::time::Instant::now();
            match self.jobs.renew_aggregation(id, owner, lease).await {
                Ok(expires_at) => {
                    held_until = sent + lease;
                    debug!(%owner, %expires_at, "Renewed aggregation lease");
                }
                Err(e) if e.is_retryable() && sent + period < held_until => {
                    warn!(job_id = %id, error = %e, "Failed to renew aggregation lease, retrying");
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Aggregation lease could not be kept");
                    return OrchestratorError::Store(StoreError::LeaseLost(id.to_string()));
                }
            }
        }
    }

    /// Delete the source and every segment artifact of a finalized job.
    ///
    /// The job is already COMPLETE, so failures are logged and left for the
    /// bucket lifecycle policy instead of failing the query.
    async fn cleanup(&self, job: &Job) {
        let mut keys = vec![job.source.as_str().to_string()];
        for segment in &job.segments {
            keys.push(segment.name.clone());
            if let Some(result) = &segment.result_name {
                keys.push(result.clone());
            }
        }

        let mut failed = 0usize;
        for key in &keys {
            let deleted = retry_if(
                &self.retry.named("delete_artifact"),
                StorageError::is_retryable,
                || self.storage.delete(key),
            )
            .await
            .into_result();
            if let Err(e) = deleted {
                failed += 1;
                warn!(job_id = %job.id, key = %key, error = %e, "Failed to delete artifact");
            }
        }

        counter!("vscale_artifacts_deleted_total").increment((keys.len() - failed) as u64);
        debug!(job_id = %job.id, deleted = keys.len() - failed, failed, "Cleaned up artifacts");
    }

    async fn reread(&self, id: &JobId) -> OrchestratorResult<JobStatusView> {
        Ok(match self.load(id).await? {
            Some(job) if job.status == JobStatus::Complete => job.status_view(),
            Some(_) => JobStatusView::in_progress(id),
            None => JobStatusView::none(id),
        })
    }
}
