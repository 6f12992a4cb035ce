//! Processing of one dispatch message.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use tracing::Instrument;
use vscale_firestore::{JobStore, SegmentUpdate};
use vscale_media::{CommandTransform, FfmpegUpscaler, FrameTransform};
use vscale_models::{processed_segment_name, DispatchMessage, SegmentCompletion};
use vscale_storage::ObjectStore;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;

/// Why a message was discarded without processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonReason {
    /// The job was never created or has already been cleaned up.
    UnknownJob,
    /// The job exists but has no segment with this name.
    UnknownSegment,
}

impl PoisonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoisonReason::UnknownJob => "unknown_job",
            PoisonReason::UnknownSegment => "unknown_segment",
        }
    }
}

/// Result of handling one message. Every outcome means "ack it".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// This worker processed the segment and marked it complete.
    Completed,
    /// The segment was already complete; nothing was written.
    AlreadyComplete,
    /// The message can never succeed.
    Poison(PoisonReason),
}

/// Processes one segment per dispatch message.
///
/// Errors leave the segment untouched and mean the message must not be
/// acked, so the queue hands it out again.
pub struct ChunkWorker {
    storage: Arc<dyn ObjectStore>,
    jobs: Arc<dyn JobStore>,
    transform: Arc<dyn FrameTransform>,
    work_dir: PathBuf,
    transform_timeout: Duration,
}

impl ChunkWorker {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        jobs: Arc<dyn JobStore>,
        transform: Arc<dyn FrameTransform>,
        work_dir: impl Into<PathBuf>,
        transform_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            jobs,
            transform,
            work_dir: work_dir.into(),
            transform_timeout,
        }
    }

    /// Worker using the transform selected by `config`: the external
    /// command template when set, the ffmpeg upscaler otherwise.
    pub fn from_config(
        config: &WorkerConfig,
        storage: Arc<dyn ObjectStore>,
        jobs: Arc<dyn JobStore>,
    ) -> WorkerResult<Self> {
        let transform: Arc<dyn FrameTransform> = match &config.transform_command {
            Some(template) => Arc::new(
                CommandTransform::from_template(template)
                    .map_err(|e| WorkerError::config_error(e.to_string()))?,
            ),
            None => Arc::new(
                FfmpegUpscaler::new(config.upscale_factor).with_codec(config.upscale_codec.clone()),
            ),
        };

        Ok(Self::new(
            storage,
            jobs,
            transform,
            config.work_dir.clone(),
            config.transform_timeout,
        ))
    }

    pub fn transform_name(&self) -> &str {
        self.transform.name()
    }

    /// Handle one delivery.
    pub async fn handle(
        &self,
        message_id: &str,
        message: &DispatchMessage,
    ) -> WorkerResult<WorkerOutcome> {
        let logger = JobLogger::new(message_id, message);
        let span = logger.create_span();
        self.process(&logger, message).instrument(span).await
    }

    async fn process(
        &self,
        logger: &JobLogger,
        message: &DispatchMessage,
    ) -> WorkerResult<WorkerOutcome> {
        let Some(job) = self.jobs.get_job(&message.job_id).await? else {
            return Ok(self.poison(logger, PoisonReason::UnknownJob));
        };
        let Some(segment) = job.segment(&message.segment_name) else {
            return Ok(self.poison(logger, PoisonReason::UnknownSegment));
        };
        if segment.is_complete() {
            logger.log_progress("already complete, skipping");
            counter!("vscale_segments_total", "outcome" => "already_complete").increment(1);
            return Ok(WorkerOutcome::AlreadyComplete);
        }

        let time_start = Utc::now();
        let started = Instant::now();
        logger.log_start(&format!("{} via {}", segment.name, self.transform.name()));

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("segment-{}-", segment.index))
            .tempdir_in(&self.work_dir)?;
        let input = scratch.path().join("input.mp4");
        let output = scratch.path().join("output.mp4");

        self.storage.download_file(&segment.name, &input).await?;

        match tokio::time::timeout(self.transform_timeout, self.transform.apply(&input, &output))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                logger.log_error(&format!("transform failed: {}", e));
                return Err(WorkerError::Transform(e));
            }
            Err(_) => {
                logger.log_error("transform timed out");
                return Err(WorkerError::TransformTimeout(
                    self.transform_timeout.as_secs(),
                ));
            }
        }
        histogram!("vscale_transform_seconds").record(started.elapsed().as_secs_f64());

        let result_name = processed_segment_name(&segment.name);
        self.storage.upload_file(&output, &result_name).await?;
        drop(scratch);

        let completion = SegmentCompletion {
            result_name,
            time_start,
            time_end: Utc::now(),
        };
        let update = self
            .jobs
            .complete_segment(&message.job_id, &message.segment_name, &completion)
            .await?;

        let outcome = match update {
            SegmentUpdate::Applied => {
                logger.log_completion(&format!(
                    "{} in {:.1}s",
                    completion.result_name,
                    started.elapsed().as_secs_f64()
                ));
                counter!("vscale_segments_total", "outcome" => "completed").increment(1);
                WorkerOutcome::Completed
            }
            SegmentUpdate::AlreadyComplete => {
                logger.log_progress("completed concurrently by another worker");
                counter!("vscale_segments_total", "outcome" => "already_complete").increment(1);
                WorkerOutcome::AlreadyComplete
            }
            SegmentUpdate::UnknownJob => self.poison(logger, PoisonReason::UnknownJob),
            SegmentUpdate::UnknownSegment => self.poison(logger, PoisonReason::UnknownSegment),
        };
        Ok(outcome)
    }

    fn poison(&self, logger: &JobLogger, reason: PoisonReason) -> WorkerOutcome {
        logger.log_warning(&format!("discarding dispatch: {}", reason.as_str()));
        counter!("vscale_poison_dispatches_total", "reason" => reason.as_str()).increment(1);
        WorkerOutcome::Poison(reason)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use tokio_test::assert_err;
    use vscale_firestore::MemoryJobStore;
    use vscale_media::{MediaError, MediaResult};
    use vscale_models::{segment_name, ArtifactRef, Job, JobId};
    use vscale_storage::MemoryObjectStore;

    /// Transform that upper-cases the input bytes.
    #[derive(Default)]
    pub(crate) struct UppercaseTransform {
        pub fail: AtomicBool,
        pub calls: AtomicU32,
        pub delay_ms: AtomicU64,
    }

    #[async_trait]
    impl FrameTransform for UppercaseTransform {
        fn name(&self) -> &str {
            "uppercase"
        }

        async fn apply(&self, input: &Path, output: &Path) -> MediaResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(MediaError::command_failed("sr", "exited with 1", None, Some(1)));
            }
            let data = tokio::fs::read(input).await?;
            tokio::fs::write(output, data.to_ascii_uppercase()).await?;
            Ok(())
        }
    }

    pub(crate) struct Fixture {
        pub storage: Arc<MemoryObjectStore>,
        pub jobs: Arc<MemoryJobStore>,
        pub transform: Arc<UppercaseTransform>,
        pub worker: Arc<ChunkWorker>,
        pub job: Job,
    }

    pub(crate) async fn fixture(segments: usize) -> Fixture {
        let storage = Arc::new(MemoryObjectStore::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let transform = Arc::new(UppercaseTransform::default());

        let id = JobId::new();
        let names: Vec<String> = (0..segments).map(|i| segment_name(&id, i)).collect();
        for (i, name) in names.iter().enumerate() {
            storage
                .put(name, format!("seg{}", i).into_bytes())
                .await
                .unwrap();
        }
        let job = Job::new(id, ArtifactRef::parse("clip.mp4").unwrap(), names);
        jobs.create_job(&job).await.unwrap();

        let worker = Arc::new(ChunkWorker::new(
            storage.clone(),
            jobs.clone(),
            transform.clone(),
            std::env::temp_dir().join("vscale-worker-tests"),
            Duration::from_secs(10),
        ));

        Fixture {
            storage,
            jobs,
            transform,
            worker,
            job,
        }
    }

    fn dispatch(f: &Fixture, index: usize) -> DispatchMessage {
        DispatchMessage::new(f.job.id.clone(), f.job.segments[index].name.clone())
    }

    #[tokio::test]
    async fn test_segment_is_processed_and_marked_complete() {
        let f = fixture(2).await;
        let outcome = f.worker.handle("1-0", &dispatch(&f, 1)).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Completed);

        let processed = processed_segment_name(&f.job.segments[1].name);
        assert_eq!(f.storage.get(&processed).await.unwrap(), b"SEG1");

        let job = f.jobs.get_job(&f.job.id).await.unwrap().unwrap();
        let segment = &job.segments[1];
        assert!(segment.is_complete());
        assert_eq!(segment.result_name.as_deref(), Some(processed.as_str()));
        assert!(segment.time_start <= segment.time_end);
        assert!(!job.segments[0].is_complete());
    }

    #[tokio::test]
    async fn test_redelivery_keeps_first_completion() {
        let f = fixture(1).await;
        f.worker.handle("1-0", &dispatch(&f, 0)).await.unwrap();
        let first = f.jobs.get_job(&f.job.id).await.unwrap().unwrap().segments[0].clone();

        let outcome = f.worker.handle("1-0", &dispatch(&f, 0)).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::AlreadyComplete);

        let second = f.jobs.get_job(&f.job.id).await.unwrap().unwrap().segments[0].clone();
        assert_eq!(first, second);
        assert_eq!(f.transform.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_job_is_poison() {
        let f = fixture(1).await;
        let message = DispatchMessage::new(JobId::from_string("gone"), "gone_00000000.mp4");

        let outcome = f.worker.handle("9-0", &message).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Poison(PoisonReason::UnknownJob));
        assert_eq!(f.transform.calls.load(Ordering::SeqCst), 0);
        assert!(!f.jobs.get_job(&f.job.id).await.unwrap().unwrap().segments[0].is_complete());
    }

    #[tokio::test]
    async fn test_unknown_segment_is_poison() {
        let f = fixture(1).await;
        let message = DispatchMessage::new(f.job.id.clone(), "nope.mp4");
        let outcome = f.worker.handle("9-0", &message).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Poison(PoisonReason::UnknownSegment));
    }

    #[tokio::test]
    async fn test_transform_failure_leaves_segment_unprocessed() {
        let f = fixture(1).await;
        f.transform.fail.store(true, Ordering::SeqCst);

        let err = assert_err!(f.worker.handle("1-0", &dispatch(&f, 0)).await);
        assert!(matches!(err, WorkerError::Transform(_)));
        assert!(err.is_retryable());

        let job = f.jobs.get_job(&f.job.id).await.unwrap().unwrap();
        assert!(!job.segments[0].is_complete());
        let processed = processed_segment_name(&f.job.segments[0].name);
        assert!(!f.storage.contains(&processed));
    }

    #[tokio::test]
    async fn test_store_outage_is_an_error() {
        let f = fixture(1).await;
        f.jobs.set_unavailable(true);
        let err = assert_err!(f.worker.handle("1-0", &dispatch(&f, 0)).await);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_transform_template_is_config_error() {
        let config = WorkerConfig {
            transform_command: Some("sr {input}".to_string()),
            ..Default::default()
        };
        let result = ChunkWorker::from_config(
            &config,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryJobStore::new()),
        );
        assert!(matches!(result, Err(WorkerError::ConfigError(_))));
    }

    #[test]
    fn test_default_transform_is_ffmpeg() {
        let worker = ChunkWorker::from_config(
            &WorkerConfig::default(),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryJobStore::new()),
        )
        .unwrap();
        assert_eq!(worker.transform_name(), "ffmpeg-upscale");
    }
}
