//! Rebuilding the final artifact from processed segments.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use metrics::histogram;
use tracing::{debug, info};
use vscale_media::{concat_manifest, ReassemblyTool};
use vscale_models::{final_artifact_name, Job};
use vscale_storage::{ObjectStore, StorageError};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::retry::{retry_if, RetryConfig};

/// Concatenates a job's processed segments in split order and puts the
/// source audio back on top.
pub struct ReassemblyEngine {
    storage: Arc<dyn ObjectStore>,
    tool: Arc<dyn ReassemblyTool>,
    work_dir: PathBuf,
    retry: RetryConfig,
}

impl ReassemblyEngine {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        tool: Arc<dyn ReassemblyTool>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            storage,
            tool,
            work_dir: work_dir.into(),
            retry: RetryConfig::new("reassembly"),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Build and upload the final artifact of `job`, returning its name.
    ///
    /// Local files live in a scratch directory removed on every exit path.
    /// Tool failures and missing segment artifacts surface as
    /// `AggregationFailed`; the store is not touched.
    pub async fn reassemble(&self, job: &Job) -> OrchestratorResult<String> {
        let start = std::time::Instant::now();
        let ordered = job.ordered_segments();

        let mut remote = Vec::with_capacity(ordered.len());
        for segment in &ordered {
            match (&segment.result_name, segment.is_complete()) {
                (Some(result), true) => remote.push(result.clone()),
                _ => {
                    return Err(OrchestratorError::aggregation_failed(format!(
                        "segment {} of job {} is not complete",
                        segment.name, job.id
                    )))
                }
            }
        }
        if remote.is_empty() {
            return Err(OrchestratorError::aggregation_failed(format!(
                "job {} has no segments",
                job.id
            )));
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("reassemble-{}-", job.id))
            .tempdir_in(&self.work_dir)?;
        let dir = scratch.path();

        let mut local = Vec::with_capacity(remote.len());
        for (position, key) in remote.iter().enumerate() {
            let path = dir.join(format!("part_{:08}.mp4", position));
            self.download(key, &path).await?;
            local.push(path);
        }

        let manifest = dir.join("concat.txt");
        tokio::fs::write(&manifest, concat_manifest(&local)).await?;

        let video = dir.join("video.mp4");
        self.tool
            .concat(&manifest, &video)
            .await
            .map_err(|e| OrchestratorError::aggregation_failed(format!("concat: {}", e)))?;

        let source = dir.join("source.mp4");
        self.download(job.source.as_str(), &source).await?;

        let has_audio = self
            .tool
            .has_audio(&source)
            .await
            .map_err(|e| OrchestratorError::aggregation_failed(format!("probe: {}", e)))?;

        let output = if has_audio {
            let audio = dir.join("audio.mka");
            self.tool
                .extract_audio(&source, &audio)
                .await
                .map_err(|e| OrchestratorError::aggregation_failed(format!("extract audio: {}", e)))?;

            let output = dir.join("final.mp4");
            self.tool
                .remux(&video, &audio, &output)
                .await
                .map_err(|e| OrchestratorError::aggregation_failed(format!("remux: {}", e)))?;
            output
        } else {
            debug!(job_id = %job.id, "Source has no audio track, keeping concatenated video");
            video
        };

        let name = final_artifact_name(&job.id);
        retry_if(
            &self.retry.named("upload_final_artifact"),
            StorageError::is_retryable,
            || self.storage.upload_file(&output, &name),
        )
        .await
        .into_result()?;

        histogram!("vscale_reassembly_seconds").record(start.elapsed().as_secs_f64());
        info!(
            job_id = %job.id,
            segments = local.len(),
            has_audio,
            "Reassembled {}",
            name
        );
        Ok(name)
    }

    async fn download(&self, key: &str, path: &Path) -> OrchestratorResult<()> {
        let result = retry_if(
            &self.retry.named("download_artifact"),
            StorageError::is_retryable,
            || self.storage.download_file(key, path),
        )
        .await
        .into_result();

        match result {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(key)) => Err(OrchestratorError::aggregation_failed(
                format!("artifact {} is missing", key),
            )),
            Err(e) => Err(e.into()),
        }
    }
}
