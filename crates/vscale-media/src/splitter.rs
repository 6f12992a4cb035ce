//! Cutting a source artifact into fixed-duration segments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use vscale_models::JobId;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// Default target segment length in seconds.
pub const DEFAULT_SEGMENT_SECONDS: u32 = 30;

/// Splits a whole artifact into ordered segment files.
#[async_trait]
pub trait SegmentSplitter: Send + Sync {
    /// Write segments of `source` into `out_dir`.
    ///
    /// Returns the segment files in temporal order, named
    /// `<job_id>_<8-digit index>.mp4`. Fails with `NoSegments` if nothing
    /// was produced.
    async fn split(&self, source: &Path, out_dir: &Path, job_id: &JobId) -> MediaResult<Vec<PathBuf>>;
}

/// Stream-copy splitter built on the ffmpeg segment muxer.
///
/// Cuts land on keyframes, so segments are only approximately
/// `segment_seconds` long. Audio is dropped from segments and taken from the
/// source again at reassembly.
#[derive(Debug, Clone)]
pub struct FfmpegSplitter {
    segment_seconds: u32,
    runner: FfmpegRunner,
}

impl FfmpegSplitter {
    pub fn new(segment_seconds: u32) -> Self {
        Self {
            segment_seconds: segment_seconds.max(1),
            runner: FfmpegRunner::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.runner = self.runner.with_timeout(timeout);
        self
    }

    pub fn segment_seconds(&self) -> u32 {
        self.segment_seconds
    }

    fn command(&self, source: &Path, out_dir: &Path, job_id: &JobId) -> FfmpegCommand {
        let pattern = out_dir.join(format!("{}_%08d.mp4", job_id));
        FfmpegCommand::new(source, pattern).output_args([
            "-f".to_string(),
            "segment".to_string(),
            "-segment_time".to_string(),
            self.segment_seconds.to_string(),
            "-vcodec".to_string(),
            "copy".to_string(),
            "-reset_timestamps".to_string(),
            "1".to_string(),
            "-map".to_string(),
            "0".to_string(),
            "-an".to_string(),
        ])
    }
}

impl Default for FfmpegSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_SECONDS)
    }
}

#[async_trait]
impl SegmentSplitter for FfmpegSplitter {
    async fn split(&self, source: &Path, out_dir: &Path, job_id: &JobId) -> MediaResult<Vec<PathBuf>> {
        if !source.exists() {
            return Err(MediaError::FileNotFound(source.to_path_buf()));
        }
        tokio::fs::create_dir_all(out_dir).await?;

        self.runner.run(&self.command(source, out_dir, job_id)).await?;

        let segments = collect_segments(out_dir, job_id).await?;
        if segments.is_empty() {
            return Err(MediaError::NoSegments(source.to_path_buf()));
        }
        info!(
            job_id = %job_id,
            count = segments.len(),
            "Split {} into segments",
            source.display()
        );
        Ok(segments)
    }
}

/// Segment files for `job_id` in `dir`, sorted by name (and thus by index).
pub async fn collect_segments(dir: &Path, job_id: &JobId) -> MediaResult<Vec<PathBuf>> {
    let prefix = format!("{}_", job_id);
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut segments = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(index) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".mp4"))
        else {
            continue;
        };
        if index.len() == 8 && index.bytes().all(|b| b.is_ascii_digit()) {
            segments.push(entry.path());
        }
    }

    segments.sort();
    Ok(segments)
}
