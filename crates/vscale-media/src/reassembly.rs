//! Concatenation and audio remuxing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::probe_media;

/// Media operations needed to rebuild a whole artifact from processed segments.
#[async_trait]
pub trait ReassemblyTool: Send + Sync {
    /// Stream-copy the files listed in `manifest` (concat demuxer format) into `output`.
    async fn concat(&self, manifest: &Path, output: &Path) -> MediaResult<()>;

    /// Whether `path` carries an audio stream.
    async fn has_audio(&self, path: &Path) -> MediaResult<bool>;

    /// Stream-copy the audio track of `source` into `output`.
    async fn extract_audio(&self, source: &Path, output: &Path) -> MediaResult<()>;

    /// Combine the video of `video` with the audio of `audio` into `output`.
    async fn remux(&self, video: &Path, audio: &Path, output: &Path) -> MediaResult<()>;
}

/// Concat demuxer manifest listing `files` in the given order.
///
/// Single quotes in paths are escaped the way the demuxer expects.
pub fn concat_manifest(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|f| format!("file '{}'\n", f.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

/// Copy the audio track of `source` into a Matroska file.
///
/// Matroska accepts any codec an MP4 source can carry (AC-3, Opus, PCM),
/// unlike the `.m4a` muxer.
fn extract_audio_command(source: &Path, output: &Path) -> FfmpegCommand {
    FfmpegCommand::new(source, output).output_args(["-vn", "-acodec", "copy", "-f", "matroska"])
}

/// FFmpeg-backed reassembly.
#[derive(Debug, Clone, Default)]
pub struct FfmpegReassembler {
    runner: FfmpegRunner,
}

impl FfmpegReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.runner = self.runner.with_timeout(timeout);
        self
    }
}

#[async_trait]
impl ReassemblyTool for FfmpegReassembler {
    async fn concat(&self, manifest: &Path, output: &Path) -> MediaResult<()> {
        if !manifest.exists() {
            return Err(MediaError::FileNotFound(manifest.to_path_buf()));
        }
        let cmd = FfmpegCommand::new(manifest, output)
            .input_args(["-f", "concat", "-safe", "0"])
            .stream_copy();
        self.runner.run(&cmd).await
    }

    async fn has_audio(&self, path: &Path) -> MediaResult<bool> {
        Ok(probe_media(path).await?.has_audio)
    }

    async fn extract_audio(&self, source: &Path, output: &Path) -> MediaResult<()> {
        self.runner.run(&extract_audio_command(source, output)).await
    }

    async fn remux(&self, video: &Path, audio: &Path, output: &Path) -> MediaResult<()> {
        let cmd = FfmpegCommand::new(video, output)
            .input(audio)
            .stream_copy()
            .output_args(["-map", "0:v:0", "-map", "1:a:0"]);
        self.runner.run(&cmd).await
    }
}
