//! The per-segment frame transform.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{run_tool, FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// Transforms one segment file into its processed counterpart.
///
/// Must be a pure function of the input file so that a redelivered segment
/// produces an equivalent artifact.
#[async_trait]
pub trait FrameTransform: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &str;

    /// Read `input`, write the processed segment to `output`.
    async fn apply(&self, input: &Path, output: &Path) -> MediaResult<()>;
}

/// Spatial upscale by an integer factor using ffmpeg's lanczos scaler.
#[derive(Debug, Clone)]
pub struct FfmpegUpscaler {
    factor: u32,
    codec: String,
    runner: FfmpegRunner,
}

impl FfmpegUpscaler {
    pub fn new(factor: u32) -> Self {
        Self {
            factor: factor.max(1),
            codec: "libx264".to_string(),
            runner: FfmpegRunner::new(),
        }
    }

    /// Encoder for the processed segment.
    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.runner = self.runner.with_timeout(timeout);
        self
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    fn command(&self, input: &Path, output: &Path) -> FfmpegCommand {
        FfmpegCommand::new(input, output)
            .video_filter(format!(
                "scale=iw*{f}:ih*{f}:flags=lanczos",
                f = self.factor
            ))
            .video_codec(self.codec.clone())
            .no_audio()
    }
}

#[async_trait]
impl FrameTransform for FfmpegUpscaler {
    fn name(&self) -> &str {
        "ffmpeg-upscale"
    }

    async fn apply(&self, input: &Path, output: &Path) -> MediaResult<()> {
        if !input.exists() {
            return Err(MediaError::FileNotFound(input.to_path_buf()));
        }
        self.runner.run(&self.command(input, output)).await
    }
}

/// External transform command, e.g. a super-resolution model wrapper.
///
/// The template is split on whitespace; `{input}` and `{output}` are
/// replaced with the segment paths.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandTransform {
    /// Parse a command template such as `espcn --scale 4 {input} {output}`.
    pub fn from_template(template: &str) -> MediaResult<Self> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| MediaError::invalid_command("empty command template"))?;
        let args: Vec<String> = parts.collect();

        for placeholder in ["{input}", "{output}"] {
            if !args.iter().any(|a| a.contains(placeholder)) {
                return Err(MediaError::invalid_command(format!(
                    "template must contain {}",
                    placeholder
                )));
            }
        }

        Ok(Self {
            program,
            args,
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn render_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

#[async_trait]
impl FrameTransform for CommandTransform {
    fn name(&self) -> &str {
        &self.program
    }

    async fn apply(&self, input: &Path, output: &Path) -> MediaResult<()> {
        if !input.exists() {
            return Err(MediaError::FileNotFound(input.to_path_buf()));
        }
        run_tool(&self.program, self.render_args(input, output), self.timeout).await?;
        if !output.exists() {
            return Err(MediaError::command_failed(
                self.program.clone(),
                "exited successfully but wrote no output",
                None,
                Some(0),
            ));
        }
        Ok(())
    }
}
