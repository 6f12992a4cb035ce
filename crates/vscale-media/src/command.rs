//! FFmpeg command builder and runner.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use metrics::histogram;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

/// Keep this much of a failed command's stderr in the error.
const STDERR_TAIL_BYTES: usize = 4096;

/// Builder for FFmpeg commands.
///
/// Inputs are emitted in the order they were added, each preceded by its
/// own input arguments.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    inputs: Vec<(Vec<String>, PathBuf)>,
    output: PathBuf,
    output_args: Vec<String>,
    log_level: String,
}

impl FfmpegCommand {
    /// Create a command reading `input` and writing `output`.
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            inputs: vec![(Vec::new(), input.as_ref().to_path_buf())],
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
            log_level: "error".to_string(),
        }
    }

    /// Add input arguments for the most recently added input.
    pub fn input_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some((input_args, _)) = self.inputs.last_mut() {
            input_args.extend(args.into_iter().map(Into::into));
        }
        self
    }

    /// Add another input file.
    pub fn input(mut self, path: impl AsRef<Path>) -> Self {
        self.inputs.push((Vec::new(), path.as_ref().to_path_buf()));
        self
    }

    /// Add output arguments (after all inputs).
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set video filter.
    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_args(["-vf".to_string(), filter.into()])
    }

    /// Set video codec.
    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_args(["-c:v".to_string(), codec.into()])
    }

    /// Copy every selected stream without re-encoding.
    pub fn stream_copy(self) -> Self {
        self.output_args(["-c", "copy"])
    }

    /// Drop audio from the output.
    pub fn no_audio(self) -> Self {
        self.output_args(["-an"])
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec!["-y".to_string(), "-v".to_string(), self.log_level.clone()];

        for (input_args, path) in &self.inputs {
            args.extend(input_args.iter().cloned());
            args.push("-i".to_string());
            args.push(path.to_string_lossy().to_string());
        }

        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// Runner for FFmpeg commands with a timeout.
#[derive(Debug, Clone, Default)]
pub struct FfmpegRunner {
    timeout: Option<Duration>,
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the process if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run an FFmpeg command to completion.
    pub async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<()> {
        run_tool("ffmpeg", cmd.build_args(), self.timeout).await?;
        Ok(())
    }
}

/// Run an external tool, returning its stdout.
///
/// The child is killed on timeout. A non-zero exit maps to
/// `MediaError::CommandFailed` carrying the tail of stderr.
pub async fn run_tool<I, S>(program: &str, args: I, timeout: Option<Duration>) -> MediaResult<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    which::which(program).map_err(|_| MediaError::ToolNotFound(program.to_string()))?;

    let args: Vec<S> = args.into_iter().collect();
    debug!(
        "Running {} {}",
        program,
        args.iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let start = Instant::now();
    let mut child = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let collect = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let read_out = async {
            if let Some(s) = stdout.as_mut() {
                s.read_to_end(&mut out).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_err = async {
            if let Some(s) = stderr.as_mut() {
                s.read_to_end(&mut err).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (r1, r2) = tokio::join!(read_out, read_err);
        r1?;
        r2?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, out, err))
    };

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, collect).await {
            Ok(result) => result,
            Err(_) => {
                // The child is dropped on return; kill_on_drop terminates it
                warn!("{} timed out after {} seconds, killing process", program, limit.as_secs());
                record_run(program, "timeout", start);
                return Err(MediaError::Timeout(limit.as_secs()));
            }
        },
        None => collect.await,
    };
    let (status, out, err) = outcome?;

    if status.success() {
        record_run(program, "ok", start);
        Ok(out)
    } else {
        record_run(program, "error", start);
        Err(MediaError::command_failed(
            program,
            format!("exited with {}", status),
            Some(stderr_tail(&err)),
            status.code(),
        ))
    }
}

fn record_run(program: &str, outcome: &'static str, start: Instant) {
    histogram!(
        "vscale_media_command_seconds",
        "tool" => program.to_string(),
        "outcome" => outcome
    )
    .record(start.elapsed().as_secs_f64());
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut cut = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(cut) {
        cut += 1;
    }
    trimmed[cut..].to_string()
}
