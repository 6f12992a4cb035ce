//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{WorkerError, WorkerResult};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum segments processed at once
    pub max_concurrent_jobs: usize,
    /// Scratch space for segment downloads and transform output
    pub work_dir: PathBuf,
    /// Upper bound on one segment transform
    pub transform_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// How often the worker scans for deliveries abandoned by dead workers
    pub claim_interval: Duration,
    /// Minimum idle time before a pending delivery can be claimed.
    /// Taken from the queue's visibility timeout.
    pub claim_min_idle: Duration,
    /// How long one consume call waits for new messages
    pub consume_block: Duration,
    /// External transform command with `{input}` and `{output}` placeholders
    pub transform_command: Option<String>,
    /// Scale factor for the built-in ffmpeg upscaler
    pub upscale_factor: u32,
    /// Encoder for the built-in ffmpeg upscaler
    pub upscale_codec: String,
    /// Serve Prometheus metrics on this port when set
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            work_dir: std::env::temp_dir().join("vscale-worker"),
            transform_timeout: Duration::from_secs(1800),
            shutdown_timeout: Duration::from_secs(60),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(600),
            consume_block: Duration::from_secs(1),
            transform_command: None,
            upscale_factor: 4,
            upscale_codec: "libx264".to_string(),
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_jobs: env_parse("WORKER_MAX_JOBS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_concurrent_jobs),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            transform_timeout: env_parse("WORKER_TRANSFORM_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.transform_timeout),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            claim_interval: env_parse("WORKER_CLAIM_INTERVAL_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_interval),
            claim_min_idle: defaults.claim_min_idle,
            consume_block: env_parse("WORKER_CONSUME_BLOCK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.consume_block),
            transform_command: std::env::var("TRANSFORM_COMMAND")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            upscale_factor: env_parse("UPSCALE_FACTOR")
                .filter(|f: &u32| *f > 0)
                .unwrap_or(defaults.upscale_factor),
            upscale_codec: std::env::var("UPSCALE_CODEC")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.upscale_codec),
            metrics_port: env_parse("WORKER_METRICS_PORT"),
        }
    }

    /// Use the queue's visibility timeout as the reclaim threshold.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.claim_min_idle = timeout;
        self
    }

    /// How often an in-flight delivery has its idle time reset: a third of
    /// the visibility timeout.
    pub fn keepalive_interval(&self) -> Duration {
        (self.claim_min_idle / 3).max(Duration::from_millis(10))
    }

    /// Reject settings under which live deliveries would be reclaimed.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.claim_min_idle < Duration::from_millis(30) {
            return Err(WorkerError::config_error(format!(
                "visibility timeout {:?} is too short to keep deliveries alive",
                self.claim_min_idle
            )));
        }
        if self.claim_interval.is_zero() {
            return Err(WorkerError::config_error("claim interval must be positive"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("WORKER_MAX_JOBS", "8");
        std::env::set_var("TRANSFORM_COMMAND", "sr -i {input} -o {output}");
        std::env::set_var("UPSCALE_FACTOR", "0");

        let config = WorkerConfig::from_env();
        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(
            config.transform_command.as_deref(),
            Some("sr -i {input} -o {output}")
        );
        assert_eq!(config.upscale_factor, 4);
        assert_eq!(config.claim_min_idle, Duration::from_secs(600));

        std::env::remove_var("WORKER_MAX_JOBS");
        std::env::remove_var("TRANSFORM_COMMAND");
        std::env::remove_var("UPSCALE_FACTOR");
    }

    #[test]
    fn test_visibility_timeout_drives_reclaim_and_keepalive() {
        let config = WorkerConfig::default().with_visibility_timeout(Duration::from_secs(90));
        assert_eq!(config.claim_min_idle, Duration::from_secs(90));
        assert_eq!(config.keepalive_interval(), Duration::from_secs(30));
        assert!(config.validate().is_ok());

        let too_short = WorkerConfig::default().with_visibility_timeout(Duration::ZERO);
        assert!(matches!(
            too_short.validate(),
            Err(WorkerError::ConfigError(_))
        ));
    }

    #[test]
    #[serial]
    fn test_blank_transform_command_is_ignored() {
        std::env::set_var("TRANSFORM_COMMAND", "  ");
        assert!(WorkerConfig::from_env().transform_command.is_none());
        std::env::remove_var("TRANSFORM_COMMAND");
    }
}
