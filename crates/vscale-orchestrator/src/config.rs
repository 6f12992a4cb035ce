//! Orchestrator configuration.

use std::path::PathBuf;
use std::time::Duration;

use vscale_media::DEFAULT_SEGMENT_SECONDS;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Target segment duration in seconds
    pub chunk_size: u32,
    /// Scratch space for splitting and reassembly
    pub work_dir: PathBuf,
    /// How long an aggregation claim stays exclusive without renewal
    pub aggregation_lease: Duration,
    /// How long completed job records are kept
    pub job_retention: Duration,
    /// Upper bound on any single ffmpeg invocation
    pub media_timeout: Duration,
    /// Attempts after the first for storage, store and queue calls
    pub max_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_SEGMENT_SECONDS,
            work_dir: std::env::temp_dir().join("vscale"),
            aggregation_lease: Duration::from_secs(120),
            job_retention: Duration::from_secs(86400),
            media_timeout: Duration::from_secs(1800),
            max_retries: 3,
        }
    }
}

impl OrchestratorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk_size: env_parse("CHUNK_SIZE")
                .filter(|s: &u32| *s > 0)
                .unwrap_or(defaults.chunk_size),
            work_dir: std::env::var("ORCHESTRATOR_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            aggregation_lease: env_parse("AGGREGATION_LEASE_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.aggregation_lease),
            job_retention: env_parse("JOB_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_retention),
            media_timeout: env_parse("MEDIA_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.media_timeout),
            max_retries: env_parse("ORCHESTRATOR_MAX_RETRIES").unwrap_or(defaults.max_retries),
        }
    }

    /// How often a running aggregation renews its lease.
    pub fn lease_renewal_interval(&self) -> Duration {
        (self.aggregation_lease / 3).max(Duration::from_millis(10))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
