//! Job records and the client-facing status view.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::artifact::{ArtifactRef, ARTIFACT_NONE};
use crate::error::ModelError;
use crate::segment::{Segment, SegmentStatus};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle status.
///
/// `None` is synthetic: it is reported for ids the store does not know and
/// is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    None,
    InProgress,
    Complete,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::None => "NONE",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(JobStatus::None),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "COMPLETE" => Ok(JobStatus::Complete),
            other => Err(ModelError::InvalidStatus(other.to_string())),
        }
    }
}

/// One end-to-end request to process a whole artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID, immutable after intake
    pub id: JobId,

    /// Original whole artifact the segments were cut from
    pub source: ArtifactRef,

    /// Persisted status (never `None`)
    pub status: JobStatus,

    /// Segments in the temporal order of the source artifact
    pub segments: Vec<Segment>,

    /// Intake time
    pub time_start: DateTime<Utc>,

    /// Latest segment completion time, set when the job completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_end: Option<DateTime<Utc>>,

    /// Final reassembled artifact, set when the job completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_artifact: Option<String>,

    /// When the store may drop this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new in-progress job whose segments are all unprocessed.
    ///
    /// `segment_names` must already be in temporal order.
    pub fn new(id: JobId, source: ArtifactRef, segment_names: Vec<String>) -> Self {
        let segments = segment_names
            .into_iter()
            .enumerate()
            .map(|(index, name)| Segment::new(name, index as u32))
            .collect();

        Self {
            id,
            source,
            status: JobStatus::InProgress,
            segments,
            time_start: Utc::now(),
            time_end: None,
            result_artifact: None,
            expires_at: None,
        }
    }

    /// Find a segment by name.
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// Find a segment by name, mutably.
    pub fn segment_mut(&mut self, name: &str) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.name == name)
    }

    /// Number of segments already complete.
    pub fn completed_segments(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Complete)
            .count()
    }

    /// True when the job has segments and every one of them is complete.
    pub fn all_segments_complete(&self) -> bool {
        !self.segments.is_empty() && self.completed_segments() == self.segments.len()
    }

    /// Latest completion time over all segments.
    pub fn latest_segment_end(&self) -> Option<DateTime<Utc>> {
        self.segments.iter().filter_map(|s| s.time_end).max()
    }

    /// Segments sorted by their split-time index.
    ///
    /// Persisted order already matches, but stores that return children in
    /// arbitrary order rely on this.
    pub fn ordered_segments(&self) -> Vec<&Segment> {
        let mut ordered: Vec<&Segment> = self.segments.iter().collect();
        ordered.sort_by_key(|s| s.index);
        ordered
    }

    /// Whether the record is past its retention window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Client-facing view of this job.
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id.to_string(),
            status: self.status,
            result_artifact: self
                .result_artifact
                .clone()
                .unwrap_or_else(|| ARTIFACT_NONE.to_string()),
        }
    }
}

/// Result of a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobStatusView {
    pub id: String,
    pub status: JobStatus,
    /// Final artifact name, or `"NONE"` until the job is complete
    pub result_artifact: String,
}

impl JobStatusView {
    /// View for an id the store does not know.
    pub fn none(id: &JobId) -> Self {
        Self {
            id: id.to_string(),
            status: JobStatus::None,
            result_artifact: ARTIFACT_NONE.to_string(),
        }
    }

    /// View of a job still being worked on.
    pub fn in_progress(id: &JobId) -> Self {
        Self {
            id: id.to_string(),
            status: JobStatus::InProgress,
            result_artifact: ARTIFACT_NONE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentCompletion;
    use chrono::Duration;

    fn sample_job() -> Job {
        Job::new(
            JobId::from_string("job-1"),
            ArtifactRef::parse("job-1.mp4").unwrap(),
            vec!["a_000.mp4".into(), "a_001.mp4".into(), "a_002.mp4".into()],
        )
    }

    #[test]
    fn test_new_job_is_in_progress_with_unprocessed_segments() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.segments.len(), 3);
        assert!(job
            .segments
            .iter()
            .all(|s| s.status == SegmentStatus::Unprocessed));
        assert_eq!(job.segments[2].index, 2);
        assert!(!job.all_segments_complete());
        assert_eq!(job.status_view().result_artifact, "NONE");
    }

    #[test]
    fn test_all_segments_complete_and_latest_end() {
        let mut job = sample_job();
        let base = Utc::now();

        for (offset, name) in [(5, "a_002.mp4"), (9, "a_000.mp4")] {
            let seg = job.segment_mut(name).unwrap();
            seg.apply_completion(&SegmentCompletion {
                result_name: format!("{}-out", name),
                time_start: base,
                time_end: base + Duration::seconds(offset),
            });
        }
        assert!(!job.all_segments_complete());

        job.segment_mut("a_001.mp4")
            .unwrap()
            .apply_completion(&SegmentCompletion {
                result_name: "x".into(),
                time_start: base,
                time_end: base + Duration::seconds(7),
            });

        assert!(job.all_segments_complete());
        assert_eq!(job.latest_segment_end(), Some(base + Duration::seconds(9)));
    }

    #[test]
    fn test_empty_job_is_never_complete() {
        let job = Job::new(
            JobId::new(),
            ArtifactRef::parse("x.mp4").unwrap(),
            Vec::new(),
        );
        assert!(!job.all_segments_complete());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
        assert_eq!(serde_json::to_string(&JobStatus::None).unwrap(), "\"NONE\"");
        assert_eq!("COMPLETE".parse::<JobStatus>().unwrap(), JobStatus::Complete);
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_none_view() {
        let view = JobStatusView::none(&JobId::from_string("missing"));
        assert_eq!(view.status, JobStatus::None);
        assert_eq!(view.result_artifact, "NONE");
    }

    #[test]
    fn test_expiry() {
        let mut job = sample_job();
        let now = Utc::now();
        assert!(!job.is_expired(now));
        job.expires_at = Some(now - Duration::seconds(1));
        assert!(job.is_expired(now));
    }
}
