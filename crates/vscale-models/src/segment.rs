//! Segment records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// Processing status of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentStatus {
    #[default]
    Unprocessed,
    Complete,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Unprocessed => "UNPROCESSED",
            SegmentStatus::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SegmentStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNPROCESSED" => Ok(SegmentStatus::Unprocessed),
            "COMPLETE" => Ok(SegmentStatus::Complete),
            other => Err(ModelError::InvalidStatus(other.to_string())),
        }
    }
}

/// One time-bounded slice of the source artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Segment {
    /// Object key of the raw segment; sorts in temporal order
    pub name: String,
    /// Position in the source artifact
    pub index: u32,
    pub status: SegmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_end: Option<DateTime<Utc>>,
    /// Object key of the processed segment once complete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_name: Option<String>,
}

impl Segment {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
            status: SegmentStatus::Unprocessed,
            time_start: None,
            time_end: None,
            result_name: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == SegmentStatus::Complete
    }

    /// Mark the segment complete.
    ///
    /// Returns `false` and leaves the record untouched if it was already
    /// complete, so a redelivered message cannot overwrite the timestamps of
    /// the first completion.
    pub fn apply_completion(&mut self, completion: &SegmentCompletion) -> bool {
        if self.is_complete() {
            return false;
        }
        self.status = SegmentStatus::Complete;
        self.result_name = Some(completion.result_name.clone());
        self.time_start = Some(completion.time_start);
        self.time_end = Some(completion.time_end);
        true
    }
}

/// Fields a worker writes when it finishes a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCompletion {
    pub result_name: String,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_completion_is_applied_once() {
        let mut seg = Segment::new("j_00000000.mp4", 0);
        let t0 = Utc::now();
        let first = SegmentCompletion {
            result_name: "j_00000000_processed.mp4".into(),
            time_start: t0,
            time_end: t0 + Duration::seconds(3),
        };
        assert!(seg.apply_completion(&first));

        let duplicate = SegmentCompletion {
            result_name: "j_00000000_processed.mp4".into(),
            time_start: t0 + Duration::seconds(60),
            time_end: t0 + Duration::seconds(90),
        };
        assert!(!seg.apply_completion(&duplicate));
        assert_eq!(seg.time_start, Some(t0));
        assert_eq!(seg.time_end, Some(t0 + Duration::seconds(3)));
    }

    #[test]
    fn test_status_round_trip_strings() {
        assert_eq!("UNPROCESSED".parse::<SegmentStatus>().unwrap(), SegmentStatus::Unprocessed);
        assert_eq!(SegmentStatus::Complete.to_string(), "COMPLETE");
    }
}
