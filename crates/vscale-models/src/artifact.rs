//! Artifact references and deterministic artifact naming.
//!
//! Every durable object the pipeline writes is named from the job id alone,
//! so any component can derive the name of any artifact without a lookup:
//!
//! | Artifact | Name |
//! |---|---|
//! | Segment `i` | `<job>_<i:08>.mp4` |
//! | Processed segment | `<segment stem>_processed.mp4` |
//! | Final artifact | `<job>_upscaled.mp4` |

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::job::JobId;

/// Sentinel stored in place of an artifact name that does not exist yet.
pub const ARTIFACT_NONE: &str = "NONE";

/// Only container format the splitter and reassembly commands accept.
pub const SUPPORTED_EXTENSION: &str = "mp4";

/// Width of the zero-padded sequence suffix on segment names.
pub const SEGMENT_INDEX_WIDTH: usize = 8;

const MAX_KEY_LEN: usize = 1024;

/// Validated reference to a whole artifact already uploaded to the object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactRef(String);

impl ArtifactRef {
    /// Validate and wrap an object key.
    pub fn parse(key: impl Into<String>) -> ModelResult<Self> {
        let key = key.into();
        let trimmed = key.trim();

        if trimmed.is_empty() {
            return Err(ModelError::invalid_artifact("artifact reference is empty"));
        }
        if trimmed.len() > MAX_KEY_LEN {
            return Err(ModelError::invalid_artifact(format!(
                "artifact reference exceeds {} bytes",
                MAX_KEY_LEN
            )));
        }
        if trimmed.starts_with('/') || trimmed.contains('\\') || trimmed.contains("..") {
            return Err(ModelError::invalid_artifact(format!(
                "artifact reference is not a plain object key: {}",
                trimmed
            )));
        }
        if trimmed.chars().any(|c| c.is_control()) {
            return Err(ModelError::invalid_artifact(
                "artifact reference contains control characters",
            ));
        }

        let extension = trimmed.rsplit_once('.').map(|(_, ext)| ext);
        match extension {
            Some(ext) if ext.eq_ignore_ascii_case(SUPPORTED_EXTENSION) => {}
            _ => {
                return Err(ModelError::invalid_artifact(format!(
                    "file must be MP4: {}",
                    trimmed
                )))
            }
        }

        Ok(Self(trimmed.to_string()))
    }

    /// Object key of the artifact.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ArtifactRef {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ArtifactRef> for String {
    fn from(value: ArtifactRef) -> Self {
        value.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of the `index`-th segment of a job.
pub fn segment_name(job_id: &JobId, index: usize) -> String {
    format!(
        "{}_{:0width$}.{}",
        job_id,
        index,
        SUPPORTED_EXTENSION,
        width = SEGMENT_INDEX_WIDTH
    )
}

/// Name under which a worker uploads the transformed copy of a segment.
pub fn processed_segment_name(segment: &str) -> String {
    match segment.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_processed.{}", stem, ext),
        _ => format!("{}_processed", segment),
    }
}

/// Name of the reassembled artifact for a job.
pub fn final_artifact_name(job_id: &JobId) -> String {
    format!("{}_upscaled.{}", job_id, SUPPORTED_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_ref_accepts_mp4() {
        let r = ArtifactRef::parse("1b2c.mp4").unwrap();
        assert_eq!(r.as_str(), "1b2c.mp4");

        let upper = ArtifactRef::parse("uploads/clip.MP4").unwrap();
        assert_eq!(upper.as_str(), "uploads/clip.MP4");
    }

    #[test]
    fn test_artifact_ref_rejects_unsupported() {
        assert!(ArtifactRef::parse("").is_err());
        assert!(ArtifactRef::parse("   ").is_err());
        assert!(ArtifactRef::parse("movie.mkv").is_err());
        assert!(ArtifactRef::parse("movie").is_err());
        assert!(ArtifactRef::parse("../etc/passwd.mp4").is_err());
        assert!(ArtifactRef::parse("/abs/path.mp4").is_err());
    }

    #[test]
    fn test_artifact_ref_deserialize_validates() {
        let ok: Result<ArtifactRef, _> = serde_json::from_str("\"a.mp4\"");
        assert!(ok.is_ok());
        let bad: Result<ArtifactRef, _> = serde_json::from_str("\"a.avi\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_segment_names_sort_in_temporal_order() {
        let job = JobId::from_string("job");
        let mut names: Vec<String> = [10, 2, 0, 1, 100]
            .iter()
            .map(|i| segment_name(&job, *i))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "job_00000000.mp4",
                "job_00000001.mp4",
                "job_00000002.mp4",
                "job_00000010.mp4",
                "job_00000100.mp4",
            ]
        );
    }

    #[test]
    fn test_processed_and_final_names() {
        assert_eq!(
            processed_segment_name("job_00000003.mp4"),
            "job_00000003_processed.mp4"
        );
        assert_eq!(processed_segment_name("raw"), "raw_processed");
        assert_eq!(
            final_artifact_name(&JobId::from_string("abc")),
            "abc_upscaled.mp4"
        );
    }
}
