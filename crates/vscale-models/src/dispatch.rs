//! Dispatch messages carried by the work queue.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::job::JobId;

/// Instruction for some worker to process one named segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DispatchMessage {
    pub job_id: JobId,
    pub segment_name: String,
}

impl DispatchMessage {
    pub fn new(job_id: JobId, segment_name: impl Into<String>) -> Self {
        Self {
            job_id,
            segment_name: segment_name.into(),
        }
    }

    /// Decode and validate a payload read from the queue.
    pub fn from_json(payload: &str) -> ModelResult<Self> {
        let msg: Self = serde_json::from_str(payload)
            .map_err(|e| ModelError::invalid_dispatch(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }

    /// Encode for the queue.
    pub fn to_json(&self) -> ModelResult<String> {
        serde_json::to_string(self).map_err(|e| ModelError::invalid_dispatch(e.to_string()))
    }

    fn validate(&self) -> ModelResult<()> {
        if self.job_id.as_str().trim().is_empty() {
            return Err(ModelError::invalid_dispatch("job_id is empty"));
        }
        if self.segment_name.trim().is_empty() {
            return Err(ModelError::invalid_dispatch("segment_name is empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_valid_message() {
        let msg = DispatchMessage::from_json(r#"{"job_id":"j1","segment_name":"j1_00000000.mp4"}"#)
            .unwrap();
        assert_eq!(msg.job_id.as_str(), "j1");
        assert_eq!(msg.segment_name, "j1_00000000.mp4");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(DispatchMessage::from_json("not json").is_err());
        assert!(DispatchMessage::from_json(r#"{"job_id":"j1"}"#).is_err());
        assert!(DispatchMessage::from_json(r#"{"job_id":"","segment_name":"s"}"#).is_err());
        assert!(DispatchMessage::from_json(
            r#"{"job_id":"j","segment_name":"s","extra":1}"#
        )
        .is_err());
    }
}
