//! Shared data models for the vscale chunk pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs and their ordered segments
//! - Dispatch messages carried by the work queue
//! - Artifact references and deterministic artifact naming
//! - The status view returned to clients

pub mod artifact;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod segment;

pub use artifact::{
    final_artifact_name, processed_segment_name, segment_name, ArtifactRef, ARTIFACT_NONE,
};
pub use dispatch::DispatchMessage;
pub use error::{ModelError, ModelResult};
pub use job::{Job, JobId, JobStatus, JobStatusView};
pub use segment::{Segment, SegmentCompletion, SegmentStatus};
