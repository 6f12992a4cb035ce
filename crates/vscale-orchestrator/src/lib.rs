//! Job orchestration for the chunked upscaling pipeline.
//!
//! The orchestrator owns both ends of a job's life:
//! - Intake: split the source, persist the job, dispatch one message per segment
//! - Status: report progress and, once every segment is complete, reassemble
//!   the final artifact exactly once behind an aggregation lease

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod reassembly;
pub mod retry;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::Orchestrator;
pub use reassembly::ReassemblyEngine;
pub use retry::{retry_if, RetryConfig, RetryResult};
