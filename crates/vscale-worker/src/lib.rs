//! Segment worker.
//!
//! This crate provides:
//! - `ChunkWorker`: the per-message contract (fetch, transform, upload, mark complete)
//! - `JobExecutor`: a bounded-concurrency consumer loop with crash recovery
//! - Graceful shutdown

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::JobLogger;
pub use worker::{ChunkWorker, PoisonReason, WorkerOutcome};
