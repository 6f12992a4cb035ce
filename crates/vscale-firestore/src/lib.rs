//! Job store.
//!
//! This crate provides:
//! - The `JobStore` trait: create, point reads and narrow, conditional updates
//! - A Firestore REST client with token caching, retry and metrics
//! - `JobRepository`, the Firestore-backed job store
//! - `MemoryJobStore` for tests and single-process runs

pub mod client;
pub mod error;
pub mod job_repo;
pub mod memory;
pub mod metrics;
pub mod retry;
pub mod store;
pub mod token_cache;
pub mod types;

pub use client::{FirestoreClient, FirestoreConfig};
pub use error::{FirestoreError, FirestoreResult};
pub use job_repo::JobRepository;
pub use memory::MemoryJobStore;
pub use store::{
    AggregationClaim, JobFinalization, JobStore, SegmentUpdate, StoreError, StoreResult,
};
pub use types::{Document, FromFirestoreValue, ToFirestoreValue, Value};
