//! Durable object store.
//!
//! This crate provides:
//! - The `ObjectStore` trait consumed by the orchestrator and workers
//! - An S3-compatible client with bounded per-operation timeouts
//! - An in-memory store for tests and local runs

pub mod client;
pub mod error;
pub mod memory;
pub mod store;

pub use client::{S3Client, S3Config};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryObjectStore;
pub use store::ObjectStore;
