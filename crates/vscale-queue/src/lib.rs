//! Work queue for segment dispatch.
//!
//! This crate provides:
//! - The `DispatchQueue` trait: publish, consume, ack, reclaim stale deliveries
//! - A Redis Streams implementation with consumer groups
//! - An in-memory implementation with the same redelivery semantics

pub mod error;
pub mod memory;
pub mod queue;
pub mod stream;

pub use error::{QueueError, QueueResult};
pub use memory::MemoryDispatchQueue;
pub use queue::{Delivery, DispatchQueue};
pub use stream::{DispatchStream, QueueConfig};
