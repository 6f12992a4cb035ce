//! Work queue abstraction.

use std::time::Duration;

use async_trait::async_trait;
use vscale_models::DispatchMessage;

use crate::error::QueueResult;

/// A dispatch message handed to one consumer.
///
/// The delivery stays pending until acked; an unacked delivery becomes
/// claimable by another consumer once it has been idle long enough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    pub message: DispatchMessage,
}

/// At-least-once queue of dispatch messages shared by all workers.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Publish one message; returns its queue id.
    async fn publish(&self, message: &DispatchMessage) -> QueueResult<String>;

    /// Take up to `count` new messages for `consumer`, waiting at most `block`.
    async fn consume(
        &self,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Remove a delivered message for good.
    async fn ack(&self, message_id: &str) -> QueueResult<()>;

    /// Reset the idle time of a delivery still held by `consumer`.
    ///
    /// Returns `false` once the delivery was acked or reclaimed elsewhere.
    async fn touch(&self, consumer: &str, message_id: &str) -> QueueResult<bool>;

    /// Take over up to `count` deliveries unacked for at least `min_idle`.
    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;
}
