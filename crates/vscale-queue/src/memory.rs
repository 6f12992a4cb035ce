//! In-memory dispatch queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use vscale_models::DispatchMessage;

use crate::error::{QueueError, QueueResult};
use crate::queue::{Delivery, DispatchQueue};

struct Pending {
    message: DispatchMessage,
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    ready: VecDeque<(String, DispatchMessage)>,
    pending: HashMap<String, Pending>,
    published: Vec<DispatchMessage>,
    acked: Vec<String>,
}

/// Process-local queue with consumer-group style delivery.
///
/// Consumed messages stay pending until acked and can be reclaimed with
/// `claim_stale`, matching the Redis Streams behaviour.
#[derive(Default)]
pub struct MemoryDispatchQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    unavailable: AtomicBool,
}

impl MemoryDispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make publish and consume fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every message ever published, in order.
    pub fn published(&self) -> Vec<DispatchMessage> {
        self.lock().published.clone()
    }

    /// Ids of acked messages, in ack order.
    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    /// Messages delivered but not yet acked.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Messages not yet delivered to anyone.
    pub fn ready_count(&self) -> usize {
        self.lock().ready.len()
    }

    /// How many times a pending message has been delivered.
    pub fn delivery_count(&self, message_id: &str) -> Option<u32> {
        self.lock().pending.get(message_id).map(|p| p.deliveries)
    }

    /// Consumer currently holding a pending message.
    pub fn holder(&self, message_id: &str) -> Option<String> {
        self.lock().pending.get(message_id).map(|p| p.consumer.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> QueueResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::connection_failed("memory queue offline"));
        }
        Ok(())
    }

    fn take_ready(&self, consumer: &str, count: usize) -> Vec<Delivery> {
        let mut inner = self.lock();
        let mut out = Vec::new();
        while out.len() < count {
            let Some((id, message)) = inner.ready.pop_front() else {
                break;
            };
            inner.pending.insert(
                id.clone(),
                Pending {
                    message: message.clone(),
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    deliveries: 1,
                },
            );
            out.push(Delivery {
                message_id: id,
                message,
            });
        }
        out
    }
}

#[async_trait]
impl DispatchQueue for MemoryDispatchQueue {
    async fn publish(&self, message: &DispatchMessage) -> QueueResult<String> {
        self.check_available()?;
        let id = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = format!("{}-0", inner.next_id);
            inner.ready.push_back((id.clone(), message.clone()));
            inner.published.push(message.clone());
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn consume(
        &self,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        self.check_available()?;
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.notify.notified();
            let batch = self.take_ready(consumer, count);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut inner = self.lock();
        if inner.pending.remove(message_id).is_some() {
            inner.acked.push(message_id.to_string());
        }
        Ok(())
    }

    async fn touch(&self, consumer: &str, message_id: &str) -> QueueResult<bool> {
        self.check_available()?;
        let mut inner = self.lock();
        match inner.pending.get_mut(message_id) {
            Some(p) if p.consumer == consumer => {
                p.delivered_at = Instant::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        self.check_available()?;
        let mut inner = self.lock();
        let now = Instant::now();

        let mut stale: Vec<&String> = inner
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| id)
            .collect();
        stale.sort();
        let ids: Vec<String> = stale.into_iter().take(count).cloned().collect();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = inner.pending.get_mut(&id) {
                p.consumer = consumer.to_string();
                p.delivered_at = now;
                p.deliveries += 1;
                out.push(Delivery {
                    message_id: id,
                    message: p.message.clone(),
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;
    use vscale_models::JobId;

    fn msg(segment: &str) -> DispatchMessage {
        DispatchMessage::new(JobId::from_string("j"), segment)
    }

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let queue = MemoryDispatchQueue::new();
        queue.publish(&msg("a.mp4")).await.unwrap();
        queue.publish(&msg("b.mp4")).await.unwrap();

        let batch = assert_ok!(queue.consume("w1", Duration::ZERO, 5).await);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].message.segment_name, "a.mp4");
        assert_eq!(queue.pending_count(), 2);
        assert_eq!(queue.ready_count(), 0);

        assert_ok!(queue.ack(&batch[0].message_id).await);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.acked(), vec![batch[0].message_id.clone()]);
    }

    #[tokio::test]
    async fn test_unacked_messages_are_reclaimed() {
        let queue = MemoryDispatchQueue::new();
        queue.publish(&msg("a.mp4")).await.unwrap();
        let first = queue.consume("w1", Duration::ZERO, 1).await.unwrap();

        // Not idle long enough yet
        let none = queue
            .claim_stale("w2", Duration::from_secs(60), 5)
            .await
            .unwrap();
        assert!(none.is_empty());

        let again = queue.claim_stale("w2", Duration::ZERO, 5).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message_id, first[0].message_id);
        assert_eq!(queue.delivery_count(&first[0].message_id), Some(2));
        assert_eq!(queue.holder(&first[0].message_id).as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_touch_keeps_delivery_from_being_reclaimed() {
        let queue = MemoryDispatchQueue::new();
        queue.publish(&msg("a.mp4")).await.unwrap();
        let batch = queue.consume("w1", Duration::ZERO, 1).await.unwrap();
        let id = &batch[0].message_id;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(assert_ok!(queue.touch("w1", id).await));
        let stolen = queue
            .claim_stale("w2", Duration::from_millis(30), 5)
            .await
            .unwrap();
        assert!(stolen.is_empty());
        assert_eq!(queue.holder(id).as_deref(), Some("w1"));

        // Only the holder can refresh it
        assert!(!assert_ok!(queue.touch("w2", id).await));
        queue.ack(id).await.unwrap();
        assert!(!assert_ok!(queue.touch("w1", id).await));
    }

    #[tokio::test]
    async fn test_consume_waits_for_publish() {
        let queue = std::sync::Arc::new(MemoryDispatchQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.consume("w1", Duration::from_secs(5), 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(&msg("late.mp4")).await.unwrap();

        let batch = consumer.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_consume_times_out_empty() {
        let queue = MemoryDispatchQueue::new();
        let batch = assert_ok!(queue.consume("w1", Duration::from_millis(10), 1).await);
        assert!(batch.is_empty());
    }
}
