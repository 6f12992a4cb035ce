//! Dispatch queue on Redis Streams.

use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tracing::{debug, info, warn};
use vscale_models::DispatchMessage;

use crate::error::{QueueError, QueueResult};
use crate::queue::{Delivery, DispatchQueue};

/// Stream field holding the JSON payload.
const PAYLOAD_FIELD: &str = "job";

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for dispatch messages
    pub stream_name: String,
    /// Consumer group shared by all workers
    pub consumer_group: String,
    /// How long a delivery may stay unacked before another worker reclaims it
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "vscale:segments".to_string(),
            consumer_group: "vscale:workers".to_string(),
            visibility_timeout: Duration::from_secs(600),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            visibility_timeout: std::env::var("QUEUE_VISIBILITY_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
        }
    }
}

/// Redis Streams dispatch queue using one consumer group.
pub struct DispatchStream {
    client: redis::Client,
    config: QueueConfig,
}

impl DispatchStream {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Create the stream and consumer group if they do not exist.
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }
        Ok(())
    }

    /// Number of entries currently in the stream.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = redis::cmd("XLEN")
            .arg(&self.config.stream_name)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    /// Decode stream entries, acking and dropping any that are malformed.
    async fn decode_entries(&self, entries: Vec<StreamId>) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            let decoded = match entry.map.get(PAYLOAD_FIELD) {
                Some(redis::Value::BulkString(payload)) => {
                    DispatchMessage::from_json(&String::from_utf8_lossy(payload))
                        .map_err(|e| e.to_string())
                }
                _ => Err(format!("missing '{}' field", PAYLOAD_FIELD)),
            };

            match decoded {
                Ok(message) => deliveries.push(Delivery {
                    message_id: entry.id,
                    message,
                }),
                Err(reason) => {
                    warn!(message_id = %entry.id, "Discarding malformed dispatch message: {}", reason);
                    if let Err(e) = self.ack(&entry.id).await {
                        warn!(message_id = %entry.id, "Failed to ack malformed message: {}", e);
                    }
                }
            }
        }
        deliveries
    }
}

#[async_trait]
impl DispatchQueue for DispatchStream {
    async fn publish(&self, message: &DispatchMessage) -> QueueResult<String> {
        let payload = message.to_json()?;
        let mut conn = self.connection().await?;

        let message_id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::publish_failed(e.to_string()))?;

        debug!(
            job_id = %message.job_id,
            segment = %message.segment_name,
            message_id = %message_id,
            "Published dispatch message"
        );
        Ok(message_id)
    }

    async fn consume(
        &self,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;

        // A nil reply (timeout) decodes to an empty StreamReadReply
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();
        Ok(self.decode_entries(entries).await)
    }

    async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Acknowledged dispatch message: {}", message_id);
        Ok(())
    }

    async fn touch(&self, consumer: &str, message_id: &str) -> QueueResult<bool> {
        let mut conn = self.connection().await?;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .arg(message_id)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        let held = pending
            .ids
            .first()
            .map(|p| p.consumer == consumer)
            .unwrap_or(false);
        if !held {
            return Ok(false);
        }

        // XCLAIM by the current owner with min-idle 0 only resets the idle time
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(0)
            .arg(message_id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;
        Ok(!claimed.is_empty())
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            cmd.arg(&entry.id);
        }
        let claimed: StreamClaimReply = cmd.query_async(&mut conn).await?;

        let deliveries = self.decode_entries(claimed.ids).await;
        if !deliveries.is_empty() {
            info!(consumer, count = deliveries.len(), "Reclaimed stale dispatch messages");
        }
        Ok(deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::remove_var("QUEUE_STREAM");
        std::env::set_var("QUEUE_VISIBILITY_TIMEOUT", "42");
        let config = QueueConfig::from_env();
        assert_eq!(config.stream_name, "vscale:segments");
        assert_eq!(config.visibility_timeout, Duration::from_secs(42));
        std::env::remove_var("QUEUE_VISIBILITY_TIMEOUT");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(DispatchStream::new(QueueConfig {
            redis_url: "not a url".into(),
            ..QueueConfig::default()
        })
        .is_err());
    }
}
