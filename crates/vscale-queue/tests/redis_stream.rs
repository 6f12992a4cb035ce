//! Redis Streams integration tests.

use std::time::Duration;

use uuid::Uuid;
use vscale_models::{DispatchMessage, JobId};
use vscale_queue::{DispatchQueue, DispatchStream, QueueConfig};

/// Stream and group unique to one test run.
async fn scratch_stream() -> DispatchStream {
    dotenvy::dotenv().ok();
    let suffix = Uuid::new_v4();
    let config = QueueConfig {
        stream_name: format!("vscale:test:{}", suffix),
        consumer_group: format!("vscale:test-group:{}", suffix),
        ..QueueConfig::from_env()
    };
    let stream = DispatchStream::new(config).expect("Failed to create queue");
    stream.init().await.expect("Failed to initialize queue");
    stream
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_init_is_idempotent() {
    let stream = scratch_stream().await;
    stream.init().await.expect("Second init failed");
    assert_eq!(stream.len().await.expect("Failed to get length"), 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_publish_consume_ack() {
    let stream = scratch_stream().await;
    let message = DispatchMessage::new(JobId::new(), "seg_00000000.mp4");

    let id = stream.publish(&message).await.expect("Failed to publish");

    let deliveries = stream
        .consume("consumer-a", Duration::from_millis(500), 10)
        .await
        .expect("Failed to consume");
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].message_id, id);
    assert_eq!(deliveries[0].message, message);

    // Delivered but unacked entries are not handed out as new.
    let again = stream
        .consume("consumer-b", Duration::from_millis(100), 10)
        .await
        .expect("Failed to consume");
    assert!(again.is_empty());

    stream.ack(&id).await.expect("Failed to ack");
    let stale = stream
        .claim_stale("consumer-b", Duration::ZERO, 10)
        .await
        .expect("Failed to claim");
    assert!(stale.is_empty());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_unacked_delivery_is_reclaimed() {
    let stream = scratch_stream().await;
    let message = DispatchMessage::new(JobId::new(), "seg_00000001.mp4");
    let id = stream.publish(&message).await.expect("Failed to publish");

    stream
        .consume("crashed", Duration::from_millis(500), 1)
        .await
        .expect("Failed to consume");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let reclaimed = stream
        .claim_stale("survivor", Duration::from_millis(100), 10)
        .await
        .expect("Failed to claim");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].message_id, id);

    stream.ack(&id).await.expect("Failed to ack");
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_touched_delivery_stays_with_its_consumer() {
    let stream = scratch_stream().await;
    let message = DispatchMessage::new(JobId::new(), "seg_00000002.mp4");
    let id = stream.publish(&message).await.expect("Failed to publish");

    stream
        .consume("busy", Duration::from_millis(500), 1)
        .await
        .expect("Failed to consume");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(stream.touch("busy", &id).await.expect("Failed to touch"));
    let reclaimed = stream
        .claim_stale("other", Duration::from_millis(150), 10)
        .await
        .expect("Failed to claim");
    assert!(reclaimed.is_empty());
    assert!(!stream.touch("other", &id).await.expect("Failed to touch"));

    stream.ack(&id).await.expect("Failed to ack");
    assert!(!stream.touch("busy", &id).await.expect("Failed to touch"));
}
