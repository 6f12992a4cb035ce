//! Bounded-concurrency consumer loop.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vscale_queue::{Delivery, DispatchQueue};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::worker::{ChunkWorker, WorkerOutcome};

/// Drains the dispatch queue with at most `max_concurrent_jobs` segments in
/// flight.
///
/// A message is acked only once the worker reports an outcome; errors leave
/// it pending so that this or another consumer picks it up again after the
/// visibility timeout. While a message is being handled its idle time is
/// reset every `keepalive_interval`, so only deliveries of dead consumers
/// are reclaimed.
pub struct JobExecutor {
    config: WorkerConfig,
    queue: Arc<dyn DispatchQueue>,
    worker: Arc<ChunkWorker>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    consumer_name: String,
}

impl JobExecutor {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn DispatchQueue>,
        worker: Arc<ChunkWorker>,
    ) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        Self {
            config,
            queue,
            worker,
            job_semaphore,
            shutdown,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Run until `shutdown` is called, then wait for in-flight segments.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting executor '{}' with {} max concurrent segments, transform '{}'",
            self.consumer_name,
            self.config.max_concurrent_jobs,
            self.worker.transform_name()
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let claim_task = self.spawn_claim_task();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_batch() => {
                    if let Err(e) = result {
                        error!("Error consuming dispatch messages: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();

        info!("Waiting for in-flight segments to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!(
                "Shutdown timeout reached with segments still running; they will be redelivered"
            );
        }

        info!("Executor stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Periodically take over deliveries left pending by dead consumers.
    fn spawn_claim_task(&self) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let worker = Arc::clone(&self.worker);
        let semaphore = Arc::clone(&self.job_semaphore);
        let consumer_name = self.consumer_name.clone();
        let keepalive = self.config.keepalive_interval();
        let interval = self.config.claim_interval;
        let min_idle = self.config.claim_min_idle;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let available = semaphore.available_permits();
                        if available == 0 {
                            continue;
                        }
                        match queue.claim_stale(&consumer_name, min_idle, available.min(5)).await {
                            Ok(deliveries) if !deliveries.is_empty() => {
                                info!("Claimed {} stale deliveries", deliveries.len());
                                counter!("vscale_deliveries_reclaimed_total")
                                    .increment(deliveries.len() as u64);
                                for delivery in deliveries {
                                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                                        break;
                                    };
                                    let worker = Arc::clone(&worker);
                                    let queue = Arc::clone(&queue);
                                    let consumer = consumer_name.clone();
                                    tokio::spawn(async move {
                                        let _permit = permit;
                                        Self::execute(worker, queue, consumer, keepalive, delivery)
                                            .await;
                                    });
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Failed to claim stale deliveries: {}", e),
                        }
                    }
                }
            }
        })
    }

    async fn consume_batch(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = self
            .queue
            .consume(&self.consumer_name, self.config.consume_block, available.min(5))
            .await?;
        if deliveries.is_empty() {
            return Ok(());
        }
        debug!("Consumed {} dispatch messages", deliveries.len());

        for delivery in deliveries {
            let permit = self
                .job_semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::config_error("job semaphore closed"))?;
            let worker = Arc::clone(&self.worker);
            let queue = Arc::clone(&self.queue);
            let consumer = self.consumer_name.clone();
            let keepalive = self.config.keepalive_interval();
            tokio::spawn(async move {
                let _permit = permit;
                Self::execute(worker, queue, consumer, keepalive, delivery).await;
            });
        }
        Ok(())
    }

    async fn execute(
        worker: Arc<ChunkWorker>,
        queue: Arc<dyn DispatchQueue>,
        consumer: String,
        keepalive: Duration,
        delivery: Delivery,
    ) {
        let Delivery {
            message_id,
            message,
        } = delivery;

        let handled = {
            let work = worker.handle(&message_id, &message);
            tokio::pin!(work);
            let mut ticker = tokio::time::interval(keepalive);
            ticker.tick().await;
            loop {
                tokio::select! {
                    result = &mut work => break result,
                    _ = ticker.tick() => {
                        match queue.touch(&consumer, &message_id).await {
                            Ok(true) => {}
                            Ok(false) => warn!(
                                job_id = %message.job_id,
                                message_id = %message_id,
                                "Delivery no longer held by this consumer"
                            ),
                            Err(e) => warn!(
                                job_id = %message.job_id,
                                message_id = %message_id,
                                "Failed to refresh delivery: {}", e
                            ),
                        }
                    }
                }
            }
        };

        match handled {
            Ok(outcome) => {
                if let Err(e) = queue.ack(&message_id).await {
                    // Redelivery finds the segment complete and acks then.
                    warn!(
                        job_id = %message.job_id,
                        message_id = %message_id,
                        "Failed to ack after {:?}: {}", outcome, e
                    );
                }
                if outcome == WorkerOutcome::Completed {
                    debug!(job_id = %message.job_id, segment = %message.segment_name, "Acked");
                }
            }
            Err(e) => {
                counter!("vscale_segment_failures_total", "kind" => e.kind()).increment(1);
                error!(
                    job_id = %message.job_id,
                    segment = %message.segment_name,
                    message_id = %message_id,
                    retryable = e.is_retryable(),
                    "Segment failed, leaving message for redelivery: {}", e
                );
            }
        }
    }

    async fn wait_for_jobs(&self) {
        while self.job_semaphore.available_permits() < self.config.max_concurrent_jobs {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::tests::fixture;
    use std::sync::atomic::Ordering;
    use vscale_firestore::JobStore;
    use vscale_models::DispatchMessage;
    use vscale_queue::MemoryDispatchQueue;

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            max_concurrent_jobs: 2,
            consume_block: Duration::from_millis(20),
            claim_interval: Duration::from_millis(20),
            claim_min_idle: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
            work_dir: std::env::temp_dir().join("vscale-executor-tests"),
            ..Default::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drains_queue_and_acks() {
        let f = fixture(4).await;
        let queue = Arc::new(MemoryDispatchQueue::new());
        for segment in &f.job.segments {
            queue
                .publish(&DispatchMessage::new(f.job.id.clone(), segment.name.clone()))
                .await
                .unwrap();
        }
        queue
            .publish(&DispatchMessage::new(
                vscale_models::JobId::from_string("gone"),
                "gone_00000000.mp4",
            ))
            .await
            .unwrap();

        let executor = Arc::new(JobExecutor::new(test_config(), queue.clone(), f.worker.clone()));
        let runner = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run().await })
        };

        let q = queue.clone();
        wait_until(move || q.acked().len() == 5).await;
        executor.shutdown();
        runner.await.unwrap().unwrap();

        let job = f.jobs.get_job(&f.job.id).await.unwrap().unwrap();
        assert!(job.all_segments_complete());
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(f.transform.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_long_transform_keeps_its_delivery() {
        let f = fixture(1).await;
        f.transform.delay_ms.store(400, Ordering::SeqCst);
        let queue = Arc::new(MemoryDispatchQueue::new());
        let id = queue
            .publish(&DispatchMessage::new(
                f.job.id.clone(),
                f.job.segments[0].name.clone(),
            ))
            .await
            .unwrap();

        // The transform runs several visibility timeouts long.
        let config = WorkerConfig {
            claim_min_idle: Duration::from_millis(90),
            ..test_config()
        };
        let executors = [
            Arc::new(JobExecutor::new(config.clone(), queue.clone(), f.worker.clone())),
            Arc::new(JobExecutor::new(config, queue.clone(), f.worker.clone())),
        ];
        let runners: Vec<_> = executors
            .iter()
            .map(|e| {
                let e = Arc::clone(e);
                tokio::spawn(async move { e.run().await })
            })
            .collect();

        let q = queue.clone();
        let acked_id = id.clone();
        wait_until(move || q.acked().contains(&acked_id)).await;
        for e in &executors {
            e.shutdown();
        }
        for r in runners {
            r.await.unwrap().unwrap();
        }

        assert_eq!(f.transform.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.acked(), vec![id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_segment_is_redelivered() {
        let f = fixture(1).await;
        f.transform.fail.store(true, Ordering::SeqCst);
        let queue = Arc::new(MemoryDispatchQueue::new());
        let id = queue
            .publish(&DispatchMessage::new(
                f.job.id.clone(),
                f.job.segments[0].name.clone(),
            ))
            .await
            .unwrap();

        let executor = Arc::new(JobExecutor::new(test_config(), queue.clone(), f.worker.clone()));
        let runner = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run().await })
        };

        // Failed at least once and is still pending.
        let transform = f.transform.clone();
        wait_until(move || transform.calls.load(Ordering::SeqCst) >= 1).await;
        assert!(queue.acked().is_empty());

        // Recovers through the stale-claim path once the transform works.
        f.transform.fail.store(false, Ordering::SeqCst);
        let q = queue.clone();
        let acked_id = id.clone();
        wait_until(move || q.acked().contains(&acked_id)).await;
        executor.shutdown();
        runner.await.unwrap().unwrap();

        let job = f.jobs.get_job(&f.job.id).await.unwrap().unwrap();
        assert!(job.all_segments_complete());
    }
}
