//! Segment worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vscale_firestore::{FirestoreClient, JobRepository};
use vscale_queue::DispatchStream;
use vscale_storage::S3Client;
use vscale_worker::{ChunkWorker, JobExecutor, WorkerConfig};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting vscale-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let executor = match build_executor(&config).await {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!("Failed to start worker: {:#}", e);
            std::process::exit(1);
        }
    };

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_executor.shutdown();
    });

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vscale=info,info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn build_executor(config: &WorkerConfig) -> anyhow::Result<JobExecutor> {
    if let Some(port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
            .install()
            .context("installing Prometheus exporter")?;
        info!("Serving metrics on port {}", port);
    }

    let storage = S3Client::from_env().context("configuring object storage")?;
    storage
        .check_connectivity()
        .await
        .context("checking storage bucket")?;
    let firestore = FirestoreClient::from_env().context("configuring Firestore")?;
    let queue = DispatchStream::from_env().context("configuring dispatch queue")?;
    queue.init().await.context("initializing consumer group")?;

    let config = config
        .clone()
        .with_visibility_timeout(queue.config().visibility_timeout);
    config.validate()?;
    info!(
        "Deliveries idle for {:?} are reclaimed, in-flight ones refreshed every {:?}",
        config.claim_min_idle,
        config.keepalive_interval()
    );

    let worker = ChunkWorker::from_config(
        &config,
        Arc::new(storage),
        Arc::new(JobRepository::new(firestore)),
    )?;

    Ok(JobExecutor::new(
        config,
        Arc::new(queue),
        Arc::new(worker),
    ))
}
