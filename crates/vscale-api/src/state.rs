//! Application state.

use std::sync::Arc;

use anyhow::Context;
use vscale_firestore::{FirestoreClient, JobRepository};
use vscale_orchestrator::{Orchestrator, OrchestratorConfig};
use vscale_queue::DispatchStream;
use vscale_storage::S3Client;

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: ApiConfig, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    /// Build state against the configured object store, Firestore and Redis.
    pub async fn from_env(config: ApiConfig) -> anyhow::Result<Self> {
        let storage = S3Client::from_env().context("configuring object storage")?;
        storage
            .check_connectivity()
            .await
            .context("checking storage bucket")?;
        let firestore = FirestoreClient::from_env().context("configuring Firestore")?;
        let queue = DispatchStream::from_env().context("configuring dispatch queue")?;
        queue.init().await.context("initializing consumer group")?;

        let orchestrator = Orchestrator::with_ffmpeg(
            OrchestratorConfig::from_env(),
            Arc::new(storage),
            Arc::new(JobRepository::new(firestore)),
            Arc::new(queue),
        );

        Ok(Self::new(config, Arc::new(orchestrator)))
    }
}
