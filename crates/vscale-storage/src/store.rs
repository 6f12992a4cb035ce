//! Object store abstraction.

use std::path::Path;

use async_trait::async_trait;

use crate::error::StorageResult;

/// Durable, flat key/bytes store holding every artifact of a job.
///
/// Implementations bound each call with a timeout; failures are transient
/// from the caller's point of view unless `StorageError::is_retryable` says
/// otherwise.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous object.
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Fetch the object stored under `key`.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Remove the object under `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Upload a local file.
    async fn upload_file(&self, path: &Path, key: &str) -> StorageResult<()> {
        let data = tokio::fs::read(path).await?;
        self.put(key, data).await
    }

    /// Download an object into a local file, creating parent directories.
    async fn download_file(&self, key: &str, path: &Path) -> StorageResult<()> {
        let data = self.get(key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }
}
