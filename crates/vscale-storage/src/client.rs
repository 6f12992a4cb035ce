//! S3-compatible object store client.

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::store::ObjectStore;

/// Default per-operation timeout, matching the blob timeout large uploads need.
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Configuration for the S3 client.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 API endpoint (R2, GCS interoperability, MinIO); `None` uses AWS
    pub endpoint_url: Option<String>,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Bucket name
    pub bucket_name: String,
    /// Region ("auto" for R2)
    pub region: String,
    /// Bound on every put/get/delete
    pub timeout: Duration,
}

impl S3Config {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            endpoint_url: std::env::var("STORAGE_ENDPOINT_URL").ok().filter(|s| !s.is_empty()),
            access_key_id: std::env::var("STORAGE_ACCESS_KEY_ID")
                .map_err(|_| StorageError::config_error("STORAGE_ACCESS_KEY_ID not set"))?,
            secret_access_key: std::env::var("STORAGE_SECRET_ACCESS_KEY")
                .map_err(|_| StorageError::config_error("STORAGE_SECRET_ACCESS_KEY not set"))?,
            bucket_name: std::env::var("STORAGE_BUCKET")
                .map_err(|_| StorageError::config_error("Missing env var STORAGE_BUCKET"))?,
            region: std::env::var("STORAGE_REGION").unwrap_or_else(|_| "auto".to_string()),
            timeout: Duration::from_secs(
                std::env::var("STORAGE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
        })
    }
}

/// S3-compatible storage client.
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
    timeout: Duration,
}

impl S3Client {
    /// Create a new client from configuration.
    pub fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "vscale",
        );

        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket_name,
            timeout: config.timeout,
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self::new(S3Config::from_env()?))
    }

    /// Bucket this client writes to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Check connectivity by performing a head bucket operation.
    pub async fn check_connectivity(&self) -> StorageResult<()> {
        self.bounded("head_bucket", async {
            self.client
                .head_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map_err(|e| StorageError::config_error(format!("bucket check failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// Run one storage call under the configured timeout, recording metrics.
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                operation,
                secs: self.timeout.as_secs(),
            }),
        };

        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!("vscale_storage_requests_total", "operation" => operation, "outcome" => outcome)
            .increment(1);
        histogram!("vscale_storage_latency_seconds", "operation" => operation)
            .record(start.elapsed().as_secs_f64());

        result
    }

    async fn put_body(&self, key: &str, body: ByteStream) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(format!("{}: {}", key, e)))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        debug!("Uploading {} bytes to {}", data.len(), key);
        self.bounded("put", self.put_body(key, ByteStream::from(data)))
            .await
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        debug!("Downloading {}", key);
        self.bounded("get", async {
            let response = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    let missing = e
                        .as_service_error()
                        .map(|se| se.is_no_such_key())
                        .unwrap_or(false);
                    if missing {
                        StorageError::not_found(key)
                    } else {
                        StorageError::download_failed(format!("{}: {}", key, e))
                    }
                })?;

            let bytes = response
                .body
                .collect()
                .await
                .map_err(|e| StorageError::download_failed(e.to_string()))?
                .into_bytes()
                .to_vec();
            Ok(bytes)
        })
        .await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        debug!("Deleting {}", key);
        self.bounded("delete", async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| StorageError::delete_failed(format!("{}: {}", key, e)))?;
            Ok(())
        })
        .await
    }

    async fn upload_file(&self, path: &Path, key: &str) -> StorageResult<()> {
        self.bounded("upload_file", async {
            let body = ByteStream::from_path(path)
                .await
                .map_err(|e| StorageError::upload_failed(e.to_string()))?;
            self.put_body(key, body).await
        })
        .await?;
        info!("Uploaded {} to {}", path.display(), key);
        Ok(())
    }
}

/// Content type sent with an upload.
fn content_type_for(key: &str) -> &'static str {
    let lower = key.to_ascii_lowercase();
    if lower.ends_with(".mp4") {
        "video/mp4"
    } else if lower.ends_with(".aac") {
        "audio/aac"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_content_type() {
        assert_eq!(content_type_for("a_00000001.mp4"), "video/mp4");
        assert_eq!(content_type_for("A.MP4"), "video/mp4");
        assert_eq!(content_type_for("track.aac"), "audio/aac");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }

    #[test]
    #[serial]
    fn test_config_requires_bucket() {
        std::env::set_var("STORAGE_ACCESS_KEY_ID", "id");
        std::env::set_var("STORAGE_SECRET_ACCESS_KEY", "secret");
        std::env::remove_var("STORAGE_BUCKET");
        assert!(matches!(
            S3Config::from_env(),
            Err(StorageError::ConfigError(_))
        ));
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        std::env::set_var("STORAGE_ACCESS_KEY_ID", "id");
        std::env::set_var("STORAGE_SECRET_ACCESS_KEY", "secret");
        std::env::set_var("STORAGE_BUCKET", "videos");
        std::env::remove_var("STORAGE_TIMEOUT_SECS");
        std::env::remove_var("STORAGE_REGION");
        std::env::remove_var("STORAGE_ENDPOINT_URL");

        let config = S3Config::from_env().unwrap();
        assert_eq!(config.bucket_name, "videos");
        assert_eq!(config.region, "auto");
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(config.endpoint_url.is_none());
    }
}
