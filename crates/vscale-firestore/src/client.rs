//! Firestore REST API client.
//!
//! Thin typed wrapper over the documents endpoint with:
//! - Token caching with refresh margin, refreshed once on an expired-token 401
//! - Optimistic concurrency through `currentDocument.updateTime`
//! - Tracing spans and request metrics on every call

use std::sync::Arc;
use std::time::{Duration, Instant};

use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use tracing::{info_span, Instrument};

use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::record_request;
use crate::retry::RetryConfig;
use crate::token_cache::TokenCache;
use crate::types::{
    BatchWriteRequest, BatchWriteResponse, Document, Fields, ListDocumentsResponse, Write,
};

/// Firestore rejects batches above this size.
pub const MAX_BATCH_WRITES: usize = 500;

/// Firestore client configuration.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    /// GCP project ID
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    /// Request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Retry configuration
    pub retry: RetryConfig,
}

impl FirestoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        let project_id = std::env::var("GCP_PROJECT_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| FirestoreError::auth_error("GCP_PROJECT_ID must be set"))?;

        let connect_timeout_secs: u64 = std::env::var("FIRESTORE_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            project_id,
            database_id: std::env::var("FIRESTORE_DATABASE_ID")
                .unwrap_or_else(|_| "(default)".to_string()),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            retry: RetryConfig::from_env(),
        })
    }
}

/// Firestore REST API client.
#[derive(Clone)]
pub struct FirestoreClient {
    http: Client,
    config: FirestoreConfig,
    base_url: String,
    token_cache: Arc<TokenCache>,
}

impl FirestoreClient {
    /// Create a client using the service account in `GOOGLE_APPLICATION_CREDENTIALS`.
    pub fn new(config: FirestoreConfig) -> FirestoreResult<Self> {
        let service_account = CustomServiceAccount::from_env()
            .map_err(|e| FirestoreError::auth_error(format!("Failed to load service account: {}", e)))?
            .ok_or_else(|| FirestoreError::auth_error("GOOGLE_APPLICATION_CREDENTIALS not set"))?;
        Self::with_provider(config, Arc::new(service_account))
    }

    /// Create a client with an explicit token provider.
    pub fn with_provider(
        config: FirestoreConfig,
        auth: Arc<dyn TokenProvider>,
    ) -> FirestoreResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("vscale-firestore/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FirestoreError::Network)?;

        let base_url = format!(
            "https://firestore.googleapis.com/v1/projects/{}/databases/{}/documents",
            config.project_id, config.database_id
        );

        Ok(Self {
            http,
            config,
            base_url,
            token_cache: Arc::new(TokenCache::new(auth)),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        Self::new(FirestoreConfig::from_env()?)
    }

    fn document_path(&self, collection: &str, doc_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, urlencoding::encode(doc_id))
    }

    /// Full resource name, as batch writes expect it.
    pub fn full_document_name(&self, collection: &str, doc_id: &str) -> String {
        format!(
            "projects/{}/databases/{}/documents/{}/{}",
            self.config.project_id, self.config.database_id, collection, doc_id
        )
    }

    /// Get a document; `None` when it does not exist.
    pub async fn get_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> FirestoreResult<Option<Document>> {
        let url = self.document_path(collection, doc_id);

        self.execute_request("get_document", collection, Some(doc_id), async {
            let response = self.send(Method::GET, &url, None::<&()>).await?;
            match response.status() {
                StatusCode::OK => Ok(Some(response.json().await?)),
                StatusCode::NOT_FOUND => Ok(None),
                status => Err(error_from_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Create a document; fails with `AlreadyExists` if the id is taken.
    pub async fn create_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: Fields,
    ) -> FirestoreResult<Document> {
        let url = format!(
            "{}/{}?documentId={}",
            self.base_url,
            collection,
            urlencoding::encode(doc_id)
        );
        let body = Document::new(fields);

        self.execute_request("create_document", collection, Some(doc_id), async {
            let response = self.send(Method::POST, &url, Some(&body)).await?;
            match response.status() {
                StatusCode::OK | StatusCode::CREATED => Ok(response.json().await?),
                StatusCode::CONFLICT => Err(FirestoreError::AlreadyExists(format!(
                    "{}/{}",
                    collection, doc_id
                ))),
                status => Err(error_from_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Patch the masked fields of an existing document.
    ///
    /// With `update_time` set, the write only applies if the stored document
    /// still carries that update time; otherwise it fails with
    /// `PreconditionFailed`.
    pub async fn update_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: Fields,
        update_mask: &[&str],
        update_time: Option<&str>,
    ) -> FirestoreResult<Document> {
        let mut params: Vec<String> = update_mask
            .iter()
            .map(|f| format!("updateMask.fieldPaths={}", f))
            .collect();
        match update_time {
            Some(ts) => params.push(format!(
                "currentDocument.updateTime={}",
                urlencoding::encode(ts)
            )),
            None => params.push("currentDocument.exists=true".to_string()),
        }
        let url = format!(
            "{}?{}",
            self.document_path(collection, doc_id),
            params.join("&")
        );
        let body = Document::new(fields);
        let operation = if update_time.is_some() {
            "update_document_precondition"
        } else {
            "update_document"
        };

        self.execute_request(operation, collection, Some(doc_id), async {
            let response = self.send(Method::PATCH, &url, Some(&body)).await?;
            match response.status() {
                StatusCode::OK => Ok(response.json().await?),
                StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => {
                    let text = response.text().await.unwrap_or_default();
                    Err(FirestoreError::PreconditionFailed(text))
                }
                StatusCode::NOT_FOUND => Err(FirestoreError::not_found(format!(
                    "{}/{}",
                    collection, doc_id
                ))),
                StatusCode::BAD_REQUEST => {
                    // A stale updateTime is reported as 400 FAILED_PRECONDITION
                    let text = response.text().await.unwrap_or_default();
                    let err = FirestoreError::request_failed(format!("{} failed: {}", url, text));
                    if err.is_precondition_failed() {
                        Err(FirestoreError::PreconditionFailed(text))
                    } else {
                        Err(err)
                    }
                }
                status => Err(error_from_response(status, &url, response).await),
            }
        })
        .await
    }

    /// List one page of a (sub)collection.
    pub async fn list_documents(
        &self,
        collection: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> FirestoreResult<ListDocumentsResponse> {
        let mut url = format!("{}/{}?pageSize={}", self.base_url, collection, page_size);
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        self.execute_request("list_documents", collection, None, async {
            let response = self.send(Method::GET, &url, None::<&()>).await?;
            match response.status() {
                StatusCode::OK => Ok(response.json().await?),
                status => Err(error_from_response(status, &url, response).await),
            }
        })
        .await
    }

    /// List every document of a (sub)collection, following page tokens.
    pub async fn list_all_documents(&self, collection: &str) -> FirestoreResult<Vec<Document>> {
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .list_documents(collection, 300, page_token.as_deref())
                .await?;
            documents.extend(page.documents.unwrap_or_default());
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => return Ok(documents),
            }
        }
    }

    /// Apply up to `MAX_BATCH_WRITES` writes atomically.
    pub async fn batch_write(&self, writes: Vec<Write>) -> FirestoreResult<BatchWriteResponse> {
        if writes.is_empty() {
            return Ok(BatchWriteResponse::default());
        }
        if writes.len() > MAX_BATCH_WRITES {
            return Err(FirestoreError::request_failed(format!(
                "batch of {} writes exceeds the {} limit",
                writes.len(),
                MAX_BATCH_WRITES
            )));
        }

        let url = format!("{}:batchWrite", self.base_url);
        let request = BatchWriteRequest { writes };

        self.execute_request("batch_write", "batch", None, async {
            let response = self.send(Method::POST, &url, Some(&request)).await?;
            match response.status() {
                StatusCode::OK => {
                    let batch: BatchWriteResponse = response.json().await?;
                    batch.check_for_errors()?;
                    Ok(batch)
                }
                status => Err(error_from_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Execute with the configured retry policy.
    pub async fn with_retry<T, F, Fut>(&self, operation: &str, op: F) -> FirestoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = FirestoreResult<T>>,
    {
        crate::retry::with_retry(&self.config.retry, operation, op).await
    }

    /// Send an authorized request, refreshing the token once if it expired.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> FirestoreResult<Response> {
        let build = |token: &str| {
            let request = self.http.request(method.clone(), url).bearer_auth(token);
            match body {
                Some(b) => request.json(b),
                None => request,
            }
        };

        let token = self.token_cache.get_token().await?;
        let response = build(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        if !is_access_token_expired(&text) {
            return Err(FirestoreError::from_http_status(
                401,
                format!("{} failed: {}", url, text),
            ));
        }
        self.token_cache.invalidate().await;
        let token = self.token_cache.get_token().await?;
        Ok(build(&token).send().await?)
    }

    async fn execute_request<T, F>(
        &self,
        operation: &str,
        collection: &str,
        doc_id: Option<&str>,
        fut: F,
    ) -> FirestoreResult<T>
    where
        F: std::future::Future<Output = FirestoreResult<T>>,
    {
        let span = info_span!(
            "firestore_request",
            operation = %operation,
            collection = %collection,
            doc_id = doc_id.unwrap_or("")
        );

        let start = Instant::now();
        let result = fut.instrument(span).await;
        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status().unwrap_or(500),
        };
        record_request(operation, status, start.elapsed().as_millis() as f64);

        result
    }
}

fn is_access_token_expired(body: &str) -> bool {
    body.contains("ACCESS_TOKEN_EXPIRED") || body.contains("\"UNAUTHENTICATED\"")
}

async fn error_from_response(status: StatusCode, url: &str, response: Response) -> FirestoreError {
    let body = response.text().await.unwrap_or_default();
    FirestoreError::from_http_status(status.as_u16(), format!("{} failed: {}", url, body))
}
