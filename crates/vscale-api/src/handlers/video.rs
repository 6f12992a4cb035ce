//! Submit and query handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;
use vscale_models::{JobId, JobStatus, JobStatusView};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Body of an upscale request.
#[derive(Debug, Deserialize)]
pub struct UpscaleRequest {
    /// Object key of the source video
    pub id: String,
}

/// Query-string form of a status request.
#[derive(Debug, Deserialize)]
pub struct JobQuery {
    pub id: String,
}

/// Job state as reported to clients.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    /// Final artifact name, `"NONE"` until the job completes
    pub upscale_name: String,
}

impl From<JobStatusView> for JobResponse {
    fn from(view: JobStatusView) -> Self {
        Self {
            id: view.id,
            status: view.status,
            upscale_name: view.result_artifact,
        }
    }
}

/// Split the referenced video and dispatch its segments.
///
/// Responds once every segment is dispatched; the returned id is the handle
/// for status queries.
pub async fn upscale_video(
    State(state): State<AppState>,
    body: Result<Json<UpscaleRequest>, JsonRejection>,
) -> ApiResult<Json<JobResponse>> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let job_id = state.orchestrator.submit(request.id.trim()).await?;
    info!(job_id = %job_id, source = %request.id, "Accepted upscale request");

    Ok(Json(JobStatusView::in_progress(&job_id).into()))
}

/// Status of a job, reassembling it on the first query that finds every
/// segment processed.
pub async fn query_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    query(&state, id).await
}

/// `GET /video/query?id=...`
pub async fn query_video_by_param(
    State(state): State<AppState>,
    Query(params): Query<JobQuery>,
) -> ApiResult<Json<JobResponse>> {
    query(&state, params.id).await
}

async fn query(state: &AppState, id: String) -> ApiResult<Json<JobResponse>> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ApiError::bad_request("job id is required"));
    }
    let view = state.orchestrator.query(&JobId::from_string(id)).await?;
    Ok(Json(view.into()))
}
