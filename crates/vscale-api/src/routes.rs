//! API routes.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::{health, query_video, query_video_by_param, upscale_video};
use crate::metrics::metrics_middleware;
use crate::middleware::{cors_layer, request_id, request_logging};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let video_routes = Router::new()
        .route("/video/upscale", post(upscale_video))
        .route("/video/upscale/", post(upscale_video))
        .route("/video/query", get(query_video_by_param))
        .route("/video/query/:id", get(query_video));

    let health_routes = Router::new().route("/health", get(health));

    let metrics_routes = match metrics_handle {
        Some(handle) => {
            Router::new().route("/metrics", get(move || async move { handle.render() }))
        }
        None => Router::new(),
    };

    Router::new()
        .merge(video_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(cors_layer(&state.config.cors_origins))
                .layer(middleware::from_fn(request_logging))
                .layer(middleware::from_fn(request_id))
                .layer(RequestBodyLimitLayer::new(state.config.max_body_size)),
        )
        .with_state(state)
}
