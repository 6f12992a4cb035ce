//! Axum HTTP API for the upscale pipeline.
//!
//! This crate provides:
//! - `POST /video/upscale` to submit a source video
//! - `GET /video/query/:id` to poll a job (and trigger its reassembly)
//! - Health and Prometheus endpoints

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
