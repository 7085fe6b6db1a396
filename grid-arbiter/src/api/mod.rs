//! API Module
//!
//! Admin HTTP API of the arbiter.
//! Each submodule handles endpoints for a specific area.

pub mod error;
pub mod health;
pub mod instances;
pub mod jobs;
pub mod metrics;

use axum::{
    Router,
    routing::{get, post},
};
use grid_core::metrics::CounterRegistry;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::jobs::JobManager;

/// Shared handler state
pub struct AppState {
    pub jobs: Arc<JobManager>,
    pub counters: Arc<dyn CounterRegistry>,
}

/// Create the main API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Job endpoints
        .route("/jobs", get(jobs::list_jobs).post(jobs::new_job))
        .route("/jobs/{id}", get(jobs::get_job).delete(jobs::close_job))
        .route("/jobs/{id}/renew", post(jobs::renew_lease))
        .route("/jobs/{id}/execute", post(jobs::execute))
        // Fleet endpoints
        .route("/instances", get(instances::list_instances))
        .route("/instances/update", post(instances::update_instance))
        .route("/resources", get(instances::resources))
        .route("/metrics", get(metrics::snapshot))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
