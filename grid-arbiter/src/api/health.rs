//! Health check handler

use axum::{Json, extract::State};
use serde_json::{Value, json};
use std::sync::Arc;

use super::AppState;

/// GET /health
/// Liveness plus the figures an operator looks at first
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "gridServerVersion": state.jobs.version(),
        "activeJobs": state.jobs.get_active_jobs_count(),
        "readyInstances": state.jobs.get_ready_instance_count(),
    }))
}
