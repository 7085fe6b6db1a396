//! Instance and resource API handlers

use axum::{Json, extract::State};
use grid_core::domain::job::GridServerResourceJob;
use std::sync::Arc;

use super::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::jobs::{InstanceSummary, ResourceAllocationReport};

/// GET /instances
pub async fn list_instances(State(state): State<Arc<AppState>>) -> Json<Vec<InstanceSummary>> {
    Json(state.jobs.list_instances())
}

/// POST /instances/update
/// Apply a new resource envelope to a job's container
pub async fn update_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GridServerResourceJob>,
) -> ApiResult<Json<serde_json::Value>> {
    req.resources()
        .validate()
        .map_err(|reason| ApiError::BadRequest(format!("Invalid resources: {}", reason)))?;

    if !state.jobs.update_grid_server_instance(&req).await {
        return Err(ApiError::BadRequest(format!(
            "Failed to update instance of job '{}'",
            req.id
        )));
    }
    Ok(Json(serde_json::json!({ "updated": req.id })))
}

/// GET /resources
pub async fn resources(State(state): State<Arc<AppState>>) -> Json<ResourceAllocationReport> {
    Json(state.jobs.resource_report())
}
