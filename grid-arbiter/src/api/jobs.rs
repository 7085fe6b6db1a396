//! Job API Handlers
//!
//! HTTP endpoints for the job lifecycle.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use grid_client::rpc;
use grid_core::domain::job::Job;
use grid_core::domain::lua::LuaValue;
use grid_core::domain::resource::GridServerResource;
use grid_core::dto::command::GridCommand;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::jobs::ActiveJob;

// =============================================================================
// Request / response bodies
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJobRequest {
    /// Generated when absent
    pub id: Option<String>,
    pub expiration_in_seconds: Option<u32>,
    #[serde(default)]
    pub resources: GridServerResource,
    #[serde(default = "default_true")]
    pub wait_for_ready_instance: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewLeaseRequest {
    pub expiration_in_seconds: u32,
}

#[derive(Debug, Deserialize)]
pub struct CloseJobQuery {
    #[serde(default)]
    pub recycle: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub script_type: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// A job and the instance serving it
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub resources: GridServerResource,
    pub instance_id: String,
    pub instance_name: String,
    pub port: u16,
    pub expiration_time: DateTime<Utc>,
}

impl From<&ActiveJob> for JobView {
    fn from(active: &ActiveJob) -> Self {
        Self {
            id: active.job.id.clone(),
            resources: active.job.resources,
            instance_id: active.instance.id().to_string(),
            instance_name: active.instance.name().to_string(),
            port: active.instance.port(),
            expiration_time: active.instance.expiration_time(),
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /jobs
/// Ids of jobs whose instance is running
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.jobs.get_all_running_job_ids().await)
}

/// POST /jobs
/// Create a job bound to a ready instance
pub async fn new_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewJobRequest>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    req.resources
        .validate()
        .map_err(|reason| ApiError::BadRequest(format!("Invalid resources: {}", reason)))?;

    let job = match req.id {
        Some(id) if id.trim().is_empty() => {
            return Err(ApiError::BadRequest("Job id must not be empty".to_string()));
        }
        Some(id) => Job::new(id),
        None => Job::generate(),
    }
    .with_resources(req.resources);

    let expiration = req
        .expiration_in_seconds
        .unwrap_or(state.jobs.settings().default_job_timeout.as_secs() as u32);

    let handle = state
        .jobs
        .new_job(&job, expiration, req.wait_for_ready_instance, true)
        .await?;

    let view = JobView::from(&ActiveJob {
        job,
        instance: handle.instance,
    });
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /jobs/{id}
/// Job details; 410 once its instance has exited
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    tracing::debug!("Getting job: {}", id);

    state.jobs.get_job(&Job::new(id.clone())).await?;
    let active = state
        .jobs
        .active_job(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Job '{}' not found", id)))?;

    Ok(Json(JobView::from(&active)))
}

/// POST /jobs/{id}/renew
pub async fn renew_lease(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RenewLeaseRequest>,
) -> ApiResult<StatusCode> {
    state
        .jobs
        .renew_lease(&Job::new(id), req.expiration_in_seconds)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /jobs/{id}
pub async fn close_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<CloseJobQuery>,
) -> ApiResult<StatusCode> {
    state.jobs.close_job(&Job::new(id), query.recycle).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /jobs/{id}/execute
/// Run an ExecuteScript command inside the job
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> ApiResult<Json<Vec<LuaValue>>> {
    let command = GridCommand::execute_script(req.script_type, req.arguments)
        .map_err(|e| ApiError::BadRequest(format!("Invalid command: {}", e)))?;

    let rpc_client = state.jobs.get_job(&Job::new(id.clone())).await?;
    let values = rpc::execute_command(rpc_client.as_ref(), &id, &command).await?;

    Ok(Json(values))
}
