//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::jobs::JobError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Gone(String),
    /// Admission refused the request
    Unavailable(String),
    /// The Grid Server failed the call
    BadGateway(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Gone(msg) => (StatusCode::GONE, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::BadGateway(msg) => {
                tracing::warn!("Grid Server error: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let message = err.to_string();
        match err {
            JobError::AlreadyExists(_) => ApiError::Conflict(message),
            JobError::NotFound(_) => ApiError::NotFound(message),
            JobError::InstanceExited(_) => ApiError::Gone(message),
            JobError::InvalidResources(..) => ApiError::BadRequest(message),
            JobError::Rejected(_) => ApiError::Unavailable(message),
            JobError::Rpc(_) => ApiError::BadGateway(message),
            JobError::Instance(_) => ApiError::InternalError(message),
        }
    }
}

impl From<grid_client::ClientError> for ApiError {
    fn from(err: grid_client::ClientError) -> Self {
        ApiError::BadGateway(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
