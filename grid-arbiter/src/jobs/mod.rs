//! Job management
//!
//! - `manager`: the job table, ready-instance pool and maintenance loops
//! - `tracker`: resource ceilings and admission checks

pub mod manager;
pub mod tracker;

use grid_client::ClientError;
use grid_core::domain::job::JobRejectionReason;
use thiserror::Error;

use crate::deployer::DeployError;

pub use manager::{ActiveJob, InstanceSummary, JobHandle, JobManager, JobManagerSettings};
pub use tracker::{ResourceAllocationReport, ResourceAllocationTracker};

/// Errors surfaced by the job manager
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job '{0}' already exists")]
    AlreadyExists(String),

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Instance of job '{0}' has exited")]
    InstanceExited(String),

    #[error("Job '{0}' has invalid resources: {1}")]
    InvalidResources(String, &'static str),

    #[error("Job rejected: {0}")]
    Rejected(JobRejectionReason),

    #[error(transparent)]
    Rpc(#[from] ClientError),

    #[error(transparent)]
    Instance(#[from] DeployError),
}

impl JobError {
    /// Rejections and id collisions are the caller's to handle; the rest are infrastructure
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            JobError::AlreadyExists(_) | JobError::InvalidResources(..) | JobError::Rejected(_)
        )
    }
}

/// Result type alias for job operations
pub type Result<T> = std::result::Result<T, JobError>;
