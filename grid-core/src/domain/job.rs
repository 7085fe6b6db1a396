//! Job domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::domain::resource::GridServerResource;

/// A logical unit of work bound to exactly one Grid Server instance
///
/// Equality and hashing consider the id only; the resource requirement
/// travels with the job so admission control can account for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub resources: GridServerResource,
}

impl Job {
    /// Creates a job with no resource requirement
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resources: GridServerResource::zero(),
        }
    }

    /// Creates a job with a freshly generated id
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// Sets the resources this job needs
    pub fn with_resources(mut self, resources: GridServerResource) -> Self {
        self.resources = resources;
        self
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl Hash for Job {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job(id = {})", self.id)
    }
}

/// Resource envelope of a container-hosted job
///
/// Used when discovering or updating a container's limits, independently of
/// script dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridServerResourceJob {
    pub id: String,
    pub game_id: Option<String>,
    pub container_id: Option<String>,
    /// CPU quota period in microseconds
    pub scheduler_cpu_period: i64,
    pub maximum_cores: f64,
    pub maximum_threads: i64,
    pub maximum_memory_in_megabytes: i64,
}

impl GridServerResourceJob {
    /// Envelope of `job`'s own resources; a zero period selects the
    /// deployer's default
    pub fn for_job(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            game_id: None,
            container_id: None,
            scheduler_cpu_period: 0,
            maximum_cores: job.resources.cores,
            maximum_threads: job.resources.threads,
            maximum_memory_in_megabytes: job.resources.memory_mb,
        }
    }

    /// The job this envelope describes
    pub fn job(&self) -> Job {
        Job::new(self.id.clone()).with_resources(self.resources())
    }

    pub fn resources(&self) -> GridServerResource {
        GridServerResource::new(
            self.maximum_cores,
            self.maximum_threads,
            self.maximum_memory_in_megabytes,
        )
    }
}

/// Why a job could not be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobRejectionReason {
    CpuAllocationExceeded,
    ThreadsAllocationExceeded,
    MemoryAllocationExceeded,
    NoReadyInstance,
    InstanceStartFailure,
    ReadinessTimeout,
}

impl JobRejectionReason {
    /// True for the three resource-ceiling rejections
    pub fn is_insufficient_resources(&self) -> bool {
        matches!(
            self,
            Self::CpuAllocationExceeded
                | Self::ThreadsAllocationExceeded
                | Self::MemoryAllocationExceeded
        )
    }
}

impl fmt::Display for JobRejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CpuAllocationExceeded => "cpu allocation exceeded",
            Self::ThreadsAllocationExceeded => "threads allocation exceeded",
            Self::MemoryAllocationExceeded => "memory allocation exceeded",
            Self::NoReadyInstance => "no ready instance",
            Self::InstanceStartFailure => "instance failed to start",
            Self::ReadinessTimeout => "timed out waiting for instance readiness",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_job_identity_is_id_only() {
        let a = Job::new("abc").with_resources(GridServerResource::new(1.0, 1, 1));
        let b = Job::new("abc");

        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_rejection_reason_classification() {
        assert!(JobRejectionReason::CpuAllocationExceeded.is_insufficient_resources());
        assert!(JobRejectionReason::MemoryAllocationExceeded.is_insufficient_resources());
        assert!(!JobRejectionReason::NoReadyInstance.is_insufficient_resources());
    }

    #[test]
    fn test_resource_job_projection() {
        let rj = GridServerResourceJob {
            id: "game-1".to_string(),
            game_id: Some("game-1".to_string()),
            container_id: None,
            scheduler_cpu_period: 100_000,
            maximum_cores: 2.0,
            maximum_threads: 8,
            maximum_memory_in_megabytes: 1024,
        };

        let job = rj.job();
        assert_eq!(job.id, "game-1");
        assert_eq!(job.resources, GridServerResource::new(2.0, 8, 1024));
    }

    #[test]
    fn test_envelope_for_job() {
        let job = Job::new("abc").with_resources(GridServerResource::new(1.5, 4, 256));
        let envelope = GridServerResourceJob::for_job(&job);

        assert_eq!(envelope.id, "abc");
        assert_eq!(envelope.scheduler_cpu_period, 0);
        assert_eq!(envelope.resources(), job.resources);
    }
}
