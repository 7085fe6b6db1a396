//! Resource allocation tracker
//!
//! Holds the pool-wide ceilings and the resources currently allocated to
//! active jobs. Checks run per kind in a fixed order: CPU, then threads, then
//! memory. A kind passes when nothing is needed, its check is disabled, or
//! `allocated + needed < total * ratio + 1e-5`.

use grid_core::domain::job::JobRejectionReason;
use grid_core::domain::resource::GridServerResource;
use serde::Serialize;

use crate::config::ResourceLimits;

const EQUALITY_THRESHOLD: f64 = 1e-5;

/// Ceilings plus the running allocation
#[derive(Debug, Clone)]
pub struct ResourceAllocationTracker {
    limits: ResourceLimits,
    allocated: GridServerResource,
}

/// JSON view of the tracker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAllocationReport {
    pub is_cpu_allocation_check_enabled: bool,
    pub is_threads_allocation_check_enabled: bool,
    pub is_memory_allocation_check_enabled: bool,
    pub cpu_over_allocation_ratio: f64,
    pub threads_over_allocation_ratio: f64,
    pub memory_over_allocation_ratio: f64,
    pub total_physical_cores: f64,
    pub allocated_physical_cores: f64,
    pub total_threads_allowed: i64,
    pub allocated_threads: i64,
    pub total_memory_in_megabytes: i64,
    pub allocated_memory_in_megabytes: i64,
}

impl ResourceAllocationTracker {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            allocated: GridServerResource::zero(),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn allocated(&self) -> GridServerResource {
        self.allocated
    }

    pub fn is_resource_allocation_check_enabled(&self) -> bool {
        self.limits.cpu_check_enabled
            || self.limits.threads_check_enabled
            || self.limits.memory_check_enabled
    }

    /// Checks `needed` against the remaining headroom
    pub fn is_resource_available(&self, needed: &GridServerResource) -> Result<(), JobRejectionReason> {
        if !self.is_resource_allocation_check_enabled() {
            return Ok(());
        }
        if !self.is_cpu_available(needed.cores) {
            return Err(JobRejectionReason::CpuAllocationExceeded);
        }
        if !self.is_threads_available(needed.threads) {
            return Err(JobRejectionReason::ThreadsAllocationExceeded);
        }
        if !self.is_memory_available(needed.memory_mb) {
            return Err(JobRejectionReason::MemoryAllocationExceeded);
        }
        Ok(())
    }

    pub fn allocate(&mut self, resource: &GridServerResource) {
        self.allocated += *resource;
    }

    /// Returns `resource` to the pool
    pub fn release(&mut self, resource: &GridServerResource) {
        self.allocated -= *resource;
        // Float residue from add/subtract cycles
        if self.allocated.cores.abs() < 1e-9 {
            self.allocated.cores = 0.0;
        }
    }

    pub fn report(&self) -> ResourceAllocationReport {
        ResourceAllocationReport {
            is_cpu_allocation_check_enabled: self.limits.cpu_check_enabled,
            is_threads_allocation_check_enabled: self.limits.threads_check_enabled,
            is_memory_allocation_check_enabled: self.limits.memory_check_enabled,
            cpu_over_allocation_ratio: self.limits.cpu_over_allocation_ratio,
            threads_over_allocation_ratio: self.limits.threads_over_allocation_ratio,
            memory_over_allocation_ratio: self.limits.memory_over_allocation_ratio,
            total_physical_cores: self.limits.total.cores,
            allocated_physical_cores: self.allocated.cores,
            total_threads_allowed: self.limits.total.threads,
            allocated_threads: self.allocated.threads,
            total_memory_in_megabytes: self.limits.total.memory_mb,
            allocated_memory_in_megabytes: self.allocated.memory_mb,
        }
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.report())
    }

    fn is_cpu_available(&self, needed: f64) -> bool {
        needed <= 0.0
            || !self.limits.cpu_check_enabled
            || self.allocated.cores + needed
                < self.limits.total.cores * self.limits.cpu_over_allocation_ratio + EQUALITY_THRESHOLD
    }

    fn is_threads_available(&self, needed: i64) -> bool {
        needed <= 0
            || !self.limits.threads_check_enabled
            || (self.allocated.threads.saturating_add(needed) as f64)
                < self.limits.total.threads as f64 * self.limits.threads_over_allocation_ratio
                    + EQUALITY_THRESHOLD
    }

    fn is_memory_available(&self, needed: i64) -> bool {
        needed <= 0
            || !self.limits.memory_check_enabled
            || (self.allocated.memory_mb.saturating_add(needed) as f64)
                < self.limits.total.memory_mb as f64 * self.limits.memory_over_allocation_ratio
                    + EQUALITY_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(cores: f64, threads: i64, memory_mb: i64) -> ResourceAllocationTracker {
        ResourceAllocationTracker::new(ResourceLimits {
            total: GridServerResource::new(cores, threads, memory_mb),
            ..ResourceLimits::default()
        })
    }

    #[test]
    fn test_exact_fit_is_admitted() {
        let mut tracker = tracker(2.0, 8, 1024);
        tracker.allocate(&GridServerResource::new(1.0, 4, 512));

        assert!(tracker.is_resource_available(&GridServerResource::new(1.0, 4, 512)).is_ok());
    }

    #[test]
    fn test_checks_run_cpu_then_threads_then_memory() {
        let mut tracker = tracker(2.0, 8, 1024);
        tracker.allocate(&GridServerResource::new(2.0, 8, 1024));

        let everything = GridServerResource::new(1.0, 1, 1);
        assert_eq!(
            tracker.is_resource_available(&everything),
            Err(JobRejectionReason::CpuAllocationExceeded)
        );
        assert_eq!(
            tracker.is_resource_available(&GridServerResource::new(0.0, 1, 1)),
            Err(JobRejectionReason::ThreadsAllocationExceeded)
        );
        assert_eq!(
            tracker.is_resource_available(&GridServerResource::new(0.0, 0, 1)),
            Err(JobRejectionReason::MemoryAllocationExceeded)
        );
        assert!(tracker.is_resource_available(&GridServerResource::zero()).is_ok());
    }

    #[test]
    fn test_disabled_check_and_over_allocation_ratio() {
        let mut tracker = ResourceAllocationTracker::new(ResourceLimits {
            total: GridServerResource::new(1.0, 4, 256),
            cpu_check_enabled: false,
            threads_over_allocation_ratio: 2.0,
            ..ResourceLimits::default()
        });
        tracker.allocate(&GridServerResource::new(5.0, 4, 0));

        assert!(tracker.is_resource_available(&GridServerResource::new(3.0, 3, 0)).is_ok());
        assert_eq!(
            tracker.is_resource_available(&GridServerResource::new(0.0, 5, 0)),
            Err(JobRejectionReason::ThreadsAllocationExceeded)
        );
    }

    #[test]
    fn test_all_checks_disabled_admits_anything() {
        let mut tracker = ResourceAllocationTracker::new(ResourceLimits {
            total: GridServerResource::new(1.0, 1, 1),
            cpu_check_enabled: false,
            threads_check_enabled: false,
            memory_check_enabled: false,
            ..ResourceLimits::default()
        });
        tracker.allocate(&GridServerResource::new(8.0, 8, 8));

        assert!(!tracker.is_resource_allocation_check_enabled());
        assert!(tracker.is_resource_available(&GridServerResource::new(8.0, 8, 8)).is_ok());
    }

    #[test]
    fn test_oversized_request_is_rejected_without_overflow() {
        let mut tracker = tracker(4.0, 64, 4096);
        tracker.allocate(&GridServerResource::new(1.0, 8, 512));

        assert_eq!(
            tracker.is_resource_available(&GridServerResource::new(0.0, i64::MAX, 0)),
            Err(JobRejectionReason::ThreadsAllocationExceeded)
        );
        assert_eq!(
            tracker.is_resource_available(&GridServerResource::new(0.0, 0, i64::MAX)),
            Err(JobRejectionReason::MemoryAllocationExceeded)
        );
        assert_eq!(
            tracker.is_resource_available(&GridServerResource::new(f64::INFINITY, 0, 0)),
            Err(JobRejectionReason::CpuAllocationExceeded)
        );
    }

    #[test]
    fn test_release_returns_to_zero() {
        let mut tracker = tracker(4.0, 8, 1024);
        let parts = [
            GridServerResource::new(0.1, 1, 10),
            GridServerResource::new(0.2, 2, 20),
            GridServerResource::new(0.7, 3, 30),
        ];

        for part in &parts {
            tracker.allocate(part);
        }
        for part in parts.iter().rev() {
            tracker.release(part);
        }

        assert!(tracker.allocated().is_zero());
        assert_eq!(tracker.allocated().cores, 0.0);
    }

    #[test]
    fn test_report_json() {
        let tracker = tracker(2.0, 8, 1024);
        let json: serde_json::Value = serde_json::from_str(&tracker.to_json_string().unwrap()).unwrap();

        assert_eq!(json["totalPhysicalCores"], 2.0);
        assert_eq!(json["allocatedThreads"], 0);
        assert_eq!(json["isCpuAllocationCheckEnabled"], true);
    }
}
