//! Job manager
//!
//! Binds jobs to Grid Server instances and keeps the fleet healthy:
//! - Admission control against the resource ceilings
//! - A stack of started, idle instances that `new_job` draws from
//! - Lease renewal and guaranteed cleanup on close
//! - Background loops for version tracking, pool population and expired jobs
//!
//! The job table is a concurrent map keyed by job id. Every insertion or
//! removal also happens under the ledger lock, which owns the allocated
//! resource counters and the ids of jobs still being created, so the
//! admission check and the increment that follows it are one step. Lock
//! order is ledger, then map shard. No I/O happens under either.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use grid_client::GridServerRpc;
use grid_core::domain::job::{GridServerResourceJob, Job, JobRejectionReason};
use grid_core::domain::resource::GridServerResource;
use grid_core::metrics::CounterRegistry;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::tracker::{ResourceAllocationReport, ResourceAllocationTracker};
use super::{JobError, Result};
use crate::config::{ArbiterConfig, ResourceLimits};
use crate::deployer::DeployError;
use crate::instance::{GridServerInstance, InstanceProvider};

/// Upper bound of the startup version read backoff
const VERSION_RETRY_MAX_MS: u64 = 10_000;

// ============================================================================
// Settings
// ============================================================================

/// Tuning of the job manager
#[derive(Debug, Clone)]
pub struct JobManagerSettings {
    /// Jobs an instance may serve before it is disposed
    pub max_instance_reuses: u32,

    /// Idle instances the populate workers keep started
    pub ready_instances_to_keep_in_reserve: usize,

    /// Ceiling on ready + active + starting instances
    pub max_grid_server_instances: Option<usize>,

    pub populate_ready_instance_workers: usize,

    /// RPC timeout when a job gives no expiration
    pub default_job_timeout: Duration,

    pub clear_expired_jobs_interval: Duration,

    /// How long past its expiration a job survives the sweeper
    pub expired_job_grace: Duration,

    pub version_check_interval: Duration,

    /// Lease given to jobs found running at startup
    pub recovered_job_lease: Duration,

    /// Timeout of the job query sent to recovered instances
    pub recovery_query_timeout: Duration,

    /// Idle sleep of populate workers
    pub populate_backoff: Duration,

    pub resources: ResourceLimits,
}

impl Default for JobManagerSettings {
    fn default() -> Self {
        Self {
            max_instance_reuses: 1,
            ready_instances_to_keep_in_reserve: 0,
            max_grid_server_instances: None,
            populate_ready_instance_workers: 1,
            default_job_timeout: Duration::from_secs(300),
            clear_expired_jobs_interval: Duration::from_secs(3),
            expired_job_grace: Duration::from_secs(5),
            version_check_interval: Duration::from_secs(10),
            recovered_job_lease: Duration::from_secs(300),
            recovery_query_timeout: Duration::from_secs(3),
            populate_backoff: Duration::from_millis(100),
            resources: ResourceLimits::default(),
        }
    }
}

impl From<&ArbiterConfig> for JobManagerSettings {
    fn from(config: &ArbiterConfig) -> Self {
        Self {
            max_instance_reuses: config.max_instance_reuses,
            ready_instances_to_keep_in_reserve: config.ready_instances_to_keep_in_reserve,
            max_grid_server_instances: config.max_grid_server_instances,
            populate_ready_instance_workers: config.populate_ready_instance_workers,
            default_job_timeout: config.default_job_timeout,
            clear_expired_jobs_interval: config.clear_expired_jobs_interval,
            expired_job_grace: config.expired_job_grace,
            version_check_interval: config.version_check_interval,
            resources: config.resources.clone(),
            ..Self::default()
        }
    }
}

// ============================================================================
// Job table entries
// ============================================================================

/// A job bound to its instance
#[derive(Clone)]
pub struct ActiveJob {
    pub job: Job,
    pub instance: Arc<dyn GridServerInstance>,
}

/// What `new_job` hands back to the caller
#[derive(Clone)]
pub struct JobHandle {
    pub rpc: Arc<dyn GridServerRpc>,
    pub instance: Arc<dyn GridServerInstance>,
}

/// Reporting view of one instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub version: String,
    /// None while the instance sits in the ready pool
    pub job_id: Option<String>,
    pub use_count: u32,
    pub expiration_time: DateTime<Utc>,
    pub limits: GridServerResource,
    pub breaker_tripped: bool,
    pub breaker_failures: u32,
}

impl InstanceSummary {
    fn new(instance: &dyn GridServerInstance, job_id: Option<String>) -> Self {
        let breaker = instance.circuit_breaker();
        Self {
            id: instance.id().to_string(),
            name: instance.name().to_string(),
            port: instance.port(),
            version: instance.version().to_string(),
            job_id,
            use_count: instance.use_count(),
            expiration_time: instance.expiration_time(),
            limits: instance.limits(),
            breaker_tripped: breaker.is_tripped(),
            breaker_failures: breaker.failure_count(),
        }
    }
}

struct Ledger {
    tracker: ResourceAllocationTracker,
    /// Jobs admitted but not yet bound
    pending: HashSet<String>,
}

// ============================================================================
// Guards
// ============================================================================

/// Admission of one job, undone on drop unless committed
struct Reservation<'a> {
    manager: &'a JobManager,
    job_id: String,
    resources: GridServerResource,
    accounted: bool,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, active: ActiveJob) {
        let mut ledger = self.manager.ledger.lock().unwrap();
        ledger.pending.remove(&self.job_id);
        if self.accounted {
            self.manager.active_jobs.insert(self.job_id.clone(), active);
        }
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut ledger = self.manager.ledger.lock().unwrap();
        ledger.pending.remove(&self.job_id);
        if self.accounted {
            ledger.tracker.release(&self.resources);
        }
    }
}

/// Counts an instance creation in flight
struct CreationGuard<'a>(&'a AtomicUsize);

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::zero())
}

// ============================================================================
// Manager
// ============================================================================

/// Arbitrates jobs over the Grid Server fleet
pub struct JobManager {
    settings: JobManagerSettings,
    provider: Arc<dyn InstanceProvider>,
    counters: Arc<dyn CounterRegistry>,
    active_jobs: DashMap<String, ActiveJob>,
    ledger: Mutex<Ledger>,
    ready_instances: Mutex<Vec<Arc<dyn GridServerInstance>>>,
    version: RwLock<String>,
    populate_lock: Mutex<()>,
    creations_in_flight: AtomicUsize,
    last_creation_failed: AtomicBool,
}

impl JobManager {
    /// Creates a new job manager
    ///
    /// # Arguments
    /// * `settings` - Pool, timing and resource ceiling settings
    /// * `provider` - Deploys, discovers and versions instances
    /// * `counters` - Metric sink
    ///
    /// # Returns
    /// A manager with an empty table; call `start` to recover instances and
    /// run the maintenance loops
    pub fn new(
        settings: JobManagerSettings,
        provider: Arc<dyn InstanceProvider>,
        counters: Arc<dyn CounterRegistry>,
    ) -> Self {
        let tracker = ResourceAllocationTracker::new(settings.resources.clone());
        Self {
            settings,
            provider,
            counters,
            active_jobs: DashMap::new(),
            ledger: Mutex::new(Ledger {
                tracker,
                pending: HashSet::new(),
            }),
            ready_instances: Mutex::new(Vec::new()),
            version: RwLock::new(String::new()),
            populate_lock: Mutex::new(()),
            creations_in_flight: AtomicUsize::new(0),
            last_creation_failed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &JobManagerSettings {
        &self.settings
    }

    /// Grid Server version new instances run; empty until first read
    pub fn version(&self) -> String {
        self.version.read().unwrap().clone()
    }

    // ------------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------------

    /// Creates a job and binds it to an instance
    ///
    /// # Arguments
    /// * `job` - The job; its id must not be active
    /// * `expiration_in_seconds` - Lease length, also the RPC timeout
    /// * `wait_for_ready_instance` - Probe the instance's port before returning
    /// * `add_to_active_jobs` - Record the binding and account its resources
    ///
    /// # Returns
    /// The instance and an RPC client bound to it, or the reason the job was
    /// refused. A refused job leaves the table and counters untouched.
    pub async fn new_job(
        &self,
        job: &Job,
        expiration_in_seconds: u32,
        wait_for_ready_instance: bool,
        add_to_active_jobs: bool,
    ) -> Result<JobHandle> {
        let started = Instant::now();
        info!(
            "NewJob. {}, expiration_in_seconds = {}, total active jobs = {}",
            job,
            expiration_in_seconds,
            self.active_jobs.len()
        );

        if let Err(reason) = job.resources.validate() {
            warn!("NewJob. {} refused: {}", job, reason);
            self.counters.increment("JobManager.NewJob.Rejected");
            return Err(JobError::InvalidResources(job.id.clone(), reason));
        }

        let reservation = self.reserve(job, add_to_active_jobs).inspect_err(|e| {
            warn!("NewJob. {} refused: {}", job, e);
            self.counters.increment("JobManager.NewJob.Rejected");
        })?;

        let instance = match self.acquire_instance().await {
            Ok(instance) => instance,
            Err(reason) => {
                warn!("NewJob. No instance for {}: {}", job, reason);
                self.counters.increment("JobManager.NewJob.Rejected");
                return Err(JobError::Rejected(reason));
            }
        };

        if wait_for_ready_instance && !instance.wait_for_service(false).await {
            error!(
                "NewJob. Instance {} did not become ready for {}",
                instance.name(),
                job
            );
            self.dispose_in_background(instance);
            self.counters.increment("JobManager.NewJob.Rejected");
            return Err(JobError::Rejected(JobRejectionReason::ReadinessTimeout));
        }

        if instance.supports_resource_limits() {
            let envelope = GridServerResourceJob::for_job(job);
            if let Err(e) = instance.update_resource_limits(&envelope).await {
                error!(
                    "NewJob. Could not apply limits of {} to {}: {}",
                    job,
                    instance.name(),
                    e
                );
                self.dispose_in_background(instance);
                self.counters.increment("JobManager.NewJob.Rejected");
                return Err(JobError::Rejected(JobRejectionReason::InstanceStartFailure));
            }
        }

        let lease = TimeDelta::seconds(i64::from(expiration_in_seconds));
        instance.set_expiration_time(Utc::now() + lease);

        reservation.commit(ActiveJob {
            job: job.clone(),
            instance: instance.clone(),
        });

        self.counters.increment("JobManager.NewJob.Success");
        self.counters.record_value(
            "JobManager.NewJob.TimeMs",
            started.elapsed().as_secs_f64() * 1000.0,
        );
        debug!("NewJob. {} bound to {}", job, instance.name());

        Ok(JobHandle {
            rpc: instance.rpc(self.rpc_timeout(expiration_in_seconds)),
            instance,
        })
    }

    /// Returns an RPC client for a running job
    ///
    /// A job whose instance has exited is removed from the table.
    pub async fn get_job(&self, job: &Job) -> Result<Arc<dyn GridServerRpc>> {
        let active = self
            .active_job(&job.id)
            .ok_or_else(|| JobError::NotFound(job.id.clone()))?;

        if active.instance.has_exited().await {
            warn!("GetJob. Instance {} of {} has exited", active.instance.name(), job);
            if let Some(removed) = self.evict_job(&job.id, active.instance.id()) {
                self.dispose_in_background(removed.instance);
            }
            return Err(JobError::InstanceExited(job.id.clone()));
        }

        Ok(active.instance.rpc(self.settings.default_job_timeout))
    }

    /// Extends a job's lease on the instance, then locally
    pub async fn renew_lease(&self, job: &Job, expiration_in_seconds: u32) -> Result<()> {
        let active = self
            .active_job(&job.id)
            .ok_or_else(|| JobError::NotFound(job.id.clone()))?;

        debug!(
            "RenewLease. {}, expiration_in_seconds = {}",
            job, expiration_in_seconds
        );

        active
            .instance
            .rpc(self.settings.default_job_timeout)
            .renew_lease(&job.id, f64::from(expiration_in_seconds))
            .await?;

        // A shorter renewal never pulls the lease in
        let renewed = Utc::now() + TimeDelta::seconds(i64::from(expiration_in_seconds));
        if renewed > active.instance.expiration_time() {
            active.instance.set_expiration_time(renewed);
        }
        Ok(())
    }

    /// Closes a job
    ///
    /// The instance is told first. Whatever it answers, the binding is
    /// removed and the job's resources are released; an RPC error is
    /// returned afterwards. Only a cleanly closed instance is recycled.
    pub async fn close_job(&self, job: &Job, attempt_to_recycle: bool) -> Result<()> {
        let Some(active) = self.active_job(&job.id) else {
            debug!("CloseJob. {} is not active", job);
            return Ok(());
        };

        info!(
            "CloseJob. {}, attempt_to_recycle = {}",
            job, attempt_to_recycle
        );

        let exited = active.instance.has_exited().await;
        let outcome = if exited {
            Ok(())
        } else {
            active
                .instance
                .rpc(self.settings.default_job_timeout)
                .close_job(&job.id)
                .await
        };

        if let Some(removed) = self.evict_job(&job.id, active.instance.id()) {
            let recycle = attempt_to_recycle && !exited && outcome.is_ok();
            self.release_instance(removed.instance, recycle).await;
        }
        self.counters.increment("JobManager.CloseJob");

        outcome.map_err(|e| {
            warn!("CloseJob. Grid Server failed to close {}: {}", job, e);
            self.counters.increment("JobManager.CloseJob.RpcFailure");
            JobError::Rpc(e)
        })
    }

    /// Checks whether `needed` fits under the resource ceilings
    pub fn is_resource_available(
        &self,
        needed: &GridServerResource,
    ) -> std::result::Result<(), JobRejectionReason> {
        self.ledger.lock().unwrap().tracker.is_resource_available(needed)
    }

    /// Sum of the resources of every active job
    pub fn get_allocated_resource(&self) -> GridServerResource {
        self.ledger.lock().unwrap().tracker.allocated()
    }

    pub fn resource_report(&self) -> ResourceAllocationReport {
        self.ledger.lock().unwrap().tracker.report()
    }

    /// Runs `action` against every job whose instance is alive
    ///
    /// Calls run concurrently and independently; a failing job is logged
    /// and reported in the results without affecting the others.
    pub async fn dispatch_request_to_all_active_jobs<T, F, Fut>(
        &self,
        action: F,
    ) -> Vec<(String, grid_client::Result<T>)>
    where
        F: Fn(String, Arc<dyn GridServerRpc>) -> Fut,
        Fut: Future<Output = grid_client::Result<T>>,
    {
        let mut calls = Vec::new();
        for active in self.active_jobs_snapshot() {
            if active.instance.has_exited().await {
                continue;
            }
            let job_id = active.job.id.clone();
            let call = action(
                job_id.clone(),
                active.instance.rpc(self.settings.default_job_timeout),
            );
            calls.push(async move { (job_id, call.await) });
        }

        let results = join_all(calls).await;
        for (job_id, result) in &results {
            if let Err(e) = result {
                warn!(
                    "DispatchRequestToAllActiveJobs. Request to {} failed: {}",
                    job_id, e
                );
            }
        }
        results
    }

    /// Ready plus active instances
    pub fn get_instance_count(&self) -> usize {
        self.get_ready_instance_count() + self.get_active_jobs_count()
    }

    pub fn get_ready_instance_count(&self) -> usize {
        self.ready_instances.lock().unwrap().len()
    }

    pub fn get_active_jobs_count(&self) -> usize {
        self.active_jobs.len()
    }

    /// Ids of active jobs whose instance is still running
    pub async fn get_all_running_job_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for active in self.active_jobs_snapshot() {
            if !active.instance.has_exited().await {
                ids.push(active.job.id);
            }
        }
        ids
    }

    /// Closes and returns the active jobs whose instance died
    pub async fn get_unexpected_exit_game_jobs(&self) -> Vec<Job> {
        let mut exited = Vec::new();
        for active in self.active_jobs_snapshot() {
            if active.instance.has_exited().await {
                exited.push(active);
            }
        }

        info!(
            "FindAndCloseExitedInstances. Found {} active jobs whose instances have exited",
            exited.len()
        );

        let mut jobs = Vec::with_capacity(exited.len());
        for active in exited {
            info!("FindAndCloseExitedInstances. Closing {}", active.job);
            if let Some(removed) = self.evict_job(&active.job.id, active.instance.id()) {
                self.dispose_in_background(removed.instance);
            }
            jobs.push(active.job);
        }
        jobs
    }

    /// Applies a new resource envelope to a job's instance
    ///
    /// # Returns
    /// false if the job is unknown or the update failed; on success the
    /// job's accounted resources follow the new envelope
    pub async fn update_grid_server_instance(&self, resource_job: &GridServerResourceJob) -> bool {
        if let Err(reason) = resource_job.resources().validate() {
            warn!(
                "UpdateGridServerInstance. Job {} has invalid resources: {}",
                resource_job.id, reason
            );
            return false;
        }

        let Some(active) = self.active_job(&resource_job.id) else {
            warn!("UpdateGridServerInstance. Job {} is not active", resource_job.id);
            return false;
        };

        if let Err(e) = active.instance.update_resource_limits(resource_job).await {
            error!(
                "UpdateGridServerInstance. Failed to update {} for job {}: {}",
                active.instance.name(),
                resource_job.id,
                e
            );
            return false;
        }

        let resources = resource_job.resources();
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(mut entry) = self.active_jobs.get_mut(&resource_job.id) {
            if entry.instance.id() == active.instance.id() {
                ledger.tracker.release(&entry.job.resources);
                ledger.tracker.allocate(&resources);
                entry.job.resources = resources;
            }
        }

        info!(
            "UpdateGridServerInstance. Job {} now limited to {:?}",
            resource_job.id, resources
        );
        true
    }

    /// Id of the instance bound to `job_id`
    pub fn get_grid_server_instance_id(&self, job_id: &str) -> Option<String> {
        self.active_jobs
            .get(job_id)
            .map(|entry| entry.instance.id().to_string())
    }

    /// Ready instances followed by bound ones
    pub fn list_instances(&self) -> Vec<InstanceSummary> {
        let ready = self.ready_instances.lock().unwrap().clone();
        let mut summaries: Vec<_> = ready
            .iter()
            .map(|instance| InstanceSummary::new(instance.as_ref(), None))
            .collect();
        summaries.extend(self.active_jobs_snapshot().into_iter().map(|active| {
            InstanceSummary::new(active.instance.as_ref(), Some(active.job.id))
        }));
        summaries
    }

    /// Active jobs ordered by id
    pub fn active_jobs_snapshot(&self) -> Vec<ActiveJob> {
        let mut jobs: Vec<ActiveJob> = self
            .active_jobs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.job.id.cmp(&b.job.id));
        jobs
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Reads the version, recovers running instances and spawns the loops
    ///
    /// # Returns
    /// Handles of the spawned loops; they stop when `token` is cancelled
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        info!("Starting JobManager");

        self.initialize_version(&token).await;
        if token.is_cancelled() {
            return Vec::new();
        }

        self.recover_running_instances().await;

        let mut handles = vec![self.spawn_version_check_loop(token.clone())];
        for worker in 0..self.settings.populate_ready_instance_workers {
            handles.push(self.spawn_populate_worker(worker, token.clone()));
        }
        handles.push(self.spawn_clear_expired_jobs_loop(token));
        handles
    }

    async fn initialize_version(&self, token: &CancellationToken) {
        let mut delay_ms = self.settings.populate_backoff.as_millis() as u64;

        loop {
            match self.read_grid_server_version(true).await {
                Ok(_) if !self.version().is_empty() => return,
                Ok(_) => warn!("Start. Startup Grid Server version was rejected"),
                Err(e) => error!("Start. Failed to read Grid Server version: {}", e),
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = time::sleep(Duration::from_millis(delay_ms)) => {}
            }
            delay_ms = (delay_ms * 2).clamp(1, VERSION_RETRY_MAX_MS);
        }
    }

    /// Picks up a new Grid Server version from the provider
    ///
    /// # Returns
    /// true if the version changed
    pub async fn read_grid_server_version(
        &self,
        is_startup: bool,
    ) -> std::result::Result<bool, DeployError> {
        let latest = self.provider.latest_version().await?;
        if latest == self.version() {
            return Ok(false);
        }

        if !self.provider.on_version_change(&latest, is_startup).await {
            warn!(
                "ReadGridServerVersion. Change to version {} rejected, staying on '{}'",
                latest,
                self.version()
            );
            return Ok(false);
        }

        let previous = std::mem::replace(&mut *self.version.write().unwrap(), latest.clone());
        info!(
            "ReadGridServerVersion. Grid Server version changed from '{}' to '{}'",
            previous, latest
        );

        self.kill_out_of_date_ready_instances();
        Ok(true)
    }

    /// Disposes ready instances running another version
    ///
    /// # Returns
    /// Number of instances disposed
    pub fn kill_out_of_date_ready_instances(&self) -> usize {
        let version = self.version();
        let stale: Vec<_> = {
            let mut ready = self.ready_instances.lock().unwrap();
            let (current, stale): (Vec<_>, Vec<_>) = std::mem::take(&mut *ready)
                .into_iter()
                .partition(|instance| instance.version() == version);
            *ready = current;
            stale
        };

        for instance in &stale {
            info!(
                "KillOutOfDateReadyInstances. Disposing {} (version {})",
                instance.name(),
                instance.version()
            );
            self.dispose_in_background(instance.clone());
        }
        stale.len()
    }

    /// Closes jobs whose instance exited or whose lease ran out
    ///
    /// # Returns
    /// Number of jobs closed
    pub async fn clear_expired_jobs(&self) -> usize {
        let cutoff = Utc::now() - to_delta(self.settings.expired_job_grace);
        let mut cleared = 0;

        for active in self.active_jobs_snapshot() {
            let exited = active.instance.has_exited().await;
            if !exited && active.instance.expiration_time() >= cutoff {
                continue;
            }

            info!(
                "ClearExpiredJobs. Closing {} (exited = {}, expired at {})",
                active.job,
                exited,
                active.instance.expiration_time()
            );
            if let Some(removed) = self.evict_job(&active.job.id, active.instance.id()) {
                self.dispose_in_background(removed.instance);
                cleared += 1;
            }
        }

        if cleared > 0 {
            self.counters.increment_by("JobManager.ExpiredJobs", cleared as u64);
        }
        cleared
    }

    /// Whether a populate worker should start another instance
    pub fn should_populate_ready_instance(&self) -> bool {
        let ready = self.get_ready_instance_count();
        let working = self.creations_in_flight.load(Ordering::Acquire);

        if ready + working >= self.settings.ready_instances_to_keep_in_reserve {
            return false;
        }
        self.below_instance_ceiling(ready, working)
    }

    /// Starts one instance into the ready pool if still needed
    pub async fn populate_ready_instance(&self) {
        let Some(_creation) = self.begin_creation(true) else {
            return;
        };

        let version = self.version();
        match self.provider.create_instance(&version).await {
            Ok(instance) => {
                debug!("PopulateReadyInstances. {} is ready", instance.name());
                self.counters.increment("JobManager.InstancesCreated");
                self.ready_instances.lock().unwrap().push(instance);
            }
            Err(e) => {
                error!("PopulateReadyInstances. Failed to create instance: {}", e);
                self.counters.increment("JobManager.InstanceCreationFailures");
                self.last_creation_failed.store(true, Ordering::Release);
            }
        }
    }

    /// Adopts instances left running by a previous arbiter
    ///
    /// Idle ones on the current version join the ready pool, ones serving a
    /// job are bound to it again, everything else is disposed.
    pub async fn recover_running_instances(&self) {
        let instances = match self.provider.discover_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                error!("RecoverRunningInstances. Discovery failed: {}", e);
                return;
            }
        };

        if instances.is_empty() {
            info!("RecoverRunningInstances. No running GridServer instances found");
            return;
        }
        info!(
            "RecoverRunningInstances. {} running GridServer instances found",
            instances.len()
        );

        join_all(
            instances
                .into_iter()
                .map(|instance| self.recover_instance(instance)),
        )
        .await;
    }

    async fn recover_instance(&self, instance: Arc<dyn GridServerInstance>) {
        if !instance.wait_for_service(true).await {
            warn!("RecoverRunningInstances. {} is not reachable", instance.name());
            self.dispose_in_background(instance);
            return;
        }

        let jobs = match instance
            .rpc(self.settings.recovery_query_timeout)
            .get_all_jobs()
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(
                    "RecoverRunningInstances. Failed to query jobs of {}: {}",
                    instance.name(),
                    e
                );
                self.dispose_in_background(instance);
                return;
            }
        };

        let Some(first) = jobs.first() else {
            if instance.version() == self.version() {
                info!("RecoverRunningInstances. {} added to ready pool", instance.name());
                self.ready_instances.lock().unwrap().push(instance);
            } else {
                info!(
                    "RecoverRunningInstances. {} runs version {}, disposing",
                    instance.name(),
                    instance.version()
                );
                self.dispose_in_background(instance);
            }
            return;
        };

        if Uuid::parse_str(&first.id).is_err() {
            info!(
                "RecoverRunningInstances. {} runs unmanaged job {}, disposing",
                instance.name(),
                first.id
            );
            self.dispose_in_background(instance);
            return;
        }

        let job = Job::new(first.id.clone()).with_resources(instance.limits());
        instance.set_expiration_time(Utc::now() + to_delta(self.settings.recovered_job_lease));

        let bound = {
            let mut ledger = self.ledger.lock().unwrap();
            if ledger.pending.contains(&job.id) || self.active_jobs.contains_key(&job.id) {
                false
            } else {
                ledger.tracker.allocate(&job.resources);
                self.active_jobs.insert(
                    job.id.clone(),
                    ActiveJob {
                        job: job.clone(),
                        instance: instance.clone(),
                    },
                );
                true
            }
        };

        if bound {
            info!("RecoverRunningInstances. {} recovered on {}", job, instance.name());
        } else {
            warn!(
                "RecoverRunningInstances. {} is already bound, disposing {}",
                job,
                instance.name()
            );
            self.dispose_in_background(instance);
        }
    }

    fn spawn_version_check_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = time::interval(manager.settings.version_check_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = manager.read_grid_server_version(false).await {
                    warn!("ReadGridServerVersion. Failed to read version: {}", e);
                }
            }
            debug!("Version check loop stopped");
        })
    }

    fn spawn_populate_worker(
        self: &Arc<Self>,
        worker: usize,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            debug!("PopulateReadyInstances. Worker {} started", worker);

            while !token.is_cancelled() {
                let failed = manager.last_creation_failed.swap(false, Ordering::AcqRel);
                if failed || !manager.should_populate_ready_instance() {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = time::sleep(manager.settings.populate_backoff) => {}
                    }
                    continue;
                }

                manager.populate_ready_instance().await;
            }
            debug!("PopulateReadyInstances. Worker {} stopped", worker);
        })
    }

    fn spawn_clear_expired_jobs_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = time::interval(manager.settings.clear_expired_jobs_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let cleared = manager.clear_expired_jobs().await;
                if cleared > 0 {
                    info!("ClearExpiredJobs. Closed {} job(s)", cleared);
                }
            }
            debug!("Clear expired jobs loop stopped");
        })
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// The binding of `job_id`, if active
    pub fn active_job(&self, job_id: &str) -> Option<ActiveJob> {
        self.active_jobs.get(job_id).map(|entry| entry.value().clone())
    }

    fn rpc_timeout(&self, expiration_in_seconds: u32) -> Duration {
        if expiration_in_seconds == 0 {
            self.settings.default_job_timeout
        } else {
            Duration::from_secs(u64::from(expiration_in_seconds))
        }
    }

    /// Claims the job id and, when accounted, its resources
    fn reserve(&self, job: &Job, accounted: bool) -> Result<Reservation<'_>> {
        let mut ledger = self.ledger.lock().unwrap();

        if ledger.pending.contains(&job.id) || self.active_jobs.contains_key(&job.id) {
            return Err(JobError::AlreadyExists(job.id.clone()));
        }
        ledger
            .tracker
            .is_resource_available(&job.resources)
            .map_err(JobError::Rejected)?;

        ledger.pending.insert(job.id.clone());
        if accounted {
            ledger.tracker.allocate(&job.resources);
        }

        Ok(Reservation {
            manager: self,
            job_id: job.id.clone(),
            resources: job.resources,
            accounted,
            committed: false,
        })
    }

    /// Removes a binding if `job_id` is still bound to `instance_id`
    fn evict_job(&self, job_id: &str, instance_id: &str) -> Option<ActiveJob> {
        let mut ledger = self.ledger.lock().unwrap();
        let (_, removed) = self
            .active_jobs
            .remove_if(job_id, |_, active| active.instance.id() == instance_id)?;
        ledger.tracker.release(&removed.job.resources);
        Some(removed)
    }

    /// Pops ready instances until one is current and alive
    async fn get_ready_instance(&self) -> Option<Arc<dyn GridServerInstance>> {
        loop {
            let instance = self.ready_instances.lock().unwrap().pop()?;

            if instance.version() != self.version() {
                info!(
                    "GetReadyInstance. {} runs version {}, disposing",
                    instance.name(),
                    instance.version()
                );
                self.dispose_in_background(instance);
                continue;
            }
            if instance.has_exited().await {
                warn!("GetReadyInstance. {} has exited", instance.name());
                self.dispose_in_background(instance);
                continue;
            }
            return Some(instance);
        }
    }

    async fn acquire_instance(
        &self,
    ) -> std::result::Result<Arc<dyn GridServerInstance>, JobRejectionReason> {
        if let Some(instance) = self.get_ready_instance().await {
            return Ok(instance);
        }

        let Some(_creation) = self.begin_creation(false) else {
            return Err(JobRejectionReason::NoReadyInstance);
        };

        let version = self.version();
        match self.provider.create_instance(&version).await {
            Ok(instance) => {
                self.counters.increment("JobManager.InstancesCreated");
                Ok(instance)
            }
            Err(e) => {
                error!("GetReadyInstance. Failed to create instance: {}", e);
                self.counters.increment("JobManager.InstanceCreationFailures");
                if e.is_readiness_failure() {
                    Err(JobRejectionReason::ReadinessTimeout)
                } else {
                    Err(JobRejectionReason::InstanceStartFailure)
                }
            }
        }
    }

    /// Counts a creation in flight if the fleet may grow
    fn begin_creation(&self, for_reserve: bool) -> Option<CreationGuard<'_>> {
        let _populate = self.populate_lock.lock().unwrap();

        let allowed = if for_reserve {
            self.should_populate_ready_instance()
        } else {
            self.below_instance_ceiling(
                self.get_ready_instance_count(),
                self.creations_in_flight.load(Ordering::Acquire),
            )
        };
        if !allowed {
            return None;
        }

        self.creations_in_flight.fetch_add(1, Ordering::AcqRel);
        Some(CreationGuard(&self.creations_in_flight))
    }

    fn below_instance_ceiling(&self, ready: usize, working: usize) -> bool {
        match self.settings.max_grid_server_instances {
            Some(max) => ready + self.active_jobs.len() + working < max,
            None => true,
        }
    }

    /// Returns a closed job's instance to the pool or disposes it
    async fn release_instance(
        &self,
        instance: Arc<dyn GridServerInstance>,
        attempt_to_recycle: bool,
    ) {
        if attempt_to_recycle && !instance.has_exited().await {
            let uses = instance.increment_use_count();
            if uses < self.settings.max_instance_reuses && instance.version() == self.version() {
                debug!("CloseJob. Recycling {} (use count {})", instance.name(), uses);
                self.counters.increment("JobManager.InstancesRecycled");
                self.ready_instances.lock().unwrap().push(instance);
                return;
            }
        }
        self.dispose_in_background(instance);
    }

    fn dispose_in_background(&self, instance: Arc<dyn GridServerInstance>) {
        tokio::spawn(async move {
            debug!("Disposing {}", instance.name());
            instance.dispose().await;
        });
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("version", &self.version())
            .field("active_jobs", &self.active_jobs.len())
            .field("ready_instances", &self.get_ready_instance_count())
            .finish()
    }
}
