//! Fakes shared by the job manager scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grid_arbiter::deployer::DeployError;
use grid_arbiter::instance::{GridServerInstance, InstanceProvider};
use grid_arbiter::jobs::{JobManager, JobManagerSettings};
use grid_client::{CircuitBreaker, CircuitBreakerSettings, ClientError, GridServerRpc};
use grid_core::domain::job::GridServerResourceJob;
use grid_core::domain::lua::{GridServerStatus, JobRecord, LuaValue, ScriptExecution};
use grid_core::domain::resource::GridServerResource;
use grid_core::metrics::InMemoryCounterRegistry;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// RPC
// ============================================================================

/// Records calls and fails the ones it is told to
#[derive(Default)]
pub struct FakeRpc {
    pub calls: Mutex<Vec<String>>,
    pub fail_close: AtomicBool,
    pub fail_renew: AtomicBool,
    pub fail_execute: AtomicBool,
    pub jobs: Mutex<Vec<JobRecord>>,
}

impl FakeRpc {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn outcome(flag: &AtomicBool, operation: &str) -> Result<(), ClientError> {
        if flag.load(Ordering::SeqCst) {
            Err(ClientError::soap_fault("soap:Server", format!("{} failed", operation)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl GridServerRpc for FakeRpc {
    async fn hello_world(&self) -> grid_client::Result<String> {
        self.record("HelloWorld".to_string());
        Ok("Hello World".to_string())
    }

    async fn get_version(&self) -> grid_client::Result<String> {
        self.record("GetVersion".to_string());
        Ok("1.0".to_string())
    }

    async fn get_status(&self) -> grid_client::Result<GridServerStatus> {
        Ok(GridServerStatus {
            version: "1.0".to_string(),
            environment_count: self.jobs.lock().unwrap().len() as i32,
        })
    }

    async fn open_job(&self, job: &JobRecord, _script: &ScriptExecution) -> grid_client::Result<Vec<LuaValue>> {
        self.record(format!("OpenJob:{}", job.id));
        Ok(Vec::new())
    }

    async fn renew_lease(&self, job_id: &str, expiration_in_seconds: f64) -> grid_client::Result<f64> {
        self.record(format!("RenewLease:{}:{}", job_id, expiration_in_seconds));
        Self::outcome(&self.fail_renew, "RenewLease")?;
        Ok(expiration_in_seconds)
    }

    async fn execute(&self, job_id: &str, script: &ScriptExecution) -> grid_client::Result<Vec<LuaValue>> {
        self.record(format!("Execute:{}", job_id));
        Self::outcome(&self.fail_execute, "Execute")?;
        Ok(vec![LuaValue::String(script.name.clone())])
    }

    async fn close_job(&self, job_id: &str) -> grid_client::Result<()> {
        self.record(format!("CloseJob:{}", job_id));
        Self::outcome(&self.fail_close, "CloseJob")
    }

    async fn batch_job(&self, job: &JobRecord, _script: &ScriptExecution) -> grid_client::Result<Vec<LuaValue>> {
        self.record(format!("BatchJob:{}", job.id));
        Ok(Vec::new())
    }

    async fn get_expiration(&self, _job_id: &str) -> grid_client::Result<f64> {
        Ok(0.0)
    }

    async fn get_all_jobs(&self) -> grid_client::Result<Vec<JobRecord>> {
        self.record("GetAllJobs".to_string());
        Ok(self.jobs.lock().unwrap().clone())
    }

    async fn close_expired_jobs(&self) -> grid_client::Result<i32> {
        Ok(0)
    }

    async fn close_all_jobs(&self) -> grid_client::Result<i32> {
        Ok(0)
    }

    async fn diag(&self, _diag_type: i32, _job_id: &str) -> grid_client::Result<Vec<LuaValue>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Instance
// ============================================================================

pub struct FakeInstance {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub version: String,
    pub rpc: Arc<FakeRpc>,
    pub exited: AtomicBool,
    pub reachable: AtomicBool,
    pub disposed: AtomicBool,
    pub fail_update: AtomicBool,
    expiration: Mutex<DateTime<Utc>>,
    use_count: AtomicU32,
    limits: Mutex<GridServerResource>,
    breaker: CircuitBreaker,
}

impl FakeInstance {
    pub fn new(port: u16, version: &str) -> Self {
        let name = format!("GridServer:{}", port);
        Self {
            id: port.to_string(),
            breaker: CircuitBreaker::new(name.clone(), CircuitBreakerSettings::default()),
            name,
            port,
            version: version.to_string(),
            rpc: Arc::new(FakeRpc::default()),
            exited: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            fail_update: AtomicBool::new(false),
            expiration: Mutex::new(Utc::now()),
            use_count: AtomicU32::new(0),
            limits: Mutex::new(GridServerResource::zero()),
        }
    }

    pub fn with_limits(self, limits: GridServerResource) -> Self {
        *self.limits.lock().unwrap() = limits;
        self
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GridServerInstance for FakeInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst) || self.is_disposed()
    }

    fn expiration_time(&self) -> DateTime<Utc> {
        *self.expiration.lock().unwrap()
    }

    fn set_expiration_time(&self, expiration: DateTime<Utc>) {
        *self.expiration.lock().unwrap() = expiration;
    }

    fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::SeqCst)
    }

    fn increment_use_count(&self) -> u32 {
        self.use_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn limits(&self) -> GridServerResource {
        *self.limits.lock().unwrap()
    }

    fn set_limits(&self, limits: GridServerResource) {
        *self.limits.lock().unwrap() = limits;
    }

    fn rpc(&self, _timeout: Duration) -> Arc<dyn GridServerRpc> {
        self.rpc.clone()
    }

    fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn wait_for_service(&self, force: bool) -> bool {
        if !force && self.exited.load(Ordering::SeqCst) {
            return false;
        }
        self.reachable.load(Ordering::SeqCst)
    }

    async fn update_resource_limits(&self, job: &GridServerResourceJob) -> Result<(), DeployError> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(DeployError::Container("update rejected".to_string()));
        }
        self.set_limits(job.resources());
        Ok(())
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Hands out `FakeInstance`s on consecutive ports
pub struct FakeProvider {
    pub version: Mutex<String>,
    pub created: Mutex<Vec<Arc<FakeInstance>>>,
    pub discovered: Mutex<Vec<Arc<FakeInstance>>>,
    pub fail_create: AtomicBool,
    pub unreachable_on_create: AtomicBool,
    pub fail_update_on_create: AtomicBool,
    next_port: AtomicUsize,
}

impl FakeProvider {
    pub fn new(version: &str) -> Self {
        Self {
            version: Mutex::new(version.to_string()),
            created: Mutex::new(Vec::new()),
            discovered: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            unreachable_on_create: AtomicBool::new(false),
            fail_update_on_create: AtomicBool::new(false),
            next_port: AtomicUsize::new(45000),
        }
    }

    pub fn set_version(&self, version: &str) {
        *self.version.lock().unwrap() = version.to_string();
    }

    /// The n-th instance created, in creation order
    pub fn created(&self, n: usize) -> Arc<FakeInstance> {
        self.created.lock().unwrap()[n].clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn add_discovered(&self, instance: FakeInstance) -> Arc<FakeInstance> {
        let instance = Arc::new(instance);
        self.discovered.lock().unwrap().push(instance.clone());
        instance
    }
}

#[async_trait]
impl InstanceProvider for FakeProvider {
    async fn create_instance(&self, version: &str) -> Result<Arc<dyn GridServerInstance>, DeployError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(DeployError::Launch("spawn failed".to_string()));
        }

        let port = self.next_port.fetch_add(1, Ordering::SeqCst) as u16;
        let instance = Arc::new(FakeInstance::new(port, version));
        if self.unreachable_on_create.load(Ordering::SeqCst) {
            instance.reachable.store(false, Ordering::SeqCst);
        }
        if self.fail_update_on_create.load(Ordering::SeqCst) {
            instance.fail_update.store(true, Ordering::SeqCst);
        }
        self.created.lock().unwrap().push(instance.clone());
        Ok(instance)
    }

    async fn discover_instances(&self) -> Result<Vec<Arc<dyn GridServerInstance>>, DeployError> {
        Ok(self
            .discovered
            .lock()
            .unwrap()
            .iter()
            .map(|instance| instance.clone() as Arc<dyn GridServerInstance>)
            .collect())
    }

    async fn latest_version(&self) -> Result<String, DeployError> {
        Ok(self.version.lock().unwrap().clone())
    }

    async fn on_version_change(&self, _version: &str, _is_startup: bool) -> bool {
        true
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub manager: Arc<JobManager>,
    pub provider: Arc<FakeProvider>,
    pub counters: Arc<InMemoryCounterRegistry>,
    pub token: CancellationToken,
}

impl Harness {
    /// A started manager on version 1.0
    pub async fn start(settings: JobManagerSettings) -> Self {
        Self::start_with(settings, Arc::new(FakeProvider::new("1.0"))).await
    }

    pub async fn start_with(settings: JobManagerSettings, provider: Arc<FakeProvider>) -> Self {
        let counters = Arc::new(InMemoryCounterRegistry::new());
        let manager = Arc::new(JobManager::new(settings, provider.clone(), counters.clone()));
        let token = CancellationToken::new();
        manager.start(token.clone()).await;

        Self {
            manager,
            provider,
            counters,
            token,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Ceilings of 4 cores, 64 threads and 4096 MB
pub fn settings() -> JobManagerSettings {
    let mut settings = JobManagerSettings::default();
    settings.resources.total = GridServerResource::new(4.0, 64, 4096);
    settings
}

/// Polls `condition` until it holds or a second has passed
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
