//! Process-hosted instances

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grid_client::{
    CircuitBreaker, CircuitBreakerPolicy, CircuitBreakerSettings, GridServerRpc, HttpClient,
};
use grid_core::domain::job::GridServerResourceJob;
use grid_core::domain::resource::GridServerResource;
use grid_core::settings::{SettingsProvider, SettingsProviderExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{GridServerInstance, InstanceCore, InstanceProvider, ReadinessSettings};
use crate::deployer::{DeployError, GridServerProcess, ProcessDeployer};

/// A Grid Server running as a local process
pub struct ProcessInstance {
    core: InstanceCore,
    process: Arc<GridServerProcess>,
    deployer: Arc<ProcessDeployer>,
}

impl ProcessInstance {
    pub fn new(core: InstanceCore, process: Arc<GridServerProcess>, deployer: Arc<ProcessDeployer>) -> Self {
        Self {
            core,
            process,
            deployer,
        }
    }

    pub fn pid(&self) -> i32 {
        self.process.pid()
    }
}

#[async_trait]
impl GridServerInstance for ProcessInstance {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn port(&self) -> u16 {
        self.core.port()
    }

    fn version(&self) -> &str {
        self.core.version()
    }

    async fn has_exited(&self) -> bool {
        !self.process.is_open()
    }

    fn expiration_time(&self) -> DateTime<Utc> {
        self.core.expiration_time()
    }

    fn set_expiration_time(&self, expiration: DateTime<Utc>) {
        self.core.set_expiration_time(expiration)
    }

    fn use_count(&self) -> u32 {
        self.core.use_count()
    }

    fn increment_use_count(&self) -> u32 {
        self.core.increment_use_count()
    }

    fn limits(&self) -> GridServerResource {
        self.core.limits()
    }

    fn set_limits(&self, limits: GridServerResource) {
        self.core.set_limits(limits)
    }

    fn rpc(&self, timeout: Duration) -> Arc<dyn GridServerRpc> {
        self.core.rpc(timeout)
    }

    fn circuit_breaker(&self) -> &CircuitBreaker {
        self.core.policy().breaker()
    }

    async fn wait_for_service(&self, force: bool) -> bool {
        if !force && !self.process.is_open() {
            return false;
        }
        self.core.probe().await
    }

    fn supports_resource_limits(&self) -> bool {
        false
    }

    async fn update_resource_limits(&self, _job: &GridServerResourceJob) -> Result<(), DeployError> {
        Err(DeployError::Unsupported(
            "resource limits of process instances cannot be changed".to_string(),
        ))
    }

    async fn dispose(&self) {
        if let Err(e) = self.deployer.kill(&self.process) {
            warn!("Dispose. Failed to kill process instance {}: {}", self.id(), e);
        }
    }
}

/// Deploys Grid Servers as local processes
pub struct ProcessInstanceProvider {
    deployer: Arc<ProcessDeployer>,
    http: HttpClient,
    breaker: CircuitBreakerSettings,
    readiness: ReadinessSettings,
    settings: Arc<dyn SettingsProvider>,
    default_version: String,
}

impl ProcessInstanceProvider {
    /// Creates a new process provider
    ///
    /// # Arguments
    /// * `deployer` - Launches and tracks the processes
    /// * `http` - Pipeline for RPC requests to instances
    /// * `breaker` - Settings of each instance's breaker
    /// * `readiness` - TCP probe parameters for recovered instances
    /// * `settings` - Live settings; `GridServerVersion` overrides `default_version`
    /// * `default_version` - Version reported when no setting is present
    pub fn new(
        deployer: Arc<ProcessDeployer>,
        http: HttpClient,
        breaker: CircuitBreakerSettings,
        readiness: ReadinessSettings,
        settings: Arc<dyn SettingsProvider>,
        default_version: impl Into<String>,
    ) -> Self {
        Self {
            deployer,
            http,
            breaker,
            readiness,
            settings,
            default_version: default_version.into(),
        }
    }

    fn wrap(&self, process: Arc<GridServerProcess>, version: &str) -> Arc<dyn GridServerInstance> {
        let name = format!("GridServer:{}", process.port());
        let core = InstanceCore::new(
            process.pid().to_string(),
            name.clone(),
            process.port(),
            version,
            GridServerResource::zero(),
            self.http.clone(),
            Arc::new(CircuitBreakerPolicy::new(name, self.breaker)),
            self.readiness,
        );
        Arc::new(ProcessInstance::new(core, process, self.deployer.clone()))
    }
}

#[async_trait]
impl InstanceProvider for ProcessInstanceProvider {
    async fn create_instance(&self, version: &str) -> Result<Arc<dyn GridServerInstance>, DeployError> {
        let process = self.deployer.create_process(None).await?;
        Ok(self.wrap(process, version))
    }

    async fn discover_instances(&self) -> Result<Vec<Arc<dyn GridServerInstance>>, DeployError> {
        // A discovered process cannot report its build, so it is assumed current
        let version = self.latest_version().await?;
        Ok(self
            .deployer
            .discover_processes()
            .into_iter()
            .map(|process| self.wrap(process, &version))
            .collect())
    }

    async fn latest_version(&self) -> Result<String, DeployError> {
        Ok(self
            .settings
            .get_or_default("GridServerVersion", self.default_version.clone()))
    }

    async fn on_version_change(&self, version: &str, is_startup: bool) -> bool {
        info!(
            "OnGridServerVersionChange. Process instances will run version {} (startup = {})",
            version, is_startup
        );
        true
    }
}
