//! Grid Server instances
//!
//! An instance is a managed handle on one deployed Grid Server. It carries
//! identity and port, the expiration and use count driving recycling, the
//! live resource limits, and hands out breaker-guarded RPC clients.
//!
//! `InstanceProvider` is what the job manager sees of deployment: create a
//! started instance, discover running ones, and report the current version.

pub mod container;
pub mod process;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grid_client::{
    CircuitBreaker, CircuitBreakerPolicy, GridServerRpc, GuardedRpc, HttpClient, SoapClient,
};
use grid_core::domain::job::GridServerResourceJob;
use grid_core::domain::resource::GridServerResource;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::deployer::DeployError;
use crate::net::TcpHealthCheck;

pub use container::{ContainerInstance, ContainerInstanceProvider};
pub use process::{ProcessInstance, ProcessInstanceProvider};

/// One running Grid Server
#[async_trait]
pub trait GridServerInstance: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn port(&self) -> u16;

    /// Version of the Grid Server build this instance runs
    fn version(&self) -> &str;

    /// Liveness as reported by the OS or container engine
    async fn has_exited(&self) -> bool;

    fn expiration_time(&self) -> DateTime<Utc>;

    fn set_expiration_time(&self, expiration: DateTime<Utc>);

    fn use_count(&self) -> u32;

    /// Increments the use count, returning the new value
    fn increment_use_count(&self) -> u32;

    /// Maximum cores, threads and memory granted to this instance
    fn limits(&self) -> GridServerResource;

    fn set_limits(&self, limits: GridServerResource);

    /// RPC client whose calls are bounded by `timeout`
    fn rpc(&self, timeout: Duration) -> Arc<dyn GridServerRpc>;

    /// Breaker shared by every RPC client of this instance
    fn circuit_breaker(&self) -> &CircuitBreaker;

    /// Probes the port until it accepts connections
    ///
    /// Fails fast on an exited instance unless `force` is set.
    async fn wait_for_service(&self, force: bool) -> bool;

    /// Whether `update_resource_limits` can take effect
    fn supports_resource_limits(&self) -> bool {
        true
    }

    /// Applies a new resource envelope to the running server
    async fn update_resource_limits(&self, job: &GridServerResourceJob) -> Result<(), DeployError>;

    /// Kills the underlying process or container
    async fn dispose(&self);
}

/// Readiness probe parameters shared by instances
#[derive(Debug, Clone, Copy)]
pub struct ReadinessSettings {
    pub attempts: u32,
    pub sleep_interval: Duration,
    pub connect_timeout: Duration,
}

/// State common to every instance kind
pub struct InstanceCore {
    id: String,
    name: String,
    port: u16,
    version: String,
    expiration: Mutex<DateTime<Utc>>,
    use_count: AtomicU32,
    limits: Mutex<GridServerResource>,
    http: HttpClient,
    policy: Arc<CircuitBreakerPolicy>,
    readiness: ReadinessSettings,
}

impl InstanceCore {
    /// Creates the shared state of an instance
    ///
    /// # Arguments
    /// * `id` - Stable identifier (pid or container id)
    /// * `name` - Display name (process name or container name)
    /// * `port` - Port the server listens on
    /// * `version` - Grid Server version
    /// * `limits` - Initial resource limits
    /// * `http` - Pipeline carrying RPC requests
    /// * `policy` - Breaker guarding calls to this instance
    /// * `readiness` - TCP probe parameters
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        port: u16,
        version: impl Into<String>,
        limits: GridServerResource,
        http: HttpClient,
        policy: Arc<CircuitBreakerPolicy>,
        readiness: ReadinessSettings,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            port,
            version: version.into(),
            expiration: Mutex::new(Utc::now()),
            use_count: AtomicU32::new(0),
            limits: Mutex::new(limits),
            http,
            policy,
            readiness,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn expiration_time(&self) -> DateTime<Utc> {
        *self.expiration.lock().unwrap()
    }

    pub fn set_expiration_time(&self, expiration: DateTime<Utc>) {
        *self.expiration.lock().unwrap() = expiration;
    }

    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Acquire)
    }

    pub fn increment_use_count(&self) -> u32 {
        self.use_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn limits(&self) -> GridServerResource {
        *self.limits.lock().unwrap()
    }

    pub fn set_limits(&self, limits: GridServerResource) {
        *self.limits.lock().unwrap() = limits;
    }

    pub fn policy(&self) -> &Arc<CircuitBreakerPolicy> {
        &self.policy
    }

    pub fn rpc(&self, timeout: Duration) -> Arc<dyn GridServerRpc> {
        let soap = SoapClient::for_port(self.port, self.http.clone(), timeout);
        Arc::new(GuardedRpc::new(Arc::new(soap), self.policy.clone()))
    }

    pub async fn probe(&self) -> bool {
        TcpHealthCheck::new(
            "127.0.0.1",
            self.port,
            self.readiness.attempts,
            self.readiness.sleep_interval,
            self.readiness.connect_timeout,
        )
        .is_alive()
        .await
    }
}

/// Source of started and recovered instances
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Deploys a new Grid Server and returns it once it accepts connections
    async fn create_instance(&self, version: &str) -> Result<Arc<dyn GridServerInstance>, DeployError>;

    /// Instances already running, e.g. left over from a previous arbiter run
    async fn discover_instances(&self) -> Result<Vec<Arc<dyn GridServerInstance>>, DeployError>;

    /// The Grid Server version new instances should run
    async fn latest_version(&self) -> Result<String, DeployError>;

    /// Prepares deployment of a new version; false rejects the change
    async fn on_version_change(&self, version: &str, is_startup: bool) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_client::CircuitBreakerSettings;

    fn core() -> InstanceCore {
        InstanceCore::new(
            "1234",
            "GridServer",
            45000,
            "2.0",
            GridServerResource::new(1.0, 4, 256),
            HttpClient::builder().build().unwrap(),
            Arc::new(CircuitBreakerPolicy::new(
                "GridServer:45000",
                CircuitBreakerSettings::default(),
            )),
            ReadinessSettings {
                attempts: 1,
                sleep_interval: Duration::from_millis(10),
                connect_timeout: Duration::from_millis(100),
            },
        )
    }

    #[test]
    fn test_use_count_and_limits() {
        let core = core();

        assert_eq!(core.use_count(), 0);
        assert_eq!(core.increment_use_count(), 1);
        assert_eq!(core.increment_use_count(), 2);

        core.set_limits(GridServerResource::new(2.0, 8, 512));
        assert_eq!(core.limits().threads, 8);
    }

    #[tokio::test]
    async fn test_rpc_fails_fast_once_instance_breaker_trips() {
        let core = core();
        let rpc = core.rpc(Duration::from_secs(1));

        core.policy().breaker().trip();

        let err = rpc.get_version().await.unwrap_err();
        assert!(err.is_circuit_breaker_open());
    }
}
