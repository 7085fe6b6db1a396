//! Container-hosted instances

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
use tracing::{error, info};

use super::{GridServerInstance, InstanceCore, InstanceProvider, ReadinessSettings};
use crate::deployer::DeployError;
use crate::deployer::container::{ContainerDeployer, ContainerHandle};

/// A Grid Server running in a Docker container
pub struct ContainerInstance {
    core: InstanceCore,
    container_id: String,
    deployer: Arc<ContainerDeployer>,
}

impl ContainerInstance {
    pub fn new(core: InstanceCore, container_id: impl Into<String>, deployer: Arc<ContainerDeployer>) -> Self {
        Self {
            core,
            container_id: container_id.into(),
            deployer,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }
}

#[async_trait]
impl GridServerInstance for ContainerInstance {
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

    /// Containers can die outside the arbiter, so the engine is asked every time
    async fn has_exited(&self) -> bool {
        self.deployer.has_exited(self.core.name()).await
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
        if !force && self.has_exited().await {
            return false;
        }
        self.core.probe().await
    }

    async fn update_resource_limits(&self, job: &GridServerResourceJob) -> Result<(), DeployError> {
        let limits = self.deployer.update_container(&self.container_id, job).await?;
        self.core
            .set_limits(limits.to_resources(job.maximum_threads));
        Ok(())
    }

    async fn dispose(&self) {
        self.deployer.dispose(&self.container_id).await;
    }
}

/// Deploys Grid Servers as Docker containers
pub struct ContainerInstanceProvider {
    deployer: Arc<ContainerDeployer>,
    http: HttpClient,
    breaker: CircuitBreakerSettings,
    readiness: ReadinessSettings,
    settings: Arc<dyn SettingsProvider>,
    default_version: String,
}

impl ContainerInstanceProvider {
    pub fn new(
        deployer: Arc<ContainerDeployer>,
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

    fn wrap(&self, handle: ContainerHandle, limits: GridServerResource) -> Arc<dyn GridServerInstance> {
        let core = InstanceCore::new(
            handle.id.clone(),
            handle.name.clone(),
            handle.port,
            handle.version,
            limits,
            self.http.clone(),
            Arc::new(CircuitBreakerPolicy::new(handle.name, self.breaker)),
            self.readiness,
        );
        Arc::new(ContainerInstance::new(core, handle.id, self.deployer.clone()))
    }
}

#[async_trait]
impl InstanceProvider for ContainerInstanceProvider {
    async fn create_instance(&self, version: &str) -> Result<Arc<dyn GridServerInstance>, DeployError> {
        let limits = GridServerResource::zero();
        let handle = self.deployer.create_container(None, &limits, version).await?;
        Ok(self.wrap(handle, limits))
    }

    async fn discover_instances(&self) -> Result<Vec<Arc<dyn GridServerInstance>>, DeployError> {
        Ok(self
            .deployer
            .discover()
            .await?
            .into_iter()
            .map(|found| {
                let limits = found.limits.to_resources(0);
                self.wrap(found.handle, limits)
            })
            .collect())
    }

    async fn latest_version(&self) -> Result<String, DeployError> {
        Ok(self
            .settings
            .get_or_default("GridServerVersion", self.default_version.clone()))
    }

    async fn on_version_change(&self, version: &str, is_startup: bool) -> bool {
        match self.deployer.check_image(version).await {
            Ok(()) => {
                info!(
                    "OnGridServerVersionChange. Image for version {} is ready (startup = {})",
                    version, is_startup
                );
                true
            }
            Err(e) => {
                error!("OnGridServerVersionChange. Cannot switch to version {}: {}", version, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployer::container::tests::FakeControl;
    use crate::deployer::container::{ContainerDeployerSettings, ContainerInfo, ContainerLimits};
    use crate::ports::{PortAllocator, PortAllocatorSettings, PortProbe};
    use grid_core::metrics::NoopCounterRegistry;
    use grid_core::random::SeededRandom;
    use grid_core::settings::MemorySettingsProvider;
    use std::collections::HashMap;

    struct NothingBound;

    impl PortProbe for NothingBound {
        fn is_port_in_use(&self, _port: u16) -> bool {
            false
        }
    }

    fn provider(control: Arc<FakeControl>, settings: Arc<MemorySettingsProvider>) -> ContainerInstanceProvider {
        let ports = Arc::new(PortAllocator::new(
            PortAllocatorSettings::default(),
            Arc::new(NothingBound),
            Arc::new(SeededRandom::new(5)),
            Arc::new(NoopCounterRegistry),
        ));
        let deployer = Arc::new(ContainerDeployer::new(
            ContainerDeployerSettings {
                image_name: "grid-server".to_string(),
                credentials: None,
                start_attempts: 1,
                sleep_interval: Duration::from_millis(10),
                connect_timeout: Duration::from_millis(100),
            },
            control,
            ports,
        ));

        ContainerInstanceProvider::new(
            deployer,
            HttpClient::builder().build().unwrap(),
            CircuitBreakerSettings::default(),
            ReadinessSettings {
                attempts: 1,
                sleep_interval: Duration::from_millis(10),
                connect_timeout: Duration::from_millis(100),
            },
            settings,
            "1.0",
        )
    }

    fn running(id: &str, name: &str, port: u16, version: &str) -> (ContainerInfo, ContainerLimits) {
        (
            ContainerInfo {
                id: id.to_string(),
                name: name.to_string(),
                labels: HashMap::from([
                    ("port".to_string(), port.to_string()),
                    ("image_name".to_string(), "grid-server".to_string()),
                    ("grid_server_version".to_string(), version.to_string()),
                ]),
            },
            ContainerLimits {
                cpu_period: 100_000,
                cpu_quota: 200_000,
                memory_bytes: 256 * 1024 * 1024,
            },
        )
    }

    #[tokio::test]
    async fn test_discovered_containers_become_instances() {
        let control = Arc::new(FakeControl::default());
        control
            .containers
            .lock()
            .unwrap()
            .push(running("c1", "grid-server-a-gr", 45010, "1.0"));

        let provider = provider(control.clone(), Arc::new(MemorySettingsProvider::new()));
        let instances = provider.discover_instances().await.unwrap();

        assert_eq!(instances.len(), 1);
        let instance = &instances[0];
        assert_eq!(instance.port(), 45010);
        assert_eq!(instance.version(), "1.0");
        assert_eq!(instance.limits().cores, 2.0);
        assert!(!instance.has_exited().await);

        control.containers.lock().unwrap().clear();
        assert!(instance.has_exited().await);
    }

    #[tokio::test]
    async fn test_update_resource_limits_applies_new_envelope() {
        let control = Arc::new(FakeControl::default());
        control
            .containers
            .lock()
            .unwrap()
            .push(running("c1", "grid-server-a-gr", 45010, "1.0"));

        let provider = provider(control, Arc::new(MemorySettingsProvider::new()));
        let instance = provider.discover_instances().await.unwrap().remove(0);

        let job = GridServerResourceJob {
            id: "job".to_string(),
            game_id: None,
            container_id: Some("c1".to_string()),
            scheduler_cpu_period: 100_000,
            maximum_cores: 0.5,
            maximum_threads: 16,
            maximum_memory_in_megabytes: 64,
        };
        instance.update_resource_limits(&job).await.unwrap();

        assert_eq!(instance.limits(), GridServerResource::new(0.5, 16, 64));
    }

    #[tokio::test]
    async fn test_version_from_settings() {
        let settings = Arc::new(MemorySettingsProvider::new());
        let provider = provider(Arc::new(FakeControl::default()), settings.clone());

        assert_eq!(provider.latest_version().await.unwrap(), "1.0");
        settings.set("GridServerVersion", "1.1");
        assert_eq!(provider.latest_version().await.unwrap(), "1.1");

        assert!(provider.on_version_change("1.1", false).await);
    }
}
