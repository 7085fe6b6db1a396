//! Container deployer
//!
//! Grid Servers as Docker containers. All engine calls go through the narrow
//! `ContainerControl` interface; `DockerControl` is the production
//! implementation.

use async_trait::async_trait;
use grid_core::domain::job::GridServerResourceJob;
use grid_core::domain::resource::GridServerResource;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{DeployError, Result};
use crate::config::RegistryCredentials;
use crate::net::TcpHealthCheck;
use crate::ports::PortAllocator;

pub const PORT_LABEL: &str = "port";
pub const IMAGE_NAME_LABEL: &str = "image_name";
pub const VERSION_LABEL: &str = "grid_server_version";

/// CPU quota period used when a job does not specify one
pub const DEFAULT_CPU_PERIOD: i64 = 100_000;

const REMOVE_ATTEMPTS: u32 = 5;
const REMOVE_INITIAL_DELAY_MS: u64 = 100;
const REMOVE_MAX_DELAY_MS: u64 = 2_000;

/// CPU and memory limits of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerLimits {
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub memory_bytes: i64,
}

impl ContainerLimits {
    /// Limits for `resources`, with `cpu_quota = cores * cpu_period`
    pub fn from_resources(resources: &GridServerResource, cpu_period: i64) -> Self {
        let cpu_period = if cpu_period > 0 { cpu_period } else { DEFAULT_CPU_PERIOD };
        Self {
            cpu_period,
            cpu_quota: (resources.cores * cpu_period as f64).round() as i64,
            memory_bytes: resources.memory_mb.saturating_mul(1024 * 1024),
        }
    }

    /// Cores and memory expressed by these limits; threads are not a
    /// container limit and are taken from `threads`
    pub fn to_resources(&self, threads: i64) -> GridServerResource {
        let cores = if self.cpu_period > 0 {
            self.cpu_quota as f64 / self.cpu_period as f64
        } else {
            0.0
        };
        GridServerResource::new(cores, threads, self.memory_bytes / (1024 * 1024))
    }
}

/// What to create
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    /// Full image reference, `name:tag`
    pub image: String,
    pub port: u16,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub limits: ContainerLimits,
}

/// A running container as listed by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

impl ContainerInfo {
    pub fn port(&self) -> Option<u16> {
        self.labels.get(PORT_LABEL).and_then(|p| p.parse().ok())
    }

    pub fn version(&self) -> Option<&str> {
        self.labels.get(VERSION_LABEL).map(String::as_str)
    }
}

/// Narrow view of the container engine
#[async_trait]
pub trait ContainerControl: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str, credentials: Option<&RegistryCredentials>) -> Result<()>;

    /// Creates a stopped container, returning its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn update_limits(&self, id: &str, limits: &ContainerLimits) -> Result<()>;

    /// Running containers, optionally filtered by exact name, carrying every label in `labels`
    async fn list_running(
        &self,
        name: Option<&str>,
        labels: &[(&str, &str)],
    ) -> Result<Vec<ContainerInfo>>;

    async fn inspect_limits(&self, id: &str) -> Result<ContainerLimits>;

    async fn kill(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;
}

/// Settings of the container deployer
#[derive(Debug, Clone)]
pub struct ContainerDeployerSettings {
    pub image_name: String,
    pub credentials: Option<RegistryCredentials>,
    pub start_attempts: u32,
    pub sleep_interval: Duration,
    pub connect_timeout: Duration,
}

/// A started container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub version: String,
}

/// A container found running at discovery time
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredContainer {
    pub handle: ContainerHandle,
    pub limits: ContainerLimits,
}

/// Creates, updates and disposes Grid Server containers
pub struct ContainerDeployer {
    settings: ContainerDeployerSettings,
    control: Arc<dyn ContainerControl>,
    ports: Arc<PortAllocator>,
}

impl ContainerDeployer {
    pub fn new(
        settings: ContainerDeployerSettings,
        control: Arc<dyn ContainerControl>,
        ports: Arc<PortAllocator>,
    ) -> Self {
        Self {
            settings,
            control,
            ports,
        }
    }

    pub fn image(&self, version: &str) -> String {
        format!("{}:{}", self.settings.image_name, version)
    }

    /// Pulls the image for `version` unless it is already present
    pub async fn check_image(&self, version: &str) -> Result<()> {
        let image = self.image(version);

        if self.control.image_exists(&image).await? {
            debug!("CheckImage. Image {} is present", image);
            return Ok(());
        }

        info!("CheckImage. Image {} not found, pulling", image);
        self.control
            .pull_image(&image, self.settings.credentials.as_ref())
            .await?;

        if !self.control.image_exists(&image).await? {
            return Err(DeployError::ImageUnavailable(image));
        }

        Ok(())
    }

    /// Creates and starts a container, then waits for its port
    ///
    /// # Arguments
    /// * `port` - Port to bind; allocated when `None`
    /// * `resources` - Initial limits
    /// * `version` - Image tag to run
    pub async fn create_container(
        &self,
        port: Option<u16>,
        resources: &GridServerResource,
        version: &str,
    ) -> Result<ContainerHandle> {
        self.check_image(version).await?;

        let port = match port {
            Some(port) => port,
            None => self.ports.find_next_available_port()?,
        };

        let name = format!("grid-server-{}-gr", uuid::Uuid::new_v4());
        let labels = HashMap::from([
            (PORT_LABEL.to_string(), port.to_string()),
            (IMAGE_NAME_LABEL.to_string(), self.settings.image_name.clone()),
            (VERSION_LABEL.to_string(), version.to_string()),
        ]);

        let spec = ContainerSpec {
            name: name.clone(),
            image: self.image(version),
            port,
            env: vec![format!("PORT={}", port)],
            labels,
            limits: ContainerLimits::from_resources(resources, DEFAULT_CPU_PERIOD),
        };

        info!("CreateContainer. Creating {} from {} on port {}", name, spec.image, port);
        let id = self.control.create(&spec).await?;
        if let Err(e) = self.control.start(&id).await {
            warn!("CreateContainer. {} failed to start: {}", name, e);
            self.dispose(&id).await;
            return Err(e);
        }

        let health = TcpHealthCheck::new(
            "127.0.0.1",
            port,
            self.settings.start_attempts,
            self.settings.sleep_interval,
            self.settings.connect_timeout,
        );

        if !health.is_alive().await {
            warn!("CreateContainer. {} never accepted connections on port {}", name, port);
            self.dispose(&id).await;
            return Err(DeployError::NotReady {
                port,
                attempts: self.settings.start_attempts,
            });
        }

        Ok(ContainerHandle {
            id,
            name,
            port,
            version: version.to_string(),
        })
    }

    /// Applies a job's resource envelope to a running container
    pub async fn update_container(&self, id: &str, job: &GridServerResourceJob) -> Result<ContainerLimits> {
        let limits = ContainerLimits::from_resources(&job.resources(), job.scheduler_cpu_period);

        debug!(
            "UpdateContainer. {} cpu_period = {}, cpu_quota = {}, memory = {}",
            id, limits.cpu_period, limits.cpu_quota, limits.memory_bytes
        );
        self.control.update_limits(id, &limits).await?;

        Ok(limits)
    }

    /// Asks the engine whether the named container is still running
    pub async fn has_exited(&self, name: &str) -> bool {
        match self
            .control
            .list_running(Some(name), &[(IMAGE_NAME_LABEL, self.settings.image_name.as_str())])
            .await
        {
            Ok(running) => running.is_empty(),
            Err(e) => {
                warn!("HasExited. Could not list containers for {}: {}", name, e);
                false
            }
        }
    }

    /// Kills the container, then removes it with bounded retries
    pub async fn dispose(&self, id: &str) {
        if let Err(e) = self.control.kill(id).await {
            debug!("Dispose. Kill of {} failed (may already be stopped): {}", id, e);
        }

        let mut delay_ms = REMOVE_INITIAL_DELAY_MS;
        for attempt in 1..=REMOVE_ATTEMPTS {
            match self.control.remove(id).await {
                Ok(()) => {
                    debug!("Dispose. Removed container {}", id);
                    return;
                }
                Err(e) if attempt < REMOVE_ATTEMPTS => {
                    warn!(
                        "Dispose. Failed to remove {} (attempt {}/{}): {}",
                        id, attempt, REMOVE_ATTEMPTS, e
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(REMOVE_MAX_DELAY_MS);
                }
                Err(e) => {
                    error!("Dispose. Giving up removing {}: {}", id, e);
                }
            }
        }
    }

    /// Running Grid Server containers with their labels and limits
    pub async fn discover(&self) -> Result<Vec<DiscoveredContainer>> {
        let running = self
            .control
            .list_running(None, &[(IMAGE_NAME_LABEL, self.settings.image_name.as_str())])
            .await?;

        let mut discovered = Vec::with_capacity(running.len());
        for info in running {
            let Some(port) = info.port() else {
                warn!("Discover. Container {} has no port label, skipping", info.name);
                continue;
            };

            let limits = self.control.inspect_limits(&info.id).await?;
            discovered.push(DiscoveredContainer {
                handle: ContainerHandle {
                    version: info.version().unwrap_or_default().to_string(),
                    id: info.id,
                    name: info.name,
                    port,
                },
                limits,
            });
        }

        info!("Discover. Found {} running Grid Server containers", discovered.len());
        Ok(discovered)
    }

    /// Disposes every running Grid Server container
    pub async fn kill_all(&self) -> Result<usize> {
        let running = self
            .control
            .list_running(None, &[(IMAGE_NAME_LABEL, self.settings.image_name.as_str())])
            .await?;

        for info in &running {
            self.dispose(&info.id).await;
        }

        Ok(running.len())
    }
}
