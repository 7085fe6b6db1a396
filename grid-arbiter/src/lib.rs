//! Grid Arbiter
//!
//! Arbitrates jobs over a fleet of Grid Server processes or containers.
//!
//! - `config`: settings loaded from `GRID_*` environment variables
//! - `ports`: random port allocation with a reuse cooldown
//! - `net`: TCP health probe and the `/proc` listener table
//! - `deployer`: launching, discovering and killing processes and containers
//! - `instance`: managed handles on running Grid Servers
//! - `jobs`: the job manager and resource tracker
//! - `console`: operator commands read from stdin
//! - `api`: admin HTTP API

pub mod api;
pub mod config;
pub mod console;
pub mod deployer;
pub mod instance;
pub mod jobs;
pub mod net;
pub mod ports;

use anyhow::{Context, Result};
use grid_client::HttpClient;
use grid_core::metrics::CounterRegistry;
use grid_core::random::{Random, ThreadLocalRandom};
use grid_core::settings::{EnvSettingsProvider, SettingsProvider};
use std::sync::Arc;
use tracing::info;

use crate::config::{ArbiterConfig, DeploymentMode};
use crate::deployer::container::ContainerDeployerSettings;
use crate::deployer::{ContainerDeployer, DockerControl, ProcessDeployer, ProcessDeployerSettings};
use crate::instance::{
    ContainerInstanceProvider, InstanceProvider, ProcessInstanceProvider, ReadinessSettings,
};
use crate::jobs::{JobManager, JobManagerSettings};
use crate::ports::{PortAllocator, PortAllocatorSettings, ProcTcpTableProbe};

/// Prefix of live-tunable settings, e.g. `GRID_GRID_SERVER_VERSION`
pub const SETTINGS_PREFIX: &str = "GRID_";

/// The wired-up components of a running arbiter
pub struct Arbiter {
    pub jobs: Arc<JobManager>,
    pub ports: Arc<PortAllocator>,
    pub counters: Arc<dyn CounterRegistry>,
}

/// Builds the arbiter described by `config`
///
/// # Arguments
/// * `config` - Validated configuration
/// * `counters` - Metric sink shared by every component
///
/// # Returns
/// The components, not yet started; call `JobManager::start`
pub fn build(config: &ArbiterConfig, counters: Arc<dyn CounterRegistry>) -> Result<Arbiter> {
    let random: Arc<dyn Random> = Arc::new(ThreadLocalRandom);
    let settings: Arc<dyn SettingsProvider> = Arc::new(EnvSettingsProvider::new(SETTINGS_PREFIX));

    let ports = Arc::new(PortAllocator::new(
        PortAllocatorSettings {
            range: config.port_range.clone(),
            max_attempts: config.port_allocation_attempts,
            reuse_forbidden: config.port_reuse_forbidden,
        },
        Arc::new(ProcTcpTableProbe),
        random.clone(),
        counters.clone(),
    ));

    let http = HttpClient::builder()
        .with_logging()
        .with_metrics(counters.clone(), "GridServer")
        .build()
        .context("Failed to build Grid Server HTTP client")?;

    let readiness = ReadinessSettings {
        attempts: config.grid_server_start_attempts,
        sleep_interval: config.grid_server_wait_for_tcp_sleep_interval,
        connect_timeout: config.tcp_connect_timeout,
    };

    let provider: Arc<dyn InstanceProvider> = match config.mode {
        DeploymentMode::Process => {
            info!(
                "Deploying Grid Servers as processes of {}",
                config.executable_path.display()
            );
            let deployer = Arc::new(ProcessDeployer::new(
                ProcessDeployerSettings {
                    executable_path: config.executable_path.clone(),
                    argument_template: config.argument_template.clone(),
                    start_attempts: config.grid_server_start_attempts,
                    sleep_interval: config.grid_server_wait_for_tcp_sleep_interval,
                    connect_timeout: config.tcp_connect_timeout,
                },
                ports.clone(),
                random,
            ));
            Arc::new(ProcessInstanceProvider::new(
                deployer,
                http,
                config.breaker,
                readiness,
                settings,
                config.grid_server_version.clone(),
            ))
        }
        DeploymentMode::Container => {
            info!(
                "Deploying Grid Servers as containers of {} via {}",
                config.image_name, config.docker_socket
            );
            let control = DockerControl::connect(&config.docker_socket)
                .with_context(|| format!("Failed to connect to Docker at {}", config.docker_socket))?;
            let deployer = Arc::new(ContainerDeployer::new(
                ContainerDeployerSettings {
                    image_name: config.image_name.clone(),
                    credentials: config.registry_credentials.clone(),
                    start_attempts: config.grid_server_start_attempts,
                    sleep_interval: config.grid_server_wait_for_tcp_sleep_interval,
                    connect_timeout: config.tcp_connect_timeout,
                },
                Arc::new(control),
                ports.clone(),
            ));
            Arc::new(ContainerInstanceProvider::new(
                deployer,
                http,
                config.breaker,
                readiness,
                settings,
                config.grid_server_version.clone(),
            ))
        }
    };

    let jobs = Arc::new(JobManager::new(
        JobManagerSettings::from(config),
        provider,
        counters.clone(),
    ));

    Ok(Arbiter {
        jobs,
        ports,
        counters,
    })
}
