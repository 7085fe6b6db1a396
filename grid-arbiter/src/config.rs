//! Arbiter configuration
//!
//! Defines every tunable of the arbiter:
//! - How Grid Servers are deployed (plain processes or Docker containers)
//! - Port range and reuse cooldown for the port allocator
//! - Startup probing, pooling and recycling limits
//! - Pool-wide resource ceilings and breaker settings

use grid_client::CircuitBreakerSettings;
use grid_core::domain::resource::GridServerResource;
use std::net::SocketAddr;
use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How Grid Server instances are hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    Process,
    Container,
}

impl FromStr for DeploymentMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "container" | "docker" => Ok(Self::Container),
            other => anyhow::bail!("Unknown deployment mode: {}", other),
        }
    }
}

/// Credentials for pulling the Grid Server image
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub server_address: Option<String>,
}

/// Pool-wide resource ceilings
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub total: GridServerResource,
    pub cpu_check_enabled: bool,
    pub threads_check_enabled: bool,
    pub memory_check_enabled: bool,
    pub cpu_over_allocation_ratio: f64,
    pub threads_over_allocation_ratio: f64,
    pub memory_over_allocation_ratio: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            total: GridServerResource::new(8.0, 256, 16 * 1024),
            cpu_check_enabled: true,
            threads_check_enabled: true,
            memory_check_enabled: true,
            cpu_over_allocation_ratio: 1.0,
            threads_over_allocation_ratio: 1.0,
            memory_over_allocation_ratio: 1.0,
        }
    }
}

/// Arbiter configuration
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    pub mode: DeploymentMode,

    /// Grid Server executable, used in process mode
    pub executable_path: PathBuf,

    /// Command-line template; `{port}` is replaced with the allocated port
    pub argument_template: String,

    /// Image name without tag; the tag is the Grid Server version
    pub image_name: String,

    pub registry_credentials: Option<RegistryCredentials>,

    /// Docker engine socket (e.g., "/var/run/docker.sock")
    pub docker_socket: String,

    /// Version used until a settings provider reports another one
    pub grid_server_version: String,

    pub port_range: Range<u16>,
    pub port_allocation_attempts: u32,
    pub port_reuse_forbidden: Duration,

    pub grid_server_start_attempts: u32,
    pub grid_server_wait_for_tcp_sleep_interval: Duration,
    pub tcp_connect_timeout: Duration,

    pub max_instance_reuses: u32,
    pub ready_instances_to_keep_in_reserve: usize,
    pub max_grid_server_instances: Option<usize>,
    pub populate_ready_instance_workers: usize,

    pub resources: ResourceLimits,

    pub breaker: CircuitBreakerSettings,

    pub default_job_timeout: Duration,
    pub clear_expired_jobs_interval: Duration,
    pub expired_job_grace: Duration,
    pub version_check_interval: Duration,

    /// Admin API bind address
    pub bind_address: SocketAddr,
}

impl ArbiterConfig {
    /// Creates a configuration with defaults for the given mode
    pub fn new(mode: DeploymentMode) -> Self {
        Self {
            mode,
            executable_path: PathBuf::from("/opt/grid-server/GridServer"),
            argument_template: "{port} -Console".to_string(),
            image_name: "grid-server".to_string(),
            registry_credentials: None,
            docker_socket: "/var/run/docker.sock".to_string(),
            grid_server_version: "latest".to_string(),
            port_range: 45000..47000,
            port_allocation_attempts: 1000,
            port_reuse_forbidden: Duration::from_secs(30),
            grid_server_start_attempts: 50,
            grid_server_wait_for_tcp_sleep_interval: Duration::from_millis(100),
            tcp_connect_timeout: Duration::from_secs(1),
            max_instance_reuses: 1,
            ready_instances_to_keep_in_reserve: 0,
            max_grid_server_instances: None,
            populate_ready_instance_workers: 1,
            resources: ResourceLimits::default(),
            breaker: CircuitBreakerSettings::default(),
            default_job_timeout: Duration::from_secs(300),
            clear_expired_jobs_interval: Duration::from_secs(3),
            expired_job_grace: Duration::from_secs(5),
            version_check_interval: Duration::from_secs(10),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Every variable is optional and carries the `GRID_` prefix, e.g.:
    /// - GRID_MODE (process | container)
    /// - GRID_EXECUTABLE_PATH, GRID_ARGUMENT_TEMPLATE
    /// - GRID_IMAGE_NAME, GRID_DOCKER_SOCKET, GRID_VERSION
    /// - GRID_REGISTRY_USERNAME, GRID_REGISTRY_PASSWORD, GRID_REGISTRY_SERVER
    /// - GRID_PORT_RANGE_START, GRID_PORT_RANGE_END
    /// - GRID_MAX_INSTANCE_REUSES, GRID_READY_INSTANCES_IN_RESERVE, GRID_MAX_INSTANCES
    /// - GRID_TOTAL_CORES, GRID_TOTAL_THREADS, GRID_TOTAL_MEMORY_MB
    /// - GRID_BREAKER_FAILURES_ALLOWED, GRID_BREAKER_RETRY_INTERVAL (seconds)
    /// - GRID_BIND_ADDRESS
    ///
    /// Unset or unparsable values fall back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let mode = match env("MODE") {
            Some(value) => value.parse()?,
            None => DeploymentMode::Process,
        };

        let mut config = Self::new(mode);

        if let Some(path) = env("EXECUTABLE_PATH") {
            config.executable_path = PathBuf::from(path);
        }
        if let Some(template) = env("ARGUMENT_TEMPLATE") {
            config.argument_template = template;
        }
        if let Some(image) = env("IMAGE_NAME") {
            config.image_name = image;
        }
        if let Some(socket) = env("DOCKER_SOCKET") {
            config.docker_socket = socket;
        }
        if let Some(version) = env("VERSION") {
            config.grid_server_version = version;
        }

        if let (Some(username), Some(password)) = (env("REGISTRY_USERNAME"), env("REGISTRY_PASSWORD")) {
            config.registry_credentials = Some(RegistryCredentials {
                username,
                password,
                server_address: env("REGISTRY_SERVER"),
            });
        }

        let start = env_parse("PORT_RANGE_START").unwrap_or(config.port_range.start);
        let end = env_parse("PORT_RANGE_END").unwrap_or(config.port_range.end);
        config.port_range = start..end;

        config.port_allocation_attempts =
            env_parse("PORT_ALLOCATION_ATTEMPTS").unwrap_or(config.port_allocation_attempts);
        config.port_reuse_forbidden = env_secs("PORT_REUSE_FORBIDDEN").unwrap_or(config.port_reuse_forbidden);
        config.grid_server_start_attempts =
            env_parse("START_ATTEMPTS").unwrap_or(config.grid_server_start_attempts);
        config.grid_server_wait_for_tcp_sleep_interval = env_parse::<u64>("TCP_SLEEP_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(config.grid_server_wait_for_tcp_sleep_interval);

        config.max_instance_reuses = env_parse("MAX_INSTANCE_REUSES").unwrap_or(config.max_instance_reuses);
        config.ready_instances_to_keep_in_reserve =
            env_parse("READY_INSTANCES_IN_RESERVE").unwrap_or(config.ready_instances_to_keep_in_reserve);
        config.max_grid_server_instances = env_parse("MAX_INSTANCES").or(config.max_grid_server_instances);
        config.populate_ready_instance_workers =
            env_parse("POPULATE_WORKERS").unwrap_or(config.populate_ready_instance_workers);

        let total = &mut config.resources.total;
        total.cores = env_parse("TOTAL_CORES").unwrap_or(total.cores);
        total.threads = env_parse("TOTAL_THREADS").unwrap_or(total.threads);
        total.memory_mb = env_parse("TOTAL_MEMORY_MB").unwrap_or(total.memory_mb);

        config.breaker.failures_allowed_before_trip =
            env_parse("BREAKER_FAILURES_ALLOWED").unwrap_or(config.breaker.failures_allowed_before_trip);
        config.breaker.retry_interval = env_secs("BREAKER_RETRY_INTERVAL").unwrap_or(config.breaker.retry_interval);

        config.default_job_timeout = env_secs("DEFAULT_JOB_TIMEOUT").unwrap_or(config.default_job_timeout);

        if let Some(address) = env_parse("BIND_ADDRESS") {
            config.bind_address = address;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port_range.is_empty() {
            anyhow::bail!("port range cannot be empty");
        }

        if self.port_allocation_attempts == 0 {
            anyhow::bail!("port_allocation_attempts must be greater than 0");
        }

        if self.grid_server_start_attempts == 0 {
            anyhow::bail!("grid_server_start_attempts must be greater than 0");
        }

        if self.mode == DeploymentMode::Process && self.executable_path.as_os_str().is_empty() {
            anyhow::bail!("executable_path cannot be empty in process mode");
        }

        if self.mode == DeploymentMode::Container && self.image_name.is_empty() {
            anyhow::bail!("image_name cannot be empty in container mode");
        }

        if !self.argument_template.contains("{port}") {
            anyhow::bail!("argument_template must contain {{port}}");
        }

        if self.max_grid_server_instances == Some(0) {
            anyhow::bail!("max_grid_server_instances must be greater than 0 when set");
        }

        let ratios = [
            self.resources.cpu_over_allocation_ratio,
            self.resources.threads_over_allocation_ratio,
            self.resources.memory_over_allocation_ratio,
        ];
        if ratios.iter().any(|r| *r <= 0.0) {
            anyhow::bail!("over-allocation ratios must be positive");
        }

        if self.clear_expired_jobs_interval.is_zero() || self.version_check_interval.is_zero() {
            anyhow::bail!("background intervals must be greater than 0");
        }

        Ok(())
    }
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self::new(DeploymentMode::Process)
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(format!("GRID_{}", name))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env(name).and_then(|v| v.trim().parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ArbiterConfig::default();
        assert_eq!(config.mode, DeploymentMode::Process);
        assert_eq!(config.port_range, 45000..47000);
        assert_eq!(config.port_reuse_forbidden, Duration::from_secs(30));
        assert_eq!(config.max_instance_reuses, 1);
        assert_eq!(config.breaker.failures_allowed_before_trip, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ArbiterConfig::default();

        config.port_range = 45000..45000;
        assert!(config.validate().is_err());
        config.port_range = 45000..45010;

        config.argument_template = "-Console".to_string();
        assert!(config.validate().is_err());
        config.argument_template = "{port}".to_string();

        config.max_grid_server_instances = Some(0);
        assert!(config.validate().is_err());
        config.max_grid_server_instances = Some(4);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("Container".parse::<DeploymentMode>().unwrap(), DeploymentMode::Container);
        assert_eq!("process".parse::<DeploymentMode>().unwrap(), DeploymentMode::Process);
        assert!("vm".parse::<DeploymentMode>().is_err());
    }
}
