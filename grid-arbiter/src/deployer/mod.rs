//! Grid Server deployers
//!
//! Create, discover and kill the processes or containers hosting a Grid
//! Server. Creation reserves a port, launches the server bound to it, and
//! waits until the port accepts TCP connections.
//!
//! Deployers never retry a failed creation; the job manager decides.

pub mod container;
pub mod docker;
pub mod process;

use thiserror::Error;

use crate::ports::PortError;

pub use container::{
    ContainerControl, ContainerDeployer, ContainerInfo, ContainerLimits, ContainerSpec,
};
pub use docker::DockerControl;
pub use process::{GridServerProcess, ProcessDeployer, ProcessDeployerSettings};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Failed to launch Grid Server: {0}")]
    Launch(String),

    #[error("Grid Server on port {port} did not accept connections after {attempts} attempts")]
    NotReady { port: u16, attempts: u32 },

    #[error("Container control error: {0}")]
    Container(String),

    #[error("Grid Server image {0} is unavailable")]
    ImageUnavailable(String),

    #[error("Not supported: {0}")]
    Unsupported(String),
}

impl DeployError {
    /// True when the server launched but never became reachable
    pub fn is_readiness_failure(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;
