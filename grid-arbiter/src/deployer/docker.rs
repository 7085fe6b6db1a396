//! Docker engine access over its Unix socket

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, UpdateContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::TryStreamExt;
use std::collections::HashMap;

use super::container::{ContainerControl, ContainerInfo, ContainerLimits, ContainerSpec};
use super::{DeployError, Result};
use crate::config::RegistryCredentials;

/// Engine request timeout in seconds
const DOCKER_TIMEOUT_SECS: u64 = 30;

fn docker_error(e: BollardError) -> DeployError {
    DeployError::Container(e.to_string())
}

/// `ContainerControl` backed by the Docker engine API
#[derive(Clone)]
pub struct DockerControl {
    docker: Docker,
}

impl DockerControl {
    /// Connects to the engine listening on `socket_path`
    pub fn connect(socket_path: &str) -> Result<Self> {
        let docker = Docker::connect_with_unix(
            socket_path,
            DOCKER_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(docker_error)?;

        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerControl for DockerControl {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(docker_error(e)),
        }
    }

    async fn pull_image(&self, image: &str, credentials: Option<&RegistryCredentials>) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let credentials = credentials.map(|c| DockerCredentials {
            username: Some(c.username.clone()),
            password: Some(c.password.clone()),
            serveraddress: c.server_address.clone(),
            ..Default::default()
        });

        self.docker
            .create_image(Some(options), None, credentials)
            .try_collect::<Vec<_>>()
            .await
            .map_err(docker_error)?;

        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        // Host networking keeps the server reachable on 127.0.0.1:{port}
        let host_config = HostConfig {
            network_mode: Some("host".to_string()),
            cpu_period: Some(spec.limits.cpu_period),
            cpu_quota: Some(spec.limits.cpu_quota),
            memory: (spec.limits.memory_bytes > 0).then_some(spec.limits.memory_bytes),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(docker_error)?;

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(docker_error)
    }

    async fn update_limits(&self, id: &str, limits: &ContainerLimits) -> Result<()> {
        let memory = (limits.memory_bytes > 0).then_some(limits.memory_bytes);
        let options = UpdateContainerOptions::<String> {
            cpu_period: Some(limits.cpu_period),
            cpu_quota: Some(limits.cpu_quota),
            memory,
            memory_swap: memory,
            ..Default::default()
        };

        self.docker
            .update_container(id, options)
            .await
            .map_err(docker_error)
    }

    async fn list_running(
        &self,
        name: Option<&str>,
        labels: &[(&str, &str)],
    ) -> Result<Vec<ContainerInfo>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("status".to_string(), vec!["running".to_string()]);
        if let Some(name) = name {
            filters.insert("name".to_string(), vec![format!("^/{}$", name)]);
        }
        if !labels.is_empty() {
            filters.insert(
                "label".to_string(),
                labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
            );
        }

        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(docker_error)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                Some(ContainerInfo {
                    id,
                    name,
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn inspect_limits(&self, id: &str) -> Result<ContainerLimits> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(docker_error)?;

        let host_config = inspect.host_config.unwrap_or_default();
        Ok(ContainerLimits {
            cpu_period: host_config.cpu_period.unwrap_or_default(),
            cpu_quota: host_config.cpu_quota.unwrap_or_default(),
            memory_bytes: host_config.memory.unwrap_or_default(),
        })
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(docker_error)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(docker_error)
    }
}
