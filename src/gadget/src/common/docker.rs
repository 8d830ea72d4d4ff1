//! Docker engine implementation of [`RuntimeClient`]
//!
//! Thin mapping from the runtime-client seam onto `bollard`. Daemon-reported failures
//! are mapped onto [`ContainerError`] by HTTP status so the cleanup helper can tell
//! "already gone" from real failures.

use super::image::RegistryAuth;
use super::types::{
    BuildOutput, ContainerError, ContainerRunSpec, ContainerSummary, ImageSummary, RuntimeClient,
};
use async_trait::async_trait;
use bollard::{
    auth::DockerCredentials,
    errors::Error as BollardError,
    models::{ContainerCreateBody, DeviceMapping, HostConfig},
    query_parameters::{
        BuildImageOptionsBuilder, CreateContainerOptionsBuilder, InspectContainerOptions,
        ListContainersOptionsBuilder, ListImagesOptionsBuilder, ListNetworksOptions,
        RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    },
    Docker, API_DEFAULT_VERSION,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Docker engine client
pub struct DockerRuntime {
    docker: Docker,
    stop_timeout_secs: i32,
}

impl DockerRuntime {
    /// Connect to the daemon on `socket`, or to the platform defaults when `None`.
    ///
    /// `request_timeout` bounds every engine request on either path, image builds included.
    pub fn connect(
        socket: Option<&str>,
        stop_timeout_secs: u32,
        request_timeout: Duration,
    ) -> Result<Self, ContainerError> {
        let docker = match socket {
            Some(path) => {
                Docker::connect_with_socket(path, request_timeout.as_secs(), API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| ContainerError::Connection(e.to_string()))?
        .with_timeout(request_timeout);

        tracing::info!(
            "[DockerRuntime] Connected to docker daemon at {} (request timeout {}s)",
            socket.unwrap_or("local defaults"),
            request_timeout.as_secs()
        );

        Ok(Self {
            docker,
            stop_timeout_secs: i32::try_from(stop_timeout_secs).unwrap_or(i32::MAX),
        })
    }

    async fn remove_quietly(&self, id: &str) {
        if let Err(e) = self.remove_container(id).await {
            tracing::warn!("[DockerRuntime] Failed to remove unstarted container {}: {}", id, e);
        }
    }
}

fn map_error(context: &str, error: BollardError) -> ContainerError {
    match error {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => ContainerError::NotFound(format!("{}: {}", context, message)),
            409 => ContainerError::Conflict(format!("{}: {}", context, message)),
            status => ContainerError::Daemon {
                status,
                message: format!("{}: {}", context, message),
            },
        },
        other => ContainerError::Other(format!("{}: {}", context, other)),
    }
}

fn credentials_map(auth: &RegistryAuth) -> HashMap<String, DockerCredentials> {
    let credentials = DockerCredentials {
        username: Some(auth.username.clone()),
        password: Some(auth.password.clone()),
        serveraddress: Some(auth.address.clone()),
        ..Default::default()
    };
    HashMap::from([(auth.address.clone(), credentials)])
}

fn device_mapping(path: &str) -> DeviceMapping {
    DeviceMapping {
        path_on_host: Some(path.to_string()),
        path_in_container: Some(path.to_string()),
        cgroup_permissions: Some("rwm".to_string()),
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn list_images(&self) -> Result<Vec<ImageSummary>, ContainerError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptionsBuilder::new().all(false).build()))
            .await
            .map_err(|e| map_error("list_images", e))?;

        Ok(images
            .into_iter()
            .map(|image| ImageSummary {
                id: image.id,
                repo_tags: image.repo_tags,
            })
            .collect())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, ContainerError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptionsBuilder::new().all(all).build()))
            .await
            .map_err(|e| map_error("list_containers", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let running = c
                    .status
                    .as_deref()
                    .map(|s| s.starts_with("Up"))
                    .unwrap_or(false);
                Some(ContainerSummary {
                    id,
                    names: c.names.unwrap_or_default(),
                    running,
                })
            })
            .collect())
    }

    async fn container_running(&self, id: &str) -> Result<bool, ContainerError> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_error("inspect_container", e)),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), ContainerError> {
        self.docker
            .stop_container(
                id,
                Some(
                    StopContainerOptionsBuilder::new()
                        .t(self.stop_timeout_secs)
                        .build(),
                ),
            )
            .await
            .map_err(|e| map_error("stop_container", e))
    }

    async fn remove_container(&self, id: &str) -> Result<(), ContainerError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptionsBuilder::new().force(true).build()),
            )
            .await
            .map_err(|e| map_error("remove_container", e))
    }

    async fn build_image(
        &self,
        context_archive: &Path,
        tag: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<BuildOutput, ContainerError> {
        let context = tokio::fs::read(context_archive).await?;
        let options = BuildImageOptionsBuilder::new()
            .dockerfile("Dockerfile")
            .t(tag)
            .rm(true)
            .build();

        let mut stream = self.docker.build_image(
            options,
            auth.map(credentials_map),
            Some(bollard::body_full(bytes::Bytes::from(context))),
        );

        let mut output = BuildOutput::default();
        while let Some(item) = stream.next().await {
            let info = match item {
                Ok(info) => info,
                Err(BollardError::DockerStreamError { error }) => {
                    return Err(ContainerError::Build {
                        message: error,
                        output: output.lines,
                    });
                }
                Err(e) => return Err(map_error("build_image", e)),
            };
            if let Some(line) = info.stream {
                let line = line.trim_end().to_string();
                if !line.is_empty() {
                    tracing::debug!("[DockerRuntime] build {}: {}", tag, line);
                    output.lines.push(line);
                }
            }
            if let Some(detail) = info.error_detail {
                let message = detail
                    .message
                    .unwrap_or_else(|| "unknown build error".to_string());
                return Err(ContainerError::Build {
                    message,
                    output: output.lines,
                });
            }
        }

        Ok(output)
    }

    async fn run_container(&self, spec: &ContainerRunSpec) -> Result<String, ContainerError> {
        let host_config = HostConfig {
            binds: Some(spec.binds.clone()),
            network_mode: Some(spec.network.clone()),
            privileged: Some(spec.privileged),
            devices: if spec.devices.is_empty() {
                None
            } else {
                Some(spec.devices.iter().map(|d| device_mapping(d)).collect())
            },
            ..HostConfig::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            hostname: spec.hostname.clone(),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|e| map_error("create_container", e))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            self.remove_quietly(&created.id).await;
            return Err(map_error("start_container", e));
        }

        tracing::info!(
            "[DockerRuntime] Container {} up, id: {}",
            spec.name,
            created.id
        );
        Ok(created.id)
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, ContainerError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions>)
            .await
            .map_err(|e| map_error("list_networks", e))?;

        Ok(networks
            .into_iter()
            .find(|n| n.name.as_deref() == Some(name))
            .and_then(|n| n.id))
    }
}
