//! Docker API wrapper using the bollard crate.
//!
//! This module provides the Docker implementation of [`SandboxRuntime`].

use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::runtime::{EnvironmentSpec, SandboxHandle, SandboxRuntime};
use crate::error::SandboxError;

/// Status of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatusInfo {
    /// Container is created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container has exited.
    Exited { exit_code: i64 },
    /// Any other state (paused, restarting, removing, dead).
    Other(String),
}

/// Docker client wrapper for sandbox operations.
pub struct DockerClient {
    docker: Docker,
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Checks that the daemon answers.
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map_err(|e| SandboxError::DaemonUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Pulls a Docker image from a registry.
    ///
    /// # Arguments
    ///
    /// * `image` - Image name with optional tag (e.g., "node:18-alpine")
    pub async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::ImagePullFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Gets the status of a container.
    pub async fn container_status(&self, id: &str) -> Result<ContainerStatusInfo, SandboxError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    SandboxError::NotFound { id: id.to_string() }
                } else {
                    SandboxError::Runtime(format!("Failed to inspect container: {e}"))
                }
            })?;

        let state = info
            .state
            .ok_or_else(|| SandboxError::Runtime("Container has no state".to_string()))?;

        let status = state.status.map(|s| s.to_string()).unwrap_or_default();

        match status.as_str() {
            "created" => Ok(ContainerStatusInfo::Created),
            "running" => Ok(ContainerStatusInfo::Running),
            "exited" => Ok(ContainerStatusInfo::Exited {
                exit_code: state.exit_code.unwrap_or(-1),
            }),
            other => Ok(ContainerStatusInfo::Other(other.to_string())),
        }
    }

    async fn wait_for_exit(&self, id: &str) -> Result<i64, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        if let Some(result) = stream.next().await {
            return match result {
                Ok(response) => Ok(response.status_code),
                // bollard reports a non-zero exit as an error carrying the code.
                Err(BollardError::DockerContainerWaitError { code, .. }) => Ok(code),
                Err(e) if is_not_found(&e) => Err(SandboxError::NotFound { id: id.to_string() }),
                Err(e) => Err(SandboxError::Runtime(format!(
                    "Error waiting for container: {e}"
                ))),
            };
        }

        // If stream is empty, check container state
        match self.container_status(id).await? {
            ContainerStatusInfo::Exited { exit_code } => Ok(exit_code),
            other => Err(SandboxError::Runtime(format!(
                "Container did not exit normally: {other:?}"
            ))),
        }
    }
}

/// Builds the bollard container config for an environment.
fn container_config(spec: &EnvironmentSpec) -> Config<String> {
    let host_config = HostConfig {
        memory: Some(spec.limits.memory_bytes()),
        memory_swap: Some(spec.limits.memory_swap_bytes()),
        cpu_period: Some(spec.limits.cpu_period()),
        cpu_quota: Some(spec.limits.cpu_quota()),
        pids_limit: Some(spec.limits.max_processes as i64),
        network_mode: Some(spec.network_mode.clone()),
        binds: if spec.binds.is_empty() {
            None
        } else {
            Some(spec.binds.clone())
        },
        security_opt: if spec.security_opt.is_empty() {
            None
        } else {
            Some(spec.security_opt.clone())
        },
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        env: if spec.env.is_empty() {
            None
        } else {
            Some(spec.env.clone())
        },
        working_dir: Some(spec.working_dir.clone()),
        network_disabled: Some(spec.network_mode == "none"),
        host_config: Some(host_config),
        tty: Some(false),
        attach_stdin: Some(false),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    }
}

#[async_trait]
impl SandboxRuntime for DockerClient {
    async fn create(&self, spec: &EnvironmentSpec) -> Result<SandboxHandle, SandboxError> {
        if !self.image_exists(&spec.image).await {
            info!(image = %spec.image, "Pulling image");
            self.pull_image(&spec.image).await?;
        }

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| SandboxError::CreateFailed(e.to_string()))?;

        debug!(container = %response.id, name = %spec.name, "Created container");
        Ok(SandboxHandle::new(response.id))
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::StartFailed {
                id: handle.id.clone(),
                reason: e.to_string(),
            })
    }

    async fn wait(
        &self,
        handle: &SandboxHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<i64, SandboxError> {
        tokio::select! {
            result = self.wait_for_exit(&handle.id) => result,
            _ = tokio::time::sleep(timeout) => Err(SandboxError::Timeout {
                seconds: timeout.as_secs(),
            }),
            _ = cancel.cancelled() => Err(SandboxError::Cancelled),
        }
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let options = KillContainerOptions { signal: "SIGKILL" };

        match self.docker.kill_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            // 409: the container is not running any more.
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(SandboxError::Runtime(format!(
                "Failed to kill container: {e}"
            ))),
        }
    }

    /// Gets logs from a container.
    ///
    /// # Returns
    ///
    /// Combined stdout and stderr logs as a string.
    async fn logs(&self, handle: &SandboxHandle) -> Result<String, SandboxError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(&handle.id, Some(options));
        let mut output = String::new();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(SandboxError::LogsFailed(e.to_string()));
                }
            }
        }

        Ok(output)
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true, // Remove volumes
            ..Default::default()
        };

        match self.docker.remove_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(SandboxError::DestroyFailed {
                id: handle.id.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
