//! Docker integration through bollard.

use super::{Bind, ContainerRuntime, TaskOutput, VolumeInfo};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use std::path::PathBuf;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    pull_missing: bool,
}

impl DockerRuntime {
    pub fn connect(pull_missing: bool) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            EngineError::Runtime(format!("failed to connect to Docker daemon: {e}"))
        })?;
        Ok(Self { docker, pull_missing })
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() || !self.pull_missing {
            return Ok(());
        }
        tracing::info!(image, "Pulling helper image");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image,
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| EngineError::Runtime(format!("failed to pull {image}: {e}")))?;
        Ok(())
    }

    async fn collect_logs(&self, id: &str) -> String {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let mut logs = String::new();
        while let Some(Ok(chunk)) = stream.next().await {
            match chunk {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    logs.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        logs
    }

    async fn wait_for_exit(&self, id: &str) -> Result<i64> {
        let mut stream = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match stream.next().await {
            Some(Ok(resp)) => Ok(resp.status_code),
            // bollard reports non-zero exits as an error variant
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(EngineError::runtime(e)),
            None => Err(EngineError::Runtime(format!("no exit status for container {id}"))),
        }
    }
}

fn is_not_found(e: &BollardError) -> bool {
    matches!(
        e,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run_ephemeral_task(&self, image: &str, cmd: &[String], binds: &[Bind]) -> Result<TaskOutput> {
        self.ensure_image(image).await?;

        let name = format!("volume-backup-task-{}", uuid::Uuid::new_v4().simple());
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(cmd.to_vec()),
            host_config: Some(HostConfig {
                binds: Some(binds.iter().map(Bind::to_spec).collect()),
                // Removal is explicit below so the exit code and logs can be read first
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| EngineError::Runtime(format!("failed to create task container: {e}")))?;

        tracing::debug!(container = %name, image, "Starting ephemeral task");

        let outcome = async {
            self.docker
                .start_container(&created.id, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| EngineError::Runtime(format!("failed to start task container: {e}")))?;
            let exit_code = self.wait_for_exit(&created.id).await?;
            let logs = self.collect_logs(&created.id).await;
            Ok::<_, EngineError>(TaskOutput { exit_code, logs })
        }
        .await;

        if let Err(e) = self
            .docker
            .remove_container(
                &created.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::warn!(container = %name, "Failed to remove task container: {}", e);
        }

        outcome
    }

    async fn create_volume(&self, name: &str) -> Result<VolumeInfo> {
        let volume = self
            .docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| EngineError::Runtime(format!("failed to create volume {name}: {e}")))?;
        Ok(VolumeInfo {
            name: volume.name,
            mountpoint: PathBuf::from(volume.mountpoint),
        })
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        match self.docker.remove_volume(name, None).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(EngineError::Runtime(format!("failed to remove volume {name}: {e}"))),
        }
    }

    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeInfo>> {
        match self.docker.inspect_volume(name).await {
            Ok(volume) => Ok(Some(VolumeInfo {
                name: volume.name,
                mountpoint: PathBuf::from(volume.mountpoint),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(EngineError::Runtime(format!("failed to inspect volume {name}: {e}"))),
        }
    }
}
