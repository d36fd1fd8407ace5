//! Docker runtime client using bollard.
//!
//! Containers are created from the image alone: no ports, volumes or
//! networks. The orchestrator only needs a named container it can start,
//! stop and remove.

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptions, CreateContainerOptionsBuilder, CreateImageOptions,
    CreateImageOptionsBuilder, RemoveContainerOptions, RemoveContainerOptionsBuilder,
    StartContainerOptions, StartContainerOptionsBuilder, StopContainerOptions,
    StopContainerOptionsBuilder,
};
use futures_util::StreamExt;

use super::{RuntimeClient, RuntimeError};

pub struct DockerRuntime {
    docker: Docker,
    /// Seconds Docker waits for a graceful stop before killing.
    stop_timeout: i32,
}

impl DockerRuntime {
    pub fn new(docker: Docker, stop_timeout: i32) -> Self {
        Self {
            docker,
            stop_timeout,
        }
    }

    /// Connect using the default method (Unix socket on Linux/macOS, named
    /// pipe on Windows).
    pub fn connect_with_local_defaults(stop_timeout: i32) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker, stop_timeout))
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        log::info!("Pulling image: {}", image);
        let (name, tag) = parse_image_reference(image);

        let options: CreateImageOptions = CreateImageOptionsBuilder::new()
            .from_image(name)
            .tag(tag)
            .build();

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        log::debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    log::error!("Failed to pull image {}: {}", image, e);
                    return Err(RuntimeError::DockerApi(e));
                }
            }
        }

        log::info!("Image {} pulled successfully", image);
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn start(&self, name: &str, image: &str) -> Result<String, RuntimeError> {
        self.pull_image(image).await?;

        let config = ContainerCreateBody {
            image: Some(image.to_string()),
            ..Default::default()
        };
        let options: CreateContainerOptions =
            CreateContainerOptionsBuilder::new().name(name).build();

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .inspect_err(|e| log::error!("Failed to create container {}: {}", name, e))?;

        let options: StartContainerOptions = StartContainerOptionsBuilder::new().build();
        if let Err(start_err) = self.docker.start_container(&created.id, Some(options)).await {
            log::error!("Failed to start container {}: {}", name, start_err);
            // Do not leave a created-but-never-started container behind.
            let options: RemoveContainerOptions =
                RemoveContainerOptionsBuilder::new().force(true).build();
            if let Err(cleanup) = self.docker.remove_container(&created.id, Some(options)).await {
                return Err(RuntimeError::StartCleanup {
                    name: name.to_string(),
                    source: start_err,
                    cleanup,
                });
            }
            return Err(RuntimeError::DockerApi(start_err));
        }

        log::info!("Container {} started as {}", name, created.id);
        Ok(created.id)
    }

    async fn stop(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        log::info!("Stopping container: {}", runtime_id);
        let options: StopContainerOptions = StopContainerOptionsBuilder::new()
            .t(self.stop_timeout)
            .build();

        match self.docker.stop_container(runtime_id, Some(options)).await {
            Ok(_) => {
                log::info!("Container {} stopped successfully", runtime_id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                log::info!("Container {} already stopped", runtime_id);
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to stop container {}: {}", runtime_id, e);
                Err(RuntimeError::DockerApi(e))
            }
        }
    }

    async fn remove(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        log::info!("Removing container: {}", runtime_id);
        let options: RemoveContainerOptions =
            RemoveContainerOptionsBuilder::new().force(true).build();

        self.docker
            .remove_container(runtime_id, Some(options))
            .await
            .inspect_err(|e| log::error!("Failed to remove container {}: {}", runtime_id, e))?;

        log::info!("Container {} removed successfully", runtime_id);
        Ok(())
    }

    async fn start_existing(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        let options: StartContainerOptions = StartContainerOptionsBuilder::new().build();

        match self.docker.start_container(runtime_id, Some(options)).await {
            Ok(_) => {
                log::info!("Container {} started successfully", runtime_id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                log::info!("Container {} already running", runtime_id);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start container {}: {}", runtime_id, e);
                Err(RuntimeError::DockerApi(e))
            }
        }
    }
}

/// Split an image reference into (image, tag), defaulting the tag to `latest`.
fn parse_image_reference(image: &str) -> (&str, &str) {
    // Digest references (image@sha256:...)
    if let Some(at_pos) = image.find('@') {
        return (&image[..at_pos], &image[at_pos..]);
    }

    // A colon followed by a slash belongs to a registry port
    // (localhost:5000/app), not a tag.
    if let Some(colon_pos) = image.rfind(':') {
        let after_colon = &image[colon_pos + 1..];
        if !after_colon.contains('/') {
            return (&image[..colon_pos], after_colon);
        }
    }

    (image, "latest")
}
