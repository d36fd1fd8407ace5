//! Container runtime seam.
//!
//! The orchestrator only ever talks to a [`RuntimeClient`]; the Docker
//! implementation lives in [`docker`].

pub mod docker;

use async_trait::async_trait;

pub use docker::DockerRuntime;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("failed to start container {name}: {source}; cleanup also failed: {cleanup}")]
    StartCleanup {
        name: String,
        source: bollard::errors::Error,
        cleanup: bollard::errors::Error,
    },
    #[error("runtime call failed: {0}")]
    Other(String),
}

/// Operations the orchestrator needs from a container runtime.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Pull `image`, create a container called `name` and start it.
    /// Returns the runtime's identifier for the new container.
    async fn start(&self, name: &str, image: &str) -> Result<String, RuntimeError>;
    async fn stop(&self, runtime_id: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, runtime_id: &str) -> Result<(), RuntimeError>;
    /// Start a container that already exists (was stopped).
    async fn start_existing(&self, runtime_id: &str) -> Result<(), RuntimeError>;
}
