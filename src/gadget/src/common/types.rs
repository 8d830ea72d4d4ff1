/// Runtime-client types and the seam the reconciler talks to the container engine through
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

use super::image::RegistryAuth;

/// Image as listed by the container engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    /// Engine image id (e.g. "sha256:...")
    pub id: String,
    /// All repository tags attached to the image
    pub repo_tags: Vec<String>,
}

/// Container as listed by the container engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Registered names, each with a leading slash (e.g. "/pub-app1")
    pub names: Vec<String>,
    pub running: bool,
}

/// Everything needed to create and start the managed app container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRunSpec {
    /// Human-readable container name
    pub name: String,
    /// Image id to run
    pub image: String,
    pub hostname: Option<String>,
    /// Command override; empty keeps the image default
    pub cmd: Vec<String>,
    /// Environment in KEY=VALUE form
    pub env: Vec<String>,
    /// Bind mounts in host:container[:mode] form
    pub binds: Vec<String>,
    /// Network the container joins
    pub network: String,
    pub privileged: bool,
    /// Host device paths exposed to the container
    pub devices: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Output captured from a successful image build
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    /// Progress lines in the order the engine emitted them
    pub lines: Vec<String>,
}

/// Container engine operations used by the reconciler, the image builder and the cleanup
/// helper. Implemented by [`super::docker::DockerRuntime`] and by in-memory fakes in tests.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// List local images
    async fn list_images(&self) -> Result<Vec<ImageSummary>, ContainerError>;

    /// List containers; `all` includes stopped ones
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, ContainerError>;

    /// Whether the container with `id` exists and is running
    async fn container_running(&self, id: &str) -> Result<bool, ContainerError>;

    /// Stop a container
    async fn stop_container(&self, id: &str) -> Result<(), ContainerError>;

    /// Remove a container
    async fn remove_container(&self, id: &str) -> Result<(), ContainerError>;

    /// Build an image from a tar build context, tagging it with `tag`
    async fn build_image(
        &self,
        context_archive: &Path,
        tag: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<BuildOutput, ContainerError>;

    /// Create and start a container, returning its id.
    /// A container that was created but failed to start is removed before returning the error.
    async fn run_container(&self, spec: &ContainerRunSpec) -> Result<String, ContainerError>;

    /// Resolve a network by name, returning its id if it exists
    async fn find_network(&self, name: &str) -> Result<Option<String>, ContainerError>;
}

/// Runtime-client error type
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Daemon error (status {status}): {message}")]
    Daemon { status: u16, message: String },

    #[error("Image build failed: {message}")]
    Build { message: String, output: Vec<String> },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl ContainerError {
    /// Errors a daemon reports for resources that are already stopped or gone.
    pub fn is_already_gone(&self) -> bool {
        match self {
            ContainerError::NotFound(_) => true,
            ContainerError::Daemon { status, .. } => *status == 304 || *status == 404,
            _ => false,
        }
    }
}
