pub mod docker;
pub mod image;
/// Container-engine types and traits
///
/// The reconciler only ever sees the [`RuntimeClient`] trait; the Docker implementation
/// lives in [`docker`].
pub mod types;

pub use docker::DockerRuntime;
pub use image::{ImageTag, RegistryAuth, DEFAULT_IMAGE_PREFIX};
pub use types::{
    BuildOutput, ContainerError, ContainerRunSpec, ContainerSummary, ImageSummary, RuntimeClient,
};
