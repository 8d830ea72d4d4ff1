/// Agent bootstrap: config, image builder, cleanup, retry policy and the intent loop.
pub mod cleanup;
pub mod config;
pub mod image_builder;
pub mod intent_loop;
pub mod retry;
pub mod templates;

pub use cleanup::Cleanup;
pub use config::AgentConfig;
pub use image_builder::{BundleImageBuilder, ImageBuilder};
pub use intent_loop::ReconcilerHandle;
pub use retry::retry_with_delay;
pub use templates::DockerfileRenderer;
