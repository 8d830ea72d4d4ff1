//! Dockerfile templates for app images.
//!
//! The defaults are compiled into the binary so the agent needs no template files on disk;
//! configured paths replace them.

use crate::bootstrap::config::BuildConfig;
use crate::error::ReconcileError;
use std::path::Path;
use tera::{Context, Tera};

/// Dockerfile for normal apps
pub static DOCKERFILE: &str = include_str!("templates/Dockerfile.j2");
/// Dockerfile for privileged apps
pub static DOCKERFILE_PRIVILEGED: &str = include_str!("templates/Dockerfile.privileged.j2");

const NORMAL_TEMPLATE: &str = "Dockerfile";
const PRIVILEGED_TEMPLATE: &str = "Dockerfile.privileged";

pub struct DockerfileRenderer {
    tera: Tera,
}

impl DockerfileRenderer {
    /// Embedded templates only
    pub fn from_embedded() -> Result<Self, ReconcileError> {
        Self::with_sources(DOCKERFILE.to_string(), DOCKERFILE_PRIVILEGED.to_string())
    }

    /// Embedded templates, replaced by the files the build config names
    pub fn from_config(config: &BuildConfig) -> Result<Self, ReconcileError> {
        let normal = match &config.dockerfile {
            Some(path) => read_template(path)?,
            None => DOCKERFILE.to_string(),
        };
        let privileged = match &config.dockerfile_privileged {
            Some(path) => read_template(path)?,
            None => DOCKERFILE_PRIVILEGED.to_string(),
        };
        Self::with_sources(normal, privileged)
    }

    fn with_sources(normal: String, privileged: String) -> Result<Self, ReconcileError> {
        let mut tera = Tera::default();
        tera.add_raw_template(NORMAL_TEMPLATE, &normal)?;
        tera.add_raw_template(PRIVILEGED_TEMPLATE, &privileged)?;
        tracing::debug!("[DockerfileRenderer] Loaded Dockerfile templates");
        Ok(Self { tera })
    }

    /// Render the Dockerfile for an app build
    pub fn render(
        &self,
        app_name: &str,
        etag: &str,
        privileged: bool,
    ) -> Result<String, ReconcileError> {
        let mut context = Context::new();
        context.insert("app_name", app_name);
        context.insert("etag", etag);
        context.insert("privileged", &privileged);

        let template = if privileged {
            PRIVILEGED_TEMPLATE
        } else {
            NORMAL_TEMPLATE
        };
        Ok(self.tera.render(template, &context)?)
    }
}

fn read_template(path: &Path) -> Result<String, ReconcileError> {
    std::fs::read_to_string(path).map_err(|e| {
        ReconcileError::Validation(format!("Failed to read Dockerfile template {:?}: {}", path, e))
    })
}
