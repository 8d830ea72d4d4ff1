//! App data model: desired state from the control plane and the record of the managed child.
//!
//! The device runs zero or one managed app. [`ChildRegistry`] is the record of it, written
//! only by the reconciler's queue worker.

use crate::error::ReconcileError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// App metadata attached to the desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMeta {
    /// Run with elevated capabilities on the privileged network
    #[serde(default)]
    pub privileged: bool,
    /// Free-form properties, a JSON object serialized as a string
    #[serde(default)]
    pub properties: String,
}

impl AppMeta {
    /// Flatten `properties` into `KEY=value` environment entries.
    ///
    /// String values are used verbatim, other values keep their JSON encoding.
    /// An empty string means no properties.
    pub fn property_env(&self) -> Result<Vec<String>, ReconcileError> {
        let raw = self.properties.trim();
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| ReconcileError::Validation(format!("Invalid meta.properties: {}", e)))?;
        let map = match value {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => return Ok(Vec::new()),
            other => {
                return Err(ReconcileError::Validation(format!(
                    "meta.properties must be a JSON object, got {}",
                    other
                )))
            }
        };

        Ok(map
            .into_iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(s) => format!("{}={}", key, s),
                other => format!("{}={}", key, other),
            })
            .collect())
    }
}

/// Which app, if any, the control plane wants running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    /// `None` means no app should run
    #[serde(default)]
    pub app_name: Option<String>,
    /// Access token the app reads from its token file
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub meta: AppMeta,
    /// Last status the control plane recorded
    #[serde(default)]
    pub status: String,
}

/// Phase reported back to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    Starting,
    Running,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Starting => "STARTING",
            AppStatus::Running => "RUNNING",
        }
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A built or cached image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Fingerprint of the bundle the image was built from
    pub etag: String,
    /// Engine image id, never empty
    pub id: String,
}

/// What is known about the running app, taken from the spec it was created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentAppInfo {
    pub app_name: String,
    pub etag: String,
    pub meta: AppMeta,
    pub token: String,
    pub image_id: String,
    /// Token directory as seen by this process (before host-path translation)
    pub token_dir: PathBuf,
}

impl CurrentAppInfo {
    /// Identity match against a desired state: name, token and meta.
    pub fn same_identity(&self, desired: &DesiredState) -> bool {
        desired.app_name.as_deref() == Some(self.app_name.as_str())
            && desired.token.as_deref() == Some(self.token.as_str())
            && desired.meta == self.meta
    }
}

/// A managed child container and the app it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedChild {
    pub container_id: String,
    pub info: CurrentAppInfo,
}

/// Record of managed children, keyed by container id.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    children: HashMap<String, ManagedChild>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a child
    pub fn register(&mut self, child: ManagedChild) {
        self.children.insert(child.container_id.clone(), child);
    }

    /// Forget a child, returning its record
    pub fn remove(&mut self, container_id: &str) -> Option<ManagedChild> {
        self.children.remove(container_id)
    }

    /// The single managed child, if any.
    ///
    /// Seeing more than one is an internal-consistency violation.
    pub fn current(&self) -> Result<Option<&ManagedChild>, ReconcileError> {
        if self.children.len() > 1 {
            let mut ids: Vec<&str> = self.children.keys().map(String::as_str).collect();
            ids.sort_unstable();
            return Err(ReconcileError::Invariant(format!(
                "{} managed apps observed: {}",
                self.children.len(),
                ids.join(", ")
            )));
        }
        Ok(self.children.values().next())
    }

    /// Info of the single managed app, if any
    pub fn current_info(&self) -> Result<Option<CurrentAppInfo>, ReconcileError> {
        Ok(self.current()?.map(|child| child.info.clone()))
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}
