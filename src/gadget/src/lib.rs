//! Edge agent library
//!
//! Keeps the one app container of a device in sync with the desired state a control plane
//! reports: builds or reuses the app image, provisions its token and creates or removes the
//! container, all through a single serialized reconcile queue.

pub mod app_runtime;
pub mod app_spec;
pub mod error;
pub mod intent;
pub mod state;

pub use app_runtime::Reconciler;
pub use app_spec::{
    AppMeta, AppStatus, ChildRegistry, CurrentAppInfo, DesiredState, ImageInfo, ManagedChild,
};
pub use error::{CycleResult, FatalError, ReconcileError};
pub use intent::Command;
pub use state::{DesiredStateProvider, FileStateProvider, HttpStateProvider};

// Bootstrap (config, builder, queue)
pub mod bootstrap;
pub use bootstrap::{
    retry_with_delay, AgentConfig, BundleImageBuilder, Cleanup, DockerfileRenderer, ImageBuilder,
    ReconcilerHandle,
};

// Runtime client seam and the Docker implementation
pub mod common;
pub use common::*;
