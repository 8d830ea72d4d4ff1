//! Desired-state providers: where the agent learns which app should run, and where it
//! reports the app's phase.

pub mod file;
pub mod http;

use crate::app_spec::{AppStatus, DesiredState};
use crate::error::ReconcileError;
use async_trait::async_trait;
use tokio::sync::broadcast;

pub use file::FileStateProvider;
pub use http::HttpStateProvider;

/// Capacity of the change-notification channel; lagging receivers just see one change.
pub const NOTIFY_CAPACITY: usize = 16;

#[async_trait]
pub trait DesiredStateProvider: Send + Sync {
    /// Current desired state
    async fn get_state(&self) -> Result<DesiredState, ReconcileError>;

    /// Report the app's phase, returning the desired state as the provider now sees it
    async fn update_status(&self, status: AppStatus) -> Result<DesiredState, ReconcileError>;

    /// Change notifications. Each `()` means the desired state may have moved.
    fn subscribe(&self) -> broadcast::Receiver<()>;
}
