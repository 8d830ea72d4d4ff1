//! Error types for reconciliation, plus the fail-stop value handed to the process entry point.

use crate::common::ContainerError;
use std::sync::Arc;

/// Error type for reconcile cycles and the components they drive.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Malformed or missing configuration or input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Desired state names an app but carries no token
    #[error("Missing token for app {0}")]
    MissingToken(String),

    /// Fingerprint, image id or network missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Engine reported a resource as already stopped or gone outside of cleanup
    #[error("Transient daemon error: {0}")]
    TransientDaemon(String),

    /// Downloaded content does not hash to its fingerprint
    #[error("Integrity error: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// More than one managed app observed
    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Runtime error: {0}")]
    Runtime(ContainerError),

    #[error("Template error: {0}")]
    Template(String),

    /// Desired-state provider failure
    #[error("State provider error: {0}")]
    State(String),

    #[error("Reconciler is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReconcileError {
    /// Whether another reconcile attempt can help.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ReconcileError::Invariant(_)
                | ReconcileError::Validation(_)
                | ReconcileError::MissingToken(_)
                | ReconcileError::ShuttingDown
        )
    }
}

/// Already-gone engine errors become `TransientDaemon`. Cleanup filters them before converting.
impl From<ContainerError> for ReconcileError {
    fn from(e: ContainerError) -> Self {
        if e.is_already_gone() {
            ReconcileError::TransientDaemon(e.to_string())
        } else {
            ReconcileError::Runtime(e)
        }
    }
}

impl From<reqwest::Error> for ReconcileError {
    fn from(e: reqwest::Error) -> Self {
        ReconcileError::Http(e.to_string())
    }
}

impl From<tera::Error> for ReconcileError {
    fn from(e: tera::Error) -> Self {
        ReconcileError::Template(e.to_string())
    }
}

/// Outcome delivered to queue callers. Shared so coalesced callers all see it.
pub type CycleResult = Result<(), Arc<ReconcileError>>;

/// Unrecoverable failure. The process entry point shuts down and exits on it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Fatal: {context}: {source}")]
pub struct FatalError {
    pub context: String,
    pub source: Arc<ReconcileError>,
}

impl FatalError {
    pub fn new(context: impl Into<String>, source: Arc<ReconcileError>) -> Self {
        Self {
            context: context.into(),
            source,
        }
    }
}
