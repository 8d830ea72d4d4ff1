//! Commands routed through the serialized reconcile queue.

use crate::error::CycleResult;
use tokio::sync::oneshot;

/// What a caller wants the reconciler to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fetch the desired state and converge to it
    Refresh,
    /// Start the named app if it is desired and nothing runs
    Start(String),
    /// Stop the named app if it is the one running
    Stop(String),
    /// Stop and start the named app again against the current desired state
    Update(String),
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Command::Refresh => "Refresh",
            Command::Start(_) => "Start",
            Command::Stop(_) => "Stop",
            Command::Update(_) => "Update",
        }
    }
}

/// Queue item consumed by the intent loop.
#[derive(Debug)]
pub(crate) enum Intent {
    /// A command with an optional completion callback
    Run {
        command: Command,
        callback: Option<oneshot::Sender<CycleResult>>,
    },
    /// A coalesced Refresh; waiters are collected on the handle until it runs
    Refresh,
    /// Drain marker: everything queued before it has finished
    Shutdown { done: oneshot::Sender<()> },
}
