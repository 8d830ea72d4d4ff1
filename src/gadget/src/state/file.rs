/// Desired state kept in a JSON file by a companion process
use super::{DesiredStateProvider, NOTIFY_CAPACITY};
use crate::app_spec::{AppStatus, DesiredState};
use crate::error::ReconcileError;
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Quiet period after a file event before the content is compared
const DEBOUNCE: Duration = Duration::from_millis(200);

pub struct FileStateProvider {
    state_file: PathBuf,
    status_file: PathBuf,
    notify_tx: broadcast::Sender<()>,
    watcher: Mutex<Option<(RecommendedWatcher, JoinHandle<()>)>>,
}

impl FileStateProvider {
    /// Provider without change notifications. `status_file` defaults to `<state_file>.status`.
    pub fn new(state_file: PathBuf, status_file: Option<PathBuf>) -> Self {
        let status_file = status_file.unwrap_or_else(|| {
            let mut name = state_file.clone().into_os_string();
            name.push(".status");
            PathBuf::from(name)
        });
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);

        Self {
            state_file,
            status_file,
            notify_tx,
            watcher: Mutex::new(None),
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn status_file(&self) -> &Path {
        &self.status_file
    }

    /// Watch the state file and notify subscribers when its content changes.
    ///
    /// The parent directory is watched so that files replaced by rename are seen.
    /// Must be called from within a tokio runtime.
    pub fn watch(&self) -> Result<(), ReconcileError> {
        let dir = self
            .state_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let file_name = self.state_file.file_name().map(|n| n.to_os_string());

        let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let relevant = matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) && event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if relevant {
                    let _ = event_tx.send(());
                }
            }
        })
        .map_err(|e| ReconcileError::State(format!("Cannot create file watcher: {}", e)))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ReconcileError::State(format!("Cannot watch {:?}: {}", dir, e)))?;

        let task = tokio::spawn(debounce_changes(
            self.state_file.clone(),
            event_rx,
            self.notify_tx.clone(),
        ));

        tracing::info!(
            "[FileStateProvider] Watching {} for desired-state changes",
            self.state_file.display()
        );

        if let Ok(mut slot) = self.watcher.lock() {
            if let Some((_, old_task)) = slot.replace((watcher, task)) {
                old_task.abort();
            }
        }
        Ok(())
    }

    async fn read_state(&self) -> Result<DesiredState, ReconcileError> {
        let content = match tokio::fs::read_to_string(&self.state_file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(
                    "[FileStateProvider] {} does not exist, no app desired",
                    self.state_file.display()
                );
                return Ok(DesiredState::default());
            }
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(DesiredState::default());
        }
        serde_json::from_str(&content).map_err(|e| {
            ReconcileError::State(format!(
                "Invalid desired state in {}: {}",
                self.state_file.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl DesiredStateProvider for FileStateProvider {
    async fn get_state(&self) -> Result<DesiredState, ReconcileError> {
        self.read_state().await
    }

    async fn update_status(&self, status: AppStatus) -> Result<DesiredState, ReconcileError> {
        let body = serde_json::json!({ "status": status });
        let mut tmp = self.status_file.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, body.to_string()).await?;
        tokio::fs::rename(&tmp, &self.status_file).await?;
        tracing::debug!(
            "[FileStateProvider] Wrote status {} to {}",
            status,
            self.status_file.display()
        );

        let mut state = self.read_state().await?;
        state.status = status.to_string();
        Ok(state)
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify_tx.subscribe()
    }
}

impl Drop for FileStateProvider {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.watcher.lock() {
            if let Some((_, task)) = slot.take() {
                task.abort();
            }
        }
    }
}

/// Collapse bursts of file events and notify only when the content actually changed.
async fn debounce_changes(
    state_file: PathBuf,
    mut events: mpsc::UnboundedReceiver<()>,
    notify_tx: broadcast::Sender<()>,
) {
    let mut last = tokio::fs::read_to_string(&state_file).await.ok();

    while events.recv().await.is_some() {
        tokio::time::sleep(DEBOUNCE).await;
        while events.try_recv().is_ok() {}

        let current = tokio::fs::read_to_string(&state_file).await.ok();
        if current == last {
            continue;
        }
        last = current;

        tracing::debug!(
            "[FileStateProvider] {} changed, notifying",
            state_file.display()
        );
        // No subscribers is fine
        let _ = notify_tx.send(());
    }
}
