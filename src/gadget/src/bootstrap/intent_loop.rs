//! Serialized command queue in front of the reconciler.
//!
//! One worker task owns the [`Reconciler`] and runs queued intents FIFO, one at a time. At
//! most one `Refresh` is pending: later `refresh_state` calls join it as extra waiters.
//! A failed command with nobody waiting for its outcome is sent on the fatal channel.

use crate::app_runtime::{read_registry, Reconciler};
use crate::app_spec::{ChildRegistry, CurrentAppInfo};
use crate::error::{CycleResult, FatalError, ReconcileError};
use crate::intent::{Command, Intent};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Callback = oneshot::Sender<CycleResult>;

#[derive(Default)]
struct QueueState {
    /// No further intents are accepted
    closed: bool,
    /// A Refresh intent sits in the queue and has not started yet
    refresh_queued: bool,
    /// Callers waiting on the pending Refresh
    refresh_waiters: Vec<Callback>,
    /// Some caller of the pending Refresh gave no callback
    refresh_unattended: bool,
}

struct PendingRefresh {
    waiters: Vec<Callback>,
    unattended: bool,
}

pub struct ReconcilerHandle {
    tx: mpsc::UnboundedSender<Intent>,
    state: Arc<Mutex<QueueState>>,
    registry: Arc<RwLock<ChildRegistry>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReconcilerHandle {
    /// Spawn the worker. The receiver yields fatal errors for the process entry point.
    ///
    /// With `stop_app_on_shutdown` the managed app is stopped once the queue has drained.
    pub fn spawn(
        reconciler: Reconciler,
        stop_app_on_shutdown: bool,
    ) -> (Self, mpsc::UnboundedReceiver<FatalError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(QueueState::default()));
        let registry = reconciler.registry();

        let worker = tokio::spawn(run_intent_loop(
            reconciler,
            rx,
            state.clone(),
            fatal_tx,
            stop_app_on_shutdown,
        ));

        let handle = Self {
            tx,
            state,
            registry,
            worker: Mutex::new(Some(worker)),
        };
        (handle, fatal_rx)
    }

    /// Queue a reconcile cycle, joining the pending one if there is one.
    ///
    /// Without a callback, a failure of the cycle is fatal.
    pub fn refresh_state(&self, callback: Option<Callback>) -> Result<(), ReconcileError> {
        let mut state = self.lock_state()?;
        if state.closed {
            return Err(ReconcileError::ShuttingDown);
        }

        match callback {
            Some(cb) => state.refresh_waiters.push(cb),
            None => state.refresh_unattended = true,
        }
        if state.refresh_queued {
            tracing::debug!("[IntentLoop] Refresh already pending, coalescing");
            return Ok(());
        }

        if self.tx.send(Intent::Refresh).is_err() {
            state.refresh_waiters.clear();
            state.refresh_unattended = false;
            return Err(ReconcileError::ShuttingDown);
        }
        state.refresh_queued = true;
        Ok(())
    }

    /// Queue a Refresh and wait for the cycle it joins.
    pub async fn refresh_and_wait(&self) -> CycleResult {
        let (tx, rx) = oneshot::channel();
        self.refresh_state(Some(tx)).map_err(Arc::new)?;
        rx.await
            .unwrap_or_else(|_| Err(Arc::new(ReconcileError::ShuttingDown)))
    }

    /// Queue a command. `Refresh` goes through the coalescing path.
    pub fn enqueue(&self, command: Command, callback: Option<Callback>) -> Result<(), ReconcileError> {
        if command == Command::Refresh {
            return self.refresh_state(callback);
        }

        let state = self.lock_state()?;
        if state.closed {
            return Err(ReconcileError::ShuttingDown);
        }
        self.tx
            .send(Intent::Run { command, callback })
            .map_err(|_| ReconcileError::ShuttingDown)
    }

    /// Queue a command and wait for its outcome.
    pub async fn execute(&self, command: Command) -> CycleResult {
        let (tx, rx) = oneshot::channel();
        self.enqueue(command, Some(tx)).map_err(Arc::new)?;
        rx.await
            .unwrap_or_else(|_| Err(Arc::new(ReconcileError::ShuttingDown)))
    }

    /// Info of the managed app, if any
    pub fn current_app_info(&self) -> Result<Option<CurrentAppInfo>, ReconcileError> {
        read_registry(&self.registry)?.current_info()
    }

    /// Stop accepting work, wait for everything queued to finish, then stop the worker.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = match self.lock_state() {
            Ok(mut state) if !state.closed => {
                state.closed = true;
                self.tx.send(Intent::Shutdown { done: done_tx }).is_ok()
            }
            _ => false,
        };

        if sent {
            tracing::info!("[IntentLoop] Draining queue for shutdown");
            let _ = done_rx.await;
        }

        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!("[IntentLoop] Worker ended abnormally: {}", e);
            }
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, ReconcileError> {
        self.state
            .lock()
            .map_err(|_| ReconcileError::Invariant("queue state lock poisoned".to_string()))
    }
}

fn take_pending_refresh(state: &Mutex<QueueState>) -> PendingRefresh {
    match state.lock() {
        Ok(mut state) => {
            state.refresh_queued = false;
            PendingRefresh {
                waiters: std::mem::take(&mut state.refresh_waiters),
                unattended: std::mem::replace(&mut state.refresh_unattended, false),
            }
        }
        Err(_) => PendingRefresh {
            waiters: Vec::new(),
            unattended: true,
        },
    }
}

fn report(
    label: &str,
    result: Result<(), ReconcileError>,
    waiters: Vec<Callback>,
    unattended: bool,
    fatal_tx: &mpsc::UnboundedSender<FatalError>,
) {
    let result: CycleResult = result.map_err(Arc::new);

    if let Err(e) = &result {
        tracing::error!("[IntentLoop] {} failed: {}", label, e);
        if unattended {
            let _ = fatal_tx.send(FatalError::new(label, e.clone()));
        }
    }

    for waiter in waiters {
        // Waiter may have gone away
        let _ = waiter.send(result.clone());
    }
}

async fn run_intent_loop(
    reconciler: Reconciler,
    mut receiver: mpsc::UnboundedReceiver<Intent>,
    state: Arc<Mutex<QueueState>>,
    fatal_tx: mpsc::UnboundedSender<FatalError>,
    stop_app_on_shutdown: bool,
) {
    tracing::info!("[IntentLoop] Starting intent command loop");

    while let Some(intent) = receiver.recv().await {
        match intent {
            Intent::Refresh => {
                // Callers arriving from here on queue a new Refresh
                let pending = take_pending_refresh(&state);
                tracing::debug!(
                    "[IntentLoop] Running Refresh for {} waiter(s)",
                    pending.waiters.len()
                );
                let result = reconciler.execute(&Command::Refresh).await;
                report(
                    "Refresh",
                    result,
                    pending.waiters,
                    pending.unattended,
                    &fatal_tx,
                );
            }
            Intent::Run { command, callback } => {
                tracing::info!("[IntentLoop] Running {:?}", command);
                let result = reconciler.execute(&command).await;
                let unattended = callback.is_none();
                report(
                    command.label(),
                    result,
                    callback.into_iter().collect(),
                    unattended,
                    &fatal_tx,
                );
            }
            Intent::Shutdown { done } => {
                if stop_app_on_shutdown {
                    if let Err(e) = reconciler.stop().await {
                        tracing::warn!("[IntentLoop] Failed to stop app on shutdown: {}", e);
                    }
                }
                tracing::info!("[IntentLoop] Queue drained, stopping");
                let _ = done.send(());
                break;
            }
        }
    }
}
