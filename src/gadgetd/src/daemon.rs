/// Process bootstrap around the reconciler: ordered startup, refresh triggers, ordered shutdown
use gadget::bootstrap::config::ProviderConfig;
use gadget::{
    AgentConfig, BundleImageBuilder, DesiredStateProvider, DockerRuntime, FatalError,
    FileStateProvider, HttpStateProvider, ImageBuilder, ReconcileError, Reconciler,
    ReconcilerHandle, RuntimeClient,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// The agent could not be set up
    #[error("Startup failed: {0}")]
    Startup(#[from] ReconcileError),

    /// The agent ran into a failure it must not continue past
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Command-line values that replace configured ones
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub my_id: Option<String>,
    pub token_file: Option<String>,
    pub app_protocol: Option<String>,
    pub app_suffix: Option<String>,
    pub state_file: Option<PathBuf>,
}

impl Overrides {
    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(my_id) = &self.my_id {
            config.device.my_id = my_id.clone();
        }
        if let Some(token_file) = &self.token_file {
            config.token.token_file = token_file.clone();
        }
        if let Some(protocol) = &self.app_protocol {
            config.app.protocol = protocol.clone();
        }
        if let Some(suffix) = &self.app_suffix {
            config.app.suffix = suffix.clone();
        }
        if let Some(state_file) = &self.state_file {
            config.provider = ProviderConfig::File {
                state_file: state_file.clone(),
                status_file: None,
            };
        }
    }
}

/// Collaborators the reconciler is built from
pub struct Components {
    pub runtime: Arc<dyn RuntimeClient>,
    pub provider: Arc<dyn DesiredStateProvider>,
    pub builder: Arc<dyn ImageBuilder>,
}

impl Components {
    /// Docker engine, the configured provider and the bundle image builder
    pub fn from_config(config: &AgentConfig) -> Result<Self, ReconcileError> {
        let runtime: Arc<dyn RuntimeClient> = Arc::new(DockerRuntime::connect(
            config.runtime.docker_socket.as_deref(),
            config.runtime.stop_timeout_secs,
            config.runtime.request_timeout(),
        )?);
        let provider = provider_from_config(&config.provider)?;
        let builder: Arc<dyn ImageBuilder> = Arc::new(BundleImageBuilder::new(
            runtime.clone(),
            config.app.clone(),
            config.build.clone(),
            config.registry.clone(),
        )?);

        Ok(Self {
            runtime,
            provider,
            builder,
        })
    }
}

fn provider_from_config(
    config: &ProviderConfig,
) -> Result<Arc<dyn DesiredStateProvider>, ReconcileError> {
    match config {
        ProviderConfig::File {
            state_file,
            status_file,
        } => {
            let provider = FileStateProvider::new(state_file.clone(), status_file.clone());
            // The timer still drives refreshes without a watcher
            if let Err(e) = provider.watch() {
                tracing::warn!("[Daemon] Desired-state changes will not be pushed: {}", e);
            }
            Ok(Arc::new(provider))
        }
        ProviderConfig::Http {
            base_url,
            timeout_secs,
        } => {
            tracing::info!("[Daemon] Using control plane at {}", base_url);
            Ok(Arc::new(HttpStateProvider::new(
                base_url,
                Duration::from_secs(*timeout_secs),
            )?))
        }
    }
}

/// Validate, connect and run until a shutdown signal or a fatal error.
pub async fn run(config: AgentConfig) -> Result<(), DaemonError> {
    config.validate()?;
    let components = Components::from_config(&config)?;
    run_with(config, components, shutdown_signal()).await
}

/// Run the agent with the given collaborators until `shutdown` resolves or a fatal error
/// arrives. Either way the queue is drained before returning.
pub async fn run_with(
    config: AgentConfig,
    components: Components,
    shutdown: impl Future<Output = ()>,
) -> Result<(), DaemonError> {
    config.validate()?;
    let Components {
        runtime,
        provider,
        builder,
    } = components;

    let reconciler = Reconciler::new(&config, runtime, provider.clone(), builder);
    let (handle, mut fatal_rx) =
        ReconcilerHandle::spawn(reconciler, config.shutdown.stop_app_on_shutdown);
    let mut changes = provider.subscribe();
    let mut notifications_open = true;

    tracing::info!(
        "[Daemon] Device {} started, refreshing every {}s",
        config.device.my_id,
        config.schedule.refresh_interval_secs
    );
    handle.refresh_state(None)?;

    let mut ticker = tokio::time::interval(config.schedule.refresh_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately; the initial refresh is already queued
    ticker.tick().await;

    tokio::pin!(shutdown);
    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("[Daemon] Shutdown requested");
                break Ok(());
            }
            Some(fatal) = fatal_rx.recv() => {
                tracing::error!("[Daemon] {}", fatal);
                break Err(fatal);
            }
            _ = ticker.tick() => {
                tracing::debug!("[Daemon] Periodic refresh");
                request_refresh(&handle);
            }
            change = changes.recv(), if notifications_open => match change {
                Ok(()) | Err(RecvError::Lagged(_)) => {
                    tracing::debug!("[Daemon] Desired state changed");
                    request_refresh(&handle);
                }
                Err(RecvError::Closed) => {
                    tracing::debug!("[Daemon] Change notifications closed");
                    notifications_open = false;
                }
            },
        }
    };

    tracing::info!("[Daemon] Draining reconciler");
    handle.shutdown().await;
    drop(changes);
    drop(provider);
    tracing::info!("[Daemon] Stopped");

    outcome.map_err(DaemonError::Fatal)
}

fn request_refresh(handle: &ReconcilerHandle) {
    if let Err(e) = handle.refresh_state(None) {
        tracing::warn!("[Daemon] Cannot queue refresh: {}", e);
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("[Daemon] Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("[Daemon] Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
