//! Daemon tests: startup, push-triggered refresh, fail-stop exit and graceful shutdown

use async_trait::async_trait;
use gadget::bootstrap::config::ProviderConfig;
use gadget::{
    AgentConfig, AppMeta, AppStatus, BuildOutput, ContainerError, ContainerRunSpec,
    ContainerSummary, DesiredState, DesiredStateProvider, ImageBuilder, ImageInfo, ImageSummary,
    ReconcileError, RegistryAuth, RuntimeClient,
};
use gadgetd::{run_with, Components, DaemonError, Overrides};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, oneshot};

#[derive(Default)]
struct Engine {
    containers: Mutex<Vec<(String, String)>>,
    next_id: Mutex<usize>,
}

impl Engine {
    fn names(&self) -> Vec<String> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl RuntimeClient for Engine {
    async fn list_images(&self) -> Result<Vec<ImageSummary>, ContainerError> {
        Ok(Vec::new())
    }

    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>, ContainerError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, name)| ContainerSummary {
                id: id.clone(),
                names: vec![format!("/{}", name)],
                running: true,
            })
            .collect())
    }

    async fn container_running(&self, id: &str) -> Result<bool, ContainerError> {
        Ok(self.containers.lock().unwrap().iter().any(|(c, _)| c == id))
    }

    async fn stop_container(&self, _id: &str) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), ContainerError> {
        self.containers.lock().unwrap().retain(|(c, _)| c != id);
        Ok(())
    }

    async fn build_image(
        &self,
        _context_archive: &Path,
        _tag: &str,
        _auth: Option<&RegistryAuth>,
    ) -> Result<BuildOutput, ContainerError> {
        Ok(BuildOutput::default())
    }

    async fn run_container(&self, spec: &ContainerRunSpec) -> Result<String, ContainerError> {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let id = format!("c{}", next);
        self.containers
            .lock()
            .unwrap()
            .push((id.clone(), spec.name.clone()));
        Ok(id)
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, ContainerError> {
        Ok(Some(format!("net-{}", name)))
    }
}

struct ControlPlane {
    state: Mutex<DesiredState>,
    notify_tx: broadcast::Sender<()>,
}

impl ControlPlane {
    fn new(app: &str) -> Arc<Self> {
        let (notify_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            state: Mutex::new(state_for(app)),
            notify_tx,
        })
    }

    fn push(&self, app: &str) {
        *self.state.lock().unwrap() = state_for(app);
        let _ = self.notify_tx.send(());
    }
}

fn state_for(app: &str) -> DesiredState {
    DesiredState {
        app_name: Some(app.to_string()),
        token: Some("T1".to_string()),
        meta: AppMeta::default(),
        status: String::new(),
    }
}

#[async_trait]
impl DesiredStateProvider for ControlPlane {
    async fn get_state(&self) -> Result<DesiredState, ReconcileError> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn update_status(&self, status: AppStatus) -> Result<DesiredState, ReconcileError> {
        let mut state = self.state.lock().unwrap().clone();
        state.status = status.to_string();
        Ok(state)
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify_tx.subscribe()
    }
}

#[derive(Default)]
struct Builder {
    broken: AtomicBool,
}

#[async_trait]
impl ImageBuilder for Builder {
    async fn build_image(&self, name: &str, _meta: &AppMeta) -> Result<ImageInfo, ReconcileError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ReconcileError::NotFound(format!("no bundle for {}", name)));
        }
        Ok(ImageInfo {
            etag: "e1".to_string(),
            id: format!("sha256:{}", name),
        })
    }

    async fn has_etag_changed(&self, _name: &str, _old_etag: &str) -> Result<bool, ReconcileError> {
        Ok(false)
    }
}

fn config(dir: &TempDir) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.build.build_dir = dir.path().join("build");
    config.token.token_dir = dir.path().join("tokens");
    config.retry.max_attempts = 2;
    config.retry.delay_ms = 5;
    config.schedule.refresh_interval_secs = 3600;
    config
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn starts_app_and_stops_it_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(Engine::default());
    let components = Components {
        runtime: engine.clone(),
        provider: ControlPlane::new("pub-app1"),
        builder: Arc::new(Builder::default()),
    };
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let daemon = tokio::spawn(run_with(config(&dir), components, async {
        let _ = stop_rx.await;
    }));

    wait_until(|| engine.names() == vec!["pub-app1".to_string()]).await;
    stop_tx.send(()).unwrap();

    daemon.await.unwrap().unwrap();
    assert!(engine.names().is_empty());
}

#[tokio::test]
async fn change_notification_triggers_refresh() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(Engine::default());
    let control = ControlPlane::new("pub-app1");
    let components = Components {
        runtime: engine.clone(),
        provider: control.clone(),
        builder: Arc::new(Builder::default()),
    };
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let daemon = tokio::spawn(run_with(config(&dir), components, async {
        let _ = stop_rx.await;
    }));

    wait_until(|| engine.names() == vec!["pub-app1".to_string()]).await;
    // The timer is an hour away; only the push can cause this
    control.push("pub-app2");
    wait_until(|| engine.names() == vec!["pub-app2".to_string()]).await;

    stop_tx.send(()).unwrap();
    daemon.await.unwrap().unwrap();
}

#[tokio::test]
async fn unrecoverable_failure_ends_the_daemon() {
    let dir = TempDir::new().unwrap();
    let builder = Arc::new(Builder::default());
    builder.broken.store(true, Ordering::SeqCst);
    let components = Components {
        runtime: Arc::new(Engine::default()),
        provider: ControlPlane::new("pub-app1"),
        builder,
    };

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        run_with(config(&dir), components, std::future::pending()),
    )
    .await
    .expect("daemon kept running");

    match result {
        Err(DaemonError::Fatal(fatal)) => {
            assert!(matches!(*fatal.source, ReconcileError::NotFound(_)));
        }
        other => panic!("expected fatal error, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_config_refuses_to_start() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.retry.max_attempts = 0;
    let components = Components {
        runtime: Arc::new(Engine::default()),
        provider: ControlPlane::new("pub-app1"),
        builder: Arc::new(Builder::default()),
    };

    let result = run_with(config, components, std::future::pending()).await;
    assert!(matches!(
        result,
        Err(DaemonError::Startup(ReconcileError::Validation(_)))
    ));
}

#[test]
fn overrides_replace_configured_values() {
    let mut config = AgentConfig::default();
    Overrides {
        my_id: Some("rpi-9".to_string()),
        token_file: Some("app.token".to_string()),
        app_protocol: Some("http".to_string()),
        app_suffix: Some("local.test".to_string()),
        state_file: Some(PathBuf::from("/run/desired.json")),
    }
    .apply(&mut config);

    assert_eq!(config.device.my_id, "rpi-9");
    assert_eq!(config.token.token_file, "app.token");
    assert_eq!(config.app.bundle_url("pub-app1"), "http://pub-app1.local.test/iot.tgz");
    assert!(matches!(
        config.provider,
        ProviderConfig::File { ref state_file, .. } if state_file == Path::new("/run/desired.json")
    ));

    // Nothing set, nothing changed
    let mut untouched = AgentConfig::default();
    Overrides::default().apply(&mut untouched);
    assert_eq!(untouched.device.my_id, AgentConfig::default().device.my_id);
}
