//! Shared fakes for the gadget integration tests: an in-memory container engine, a
//! scripted desired-state provider, a recording image builder and a mock bundle origin.
#![allow(dead_code)]

use async_trait::async_trait;
use gadget::{
    AgentConfig, AppMeta, AppStatus, BuildOutput, ContainerError, ContainerRunSpec,
    ContainerSummary, DesiredState, DesiredStateProvider, ImageBuilder, ImageInfo, ImageSummary,
    ReconcileError, RegistryAuth, RuntimeClient,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Container engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub spec: Option<ContainerRunSpec>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub images: Vec<ImageSummary>,
    pub containers: Vec<FakeContainer>,
    pub networks: Vec<String>,
    /// Every call, e.g. "stop:c1"
    pub calls: Vec<String>,
    /// Tags passed to build_image
    pub builds: Vec<String>,
    /// Specs passed to run_container
    pub runs: Vec<ContainerRunSpec>,
    /// Stop fails with "already stopped"
    pub stop_fails: bool,
    /// Remove fails with this daemon status
    pub remove_status: Option<u16>,
    /// Number of upcoming run_container calls that fail
    pub run_failures: usize,
    /// run_container fails as if the image had been removed
    pub run_image_missing: bool,
    /// build_image succeeds without tagging anything
    pub build_skips_tag: bool,
    next_id: usize,
}

pub struct FakeRuntime {
    pub state: Mutex<FakeState>,
}

impl FakeRuntime {
    /// Engine with the default networks
    pub fn new() -> Arc<Self> {
        let networks = vec!["gadget-net".to_string(), "gadget-privileged-net".to_string()];
        Arc::new(Self {
            state: Mutex::new(FakeState {
                networks,
                ..Default::default()
            }),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Add an existing container
    pub fn add_container(&self, id: &str, name: &str, running: bool) {
        self.with(|s| {
            s.containers.push(FakeContainer {
                id: id.to_string(),
                name: name.to_string(),
                running,
                spec: None,
            })
        });
    }

    pub fn add_image(&self, id: &str, tag: &str) {
        self.with(|s| {
            s.images.push(ImageSummary {
                id: id.to_string(),
                repo_tags: vec![tag.to_string()],
            })
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn calls_of(&self, op: &str) -> Vec<String> {
        let prefix = format!("{}:", op);
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(&prefix))
            .collect()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.with(|s| s.containers.iter().map(|c| c.id.clone()).collect())
    }

    pub fn runs(&self) -> Vec<ContainerRunSpec> {
        self.with(|s| s.runs.clone())
    }

    /// Mark a container as exited
    pub fn exit_container(&self, id: &str) {
        self.with(|s| {
            if let Some(c) = s.containers.iter_mut().find(|c| c.id == id) {
                c.running = false;
            }
        });
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn list_images(&self) -> Result<Vec<ImageSummary>, ContainerError> {
        Ok(self.with(|s| {
            s.calls.push("list_images:".to_string());
            s.images.clone()
        }))
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, ContainerError> {
        Ok(self.with(|s| {
            s.calls.push(format!("list_containers:{}", all));
            s.containers
                .iter()
                .filter(|c| all || c.running)
                .map(|c| ContainerSummary {
                    id: c.id.clone(),
                    names: vec![format!("/{}", c.name)],
                    running: c.running,
                })
                .collect()
        }))
    }

    async fn container_running(&self, id: &str) -> Result<bool, ContainerError> {
        Ok(self.with(|s| {
            s.containers
                .iter()
                .any(|c| c.id == id && c.running)
        }))
    }

    async fn stop_container(&self, id: &str) -> Result<(), ContainerError> {
        self.with(|s| {
            s.calls.push(format!("stop:{}", id));
            if s.stop_fails {
                return Err(ContainerError::Daemon {
                    status: 304,
                    message: "container already stopped".to_string(),
                });
            }
            match s.containers.iter_mut().find(|c| c.id == id) {
                Some(c) => {
                    c.running = false;
                    Ok(())
                }
                None => Err(ContainerError::NotFound(id.to_string())),
            }
        })
    }

    async fn remove_container(&self, id: &str) -> Result<(), ContainerError> {
        self.with(|s| {
            s.calls.push(format!("remove:{}", id));
            if let Some(status) = s.remove_status {
                return Err(ContainerError::Daemon {
                    status,
                    message: "remove failed".to_string(),
                });
            }
            let before = s.containers.len();
            s.containers.retain(|c| c.id != id);
            if s.containers.len() == before {
                Err(ContainerError::NotFound(id.to_string()))
            } else {
                Ok(())
            }
        })
    }

    async fn build_image(
        &self,
        context_archive: &Path,
        tag: &str,
        _auth: Option<&RegistryAuth>,
    ) -> Result<BuildOutput, ContainerError> {
        if !context_archive.exists() {
            return Err(ContainerError::Other(format!(
                "missing build context {:?}",
                context_archive
            )));
        }
        Ok(self.with(|s| {
            s.calls.push(format!("build:{}", tag));
            s.builds.push(tag.to_string());
            if !s.build_skips_tag {
                let id = format!("sha256:built{}", s.builds.len());
                s.images.push(ImageSummary {
                    id,
                    repo_tags: vec![tag.to_string()],
                });
            }
            BuildOutput {
                lines: vec!["Step 1/1".to_string()],
            }
        }))
    }

    async fn run_container(&self, spec: &ContainerRunSpec) -> Result<String, ContainerError> {
        self.with(|s| {
            s.calls.push(format!("run:{}", spec.name));
            if s.run_image_missing {
                return Err(ContainerError::NotFound(format!("image {}", spec.image)));
            }
            if s.run_failures > 0 {
                s.run_failures -= 1;
                return Err(ContainerError::Daemon {
                    status: 500,
                    message: "cannot start container".to_string(),
                });
            }
            if s.containers.iter().any(|c| c.name == spec.name) {
                return Err(ContainerError::Conflict(format!(
                    "name {} already in use",
                    spec.name
                )));
            }
            s.next_id += 1;
            let id = format!("c{}", s.next_id);
            s.runs.push(spec.clone());
            s.containers.push(FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                running: true,
                spec: Some(spec.clone()),
            });
            Ok(id)
        })
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, ContainerError> {
        Ok(self.with(|s| {
            s.networks
                .iter()
                .find(|n| *n == name)
                .map(|n| format!("net-{}", n))
        }))
    }
}

// ---------------------------------------------------------------------------
// Desired-state provider
// ---------------------------------------------------------------------------

pub struct FakeProvider {
    state: Mutex<DesiredState>,
    statuses: Mutex<Vec<AppStatus>>,
    pub get_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Time get_state takes
    delay: Mutex<Duration>,
    /// Reporting RUNNING fails
    pub fail_running: AtomicBool,
    notify_tx: broadcast::Sender<()>,
}

impl FakeProvider {
    pub fn new(state: DesiredState) -> Arc<Self> {
        let (notify_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            state: Mutex::new(state),
            statuses: Mutex::new(Vec::new()),
            get_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            fail_running: AtomicBool::new(false),
            notify_tx,
        })
    }

    pub fn set_state(&self, state: DesiredState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn statuses(&self) -> Vec<AppStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn notify(&self) {
        let _ = self.notify_tx.send(());
    }
}

#[async_trait]
impl DesiredStateProvider for FakeProvider {
    async fn get_state(&self) -> Result<DesiredState, ReconcileError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().clone())
    }

    async fn update_status(&self, status: AppStatus) -> Result<DesiredState, ReconcileError> {
        if status == AppStatus::Running && self.fail_running.load(Ordering::SeqCst) {
            return Err(ReconcileError::State("control plane unavailable".to_string()));
        }
        self.statuses.lock().unwrap().push(status);
        let mut state = self.state.lock().unwrap().clone();
        state.status = status.to_string();
        Ok(state)
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify_tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Image builder
// ---------------------------------------------------------------------------

pub struct FakeBuilder {
    etag: Mutex<String>,
    pub builds: Mutex<Vec<(String, AppMeta)>>,
    pub etag_checks: AtomicUsize,
    /// Fingerprint lookups fail as if the origin returned 404
    pub etag_missing: AtomicBool,
}

impl FakeBuilder {
    pub fn new(etag: &str) -> Arc<Self> {
        Arc::new(Self {
            etag: Mutex::new(etag.to_string()),
            builds: Mutex::new(Vec::new()),
            etag_checks: AtomicUsize::new(0),
            etag_missing: AtomicBool::new(false),
        })
    }

    pub fn set_etag(&self, etag: &str) {
        *self.etag.lock().unwrap() = etag.to_string();
    }

    pub fn builds(&self) -> Vec<(String, AppMeta)> {
        self.builds.lock().unwrap().clone()
    }

    fn current_etag(&self) -> Result<String, ReconcileError> {
        if self.etag_missing.load(Ordering::SeqCst) {
            return Err(ReconcileError::NotFound(
                "Cannot get bundle header: status 404 Not Found".to_string(),
            ));
        }
        Ok(self.etag.lock().unwrap().clone())
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build_image(&self, name: &str, meta: &AppMeta) -> Result<ImageInfo, ReconcileError> {
        let etag = self.current_etag()?;
        self.builds
            .lock()
            .unwrap()
            .push((name.to_string(), meta.clone()));
        Ok(ImageInfo {
            id: format!("sha256:{}-{}", name, etag),
            etag,
        })
    }

    async fn has_etag_changed(&self, _name: &str, old_etag: &str) -> Result<bool, ReconcileError> {
        self.etag_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.current_etag()? != old_etag)
    }
}

// ---------------------------------------------------------------------------
// Config and fixtures
// ---------------------------------------------------------------------------

/// Agent config rooted in `dir`, with fast retries
pub fn test_config(dir: &Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.device.my_id = "device-42".to_string();
    config.build.build_dir = dir.join("build");
    config.token.token_dir = dir.join("tokens");
    config.retry.max_attempts = 3;
    config.retry.delay_ms = 5;
    config
}

pub fn desired(app: Option<&str>, token: Option<&str>) -> DesiredState {
    DesiredState {
        app_name: app.map(str::to_string),
        token: token.map(str::to_string),
        meta: AppMeta::default(),
        status: String::new(),
    }
}

/// gzip'd tar with `package/` files, as `npm pack` produces
pub fn bundle_tgz(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(data))
}

// ---------------------------------------------------------------------------
// Mock bundle origin
// ---------------------------------------------------------------------------

/// Bundle origin serving `/iot.tgz`; counts HEAD and GET requests separately.
pub struct BundleServer {
    pub addr: SocketAddr,
    pub heads: Arc<AtomicUsize>,
    pub gets: Arc<AtomicUsize>,
    pub body: Arc<Mutex<Vec<u8>>>,
    pub etag: Arc<Mutex<Option<String>>>,
    pub status: Arc<Mutex<u16>>,
    /// Time HEAD and GET take before answering
    pub head_delay: Arc<Mutex<Duration>>,
    pub get_delay: Arc<Mutex<Duration>>,
}

impl BundleServer {
    /// `etag` is sent verbatim as the ETag header value
    pub async fn start(body: Vec<u8>, etag: Option<String>) -> Self {
        use axum::{
            body::Body,
            http::{header, Method, StatusCode},
            response::{IntoResponse, Response},
            routing::get,
            Router,
        };

        let heads = Arc::new(AtomicUsize::new(0));
        let gets = Arc::new(AtomicUsize::new(0));
        let body = Arc::new(Mutex::new(body));
        let etag = Arc::new(Mutex::new(etag));
        let status = Arc::new(Mutex::new(200u16));
        let head_delay = Arc::new(Mutex::new(Duration::ZERO));
        let get_delay = Arc::new(Mutex::new(Duration::ZERO));

        let app = Router::new().route(
            "/iot.tgz",
            get({
                let heads = heads.clone();
                let gets = gets.clone();
                let body = body.clone();
                let etag = etag.clone();
                let status = status.clone();
                let head_delay = head_delay.clone();
                let get_delay = get_delay.clone();
                move |method: Method| async move {
                    let delay = if method == Method::HEAD {
                        heads.fetch_add(1, Ordering::SeqCst);
                        *head_delay.lock().unwrap()
                    } else {
                        gets.fetch_add(1, Ordering::SeqCst);
                        *get_delay.lock().unwrap()
                    };
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let code = StatusCode::from_u16(*status.lock().unwrap()).unwrap();
                    if code != StatusCode::OK {
                        return (code, "no bundle").into_response();
                    }

                    let mut response = Response::builder().status(StatusCode::OK);
                    if let Some(etag) = etag.lock().unwrap().clone() {
                        response = response.header(header::ETAG, etag);
                    }
                    response
                        .body(Body::from(body.lock().unwrap().clone()))
                        .unwrap()
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            heads,
            gets,
            body,
            etag,
            status,
            head_delay,
            get_delay,
        }
    }

    /// Domain suffix that, with [`Self::client_for`], routes `<app>.<suffix>` here
    pub fn suffix(&self) -> String {
        format!("gadget.test:{}", self.addr.port())
    }

    /// HTTP client resolving `<app>.gadget.test` to this server
    pub fn client_for(&self, app_name: &str) -> reqwest::Client {
        reqwest::Client::builder()
            .resolve(&format!("{}.gadget.test", app_name), self.addr)
            .build()
            .unwrap()
    }

    pub fn heads(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, status: u16) {
        *self.status.lock().unwrap() = status;
    }

    pub fn set_head_delay(&self, delay: Duration) {
        *self.head_delay.lock().unwrap() = delay;
    }

    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = delay;
    }
}

pub fn token_path(config: &AgentConfig, app: &str) -> PathBuf {
    config.token.app_dir(app).join(&config.token.token_file)
}
