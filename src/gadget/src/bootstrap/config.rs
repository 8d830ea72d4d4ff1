/// Agent configuration
/// Loaded from gadget.toml
use crate::common::{RegistryAuth, DEFAULT_IMAGE_PREFIX};
use crate::error::ReconcileError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name searched for when no explicit path is given
pub const CONFIG_FILE_NAME: &str = "gadget.toml";

/// Agent configuration
/// Loaded from gadget.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub device: DeviceConfig,
    pub app: AppConfig,
    pub build: BuildConfig,
    pub token: TokenConfig,
    pub network: NetworkConfig,
    pub retry: RetryConfig,
    /// Private registry credentials (optional)
    pub registry: Option<RegistryAuth>,
    pub runtime: RuntimeConfig,
    pub provider: ProviderConfig,
    pub schedule: ScheduleConfig,
    pub shutdown: ShutdownConfig,
}

impl AgentConfig {
    /// Load configuration from `path`, or search the default locations.
    pub fn load(path: Option<&Path>) -> Result<Self, ReconcileError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let config_paths = vec![
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from("/etc/gadget").join(CONFIG_FILE_NAME),
        ];

        for path in config_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        tracing::warn!("No {} found, using defaults", CONFIG_FILE_NAME);
        Ok(Self::default())
    }

    /// Parse a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ReconcileError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReconcileError::Validation(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: AgentConfig = toml::from_str(&content).map_err(|e| {
            ReconcileError::Validation(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        tracing::info!("Loaded agent config from {:?}", path);
        Ok(config)
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        let invalid = |msg: &str| Err(ReconcileError::Validation(msg.to_string()));

        if self.device.my_id.trim().is_empty() {
            return invalid("device.my_id must not be empty");
        }
        if self.app.protocol.trim().is_empty() || self.app.suffix.trim().is_empty() {
            return invalid("app.protocol and app.suffix must not be empty");
        }
        if self.app.bundle_file.trim().is_empty() {
            return invalid("app.bundle_file must not be empty");
        }
        if self.build.build_dir.as_os_str().is_empty() {
            return invalid("build.build_dir must not be empty");
        }
        if self.build.fetch_timeout_secs == 0 || self.build.download_timeout_secs == 0 {
            return invalid("build timeouts must be greater than zero");
        }
        if self.token.token_file.trim().is_empty() || self.token.token_file.contains('/') {
            return invalid("token.token_file must be a plain file name");
        }
        if self.token.internal_prefix.is_some() != self.token.host_prefix.is_some() {
            return invalid("token.internal_prefix and token.host_prefix must be set together");
        }
        if let Some(prefix) = &self.token.internal_prefix {
            if !self.token.token_dir.starts_with(prefix) {
                return invalid("token.token_dir must be under token.internal_prefix");
            }
        }
        if self.network.default_name.trim().is_empty()
            || self.network.privileged_name.trim().is_empty()
        {
            return invalid("network names must not be empty");
        }
        if self.runtime.request_timeout_secs == 0 {
            return invalid("runtime.request_timeout_secs must be greater than zero");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be greater than zero");
        }
        if let Some(auth) = &self.registry {
            if auth.username.is_empty() || auth.password.is_empty() || auth.address.is_empty() {
                return invalid("registry username, password and address must all be set");
            }
        }
        if self.schedule.refresh_interval_secs == 0 {
            return invalid("schedule.refresh_interval_secs must be greater than zero");
        }
        match &self.provider {
            ProviderConfig::File { state_file, .. } if state_file.as_os_str().is_empty() => {
                invalid("provider.state_file must not be empty")
            }
            ProviderConfig::Http { base_url, .. } if base_url.trim().is_empty() => {
                invalid("provider.base_url must not be empty")
            }
            _ => Ok(()),
        }
    }
}

/// This device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Own device id, also used as the container hostname
    pub my_id: String,
    /// Host devices the app may access
    pub devices: Vec<String>,
    /// Path of the trusted public key file, passed to the app
    pub trusted_pub_key_file: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            my_id: "gadget-device".to_string(),
            devices: Vec::new(),
            trusted_pub_key_file: None,
        }
    }
}

/// How apps are addressed on their origin server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// e.g. "https"
    pub protocol: String,
    /// e.g. "cafjs.com"
    pub suffix: String,
    /// Bundle file served by the app origin, e.g. "iot.tgz"
    pub bundle_file: String,
    /// Command override for the app container; empty keeps the image default
    pub container_cmd: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            protocol: "https".to_string(),
            suffix: "cafjs.com".to_string(),
            bundle_file: "iot.tgz".to_string(),
            container_cmd: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Well-known bundle URL: `protocol://name.suffix/file`
    pub fn bundle_url(&self, app_name: &str) -> String {
        format!(
            "{}://{}.{}/{}",
            self.protocol, app_name, self.suffix, self.bundle_file
        )
    }
}

/// Image build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Scratch build directory; the context archive is written next to it
    pub build_dir: PathBuf,
    /// Dockerfile template for normal apps (embedded default when unset)
    pub dockerfile: Option<PathBuf>,
    /// Dockerfile template for privileged apps (embedded default when unset)
    pub dockerfile_privileged: Option<PathBuf>,
    /// Repository prefix of built images
    pub image_prefix: String,
    /// Bound on the fingerprint (HEAD) request
    pub fetch_timeout_secs: u64,
    /// Bound on the bundle download
    pub download_timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from("/tmp/gadget/build"),
            dockerfile: None,
            dockerfile_privileged: None,
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
            fetch_timeout_secs: 30,
            download_timeout_secs: 600,
        }
    }
}

impl BuildConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Token provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Root of per-app token directories, as seen by this process
    pub token_dir: PathBuf,
    /// Token file name inside the app's token directory
    pub token_file: String,
    /// Mount prefix of `token_dir` inside this process's container
    pub internal_prefix: Option<PathBuf>,
    /// Host path that `internal_prefix` corresponds to
    pub host_prefix: Option<PathBuf>,
    /// Mount point of the token directory inside the app container
    pub container_dir: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            token_dir: PathBuf::from("/config/tokens"),
            token_file: "token".to_string(),
            internal_prefix: None,
            host_prefix: None,
            container_dir: "/config".to_string(),
        }
    }
}

impl TokenConfig {
    /// Token directory of one app, as seen by this process
    pub fn app_dir(&self, app_name: &str) -> PathBuf {
        self.token_dir.join(app_name)
    }

    /// Host path the app container must bind-mount for `dir`.
    ///
    /// Paths outside `internal_prefix`, or with no prefixes configured, are unchanged.
    pub fn host_path(&self, dir: &Path) -> PathBuf {
        match (&self.internal_prefix, &self.host_prefix) {
            (Some(internal), Some(host)) => match dir.strip_prefix(internal) {
                Ok(rest) => host.join(rest),
                Err(_) => dir.to_path_buf(),
            },
            _ => dir.to_path_buf(),
        }
    }

    /// Token file path inside the app container
    pub fn container_file(&self) -> String {
        format!(
            "{}/{}",
            self.container_dir.trim_end_matches('/'),
            self.token_file
        )
    }
}

/// Networks apps join
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub default_name: String,
    pub privileged_name: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_name: "gadget-net".to_string(),
            privileged_name: "gadget-privileged-net".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn for_app(&self, privileged: bool) -> &str {
        if privileged {
            &self.privileged_name
        } else {
            &self.default_name
        }
    }
}

/// Reconcile retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per reconcile, including the first
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Container engine connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker socket path; platform defaults when unset
    pub docker_socket: Option<String>,
    /// Seconds the engine waits before killing a stopping container
    pub stop_timeout_secs: u32,
    /// Seconds a single engine request may take, image builds included
    pub request_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: Some("/var/run/docker.sock".to_string()),
            stop_timeout_secs: 10,
            request_timeout_secs: 900,
        }
    }
}

impl RuntimeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Where the desired state comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// JSON file written by a companion process
    File {
        state_file: PathBuf,
        /// Defaults to `<state_file>.status`
        #[serde(default)]
        status_file: Option<PathBuf>,
    },
    /// Control plane over HTTP
    Http {
        base_url: String,
        #[serde(default = "default_provider_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_provider_timeout_secs() -> u64 {
    30
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::File {
            state_file: PathBuf::from("/config/desired.json"),
            status_file: None,
        }
    }
}

/// Periodic refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub refresh_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
        }
    }
}

impl ScheduleConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Behaviour on graceful shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Stop and remove the managed app once the queue has drained
    pub stop_app_on_shutdown: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_app_on_shutdown: true,
        }
    }
}
