//! Reconciler: converges the single managed app container to the desired state.
//!
//! Every method here is meant to be called from the intent loop's worker only, one command
//! at a time. The child registry is shared so that [`Reconciler::current_app_info`] can be
//! read from outside, but it is only written here.

use crate::app_spec::{
    AppStatus, ChildRegistry, CurrentAppInfo, DesiredState, ImageInfo, ManagedChild,
};
use crate::bootstrap::cleanup::Cleanup;
use crate::bootstrap::config::{
    AgentConfig, AppConfig, DeviceConfig, NetworkConfig, RetryConfig, TokenConfig,
};
use crate::bootstrap::image_builder::ImageBuilder;
use crate::bootstrap::retry::retry_with_delay;
use crate::common::{ContainerRunSpec, RuntimeClient};
use crate::error::ReconcileError;
use crate::intent::Command;
use crate::state::DesiredStateProvider;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Separator between publisher and local name in an app name
pub const NAME_SEPARATOR: char = '-';

/// Environment the agent derives itself; app properties cannot replace these
pub const RESERVED_ENV: &[&str] = &[
    "MY_ID",
    "APP_NAME",
    "APP_PUBLISHER",
    "APP_LOCAL_NAME",
    "APP_PROTOCOL",
    "APP_SUFFIX",
    "TOKEN_FILE",
    "NETWORK_NAME",
    "DEVICES",
    "TRUSTED_PUB_KEY_FILE",
];

/// Label carrying the app name on managed containers
pub const APP_LABEL: &str = "gadget.app";
/// Label carrying the bundle fingerprint on managed containers
pub const ETAG_LABEL: &str = "gadget.etag";

pub struct Reconciler {
    runtime: Arc<dyn RuntimeClient>,
    provider: Arc<dyn DesiredStateProvider>,
    builder: Arc<dyn ImageBuilder>,
    cleanup: Cleanup,
    device: DeviceConfig,
    app: AppConfig,
    token: TokenConfig,
    network: NetworkConfig,
    retry: RetryConfig,
    children: Arc<RwLock<ChildRegistry>>,
}

impl Reconciler {
    pub fn new(
        config: &AgentConfig,
        runtime: Arc<dyn RuntimeClient>,
        provider: Arc<dyn DesiredStateProvider>,
        builder: Arc<dyn ImageBuilder>,
    ) -> Self {
        Self {
            cleanup: Cleanup::new(runtime.clone()),
            runtime,
            provider,
            builder,
            device: config.device.clone(),
            app: config.app.clone(),
            token: config.token.clone(),
            network: config.network.clone(),
            retry: config.retry.clone(),
            children: Arc::new(RwLock::new(ChildRegistry::new())),
        }
    }

    /// Shared view of the child registry
    pub fn registry(&self) -> Arc<RwLock<ChildRegistry>> {
        self.children.clone()
    }

    pub fn current_app_info(&self) -> Result<Option<CurrentAppInfo>, ReconcileError> {
        read_registry(&self.children)?.current_info()
    }

    /// Run a command, retrying the whole cycle on retryable failures.
    pub async fn execute(&self, command: &Command) -> Result<(), ReconcileError> {
        retry_with_delay(&self.retry, command.label(), || self.execute_once(command)).await
    }

    async fn execute_once(&self, command: &Command) -> Result<(), ReconcileError> {
        match command {
            Command::Refresh => self.reconcile().await,
            Command::Start(name) => self.start_named(name).await,
            Command::Stop(name) => self.stop_named(name).await,
            Command::Update(name) => self.update_named(name).await,
        }
    }

    /// One reconcile cycle: fetch, diff, converge.
    pub async fn reconcile(&self) -> Result<(), ReconcileError> {
        self.reap().await?;

        let desired = self.provider.get_state().await?;
        let current = self.current_app_info()?;

        if !self.has_changed(current.as_ref(), &desired).await? {
            tracing::debug!("[Reconciler] No change, nothing to do");
            return Ok(());
        }

        tracing::info!(
            "[Reconciler] Desired state changed: {:?} -> {:?}",
            current.as_ref().map(|c| c.app_name.as_str()),
            desired.app_name
        );

        self.stop().await?;
        if desired.app_name.is_some() {
            self.start(&desired).await?;
        }
        Ok(())
    }

    async fn has_changed(
        &self,
        current: Option<&CurrentAppInfo>,
        desired: &DesiredState,
    ) -> Result<bool, ReconcileError> {
        match (current, desired.app_name.as_deref()) {
            (None, None) => Ok(false),
            (None, Some(_)) | (Some(_), None) => Ok(true),
            (Some(info), Some(_)) => {
                if !info.same_identity(desired) {
                    return Ok(true);
                }
                let changed = self
                    .builder
                    .has_etag_changed(&info.app_name, &info.etag)
                    .await?;
                if changed {
                    tracing::info!("[Reconciler] Bundle of {} changed", info.app_name);
                }
                Ok(changed)
            }
        }
    }

    /// Drop the record of a child whose container is no longer running.
    async fn reap(&self) -> Result<(), ReconcileError> {
        let container_id = match read_registry(&self.children)?.current()? {
            Some(child) => child.container_id.clone(),
            None => return Ok(()),
        };

        if self.runtime.container_running(&container_id).await? {
            return Ok(());
        }

        tracing::warn!(
            "[Reconciler] Container {} is no longer running, treating app as absent",
            container_id
        );
        if let Err(e) = self
            .cleanup
            .eliminate_containers(std::slice::from_ref(&container_id))
            .await
        {
            tracing::warn!(
                "[Reconciler] Failed to clean up exited container {}: {}",
                container_id,
                e
            );
        }
        write_registry(&self.children)?.remove(&container_id);
        Ok(())
    }

    /// Stop the managed app. No-op when nothing runs.
    pub async fn stop(&self) -> Result<(), ReconcileError> {
        let child = match read_registry(&self.children)?.current()? {
            Some(child) => child.clone(),
            None => return Ok(()),
        };

        tracing::info!(
            "[Reconciler] Stopping {} (container {})",
            child.info.app_name,
            child.container_id
        );
        self.cleanup
            .eliminate_containers(std::slice::from_ref(&child.container_id))
            .await?;
        write_registry(&self.children)?.remove(&child.container_id);
        Ok(())
    }

    /// Start the app `desired` names. Nothing may be running.
    pub async fn start(&self, desired: &DesiredState) -> Result<(), ReconcileError> {
        let name = desired
            .app_name
            .as_deref()
            .ok_or_else(|| ReconcileError::Validation("No app to start".to_string()))?;
        let token = desired
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ReconcileError::MissingToken(name.to_string()))?;
        let (publisher, local_name) = split_app_name(name)?;
        let property_env = desired.meta.property_env()?;

        self.provider.update_status(AppStatus::Starting).await?;

        let image = self.builder.build_image(name, &desired.meta).await?;

        let token_dir = self.token.app_dir(name);
        tokio::fs::create_dir_all(&token_dir).await?;
        tokio::fs::write(token_dir.join(&self.token.token_file), token).await?;
        let host_dir = self.token.host_path(&token_dir);
        tracing::debug!(
            "[Reconciler] Token for {} written to {:?} (host path {:?})",
            name,
            token_dir,
            host_dir
        );

        let network = self.network.for_app(desired.meta.privileged).to_string();
        if self.runtime.find_network(&network).await?.is_none() {
            return Err(ReconcileError::NotFound(format!(
                "Network {} does not exist",
                network
            )));
        }

        let mut env = vec![
            format!("MY_ID={}", self.device.my_id),
            format!("APP_NAME={}", name),
            format!("APP_PUBLISHER={}", publisher),
            format!("APP_LOCAL_NAME={}", local_name),
            format!("APP_PROTOCOL={}", self.app.protocol),
            format!("APP_SUFFIX={}", self.app.suffix),
            format!("TOKEN_FILE={}", self.token.container_file()),
            format!("NETWORK_NAME={}", network),
        ];
        if !self.device.devices.is_empty() {
            env.push(format!("DEVICES={}", self.device.devices.join(",")));
        }
        if let Some(key_file) = &self.device.trusted_pub_key_file {
            env.push(format!("TRUSTED_PUB_KEY_FILE={}", key_file));
        }
        for entry in property_env {
            let key = entry.split('=').next().unwrap_or_default();
            if RESERVED_ENV.contains(&key) {
                tracing::warn!("[Reconciler] Ignoring property {} of {}: reserved", key, name);
                continue;
            }
            env.push(entry);
        }

        let spec = ContainerRunSpec {
            name: name.to_string(),
            image: image.id.clone(),
            hostname: Some(self.device.my_id.clone()),
            cmd: self.app.container_cmd.clone(),
            env,
            binds: vec![format!(
                "{}:{}",
                host_dir.display(),
                self.token.container_dir
            )],
            network,
            privileged: desired.meta.privileged,
            devices: self.device.devices.clone(),
            labels: HashMap::from([
                (APP_LABEL.to_string(), name.to_string()),
                (ETAG_LABEL.to_string(), image.etag.clone()),
            ]),
        };

        self.cleanup.eliminate_by_name(name).await?;
        let container_id = self.runtime.run_container(&spec).await?;
        tracing::info!(
            "[Reconciler] Started {} in container {} (image {})",
            name,
            container_id,
            image.id
        );

        let child = ManagedChild {
            container_id: container_id.clone(),
            info: app_info(name, token, desired, image, &token_dir),
        };
        if let Err(e) = self.finish_start(child).await {
            tracing::warn!(
                "[Reconciler] Start of {} failed after container creation, removing {}: {}",
                name,
                container_id,
                e
            );
            if let Err(cleanup_err) = self
                .cleanup
                .eliminate_containers(std::slice::from_ref(&container_id))
                .await
            {
                tracing::warn!(
                    "[Reconciler] Failed to remove {}: {}",
                    container_id,
                    cleanup_err
                );
            }
            if let Ok(mut registry) = write_registry(&self.children) {
                registry.remove(&container_id);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn finish_start(&self, child: ManagedChild) -> Result<(), ReconcileError> {
        write_registry(&self.children)?.register(child);
        // A second record means something else registered an app meanwhile
        read_registry(&self.children)?.current()?;
        self.provider.update_status(AppStatus::Running).await?;
        Ok(())
    }

    async fn start_named(&self, name: &str) -> Result<(), ReconcileError> {
        if self.current_app_info()?.is_some() {
            tracing::debug!("[Reconciler] Start({}): an app is already running", name);
            return Ok(());
        }
        let desired = self.provider.get_state().await?;
        if desired.app_name.as_deref() != Some(name) {
            tracing::info!("[Reconciler] Start({}): not the desired app, ignoring", name);
            return Ok(());
        }
        self.start(&desired).await
    }

    async fn stop_named(&self, name: &str) -> Result<(), ReconcileError> {
        match self.current_app_info()? {
            Some(info) if info.app_name == name => self.stop().await,
            _ => {
                tracing::debug!("[Reconciler] Stop({}): not running", name);
                Ok(())
            }
        }
    }

    async fn update_named(&self, name: &str) -> Result<(), ReconcileError> {
        let desired = self.provider.get_state().await?;
        if desired.app_name.as_deref() != Some(name) {
            tracing::info!("[Reconciler] Update({}): not the desired app, ignoring", name);
            return Ok(());
        }
        self.stop().await?;
        self.start(&desired).await
    }
}

fn app_info(
    name: &str,
    token: &str,
    desired: &DesiredState,
    image: ImageInfo,
    token_dir: &Path,
) -> CurrentAppInfo {
    CurrentAppInfo {
        app_name: name.to_string(),
        etag: image.etag,
        meta: desired.meta.clone(),
        token: token.to_string(),
        image_id: image.id,
        token_dir: token_dir.to_path_buf(),
    }
}

/// Split `publisher-localname`.
///
/// Both parts are limited to `[A-Za-z0-9_.]` without `..`: the name becomes a directory
/// under the token dir and a host name in the bundle URL.
pub fn split_app_name(name: &str) -> Result<(&str, &str), ReconcileError> {
    let mut parts = name.split(NAME_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(publisher), Some(local), None) if is_name_part(publisher) && is_name_part(local) => {
            Ok((publisher, local))
        }
        _ => Err(ReconcileError::Validation(format!(
            "Invalid app name {}, expected <publisher>{}<name> of [A-Za-z0-9_.]",
            name, NAME_SEPARATOR
        ))),
    }
}

fn is_name_part(part: &str) -> bool {
    !part.is_empty()
        && !part.contains("..")
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

pub(crate) fn read_registry(
    children: &RwLock<ChildRegistry>,
) -> Result<RwLockReadGuard<'_, ChildRegistry>, ReconcileError> {
    children
        .read()
        .map_err(|_| ReconcileError::Invariant("child registry lock poisoned".to_string()))
}

fn write_registry(
    children: &RwLock<ChildRegistry>,
) -> Result<RwLockWriteGuard<'_, ChildRegistry>, ReconcileError> {
    children
        .write()
        .map_err(|_| ReconcileError::Invariant("child registry lock poisoned".to_string()))
}
