/// Image builder for app bundles: fingerprint, cache lookup, verified download, build
use crate::app_spec::{AppMeta, ImageInfo};
use crate::bootstrap::config::{AppConfig, BuildConfig};
use crate::bootstrap::templates::DockerfileRenderer;
use crate::common::{ImageTag, RegistryAuth, RuntimeClient};
use crate::error::ReconcileError;
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Directory inside an extracted bundle that becomes the build context
pub const PACKAGE_DIR: &str = "package";

/// Produces ready-to-run images for apps. Injected into the reconciler.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Built or cached image for `(name, meta)`
    async fn build_image(&self, name: &str, meta: &AppMeta) -> Result<ImageInfo, ReconcileError>;

    /// Whether the bundle fingerprint moved away from `old_etag`
    async fn has_etag_changed(&self, name: &str, old_etag: &str) -> Result<bool, ReconcileError>;
}

/// Builds app images from `.tgz` bundles served by the app's origin.
pub struct BundleImageBuilder {
    runtime: Arc<dyn RuntimeClient>,
    client: reqwest::Client,
    app: AppConfig,
    build: BuildConfig,
    registry: Option<RegistryAuth>,
    dockerfiles: DockerfileRenderer,
}

impl BundleImageBuilder {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        app: AppConfig,
        build: BuildConfig,
        registry: Option<RegistryAuth>,
    ) -> Result<Self, ReconcileError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ReconcileError::Validation(format!("Failed to build HTTP client: {}", e)))?;
        Self::with_http_client(runtime, app, build, registry, client)
    }

    /// Same as [`BundleImageBuilder::new`] with a caller-supplied HTTP client
    pub fn with_http_client(
        runtime: Arc<dyn RuntimeClient>,
        app: AppConfig,
        build: BuildConfig,
        registry: Option<RegistryAuth>,
        client: reqwest::Client,
    ) -> Result<Self, ReconcileError> {
        let dockerfiles = DockerfileRenderer::from_config(&build)?;

        tracing::info!(
            "[ImageBuilder] Initialized with build dir: {:?}",
            build.build_dir
        );

        Ok(Self {
            runtime,
            client,
            app,
            build,
            registry,
            dockerfiles,
        })
    }

    /// Fingerprint of the bundle at `url`, from a HEAD request.
    pub async fn get_etag(&self, url: &str) -> Result<String, ReconcileError> {
        let response = self
            .client
            .head(url)
            .timeout(self.build.fetch_timeout())
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let message = format!("Cannot get bundle header from {}: status {}", url, status);
            return Err(if status == reqwest::StatusCode::NOT_FOUND {
                ReconcileError::NotFound(message)
            } else {
                ReconcileError::Http(message)
            });
        }

        let header = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ReconcileError::NotFound(format!("No etag for {}", url)))?;

        parse_etag(header)
    }

    /// Id of a local image carrying the canonical tag, if any.
    pub async fn get_image_id(
        &self,
        name: &str,
        etag: &str,
        privileged: bool,
    ) -> Result<Option<String>, ReconcileError> {
        let reference = self.tag_for(name, etag, privileged).reference();
        let images = self.runtime.list_images().await?;

        Ok(images
            .into_iter()
            .find(|image| image.repo_tags.iter().any(|t| *t == reference))
            .map(|image| image.id))
    }

    fn tag_for(&self, name: &str, etag: &str, privileged: bool) -> ImageTag {
        ImageTag::canonical(&self.build.image_prefix, name, etag, privileged)
    }

    /// Stream the bundle to `dest`, hashing as it arrives, and verify it against `etag`.
    async fn download_bundle(
        &self,
        url: &str,
        dest: &Path,
        etag: &str,
    ) -> Result<(), ReconcileError> {
        let response = self
            .client
            .get(url)
            .timeout(self.build.download_timeout())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReconcileError::Http(format!(
                "Bundle server returned {} for {}",
                status, url
            )));
        }

        let mut file = fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut total_bytes: u64 = 0;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            total_bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;

        let actual = format!("{:x}", hasher.finalize());
        if !fingerprint_matches(etag, &actual) {
            tracing::warn!(
                "[ImageBuilder] Bundle verification failed for {}: expected {}, got {}",
                url,
                etag,
                actual
            );
            let _ = fs::remove_file(dest).await;
            return Err(ReconcileError::Integrity {
                expected: etag.to_string(),
                actual,
            });
        }

        tracing::debug!(
            "[ImageBuilder] Downloaded {} bytes from {} (verified)",
            total_bytes,
            url
        );
        Ok(())
    }

    async fn new_image(
        &self,
        name: &str,
        etag: &str,
        privileged: bool,
    ) -> Result<String, ReconcileError> {
        let url = self.app.bundle_url(name);
        let dir = self.build.build_dir.clone();
        let bundle_path = sibling(&dir, "tgz");
        let archive_path = sibling(&dir, "tar");

        // Best-effort cleanup of the previous build
        let _ = fs::remove_dir_all(&dir).await;
        let _ = fs::remove_file(&archive_path).await;
        let _ = fs::remove_file(&bundle_path).await;
        fs::create_dir_all(&dir).await?;

        self.download_bundle(&url, &bundle_path, etag).await?;
        extract_bundle(bundle_path.clone(), dir.clone()).await?;
        let _ = fs::remove_file(&bundle_path).await;

        let package_dir = dir.join(PACKAGE_DIR);
        if !fs::metadata(&package_dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(ReconcileError::NotFound(format!(
                "Bundle from {} has no {}/ directory",
                url, PACKAGE_DIR
            )));
        }

        let dockerfile = self.dockerfiles.render(name, etag, privileged)?;
        fs::write(dir.join("Dockerfile"), &dockerfile).await?;
        fs::write(package_dir.join("Dockerfile"), &dockerfile).await?;

        pack_context(package_dir, archive_path.clone()).await?;

        let tag = self.tag_for(name, etag, privileged);
        tracing::info!("[ImageBuilder] Building image {}", tag);
        let output = self
            .runtime
            .build_image(&archive_path, &tag.reference(), self.registry.as_ref())
            .await?;
        tracing::debug!(
            "[ImageBuilder] Build of {} finished ({} output lines)",
            tag,
            output.lines.len()
        );

        // The engine does not always hand back a usable id, so confirm by listing
        self.get_image_id(name, etag, privileged)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("Image {} missing after build", tag)))
    }
}

#[async_trait]
impl ImageBuilder for BundleImageBuilder {
    async fn build_image(&self, name: &str, meta: &AppMeta) -> Result<ImageInfo, ReconcileError> {
        let url = self.app.bundle_url(name);
        let etag = self.get_etag(&url).await?;

        if let Some(id) = self.get_image_id(name, &etag, meta.privileged).await? {
            tracing::info!("[ImageBuilder] Image for {} ({}) found in cache: {}", name, etag, id);
            return Ok(ImageInfo { etag, id });
        }

        tracing::info!("[ImageBuilder] Image for {} ({}) not cached, building", name, etag);
        let id = self.new_image(name, &etag, meta.privileged).await?;
        Ok(ImageInfo { etag, id })
    }

    async fn has_etag_changed(&self, name: &str, old_etag: &str) -> Result<bool, ReconcileError> {
        let etag = self.get_etag(&self.app.bundle_url(name)).await?;
        Ok(etag != old_etag)
    }
}

/// Bare fingerprint from an `ETag` header value.
///
/// Weak validators are rejected; surrounding quotes are stripped.
pub fn parse_etag(header: &str) -> Result<String, ReconcileError> {
    let value = header.trim();
    if value.starts_with("W/") {
        return Err(ReconcileError::NotFound(format!(
            "Weak etag is not a content fingerprint: {}",
            value
        )));
    }

    let bare = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .trim();
    if bare.is_empty() {
        return Err(ReconcileError::NotFound("Empty etag".to_string()));
    }
    Ok(bare.to_string())
}

/// Whether a hex SHA-256 digest matches a fingerprint, optionally `sha256:`-prefixed.
pub fn fingerprint_matches(etag: &str, actual_hex: &str) -> bool {
    let expected = etag.strip_prefix("sha256:").unwrap_or(etag);
    expected.eq_ignore_ascii_case(actual_hex)
}

/// `dir` with `.ext` appended to its last component
fn sibling(dir: &Path, ext: &str) -> PathBuf {
    let mut name = OsString::from(dir.as_os_str());
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

async fn extract_bundle(bundle: PathBuf, dest: PathBuf) -> Result<(), ReconcileError> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        use flate2::read::GzDecoder;
        use tar::Archive;

        let file = std::fs::File::open(&bundle)?;
        let mut archive = Archive::new(GzDecoder::new(file));
        archive.set_preserve_permissions(false);
        archive.set_preserve_ownerships(false);
        archive.unpack(&dest)
    })
    .await
    .map_err(|e| ReconcileError::Io(std::io::Error::other(e)))??;
    Ok(())
}

async fn pack_context(package_dir: PathBuf, archive: PathBuf) -> Result<(), ReconcileError> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::File::create(&archive)?;
        let mut builder = tar::Builder::new(file);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &package_dir)?;
        builder.into_inner()?.sync_all()
    })
    .await
    .map_err(|e| ReconcileError::Io(std::io::Error::other(e)))??;
    Ok(())
}
