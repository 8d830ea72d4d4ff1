/// Image naming types
use serde::{Deserialize, Serialize};

/// Default repository prefix for locally built app images
pub const DEFAULT_IMAGE_PREFIX: &str = "localhost.localdomain:5000/";

/// Path component appended to the repository of images built from the privileged Dockerfile
pub const PRIVILEGED_REPOSITORY_SUFFIX: &str = "/privileged";

/// Longest tag the engine accepts
const MAX_TAG_LEN: usize = 128;

/// Canonical reference of an app image, the cache key for image reuse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTag {
    /// Repository part including the prefix (e.g. "localhost.localdomain:5000/pub-app1")
    pub repository: String,

    /// Tag part, derived from the fingerprint
    pub tag: String,
}

impl ImageTag {
    /// Build the canonical tag for an app bundle.
    ///
    /// The repository is lowercased and the tag restricted to `[A-Za-z0-9_.-]`, both of
    /// which the engine requires. Privileged builds get their own repository: a sanitized
    /// name never contains `/`, so no etag or name can produce the same reference.
    pub fn canonical(prefix: &str, name: &str, etag: &str, privileged: bool) -> Self {
        let mut repository = format!("{}{}", prefix, sanitize_repository(name));
        if privileged {
            repository.push_str(PRIVILEGED_REPOSITORY_SUFFIX);
        }

        let tag: String = sanitize_tag(etag).chars().take(MAX_TAG_LEN).collect();

        Self { repository, tag }
    }

    /// Full `repository:tag` reference
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl std::fmt::Display for ImageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

fn sanitize_repository(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn sanitize_tag(etag: &str) -> String {
    let mut tag: String = etag
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    // Tags may not start with '.' or '-'
    if tag.starts_with('.') || tag.starts_with('-') {
        tag.insert(0, '_');
    }
    tag
}

/// Private registry authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    /// Username
    pub username: String,

    /// Password or token
    pub password: String,

    /// Registry server address (e.g. "registry.example.com:5000")
    pub address: String,
}
