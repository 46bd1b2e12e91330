//! OCI image reference parsing.
//!
//! Parses references like `ghcr.io/org/bundle@sha256:...` into structured
//! components and derives the related references the resolver needs:
//! colocated copies, digest-derived tags and normalized location strings.

use bundlegraph_core::error::{BundleError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/bundle")
    pub repository: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `myregistry.io:5000/org/app:v1` → myregistry.io:5000/org/app:v1
    /// - `ghcr.io/org/app@sha256:abc...` → ghcr.io/org/app@sha256:abc...
    /// - `ghcr.io/org/app:v1@sha256:abc...` keeps both tag and digest
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BundleError::InvalidReference(
                "Empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest_part = &reference[at_pos + 1..];
                validate_digest(digest_part).map_err(|reason| {
                    BundleError::InvalidReference(format!(
                        "Invalid digest in reference '{}': {}",
                        reference, reason
                    ))
                })?;
                (&reference[..at_pos], Some(digest_part.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        let (registry, repository) = split_registry_repository(name, reference)?;

        // Apply default tag only when nothing pins the content
        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.repository_path();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// `registry/repository` without tag or digest.
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Whether the reference pins content by digest.
    pub fn is_digest_qualified(&self) -> bool {
        self.digest.is_some()
    }

    /// The content digest, or an error naming the tag-only reference.
    pub fn require_digest(&self) -> Result<&str> {
        self.digest.as_deref().ok_or_else(|| {
            BundleError::InvalidReference(format!(
                "Expected a digest-qualified reference, got '{}'",
                self.full_reference()
            ))
        })
    }

    /// Same repository pinned to `digest`; any tag is dropped.
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.into()),
        }
    }

    /// Same repository addressed by `tag`; any digest is dropped.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.into()),
            digest: None,
        }
    }

    /// This reference's digest moved into `other`'s repository.
    ///
    /// This is the colocated location of an artifact relative to a bundle.
    pub fn in_repository_of(&self, other: &ImageReference) -> Result<Self> {
        Ok(other.with_digest(self.require_digest()?))
    }

    /// Tag derived from the digest: `<algorithm>-<hex>.<suffix>`.
    ///
    /// The same digest maps to the same tag in every repository.
    pub fn digest_tag(&self, suffix: &str) -> Result<String> {
        let digest = self.require_digest()?;
        let (algorithm, hex) = digest.split_once(':').ok_or_else(|| {
            BundleError::InvalidReference(format!("Malformed digest '{}'", digest))
        })?;
        Ok(format!("{}-{}.{}", algorithm, hex, suffix))
    }

    /// Whether both references live in the same registry repository.
    pub fn same_repository(&self, other: &ImageReference) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn validate_digest(digest: &str) -> std::result::Result<(), &'static str> {
    let (algorithm, hex) = digest
        .split_once(':')
        .ok_or("expected algorithm:hex")?;
    if algorithm.is_empty() || hex.is_empty() {
        return Err("expected algorithm:hex");
    }
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("digest must be hex encoded");
    }
    Ok(())
}

/// Split `name[:tag]`, where the tag colon must come after the last slash
/// and a purely numeric suffix on a single-component name is a port.
fn split_tag(name_tag: &str) -> (&str, Option<String>) {
    let search_from = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    match name_tag[search_from..].rfind(':') {
        Some(colon) => {
            let colon = search_from + colon;
            let after = &name_tag[colon + 1..];
            if search_from == 0 && after.chars().all(|c| c.is_ascii_digit()) {
                (name_tag, None)
            } else {
                (&name_tag[..colon], Some(after.to_string()))
            }
        }
        None => (name_tag, None),
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(name: &str, original: &str) -> Result<(String, String)> {
    if let Some(slash_pos) = name.find('/') {
        let first = &name[..slash_pos];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let repo = &name[slash_pos + 1..];
            if repo.is_empty() {
                return Err(BundleError::InvalidReference(format!(
                    "Empty repository in reference '{}'",
                    original
                )));
            }
            return Ok((first.to_string(), repo.to_string()));
        }
    }

    if name.is_empty() {
        return Err(BundleError::InvalidReference(format!(
            "Empty repository in reference '{}'",
            original
        )));
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };

    Ok((DEFAULT_REGISTRY.to_string(), repository))
}
