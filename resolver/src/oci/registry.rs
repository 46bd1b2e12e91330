//! Registry capability surface and its OCI distribution implementation.
//!
//! The resolver only ever talks to a registry through the [`Registry`]
//! trait. [`OciRegistry`] implements it with the `oci-distribution` crate
//! against real container registries (Docker Hub, GHCR, Harbor, ...).

use std::collections::HashMap;

use async_trait::async_trait;
use bundlegraph_core::config::{RegistryConfig, RegistryProtocol};
use bundlegraph_core::error::{BundleError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest::{OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use serde::Deserialize;

use super::layers::read_layer_file;
use super::reference::ImageReference;
use crate::lock::{ImagesLock, IMAGES_LOCK_PATH};

/// Media type of the empty config attached to written artifacts.
const EMPTY_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// What a reference resolved to when its config was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestConfig {
    /// Single-manifest image with its config labels
    Image { labels: HashMap<String, String> },
    /// Multi-platform index; it has no config of its own
    Index,
}

/// Registry operations the resolver depends on.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Digest of the manifest `reference` points at.
    async fn digest(&self, reference: &ImageReference) -> Result<String>;

    /// The first candidate location that holds the content.
    ///
    /// Not-found and access-denied answers mean "not here"; any other
    /// failure aborts the probe.
    async fn resolve(&self, candidates: &[ImageReference]) -> Result<ImageReference> {
        for candidate in candidates {
            match self.digest(candidate).await {
                Ok(_) => return Ok(candidate.clone()),
                Err(e) if e.is_absent() => {
                    tracing::debug!(candidate = %candidate, error = %e, "Candidate location absent");
                }
                Err(e) => return Err(e),
            }
        }

        Err(BundleError::ArtifactNotFound {
            reference: candidates
                .iter()
                .map(ImageReference::full_reference)
                .collect::<Vec<_>>()
                .join(", "),
            message: "no candidate location holds the artifact".to_string(),
        })
    }

    /// Config labels of an image, or the fact that it is an index.
    async fn fetch_config(&self, reference: &ImageReference) -> Result<ManifestConfig>;

    /// The images lock carried by a bundle.
    async fn fetch_images_lock(&self, reference: &ImageReference) -> Result<ImagesLock>;

    /// Store `content` as a single-layer artifact at `reference` (a tag).
    ///
    /// Returns the digest of the written manifest.
    async fn write_artifact(
        &self,
        reference: &ImageReference,
        media_type: &str,
        content: Vec<u8>,
    ) -> Result<String>;

    /// Content of the single-layer artifact at `reference`.
    async fn read_artifact(&self, reference: &ImageReference) -> Result<Vec<u8>>;
}

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`.
    ///
    /// Falls back to anonymous if either is unset.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Image config blob, reduced to the labels.
#[derive(Debug, Default, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    config: Option<ContainerConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

/// [`Registry`] backed by `oci-distribution`.
pub struct OciRegistry {
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistry {
    /// Create a registry client with anonymous authentication.
    pub fn new(config: &RegistryConfig) -> Self {
        Self::with_auth(config, RegistryAuth::anonymous())
    }

    /// Create a registry client with the given authentication.
    pub fn with_auth(config: &RegistryConfig, auth: RegistryAuth) -> Self {
        let client = Client::new(ClientConfig {
            protocol: client_protocol(config),
            ..Default::default()
        });
        Self { client, auth }
    }

    async fn pull_manifest(&self, reference: &ImageReference) -> Result<(OciManifest, String)> {
        let oci_ref = to_oci_reference(reference)?;
        self.client
            .pull_manifest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| map_oci_error(reference, "pull manifest", e))
    }

    async fn pull_single_manifest(&self, reference: &ImageReference) -> Result<OciImageManifest> {
        match self.pull_manifest(reference).await? {
            (OciManifest::Image(manifest), _) => Ok(manifest),
            (OciManifest::ImageIndex(_), _) => Err(BundleError::NotABundle {
                reference: reference.full_reference(),
                hint: Some("the reference is a multi-platform index, not a bundle image".to_string()),
            }),
        }
    }

    async fn pull_blob_bytes(
        &self,
        reference: &ImageReference,
        descriptor: &oci_distribution::manifest::OciDescriptor,
    ) -> Result<Vec<u8>> {
        let oci_ref = to_oci_reference(reference)?;
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, descriptor, &mut data)
            .await
            .map_err(|e| map_oci_error(reference, "pull blob", e))?;
        Ok(data)
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn digest(&self, reference: &ImageReference) -> Result<String> {
        let (_manifest, digest) = self.pull_manifest(reference).await?;
        Ok(digest)
    }

    async fn fetch_config(&self, reference: &ImageReference) -> Result<ManifestConfig> {
        let manifest = match self.pull_manifest(reference).await? {
            (OciManifest::ImageIndex(_), _) => return Ok(ManifestConfig::Index),
            (OciManifest::Image(manifest), _) => manifest,
        };

        let data = self.pull_blob_bytes(reference, &manifest.config).await?;
        let blob: ConfigBlob = serde_json::from_slice(&data)?;
        let labels = blob.config.and_then(|c| c.labels).unwrap_or_default();

        tracing::debug!(reference = %reference, labels = labels.len(), "Fetched image config");
        Ok(ManifestConfig::Image { labels })
    }

    async fn fetch_images_lock(&self, reference: &ImageReference) -> Result<ImagesLock> {
        let manifest = self.pull_single_manifest(reference).await?;

        // Later layers shadow earlier ones.
        for layer in manifest.layers.iter().rev() {
            let data = self.pull_blob_bytes(reference, layer).await?;
            if let Some(lock) = read_layer_file(&data, IMAGES_LOCK_PATH)? {
                let yaml = String::from_utf8(lock).map_err(|e| {
                    BundleError::SerializationError(format!(
                        "Images lock of {} is not UTF-8: {}",
                        reference, e
                    ))
                })?;
                return ImagesLock::parse(&yaml);
            }
        }

        Err(BundleError::ArtifactNotFound {
            reference: reference.full_reference(),
            message: format!("bundle has no {}", IMAGES_LOCK_PATH),
        })
    }

    async fn write_artifact(
        &self,
        reference: &ImageReference,
        media_type: &str,
        content: Vec<u8>,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let layers = vec![ImageLayer::new(content, media_type.to_string(), None)];
        let config = Config::new(b"{}".to_vec(), EMPTY_CONFIG_MEDIA_TYPE.to_string(), None);

        let response = self
            .client
            .push(&oci_ref, &layers, config, &self.auth.to_oci_auth(), None)
            .await
            .map_err(|e| map_oci_error(reference, "push artifact", e))?;

        tracing::debug!(
            reference = %reference,
            manifest_url = %response.manifest_url,
            "Artifact pushed"
        );

        self.digest(reference).await
    }

    async fn read_artifact(&self, reference: &ImageReference) -> Result<Vec<u8>> {
        let manifest = self.pull_single_manifest(reference).await?;
        let layer = manifest.layers.first().ok_or_else(|| BundleError::ArtifactNotFound {
            reference: reference.full_reference(),
            message: "artifact has no layers".to_string(),
        })?;
        self.pull_blob_bytes(reference, layer).await
    }
}

fn client_protocol(config: &RegistryConfig) -> ClientProtocol {
    match config.protocol {
        RegistryProtocol::Http => ClientProtocol::Http,
        RegistryProtocol::Https if config.insecure_registries.is_empty() => ClientProtocol::Https,
        RegistryProtocol::Https => ClientProtocol::HttpsExcept(config.insecure_registries.clone()),
    }
}

/// Convert an ImageReference to an oci-distribution Reference.
///
/// A digest wins over a tag.
fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("{}@{}", reference.repository_path(), digest),
        (None, Some(tag)) => format!("{}:{}", reference.repository_path(), tag),
        (None, None) => format!("{}:latest", reference.repository_path()),
    };

    ref_str.parse::<Reference>().map_err(|e| {
        BundleError::InvalidReference(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

/// Sort registry failures into not-found, access-denied and transport errors.
fn map_oci_error(
    reference: &ImageReference,
    action: &str,
    err: OciDistributionError,
) -> BundleError {
    let not_found = || BundleError::ArtifactNotFound {
        reference: reference.full_reference(),
        message: err.to_string(),
    };
    let denied = || BundleError::AccessDenied {
        reference: reference.full_reference(),
        message: err.to_string(),
    };

    match &err {
        OciDistributionError::ImageManifestNotFoundError(_) => not_found(),
        OciDistributionError::ServerError { code: 404, .. } => not_found(),
        OciDistributionError::ServerError {
            code: 401 | 403, ..
        } => denied(),
        OciDistributionError::UnauthorizedError { .. }
        | OciDistributionError::AuthenticationFailure(_) => denied(),
        OciDistributionError::RegistryError { envelope, .. } => {
            let codes: Vec<&OciErrorCode> = envelope.errors.iter().map(|e| &e.code).collect();
            if codes.iter().any(|c| {
                matches!(
                    c,
                    OciErrorCode::ManifestUnknown
                        | OciErrorCode::NameUnknown
                        | OciErrorCode::BlobUnknown
                )
            }) {
                not_found()
            } else if codes
                .iter()
                .any(|c| matches!(c, OciErrorCode::Denied | OciErrorCode::Unauthorized))
            {
                denied()
            } else {
                transport_error(reference, action, &err)
            }
        }
        _ => transport_error(reference, action, &err),
    }
}

fn transport_error(
    reference: &ImageReference,
    action: &str,
    err: &OciDistributionError,
) -> BundleError {
    BundleError::RegistryError {
        registry: reference.registry.clone(),
        message: format!("Failed to {} for {}: {}", action, reference, err),
    }
}
