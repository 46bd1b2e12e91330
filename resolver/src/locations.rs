//! Locations cache: per-bundle classification table stored next to the bundle.
//!
//! After a walk, every bundle gets a small `ImageLocations` document listing
//! each artifact it transitively declares and whether that artifact is a
//! bundle. The document is pushed as a single-layer artifact under a tag
//! derived from the bundle digest, so it follows the bundle when the bundle
//! is copied to another repository.
//!
//! ```yaml
//! apiVersion: bundlegraph.dev/v1alpha1
//! kind: ImageLocations
//! images:
//!   - image: ghcr.io/org/bundle@sha256:...
//!     isBundle: false
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bundlegraph_core::error::{BundleError, Result};
use bundlegraph_core::throttle::ThrottledWalker;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactRef, BundleClass};
use crate::lock::{check_header, API_VERSION};
use crate::oci::{ImageReference, Registry};

/// kind of the locations document.
pub const LOCATIONS_KIND: &str = "ImageLocations";

/// Suffix of the digest-derived tag the document is stored under.
pub const LOCATIONS_TAG_SUFFIX: &str = "image-locations.bundlegraph";

/// Media type of the document layer.
pub const LOCATIONS_MEDIA_TYPE: &str = "application/vnd.bundlegraph.image-locations.v1+yaml";

/// Memoized classification of everything a bundle declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationsConfig {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub images: Vec<ImageLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageLocation {
    /// Digest-qualified reference
    pub image: String,
    pub is_bundle: bool,
}

impl LocationsConfig {
    /// Build a document; entries are sorted by reference.
    pub fn new(mut images: Vec<ImageLocation>) -> Self {
        images.sort_by(|a, b| a.image.cmp(&b.image));
        images.dedup();
        Self {
            api_version: API_VERSION.to_string(),
            kind: LOCATIONS_KIND.to_string(),
            images,
        }
    }

    /// Build a document from classified artifacts, keyed by primary location.
    pub fn from_artifacts<'a>(artifacts: impl IntoIterator<Item = &'a ArtifactRef>) -> Result<Self> {
        let images = artifacts
            .into_iter()
            .map(|artifact| {
                let is_bundle = artifact.class().as_bool().ok_or_else(|| {
                    BundleError::InternalInconsistency(format!(
                        "artifact {} was never classified",
                        artifact.identity()
                    ))
                })?;
                Ok(ImageLocation {
                    image: artifact.primary_location()?.full_reference(),
                    is_bundle,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(images))
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        check_header(LOCATIONS_KIND, &config.api_version, &config.kind)?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Classification by content identity.
    pub fn classes(&self) -> Result<HashMap<String, BundleClass>> {
        self.images
            .iter()
            .map(|entry| {
                let reference = ImageReference::parse(&entry.image)?;
                let identity = reference.require_digest()?.to_string();
                Ok((identity, BundleClass::from_is_bundle(entry.is_bundle)))
            })
            .collect()
    }
}

/// Reads and writes [`LocationsConfig`] documents through a registry.
#[derive(Clone)]
pub struct LocationsCache {
    registry: Arc<dyn Registry>,
    throttle: ThrottledWalker,
}

impl LocationsCache {
    pub fn new(registry: Arc<dyn Registry>, throttle: ThrottledWalker) -> Self {
        Self { registry, throttle }
    }

    /// Where the document for `bundle` lives: the bundle's repository, at
    /// `<algorithm>-<hex>.image-locations.bundlegraph`.
    pub fn location_of(bundle: &ImageReference) -> Result<ImageReference> {
        Ok(bundle.with_tag(bundle.digest_tag(LOCATIONS_TAG_SUFFIX)?))
    }

    /// Read the document for `bundle`.
    ///
    /// Fails with [`BundleError::ArtifactNotFound`] when none was written for
    /// this digest; callers fall back to a full walk on that error only.
    pub async fn fetch(&self, bundle: &ImageReference) -> Result<LocationsConfig> {
        let location = Self::location_of(bundle)?;
        let content = self
            .throttle
            .run(self.registry.read_artifact(&location))
            .await?;

        let yaml = String::from_utf8(content).map_err(|e| {
            BundleError::SerializationError(format!(
                "Locations document {} is not UTF-8: {}",
                location, e
            ))
        })?;
        let config = LocationsConfig::parse(&yaml)?;
        tracing::debug!(bundle = %bundle, images = config.images.len(), "Locations cache hit");
        Ok(config)
    }

    /// Whether a document exists for `bundle`.
    pub async fn exists(&self, bundle: &ImageReference) -> Result<bool> {
        let location = Self::location_of(bundle)?;
        match self.throttle.run(self.registry.digest(&location)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write the document for `bundle` unless one already exists.
    ///
    /// Returns whether anything was written. An existing document is never
    /// replaced.
    pub async fn save(&self, bundle: &ImageReference, config: &LocationsConfig) -> Result<bool> {
        if self.exists(bundle).await? {
            tracing::debug!(bundle = %bundle, "Locations cache already present");
            return Ok(false);
        }

        let location = Self::location_of(bundle)?;
        let content = config.to_yaml()?.into_bytes();
        let digest = self
            .throttle
            .run(
                self.registry
                    .write_artifact(&location, LOCATIONS_MEDIA_TYPE, content),
            )
            .await?;

        tracing::info!(
            bundle = %bundle,
            location = %location,
            digest = %digest,
            "Saved locations cache"
        );
        Ok(true)
    }
}
