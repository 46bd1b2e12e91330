//! The images lock: a bundle's declared dependency manifest.
//!
//! ```yaml
//! apiVersion: bundlegraph.dev/v1alpha1
//! kind: ImagesLock
//! images:
//!   - image: ghcr.io/org/app@sha256:...
//!     annotations:
//!       bundlegraph.dev/origin: ghcr.io/org/app:v1
//! ```

use std::collections::BTreeMap;

use bundlegraph_core::error::{BundleError, Result};
use serde::{Deserialize, Serialize};

use crate::oci::ImageReference;

/// apiVersion shared by every bundlegraph document.
pub const API_VERSION: &str = "bundlegraph.dev/v1alpha1";

/// kind of the images lock document.
pub const IMAGES_LOCK_KIND: &str = "ImagesLock";

/// Path of the images lock inside a bundle image.
pub const IMAGES_LOCK_PATH: &str = ".bundlegraph/images.yml";

/// A bundle's ordered list of dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagesLock {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub images: Vec<LockedImage>,
}

/// One declared dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedImage {
    /// Digest-qualified reference where the dependency was recorded
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl LockedImage {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Parsed, digest-qualified reference.
    pub fn reference(&self) -> Result<ImageReference> {
        let reference = ImageReference::parse(&self.image)?;
        reference.require_digest()?;
        Ok(reference)
    }
}

/// Result of rewriting a lock into its bundle's repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalizedLock {
    pub lock: ImagesLock,
    /// True when the original lock was kept because not every image is
    /// colocated with the bundle.
    pub skipped: bool,
}

impl ImagesLock {
    pub fn new(images: Vec<LockedImage>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: IMAGES_LOCK_KIND.to_string(),
            images,
        }
    }

    /// Parse and validate an images lock document.
    pub fn parse(yaml: &str) -> Result<Self> {
        let lock: Self = serde_yaml::from_str(yaml)?;
        check_header(IMAGES_LOCK_KIND, &lock.api_version, &lock.kind)?;
        for image in &lock.images {
            image.reference()?;
        }
        Ok(lock)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Rewrite every image into `bundle`'s repository.
    ///
    /// The rewrite is all or nothing: unless `colocated` holds for the
    /// whole bundle, the lock is returned unchanged and marked skipped.
    pub fn localize(&self, bundle: &ImageReference, colocated: bool) -> Result<LocalizedLock> {
        if !colocated {
            return Ok(LocalizedLock {
                lock: self.clone(),
                skipped: true,
            });
        }

        let images = self
            .images
            .iter()
            .map(|image| {
                let localized = image.reference()?.in_repository_of(bundle)?;
                Ok(LockedImage {
                    image: localized.full_reference(),
                    annotations: image.annotations.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LocalizedLock {
            lock: Self {
                images,
                ..self.clone()
            },
            skipped: false,
        })
    }
}

/// Gate a versioned document on its apiVersion and kind.
pub(crate) fn check_header(expected_kind: &str, api_version: &str, kind: &str) -> Result<()> {
    if kind != expected_kind {
        return Err(BundleError::UnsupportedVersion {
            kind: expected_kind.to_string(),
            found: format!("kind {}", kind),
            expected: format!("kind {}", expected_kind),
        });
    }
    if api_version != API_VERSION {
        return Err(BundleError::UnsupportedVersion {
            kind: expected_kind.to_string(),
            found: api_version.to_string(),
            expected: API_VERSION.to_string(),
        });
    }
    Ok(())
}
