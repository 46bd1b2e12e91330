//! In-process registry.
//!
//! Holds images, indexes, bundles and written artifacts per repository and
//! counts every call by operation and digest. Content identity is derived
//! from a caller-supplied seed, so the same seed pushed to two repositories
//! is the same content, as it would be after a relocation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bundlegraph_core::error::{BundleError, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use super::labels::BundleLabels;
use super::reference::ImageReference;
use super::registry::{ManifestConfig, Registry};
use crate::lock::ImagesLock;

/// Registry operations, for call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Digest,
    FetchConfig,
    FetchImagesLock,
    WriteArtifact,
    ReadArtifact,
}

#[derive(Debug, Clone)]
enum Stored {
    Image {
        labels: HashMap<String, String>,
        lock: Option<ImagesLock>,
    },
    Index,
    Artifact {
        media_type: String,
        content: Vec<u8>,
    },
}

/// In-memory [`Registry`].
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    /// repository path → digest → manifest
    manifests: RwLock<HashMap<String, HashMap<String, Stored>>>,
    /// repository path → tag → digest
    tags: RwLock<HashMap<String, HashMap<String, String>>>,
    /// Repositories answering with access denied
    denied: RwLock<HashSet<String>>,
    /// Repositories failing with a transport error
    failing: RwLock<HashMap<String, String>>,
    calls: DashMap<(Operation, String), usize>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`, so concurrent callers overlap.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Content digest derived from `seed`.
    pub fn digest_of(seed: &str) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(seed.as_bytes())))
    }

    /// Push a plain image. Returns its digest-qualified reference.
    pub fn add_image(&self, repository: &str, seed: &str) -> Result<ImageReference> {
        self.add_image_with_labels(repository, seed, HashMap::new())
    }

    pub fn add_image_with_labels(
        &self,
        repository: &str,
        seed: &str,
        labels: HashMap<String, String>,
    ) -> Result<ImageReference> {
        self.store(repository, seed, Stored::Image { labels, lock: None })
    }

    /// Push a multi-platform index.
    pub fn add_index(&self, repository: &str, seed: &str) -> Result<ImageReference> {
        self.store(repository, seed, Stored::Index)
    }

    /// Push a bundle carrying `lock`.
    pub fn add_bundle(
        &self,
        repository: &str,
        seed: &str,
        lock: ImagesLock,
    ) -> Result<ImageReference> {
        self.store(
            repository,
            seed,
            Stored::Image {
                labels: BundleLabels::bundle_marker(),
                lock: Some(lock),
            },
        )
    }

    /// Copy the content at `reference` into `repository`.
    pub fn copy_to(&self, reference: &ImageReference, repository: &str) -> Result<ImageReference> {
        let (digest, stored) = self.lookup(reference)?;
        let target = ImageReference::parse(repository)?.with_digest(digest.clone());
        self.manifests
            .write()
            .entry(target.repository_path())
            .or_default()
            .insert(digest, stored);
        Ok(target)
    }

    /// Point `tag` in the reference's repository at its content.
    pub fn tag(&self, reference: &ImageReference, tag: &str) -> Result<ImageReference> {
        let (digest, _) = self.lookup(reference)?;
        self.tags
            .write()
            .entry(reference.repository_path())
            .or_default()
            .insert(tag.to_string(), digest);
        Ok(reference.with_tag(tag))
    }

    /// Make every call against `repository` fail with access denied.
    pub fn deny(&self, repository: &str) -> Result<()> {
        let path = ImageReference::parse(repository)?.repository_path();
        self.denied.write().insert(path);
        Ok(())
    }

    /// Make every call against `repository` fail with a transport error.
    pub fn fail(&self, repository: &str, message: &str) -> Result<()> {
        let path = ImageReference::parse(repository)?.repository_path();
        self.failing.write().insert(path, message.to_string());
        Ok(())
    }

    /// Calls of `operation` that addressed `digest`.
    pub fn calls(&self, operation: Operation, digest: &str) -> usize {
        self.calls
            .get(&(operation, digest.to_string()))
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// All calls of `operation`.
    pub fn total_calls(&self, operation: Operation) -> usize {
        self.calls
            .iter()
            .filter(|entry| entry.key().0 == operation)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Highest number of calls observed running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn store(&self, repository: &str, seed: &str, stored: Stored) -> Result<ImageReference> {
        let digest = Self::digest_of(seed);
        let reference = ImageReference::parse(repository)?.with_digest(digest.clone());
        self.manifests
            .write()
            .entry(reference.repository_path())
            .or_default()
            .insert(digest, stored);
        Ok(reference)
    }

    fn lookup(&self, reference: &ImageReference) -> Result<(String, Stored)> {
        let path = reference.repository_path();

        if let Some(message) = self.failing.read().get(&path) {
            return Err(BundleError::RegistryError {
                registry: reference.registry.clone(),
                message: message.clone(),
            });
        }
        if self.denied.read().contains(&path) {
            return Err(BundleError::AccessDenied {
                reference: reference.full_reference(),
                message: "denied".to_string(),
            });
        }

        let digest = match (&reference.digest, &reference.tag) {
            (Some(digest), _) => Some(digest.clone()),
            (None, Some(tag)) => self
                .tags
                .read()
                .get(&path)
                .and_then(|tags| tags.get(tag))
                .cloned(),
            (None, None) => None,
        };

        let found = digest.and_then(|digest| {
            self.manifests
                .read()
                .get(&path)
                .and_then(|repo| repo.get(&digest))
                .cloned()
                .map(|stored| (digest, stored))
        });

        found.ok_or_else(|| BundleError::ArtifactNotFound {
            reference: reference.full_reference(),
            message: "manifest unknown".to_string(),
        })
    }

    /// Account for a call and simulate its latency.
    async fn enter(&self, operation: Operation, reference: &ImageReference) -> CallGuard<'_> {
        let key = reference
            .digest
            .clone()
            .unwrap_or_else(|| reference.full_reference());
        *self.calls.entry((operation, key)).or_insert(0) += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = CallGuard { registry: self };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }
}

struct CallGuard<'a> {
    registry: &'a MemoryRegistry,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.registry.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn digest(&self, reference: &ImageReference) -> Result<String> {
        let _call = self.enter(Operation::Digest, reference).await;
        self.lookup(reference).map(|(digest, _)| digest)
    }

    async fn fetch_config(&self, reference: &ImageReference) -> Result<ManifestConfig> {
        let _call = self.enter(Operation::FetchConfig, reference).await;
        match self.lookup(reference)?.1 {
            Stored::Image { labels, .. } => Ok(ManifestConfig::Image { labels }),
            Stored::Index => Ok(ManifestConfig::Index),
            Stored::Artifact { .. } => Ok(ManifestConfig::Image {
                labels: HashMap::new(),
            }),
        }
    }

    async fn fetch_images_lock(&self, reference: &ImageReference) -> Result<ImagesLock> {
        let _call = self.enter(Operation::FetchImagesLock, reference).await;
        match self.lookup(reference)?.1 {
            Stored::Image {
                lock: Some(lock), ..
            } => Ok(lock),
            Stored::Index => Err(BundleError::NotABundle {
                reference: reference.full_reference(),
                hint: Some("the reference is a multi-platform index, not a bundle image".to_string()),
            }),
            _ => Err(BundleError::ArtifactNotFound {
                reference: reference.full_reference(),
                message: "image carries no images lock".to_string(),
            }),
        }
    }

    async fn write_artifact(
        &self,
        reference: &ImageReference,
        media_type: &str,
        content: Vec<u8>,
    ) -> Result<String> {
        let _call = self.enter(Operation::WriteArtifact, reference).await;
        let tag = reference.tag.clone().ok_or_else(|| {
            BundleError::InvalidReference(format!(
                "artifacts are written to a tag, got '{}'",
                reference
            ))
        })?;

        let path = reference.repository_path();
        if let Some(message) = self.failing.read().get(&path) {
            return Err(BundleError::RegistryError {
                registry: reference.registry.clone(),
                message: message.clone(),
            });
        }

        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&content)));
        self.manifests.write().entry(path.clone()).or_default().insert(
            digest.clone(),
            Stored::Artifact {
                media_type: media_type.to_string(),
                content,
            },
        );
        self.tags
            .write()
            .entry(path)
            .or_default()
            .insert(tag, digest.clone());
        Ok(digest)
    }

    async fn read_artifact(&self, reference: &ImageReference) -> Result<Vec<u8>> {
        let _call = self.enter(Operation::ReadArtifact, reference).await;
        match self.lookup(reference)?.1 {
            Stored::Artifact { content, media_type } => {
                tracing::trace!(reference = %reference, media_type = %media_type, "Read artifact");
                Ok(content)
            }
            _ => Err(BundleError::ArtifactNotFound {
                reference: reference.full_reference(),
                message: "not an artifact".to_string(),
            }),
        }
    }
}
