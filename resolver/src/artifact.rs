//! Artifact identity and location tracking.
//!
//! An [`ArtifactRef`] names content by digest and remembers every
//! repository the content is believed to live in, most preferred first.
//! Two refs with the same identity are always merged, never kept side by
//! side; [`ArtifactSet`] enforces that for a whole walk.

use std::collections::BTreeMap;

use bundlegraph_core::error::{BundleError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::oci::ImageReference;

/// Bundle classification of an artifact.
///
/// Starts `Unknown` and may move to `Image` or `Bundle` exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BundleClass {
    #[default]
    Unknown,
    Image,
    Bundle,
}

impl BundleClass {
    pub fn from_is_bundle(is_bundle: bool) -> Self {
        if is_bundle {
            Self::Bundle
        } else {
            Self::Image
        }
    }

    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }

    /// `Some(true)` for bundles, `Some(false)` for images, `None` if unknown.
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Unknown => None,
            Self::Image => Some(false),
            Self::Bundle => Some(true),
        }
    }
}

/// One image or bundle and every location it is known at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    identity: String,
    locations: Vec<ImageReference>,
    class: BundleClass,
    annotations: BTreeMap<String, String>,
}

impl ArtifactRef {
    /// An artifact with no known location yet.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            locations: Vec::new(),
            class: BundleClass::Unknown,
            annotations: BTreeMap::new(),
        }
    }

    /// An artifact discovered at a digest-qualified reference.
    pub fn discovered_at(reference: &ImageReference) -> Result<Self> {
        let mut artifact = Self::new(reference.require_digest()?);
        artifact.add_location(reference)?;
        Ok(artifact)
    }

    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn with_class(mut self, class: BundleClass) -> Result<Self> {
        self.set_class(class)?;
        Ok(self)
    }

    /// Digest identifying the content, independent of repository.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Known locations, most preferred first.
    pub fn locations(&self) -> &[ImageReference] {
        &self.locations
    }

    pub fn class(&self) -> BundleClass {
        self.class
    }

    pub fn is_bundle(&self) -> bool {
        self.class == BundleClass::Bundle
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    /// Record a candidate location unless it is already known.
    ///
    /// The first location ever recorded is the origin and stays last; later
    /// ones go in front of it in order of arrival. Locations are normalized
    /// to `repository@identity`. Returns whether the location was new. A
    /// location pinned to another digest is a defect.
    pub fn add_location(&mut self, reference: &ImageReference) -> Result<bool> {
        let location = self.normalize(reference)?;
        if self.locations.contains(&location) {
            return Ok(false);
        }
        match self.locations.len() {
            0 => self.locations.push(location),
            len => self.locations.insert(len - 1, location),
        }
        Ok(true)
    }

    /// The location consumers should try first.
    pub fn primary_location(&self) -> Result<&ImageReference> {
        self.locations
            .first()
            .ok_or_else(|| BundleError::EmptyLocations(self.identity.clone()))
    }

    /// The location the artifact was first discovered at.
    pub fn origin(&self) -> Option<&ImageReference> {
        self.locations.last()
    }

    /// Collapse the location list to `reference` alone.
    pub fn discard_locations_except(&mut self, reference: &ImageReference) -> Result<()> {
        let location = self.normalize(reference)?;
        self.locations = vec![location];
        Ok(())
    }

    /// Record the classification.
    ///
    /// `Unknown` never overwrites; a known class may be re-asserted but
    /// never changed.
    pub fn set_class(&mut self, class: BundleClass) -> Result<()> {
        match (self.class, class) {
            (_, BundleClass::Unknown) => Ok(()),
            (BundleClass::Unknown, known) => {
                self.class = known;
                Ok(())
            }
            (current, new) if current == new => Ok(()),
            (current, new) => Err(BundleError::InternalInconsistency(format!(
                "artifact {} classified as {:?} cannot become {:?}",
                self.identity, current, new
            ))),
        }
    }

    /// Fold another record of the same content into this one.
    ///
    /// Locations are unioned with this record's origin kept last, so the
    /// other record's origin becomes a fallback when the two differ. A known
    /// classification wins over unknown and existing annotations are kept.
    pub fn merge(&mut self, other: &ArtifactRef) -> Result<()> {
        if other.identity != self.identity {
            return Err(BundleError::InternalInconsistency(format!(
                "cannot merge artifact {} into {}",
                other.identity, self.identity
            )));
        }
        for location in &other.locations {
            self.add_location(location)?;
        }
        self.set_class(other.class)?;
        for (key, value) in &other.annotations {
            self.annotations
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        Ok(())
    }

    fn normalize(&self, reference: &ImageReference) -> Result<ImageReference> {
        match reference.digest.as_deref() {
            Some(digest) if digest != self.identity => Err(BundleError::InternalInconsistency(
                format!(
                    "location {} does not hold artifact {}",
                    reference, self.identity
                ),
            )),
            _ => Ok(reference.with_digest(self.identity.clone())),
        }
    }
}

/// Deduplicated, concurrently writable set of artifacts keyed by identity.
#[derive(Debug, Default)]
pub struct ArtifactSet {
    entries: DashMap<String, ArtifactRef>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `artifact`, merging it into any record with the same identity.
    pub fn merge(&self, artifact: ArtifactRef) -> Result<()> {
        match self.entries.entry(artifact.identity.clone()) {
            Entry::Occupied(mut existing) => existing.get_mut().merge(&artifact),
            Entry::Vacant(slot) => {
                slot.insert(artifact);
                Ok(())
            }
        }
    }

    pub fn get(&self, identity: &str) -> Option<ArtifactRef> {
        self.entries.get(identity).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All artifacts ordered by primary location, then identity.
    pub fn to_sorted_vec(&self) -> Vec<ArtifactRef> {
        let mut artifacts: Vec<ArtifactRef> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sort_artifacts(&mut artifacts);
        artifacts
    }
}

/// Deterministic output order: primary location string, then identity.
pub fn sort_artifacts(artifacts: &mut [ArtifactRef]) {
    artifacts.sort_by(|a, b| {
        let a_loc = a.locations.first().map(ImageReference::full_reference);
        let b_loc = b.locations.first().map(ImageReference::full_reference);
        a_loc.cmp(&b_loc).then_with(|| a.identity.cmp(&b.identity))
    });
}
