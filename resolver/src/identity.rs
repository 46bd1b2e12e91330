//! Bundle-or-image classification of a single artifact.
//!
//! A bundle is a single-manifest image whose config carries the bundle
//! label. Multi-platform indexes cannot carry one and are reported as plain
//! images; [`Classification::Index`] keeps the distinction visible to
//! callers that care.

use std::sync::Arc;

use bundlegraph_core::error::Result;
use bundlegraph_core::throttle::ThrottledWalker;

use crate::artifact::BundleClass;
use crate::oci::{BundleLabels, ImageReference, ManifestConfig, Registry};

/// What an artifact turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Bundle,
    Image,
    /// Multi-platform index. Never a bundle.
    Index,
}

impl Classification {
    pub fn is_bundle(self) -> bool {
        self == Classification::Bundle
    }

    pub fn class(self) -> BundleClass {
        BundleClass::from_is_bundle(self.is_bundle())
    }
}

/// Classifies artifacts through the registry, one throttled call each.
///
/// Holds no cache; the graph walk decides what to remember.
#[derive(Clone)]
pub struct BundleIdentity {
    registry: Arc<dyn Registry>,
    throttle: ThrottledWalker,
}

impl BundleIdentity {
    pub fn new(registry: Arc<dyn Registry>, throttle: ThrottledWalker) -> Self {
        Self { registry, throttle }
    }

    /// Whether `reference` is a bundle.
    ///
    /// Indexes are not bundles and are not an error. Not-found and
    /// transport failures are returned as errors.
    pub async fn is_bundle(&self, reference: &ImageReference) -> Result<bool> {
        Ok(self.classify(reference).await?.is_bundle())
    }

    pub async fn classify(&self, reference: &ImageReference) -> Result<Classification> {
        let config = self
            .throttle
            .run(self.registry.fetch_config(reference))
            .await?;

        let classification = match config {
            ManifestConfig::Image { labels } => {
                if BundleLabels::from_labels(&labels).is_bundle() {
                    Classification::Bundle
                } else {
                    Classification::Image
                }
            }
            ManifestConfig::Index => {
                tracing::debug!(
                    reference = %reference,
                    "Multi-platform index classified as plain image"
                );
                Classification::Index
            }
        };

        tracing::debug!(reference = %reference, ?classification, "Classified artifact");
        Ok(classification)
    }
}
