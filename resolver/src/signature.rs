//! Signature discovery.
//!
//! Signatures are looked up by convention: the signature of content
//! `sha256:<hex>` in a repository is tagged `sha256-<hex>.sig` in that same
//! repository. Verification is someone else's job; this module only finds
//! them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bundlegraph_core::error::Result;
use bundlegraph_core::throttle::ThrottledWalker;
use futures::future::try_join_all;

use crate::artifact::ArtifactRef;
use crate::oci::Registry;

/// Suffix of the digest-derived signature tag.
pub const SIGNATURE_TAG_SUFFIX: &str = "sig";

/// Annotation carrying the tag a signature was found under.
pub const SIGNATURE_TAG_ANNOTATION: &str = "bundlegraph.dev/signature-tag";

/// Finds signature artifacts for a set of artifacts.
#[async_trait]
pub trait SignatureSource: Send + Sync {
    /// Signatures keyed by the identity of the artifact they sign.
    ///
    /// Artifacts without a signature are absent from the map.
    async fn fetch_for(&self, artifacts: &[ArtifactRef]) -> Result<HashMap<String, ArtifactRef>>;
}

/// Source that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignatures;

#[async_trait]
impl SignatureSource for NoSignatures {
    async fn fetch_for(&self, _artifacts: &[ArtifactRef]) -> Result<HashMap<String, ArtifactRef>> {
        Ok(HashMap::new())
    }
}

/// Probes the registry for `<algorithm>-<hex>.sig` tags next to each
/// artifact's primary location.
#[derive(Clone)]
pub struct RegistrySignatures {
    registry: Arc<dyn Registry>,
    throttle: ThrottledWalker,
}

impl RegistrySignatures {
    pub fn new(registry: Arc<dyn Registry>, throttle: ThrottledWalker) -> Self {
        Self { registry, throttle }
    }

    async fn probe(&self, artifact: &ArtifactRef) -> Result<Option<(String, ArtifactRef)>> {
        let location = artifact.primary_location()?;
        let tag = location.digest_tag(SIGNATURE_TAG_SUFFIX)?;
        let tagged = location.with_tag(tag.clone());

        let digest = match self.throttle.run(self.registry.digest(&tagged)).await {
            Ok(digest) => digest,
            Err(e) if e.is_absent() => return Ok(None),
            Err(e) => return Err(e),
        };

        tracing::debug!(artifact = %location, signature = %digest, "Found signature");
        let signature = ArtifactRef::discovered_at(&tagged.with_digest(digest))?
            .with_annotations(BTreeMap::from([(SIGNATURE_TAG_ANNOTATION.to_string(), tag)]));
        Ok(Some((artifact.identity().to_string(), signature)))
    }
}

#[async_trait]
impl SignatureSource for RegistrySignatures {
    async fn fetch_for(&self, artifacts: &[ArtifactRef]) -> Result<HashMap<String, ArtifactRef>> {
        let found = try_join_all(artifacts.iter().map(|a| self.probe(a))).await?;
        Ok(found.into_iter().flatten().collect())
    }
}
