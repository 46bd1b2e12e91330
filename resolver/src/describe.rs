//! Nested, serializable description of a bundle graph.
//!
//! Unlike [`Resolution`], the description mirrors the human-facing nesting:
//! an artifact declared by two bundles appears under both. An identity
//! already on the path from the root is emitted as a leaf without content,
//! which cuts cycles off.
//!
//! ```yaml
//! image: ghcr.io/org/root@sha256:...
//! kind: Bundle
//! internal:
//!   - image: ghcr.io/org/root:sha256-....image-locations.bundlegraph
//!     kind: Internal
//! content:
//!   bundles:
//!     - image: ghcr.io/org/root@sha256:...
//!       kind: Bundle
//!       content: ...
//!   images:
//!     - image: ghcr.io/org/root@sha256:...
//!       kind: Image
//!       signatures:
//!         - image: ghcr.io/org/root@sha256:...
//!           kind: Signature
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bundlegraph_core::error::{BundleError, Result};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactRef;
use crate::graph::{BundleNode, GraphResolver, Resolution};
use crate::locations::LocationsCache;
use crate::oci::ImageReference;
use crate::signature::SignatureSource;

/// What a described entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptionKind {
    Image,
    Bundle,
    Signature,
    /// Bookkeeping artifact written by this tool, e.g. the locations cache
    Internal,
}

/// One entry of the description tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    pub image: String,
    pub kind: DescriptionKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Description>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub internal: Vec<Description>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
}

/// What a bundle declares, each list ordered by declared reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundles: Vec<Description>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Description>,
}

impl Description {
    fn leaf(image: String, kind: DescriptionKind) -> Self {
        Self {
            image,
            kind,
            annotations: BTreeMap::new(),
            signatures: Vec::new(),
            internal: Vec::new(),
            content: None,
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Every entry in the tree, depth first, this one included.
    pub fn flatten(&self) -> Vec<&Description> {
        let mut entries = vec![self];
        entries.extend(self.signatures.iter().flat_map(Description::flatten));
        entries.extend(self.internal.iter().flat_map(Description::flatten));
        if let Some(content) = &self.content {
            entries.extend(content.bundles.iter().flat_map(Description::flatten));
            entries.extend(content.images.iter().flat_map(Description::flatten));
        }
        entries
    }
}

/// Builds [`Description`] trees from a resolved graph.
#[derive(Clone)]
pub struct TreeDescriber {
    resolver: GraphResolver,
    signatures: Arc<dyn SignatureSource>,
}

impl TreeDescriber {
    pub fn new(resolver: GraphResolver, signatures: Arc<dyn SignatureSource>) -> Self {
        Self {
            resolver,
            signatures,
        }
    }

    /// Resolve `root` and describe it.
    pub async fn describe(&self, root: &ImageReference) -> Result<Description> {
        let resolution = self.resolver.resolve(root).await?;
        self.describe_resolution(&resolution).await
    }

    /// Describe an already resolved graph.
    pub async fn describe_resolution(&self, resolution: &Resolution) -> Result<Description> {
        let signatures = self.signatures.fetch_for(&resolution.artifacts).await?;
        let internal = self.find_internal(resolution).await?;

        let tree = TreeBuilder {
            nodes: resolution
                .bundles
                .iter()
                .map(|node| (node.identity(), node))
                .collect(),
            signatures,
            internal,
            path: Vec::new(),
            memo: HashMap::new(),
            cuts: 0,
        }
        .build(&resolution.root)?;

        tracing::info!(
            root = %tree.image,
            entries = tree.flatten().len(),
            "Described bundle graph"
        );
        Ok(tree)
    }

    /// Locations cache entries present for the resolved bundles.
    async fn find_internal(&self, resolution: &Resolution) -> Result<HashMap<String, ImageReference>> {
        let cache = self.resolver.locations_cache();
        let probes = resolution.bundles.iter().map(|node| async move {
            let location = node.bundle.primary_location()?;
            let present = cache.exists(location).await?;
            Ok::<_, BundleError>(
                present
                    .then(|| LocationsCache::location_of(location))
                    .transpose()?
                    .map(|cached| (node.identity().to_string(), cached)),
            )
        });
        Ok(try_join_all(probes).await?.into_iter().flatten().collect())
    }
}

struct TreeBuilder<'a> {
    nodes: HashMap<&'a str, &'a BundleNode>,
    signatures: HashMap<String, ArtifactRef>,
    internal: HashMap<String, ImageReference>,
    /// Bundle identities from the root to the entry being built
    path: Vec<String>,
    /// Content of bundles already described, for repeated occurrences.
    /// Only subtrees with no cycle cut are kept: a cut depends on the path.
    memo: HashMap<String, Content>,
    /// Bundles left without content because they were already on the path
    cuts: usize,
}

impl TreeBuilder<'_> {
    fn build(&mut self, artifact: &ArtifactRef) -> Result<Description> {
        let identity = artifact.identity().to_string();
        let kind = if artifact.is_bundle() {
            DescriptionKind::Bundle
        } else {
            DescriptionKind::Image
        };

        let mut description = Description::leaf(
            artifact.primary_location()?.full_reference(),
            kind,
        );
        description.annotations = artifact.annotations().clone();

        if let Some(signature) = self.signatures.get(&identity) {
            let mut entry = Description::leaf(
                signature.primary_location()?.full_reference(),
                DescriptionKind::Signature,
            );
            entry.annotations = signature.annotations().clone();
            description.signatures.push(entry);
        }

        if kind == DescriptionKind::Bundle {
            if let Some(cached) = self.internal.get(&identity) {
                description.internal.push(Description::leaf(
                    cached.full_reference(),
                    DescriptionKind::Internal,
                ));
            }
            if self.path.contains(&identity) {
                self.cuts += 1;
            } else {
                description.content = Some(self.content_of(&identity)?);
            }
        }

        Ok(description)
    }

    fn content_of(&mut self, identity: &str) -> Result<Content> {
        if let Some(content) = self.memo.get(identity) {
            return Ok(content.clone());
        }

        let node = *self.nodes.get(identity).ok_or_else(|| {
            BundleError::InternalInconsistency(format!(
                "bundle {} was classified but never walked",
                identity
            ))
        })?;

        let cuts_before = self.cuts;
        self.path.push(identity.to_string());
        let mut content = Content::default();
        for dependency in node.sorted_dependencies() {
            let entry = self.build(&dependency.artifact)?;
            match entry.kind {
                DescriptionKind::Bundle => content.bundles.push(entry),
                _ => content.images.push(entry),
            }
        }
        self.path.pop();

        if self.cuts == cuts_before {
            self.memo.insert(identity.to_string(), content.clone());
        }
        Ok(content)
    }
}
