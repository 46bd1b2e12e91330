//! Recursive bundle graph walk.
//!
//! Starting from a root bundle, every declared dependency is located
//! (colocated copy in the declaring bundle's repository first, declared
//! location second), classified, and walked into when it is a bundle. The
//! walk produces:
//!
//! - the flat, deduplicated set of every reachable artifact with merged
//!   locations
//! - one [`BundleNode`] per distinct bundle, from which the nested tree
//!   can be rebuilt
//!
//! Each content identity is classified and walked at most once per
//! resolution, however many parents declare it. The existence check that
//! picks a location runs once per parent repository and declared location. Concurrent branches that
//! discover the same identity wait for the first one's classification
//! instead of repeating it. Classification is settled before recursing,
//! so cyclic graphs terminate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bundlegraph_core::config::GraphConfig;
use bundlegraph_core::error::{BundleError, Result};
use bundlegraph_core::throttle::ThrottledWalker;
use dashmap::DashMap;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::artifact::{ArtifactRef, ArtifactSet, BundleClass};
use crate::identity::{BundleIdentity, Classification};
use crate::lock::{ImagesLock, LocalizedLock, LockedImage};
use crate::locations::{LocationsCache, LocationsConfig};
use crate::oci::{ImageReference, Registry};

const NOT_A_BUNDLE_HINT: &str =
    "the reference is a plain image; copy it as an image instead of as a bundle";

const INDEX_HINT: &str =
    "the reference is a multi-platform index; bundles are single-manifest images";

/// One declared dependency of a bundle, as located from that bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Reference as written in the images lock
    pub declared: ImageReference,
    /// The artifact, with the locations found from the declaring bundle
    pub artifact: ArtifactRef,
    /// Whether the artifact exists in the declaring bundle's repository
    pub colocated: bool,
}

/// A resolved bundle and what it directly declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleNode {
    pub bundle: ArtifactRef,
    /// Dependencies in declaration order
    pub dependencies: Vec<Dependency>,
    pub lock: ImagesLock,
    /// True when every dependency exists in the bundle's repository
    pub colocated: bool,
}

impl BundleNode {
    pub fn identity(&self) -> &str {
        self.bundle.identity()
    }

    /// Dependencies ordered by declared reference.
    pub fn sorted_dependencies(&self) -> Vec<&Dependency> {
        let mut dependencies: Vec<&Dependency> = self.dependencies.iter().collect();
        dependencies.sort_by_key(|d| d.declared.full_reference());
        dependencies
    }

    /// The images lock rewritten into the bundle's repository.
    ///
    /// Unless every dependency is colocated, the lock is kept as is.
    pub fn localized_lock(&self) -> Result<LocalizedLock> {
        let bundle = self.bundle.primary_location()?;
        let localized = self.lock.localize(bundle, self.colocated)?;
        if localized.skipped {
            tracing::warn!(
                bundle = %bundle,
                "Bundle is not colocated with all its images, keeping images lock unchanged"
            );
        }
        Ok(localized)
    }
}

/// Output of [`GraphResolver::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    pub root: ArtifactRef,
    /// Every reachable artifact once, ordered by primary location
    pub artifacts: Vec<ArtifactRef>,
    /// Every distinct bundle once, ordered by primary location
    pub bundles: Vec<BundleNode>,
}

impl Resolution {
    pub fn artifact(&self, identity: &str) -> Option<&ArtifactRef> {
        self.artifacts.iter().find(|a| a.identity() == identity)
    }

    pub fn bundle(&self, identity: &str) -> Option<&BundleNode> {
        self.bundles.iter().find(|b| b.identity() == identity)
    }

    pub fn root_node(&self) -> Result<&BundleNode> {
        self.bundle(self.root.identity()).ok_or_else(|| {
            BundleError::InternalInconsistency(format!(
                "root bundle {} has no node",
                self.root.identity()
            ))
        })
    }

    /// Every artifact reachable from `bundle`, excluding the bundle itself.
    pub fn transitive_artifacts(&self, bundle: &str) -> Vec<&ArtifactRef> {
        let nodes: HashMap<&str, &BundleNode> =
            self.bundles.iter().map(|b| (b.identity(), b)).collect();

        let mut seen: HashSet<&str> = HashSet::from([bundle]);
        let mut pending = vec![bundle];
        let mut reached = Vec::new();

        while let Some(identity) = pending.pop() {
            let Some(node) = nodes.get(identity) else {
                continue;
            };
            for dependency in &node.dependencies {
                let id = dependency.artifact.identity();
                if seen.insert(id) {
                    if let Some(artifact) = self.artifact(id) {
                        reached.push(artifact);
                    }
                    pending.push(id);
                }
            }
        }
        reached
    }
}

/// Per-resolution shared state, passed to every branch of the walk.
struct WalkContext {
    /// Identity → classification, settled once by the first arrival
    processed: DashMap<String, Arc<OnceCell<BundleClass>>>,
    artifacts: ArtifactSet,
    bundles: Mutex<Vec<BundleNode>>,
    /// Classifications read from locations caches
    known: DashMap<String, BundleClass>,
    /// (colocated candidate, declared repository) → location found
    located: DashMap<(String, String), Arc<OnceCell<ImageReference>>>,
}

impl WalkContext {
    fn new() -> Self {
        Self {
            processed: DashMap::new(),
            artifacts: ArtifactSet::new(),
            bundles: Mutex::new(Vec::new()),
            known: DashMap::new(),
            located: DashMap::new(),
        }
    }

    fn cell(&self, identity: &str) -> Arc<OnceCell<BundleClass>> {
        self.processed
            .entry(identity.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn lookup(
        &self,
        colocated: &ImageReference,
        declared: &ImageReference,
    ) -> Arc<OnceCell<ImageReference>> {
        self.located
            .entry((colocated.full_reference(), declared.repository_path()))
            .or_default()
            .value()
            .clone()
    }
}

/// Walks bundle graphs against a registry.
#[derive(Clone)]
pub struct GraphResolver {
    registry: Arc<dyn Registry>,
    throttle: ThrottledWalker,
    identity: BundleIdentity,
    cache: LocationsCache,
    use_locations_cache: bool,
    timeout: Option<Duration>,
    /// Parent of every running walk's token; replaced on each `cancel`
    walks: Arc<Mutex<CancellationToken>>,
}

impl GraphResolver {
    pub fn new(registry: Arc<dyn Registry>, config: &GraphConfig) -> Result<Self> {
        config.validate()?;
        let throttle = ThrottledWalker::new(config.concurrency);
        Ok(Self::with_throttle(registry, throttle, config))
    }

    /// Build a resolver sharing an existing throttle (and its cancellation).
    pub fn with_throttle(
        registry: Arc<dyn Registry>,
        throttle: ThrottledWalker,
        config: &GraphConfig,
    ) -> Self {
        Self {
            identity: BundleIdentity::new(registry.clone(), throttle.clone()),
            cache: LocationsCache::new(registry.clone(), throttle.clone()),
            registry,
            throttle,
            use_locations_cache: config.use_locations_cache,
            timeout: config.timeout(),
            walks: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Override the configured walk deadline.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn throttle(&self) -> &ThrottledWalker {
        &self.throttle
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn locations_cache(&self) -> &LocationsCache {
        &self.cache
    }

    /// Abort every walk currently running on this resolver or its clones.
    ///
    /// Walks started afterwards run normally. Cancelling the throttle
    /// itself instead shuts every user of it down for good.
    pub fn cancel(&self) {
        let mut walks = self.walks.lock();
        walks.cancel();
        *walks = CancellationToken::new();
    }

    /// Resolve the graph below `root`.
    ///
    /// Fails with [`BundleError::NotABundle`] if `root` is a plain image or
    /// an index. The first error in any branch aborts the whole walk.
    pub async fn resolve(&self, root: &ImageReference) -> Result<Resolution> {
        self.resolve_with_cancellation(root, CancellationToken::new())
            .await
    }

    /// Resolve the graph below `root`, aborting with
    /// [`BundleError::Cancelled`] once `cancel` fires.
    ///
    /// Only this walk is affected. Its in-flight registry calls are dropped
    /// and their throttle slots released.
    pub async fn resolve_with_cancellation(
        &self,
        root: &ImageReference,
        cancel: CancellationToken,
    ) -> Result<Resolution> {
        let scope = self.walks.lock().child_token();
        tokio::select! {
            biased;
            _ = scope.cancelled() => Err(BundleError::Cancelled),
            _ = cancel.cancelled() => {
                tracing::info!(reference = %root, "Bundle graph walk cancelled");
                Err(BundleError::Cancelled)
            }
            result = self.resolve_within_deadline(root) => result,
        }
    }

    async fn resolve_within_deadline(&self, root: &ImageReference) -> Result<Resolution> {
        tracing::info!(reference = %root, concurrency = self.throttle.capacity(), "Resolving bundle graph");

        let resolution = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.resolve_inner(root))
                .await
                .map_err(|_| {
                    BundleError::TimeoutError(format!(
                        "resolving {} took longer than {}s",
                        root,
                        limit.as_secs()
                    ))
                })??,
            None => self.resolve_inner(root).await?,
        };

        tracing::info!(
            reference = %root,
            artifacts = resolution.artifacts.len(),
            bundles = resolution.bundles.len(),
            "Resolved bundle graph"
        );
        Ok(resolution)
    }

    async fn resolve_inner(&self, root: &ImageReference) -> Result<Resolution> {
        let digest = self.throttle.run(self.registry.digest(root)).await?;
        let location = root.with_digest(digest.clone());

        match self.identity.classify(&location).await? {
            Classification::Bundle => {}
            Classification::Image => {
                return Err(BundleError::NotABundle {
                    reference: root.full_reference(),
                    hint: Some(NOT_A_BUNDLE_HINT.to_string()),
                });
            }
            Classification::Index => {
                return Err(BundleError::NotABundle {
                    reference: root.full_reference(),
                    hint: Some(INDEX_HINT.to_string()),
                });
            }
        }

        let root_artifact =
            ArtifactRef::discovered_at(&location)?.with_class(BundleClass::Bundle)?;

        let ctx = WalkContext::new();
        ctx.processed.insert(
            digest,
            Arc::new(OnceCell::new_with(Some(BundleClass::Bundle))),
        );
        ctx.artifacts.merge(root_artifact.clone())?;

        self.walk_bundle(&ctx, root_artifact.clone()).await?;

        let artifacts = ctx.artifacts.to_sorted_vec();
        let mut bundles = std::mem::take(&mut *ctx.bundles.lock());
        bundles.sort_by(|a, b| {
            let a_loc = a.bundle.locations().first().map(ImageReference::full_reference);
            let b_loc = b.bundle.locations().first().map(ImageReference::full_reference);
            a_loc.cmp(&b_loc).then_with(|| a.identity().cmp(b.identity()))
        });

        for node in &bundles {
            if !ctx.artifacts.contains(node.identity()) {
                return Err(BundleError::InternalInconsistency(format!(
                    "bundle {} missing from the resolved artifacts",
                    node.identity()
                )));
            }
        }

        let root = ctx
            .artifacts
            .get(root_artifact.identity())
            .ok_or_else(|| {
                BundleError::InternalInconsistency("root bundle vanished from the walk".to_string())
            })?;

        Ok(Resolution {
            root,
            artifacts,
            bundles,
        })
    }

    /// Walk one bundle: read its lock, visit every dependency, record its node.
    fn walk_bundle<'a>(
        &'a self,
        ctx: &'a WalkContext,
        bundle: ArtifactRef,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let location = bundle.primary_location()?.clone();

            if self.use_locations_cache {
                self.load_cached_classes(ctx, &location).await?;
            }

            let lock = self
                .throttle
                .run(self.registry.fetch_images_lock(&location))
                .await?;
            tracing::debug!(bundle = %location, images = lock.images.len(), "Read images lock");

            // Start in lexicographic order of the declared reference; results
            // keep declaration order.
            let mut order: Vec<usize> = (0..lock.images.len()).collect();
            order.sort_by(|&a, &b| lock.images[a].image.cmp(&lock.images[b].image));

            let visits = order
                .iter()
                .map(|&index| self.visit(ctx, &location, &lock.images[index]));
            let visited = try_join_all(visits).await?;

            let mut slots: Vec<Option<Dependency>> = vec![None; lock.images.len()];
            for (index, dependency) in order.into_iter().zip(visited) {
                slots[index] = Some(dependency);
            }
            let dependencies: Vec<Dependency> = slots.into_iter().flatten().collect();

            let colocated = dependencies.iter().all(|d| d.colocated);
            if !colocated {
                tracing::warn!(bundle = %location, "Bundle is not colocated with all its images");
            }

            ctx.bundles.lock().push(BundleNode {
                bundle,
                dependencies,
                lock,
                colocated,
            });
            Ok(())
        }
        .boxed()
    }

    /// Locate and classify one declared dependency, recursing into bundles.
    ///
    /// Every occurrence gets its own colocation answer, but the registry is
    /// only asked once per (parent repository, declared location) pair.
    async fn visit(
        &self,
        ctx: &WalkContext,
        parent: &ImageReference,
        declared: &LockedImage,
    ) -> Result<Dependency> {
        let reference = declared.reference()?;
        let identity = reference.require_digest()?.to_string();
        let cell = ctx.cell(&identity);

        let (artifact, colocated) = self.locate(ctx, parent, &reference).await?;
        let mut artifact = artifact.with_annotations(declared.annotations.clone());
        let found = artifact.primary_location()?.clone();

        let mut first_arrival = false;
        let flag = &mut first_arrival;
        let class = *cell
            .get_or_try_init(move || async move {
                *flag = true;
                self.classify(ctx, &identity, found).await
            })
            .await?;

        artifact.set_class(class)?;
        ctx.artifacts.merge(artifact.clone())?;

        if first_arrival && class == BundleClass::Bundle {
            self.walk_bundle(ctx, artifact.clone()).await?;
        }

        Ok(Dependency {
            declared: reference,
            artifact,
            colocated,
        })
    }

    /// Find where a dependency actually is: colocated with `parent` first,
    /// declared location second.
    async fn locate(
        &self,
        ctx: &WalkContext,
        parent: &ImageReference,
        reference: &ImageReference,
    ) -> Result<(ArtifactRef, bool)> {
        let colocated = reference.in_repository_of(parent)?;
        let candidates = if reference.same_repository(parent) {
            vec![colocated.clone()]
        } else {
            vec![colocated.clone(), reference.clone()]
        };

        let found = ctx
            .lookup(&colocated, reference)
            .get_or_try_init(|| self.throttle.run(self.registry.resolve(&candidates)))
            .await?
            .clone();

        // The declared location is the origin and stays last.
        let mut artifact = ArtifactRef::discovered_at(reference)?;
        if found.same_repository(parent) {
            artifact.add_location(&found)?;
            tracing::debug!(image = %reference, bundle = %parent, "Image colocated with bundle");
            Ok((artifact, true))
        } else {
            tracing::debug!(image = %reference, bundle = %parent, "Image not colocated with bundle");
            Ok((artifact, false))
        }
    }

    async fn classify(
        &self,
        ctx: &WalkContext,
        identity: &str,
        location: ImageReference,
    ) -> Result<BundleClass> {
        let cached = ctx.known.get(identity).map(|class| *class);
        if let Some(class) = cached {
            tracing::debug!(image = %location, ?class, "Classification from locations cache");
            return Ok(class);
        }
        Ok(self.identity.classify(&location).await?.class())
    }

    async fn load_cached_classes(&self, ctx: &WalkContext, bundle: &ImageReference) -> Result<()> {
        match self.cache.fetch(bundle).await {
            Ok(config) => {
                for (identity, class) in config.classes()? {
                    ctx.known.entry(identity).or_insert(class);
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(bundle = %bundle, "No locations cache, classifying from registry");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Save a locations document for every bundle in `resolution`.
    ///
    /// Each document lists everything its bundle transitively declares.
    /// Bundles that already have one are left alone. Returns how many
    /// documents were written.
    pub async fn persist_locations(&self, resolution: &Resolution) -> Result<usize> {
        let saves = resolution.bundles.iter().map(|node| async move {
            let config = LocationsConfig::from_artifacts(
                resolution.transitive_artifacts(node.identity()),
            )?;
            let location = node.bundle.primary_location()?;
            self.cache.save(location, &config).await
        });

        let written = try_join_all(saves).await?.into_iter().filter(|w| *w).count();
        tracing::info!(
            root = %resolution.root.identity(),
            written,
            "Persisted locations caches"
        );
        Ok(written)
    }
}
