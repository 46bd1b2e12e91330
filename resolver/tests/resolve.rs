//! Bundle graph scenarios against the in-memory registry.
//!
//! ```bash
//! cargo test -p bundlegraph-resolver --test resolve
//! ```

use std::sync::Arc;
use std::time::Duration;

use bundlegraph_core::{BundleError, GraphConfig};
use bundlegraph_resolver::oci::Operation;
use bundlegraph_resolver::{
    BundleClass, GraphResolver, ImageReference, ImagesLock, LocationsCache, LockedImage,
    MemoryRegistry, Registry,
};
use tokio_util::sync::CancellationToken;

const REPO: &str = "ghcr.io/org/release";

fn lock(images: &[&ImageReference]) -> ImagesLock {
    ImagesLock::new(
        images
            .iter()
            .map(|image| LockedImage::new(image.full_reference()))
            .collect(),
    )
}

fn resolver(registry: &Arc<MemoryRegistry>, concurrency: usize) -> GraphResolver {
    let config = GraphConfig {
        concurrency,
        ..GraphConfig::default()
    };
    GraphResolver::new(registry.clone(), &config).unwrap()
}

fn digest(reference: &ImageReference) -> &str {
    reference.digest.as_deref().unwrap()
}

fn dependency_ids(resolution: &bundlegraph_resolver::Resolution, bundle: &ImageReference) -> Vec<String> {
    resolution
        .bundle(digest(bundle))
        .unwrap()
        .dependencies
        .iter()
        .map(|d| d.artifact.identity().to_string())
        .collect()
}

/// R declares I1 and B; B declares I2 and I1 again.
fn diamond(registry: &MemoryRegistry) -> (ImageReference, ImageReference, ImageReference, ImageReference) {
    let i1 = registry.add_image(REPO, "i1").unwrap();
    let i2 = registry.add_image(REPO, "i2").unwrap();
    let b = registry.add_bundle(REPO, "b", lock(&[&i2, &i1])).unwrap();
    let r = registry.add_bundle(REPO, "r", lock(&[&i1, &b])).unwrap();
    (r, b, i1, i2)
}

#[tokio::test]
async fn test_diamond_flat_set_and_bundle_nodes() {
    let registry = Arc::new(MemoryRegistry::new());
    let (r, b, i1, i2) = diamond(&registry);

    let resolution = resolver(&registry, 4).resolve(&r).await.unwrap();

    assert_eq!(resolution.artifacts.len(), 4);
    for reference in [&r, &b, &i1, &i2] {
        assert!(resolution.artifact(digest(reference)).is_some());
    }
    assert_eq!(resolution.bundles.len(), 2);
    assert_eq!(dependency_ids(&resolution, &r), vec![digest(&i1), digest(&b)]);
    assert_eq!(dependency_ids(&resolution, &b), vec![digest(&i2), digest(&i1)]);

    assert!(resolution.artifact(digest(&b)).unwrap().is_bundle());
    assert_eq!(
        resolution.artifact(digest(&i1)).unwrap().class(),
        BundleClass::Image
    );
    assert_eq!(registry.calls(Operation::FetchConfig, digest(&i1)), 1);
}

#[tokio::test]
async fn test_nested_bundle_declared_twice_is_walked_once() {
    let registry = Arc::new(MemoryRegistry::with_latency(Duration::from_millis(5)));
    let image = registry.add_image(REPO, "leaf").unwrap();
    let n = registry.add_bundle(REPO, "n", lock(&[&image])).unwrap();
    let b1 = registry.add_bundle(REPO, "b1", lock(&[&n])).unwrap();
    let b2 = registry.add_bundle(REPO, "b2", lock(&[&n])).unwrap();
    let r = registry.add_bundle(REPO, "r", lock(&[&b1, &b2])).unwrap();

    let resolution = resolver(&registry, 8).resolve(&r).await.unwrap();

    assert_eq!(resolution.artifacts.len(), 5);
    assert_eq!(resolution.bundles.len(), 4);
    assert_eq!(registry.calls(Operation::FetchImagesLock, digest(&n)), 1);
    assert_eq!(registry.calls(Operation::FetchConfig, digest(&n)), 1);
    assert_eq!(registry.calls(Operation::FetchConfig, digest(&image)), 1);
}

#[tokio::test]
async fn test_same_bundle_at_two_declared_locations() {
    let registry = Arc::new(MemoryRegistry::new());
    let image = registry.add_image(REPO, "leaf").unwrap();
    let n = registry
        .add_bundle("ghcr.io/team-a/nested", "n", lock(&[&image]))
        .unwrap();
    let n_mirror = registry.copy_to(&n, "ghcr.io/team-b/nested").unwrap();
    let r = registry
        .add_bundle("ghcr.io/org/root", "r", lock(&[&n, &n_mirror]))
        .unwrap();

    let resolution = resolver(&registry, 4).resolve(&r).await.unwrap();

    assert_eq!(registry.calls(Operation::FetchImagesLock, digest(&n)), 1);
    assert_eq!(registry.calls(Operation::FetchConfig, digest(&n)), 1);

    let nested = resolution.artifact(digest(&n)).unwrap();
    assert_eq!(nested.locations().len(), 2);
    assert!(nested.locations().contains(&n));
    assert!(nested.locations().contains(&n_mirror));
}

#[tokio::test]
async fn test_colocated_images_prefer_bundle_repository() {
    let registry = Arc::new(MemoryRegistry::new());
    let nginx = registry.add_image("docker.io/library/nginx", "nginx").unwrap();
    let redis = registry.add_image("docker.io/library/redis", "redis").unwrap();
    let nginx_here = registry.copy_to(&nginx, REPO).unwrap();
    let redis_here = registry.copy_to(&redis, REPO).unwrap();
    let r = registry.add_bundle(REPO, "r", lock(&[&nginx, &redis])).unwrap();

    let resolution = resolver(&registry, 2).resolve(&r).await.unwrap();

    let artifact = resolution.artifact(digest(&nginx)).unwrap();
    assert_eq!(artifact.primary_location().unwrap(), &nginx_here);
    assert_eq!(artifact.origin(), Some(&nginx));
    assert_eq!(
        resolution.artifact(digest(&redis)).unwrap().primary_location().unwrap(),
        &redis_here
    );

    let localized = resolution.root_node().unwrap().localized_lock().unwrap();
    assert!(!localized.skipped);
    let rewritten: Vec<&str> = localized.lock.images.iter().map(|i| i.image.as_str()).collect();
    assert_eq!(
        rewritten,
        vec![nginx_here.full_reference(), redis_here.full_reference()]
    );
}

#[tokio::test]
async fn test_image_colocated_under_parents_in_two_repositories() {
    for concurrency in [1, 2, 3, 5, 8] {
        let registry = Arc::new(MemoryRegistry::with_latency(Duration::from_millis(1)));
        let x = registry.add_image("docker.io/library/x", "x").unwrap();
        let x_in_b = registry.copy_to(&x, "ghcr.io/org/b").unwrap();
        let x_in_c = registry.copy_to(&x, "ghcr.io/org/c").unwrap();
        let b = registry.add_bundle("ghcr.io/org/b", "b", lock(&[&x])).unwrap();
        let c = registry.add_bundle("ghcr.io/org/c", "c", lock(&[&x])).unwrap();
        let r = registry.add_bundle(REPO, "r", lock(&[&b, &c])).unwrap();

        let resolution = resolver(&registry, concurrency).resolve(&r).await.unwrap();

        let artifact = resolution.artifact(digest(&x)).unwrap();
        assert_eq!(artifact.locations().len(), 3);
        assert_eq!(artifact.origin(), Some(&x));
        assert_eq!(artifact.locations().last(), Some(&x));
        let primary = artifact.primary_location().unwrap();
        assert!(primary == &x_in_b || primary == &x_in_c);
        assert!(artifact.locations().contains(&x_in_b));
        assert!(artifact.locations().contains(&x_in_c));

        for bundle in [&b, &c] {
            let node = resolution.bundle(digest(bundle)).unwrap();
            assert!(node.colocated);
            let found = node.dependencies[0].artifact.primary_location().unwrap();
            assert!(found.same_repository(bundle));
        }
    }
}

#[tokio::test]
async fn test_shared_dependency_location_checked_once_per_repository() {
    let registry = Arc::new(MemoryRegistry::new());
    let (r, _b, i1, _i2) = diamond(&registry);

    let resolution = resolver(&registry, 4).resolve(&r).await.unwrap();

    assert!(resolution.artifact(digest(&i1)).is_some());
    assert_eq!(registry.calls(Operation::Digest, digest(&i1)), 1);
}

#[tokio::test]
async fn test_missing_colocated_image_skips_whole_lock() {
    let registry = Arc::new(MemoryRegistry::new());
    let nginx = registry.add_image("docker.io/library/nginx", "nginx").unwrap();
    let redis = registry.add_image("docker.io/library/redis", "redis").unwrap();
    registry.copy_to(&nginx, REPO).unwrap();
    let r = registry.add_bundle(REPO, "r", lock(&[&nginx, &redis])).unwrap();

    let resolution = resolver(&registry, 2).resolve(&r).await.unwrap();

    let redis_artifact = resolution.artifact(digest(&redis)).unwrap();
    assert_eq!(redis_artifact.locations(), &[redis.clone()][..]);

    let node = resolution.root_node().unwrap();
    assert!(!node.colocated);
    let localized = node.localized_lock().unwrap();
    assert!(localized.skipped);
    assert_eq!(localized.lock, lock(&[&nginx, &redis]));
}

#[tokio::test]
async fn test_relocated_nested_bundle_looks_next_to_itself() {
    let registry = Arc::new(MemoryRegistry::new());
    let image = registry.add_image("docker.io/library/nginx", "nginx").unwrap();
    let nested = registry
        .add_bundle("ghcr.io/team/nested", "nested", lock(&[&image]))
        .unwrap();
    let nested_here = registry.copy_to(&nested, REPO).unwrap();
    let image_here = registry.copy_to(&image, REPO).unwrap();
    let r = registry.add_bundle(REPO, "r", lock(&[&nested])).unwrap();

    let resolution = resolver(&registry, 2).resolve(&r).await.unwrap();

    assert_eq!(
        resolution.artifact(digest(&nested)).unwrap().primary_location().unwrap(),
        &nested_here
    );
    assert_eq!(
        resolution.artifact(digest(&image)).unwrap().primary_location().unwrap(),
        &image_here
    );
    assert!(resolution.bundles.iter().all(|node| node.colocated));
}

#[tokio::test]
async fn test_index_dependency_is_an_image() {
    let registry = Arc::new(MemoryRegistry::new());
    let index = registry.add_index(REPO, "multi-arch").unwrap();
    let r = registry.add_bundle(REPO, "r", lock(&[&index])).unwrap();

    let resolution = resolver(&registry, 2).resolve(&r).await.unwrap();
    assert_eq!(
        resolution.artifact(digest(&index)).unwrap().class(),
        BundleClass::Image
    );
    assert_eq!(resolution.bundles.len(), 1);
}

#[tokio::test]
async fn test_cycle_terminates() {
    let registry = Arc::new(MemoryRegistry::new());
    let a = ImageReference::parse(REPO)
        .unwrap()
        .with_digest(MemoryRegistry::digest_of("a"));
    let b = registry.add_bundle(REPO, "b", lock(&[&a])).unwrap();
    let a = registry.add_bundle(REPO, "a", lock(&[&b])).unwrap();

    let resolution = resolver(&registry, 4).resolve(&a).await.unwrap();

    assert_eq!(resolution.artifacts.len(), 2);
    assert_eq!(resolution.bundles.len(), 2);
    assert_eq!(registry.calls(Operation::FetchImagesLock, digest(&a)), 1);
    assert_eq!(registry.calls(Operation::FetchImagesLock, digest(&b)), 1);
}

#[tokio::test]
async fn test_self_reference_terminates() {
    let registry = Arc::new(MemoryRegistry::new());
    let a = ImageReference::parse(REPO)
        .unwrap()
        .with_digest(MemoryRegistry::digest_of("a"));
    let a = registry.add_bundle(REPO, "a", lock(&[&a])).unwrap();

    let resolution = resolver(&registry, 2).resolve(&a).await.unwrap();
    assert_eq!(resolution.artifacts.len(), 1);
    assert_eq!(resolution.bundles.len(), 1);
}

#[tokio::test]
async fn test_resolution_is_deterministic_across_concurrency() {
    let registry = Arc::new(MemoryRegistry::with_latency(Duration::from_millis(1)));
    let images: Vec<ImageReference> = (0..6)
        .map(|i| registry.add_image(REPO, &format!("image-{}", i)).unwrap())
        .collect();
    let b1 = registry
        .add_bundle(REPO, "b1", lock(&[&images[0], &images[1], &images[2]]))
        .unwrap();
    let b2 = registry
        .add_bundle(REPO, "b2", lock(&[&images[2], &images[3], &b1]))
        .unwrap();
    let r = registry
        .add_bundle(REPO, "r", lock(&[&b2, &images[4], &b1, &images[5]]))
        .unwrap();

    let serial = resolver(&registry, 1).resolve(&r).await.unwrap();
    let parallel = resolver(&registry, 8).resolve(&r).await.unwrap();

    assert_eq!(serial.artifacts, parallel.artifacts);
    assert_eq!(serial.bundles, parallel.bundles);
}

#[tokio::test]
async fn test_persisted_locations_cover_transitive_images() {
    let registry = Arc::new(MemoryRegistry::new());
    let (r, b, i1, i2) = diamond(&registry);
    let resolver = resolver(&registry, 4);

    let resolution = resolver.resolve(&r).await.unwrap();
    assert_eq!(resolver.persist_locations(&resolution).await.unwrap(), 2);
    assert_eq!(resolver.persist_locations(&resolution).await.unwrap(), 0);

    let cache = resolver.locations_cache();
    let root_classes = cache.fetch(&r).await.unwrap().classes().unwrap();
    assert_eq!(root_classes.len(), 3);
    assert_eq!(root_classes[digest(&b)], BundleClass::Bundle);
    assert_eq!(root_classes[digest(&i2)], BundleClass::Image);

    let nested_classes = cache.fetch(&b).await.unwrap().classes().unwrap();
    assert_eq!(nested_classes.len(), 2);
    assert!(nested_classes.contains_key(digest(&i1)));
}

#[tokio::test]
async fn test_cached_walk_makes_no_dependency_classification_calls() {
    let registry = Arc::new(MemoryRegistry::new());
    let (r, b, i1, i2) = diamond(&registry);
    let resolver = resolver(&registry, 4);

    let first = resolver.resolve(&r).await.unwrap();
    resolver.persist_locations(&first).await.unwrap();
    let second = resolver.resolve(&r).await.unwrap();

    assert_eq!(first.artifacts, second.artifacts);
    for reference in [&b, &i1, &i2] {
        assert_eq!(registry.calls(Operation::FetchConfig, digest(reference)), 1);
    }
}

#[tokio::test]
async fn test_unreadable_locations_cache_aborts() {
    let registry = Arc::new(MemoryRegistry::new());
    let (r, ..) = diamond(&registry);
    registry
        .write_artifact(
            &LocationsCache::location_of(&r).unwrap(),
            "text/plain",
            b"apiVersion: bundlegraph.dev/v9\nkind: ImageLocations\n".to_vec(),
        )
        .await
        .unwrap();

    let err = resolver(&registry, 2).resolve(&r).await.unwrap_err();
    assert!(matches!(err, BundleError::UnsupportedVersion { .. }));
}

#[tokio::test]
async fn test_transport_failure_aborts_resolve() {
    let registry = Arc::new(MemoryRegistry::new());
    let good = registry.add_image(REPO, "good").unwrap();
    let broken = registry.add_image("registry.flaky/team/app", "broken").unwrap();
    registry.fail("registry.flaky/team/app", "connection reset").unwrap();
    let r = registry.add_bundle(REPO, "r", lock(&[&good, &broken])).unwrap();

    let err = resolver(&registry, 2).resolve(&r).await.unwrap_err();
    assert!(matches!(err, BundleError::RegistryError { .. }));
}

#[tokio::test]
async fn test_denied_everywhere_is_not_found() {
    let registry = Arc::new(MemoryRegistry::new());
    let private = registry.add_image("ghcr.io/private/app", "private").unwrap();
    registry.deny("ghcr.io/private/app").unwrap();
    let r = registry.add_bundle(REPO, "r", lock(&[&private])).unwrap();

    let err = resolver(&registry, 2).resolve(&r).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_throttle_bound_holds_for_registry_calls() {
    let registry = Arc::new(MemoryRegistry::with_latency(Duration::from_millis(10)));
    let images: Vec<ImageReference> = (0..12)
        .map(|i| registry.add_image(REPO, &format!("image-{}", i)).unwrap())
        .collect();
    let refs: Vec<&ImageReference> = images.iter().collect();
    let r = registry.add_bundle(REPO, "r", lock(&refs)).unwrap();

    let resolver = resolver(&registry, 3);
    resolver.resolve(&r).await.unwrap();

    assert!(registry.peak_in_flight() <= 3);
    assert!(registry.peak_in_flight() > 1);
    assert_eq!(resolver.throttle().in_flight(), 0);
}

#[tokio::test]
async fn test_cancel_aborts_walk_and_releases_slots() {
    let registry = Arc::new(MemoryRegistry::with_latency(Duration::from_millis(50)));
    let images: Vec<ImageReference> = (0..8)
        .map(|i| registry.add_image(REPO, &format!("image-{}", i)).unwrap())
        .collect();
    let refs: Vec<&ImageReference> = images.iter().collect();
    let r = registry.add_bundle(REPO, "r", lock(&refs)).unwrap();
    let resolver = resolver(&registry, 2);

    let (result, _) = tokio::join!(resolver.resolve(&r), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        resolver.cancel();
    });

    assert!(matches!(result, Err(BundleError::Cancelled)));
    assert_eq!(resolver.throttle().in_flight(), 0);
}

#[tokio::test]
async fn test_resolver_usable_after_cancel() {
    let registry = Arc::new(MemoryRegistry::with_latency(Duration::from_millis(50)));
    let image = registry.add_image(REPO, "image").unwrap();
    let r = registry.add_bundle(REPO, "r", lock(&[&image])).unwrap();
    let resolver = resolver(&registry, 2);

    let (result, _) = tokio::join!(resolver.resolve(&r), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        resolver.cancel();
    });
    assert!(matches!(result, Err(BundleError::Cancelled)));

    let resolution = resolver.clone().resolve(&r).await.unwrap();
    assert_eq!(resolution.artifacts.len(), 2);
    assert_eq!(resolver.throttle().in_flight(), 0);
}

#[tokio::test]
async fn test_caller_cancellation_aborts_only_its_walk() {
    let registry = Arc::new(MemoryRegistry::with_latency(Duration::from_millis(50)));
    let image = registry.add_image(REPO, "image").unwrap();
    let r = registry.add_bundle(REPO, "r", lock(&[&image])).unwrap();
    let resolver = resolver(&registry, 2);
    let cancel = CancellationToken::new();

    let (cancelled, finished, _) = tokio::join!(
        resolver.resolve_with_cancellation(&r, cancel.clone()),
        resolver.resolve(&r),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        }
    );

    assert!(matches!(cancelled, Err(BundleError::Cancelled)));
    assert_eq!(finished.unwrap().artifacts.len(), 2);
    assert_eq!(resolver.throttle().in_flight(), 0);
}

#[tokio::test]
async fn test_deadline_aborts_walk() {
    let registry = Arc::new(MemoryRegistry::with_latency(Duration::from_millis(50)));
    let image = registry.add_image(REPO, "image").unwrap();
    let r = registry.add_bundle(REPO, "r", lock(&[&image])).unwrap();

    let resolver = resolver(&registry, 2).with_timeout(Some(Duration::from_millis(20)));
    let err = resolver.resolve(&r).await.unwrap_err();
    assert!(matches!(err, BundleError::TimeoutError(_)));
    assert_eq!(resolver.throttle().in_flight(), 0);
}
