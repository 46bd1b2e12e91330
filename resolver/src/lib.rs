//! Bundlegraph Resolver - nested bundle graph resolution.
//!
//! Given a root bundle, walks every image and nested bundle it transitively
//! declares, tracks every location each artifact is known at, caches the
//! classification next to the bundle, and describes the result as a tree.
//!
//! ```text
//!   root ref ──► GraphResolver ──► BundleIdentity ──► Registry
//!                   │    ▲               │
//!                   │    └── ThrottledWalker (bounded, cancellable)
//!                   ▼
//!         Resolution { artifacts, bundles }
//!            │                    │
//!            ▼                    ▼
//!      LocationsCache        TreeDescriber ◄── SignatureSource
//! ```

#![allow(clippy::result_large_err)]

pub mod artifact;
pub mod describe;
pub mod graph;
pub mod identity;
pub mod locations;
pub mod lock;
pub mod oci;
pub mod signature;

// Re-export common types
pub use artifact::{ArtifactRef, ArtifactSet, BundleClass};
pub use describe::{Content, Description, DescriptionKind, TreeDescriber};
pub use graph::{BundleNode, Dependency, GraphResolver, Resolution};
pub use identity::{BundleIdentity, Classification};
pub use locations::{ImageLocation, LocationsCache, LocationsConfig};
pub use lock::{ImagesLock, LocalizedLock, LockedImage};
pub use oci::{ImageReference, MemoryRegistry, OciRegistry, Registry, RegistryAuth};
pub use signature::{NoSignatures, RegistrySignatures, SignatureSource};

/// Bundlegraph Resolver version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
