//! OCI registry access for the bundle graph.
//!
//! - Image reference parsing and the derived references the walk needs
//!   (colocated copies, digest-derived tags)
//! - The [`Registry`] capability trait
//! - [`OciRegistry`], a real registry client, and [`MemoryRegistry`],
//!   an in-process registry
//! - Bundle label and layer helpers
//!
//! # Bundle layout
//!
//! ```text
//! ghcr.io/org/bundle@sha256:...
//!   config   Labels: dev.bundlegraph.bundle=true
//!   layer    .bundlegraph/images.yml   (images lock)
//!
//! ghcr.io/org/bundle:sha256-<hex>.image-locations.bundlegraph
//!   layer    ImageLocations document   (locations cache)
//! ```

mod labels;
mod layers;
pub mod memory;
pub mod reference;
pub mod registry;

pub use labels::{BundleLabels, BUNDLE_LABEL, BUNDLE_VERSION_LABEL};
pub use layers::read_layer_file;
pub use memory::{MemoryRegistry, Operation};
pub use reference::ImageReference;
pub use registry::{ManifestConfig, OciRegistry, Registry, RegistryAuth};
