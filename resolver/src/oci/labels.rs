//! Bundle metadata from OCI image config labels.
//!
//! A bundle is a single-manifest image whose config carries the
//! `dev.bundlegraph.bundle` label. Nothing else in the bundle's
//! contents is interpreted by the resolver.
//!
//! # Example
//!
//! ```dockerfile
//! LABEL dev.bundlegraph.bundle="true"
//! LABEL dev.bundlegraph.bundle.version="1.4.0"
//! ```

use std::collections::HashMap;

/// Label marking an image as a bundle.
pub const BUNDLE_LABEL: &str = "dev.bundlegraph.bundle";

/// Optional label carrying the bundle's own version string.
pub const BUNDLE_VERSION_LABEL: &str = "dev.bundlegraph.bundle.version";

/// Bundle metadata parsed from OCI labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleLabels {
    /// Value of the bundle marker label, if present
    pub marker: Option<String>,

    /// Bundle version, if declared
    pub version: Option<String>,
}

impl BundleLabels {
    /// Parse bundle metadata from OCI image labels.
    pub fn from_labels(labels: &HashMap<String, String>) -> Self {
        Self {
            marker: labels.get(BUNDLE_LABEL).cloned(),
            version: labels.get(BUNDLE_VERSION_LABEL).cloned(),
        }
    }

    /// Whether the image is a bundle.
    ///
    /// Presence of the marker label is what counts; its value is not
    /// interpreted, except that an explicit "false" opts out.
    pub fn is_bundle(&self) -> bool {
        match self.marker.as_deref() {
            Some(value) => !value.trim().eq_ignore_ascii_case("false"),
            None => false,
        }
    }

    /// Labels to put on an image so that it is classified as a bundle.
    pub fn bundle_marker() -> HashMap<String, String> {
        HashMap::from([(BUNDLE_LABEL.to_string(), "true".to_string())])
    }
}
