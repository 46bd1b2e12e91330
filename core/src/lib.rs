//! Bundlegraph Core - Foundational Types and Abstractions
//!
//! Error taxonomy, configuration and the throttling primitive shared by
//! the bundle graph resolver.

pub mod config;
pub mod error;
pub mod throttle;

// Re-export commonly used types
pub use config::{GraphConfig, RegistryConfig, RegistryProtocol, DEFAULT_CONCURRENCY};
pub use error::{BundleError, Result};
pub use throttle::{ThrottlePermit, ThrottledWalker};

/// Bundlegraph version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
