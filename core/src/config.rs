use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BundleError, Result};

/// Default number of registry calls allowed in flight during a walk.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Graph resolution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Maximum registry calls in flight across every branch of a walk
    pub concurrency: usize,

    /// Deadline for a whole resolve/describe call in seconds (0 = unlimited)
    pub timeout_secs: u64,

    /// Consult the locations cache before classifying a bundle's images
    pub use_locations_cache: bool,

    /// Registry connection settings
    pub registry: RegistryConfig,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout_secs: 0,
            use_locations_cache: true,
            registry: RegistryConfig::default(),
        }
    }
}

impl GraphConfig {
    /// Build a configuration from defaults overlaid with environment variables.
    ///
    /// Reads `BUNDLEGRAPH_CONCURRENCY`, `BUNDLEGRAPH_TIMEOUT_SECS`,
    /// `BUNDLEGRAPH_USE_LOCATIONS_CACHE` and `BUNDLEGRAPH_INSECURE_REGISTRIES`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("BUNDLEGRAPH_CONCURRENCY") {
            config.concurrency = value.trim().parse().map_err(|_| {
                BundleError::ConfigError(format!(
                    "BUNDLEGRAPH_CONCURRENCY must be a positive integer, got '{}'",
                    value
                ))
            })?;
        }

        if let Some(value) = lookup("BUNDLEGRAPH_TIMEOUT_SECS") {
            config.timeout_secs = value.trim().parse().map_err(|_| {
                BundleError::ConfigError(format!(
                    "BUNDLEGRAPH_TIMEOUT_SECS must be a number of seconds, got '{}'",
                    value
                ))
            })?;
        }

        if let Some(value) = lookup("BUNDLEGRAPH_USE_LOCATIONS_CACHE") {
            config.use_locations_cache = parse_bool(&value).ok_or_else(|| {
                BundleError::ConfigError(format!(
                    "BUNDLEGRAPH_USE_LOCATIONS_CACHE must be true or false, got '{}'",
                    value
                ))
            })?;
        }

        if let Some(value) = lookup("BUNDLEGRAPH_INSECURE_REGISTRIES") {
            config.registry.insecure_registries = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML configuration document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            BundleError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&data)
    }

    /// Reject configurations that cannot make progress.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(BundleError::ConfigError(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The walk deadline, if one is configured.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        (self.timeout_secs > 0).then(|| std::time::Duration::from_secs(self.timeout_secs))
    }
}

/// Registry connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Protocol used for registries not listed as insecure
    pub protocol: RegistryProtocol,

    /// Registries reached over plain HTTP (e.g. "localhost:5000")
    pub insecure_registries: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            protocol: RegistryProtocol::Https,
            insecure_registries: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// Whether `registry` should be reached over plain HTTP.
    pub fn is_insecure(&self, registry: &str) -> bool {
        self.protocol == RegistryProtocol::Http
            || self.insecure_registries.iter().any(|r| r == registry)
    }
}

/// Registry transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryProtocol {
    Https,
    Http,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
