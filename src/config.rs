//! Resolver Configuration
//!
//! Cache, timestamp and pagination settings. Every field has a serde default so
//! partial JSON documents are accepted.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ResolverError, ResolverResult};

/// Top-level resolver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Request-scoped read cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Automatic creation/update stamps
    #[serde(default)]
    pub timestamps: TimestampConfig,

    /// Pagination limits
    #[serde(default)]
    pub pagination: PaginationConfig,
}

impl ResolverConfig {
    /// Parse a configuration from a JSON string
    pub fn from_json_str(json: &str) -> ResolverResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| ResolverError::config(format!("Invalid resolver config: {}", e)))
    }

    /// Load a configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> ResolverResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ResolverError::config(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Same configuration with the read cache turned off
    pub fn with_cache_disabled(mut self) -> Self {
        self.cache = CacheConfig::disabled();
        self
    }
}

/// Batching cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether identical reads are deduplicated (default: true)
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Maximum cached keys per request (default: 10000)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_max_entries() -> usize {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    /// Pass-through configuration: every read reaches the driver
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_entries: 0,
        }
    }
}

/// Timestamp stamping configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampConfig {
    /// Whether entity models get creation/update stamps (default: true)
    #[serde(default = "default_timestamps_enabled")]
    pub enabled: bool,

    /// Field stamped on create (default: "createdAt")
    #[serde(default = "default_created_field")]
    pub created_field: String,

    /// Field stamped on create and update (default: "updatedAt")
    #[serde(default = "default_updated_field")]
    pub updated_field: String,
}

fn default_timestamps_enabled() -> bool {
    true
}

fn default_created_field() -> String {
    "createdAt".to_string()
}

fn default_updated_field() -> String {
    "updatedAt".to_string()
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            enabled: default_timestamps_enabled(),
            created_field: default_created_field(),
            updated_field: default_updated_field(),
        }
    }
}

/// Pagination configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaginationConfig {
    /// Upper bound for `first`/`last`/`limit`; None means unbounded
    #[serde(default)]
    pub max_page_size: Option<usize>,
}
