//! Configuration
//!
//! `StrataConfig` is read from YAML; every field has a default so a partial
//! file (or none at all) is valid. Durations are given in seconds.
//!
//! ```yaml
//! l1_capacity_bytes: 67108864
//! l1_default_ttl_secs: 3600
//! l2_dir: /var/cache/strata
//! l2_capacity_bytes: 2147483648
//! l2_compression_threshold_bytes: 1024
//! l2_default_ttl_secs: 86400
//! preload_window_size: 100
//! preload_top_k: 3
//! ```
//!
//! The fragment graph lives in its own file:
//!
//! ```yaml
//! fragments:
//!   - id: ucdm_comprehensive_index
//!     priority: 10
//!   - id: lesson_mapper
//!     depends_on: [ucdm_comprehensive_index]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{
    CacheConfig, L1Config, L2Config, DEFAULT_FENCE_STRIPES, DEFAULT_L1_CAPACITY, DEFAULT_L1_SHARDS,
    DEFAULT_L2_CAPACITY, DEFAULT_L2_COMPRESSION_THRESHOLD,
};
use crate::error::{Error, Result};
use crate::index::{DependencyGraph, FragmentDecl, DEFAULT_LOADER_WORKERS};
use crate::preload::PreloadConfig;

/// Strata configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrataConfig {
    /// Memory tier budget
    pub l1_capacity_bytes: u64,
    /// TTL for memory entries written without one (null = no expiry)
    pub l1_default_ttl_secs: Option<u64>,
    pub l1_shards: usize,

    /// Disk tier root directory
    pub l2_dir: PathBuf,
    /// Disk tier budget (stored, post-compression bytes)
    pub l2_capacity_bytes: u64,
    /// Payloads at or above this size are LZ4-compressed
    pub l2_compression_threshold_bytes: u64,
    /// TTL for disk entries written without one (null = no expiry)
    pub l2_default_ttl_secs: Option<u64>,
    /// Re-verify every payload checksum when opening
    pub l2_verify_on_open: bool,

    /// Keys remembered per preload session
    pub preload_window_size: usize,
    /// Predictions warmed after each observation
    pub preload_top_k: usize,

    /// Fragments loaded concurrently
    pub loader_workers: usize,
    /// Period of expiry sweeps and idle fragment release
    pub maintenance_interval_secs: u64,
    /// Default wait limit for `get_or_load` (null = wait for the loader)
    pub load_timeout_secs: Option<u64>,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            l1_capacity_bytes: DEFAULT_L1_CAPACITY,
            l1_default_ttl_secs: Some(3600),
            l1_shards: DEFAULT_L1_SHARDS,
            l2_dir: PathBuf::from("./strata-cache"),
            l2_capacity_bytes: DEFAULT_L2_CAPACITY,
            l2_compression_threshold_bytes: DEFAULT_L2_COMPRESSION_THRESHOLD,
            l2_default_ttl_secs: Some(24 * 3600),
            l2_verify_on_open: true,
            preload_window_size: 100,
            preload_top_k: 3,
            loader_workers: DEFAULT_LOADER_WORKERS,
            maintenance_interval_secs: 30 * 60,
            load_timeout_secs: None,
        }
    }
}

impl StrataConfig {
    /// Load and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate YAML text
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no tier can work with
    pub fn validate(&self) -> Result<()> {
        if self.l1_capacity_bytes == 0 {
            return Err(Error::Config("l1_capacity_bytes must be positive".into()));
        }
        if self.l1_shards == 0 {
            return Err(Error::Config("l1_shards must be positive".into()));
        }
        if self.l2_capacity_bytes == 0 {
            return Err(Error::Config("l2_capacity_bytes must be positive".into()));
        }
        if self.l2_compression_threshold_bytes > self.l2_capacity_bytes {
            return Err(Error::Config(format!(
                "l2_compression_threshold_bytes ({}) exceeds l2_capacity_bytes ({})",
                self.l2_compression_threshold_bytes, self.l2_capacity_bytes
            )));
        }
        if self.preload_window_size == 0 {
            return Err(Error::Config("preload_window_size must be positive".into()));
        }
        if self.loader_workers == 0 {
            return Err(Error::Config("loader_workers must be positive".into()));
        }
        if self.maintenance_interval_secs == 0 {
            return Err(Error::Config("maintenance_interval_secs must be positive".into()));
        }
        if self.load_timeout_secs == Some(0) {
            return Err(Error::Config("load_timeout_secs must be positive when set".into()));
        }
        Ok(())
    }

    pub fn l1_config(&self) -> L1Config {
        L1Config {
            capacity: self.l1_capacity_bytes,
            default_ttl: self.l1_default_ttl_secs.map(Duration::from_secs),
            shard_count: self.l1_shards,
        }
    }

    pub fn l2_config(&self) -> L2Config {
        L2Config {
            dir: self.l2_dir.clone(),
            capacity: self.l2_capacity_bytes,
            compression_threshold: self.l2_compression_threshold_bytes,
            default_ttl: self.l2_default_ttl_secs.map(Duration::from_secs),
            verify_on_open: self.l2_verify_on_open,
        }
    }

    pub fn preload_config(&self) -> PreloadConfig {
        PreloadConfig {
            window_size: self.preload_window_size,
            top_k: self.preload_top_k,
        }
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Everything the cache manager needs
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            l1: self.l1_config(),
            l2: self.l2_config(),
            preload: self.preload_config(),
            loader_workers: self.loader_workers,
            fence_stripes: DEFAULT_FENCE_STRIPES,
            load_timeout: self.load_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Fragment graph declaration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FragmentsFile {
    #[serde(default)]
    pub fragments: Vec<FragmentDecl>,
}

impl FragmentsFile {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Validate into a graph; cycles fail here
    pub fn into_graph(self) -> Result<DependencyGraph> {
        DependencyGraph::new(self.fragments)
    }
}

// =============================================================================
// Tests
// =============================================================================
