//! Error types for Strata

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Strata
///
/// A cache miss is never an error: lookups return `Option::None` for that.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Cache Tier Errors
    // =========================================================================
    /// Stored payload failed its integrity check
    #[error("Corrupted entry for key {key}: {reason}")]
    Corrupted { key: String, reason: String },

    /// A single entry is larger than the whole tier
    #[error("Entry of {size} bytes exceeds {tier} capacity of {capacity} bytes")]
    CapacityExceeded {
        tier: &'static str,
        size: u64,
        capacity: u64,
    },

    /// Caller-supplied loader failed; the cause is shared by all waiters
    #[error("Loader failed for key {key}: {cause:#}")]
    LoadFailed {
        key: String,
        cause: Arc<anyhow::Error>,
    },

    /// Caller stopped waiting; the underlying load keeps running
    #[error("Timed out after {after:?} waiting for key {key}")]
    Timeout { key: String, after: Duration },

    // =========================================================================
    // Index / Fragment Errors
    // =========================================================================
    /// The declared dependency graph contains a cycle
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// Fragment id not present in the declared graph
    #[error("Unknown fragment: {0}")]
    UnknownFragment(String),

    /// Fragment declared twice
    #[error("Duplicate fragment declaration: {0}")]
    DuplicateFragment(String),

    /// Declared dependency refers to an undeclared fragment
    #[error("Fragment {fragment} depends on undeclared fragment {dependency}")]
    UnknownDependency { fragment: String, dependency: String },

    /// Fragment materialization failed
    #[error("Fragment {fragment} failed to load: {reason}")]
    FragmentLoadFailed { fragment: String, reason: String },

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

impl Error {
    /// True for faults a tier absorbs locally (degrading to a miss)
    pub fn is_tier_local(&self) -> bool {
        matches!(
            self,
            Error::Corrupted { .. }
                | Error::CapacityExceeded { .. }
                | Error::DecompressionFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = Error::CycleDetected {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_load_failed_keeps_cause() {
        #[derive(Debug, thiserror::Error)]
        #[error("backing store offline")]
        struct Offline;

        let err = Error::LoadFailed {
            key: "lesson:1".into(),
            cause: Arc::new(anyhow::Error::new(Offline)),
        };
        assert!(err.to_string().contains("backing store offline"));
        match err {
            Error::LoadFailed { cause, .. } => assert!(cause.downcast_ref::<Offline>().is_some()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_tier_local_classification() {
        let capacity = Error::CapacityExceeded {
            tier: "L1",
            size: 10,
            capacity: 5,
        };
        assert!(capacity.is_tier_local());
        assert!(!Error::UnknownFragment("x".into()).is_tier_local());
    }
}
