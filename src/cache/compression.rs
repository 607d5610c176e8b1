//! Payload Compression for the Disk Tier
//!
//! LZ4 above a size threshold, kept only when it actually shrinks the
//! payload. The algorithm used is recorded per entry in the disk index.
//!
//! # Example
//!
//! ```
//! use strata::cache::compression::{CompressionConfig, CompressionManager};
//!
//! let manager = CompressionManager::with_config(CompressionConfig {
//!     threshold_bytes: 16,
//!     ..Default::default()
//! });
//!
//! let data = b"lesson lesson lesson lesson lesson lesson lesson lesson";
//! let (stored, algorithm) = manager.compress(data);
//!
//! let restored = manager.decompress(&stored, algorithm).unwrap();
//! assert_eq!(restored.as_ref(), data);
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as-is
    #[default]
    None,
    /// LZ4 block format with size prefix
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Algorithm used for payloads at or above the threshold
    pub algorithm: CompressionAlgorithm,
    /// Payloads smaller than this are stored uncompressed
    pub threshold_bytes: u64,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Lz4,
            threshold_bytes: 1024,
            level: 4,
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 compressor
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::with_level(4)
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Threshold-aware compression with fallback to uncompressed storage
pub struct CompressionManager {
    config: CompressionConfig,
    noop: NoopCompressor,
    lz4: Lz4Compressor,
}

impl CompressionManager {
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            lz4: Lz4Compressor::with_level(config.level),
            noop: NoopCompressor,
            config,
        }
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Compress for storage.
    ///
    /// Returns (stored_bytes, algorithm_used). Falls back to uncompressed when
    /// the payload is below threshold, compression fails, or it does not shrink.
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if (data.len() as u64) < self.config.threshold_bytes
            || self.config.algorithm == CompressionAlgorithm::None
        {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.compressor(self.config.algorithm).compress(data) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), self.config.algorithm)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                warn!("Compression failed, storing uncompressed: {}", e);
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Restore a stored payload
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        let decompressed = self.compressor(algorithm).decompress(data)?;
        Ok(Bytes::from(decompressed))
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    fn manager(threshold_bytes: u64) -> CompressionManager {
        CompressionManager::with_config(CompressionConfig {
            threshold_bytes,
            ..Default::default()
        })
    }

    #[test]
    fn test_lz4_roundtrip() {
        let compressor = Lz4Compressor::default();
        let compressed = compressor.compress(TEST_DATA).unwrap();
        assert!(compressed.len() < TEST_DATA.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), TEST_DATA);
    }

    #[test]
    fn test_below_threshold_is_stored_raw() {
        let (stored, algorithm) = manager(1024).compress(TEST_DATA);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored.as_ref(), TEST_DATA);
    }

    #[test]
    fn test_above_threshold_compresses() {
        let data = TEST_DATA.repeat(20);
        let manager = manager(64);
        let (stored, algorithm) = manager.compress(&data);
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);
        assert!(stored.len() < data.len());
        assert_eq!(manager.decompress(&stored, algorithm).unwrap().as_ref(), &data[..]);
    }

    #[test]
    fn test_incompressible_data_falls_back() {
        // xorshift noise does not compress
        let mut state = 0x2545F4914F6CDD1Du64;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();

        let (stored, algorithm) = manager(64).compress(&noise);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored.len(), noise.len());
    }

    #[test]
    fn test_corrupt_lz4_is_an_error() {
        let result = manager(0).decompress(&[0xff, 0xff, 0xff, 0xff, 1, 2, 3], CompressionAlgorithm::Lz4);
        assert!(matches!(result, Err(Error::DecompressionFailed { .. })));
    }

    #[test]
    fn test_algorithm_serde_names() {
        assert_eq!(serde_json::to_string(&CompressionAlgorithm::Lz4).unwrap(), "\"lz4\"");
        assert_eq!(CompressionAlgorithm::None.to_string(), "none");
    }
}
