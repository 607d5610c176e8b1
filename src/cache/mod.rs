//! Tiered Cache
//!
//! Memory (L1) and disk (L2) tiers behind a single-flight façade, with the
//! index tier consulted for `index:` keys.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          CacheManager                                │
//! │   get_or_load(k) ─► L1 ─► L2 ─► index lookup ─► single-flight load   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  L1 (RAM)              │ L2 (disk)               │ Index (L3)        │
//! │  ┌──────────────────┐  │ ┌─────────────────────┐ │ ┌───────────────┐ │
//! │  │ ShardedMap       │  │ │ index.json + data/  │ │ │ fragment      │ │
//! │  │ LRU + TTL        │  │ │ SHA-256, LZ4        │ │ │ state machines│ │
//! │  └──────────────────┘  │ └─────────────────────┘ │ └───────────────┘ │
//! │          ▲             │           ▲             │                   │
//! │          └──── InvalidationFence ──┘  (late writes are dropped)      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Write ordering
//!
//! A loaded value is written to L2 before L1. Within L2 the payload file is
//! durable before the index references it.

mod entry;
mod fence;
mod flight;
mod l1;
mod l2;
mod manager;
mod metrics;
mod proptest;
mod shard;
pub mod compression;

pub use compression::{CompressionAlgorithm, CompressionConfig, CompressionManager, Compressor};
pub use entry::{CacheEntry, CacheKey, Checksum, EntryMetadata, KeyDeriver, NamespacedKeys, INDEX_NAMESPACE};
pub use fence::{FenceToken, InvalidationFence};
pub use flight::{FlightMap, LoadOutcome};
pub use l1::{L1Cache, L1Config, L1Stats};
pub use l2::{L2Cache, L2Config, L2Hit, L2IndexEntry, L2Stats};
pub use manager::{CacheConfig, CacheManager};
pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot, TierGauges};
pub use shard::{Shard, ShardedMap};

/// Default L1 capacity (64 MiB)
pub const DEFAULT_L1_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default number of L1 shards
pub const DEFAULT_L1_SHARDS: usize = 64;

/// Default L2 capacity (2 GiB)
pub const DEFAULT_L2_CAPACITY: u64 = 2 * 1024 * 1024 * 1024;

/// Payloads at or above this size are compressed in L2 (1 KiB)
pub const DEFAULT_L2_COMPRESSION_THRESHOLD: u64 = 1024;

/// Stripes in the invalidation fence
pub const DEFAULT_FENCE_STRIPES: usize = 256;

// =============================================================================
// Tests
// =============================================================================
