//! Strata - Multi-Tier Cache with Lazy Index Loading
//!
//! A cache that sits between a content-lookup API and slow sources: large
//! on-disk indexes and the mappings derived from them.
//!
//! # Architecture
//!
//! ```text
//! request(k) ─► CacheManager ─► L1 (memory) ─► L2 (disk) ─► index tier ─► loader_fn
//!                    │                                          ▲
//!                    └──► PredictivePreloader ──► LazyLoader ───┘
//! ```
//!
//! - L1: sharded, LRU + TTL, bounded by bytes
//! - L2: persistent, LZ4-compressed, SHA-256 verified; corrupt entries are
//!   dropped and read as misses
//! - Index tier: fragments with declared dependencies, each with its own
//!   Unloaded / Loading / Loaded / Failed state machine
//! - Lazy loader: prioritized, dependency-aware background loading
//! - Predictive preloader: learns key transitions and warms likely next keys
//!
//! # Modules
//!
//! - [`cache`] - Memory and disk tiers and the [`CacheManager`] façade
//! - [`config`] - YAML configuration
//! - [`error`] - Error types
//! - [`exporter`] - Prometheus exposition of cache metrics
//! - [`index`] - Dependency graph, index tier and lazy loader
//! - [`preload`] - Usage windows and predictive preloading

pub mod cache;
pub mod config;
pub mod error;
pub mod exporter;
pub mod index;
pub mod preload;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheKey, CacheManager, MetricsSnapshot};
pub use config::{FragmentsFile, StrataConfig};
pub use error::{Error, Result};
pub use exporter::MetricsExporter;
pub use index::{DependencyGraph, FragmentDecl, FragmentSource, JsonDirSource, StructuredQuery};
pub use preload::{PredictivePreloader, PreloadConfig};
