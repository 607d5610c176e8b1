//! Index Tier and Fragment Loading
//!
//! Structured index data split into fragments with declared dependencies.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  LazyLoader   request(ids) ─► closure ─► priority queue    │
//! │                                     │                      │
//! │                         workers ────┘ (deps Loaded first)  │
//! ├────────────────────────────────────────────────────────────┤
//! │  IndexTier    one state machine per fragment               │
//! │               Unloaded → Loading → Loaded | Failed         │
//! │               lookup() reads Loaded payloads, never waits  │
//! ├────────────────────────────────────────────────────────────┤
//! │  DependencyGraph  immutable, validated acyclic at startup  │
//! ├────────────────────────────────────────────────────────────┤
//! │  FragmentSource   JSON directory / in-memory               │
//! └────────────────────────────────────────────────────────────┘
//! ```

mod graph;
mod loader;
mod query;
mod source;
mod tier;

pub use graph::{DependencyGraph, FragmentDecl, FragmentId};
pub use loader::{LazyLoader, LoadResult, LoadStats, DEFAULT_LOADER_WORKERS};
pub use query::StructuredQuery;
pub use source::{FragmentSource, InMemoryFragmentSource, JsonDirSource};
pub use tier::{FragmentState, FragmentUsage, IndexStats, IndexTier, NodeStatus};
