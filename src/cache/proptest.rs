//! Property-Based Tests for the Cache Tiers
//!
//! # Test Properties
//!
//! 1. **Capacity**: L1 resident size never exceeds capacity after any operation
//! 2. **Round-trip**: L2 returns exactly what was stored, either side of the
//!    compression threshold
//! 3. **Corruption**: a flipped byte in a persisted payload never surfaces as
//!    different data
//! 4. **Resolution**: dependency closures are stable and dependencies-first

#![cfg(test)]

use std::fs;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tempfile::TempDir;

use super::compression::CompressionAlgorithm;
use super::entry::CacheKey;
use super::l1::{L1Cache, L1Config};
use super::l2::{L2Cache, L2Config};
use crate::error::Error;
use crate::index::{DependencyGraph, FragmentDecl};

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum L1Op {
    Put { key: u8, size: usize },
    Get { key: u8 },
    Invalidate { key: u8 },
}

fn l1_op_strategy() -> impl Strategy<Value = L1Op> {
    prop_oneof![
        4 => (0u8..32, 1usize..600).prop_map(|(key, size)| L1Op::Put { key, size }),
        3 => (0u8..32).prop_map(|key| L1Op::Get { key }),
        1 => (0u8..32).prop_map(|key| L1Op::Invalidate { key }),
    ]
}

/// Random bytes or a short repeated pattern (compressible)
fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 1..4096),
        (prop::collection::vec(any::<u8>(), 1..8), 1usize..4096)
            .prop_map(|(pattern, len)| pattern.iter().copied().cycle().take(len).collect()),
    ]
}

/// Acyclic declarations: fragment `i` may only depend on fragments `< i`.
/// Returned shuffled so declaration order differs from dependency order.
fn dag_strategy() -> impl Strategy<Value = Vec<FragmentDecl>> {
    (2usize..10)
        .prop_flat_map(|n| {
            let edges = prop::collection::vec(prop::collection::vec(any::<bool>(), n), n);
            (Just(n), edges)
        })
        .prop_map(|(n, edges)| {
            (0..n)
                .map(|i| {
                    let deps: Vec<String> = (0..i).filter(|&j| edges[i][j]).map(|j| format!("f{j}")).collect();
                    FragmentDecl::new(format!("f{i}")).depends_on(deps)
                })
                .collect()
        })
        .prop_shuffle()
}

fn l2_at(dir: &TempDir) -> L2Cache {
    L2Cache::open(L2Config {
        dir: dir.path().to_path_buf(),
        capacity: 1024 * 1024,
        compression_threshold: 1024,
        default_ttl: None,
        verify_on_open: true,
    })
    .unwrap()
}

// =============================================================================
// L1 Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: resident size stays within capacity whatever the op sequence.
    #[test]
    fn prop_l1_size_never_exceeds_capacity(
        ops in prop::collection::vec(l1_op_strategy(), 1..200),
    ) {
        let capacity = 2048u64;
        let l1 = L1Cache::with_config(L1Config {
            capacity,
            default_ttl: Some(Duration::from_secs(60)),
            shard_count: 4,
        });

        for op in ops {
            match op {
                L1Op::Put { key, size } => {
                    let key = CacheKey::new("p", key.to_string()).unwrap();
                    l1.put(key, Bytes::from(vec![0u8; size]), None)?;
                }
                L1Op::Get { key } => {
                    l1.get(&CacheKey::new("p", key.to_string()).unwrap());
                }
                L1Op::Invalidate { key } => {
                    l1.invalidate(&CacheKey::new("p", key.to_string()).unwrap());
                }
            }
            prop_assert!(l1.size() <= capacity, "size {} > capacity {}", l1.size(), capacity);
        }
    }

    /// Property: a value larger than the tier is rejected, never stored.
    #[test]
    fn prop_l1_rejects_oversized(size in 2049usize..8192) {
        let l1 = L1Cache::with_config(L1Config {
            capacity: 2048,
            default_ttl: None,
            shard_count: 4,
        });
        let result = l1.put(CacheKey::new("p", "big").unwrap(), Bytes::from(vec![1u8; size]), None);
        prop_assert!(matches!(result, Err(Error::CapacityExceeded { .. })), "expected Err(CapacityExceeded)");
        prop_assert_eq!(l1.size(), 0);
    }
}

// =============================================================================
// L2 Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: put then get returns the stored bytes for every size.
    #[test]
    fn prop_l2_roundtrip(data in payload_strategy()) {
        let dir = TempDir::new().unwrap();
        let l2 = l2_at(&dir);
        let key = CacheKey::new("p", "roundtrip").unwrap();

        l2.put(key.clone(), &data, None)?;
        let hit = l2.get(&key);
        prop_assert!(hit.is_some());
        let hit = hit.unwrap();
        prop_assert_eq!(hit.data.as_ref(), data.as_slice());

        let entry = l2.index_entry(&key).unwrap();
        if data.len() < 1024 {
            prop_assert_eq!(entry.compression, CompressionAlgorithm::None);
        }
    }

    /// Property: flipping any byte of a persisted payload never returns
    /// altered data. Raw payloads always become a miss.
    #[test]
    fn prop_l2_corruption_never_surfaces(
        data in payload_strategy(),
        position in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let dir = TempDir::new().unwrap();
        let l2 = l2_at(&dir);
        let key = CacheKey::new("p", "victim").unwrap();
        l2.put(key.clone(), &data, None)?;

        let compressed = l2.index_entry(&key).unwrap().compression != CompressionAlgorithm::None;
        let path = l2.payload_path(&key).unwrap();
        let mut stored = fs::read(&path).unwrap();
        let at = position.index(stored.len());
        stored[at] ^= flip;
        fs::write(&path, &stored).unwrap();

        match l2.get(&key) {
            None => prop_assert!(!l2.contains(&key)),
            Some(hit) => {
                // A compressed stream can decode identically after a flip
                prop_assert!(compressed);
                prop_assert_eq!(hit.data.as_ref(), data.as_slice());
            }
        }
    }
}

// =============================================================================
// Dependency Resolution Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: every closure lists dependencies before dependents, is the
    /// same on repeated calls and the same whatever the declaration order.
    #[test]
    fn prop_resolve_is_stable_and_ordered(decls in dag_strategy()) {
        let graph = DependencyGraph::new(decls.clone())?;
        let mut reversed = decls.clone();
        reversed.reverse();
        let other = DependencyGraph::new(reversed)?;

        for decl in &decls {
            let closure = graph.resolve(&decl.id)?;
            prop_assert_eq!(&closure, &graph.resolve(&decl.id)?);
            prop_assert_eq!(closure.last(), Some(&decl.id));

            let mut as_set = closure.clone();
            as_set.sort();
            let mut other_set = other.resolve(&decl.id)?;
            other_set.sort();
            prop_assert_eq!(as_set, other_set);

            for (pos, id) in closure.iter().enumerate() {
                for dep in &graph.decl(id).unwrap().depends_on {
                    let dep_pos = closure.iter().position(|f| f == dep);
                    prop_assert!(dep_pos.is_some_and(|d| d < pos), "{} before {}", dep, id);
                }
            }
        }
    }

    /// Property: closing any dependency chain into a loop fails construction.
    #[test]
    fn prop_cycle_always_detected(n in 1usize..8) {
        let decls: Vec<FragmentDecl> = (0..n)
            .map(|i| FragmentDecl::new(format!("c{i}")).depends_on([format!("c{}", (i + 1) % n)]))
            .collect();
        let result = DependencyGraph::new(decls);
        prop_assert!(matches!(result, Err(Error::CycleDetected { .. })), "expected Err(CycleDetected)");
    }
}
