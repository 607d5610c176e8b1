//! Invalidation Fences
//!
//! Striped generation counters. A writer that raced an invalidation (a load
//! that finished late, an L2→L1 promotion, a preload) takes a token before it
//! reads or computes its value and only publishes if the token is still
//! current when checked under the target tier's lock.
//!
//! Keys share stripes, so an invalidation may spuriously reject an unrelated
//! write. That costs a reload, never correctness.

use std::sync::atomic::{AtomicU64, Ordering};

use super::entry::CacheKey;

/// Generation observed for one key at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceToken {
    stripe: usize,
    generation: u64,
}

/// Striped invalidation generations
pub struct InvalidationFence {
    stripes: Box<[AtomicU64]>,
    mask: usize,
}

impl InvalidationFence {
    /// `stripes` is rounded up to a power of two
    pub fn new(stripes: usize) -> Self {
        let count = stripes.max(1).next_power_of_two();
        Self {
            stripes: (0..count).map(|_| AtomicU64::new(0)).collect(),
            mask: count - 1,
        }
    }

    #[inline]
    fn stripe(&self, key: &CacheKey) -> usize {
        key.shard_index(self.mask + 1)
    }

    /// Snapshot the key's generation
    pub fn token(&self, key: &CacheKey) -> FenceToken {
        let stripe = self.stripe(key);
        FenceToken {
            stripe,
            generation: self.stripes[stripe].load(Ordering::Acquire),
        }
    }

    /// True if no invalidation touched the token's stripe since it was taken
    pub fn is_current(&self, token: &FenceToken) -> bool {
        self.stripes[token.stripe].load(Ordering::Acquire) == token.generation
    }

    /// Invalidate one key; returns the new generation
    pub fn bump(&self, key: &CacheKey) -> u64 {
        self.stripes[self.stripe(key)].fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Invalidate every key (predicate-based invalidation)
    pub fn bump_all(&self) {
        for stripe in self.stripes.iter() {
            stripe.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }
}

impl Default for InvalidationFence {
    fn default() -> Self {
        Self::new(super::DEFAULT_FENCE_STRIPES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_survives_unrelated_stripes() {
        let fence = InvalidationFence::new(1024);
        let a = CacheKey::new("lesson", "a").unwrap();
        let b = (0..)
            .map(|i| CacheKey::new("lesson", format!("b{i}")).unwrap())
            .find(|k| k.shard_index(1024) != a.shard_index(1024))
            .unwrap();

        let token = fence.token(&a);
        fence.bump(&b);
        assert!(fence.is_current(&token));

        fence.bump(&a);
        assert!(!fence.is_current(&token));
        assert!(fence.is_current(&fence.token(&a)));
    }

    #[test]
    fn test_bump_all_invalidates_every_token() {
        let fence = InvalidationFence::new(8);
        let tokens: Vec<_> = (0..32)
            .map(|i| fence.token(&CacheKey::new("concept", i.to_string()).unwrap()))
            .collect();
        fence.bump_all();
        assert!(tokens.iter().all(|t| !fence.is_current(t)));
    }

    #[test]
    fn test_stripe_count_rounds_up() {
        assert_eq!(InvalidationFence::new(100).stripe_count(), 128);
        assert_eq!(InvalidationFence::new(0).stripe_count(), 1);
    }
}
