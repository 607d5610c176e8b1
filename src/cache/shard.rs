//! Sharded Map Implementation
//!
//! Concurrent hashmap split into power-of-two shards, each behind its own
//! RwLock. Readers of one shard never block each other; a writer only blocks
//! operations on the same shard.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Single shard containing a hashmap and statistics
pub struct Shard<K, V> {
    /// The hashmap for this shard
    map: RwLock<HashMap<K, V>>,
    /// Number of entries
    count: AtomicU64,
    /// Number of reads
    reads: AtomicU64,
    /// Number of writes
    writes: AtomicU64,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Shard<K, V> {
    /// Create a new empty shard
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            count: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl<K: Eq + Hash, V> Shard<K, V> {
    /// Get a value from the shard
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().contains_key(key)
    }

    /// Insert a value, returning the old value if present
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();
        let old = guard.insert(key, value);
        if old.is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        old
    }

    /// Insert only if `guard` holds while the write lock is held.
    ///
    /// Returns `Err(value)` when the guard rejects the insert.
    pub fn insert_if<G>(&self, key: K, value: V, guard: G) -> Result<Option<V>, V>
    where
        G: FnOnce() -> bool,
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut map = self.map.write();
        if !guard() {
            return Err(value);
        }
        let old = map.insert(key, value);
        if old.is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(old)
    }

    /// Remove a value, returning it if present
    pub fn remove(&self, key: &K) -> Option<V> {
        self.remove_if(key, |_| true)
    }

    /// Remove a value only if `pred` accepts the current value
    pub fn remove_if<P>(&self, key: &K, pred: P) -> Option<V>
    where
        P: FnOnce(&V) -> bool,
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();
        if !guard.get(key).is_some_and(pred) {
            return None;
        }
        let removed = guard.remove(key);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every entry matching `pred`, returning what was removed
    pub fn drain_matching<P>(&self, mut pred: P) -> Vec<(K, V)>
    where
        K: Clone,
        P: FnMut(&K, &V) -> bool,
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();
        let doomed: Vec<K> = guard
            .iter()
            .filter(|(k, v)| pred(k, v))
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for key in doomed {
            if let Some(value) = guard.remove(&key) {
                removed.push((key, value));
            }
        }
        self.count.fetch_sub(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    /// Clear all entries
    pub fn clear(&self) {
        let mut guard = self.map.write();
        guard.clear();
        self.count.store(0, Ordering::Relaxed);
    }

    /// Snapshot of all entries (for eviction scans)
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let guard = self.map.read();
        guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Sharded map with a power-of-two shard count chosen at runtime
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
    mask: usize,
}

impl<K, V> ShardedMap<K, V> {
    /// Create a sharded map; `shard_count` is rounded up to a power of two
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        let shards: Vec<Shard<K, V>> = (0..count).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
            mask: count - 1,
        }
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Get total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Iterate shards (eviction and sweep passes walk them one at a time)
    pub fn shards(&self) -> impl Iterator<Item = &Shard<K, V>> {
        self.shards.iter()
    }
}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
    #[inline]
    fn shard_for(&self, key: &K) -> &Shard<K, V> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & self.mask]
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shard_for(key).get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shard_for(key).contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard_for(&key).insert(key, value)
    }

    pub fn insert_if<G>(&self, key: K, value: V, guard: G) -> Result<Option<V>, V>
    where
        G: FnOnce() -> bool,
    {
        self.shard_for(&key).insert_if(key, value, guard)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard_for(key).remove(key)
    }

    pub fn remove_if<P>(&self, key: &K, pred: P) -> Option<V>
    where
        P: FnOnce(&V) -> bool,
    {
        self.shard_for(key).remove_if(key, pred)
    }

    /// Remove matching entries from every shard
    pub fn drain_matching<P>(&self, mut pred: P) -> Vec<(K, V)>
    where
        K: Clone,
        P: FnMut(&K, &V) -> bool,
    {
        self.shards
            .iter()
            .flat_map(|shard| shard.drain_matching(&mut pred))
            .collect()
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }
}

/// Statistics for a sharded map
#[derive(Debug, Clone)]
pub struct ShardedMapStats {
    pub total_entries: usize,
    pub total_reads: u64,
    pub total_writes: u64,
    /// Entries in the fullest shard
    pub max_shard_entries: usize,
}

impl<K, V> ShardedMap<K, V> {
    pub fn stats(&self) -> ShardedMapStats {
        ShardedMapStats {
            total_entries: self.len(),
            total_reads: self.shards.iter().map(|s| s.read_count()).sum(),
            total_writes: self.shards.iter().map(|s| s.write_count()).sum(),
            max_shard_entries: self.shards.iter().map(|s| s.len()).max().unwrap_or(0),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
