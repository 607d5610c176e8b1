//! L1 Cache - In-Process Memory Tier
//!
//! Bounded, sharded, LRU + TTL cache for hot payloads.
//!
//! # Design
//!
//! - ShardedMap with per-shard RwLocks: reads never block reads
//! - Capacity is reserved atomically before an entry becomes visible, so the
//!   resident size never exceeds the configured capacity
//! - Eviction prefers expired entries, then lowest recency
//! - Expiry is lazy on `get`; `purge_expired` is available for periodic sweeps

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::entry::{CacheEntry, CacheKey};
use super::shard::ShardedMap;
use super::{DEFAULT_L1_CAPACITY, DEFAULT_L1_SHARDS};
use crate::error::{Error, Result};

/// Eviction passes attempted before giving up on a reservation that keeps
/// losing races with concurrent writers.
const MAX_RESERVE_ATTEMPTS: usize = 16;

/// L1 Cache configuration
#[derive(Debug, Clone)]
pub struct L1Config {
    /// Maximum resident size in bytes
    pub capacity: u64,
    /// TTL applied when `put` is called without one (None = no expiry)
    pub default_ttl: Option<Duration>,
    /// Number of shards (rounded up to a power of two)
    pub shard_count: usize,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_L1_CAPACITY,
            default_ttl: Some(Duration::from_secs(3600)),
            shard_count: DEFAULT_L1_SHARDS,
        }
    }
}

/// L1 Cache - memory tier
pub struct L1Cache {
    /// Sharded storage
    storage: ShardedMap<CacheKey, Arc<CacheEntry>>,
    config: L1Config,
    /// Bytes reserved by resident and in-flight inserts
    current_size: AtomicU64,
    /// Serializes eviction scans
    eviction_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl L1Cache {
    /// Create a new L1 cache with default configuration
    pub fn new() -> Self {
        Self::with_config(L1Config::default())
    }

    /// Create a new L1 cache with custom configuration
    pub fn with_config(config: L1Config) -> Self {
        Self {
            storage: ShardedMap::new(config.shard_count),
            config,
            current_size: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Get a payload, or None on miss or expiry
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.get_entry(key).map(|entry| entry.data().clone())
    }

    /// Get the entry itself (metadata included)
    pub fn get_entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let Some(entry) = self.storage.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired() {
            if self.storage.remove_if(key, |v| Arc::ptr_eq(v, &entry)).is_some() {
                self.release(entry.size());
                self.expirations.fetch_add(1, Ordering::Relaxed);
                trace!(%key, "L1 lazy expiry");
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        entry.record_access();
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Insert a payload. `ttl` of None applies the configured default.
    pub fn put(&self, key: CacheKey, data: Bytes, ttl: Option<Duration>) -> Result<()> {
        let entry = CacheEntry::with_ttl(data, ttl.or(self.config.default_ttl));
        self.insert(key, entry, || true).map(|_| ())
    }

    /// Insert a prepared entry as-is (its TTL is kept).
    pub fn put_entry(&self, key: CacheKey, entry: CacheEntry) -> Result<()> {
        self.insert(key, entry, || true).map(|_| ())
    }

    /// Insert only if `guard` still holds once the shard write lock is taken.
    ///
    /// Returns `Ok(false)` when the guard rejected the write.
    pub fn put_guarded<G>(&self, key: CacheKey, entry: CacheEntry, guard: G) -> Result<bool>
    where
        G: FnOnce() -> bool,
    {
        self.insert(key, entry, guard)
    }

    fn insert<G>(&self, key: CacheKey, entry: CacheEntry, guard: G) -> Result<bool>
    where
        G: FnOnce() -> bool,
    {
        let size = entry.size();
        if size > self.config.capacity {
            return Err(Error::CapacityExceeded {
                tier: "L1",
                size,
                capacity: self.config.capacity,
            });
        }

        self.reserve(size)?;

        match self.storage.insert_if(key, Arc::new(entry), guard) {
            Ok(Some(old)) => {
                self.release(old.size());
                Ok(true)
            }
            Ok(None) => Ok(true),
            Err(_) => {
                self.release(size);
                Ok(false)
            }
        }
    }

    /// Reserve `size` bytes, evicting as needed
    fn reserve(&self, size: u64) -> Result<()> {
        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let reserved = self
                .current_size
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    (current + size <= self.config.capacity).then_some(current + size)
                })
                .is_ok();
            if reserved {
                return Ok(());
            }
            if self.evict_to_fit(size) == 0 {
                // Space is held by inserts that have not landed yet. Callers
                // may be on an async worker, so never give up the thread.
                std::hint::spin_loop();
            }
        }

        debug!(size, "L1 reservation lost to concurrent writers");
        Err(Error::CapacityExceeded {
            tier: "L1",
            size,
            capacity: self.config.capacity,
        })
    }

    #[inline]
    fn release(&self, size: u64) {
        self.current_size.fetch_sub(size, Ordering::AcqRel);
    }

    /// Evict until `incoming` more bytes fit; returns the number evicted
    fn evict_to_fit(&self, incoming: u64) -> usize {
        let _pass = self.eviction_lock.lock();
        if self.size() + incoming <= self.config.capacity {
            return 0;
        }

        let now = Instant::now();
        let mut candidates: Vec<(CacheKey, Arc<CacheEntry>, bool)> = self
            .storage
            .shards()
            .flat_map(|shard| shard.entries())
            .map(|(key, entry)| {
                let expired = entry.metadata.is_expired_at(now);
                (key, entry, expired)
            })
            .collect();

        // Expired first, then least recently used
        candidates.sort_by_key(|(_, entry, expired)| (!*expired, entry.metadata.last_access()));

        let mut evicted = 0;
        for (key, entry, _) in candidates {
            if self.size() + incoming <= self.config.capacity {
                break;
            }
            if self.storage.remove_if(&key, |v| Arc::ptr_eq(v, &entry)).is_some() {
                self.release(entry.size());
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
                trace!(%key, size = entry.size(), "L1 evicted");
            }
        }
        evicted
    }

    /// Remove a key; returns true if it was present
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        match self.storage.remove(key) {
            Some(entry) => {
                self.release(entry.size());
                true
            }
            None => false,
        }
    }

    /// Remove every key matching `pred`; returns the count removed
    pub fn invalidate_matching<P>(&self, pred: P) -> usize
    where
        P: Fn(&CacheKey) -> bool,
    {
        let removed = self.storage.drain_matching(|key, _| pred(key));
        for (_, entry) in &removed {
            self.release(entry.size());
        }
        removed.len()
    }

    /// Drop every expired entry; returns the count removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let removed = self
            .storage
            .drain_matching(|_, entry| entry.metadata.is_expired_at(now));
        for (_, entry) in &removed {
            self.release(entry.size());
        }
        self.expirations
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed.len()
    }

    /// Check if cache holds a live entry for key (does not count as access)
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.storage.get(key).is_some_and(|e| !e.is_expired())
    }

    /// Get current size in bytes
    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.config.default_ttl
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Capacity-driven evictions
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Entries dropped because their TTL passed
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Clear the cache
    pub fn clear(&self) {
        let removed = self.storage.drain_matching(|_, _| true);
        for (_, entry) in &removed {
            self.release(entry.size());
        }
    }

    pub fn utilization(&self) -> f64 {
        self.size() as f64 / self.capacity() as f64
    }
}

impl Default for L1Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// L1 cache statistics
#[derive(Debug, Clone)]
pub struct L1Stats {
    pub size: u64,
    pub capacity: u64,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub utilization: f64,
    /// Entries in the fullest shard; a skewed key hash shows up here
    pub max_shard_entries: usize,
}

impl L1Cache {
    /// Get cache statistics
    pub fn stats(&self) -> L1Stats {
        L1Stats {
            size: self.size(),
            capacity: self.capacity(),
            entries: self.len(),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            evictions: self.evictions(),
            expirations: self.expirations(),
            utilization: self.utilization(),
            max_shard_entries: self.storage.stats().max_shard_entries,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_key(id: &str) -> CacheKey {
        CacheKey::new("lesson", id).unwrap()
    }

    fn small_cache(capacity: u64) -> L1Cache {
        L1Cache::with_config(L1Config {
            capacity,
            default_ttl: None,
            shard_count: 8,
        })
    }

    #[test]
    fn test_l1_cache_creation() {
        let cache = L1Cache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.capacity(), DEFAULT_L1_CAPACITY);
    }

    #[test]
    fn test_l1_cache_put_get() {
        let cache = L1Cache::new();
        let key = make_key("1");

        cache.put(key.clone(), Bytes::from_static(b"Hello, World!"), None).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 13);
        assert_eq!(cache.get(&key).unwrap().as_ref(), b"Hello, World!");
    }

    #[test]
    fn test_l1_cache_miss() {
        let cache = L1Cache::new();
        assert!(cache.get(&make_key("missing")).is_none());
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn test_l1_cache_replace_adjusts_size() {
        let cache = L1Cache::new();
        let key = make_key("1");

        cache.put(key.clone(), Bytes::from_static(b"original"), None).unwrap();
        assert_eq!(cache.size(), 8);

        cache.put(key.clone(), Bytes::from_static(b"replaced content"), None).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 16);
        assert_eq!(cache.get(&key).unwrap().as_ref(), b"replaced content");
    }

    #[test]
    fn test_l1_lru_scenario() {
        // Capacity of three 100-byte entries
        let cache = small_cache(300);
        for id in ["1", "2", "3"] {
            cache.put(make_key(id), Bytes::from(vec![0u8; 100]), None).unwrap();
        }

        assert!(cache.get(&make_key("1")).is_some());
        cache.put(make_key("4"), Bytes::from(vec![0u8; 100]), None).unwrap();

        assert!(!cache.contains(&make_key("2")));
        for id in ["1", "3", "4"] {
            assert!(cache.contains(&make_key(id)), "key {} should remain", id);
        }
        assert_eq!(cache.evictions(), 1);
        assert_eq!(cache.size(), 300);
    }

    #[test]
    fn test_l1_expired_entries_evicted_first() {
        let cache = small_cache(300);
        cache.put(make_key("old"), Bytes::from(vec![0u8; 100]), None).unwrap();
        cache
            .put(make_key("short"), Bytes::from(vec![0u8; 100]), Some(Duration::from_millis(5)))
            .unwrap();
        cache.put(make_key("new"), Bytes::from(vec![0u8; 100]), None).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        cache.put(make_key("next"), Bytes::from(vec![0u8; 100]), None).unwrap();

        // "old" is least recent but "short" had expired
        assert!(cache.contains(&make_key("old")));
        assert!(!cache.contains(&make_key("short")));
    }

    #[test]
    fn test_l1_ttl_expiry_is_lazy() {
        let cache = small_cache(1000);
        let key = make_key("ttl");
        cache
            .put(key.clone(), Bytes::from_static(b"soon gone"), Some(Duration::from_millis(30)))
            .unwrap();

        assert!(cache.get(&key).is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.expirations(), 1);
    }

    #[test]
    fn test_l1_default_ttl_applies() {
        let cache = L1Cache::with_config(L1Config {
            capacity: 1000,
            default_ttl: Some(Duration::from_millis(10)),
            shard_count: 4,
        });
        cache.put(make_key("a"), Bytes::from_static(b"x"), None).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_l1_unrepresentable_ttl_never_expires() {
        let cache = L1Cache::new();
        let key = make_key("forever");
        cache.put(key.clone(), Bytes::from_static(b"x"), Some(Duration::MAX)).unwrap();

        assert_eq!(cache.get(&key).unwrap().as_ref(), b"x");
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_l1_rejects_oversized_entry() {
        let cache = small_cache(10);
        let result = cache.put(make_key("big"), Bytes::from(vec![0u8; 11]), None);
        assert_matches!(result, Err(Error::CapacityExceeded { tier: "L1", size: 11, .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_l1_invalidate_and_matching() {
        let cache = L1Cache::new();
        for i in 0..10 {
            cache.put(CacheKey::new("lesson", i.to_string()).unwrap(), Bytes::from_static(b"l"), None).unwrap();
            cache.put(CacheKey::new("concept", i.to_string()).unwrap(), Bytes::from_static(b"c"), None).unwrap();
        }

        assert!(cache.invalidate(&CacheKey::new("lesson", "0").unwrap()));
        assert!(!cache.invalidate(&CacheKey::new("lesson", "0").unwrap()));

        let removed = cache.invalidate_matching(|k| k.namespace() == "concept");
        assert_eq!(removed, 10);
        assert_eq!(cache.len(), 9);
        assert_eq!(cache.size(), 9);
    }

    #[test]
    fn test_l1_put_guarded() {
        let cache = L1Cache::new();
        let key = make_key("g");

        let written = cache
            .put_guarded(key.clone(), CacheEntry::new(Bytes::from_static(b"v")), || false)
            .unwrap();
        assert!(!written);
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);

        let written = cache
            .put_guarded(key.clone(), CacheEntry::new(Bytes::from_static(b"v")), || true)
            .unwrap();
        assert!(written);
        assert!(cache.contains(&key));
    }

    #[test]
    fn test_l1_stats() {
        let cache = L1Cache::new();
        let key = make_key("s");
        cache.put(key.clone(), Bytes::from_static(b"test data"), None).unwrap();
        cache.get(&key);
        cache.get(&make_key("nonexistent"));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.size, 9);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_ratio, 0.5);
    }

    #[test]
    fn test_l1_concurrent_access_respects_capacity() {
        use std::thread;

        let cache = Arc::new(small_cache(64 * 100));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..500 {
                        let key = make_key(&format!("{}-{}", t, i));
                        let _ = cache.put(key.clone(), Bytes::from(vec![i as u8; 64]), None);
                        assert!(cache.size() <= cache.capacity());
                        cache.get(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.size() <= cache.capacity());
        assert_eq!(cache.size(), cache.len() as u64 * 64);
        assert!(cache.evictions() > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_l1_contended_puts_from_async_tasks() {
        let cache = Arc::new(small_cache(64 * 8));

        let tasks: Vec<_> = (0..16)
            .map(|t| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    for i in 0..200 {
                        let _ = cache.put(make_key(&format!("{t}-{i}")), Bytes::from(vec![0u8; 64]), None);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert!(cache.size() <= cache.capacity());
        assert_eq!(cache.size(), cache.len() as u64 * 64);
    }
}
