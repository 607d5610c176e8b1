//! Cache Metrics Collection
//!
//! Request-level counters and latency averages for the cache façade. Tier
//! gauges (sizes, evictions, corruption) are owned by the tiers and merged in
//! when a snapshot is taken.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Request resolution; each logical request lands in exactly one of these
    hits_l1: AtomicU64,
    hits_l2: AtomicU64,
    hits_index: AtomicU64,
    misses: AtomicU64,

    // Loader
    loader_invocations: AtomicU64,
    load_failures: AtomicU64,
    load_timeouts: AtomicU64,
    coalesced_waits: AtomicU64,

    // Tier writes
    promotions_l2_to_l1: AtomicU64,
    capacity_rejections: AtomicU64,
    fenced_writes: AtomicU64,
    invalidations: AtomicU64,

    // Preloading
    preloads_issued: AtomicU64,
    preloads_succeeded: AtomicU64,
    preloads_failed: AtomicU64,

    // Latencies (microseconds, exponential moving average)
    load_latency_us: AtomicU64,
    l2_read_latency_us: AtomicU64,
    l2_write_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_l1_hit(&self) {
        self.hits_l1.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_hit(&self) {
        self.hits_l2.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_hit(&self) {
        self.hits_index.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_loader_invocation(&self) {
        self.loader_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_timeout(&self) {
        self.load_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced_wait(&self) {
        self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion_l2_to_l1(&self) {
        self.promotions_l2_to_l1.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capacity_rejection(&self) {
        self.capacity_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// A late write dropped because the key was invalidated meanwhile
    pub fn record_fenced_write(&self) {
        self.fenced_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preload_issued(&self) {
        self.preloads_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preload_result(&self, succeeded: bool) {
        if succeeded {
            self.preloads_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.preloads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn hits_l1(&self) -> u64 {
        self.hits_l1.load(Ordering::Relaxed)
    }

    pub fn hits_l2(&self) -> u64 {
        self.hits_l2.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn loader_invocations(&self) -> u64 {
        self.loader_invocations.load(Ordering::Relaxed)
    }

    // Latency tracking
    pub fn record_load_latency(&self, duration: Duration) {
        Self::update_latency_ema(&self.load_latency_us, duration);
    }

    pub fn record_l2_read_latency(&self, duration: Duration) {
        Self::update_latency_ema(&self.l2_read_latency_us, duration);
    }

    pub fn record_l2_write_latency(&self, duration: Duration) {
        Self::update_latency_ema(&self.l2_write_latency_us, duration);
    }

    fn update_latency_ema(target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(if current == 0 {
                new_us.max(1)
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            })
        });
    }

    pub fn load_latency(&self) -> Duration {
        Duration::from_micros(self.load_latency_us.load(Ordering::Relaxed))
    }

    /// Fraction of requests served without invoking a loader
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits_l1() + self.hits_l2() + self.hits_index.load(Ordering::Relaxed);
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Merge the counters with tier gauges into one snapshot
    pub fn snapshot(&self, tiers: TierGauges) -> MetricsSnapshot {
        MetricsSnapshot {
            hits_l1: self.hits_l1(),
            hits_l2: self.hits_l2(),
            misses: self.misses(),
            loader_invocations: self.loader_invocations(),
            evictions_l1: tiers.evictions_l1,
            evictions_l2: tiers.evictions_l2,

            hits_index: self.hits_index.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            load_timeouts: self.load_timeouts.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            promotions_l2_to_l1: self.promotions_l2_to_l1.load(Ordering::Relaxed),
            capacity_rejections: self.capacity_rejections.load(Ordering::Relaxed),
            fenced_writes: self.fenced_writes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            preloads_issued: self.preloads_issued.load(Ordering::Relaxed),
            preloads_succeeded: self.preloads_succeeded.load(Ordering::Relaxed),
            preloads_failed: self.preloads_failed.load(Ordering::Relaxed),

            expirations_l1: tiers.expirations_l1,
            corruptions_l2: tiers.corruptions_l2,
            l1_size_bytes: tiers.l1_size_bytes,
            l1_entries: tiers.l1_entries,
            l2_size_bytes: tiers.l2_size_bytes,
            l2_entries: tiers.l2_entries,
            fragments_loaded: tiers.fragments_loaded,
            fragment_failures: tiers.fragment_failures,

            load_latency: self.load_latency(),
            l2_read_latency: Duration::from_micros(self.l2_read_latency_us.load(Ordering::Relaxed)),
            l2_write_latency: Duration::from_micros(self.l2_write_latency_us.load(Ordering::Relaxed)),
        }
    }
}

/// Gauges read from the tiers at snapshot time
#[derive(Debug, Clone, Copy, Default)]
pub struct TierGauges {
    pub evictions_l1: u64,
    pub evictions_l2: u64,
    pub expirations_l1: u64,
    pub corruptions_l2: u64,
    pub l1_size_bytes: u64,
    pub l1_entries: u64,
    pub l2_size_bytes: u64,
    pub l2_entries: u64,
    pub fragments_loaded: u64,
    pub fragment_failures: u64,
}

/// Point-in-time view of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub hits_l1: u64,
    pub hits_l2: u64,
    pub misses: u64,
    pub loader_invocations: u64,
    pub evictions_l1: u64,
    pub evictions_l2: u64,

    pub hits_index: u64,
    pub hit_ratio: f64,
    pub load_failures: u64,
    pub load_timeouts: u64,
    pub coalesced_waits: u64,
    pub promotions_l2_to_l1: u64,
    pub capacity_rejections: u64,
    pub fenced_writes: u64,
    pub invalidations: u64,
    pub preloads_issued: u64,
    pub preloads_succeeded: u64,
    pub preloads_failed: u64,

    pub expirations_l1: u64,
    pub corruptions_l2: u64,
    pub l1_size_bytes: u64,
    pub l1_entries: u64,
    pub l2_size_bytes: u64,
    pub l2_entries: u64,
    pub fragments_loaded: u64,
    pub fragment_failures: u64,

    pub load_latency: Duration,
    pub l2_read_latency: Duration,
    pub l2_write_latency: Duration,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_l1_hit();
        metrics.record_l1_hit();
        metrics.record_l2_hit();
        metrics.record_miss();

        assert_eq!(metrics.hits_l1(), 2);
        assert_eq!(metrics.hits_l2(), 1);
        assert!((metrics.hit_ratio() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_latency_ema() {
        let metrics = CacheMetrics::new();

        metrics.record_load_latency(Duration::from_micros(100));
        assert_eq!(metrics.load_latency(), Duration::from_micros(100));

        metrics.record_load_latency(Duration::from_micros(200));
        let latency = metrics.load_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_snapshot_merges_tier_gauges() {
        let metrics = CacheMetrics::new();
        metrics.record_loader_invocation();
        metrics.record_miss();
        metrics.record_preload_issued();
        metrics.record_preload_result(false);

        let snapshot = metrics.snapshot(TierGauges {
            evictions_l1: 3,
            evictions_l2: 1,
            l1_entries: 10,
            ..Default::default()
        });
        assert_eq!(snapshot.loader_invocations, 1);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.evictions_l1, 3);
        assert_eq!(snapshot.evictions_l2, 1);
        assert_eq!(snapshot.l1_entries, 10);
        assert_eq!(snapshot.preloads_failed, 1);
        assert_eq!(snapshot.preloads_succeeded, 0);
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(tracker.elapsed() >= Duration::from_millis(10));
    }
}
