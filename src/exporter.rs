//! Prometheus Exporter
//!
//! Publishes a [`MetricsSnapshot`] as gauges on a private registry. Gauges are
//! refreshed from a fresh snapshot on every scrape, so counters stay owned by
//! the cache and the registry only mirrors them.

use prometheus::{Encoder, Gauge, Registry, TextEncoder};

use crate::cache::{CacheManager, MetricsSnapshot};
use crate::error::{Error, Result};

type Reading = fn(&MetricsSnapshot) -> f64;

/// Exported series: name, help, reading
const SERIES: &[(&str, &str, Reading)] = &[
    ("strata_hits_l1_total", "Requests served from the memory tier", |s: &MetricsSnapshot| s.hits_l1 as f64),
    ("strata_hits_l2_total", "Requests served from the disk tier", |s: &MetricsSnapshot| s.hits_l2 as f64),
    ("strata_hits_index_total", "Requests served from loaded index fragments", |s: &MetricsSnapshot| s.hits_index as f64),
    ("strata_misses_total", "Requests no tier could answer", |s: &MetricsSnapshot| s.misses as f64),
    ("strata_loader_invocations_total", "Loader functions invoked", |s: &MetricsSnapshot| s.loader_invocations as f64),
    ("strata_load_failures_total", "Loader functions that failed", |s: &MetricsSnapshot| s.load_failures as f64),
    ("strata_load_timeouts_total", "Callers that stopped waiting for a load", |s: &MetricsSnapshot| s.load_timeouts as f64),
    ("strata_coalesced_waits_total", "Callers that joined an in-flight load", |s: &MetricsSnapshot| s.coalesced_waits as f64),
    ("strata_evictions_l1_total", "Capacity evictions from the memory tier", |s: &MetricsSnapshot| s.evictions_l1 as f64),
    ("strata_evictions_l2_total", "Capacity evictions from the disk tier", |s: &MetricsSnapshot| s.evictions_l2 as f64),
    ("strata_expirations_l1_total", "Expired memory entries reclaimed", |s: &MetricsSnapshot| s.expirations_l1 as f64),
    ("strata_corruptions_l2_total", "Disk entries dropped for failing verification", |s: &MetricsSnapshot| s.corruptions_l2 as f64),
    ("strata_capacity_rejections_total", "Values too large for a tier", |s: &MetricsSnapshot| s.capacity_rejections as f64),
    ("strata_fenced_writes_total", "Late writes dropped after invalidation", |s: &MetricsSnapshot| s.fenced_writes as f64),
    ("strata_invalidations_total", "Invalidation calls", |s: &MetricsSnapshot| s.invalidations as f64),
    ("strata_preloads_issued_total", "Predicted keys warmed", |s: &MetricsSnapshot| s.preloads_issued as f64),
    ("strata_preloads_failed_total", "Predicted keys that failed to warm", |s: &MetricsSnapshot| s.preloads_failed as f64),
    ("strata_l1_size_bytes", "Resident bytes in the memory tier", |s: &MetricsSnapshot| s.l1_size_bytes as f64),
    ("strata_l1_entries", "Entries in the memory tier", |s: &MetricsSnapshot| s.l1_entries as f64),
    ("strata_l2_size_bytes", "Stored bytes in the disk tier", |s: &MetricsSnapshot| s.l2_size_bytes as f64),
    ("strata_l2_entries", "Entries in the disk tier", |s: &MetricsSnapshot| s.l2_entries as f64),
    ("strata_fragments_loaded", "Index fragments currently loaded", |s: &MetricsSnapshot| s.fragments_loaded as f64),
    ("strata_fragment_failures_total", "Index fragment loads that failed", |s: &MetricsSnapshot| s.fragment_failures as f64),
    ("strata_hit_ratio", "Share of requests served without a loader", |s: &MetricsSnapshot| s.hit_ratio),
    ("strata_load_latency_seconds", "Moving average loader latency", |s: &MetricsSnapshot| s.load_latency.as_secs_f64()),
    ("strata_l2_read_latency_seconds", "Moving average disk read latency", |s: &MetricsSnapshot| s.l2_read_latency.as_secs_f64()),
    ("strata_l2_write_latency_seconds", "Moving average disk write latency", |s: &MetricsSnapshot| s.l2_write_latency.as_secs_f64()),
];

/// Prometheus view of one cache manager
pub struct MetricsExporter {
    cache: CacheManager,
    registry: Registry,
    gauges: Vec<(Gauge, Reading)>,
}

impl MetricsExporter {
    pub fn new(cache: CacheManager) -> Result<Self> {
        let registry = Registry::new();
        let mut gauges = Vec::with_capacity(SERIES.len());
        for (name, help, reading) in SERIES {
            let gauge = Gauge::new(*name, *help).map_err(prometheus_error)?;
            registry.register(Box::new(gauge.clone())).map_err(prometheus_error)?;
            gauges.push((gauge, *reading));
        }
        Ok(Self {
            cache,
            registry,
            gauges,
        })
    }

    /// Copy the current snapshot into the gauges
    pub fn refresh(&self) -> MetricsSnapshot {
        let snapshot = self.cache.metrics_snapshot();
        for (gauge, reading) in &self.gauges {
            gauge.set(reading(&snapshot));
        }
        snapshot
    }

    /// Refresh, then render in the Prometheus text format
    pub fn render(&self) -> Result<(String, Vec<u8>)> {
        self.refresh();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prometheus_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn prometheus_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {e}"))
}
