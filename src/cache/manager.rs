//! Cache Manager - Unified Tiered Cache
//!
//! Routes every request through L1, then L2 (promoting hits into L1), then
//! the index tier for `index:` keys, and finally a caller-supplied loader.
//! Loader calls are single-flight per key and run on their own task, so a
//! caller that times out or goes away does not cancel the load.
//!
//! Invalidation bumps the key's fence before clearing the tiers; every late
//! write (finished loads, promotions, preloads) re-checks its fence under the
//! target tier's lock and is dropped if an invalidation got in between.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::entry::{CacheEntry, CacheKey};
use super::fence::{FenceToken, InvalidationFence};
use super::flight::{FlightMap, LoadOutcome};
use super::l1::{L1Cache, L1Config};
use super::l2::{L2Cache, L2Config, L2Hit};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot, TierGauges};
use super::DEFAULT_FENCE_STRIPES;
use crate::error::{Error, Result};
use crate::index::{
    DependencyGraph, FragmentId, FragmentSource, FragmentState, FragmentUsage, IndexTier, LazyLoader,
    StructuredQuery, DEFAULT_LOADER_WORKERS,
};
use crate::preload::{PredictivePreloader, PreloadConfig, PreloadTarget};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// L1 configuration
    pub l1: L1Config,
    /// L2 configuration
    pub l2: L2Config,
    /// Predictive preloading
    pub preload: PreloadConfig,
    /// Fragments loaded concurrently by the lazy loader
    pub loader_workers: usize,
    /// Stripes in the invalidation fence
    pub fence_stripes: usize,
    /// Applied by `get_or_load` when set
    pub load_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: L1Config::default(),
            l2: L2Config::default(),
            preload: PreloadConfig::default(),
            loader_workers: DEFAULT_LOADER_WORKERS,
            fence_stripes: DEFAULT_FENCE_STRIPES,
            load_timeout: None,
        }
    }
}

struct ManagerInner {
    l1: L1Cache,
    l2: Arc<L2Cache>,
    index: Arc<IndexTier>,
    loader: LazyLoader,
    preloader: PredictivePreloader,
    flights: FlightMap,
    fence: Arc<InvalidationFence>,
    metrics: CacheMetrics,
    /// Keys derived from index fragments; dropped with those fragments
    bindings: DashMap<CacheKey, Vec<FragmentId>>,
    config: CacheConfig,
    cancel: CancellationToken,
}

/// Unified cache manager
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl CacheManager {
    /// Open the tiers and start the lazy loader. Requires a Tokio runtime.
    ///
    /// L2 recovery runs on the blocking pool.
    pub async fn open(config: CacheConfig, graph: DependencyGraph, source: Arc<dyn FragmentSource>) -> Result<Self> {
        let l2_config = config.l2.clone();
        let l2 = tokio::task::spawn_blocking(move || L2Cache::open(l2_config))
            .await
            .map_err(|e| Error::Internal(format!("L2 open task failed: {e}")))??;

        let index = IndexTier::new(Arc::new(graph), source);
        let loader = LazyLoader::new(Arc::clone(&index), config.loader_workers);

        let inner = Arc::new(ManagerInner {
            l1: L1Cache::with_config(config.l1.clone()),
            l2: Arc::new(l2),
            index,
            loader,
            preloader: PredictivePreloader::new(config.preload.clone()),
            flights: FlightMap::new(),
            fence: Arc::new(InvalidationFence::new(config.fence_stripes)),
            metrics: CacheMetrics::new(),
            bindings: DashMap::new(),
            config,
            cancel: CancellationToken::new(),
        });

        let target: Arc<dyn PreloadTarget> = inner.clone();
        inner.preloader.bind(Arc::downgrade(&target));

        info!(
            l1_capacity = inner.l1.capacity(),
            l2_capacity = inner.l2.capacity(),
            l2_entries = inner.l2.len(),
            fragments = inner.index.graph().len(),
            "Cache manager ready"
        );
        Ok(Self { inner })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Resolve `key`, calling `loader` at most once across concurrent callers
    /// when no tier has it.
    ///
    /// Loader errors reach every waiter as [`Error::LoadFailed`] and are never
    /// cached. The configured load timeout, if any, applies.
    pub async fn get_or_load<F, Fut>(&self, key: &CacheKey, loader: F) -> Result<Bytes>
    where
        F: FnOnce(CacheKey) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        match self.inner.config.load_timeout {
            Some(after) => self.get_or_load_with_timeout(key, after, loader).await,
            None => self.resolve_observed(key, loader).await,
        }
    }

    /// Like [`get_or_load`](Self::get_or_load) with an explicit timeout.
    ///
    /// On timeout the caller gets [`Error::Timeout`]; the load keeps running
    /// and still populates the tiers for everyone else.
    pub async fn get_or_load_with_timeout<F, Fut>(&self, key: &CacheKey, after: Duration, loader: F) -> Result<Bytes>
    where
        F: FnOnce(CacheKey) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        match tokio::time::timeout(after, self.resolve_observed(key, loader)).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.metrics.record_load_timeout();
                warn!(%key, ?after, "Gave up waiting for load");
                Err(Error::Timeout {
                    key: key.to_string(),
                    after,
                })
            }
        }
    }

    /// Typed variant of [`get_or_load`](Self::get_or_load); values are stored
    /// as JSON.
    pub async fn get_or_load_json<T, F, Fut>(&self, key: &CacheKey, loader: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(CacheKey) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let bytes = self
            .get_or_load(key, move |key| {
                let load = loader(key);
                async move {
                    let value = load.await?;
                    Ok(Bytes::from(serde_json::to_vec(&value)?))
                }
            })
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn resolve_observed<F, Fut>(&self, key: &CacheKey, loader: F) -> Result<Bytes>
    where
        F: FnOnce(CacheKey) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let value = self.inner.resolve(key, loader).await?;
        self.inner.preloader.observe(key);
        Ok(value)
    }

    /// Look through the tiers without loading
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let token = self.inner.fence.token(key);
        let found = self.inner.lookup_tiers(key, token).await;
        if found.is_none() {
            self.inner.metrics.record_miss();
        }
        found
    }

    /// Answer a structured query from Loaded fragments. Never waits.
    pub fn lookup(&self, query: &StructuredQuery) -> Option<Value> {
        self.inner.index.lookup(query)
    }

    /// Load fragments and their dependencies; returns the closure that ended
    /// Loaded, dependencies first.
    pub async fn ensure_loaded(&self, ids: &[&str]) -> Result<Vec<FragmentId>> {
        self.inner.loader.request(ids).await?.into_result()
    }

    /// Record a resolved key for prediction (process session)
    pub fn observe(&self, key: &CacheKey) {
        self.inner.preloader.observe(key);
    }

    pub fn observe_in(&self, session: &str, key: &CacheKey) {
        self.inner.preloader.observe_in(session, key);
    }

    // =========================================================================
    // Writes and invalidation
    // =========================================================================

    /// Store a value directly. Supersedes any load in flight for the key.
    ///
    /// Fails only if neither tier accepted the value.
    pub async fn put(&self, key: CacheKey, data: Bytes, ttl: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        inner.fence.bump(&key);
        inner.flights.detach(&key);
        let token = inner.fence.token(&key);

        let l2_result = inner.write_l2(&key, data.clone(), ttl, token).await;
        let entry = CacheEntry::with_ttl(data, ttl.or(inner.l1.default_ttl()));
        let l1_result = inner.l1.put_guarded(key.clone(), entry, || inner.fence.is_current(&token));

        match (l2_result, l1_result) {
            (Err(e), Err(_)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Remove `key` from every tier. Index keys and keys bound to fragments
    /// also unload those fragments (and their dependents).
    #[instrument(skip(self), fields(key = %key))]
    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        let inner = &self.inner;
        inner.fence.bump(key);
        inner.flights.detach(key);
        inner.l1.invalidate(key);
        let l2 = Arc::clone(&inner.l2);
        let owned = key.clone();
        tokio::task::spawn_blocking(move || l2.invalidate(&owned))
            .await
            .map_err(|e| Error::Internal(format!("L2 invalidate task failed: {e}")))?;
        inner.metrics.record_invalidation();

        let mut fragments = inner
            .bindings
            .get(key)
            .map(|bound| bound.clone())
            .unwrap_or_default();
        if let Some(query) = StructuredQuery::from_key(key) {
            if inner.index.graph().contains(query.target()) {
                fragments.push(query.target().to_string());
            }
        }
        for fragment in fragments {
            inner.invalidate_fragment(&fragment).await?;
        }
        debug!("Key invalidated");
        Ok(())
    }

    /// Remove every key matching `pred` from L1 and L2; returns the entries
    /// removed across both tiers
    pub async fn invalidate_matching<P>(&self, pred: P) -> Result<usize>
    where
        P: Fn(&CacheKey) -> bool + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let pred = Arc::new(pred);
        inner.fence.bump_all();
        inner.flights.detach_matching(|k| pred(k));
        let from_l1 = inner.l1.invalidate_matching(|k| pred(k));

        let l2 = Arc::clone(&inner.l2);
        let from_l2 = tokio::task::spawn_blocking(move || l2.invalidate_matching(|k| pred(k)))
            .await
            .map_err(|e| Error::Internal(format!("L2 invalidate task failed: {e}")))?;
        inner.metrics.record_invalidation();
        info!(from_l1, from_l2, "Invalidated matching keys");
        Ok(from_l1 + from_l2)
    }

    /// Unload a fragment and its dependents, dropping every cached key
    /// derived from them. Returns the affected fragments.
    pub async fn invalidate_fragment(&self, id: &str) -> Result<Vec<FragmentId>> {
        self.inner.invalidate_fragment(id).await
    }

    /// Declare that `key` is derived from `fragments`: invalidating either
    /// side drops the other, and preloading the key warms the fragments.
    pub fn bind_fragments(&self, key: CacheKey, fragments: &[&str]) -> Result<()> {
        let graph = self.inner.index.graph();
        if let Some(unknown) = fragments.iter().find(|f| !graph.contains(f)) {
            return Err(Error::UnknownFragment(unknown.to_string()));
        }
        self.inner
            .bindings
            .insert(key, fragments.iter().map(|f| f.to_string()).collect());
        Ok(())
    }

    // =========================================================================
    // Metrics and lifecycle
    // =========================================================================

    /// Point-in-time counters; each request appears in exactly one of the
    /// hit/miss counters
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let index = inner.index.stats();
        inner.metrics.snapshot(TierGauges {
            evictions_l1: inner.l1.evictions(),
            evictions_l2: inner.l2.evictions(),
            expirations_l1: inner.l1.expirations(),
            corruptions_l2: inner.l2.corruptions(),
            l1_size_bytes: inner.l1.size(),
            l1_entries: inner.l1.len() as u64,
            l2_size_bytes: inner.l2.size(),
            l2_entries: inner.l2.len() as u64,
            fragments_loaded: index.loaded as u64,
            fragment_failures: index.load_failures,
        })
    }

    /// Periodic expiry sweeps, L2 access-stat flush and idle fragment
    /// release. Stops on [`shutdown`](Self::shutdown).
    pub fn spawn_maintenance(&self, every: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let cancel = inner.cancel.child_token();
        tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Maintenance stopped");
                        break;
                    }
                    _ = tick.tick() => {
                        if let Err(e) = inner.maintain(every).await {
                            error!(error = %e, "Maintenance pass failed");
                        }
                    }
                }
            }
        })
    }

    /// Stop background work and persist L2 access statistics
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.loader.shutdown();
        let l2 = Arc::clone(&inner.l2);
        tokio::task::spawn_blocking(move || l2.flush())
            .await
            .map_err(|e| Error::Internal(format!("L2 flush task failed: {e}")))??;
        info!("Cache manager shut down");
        Ok(())
    }

    pub fn l1(&self) -> &L1Cache {
        &self.inner.l1
    }

    pub fn l2(&self) -> &L2Cache {
        &self.inner.l2
    }

    pub fn index(&self) -> &Arc<IndexTier> {
        &self.inner.index
    }

    /// The `limit` most read index fragments, most read first
    pub fn popular_fragments(&self, limit: usize) -> Vec<FragmentUsage> {
        self.inner.index.popular_fragments(limit)
    }

    pub fn loader(&self) -> &LazyLoader {
        &self.inner.loader
    }

    pub fn preloader(&self) -> &PredictivePreloader {
        &self.inner.preloader
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Keys with a load in flight
    pub fn in_flight(&self) -> usize {
        self.inner.flights.in_flight()
    }
}

/// Deregisters a flight when its load task ends, panics included
struct FlightGuard {
    inner: Arc<ManagerInner>,
    key: CacheKey,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner.flights.complete(&self.key, self.id);
    }
}

impl ManagerInner {
    #[instrument(level = "debug", skip_all, fields(key = %key))]
    async fn resolve<F, Fut>(self: &Arc<Self>, key: &CacheKey, loader: F) -> Result<Bytes>
    where
        F: FnOnce(CacheKey) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let token = self.fence.token(key);
        if let Some(data) = self.lookup_tiers(key, token).await {
            return Ok(data);
        }
        self.metrics.record_miss();

        let joined = self.flights.join_or_start(key, |id| {
            let inner = Arc::clone(self);
            // Taken with the flight slot locked, so an invalidation either
            // fences this load or detaches a flight started after it
            let token = inner.fence.token(key);
            let load = loader(key.clone());
            let task = tokio::spawn(inner.run_load(key.clone(), id, token, load));
            async move {
                match task.await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(Arc::new(anyhow::anyhow!("load task failed: {e}"))),
                }
            }
            .boxed()
        });
        if !joined.leader {
            self.metrics.record_coalesced_wait();
            debug!("Joined in-flight load");
        }

        joined.load.await.map_err(|cause| Error::LoadFailed {
            key: key.to_string(),
            cause,
        })
    }

    /// L1, then L2 with promotion, then the index tier. Records the hit.
    async fn lookup_tiers(&self, key: &CacheKey, token: FenceToken) -> Option<Bytes> {
        if let Some(data) = self.l1.get(key) {
            self.metrics.record_l1_hit();
            return Some(data);
        }

        if let Some(hit) = self.read_l2(key).await {
            self.metrics.record_l2_hit();
            let data = hit.data.clone();
            self.promote(key, hit, token);
            return Some(data);
        }

        if key.is_index() {
            if let Some(data) = self.lookup_index(key, token) {
                self.metrics.record_index_hit();
                return Some(data);
            }
        }
        None
    }

    async fn read_l2(&self, key: &CacheKey) -> Option<L2Hit> {
        let l2 = Arc::clone(&self.l2);
        let owned = key.clone();
        let tracker = LatencyTracker::start();
        let hit = match tokio::task::spawn_blocking(move || l2.get(&owned)).await {
            Ok(hit) => hit,
            Err(e) => {
                error!(%key, error = %e, "L2 read task failed");
                None
            }
        };
        self.metrics.record_l2_read_latency(tracker.elapsed());
        hit
    }

    /// Copy an L2 hit into L1, keeping the tighter of the two TTLs
    fn promote(&self, key: &CacheKey, hit: L2Hit, token: FenceToken) -> bool {
        let ttl = match (hit.remaining_ttl(), self.l1.default_ttl()) {
            (Some(left), Some(default)) => Some(left.min(default)),
            (left, default) => left.or(default),
        };
        let entry = CacheEntry::with_checksum(hit.data, hit.checksum, ttl);
        match self.l1.put_guarded(key.clone(), entry, || self.fence.is_current(&token)) {
            Ok(true) => {
                self.metrics.record_promotion_l2_to_l1();
                true
            }
            Ok(false) => {
                self.metrics.record_fenced_write();
                false
            }
            Err(e) => {
                self.metrics.record_capacity_rejection();
                debug!(%key, error = %e, "L2 hit not promoted");
                false
            }
        }
    }

    /// Serve an index key from Loaded fragments, caching the answer in L1.
    /// A fragment that is not loaded yet is requested in the background.
    fn lookup_index(&self, key: &CacheKey, token: FenceToken) -> Option<Bytes> {
        let query = StructuredQuery::from_key(key)?;
        let Some(value) = self.index.lookup(&query) else {
            self.request_in_background(query.target());
            return None;
        };
        let data = match serde_json::to_vec(&value) {
            Ok(raw) => Bytes::from(raw),
            Err(e) => {
                warn!(%key, error = %e, "Index value not serializable");
                return None;
            }
        };
        let entry = CacheEntry::with_ttl(data.clone(), self.l1.default_ttl());
        if let Ok(false) = self.l1.put_guarded(key.clone(), entry, || self.fence.is_current(&token)) {
            self.metrics.record_fenced_write();
        }
        Some(data)
    }

    fn request_in_background(&self, fragment: &str) {
        match self.index.state(fragment) {
            None | Some(FragmentState::Loaded) | Some(FragmentState::Loading) => return,
            Some(FragmentState::Unloaded) | Some(FragmentState::Failed) => {}
        }
        let loader = self.loader.clone();
        let fragment = fragment.to_string();
        tokio::spawn(async move {
            match loader.request(&[fragment.as_str()]).await {
                Ok(result) if !result.is_success() => {
                    debug!(fragment, failed = ?result.failed, "Background fragment load failed");
                }
                Ok(_) => {}
                Err(e) => debug!(fragment, error = %e, "Background fragment request rejected"),
            }
        });
    }

    /// Body of a single-flight load task
    async fn run_load<Fut>(self: Arc<Self>, key: CacheKey, id: u64, token: FenceToken, load: Fut) -> LoadOutcome
    where
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let _flight = FlightGuard {
            inner: Arc::clone(&self),
            key: key.clone(),
            id,
        };
        self.metrics.record_loader_invocation();
        let tracker = LatencyTracker::start();
        let outcome = load.await.map_err(Arc::new);
        self.metrics.record_load_latency(tracker.elapsed());

        match &outcome {
            Ok(data) => self.store(&key, data.clone(), token).await,
            Err(cause) => {
                self.metrics.record_load_failure();
                warn!(%key, error = %cause, "Loader failed");
            }
        }
        outcome
    }

    /// Write a loaded value to L2, then L1, unless fenced out
    async fn store(&self, key: &CacheKey, data: Bytes, token: FenceToken) {
        if !self.fence.is_current(&token) {
            self.metrics.record_fenced_write();
            debug!(%key, "Load finished after invalidation; not cached");
            return;
        }

        match self.write_l2(key, data.clone(), None, token).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(Error::CapacityExceeded { size, capacity, .. }) => {
                warn!(%key, size, capacity, "Value larger than L2; not persisted");
            }
            Err(e) => warn!(%key, error = %e, "L2 write failed"),
        }

        let entry = CacheEntry::with_ttl(data, self.l1.default_ttl());
        match self.l1.put_guarded(key.clone(), entry, || self.fence.is_current(&token)) {
            Ok(true) => {}
            Ok(false) => self.metrics.record_fenced_write(),
            Err(e) => {
                self.metrics.record_capacity_rejection();
                warn!(%key, error = %e, "Value larger than L1; not cached");
            }
        }
    }

    /// Guarded L2 write on the blocking pool. `Ok(false)` means fenced.
    async fn write_l2(&self, key: &CacheKey, data: Bytes, ttl: Option<Duration>, token: FenceToken) -> Result<bool> {
        let l2 = Arc::clone(&self.l2);
        let fence = Arc::clone(&self.fence);
        let owned = key.clone();
        let tracker = LatencyTracker::start();
        let written = tokio::task::spawn_blocking(move || l2.put_guarded(owned, &data, ttl, || fence.is_current(&token)))
            .await
            .map_err(|e| Error::Internal(format!("L2 write task failed: {e}")))?;
        match &written {
            Ok(true) => self.metrics.record_l2_write_latency(tracker.elapsed()),
            Ok(false) => self.metrics.record_fenced_write(),
            Err(Error::CapacityExceeded { .. }) => self.metrics.record_capacity_rejection(),
            Err(_) => {}
        }
        written
    }

    async fn invalidate_fragment(&self, id: &str) -> Result<Vec<FragmentId>> {
        let affected = self.index.invalidate(id)?;
        self.fence.bump_all();

        let derived_keys: Vec<CacheKey> = self
            .bindings
            .iter()
            .filter(|bound| bound.value().iter().any(|f| affected.contains(f)))
            .map(|bound| bound.key().clone())
            .collect();
        let fragments: HashSet<FragmentId> = affected.iter().cloned().collect();
        let doomed = Arc::new(move |key: &CacheKey| {
            derived_keys.contains(key)
                || StructuredQuery::from_key(key).is_some_and(|q| fragments.contains(q.target()))
        });

        self.flights.detach_matching(|k| doomed(k));
        let from_l1 = self.l1.invalidate_matching(|k| doomed(k));
        let l2 = Arc::clone(&self.l2);
        let from_l2 = tokio::task::spawn_blocking(move || l2.invalidate_matching(|k| doomed(k)))
            .await
            .map_err(|e| Error::Internal(format!("L2 invalidate task failed: {e}")))?;

        info!(fragment = id, affected = affected.len(), from_l1, from_l2, "Fragment invalidated");
        Ok(affected)
    }

    async fn maintain(&self, idle: Duration) -> Result<()> {
        let expired_l1 = self.l1.purge_expired();
        let l2 = Arc::clone(&self.l2);
        let expired_l2 = tokio::task::spawn_blocking(move || -> Result<usize> {
            let purged = l2.purge_expired();
            l2.flush()?;
            Ok(purged)
        })
        .await
        .map_err(|e| Error::Internal(format!("L2 maintenance task failed: {e}")))??;
        let released = self.index.unload_idle(idle);
        let sessions_expired = self.preloader.expire_idle_sessions(idle);
        debug!(
            expired_l1,
            expired_l2,
            released = released.len(),
            sessions_expired,
            "Maintenance pass complete"
        );
        Ok(())
    }

    /// Warm one predicted key
    async fn warm(&self, key: &CacheKey) -> Result<bool> {
        if self.l1.contains(key) {
            return Ok(false);
        }
        let token = self.fence.token(key);

        if let Some(query) = StructuredQuery::from_key(key) {
            if !self.index.graph().contains(query.target()) {
                return Ok(false);
            }
            self.loader.request(&[query.target()]).await?.into_result()?;
            return Ok(self.lookup_index(key, token).is_some());
        }

        let bound = self.bindings.get(key).map(|b| b.clone());
        if let Some(fragments) = bound {
            let ids: Vec<&str> = fragments.iter().map(String::as_str).collect();
            self.loader.request(&ids).await?.into_result()?;
            return Ok(true);
        }

        match self.read_l2(key).await {
            Some(hit) => Ok(self.promote(key, hit, token)),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl PreloadTarget for ManagerInner {
    async fn preload(&self, key: &CacheKey) -> Result<bool> {
        self.metrics.record_preload_issued();
        let outcome = self.warm(key).await;
        self.metrics.record_preload_result(outcome.is_ok());
        outcome
    }
}

// =============================================================================
// Tests
// =============================================================================
