//! Index Tier (L3)
//!
//! Lazily materialized fragment payloads with one state machine per fragment:
//!
//! ```text
//!   Unloaded ──claim──► Loading ──ok──► Loaded
//!      ▲  ▲                │              │
//!      │  └──claim── Failed ◄──err────────┘(invalidate / unload)
//!      └───────────────────────────────────┘
//! ```
//!
//! Each node's status lives in a `watch` channel; claiming is a
//! compare-and-set through `send_if_modified`, and waiters subscribe to the
//! same channel. Reads through [`IndexTier::lookup`] never wait.
//!
//! Invalidation bumps a node's generation. A load that finishes under an older
//! generation is discarded and re-run so stale data is never published.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::graph::{DependencyGraph, FragmentId};
use super::query::StructuredQuery;
use super::source::FragmentSource;
use crate::error::{Error, Result};

/// Loads discarded because of invalidation before the node gives up
const MAX_STALE_RELOADS: u32 = 3;

/// Lifecycle state of one fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

impl std::fmt::Display for FragmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FragmentState::Unloaded => "unloaded",
            FragmentState::Loading => "loading",
            FragmentState::Loaded => "loaded",
            FragmentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Observable status of one fragment node
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub state: FragmentState,
    /// Incremented on every successful claim
    pub epoch: u64,
    /// Incremented on every invalidation
    pub generation: u64,
    /// Present only while Loaded
    pub payload: Option<Arc<Value>>,
    /// Present only while Failed
    pub error: Option<String>,
}

impl NodeStatus {
    fn unloaded() -> Self {
        Self {
            state: FragmentState::Unloaded,
            epoch: 0,
            generation: 0,
            payload: None,
            error: None,
        }
    }
}

/// Proof of a successful Unloaded/Failed → Loading transition
#[derive(Debug, Clone, Copy)]
struct Claim {
    epoch: u64,
    generation: u64,
}

enum Publish {
    Loaded(Arc<Value>),
    Failed(String),
    /// Invalidated while loading; current generation attached
    Stale(u64),
}

struct FragmentNode {
    status: watch::Sender<NodeStatus>,
    last_access: Mutex<Option<Instant>>,
    /// Reads served from the payload
    reads: AtomicU64,
}

impl FragmentNode {
    fn new() -> Self {
        let (status, _) = watch::channel(NodeStatus::unloaded());
        Self {
            status,
            last_access: Mutex::new(None),
            reads: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        *self.last_access.lock() = Some(Instant::now());
    }

    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }
}

/// Read activity of one fragment
#[derive(Debug, Clone, Serialize)]
pub struct FragmentUsage {
    pub id: FragmentId,
    pub reads: u64,
    pub state: FragmentState,
    pub priority: u8,
    /// Time since the last read or load (None = never)
    pub idle: Option<Duration>,
}

/// Index tier statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub unloaded: usize,
    pub loading: usize,
    pub loaded: usize,
    pub failed: usize,
    pub lookups: u64,
    pub lookup_hits: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub stale_discards: u64,
}

/// Index tier - fragment state machines over a dependency graph
pub struct IndexTier {
    graph: Arc<DependencyGraph>,
    source: Arc<dyn FragmentSource>,
    nodes: HashMap<FragmentId, FragmentNode>,
    lookups: AtomicU64,
    lookup_hits: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    stale_discards: AtomicU64,
}

impl IndexTier {
    pub fn new(graph: Arc<DependencyGraph>, source: Arc<dyn FragmentSource>) -> Arc<Self> {
        let nodes = graph
            .decls()
            .iter()
            .map(|decl| (decl.id.clone(), FragmentNode::new()))
            .collect();
        info!(fragments = graph.len(), source = %source.describe(), "Index tier ready");
        Arc::new(Self {
            graph,
            source,
            nodes,
            lookups: AtomicU64::new(0),
            lookup_hits: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            stale_discards: AtomicU64::new(0),
        })
    }

    fn node(&self, id: &str) -> Result<&FragmentNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::UnknownFragment(id.to_string()))
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Answer a query from Loaded fragments only. Never waits.
    pub fn lookup(&self, query: &StructuredQuery) -> Option<Value> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let node = self.nodes.get(query.target())?;
        let payload = node.status.borrow().payload.clone()?;
        node.record_read();
        let value = query.evaluate(&payload)?;
        self.lookup_hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Payload of a Loaded fragment
    pub fn payload(&self, id: &str) -> Option<Arc<Value>> {
        let node = self.nodes.get(id)?;
        let payload = node.status.borrow().payload.clone();
        if payload.is_some() {
            node.record_read();
        }
        payload
    }

    pub fn state(&self, id: &str) -> Option<FragmentState> {
        self.nodes.get(id).map(|n| n.status.borrow().state)
    }

    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        self.nodes.get(id).map(|n| n.status.borrow().clone())
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.state(id) == Some(FragmentState::Loaded)
    }

    /// Follow a fragment's status changes
    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<NodeStatus>> {
        Ok(self.node(id)?.status.subscribe())
    }

    /// Every fragment with its state, dependencies first
    pub fn fragment_states(&self) -> Vec<(FragmentId, FragmentState)> {
        self.graph
            .topo_order()
            .into_iter()
            .filter_map(|id| self.state(&id).map(|s| (id, s)))
            .collect()
    }

    /// The `limit` most read fragments, most read first. Ties go to the
    /// higher declared priority, then dependency order.
    pub fn popular_fragments(&self, limit: usize) -> Vec<FragmentUsage> {
        let now = Instant::now();
        let mut usage: Vec<FragmentUsage> = self
            .graph
            .topo_order()
            .into_iter()
            .filter_map(|id| {
                let node = self.nodes.get(&id)?;
                let state = node.status.borrow().state;
                Some(FragmentUsage {
                    reads: node.reads.load(Ordering::Relaxed),
                    state,
                    priority: self.graph.decl(&id).map_or(0, |d| d.priority),
                    idle: node.last_access.lock().map(|at| now.duration_since(at)),
                    id,
                })
            })
            .collect();
        // Stable sort keeps dependency order among equals
        usage.sort_by(|a, b| b.reads.cmp(&a.reads).then(b.priority.cmp(&a.priority)));
        usage.truncate(limit);
        usage
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Load the dependency closure of `ids`, dependencies first.
    ///
    /// Loaded fragments are not reloaded; Failed ones are retried.
    #[instrument(skip(self), level = "debug")]
    pub async fn ensure_loaded(self: &Arc<Self>, ids: &[&str]) -> Result<()> {
        let closure = self.graph.resolve_all(ids.iter().copied())?;
        for id in closure {
            self.load_fragment(&id).await?;
        }
        Ok(())
    }

    /// Load one fragment, or attach to the load already running for it.
    ///
    /// Does not load dependencies. The load runs on its own task, so dropping
    /// this future never strands the node in Loading.
    pub async fn load_fragment(self: &Arc<Self>, id: &str) -> Result<Arc<Value>> {
        let node = self.node(id)?;
        let mut rx = node.status.subscribe();

        loop {
            let snapshot = rx.borrow_and_update().clone();
            let watch_epoch = match snapshot.state {
                FragmentState::Loaded => {
                    node.touch();
                    return snapshot
                        .payload
                        .ok_or_else(|| Error::Internal(format!("fragment '{id}' loaded without payload")));
                }
                FragmentState::Loading => snapshot.epoch,
                FragmentState::Unloaded | FragmentState::Failed => match self.claim(node) {
                    Some(claim) => {
                        let tier = Arc::clone(self);
                        let fragment = id.to_string();
                        tokio::spawn(async move { tier.run_load(fragment, claim).await });
                        claim.epoch
                    }
                    None => continue,
                },
            };

            let settled = rx
                .wait_for(|s| match s.state {
                    FragmentState::Loaded => true,
                    FragmentState::Failed => s.epoch >= watch_epoch,
                    FragmentState::Unloaded => true,
                    FragmentState::Loading => false,
                })
                .await
                .map_err(|_| Error::Internal(format!("fragment '{id}' node dropped")))?
                .clone();

            match settled.state {
                FragmentState::Loaded => {
                    if let Some(payload) = settled.payload {
                        node.touch();
                        return Ok(payload);
                    }
                }
                FragmentState::Failed => {
                    return Err(Error::FragmentLoadFailed {
                        fragment: id.to_string(),
                        reason: settled.error.unwrap_or_default(),
                    });
                }
                // Unloaded again before we saw the result: go round
                _ => {}
            }
        }
    }

    /// CAS Unloaded|Failed → Loading
    fn claim(&self, node: &FragmentNode) -> Option<Claim> {
        let mut claim = None;
        node.status.send_if_modified(|s| match s.state {
            FragmentState::Unloaded | FragmentState::Failed => {
                s.state = FragmentState::Loading;
                s.epoch += 1;
                s.error = None;
                claim = Some(Claim {
                    epoch: s.epoch,
                    generation: s.generation,
                });
                true
            }
            _ => false,
        });
        claim
    }

    async fn run_load(self: Arc<Self>, id: FragmentId, claim: Claim) {
        let Ok(node) = self.node(&id) else { return };
        let mut generation = claim.generation;

        for attempt in 0..=MAX_STALE_RELOADS {
            self.loads.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            let result = match self.source.load(&id).await {
                Ok(payload) => self.check_integrity(&id, payload),
                Err(e) => Err(format!("{e:#}")),
            };

            match self.publish(node, claim.epoch, generation, result) {
                Publish::Loaded(_) => {
                    debug!(fragment = %id, elapsed = ?started.elapsed(), "Fragment loaded");
                    return;
                }
                Publish::Failed(reason) => {
                    self.load_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(fragment = %id, %reason, "Fragment load failed");
                    return;
                }
                Publish::Stale(current) => {
                    self.stale_discards.fetch_add(1, Ordering::Relaxed);
                    debug!(fragment = %id, attempt, "Fragment invalidated during load, reloading");
                    generation = current;
                }
            }
        }

        // Ignores the generation: another invalidation may have landed since
        // the last stale result, and the node must not stay Loading
        if self.abandon(node, claim.epoch, "invalidated repeatedly while loading") {
            self.load_failures.fetch_add(1, Ordering::Relaxed);
            warn!(fragment = %id, "Fragment kept being invalidated during load");
        }
    }

    /// Fail the claim whatever the current generation
    fn abandon(&self, node: &FragmentNode, epoch: u64, reason: &str) -> bool {
        node.status.send_if_modified(|s| {
            if s.state != FragmentState::Loading || s.epoch != epoch {
                return false;
            }
            s.state = FragmentState::Failed;
            s.error = Some(reason.to_string());
            true
        })
    }

    fn check_integrity(&self, id: &str, payload: Value) -> std::result::Result<Value, String> {
        let Some(decl) = self.graph.decl(id) else {
            return Ok(payload);
        };
        if decl.required_keys.is_empty() {
            return Ok(payload);
        }
        let Some(object) = payload.as_object() else {
            return Err("payload is not a JSON object".into());
        };
        let missing: Vec<&str> = decl
            .required_keys
            .iter()
            .filter(|k| !object.contains_key(k.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(payload)
        } else {
            Err(format!("missing required keys: {}", missing.join(", ")))
        }
    }

    /// Publish a load result if the claim still owns the node
    fn publish(
        &self,
        node: &FragmentNode,
        epoch: u64,
        generation: u64,
        result: std::result::Result<Value, String>,
    ) -> Publish {
        let mut outcome = Publish::Failed("claim lost".into());
        node.status.send_if_modified(|s| {
            if s.state != FragmentState::Loading || s.epoch != epoch {
                return false;
            }
            if s.generation != generation {
                outcome = Publish::Stale(s.generation);
                return false;
            }
            match &result {
                Ok(payload) => {
                    let payload = Arc::new(payload.clone());
                    s.state = FragmentState::Loaded;
                    s.payload = Some(Arc::clone(&payload));
                    outcome = Publish::Loaded(payload);
                }
                Err(reason) => {
                    s.state = FragmentState::Failed;
                    s.error = Some(reason.clone());
                    outcome = Publish::Failed(reason.clone());
                }
            }
            true
        });
        if matches!(outcome, Publish::Loaded(_)) {
            node.touch();
        }
        outcome
    }

    /// Fail a fragment without loading it (e.g. its dependency failed).
    /// Returns false if the node could not be claimed.
    pub fn mark_failed(&self, id: &str, reason: impl Into<String>) -> Result<bool> {
        let node = self.node(id)?;
        let Some(claim) = self.claim(node) else {
            return Ok(false);
        };
        self.load_failures.fetch_add(1, Ordering::Relaxed);
        let published = self.publish(node, claim.epoch, claim.generation, Err(reason.into()));
        Ok(matches!(published, Publish::Failed(_)))
    }

    // =========================================================================
    // Invalidation and unloading
    // =========================================================================

    /// Invalidate a fragment and everything depending on it.
    ///
    /// Loaded and Failed nodes become Unloaded; Loading nodes keep loading but
    /// their result will be discarded. Returns the affected fragments.
    pub fn invalidate(&self, id: &str) -> Result<Vec<FragmentId>> {
        let mut affected = vec![id.to_string()];
        affected.extend(self.graph.dependents(id)?);

        for fragment in &affected {
            let node = self.node(fragment)?;
            node.status.send_modify(|s| {
                s.generation += 1;
                if s.state != FragmentState::Loading {
                    s.state = FragmentState::Unloaded;
                    s.payload = None;
                    s.error = None;
                }
            });
        }
        debug!(fragment = id, cascade = affected.len() - 1, "Fragment invalidated");
        Ok(affected)
    }

    /// Release Loaded fragments not read since `idle` ago whose dependents
    /// are not loaded.
    pub fn unload_idle(&self, idle: Duration) -> Vec<FragmentId> {
        let now = Instant::now();
        let mut order = self.graph.topo_order();
        order.reverse();

        let mut released = Vec::new();
        for id in order {
            let Some(node) = self.nodes.get(&id) else { continue };
            let stale = node
                .last_access
                .lock()
                .map_or(true, |at| now.duration_since(at) >= idle);
            if !stale {
                continue;
            }
            let dependents_loaded = self
                .graph
                .direct_dependents(&id)
                .unwrap_or_default()
                .iter()
                .any(|d| self.state(d) == Some(FragmentState::Loaded));
            if dependents_loaded {
                continue;
            }
            let unloaded = node.status.send_if_modified(|s| {
                if s.state != FragmentState::Loaded {
                    return false;
                }
                s.state = FragmentState::Unloaded;
                s.payload = None;
                true
            });
            if unloaded {
                released.push(id);
            }
        }
        if !released.is_empty() {
            info!(count = released.len(), "Released idle fragments");
        }
        released
    }

    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            lookup_hits: self.lookup_hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            stale_discards: self.stale_discards.load(Ordering::Relaxed),
            ..Default::default()
        };
        for node in self.nodes.values() {
            match node.status.borrow().state {
                FragmentState::Unloaded => stats.unloaded += 1,
                FragmentState::Loading => stats.loading += 1,
                FragmentState::Loaded => stats.loaded += 1,
                FragmentState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}
