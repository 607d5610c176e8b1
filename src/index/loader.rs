//! Lazy Loader
//!
//! Turns fragment requests into scheduled background loads.
//!
//! A request expands to the dependency closure of the requested fragments,
//! drops what is already Loaded and queues the rest. A dispatcher task pops
//! jobs in (priority desc, topological order, id) order, starting a job only
//! once all of its dependencies are Loaded, on a bounded worker pool. Requests
//! for a fragment that is already queued or running attach to that job.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::graph::{DependencyGraph, FragmentId};
use super::tier::{FragmentState, IndexTier};
use crate::error::{Error, Result};

/// Default number of fragments loaded concurrently
pub const DEFAULT_LOADER_WORKERS: usize = 4;

type JobOutcome = std::result::Result<(), String>;

/// Queue order: higher priority first, then dependencies first, then id
type QueueKey = (Reverse<u8>, usize, FragmentId);

struct Job {
    priority: u8,
    /// Still waiting in the queue (not dispatched yet)
    queued: bool,
    outcome: watch::Sender<Option<JobOutcome>>,
}

#[derive(Default)]
struct LoaderState {
    queue: BTreeSet<QueueKey>,
    jobs: HashMap<FragmentId, Job>,
    stats: HashMap<FragmentId, LoadStats>,
    shut_down: bool,
}

/// Per-fragment load statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    pub loads: u64,
    pub failures: u64,
    pub total_load_time: Duration,
    pub last_error: Option<String>,
}

impl LoadStats {
    pub fn average_load_time(&self) -> Duration {
        let attempts = self.loads + self.failures;
        if attempts == 0 {
            Duration::ZERO
        } else {
            self.total_load_time / attempts as u32
        }
    }
}

/// Result of one request
#[derive(Debug, Clone, Default)]
pub struct LoadResult {
    /// Fragments of the closure that ended Loaded, dependencies first
    pub loaded: Vec<FragmentId>,
    /// Fragments that failed, with the reason
    pub failed: Vec<(FragmentId, String)>,
}

impl LoadResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// First failure as an error
    pub fn into_result(self) -> Result<Vec<FragmentId>> {
        match self.failed.into_iter().next() {
            None => Ok(self.loaded),
            Some((fragment, reason)) => Err(Error::FragmentLoadFailed { fragment, reason }),
        }
    }
}

struct LoaderInner {
    tier: Arc<IndexTier>,
    graph: Arc<DependencyGraph>,
    state: Mutex<LoaderState>,
    wake: Notify,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
}

/// Lazy loader - prioritized, dependency-aware fragment scheduling
#[derive(Clone)]
pub struct LazyLoader {
    inner: Arc<LoaderInner>,
}

impl LazyLoader {
    /// Start the loader and its dispatcher task. Requires a Tokio runtime.
    ///
    /// The dispatcher runs until [`LazyLoader::shutdown`].
    pub fn new(tier: Arc<IndexTier>, workers: usize) -> Self {
        let inner = Arc::new(LoaderInner {
            graph: Arc::clone(tier.graph()),
            tier,
            state: Mutex::new(LoaderState::default()),
            wake: Notify::new(),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&inner).dispatch());
        info!(workers = workers.max(1), "Lazy loader started");
        Self { inner }
    }

    pub fn tier(&self) -> &Arc<IndexTier> {
        &self.inner.tier
    }

    /// Load `ids` and their dependencies at the highest declared priority
    /// among `ids`.
    pub async fn request(&self, ids: &[&str]) -> Result<LoadResult> {
        let priority = ids
            .iter()
            .filter_map(|id| self.inner.graph.decl(id))
            .map(|decl| decl.priority)
            .max()
            .unwrap_or(0);
        self.request_with_priority(ids, priority).await
    }

    /// Load `ids` and their dependencies at an explicit priority
    pub async fn request_with_priority(&self, ids: &[&str], priority: u8) -> Result<LoadResult> {
        let closure = self.inner.graph.resolve_all(ids.iter().copied())?;

        let mut waiting = Vec::new();
        let mut result = LoadResult::default();
        {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(Error::Internal("lazy loader is shut down".into()));
            }
            for id in &closure {
                if self.inner.tier.is_loaded(id) && !state.jobs.contains_key(id) {
                    result.loaded.push(id.clone());
                    continue;
                }
                waiting.push((id.clone(), self.inner.enqueue(&mut state, id, priority)));
            }
        }
        if waiting.is_empty() {
            return Ok(result);
        }
        debug!(requested = ?ids, pending = waiting.len(), priority, "Fragments queued");
        self.inner.wake.notify_one();

        for (id, mut outcome) in waiting {
            let settled = outcome
                .wait_for(Option::is_some)
                .await
                .map(|o| o.clone())
                .unwrap_or_else(|_| Some(Err("loader dropped the job".into())));
            match settled {
                Some(Ok(())) => result.loaded.push(id),
                Some(Err(reason)) => result.failed.push((id, reason)),
                None => {}
            }
        }
        result.loaded.sort_by_key(|id| self.inner.graph.topo_rank(id));
        Ok(result)
    }

    /// Fragments waiting for or holding a worker
    pub fn pending(&self) -> usize {
        self.inner.state.lock().jobs.len()
    }

    pub fn load_stats(&self, id: &str) -> Option<LoadStats> {
        self.inner.state.lock().stats.get(id).cloned()
    }

    pub fn all_load_stats(&self) -> Vec<(FragmentId, LoadStats)> {
        let state = self.inner.state.lock();
        let mut all: Vec<_> = state.stats.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        all.sort_by_key(|(id, _)| self.inner.graph.topo_rank(id));
        all
    }

    /// Stop dispatching and fail everything still queued
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.state.lock();
        state.shut_down = true;
        state.queue.clear();
        let abandoned: Vec<FragmentId> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.queued)
            .map(|(id, _)| id.clone())
            .collect();
        for id in abandoned {
            if let Some(job) = state.jobs.remove(&id) {
                job.outcome.send_replace(Some(Err("loader shut down".into())));
            }
        }
        info!("Lazy loader shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl LoaderInner {
    /// Attach to or create the job for `id`; caller holds the state lock
    fn enqueue(&self, state: &mut LoaderState, id: &str, priority: u8) -> watch::Receiver<Option<JobOutcome>> {
        let rank = self.graph.topo_rank(id).unwrap_or(usize::MAX);
        if let Some(job) = state.jobs.get_mut(id) {
            if job.queued && priority > job.priority {
                state.queue.remove(&(Reverse(job.priority), rank, id.to_string()));
                state.queue.insert((Reverse(priority), rank, id.to_string()));
                job.priority = priority;
            }
            return job.outcome.subscribe();
        }

        let (outcome, rx) = watch::channel(None);
        state.jobs.insert(
            id.to_string(),
            Job {
                priority,
                queued: true,
                outcome,
            },
        );
        state.queue.insert((Reverse(priority), rank, id.to_string()));
        rx
    }

    async fn dispatch(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
            }

            loop {
                let permit = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                let Some(id) = self.next_ready() else { break };

                let inner = Arc::clone(&self);
                tokio::spawn(async move {
                    let _permit = permit;
                    inner.run_job(id).await;
                });
            }
        }
        debug!("Loader dispatcher stopped");
    }

    /// Pop the best job whose dependencies are all Loaded. Jobs whose
    /// dependency failed are failed on the way.
    fn next_ready(&self) -> Option<FragmentId> {
        let mut state = self.state.lock();
        loop {
            let (ready, requeued) = self.scan_queue(&mut state);
            if let Some(key) = ready {
                state.queue.remove(&key);
                if let Some(job) = state.jobs.get_mut(&key.2) {
                    job.queued = false;
                }
                return Some(key.2);
            }
            // Jobs added for invalidated dependencies may be ready themselves
            if !requeued {
                return None;
            }
        }
    }

    /// One pass over the queue: fail jobs with a failed dependency, queue
    /// dependencies that are no longer Loaded and find the best ready job.
    /// Returns that job and whether any dependency job was added.
    fn scan_queue(&self, state: &mut LoaderState) -> (Option<QueueKey>, bool) {
        let mut failed = Vec::new();
        let mut missing = Vec::new();
        let mut ready = None;

        for key in state.queue.iter() {
            let id = &key.2;
            let deps = self
                .graph
                .decl(id)
                .map(|d| d.depends_on.clone())
                .unwrap_or_default();

            let mut blocked = false;
            let mut broken = None;
            for dep in &deps {
                match self.tier.state(dep) {
                    Some(FragmentState::Loaded) => {}
                    _ if state.jobs.contains_key(dep) => blocked = true,
                    Some(FragmentState::Failed) => {
                        broken = Some(dep.clone());
                        break;
                    }
                    _ => {
                        // Unloaded (invalidated since the request) or being
                        // loaded outside the loader: give it a job
                        missing.push((dep.clone(), key.0 .0));
                        blocked = true;
                    }
                }
            }

            if let Some(dep) = broken {
                failed.push((key.clone(), dep));
            } else if !blocked {
                ready = Some(key.clone());
                break;
            }
        }

        for (key, dep) in failed {
            state.queue.remove(&key);
            let reason = format!("dependency '{dep}' failed");
            if let Err(e) = self.tier.mark_failed(&key.2, reason.clone()) {
                warn!(fragment = %key.2, error = %e, "Could not mark fragment failed");
            }
            Self::finish(state, &key.2, Err(reason), Duration::ZERO);
        }
        let mut requeued = false;
        for (dep, priority) in missing {
            if !state.jobs.contains_key(&dep) {
                drop(self.enqueue(state, &dep, priority));
                requeued = true;
            }
        }
        (ready, requeued)
    }

    async fn run_job(self: Arc<Self>, id: FragmentId) {
        let started = Instant::now();
        let outcome = match self.tier.load_fragment(&id).await {
            Ok(_) => Ok(()),
            Err(Error::FragmentLoadFailed { reason, .. }) => Err(reason),
            Err(e) => {
                error!(fragment = %id, error = %e, "Fragment job failed unexpectedly");
                Err(e.to_string())
            }
        };

        {
            let mut state = self.state.lock();
            Self::finish(&mut state, &id, outcome, started.elapsed());
        }
        self.wake.notify_one();
    }

    fn finish(state: &mut LoaderState, id: &str, outcome: JobOutcome, elapsed: Duration) {
        let stats = state.stats.entry(id.to_string()).or_default();
        stats.total_load_time += elapsed;
        match &outcome {
            Ok(()) => stats.loads += 1,
            Err(reason) => {
                stats.failures += 1;
                stats.last_error = Some(reason.clone());
            }
        }
        if let Some(job) = state.jobs.remove(id) {
            job.outcome.send_replace(Some(outcome));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::graph::FragmentDecl;
    use crate::index::source::InMemoryFragmentSource;
    use serde_json::json;

    fn curriculum() -> Arc<DependencyGraph> {
        Arc::new(
            DependencyGraph::new(vec![
                FragmentDecl::new("ucdm_comprehensive_index").with_priority(10),
                FragmentDecl::new("lesson_mapper")
                    .depends_on(["ucdm_comprehensive_index"])
                    .with_priority(8),
                FragmentDecl::new("concepts_index")
                    .depends_on(["ucdm_comprehensive_index"])
                    .with_priority(7),
                FragmentDecl::new("concept_to_lessons_index")
                    .depends_on(["concepts_index"])
                    .with_priority(7),
                FragmentDecl::new("365_lessons_indexed")
                    .depends_on(["lesson_mapper"])
                    .with_priority(5),
            ])
            .unwrap(),
        )
    }

    fn source(graph: &DependencyGraph) -> Arc<InMemoryFragmentSource> {
        let source = InMemoryFragmentSource::new();
        for id in graph.topo_order() {
            source.insert(id.clone(), json!({ "fragment": id }));
        }
        Arc::new(source)
    }

    fn loader(workers: usize) -> (LazyLoader, Arc<InMemoryFragmentSource>) {
        let graph = curriculum();
        let source = source(&graph);
        let tier = IndexTier::new(graph, source.clone());
        (LazyLoader::new(tier, workers), source)
    }

    #[tokio::test]
    async fn test_request_loads_closure() {
        let (loader, _) = loader(2);
        let result = loader.request(&["concept_to_lessons_index"]).await.unwrap();

        assert!(result.is_success());
        assert_eq!(
            result.loaded,
            vec!["ucdm_comprehensive_index", "concepts_index", "concept_to_lessons_index"]
        );
        assert!(!loader.tier().is_loaded("lesson_mapper"));
        assert_eq!(loader.pending(), 0);
    }

    #[tokio::test]
    async fn test_already_loaded_is_not_requeued() {
        let (loader, source) = loader(2);
        loader.request(&["lesson_mapper"]).await.unwrap();
        let result = loader.request(&["lesson_mapper"]).await.unwrap();
        assert_eq!(result.loaded.len(), 2);
        assert_eq!(source.total_loads(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_single_flight() {
        let (loader, source) = loader(4);
        source.set_delay(Some(Duration::from_millis(20)));

        let requests: Vec<_> = (0..6)
            .map(|_| {
                let loader = loader.clone();
                tokio::spawn(async move { loader.request(&["365_lessons_indexed"]).await })
            })
            .collect();
        for request in requests {
            assert!(request.await.unwrap().unwrap().is_success());
        }
        assert_eq!(source.load_count("ucdm_comprehensive_index"), 1);
        assert_eq!(source.load_count("365_lessons_indexed"), 1);
    }

    #[tokio::test]
    async fn test_dependency_failure_fails_dependents_without_loading() {
        let (loader, source) = loader(2);
        source.fail("concepts_index", "corrupt file");

        let result = loader.request(&["concept_to_lessons_index"]).await.unwrap();
        assert!(!result.is_success());
        assert_eq!(result.loaded, vec!["ucdm_comprehensive_index"]);
        assert_eq!(source.load_count("concept_to_lessons_index"), 0);

        let reasons: HashMap<_, _> = result.failed.iter().cloned().collect();
        assert_eq!(reasons["concepts_index"], "corrupt file");
        assert!(reasons["concept_to_lessons_index"].contains("concepts_index"));
        assert_eq!(
            loader.tier().state("concept_to_lessons_index"),
            Some(FragmentState::Failed)
        );

        // Failed fragments are claimable again
        source.clear_failure("concepts_index");
        let retry = loader.request(&["concept_to_lessons_index"]).await.unwrap();
        assert!(retry.is_success());
        assert_eq!(loader.load_stats("concepts_index").unwrap().failures, 1);
        assert_eq!(loader.load_stats("concepts_index").unwrap().loads, 1);
    }

    #[tokio::test]
    async fn test_priority_order_with_single_worker() {
        let (loader, _) = loader(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut watchers = Vec::new();
        for id in ["lesson_mapper", "concepts_index"] {
            let mut rx = loader.tier().subscribe(id).unwrap();
            let order = order.clone();
            watchers.push(tokio::spawn(async move {
                let _ = rx.wait_for(|s| s.state == FragmentState::Loaded).await;
                order.lock().push(id);
            }));
        }

        let low = loader.request_with_priority(&["concepts_index"], 1);
        let high = loader.request_with_priority(&["lesson_mapper"], 9);
        let (low, high) = tokio::join!(low, high);
        assert!(low.unwrap().is_success() && high.unwrap().is_success());
        for watcher in watchers {
            watcher.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["lesson_mapper", "concepts_index"]);
    }

    #[tokio::test]
    async fn test_dependency_invalidated_before_dispatch_is_reloaded() {
        let (loader, source) = loader(1);
        loader.request(&["ucdm_comprehensive_index"]).await.unwrap();

        // Queued while the dependency is Loaded, dispatched after it is not
        let mut dependent = Box::pin(loader.request(&["lesson_mapper"]));
        assert!(futures::poll!(&mut dependent).is_pending());
        loader.tier().invalidate("ucdm_comprehensive_index").unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), dependent)
            .await
            .expect("request stalled after its dependency was invalidated")
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.loaded, vec!["ucdm_comprehensive_index", "lesson_mapper"]);
        assert!(loader.tier().is_loaded("ucdm_comprehensive_index"));
        assert_eq!(source.load_count("ucdm_comprehensive_index"), 2);
        assert_eq!(loader.pending(), 0);
    }

    #[tokio::test]
    async fn test_unknown_fragment_and_shutdown() {
        let (loader, _) = loader(1);
        assert!(matches!(
            loader.request(&["ghost"]).await,
            Err(Error::UnknownFragment(_))
        ));

        loader.shutdown();
        assert!(loader.is_shut_down());
        assert!(loader.request(&["lesson_mapper"]).await.is_err());
    }

    #[test]
    fn test_into_result_reports_first_failure() {
        let result = LoadResult {
            loaded: vec!["a".into()],
            failed: vec![("b".into(), "boom".into())],
        };
        assert!(matches!(
            result.into_result(),
            Err(Error::FragmentLoadFailed { fragment, .. }) if fragment == "b"
        ));
    }
}
