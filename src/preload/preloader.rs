//! Predictive Preloader
//!
//! Records resolved keys per session and, after each observation, warms the
//! top-K predicted successors in the background. Preloads are fire-and-forget:
//! `observe` never waits for them and their failures are only counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use super::window::UsageWindow;
use crate::cache::CacheKey;
use crate::error::Result;

/// Session used by [`PredictivePreloader::observe`]. Never expires.
pub const DEFAULT_SESSION: &str = "process";

/// Where predicted keys get warmed
#[async_trait]
pub trait PreloadTarget: Send + Sync {
    /// Warm `key`. `Ok(false)` means there was nothing to do.
    async fn preload(&self, key: &CacheKey) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct PreloadConfig {
    /// Keys remembered per session
    pub window_size: usize,
    /// Predictions warmed after each observation
    pub top_k: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            top_k: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreloadStats {
    pub sessions: usize,
    pub observations: u64,
    pub predictions_issued: u64,
    pub preloads_succeeded: u64,
    pub preloads_failed: u64,
    /// Predictions dropped because the same key was already being warmed
    pub preloads_coalesced: u64,
    pub sessions_expired: u64,
}

/// State shared with spawned preload tasks
#[derive(Default)]
struct Tracking {
    in_flight: DashMap<CacheKey, ()>,
    observations: AtomicU64,
    predictions_issued: AtomicU64,
    preloads_succeeded: AtomicU64,
    preloads_failed: AtomicU64,
    preloads_coalesced: AtomicU64,
    sessions_expired: AtomicU64,
}

impl Tracking {
    fn finish(&self, key: &CacheKey, outcome: Result<bool>) {
        self.in_flight.remove(key);
        match outcome {
            Ok(_) => {
                self.preloads_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.preloads_failed.fetch_add(1, Ordering::Relaxed);
                debug!(%key, error = %e, "Preload failed");
            }
        }
    }
}

struct Session {
    window: UsageWindow,
    last_used: Instant,
}

pub struct PredictivePreloader {
    config: PreloadConfig,
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    target: OnceCell<Weak<dyn PreloadTarget>>,
    tracking: Arc<Tracking>,
}

impl PredictivePreloader {
    pub fn new(config: PreloadConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            target: OnceCell::new(),
            tracking: Arc::new(Tracking::default()),
        }
    }

    /// Attach the component predictions are warmed into. Only the first call
    /// takes effect; until then observations are recorded but not acted on.
    pub fn bind(&self, target: Weak<dyn PreloadTarget>) -> bool {
        self.target.set(target).is_ok()
    }

    pub fn config(&self) -> &PreloadConfig {
        &self.config
    }

    fn session(&self, session: &str) -> Arc<Mutex<Session>> {
        if let Some(existing) = self.sessions.get(session) {
            return Arc::clone(&existing);
        }
        Arc::clone(&self.sessions.entry(session.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Session {
                window: UsageWindow::new(self.config.window_size),
                last_used: Instant::now(),
            }))
        }))
    }

    /// Record `key` in the process session and warm its likely successors
    pub fn observe(&self, key: &CacheKey) {
        self.observe_in(DEFAULT_SESSION, key);
    }

    pub fn observe_in(&self, session: &str, key: &CacheKey) {
        self.tracking.observations.fetch_add(1, Ordering::Relaxed);
        let predictions = {
            let entry = self.session(session);
            let mut entry = entry.lock();
            entry.last_used = Instant::now();
            entry.window.observe(key.clone());
            entry.window.predict_next(key)
        };
        trace!(%key, session, candidates = predictions.len(), "Observed");

        let Some(target) = self.target.get().and_then(Weak::upgrade) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        for (candidate, count) in predictions.into_iter().take(self.config.top_k) {
            if self.tracking.in_flight.insert(candidate.clone(), ()).is_some() {
                self.tracking.preloads_coalesced.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.tracking.predictions_issued.fetch_add(1, Ordering::Relaxed);
            debug!(from = %key, to = %candidate, count, "Preloading predicted key");

            let target = Arc::clone(&target);
            let tracking = Arc::clone(&self.tracking);
            runtime.spawn(async move {
                let outcome = target.preload(&candidate).await;
                tracking.finish(&candidate, outcome);
            });
        }
    }

    /// Successors of `key` in the process session
    pub fn predict_next(&self, key: &CacheKey) -> Vec<(CacheKey, u64)> {
        self.predict_next_in(DEFAULT_SESSION, key)
    }

    pub fn predict_next_in(&self, session: &str, key: &CacheKey) -> Vec<(CacheKey, u64)> {
        self.sessions
            .get(session)
            .map(|entry| entry.lock().window.predict_next(key))
            .unwrap_or_default()
    }

    /// Forget a session's history
    pub fn end_session(&self, session: &str) -> bool {
        self.sessions.remove(session).is_some()
    }

    /// Forget sessions with no observation for `idle`; returns how many
    pub fn expire_idle_sessions(&self, idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|name, entry| name == DEFAULT_SESSION || entry.lock().last_used.elapsed() < idle);
        let expired = before.saturating_sub(self.sessions.len());
        if expired > 0 {
            self.tracking
                .sessions_expired
                .fetch_add(expired as u64, Ordering::Relaxed);
            debug!(expired, remaining = self.sessions.len(), "Expired idle preload sessions");
        }
        expired
    }

    pub fn stats(&self) -> PreloadStats {
        let t = &self.tracking;
        PreloadStats {
            sessions: self.sessions.len(),
            observations: t.observations.load(Ordering::Relaxed),
            predictions_issued: t.predictions_issued.load(Ordering::Relaxed),
            preloads_succeeded: t.preloads_succeeded.load(Ordering::Relaxed),
            preloads_failed: t.preloads_failed.load(Ordering::Relaxed),
            preloads_coalesced: t.preloads_coalesced.load(Ordering::Relaxed),
            sessions_expired: t.sessions_expired.load(Ordering::Relaxed),
        }
    }

    /// Keys currently being warmed
    pub fn in_flight(&self) -> usize {
        self.tracking.in_flight.len()
    }
}
