//! Per-Key Single-Flight
//!
//! At most one load per key is in flight. Later callers attach to the shared
//! future of the running load. Each flight carries an id so that a completed
//! load only removes its own registration, never one started after an
//! invalidation detached it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use super::entry::CacheKey;

/// What every waiter of a flight receives
pub type LoadOutcome = std::result::Result<Bytes, Arc<anyhow::Error>>;

/// Shared handle to a running load
pub type SharedLoad = Shared<BoxFuture<'static, LoadOutcome>>;

struct Flight {
    id: u64,
    load: SharedLoad,
}

/// Registration returned by [`FlightMap::join_or_start`]
pub struct Joined {
    pub load: SharedLoad,
    /// True for the caller whose `start` created the flight
    pub leader: bool,
}

/// In-flight loads keyed by cache key
#[derive(Default)]
pub struct FlightMap {
    flights: DashMap<CacheKey, Flight>,
    next_id: AtomicU64,
    started: AtomicU64,
    coalesced: AtomicU64,
}

impl FlightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the key's flight, or create one with `start(flight_id)`.
    ///
    /// `start` runs while the key's map slot is locked; a flight that finishes
    /// immediately still cannot deregister before it was registered.
    pub fn join_or_start<F>(&self, key: &CacheKey, start: F) -> Joined
    where
        F: FnOnce(u64) -> BoxFuture<'static, LoadOutcome>,
    {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(flight) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                Joined {
                    load: flight.get().load.clone(),
                    leader: false,
                }
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let load = start(id).shared();
                slot.insert(Flight {
                    id,
                    load: load.clone(),
                });
                self.started.fetch_add(1, Ordering::Relaxed);
                Joined { load, leader: true }
            }
        }
    }

    /// Deregister flight `id` for `key` if it is still the registered one
    pub fn complete(&self, key: &CacheKey, id: u64) -> bool {
        self.flights.remove_if(key, |_, flight| flight.id == id).is_some()
    }

    /// Detach whatever flight is registered for `key`. Its waiters still get
    /// its result; new callers start a fresh load.
    pub fn detach(&self, key: &CacheKey) -> bool {
        self.flights.remove(key).is_some()
    }

    /// Detach every flight whose key matches `pred`
    pub fn detach_matching<P>(&self, pred: P) -> usize
    where
        P: Fn(&CacheKey) -> bool,
    {
        let before = self.flights.len();
        self.flights.retain(|key, _| !pred(key));
        before.saturating_sub(self.flights.len())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.flights.contains_key(key)
    }

    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Flights created
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Callers that attached to an existing flight
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn key(id: &str) -> CacheKey {
        CacheKey::new("lesson", id).unwrap()
    }

    #[tokio::test]
    async fn test_second_caller_joins_existing_flight() {
        let flights = FlightMap::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut rx = Some(rx);

        let mut joins = Vec::new();
        for _ in 0..3 {
            let starts = starts.clone();
            let rx = rx.take();
            joins.push(flights.join_or_start(&key("k"), move |_| {
                starts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if let Some(rx) = rx {
                        let _ = rx.await;
                    }
                    Ok(Bytes::from_static(b"value"))
                }
                .boxed()
            }));
        }

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(joins[0].leader);
        assert!(!joins[1].leader && !joins[2].leader);
        assert_eq!(flights.coalesced(), 2);

        tx.send(()).unwrap();
        for joined in joins {
            assert_eq!(joined.load.await.unwrap().as_ref(), b"value");
        }
    }

    #[tokio::test]
    async fn test_complete_only_removes_own_flight() {
        let flights = FlightMap::new();
        let mut first_id = 0;
        flights.join_or_start(&key("k"), |id| {
            first_id = id;
            async { Ok(Bytes::new()) }.boxed()
        });

        assert!(flights.detach(&key("k")));
        let second = flights.join_or_start(&key("k"), |_| async { Ok(Bytes::new()) }.boxed());
        assert!(second.leader);

        assert!(!flights.complete(&key("k"), first_id));
        assert!(flights.contains(&key("k")));
        assert_eq!(flights.started(), 2);
    }

    #[test]
    fn test_errors_are_shared() {
        let flights = FlightMap::new();
        let joined = flights.join_or_start(&key("bad"), |_| {
            async { Err(Arc::new(anyhow::anyhow!("source offline"))) }.boxed()
        });
        let follower = flights.join_or_start(&key("bad"), |_| unreachable!());

        let a = tokio_test::block_on(joined.load).unwrap_err();
        let b = tokio_test::block_on(follower.load).unwrap_err();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_detach_matching() {
        let flights = FlightMap::new();
        for id in ["a", "b", "c"] {
            flights.join_or_start(&key(id), |_| async { Ok(Bytes::new()) }.boxed());
        }
        flights.join_or_start(&CacheKey::new("concept", "x").unwrap(), |_| async { Ok(Bytes::new()) }.boxed());

        assert_eq!(flights.detach_matching(|k| k.namespace() == "lesson"), 3);
        assert_eq!(flights.in_flight(), 1);
    }
}
