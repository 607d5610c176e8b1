//! Usage Window
//!
//! Bounded FIFO of recently resolved keys plus a first-order transition table
//! (previous key → next key → count). The table only counts adjacent pairs
//! still inside the window: when the oldest key falls out, the transition
//! from it to its successor is taken back.

use std::collections::{HashMap, VecDeque};

use crate::cache::CacheKey;

#[derive(Debug)]
pub struct UsageWindow {
    capacity: usize,
    /// Keys with the sequence number they were observed at, oldest first
    recent: VecDeque<(CacheKey, u64)>,
    transitions: HashMap<CacheKey, HashMap<CacheKey, u64>>,
    /// Sequence number of each key's latest sighting still in the window
    last_seen: HashMap<CacheKey, u64>,
    seq: u64,
}

impl UsageWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: VecDeque::with_capacity(capacity.max(1) + 1),
            transitions: HashMap::new(),
            last_seen: HashMap::new(),
            seq: 0,
        }
    }

    /// Append `key`, count the transition from the previous key, trim FIFO
    pub fn observe(&mut self, key: CacheKey) {
        if let Some((previous, _)) = self.recent.back() {
            *self
                .transitions
                .entry(previous.clone())
                .or_default()
                .entry(key.clone())
                .or_insert(0) += 1;
        }

        self.seq += 1;
        self.last_seen.insert(key.clone(), self.seq);
        self.recent.push_back((key, self.seq));
        while self.recent.len() > self.capacity {
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        let Some((oldest, seq)) = self.recent.pop_front() else {
            return;
        };
        if let Some((next, _)) = self.recent.front() {
            if let Some(successors) = self.transitions.get_mut(&oldest) {
                if let Some(count) = successors.get_mut(next) {
                    *count -= 1;
                    if *count == 0 {
                        successors.remove(next);
                    }
                }
                if successors.is_empty() {
                    self.transitions.remove(&oldest);
                }
            }
        }
        // Seen again later in the window otherwise
        if self.last_seen.get(&oldest) == Some(&seq) {
            self.last_seen.remove(&oldest);
        }
    }

    /// Successors of `key` with nonzero counts: highest count first, ties to
    /// the most recently seen candidate
    pub fn predict_next(&self, key: &CacheKey) -> Vec<(CacheKey, u64)> {
        let Some(successors) = self.transitions.get(key) else {
            return Vec::new();
        };
        let mut ranked: Vec<(CacheKey, u64, u64)> = successors
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(candidate, count)| {
                let seen = self.last_seen.get(candidate).copied().unwrap_or(0);
                (candidate.clone(), *count, seen)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
        ranked.into_iter().map(|(k, count, _)| (k, count)).collect()
    }

    pub fn transition_count(&self, from: &CacheKey, to: &CacheKey) -> u64 {
        self.transitions
            .get(from)
            .and_then(|next| next.get(to))
            .copied()
            .unwrap_or(0)
    }

    /// Keys in the window, oldest first
    pub fn recent(&self) -> impl Iterator<Item = &CacheKey> {
        self.recent.iter().map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> CacheKey {
        CacheKey::new("lesson", id).unwrap()
    }

    fn observe_all(window: &mut UsageWindow, ids: &[&str]) {
        for id in ids {
            window.observe(key(id));
        }
    }

    #[test]
    fn test_predict_orders_by_count() {
        let mut window = UsageWindow::new(100);
        for _ in 0..5 {
            observe_all(&mut window, &["A", "B"]);
        }
        for _ in 0..2 {
            observe_all(&mut window, &["A", "C"]);
        }

        assert_eq!(window.transition_count(&key("A"), &key("B")), 5);
        assert_eq!(window.transition_count(&key("A"), &key("C")), 2);
        let predicted: Vec<_> = window.predict_next(&key("A"));
        assert_eq!(predicted, vec![(key("B"), 5), (key("C"), 2)]);
    }

    #[test]
    fn test_ties_prefer_most_recently_seen() {
        let mut window = UsageWindow::new(100);
        observe_all(&mut window, &["A", "B", "A", "C", "X", "B"]);

        // A→B and A→C both 1; B was seen last
        let predicted = window.predict_next(&key("A"));
        assert_eq!(predicted[0].0, key("B"));
        assert_eq!(predicted[1].0, key("C"));
    }

    #[test]
    fn test_window_is_fifo_bounded() {
        let mut window = UsageWindow::new(3);
        observe_all(&mut window, &["1", "2", "3", "4"]);
        let recent: Vec<_> = window.recent().map(|k| k.id().to_string()).collect();
        assert_eq!(recent, vec!["2", "3", "4"]);
        assert_eq!(window.transition_count(&key("2"), &key("3")), 1);
        assert_eq!(window.transition_count(&key("3"), &key("4")), 1);
    }

    #[test]
    fn test_transitions_leaving_the_window_are_forgotten() {
        let mut window = UsageWindow::new(4);
        observe_all(&mut window, &["A", "B", "A", "B"]);
        assert_eq!(window.transition_count(&key("A"), &key("B")), 2);
        assert_eq!(window.transition_count(&key("B"), &key("A")), 1);

        // Window now B A B C: the first A→B pair has dropped out
        window.observe(key("C"));
        assert_eq!(window.transition_count(&key("A"), &key("B")), 1);
        assert_eq!(window.predict_next(&key("B")), vec![(key("C"), 1), (key("A"), 1)]);

        // Window now C D E F: nothing about A or B survives
        observe_all(&mut window, &["D", "E", "F"]);
        assert!(window.predict_next(&key("A")).is_empty());
        assert!(window.predict_next(&key("B")).is_empty());
        assert_eq!(window.predict_next(&key("E")), vec![(key("F"), 1)]);
        assert!(!window.last_seen.contains_key(&key("A")));
    }

    #[test]
    fn test_unknown_key_predicts_nothing() {
        let window = UsageWindow::new(10);
        assert!(window.predict_next(&key("nope")).is_empty());
        assert!(window.is_empty());
    }

    #[test]
    fn test_transition_table_is_bounded_by_window() {
        let mut window = UsageWindow::new(8);
        for i in 0..1_000 {
            window.observe(key(&(i % 97).to_string()));
        }
        let pairs: u64 = window.transitions.values().flat_map(|next| next.values()).sum();
        assert_eq!(pairs, 7);
        assert!(window.transitions.len() <= 7);
        assert!(window.last_seen.len() <= 8);
    }
}
