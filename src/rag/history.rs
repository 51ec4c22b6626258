//! Bounded query-history ring.
//!
//! Maps `query_id` to the arm (or cache layer) that served it so later
//! feedback can be routed. Capacity-bounded with eviction by insertion
//! order; reads never promote, so the ring behaves as a FIFO of recent
//! queries.

use std::num::NonZeroUsize;

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;

use crate::types::HistoryEntry;

/// Default ring capacity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Process-local feedback correlation ring.
pub struct QueryHistory {
    ring: Mutex<LruCache<String, HistoryEntry>>,
}

impl Default for QueryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl QueryHistory {
    /// Create a ring holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            ring: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record a strategy-served query.
    pub fn record_strategy(
        &self,
        query_id: &str,
        arm: &str,
        automated_reward: f32,
        question: &str,
    ) {
        self.insert(
            query_id,
            HistoryEntry {
                strategy: arm.to_string(),
                automated_reward,
                question: truncate_question(question),
                is_cached: false,
                cache_layer: None,
                timestamp: Utc::now(),
                user_rating: None,
            },
        );
    }

    /// Record a cache-served query. Cached answers carry a high default
    /// reward so positive feedback is a no-op.
    pub fn record_cached(&self, query_id: &str, cache_layer: u8, question: &str) {
        self.insert(
            query_id,
            HistoryEntry {
                strategy: "cached".to_string(),
                automated_reward: 1.0,
                question: truncate_question(question),
                is_cached: true,
                cache_layer: Some(cache_layer),
                timestamp: Utc::now(),
                user_rating: None,
            },
        );
    }

    fn insert(&self, query_id: &str, entry: HistoryEntry) {
        self.ring.lock().put(query_id.to_string(), entry);
    }

    /// Fetch an entry without touching its position.
    pub fn get(&self, query_id: &str) -> Option<HistoryEntry> {
        self.ring.lock().peek(query_id).cloned()
    }

    /// Attach a user rating to an entry. Returns false when the id is
    /// unknown or a rating was already recorded.
    pub fn annotate_rating(&self, query_id: &str, rating: f32) -> bool {
        let mut ring = self.ring.lock();
        match ring.peek_mut(query_id) {
            Some(entry) if entry.user_rating.is_none() => {
                entry.user_rating = Some(rating);
                true
            }
            _ => false,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

fn truncate_question(question: &str) -> String {
    let end = question
        .char_indices()
        .nth(200)
        .map(|(idx, _)| idx)
        .unwrap_or(question.len());
    question[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_get() {
        let history = QueryHistory::new(10);
        history.record_strategy("q1", "hybrid", 0.8, "who wrote it");

        let entry = history.get("q1").unwrap();
        assert_eq!(entry.strategy, "hybrid");
        assert!(!entry.is_cached);
        assert!((entry.automated_reward - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn test_cached_entries_carry_layer() {
        let history = QueryHistory::new(10);
        history.record_cached("q2", 1, "same question again");

        let entry = history.get("q2").unwrap();
        assert!(entry.is_cached);
        assert_eq!(entry.cache_layer, Some(1));
        assert_eq!(entry.strategy, "cached");
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let history = QueryHistory::new(3);
        for i in 0..5 {
            history.record_strategy(&format!("q{}", i), "hybrid", 0.5, "q");
        }
        assert_eq!(history.len(), 3);
        assert!(history.get("q0").is_none());
        assert!(history.get("q4").is_some());
    }

    #[test]
    fn test_annotate_rating_once() {
        let history = QueryHistory::new(10);
        history.record_strategy("q1", "graph", 0.6, "question");

        assert!(history.annotate_rating("q1", 0.9));
        assert!(!history.annotate_rating("q1", 0.1));
        assert!(!history.annotate_rating("missing", 0.5));

        assert_eq!(history.get("q1").unwrap().user_rating, Some(0.9));
    }

    #[test]
    fn test_long_question_truncated() {
        let history = QueryHistory::new(4);
        let long = "x".repeat(500);
        history.record_strategy("q1", "hybrid", 0.5, &long);
        assert_eq!(history.get("q1").unwrap().question.len(), 200);
    }
}
