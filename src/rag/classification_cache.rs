//! Two-tier classification cache.
//!
//! Exact-string lookups first, then TF-IDF cosine against previously
//! classified queries. A cached record is usable only when its confidence
//! clears the gate; semantic hits scale the stored confidence by the
//! similarity before the gate is applied. Entries expire after a TTL and
//! the oldest tenth is evicted when the cache overflows.
//!
//! Persisted as `classification_cache.json` with a `{cache, stats}` layout
//! so warm classifications survive restarts.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::rag::classifier::ClassificationSource;
use crate::rag::tfidf::TfidfVectorizer;
use crate::types::QueryType;

const TFIDF_FEATURES: usize = 500;
const TFIDF_NGRAM_MAX: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    query_type: QueryType,
    confidence: f32,
    timestamp: DateTime<Utc>,
    last_used: DateTime<Utc>,
    uses: u64,
    llm_used: bool,
}

/// Hit/miss counters, persisted alongside the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationCacheStats {
    /// Lookups served.
    pub total_queries: u64,
    /// Lookups answered from either tier.
    pub cache_hits: u64,
    /// Inserts that came from the LLM path.
    pub llm_calls: u64,
    /// Inserts that came from the deterministic path.
    pub learned_patterns: u64,
}

#[derive(Serialize, Deserialize)]
struct PersistedCache {
    cache: HashMap<String, CacheEntry>,
    stats: ClassificationCacheStats,
}

fn truncate(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(50)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    &text[..end]
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    vectorizer: TfidfVectorizer,
    query_texts: Vec<String>,
    query_vectors: Vec<Vec<f32>>,
    stats: ClassificationCacheStats,
}

impl Inner {
    fn rebuild_semantic_index(&mut self) {
        self.query_texts = self.entries.keys().cloned().collect();
        self.query_texts.sort();
        self.vectorizer = TfidfVectorizer::new(TFIDF_FEATURES, TFIDF_NGRAM_MAX);
        if !self.query_texts.is_empty() {
            self.vectorizer.fit(&self.query_texts);
        }
        self.query_vectors = self
            .query_texts
            .iter()
            .map(|q| self.vectorizer.transform(q))
            .collect();
    }
}

/// Cache of query classifications with exact and semantic tiers.
pub struct ClassificationCache {
    inner: RwLock<Inner>,
    path: Option<PathBuf>,
    semantic_threshold: f32,
    confidence_threshold: f32,
    max_size: usize,
    ttl: Duration,
}

impl ClassificationCache {
    /// Create a cache with the standard thresholds. When `path` is set the
    /// cache loads from and persists to that file.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self::with_thresholds(path, 0.75, 0.70, 10_000, Duration::days(30))
    }

    /// Create a cache with explicit thresholds.
    pub fn with_thresholds(
        path: Option<PathBuf>,
        semantic_threshold: f32,
        confidence_threshold: f32,
        max_size: usize,
        ttl: Duration,
    ) -> Self {
        let mut inner = Inner {
            entries: HashMap::new(),
            vectorizer: TfidfVectorizer::new(TFIDF_FEATURES, TFIDF_NGRAM_MAX),
            query_texts: Vec::new(),
            query_vectors: Vec::new(),
            stats: ClassificationCacheStats::default(),
        };

        if let Some(path) = &path {
            if let Ok(raw) = std::fs::read_to_string(path) {
                match serde_json::from_str::<PersistedCache>(&raw) {
                    Ok(persisted) => {
                        inner.entries = persisted.cache;
                        inner.stats = persisted.stats;
                        inner.rebuild_semantic_index();
                        tracing::info!(
                            entries = inner.entries.len(),
                            "loaded classification cache"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "unreadable classification cache, starting fresh");
                    }
                }
            }
        }

        Self {
            inner: RwLock::new(inner),
            path,
            semantic_threshold,
            confidence_threshold,
            max_size,
            ttl,
        }
    }

    fn expired(&self, entry: &CacheEntry) -> bool {
        Utc::now() - entry.timestamp > self.ttl
    }

    /// Look up a classification. Returns `(query_type, confidence, source)`
    /// when a tier hits with sufficient confidence.
    pub fn get(&self, query: &str) -> Option<(QueryType, f32, ClassificationSource)> {
        let mut inner = self.inner.write();
        inner.stats.total_queries += 1;

        // Tier 1: exact string.
        let expired = inner.entries.get(query).map(|e| self.expired(e));
        match expired {
            Some(true) => {
                inner.entries.remove(query);
                inner.rebuild_semantic_index();
            }
            Some(false) => {
                let confidence_threshold = self.confidence_threshold;
                let entry = inner.entries.get_mut(query).expect("checked above");
                if entry.confidence >= confidence_threshold {
                    entry.uses += 1;
                    entry.last_used = Utc::now();
                    let result = (entry.query_type, entry.confidence, ClassificationSource::ExactCache);
                    inner.stats.cache_hits += 1;
                    return Some(result);
                }
            }
            None => {}
        }

        // Tier 2: TF-IDF semantic similarity.
        if inner.vectorizer.is_fitted() {
            let query_vec = inner.vectorizer.transform(query);
            let best = inner
                .query_vectors
                .iter()
                .enumerate()
                .map(|(idx, v)| (idx, TfidfVectorizer::cosine(&query_vec, v)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            if let Some((idx, similarity)) = best {
                if similarity >= self.semantic_threshold {
                    let similar_query = inner.query_texts[idx].clone();
                    if let Some(entry) = inner.entries.get(&similar_query) {
                        if !self.expired(entry) {
                            let adjusted = entry.confidence * similarity;
                            if adjusted >= self.confidence_threshold {
                                let query_type = entry.query_type;
                                inner.stats.cache_hits += 1;
                                tracing::debug!(
                                    query = truncate(query),
                                    similar = truncate(&similar_query),
                                    similarity,
                                    "semantic classification hit"
                                );
                                return Some((
                                    query_type,
                                    adjusted,
                                    ClassificationSource::SemanticCache,
                                ));
                            }
                        }
                    }
                }
            }
        }

        None
    }

    /// Store a classification result.
    pub fn insert(&self, query: &str, query_type: QueryType, confidence: f32, llm_used: bool) {
        let mut inner = self.inner.write();
        let now = Utc::now();

        inner.entries.insert(
            query.to_string(),
            CacheEntry {
                query_type,
                confidence,
                timestamp: now,
                last_used: now,
                uses: 1,
                llm_used,
            },
        );

        if llm_used {
            inner.stats.llm_calls += 1;
        } else {
            inner.stats.learned_patterns += 1;
        }

        // Oldest 10% go when the cache overflows.
        if inner.entries.len() > self.max_size {
            let mut by_age: Vec<(String, DateTime<Utc>)> = inner
                .entries
                .iter()
                .map(|(q, e)| (q.clone(), e.last_used))
                .collect();
            by_age.sort_by_key(|(_, last_used)| *last_used);
            let to_remove = (by_age.len() / 10).max(1);
            for (query, _) in by_age.into_iter().take(to_remove) {
                inner.entries.remove(&query);
            }
            tracing::debug!(removed = to_remove, "evicted stale classifications");
        }

        inner.rebuild_semantic_index();
        self.persist(&inner);
    }

    fn persist(&self, inner: &Inner) {
        let Some(path) = &self.path else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let persisted = PersistedCache {
            cache: inner.entries.clone(),
            stats: inner.stats.clone(),
        };
        match serde_json::to_string_pretty(&persisted) {
            Ok(json) => {
                if let Err(err) = std::fs::write(path, json) {
                    tracing::warn!(error = %err, "failed to persist classification cache");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize classification cache"),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> ClassificationCacheStats {
        self.inner.read().stats.clone()
    }

    /// Number of cached classifications.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_hit_requires_confidence() {
        let cache = ClassificationCache::new(None);
        cache.insert("who wrote it", QueryType::FactualDetail, 0.95, true);
        cache.insert("something vague", QueryType::General, 0.5, false);

        let hit = cache.get("who wrote it").unwrap();
        assert_eq!(hit.0, QueryType::FactualDetail);
        assert_eq!(hit.2, ClassificationSource::ExactCache);

        // Below the confidence gate: treated as a miss.
        assert!(cache.get("something vague").is_none());
    }

    #[test]
    fn test_semantic_hit_scales_confidence() {
        let cache = ClassificationCache::new(None);
        for (q, t) in [
            ("compare the tools in the workshop table", QueryType::StructuredData),
            ("who is the author of the skating book", QueryType::FactualDetail),
            ("explain the safety process in detail", QueryType::ComplexAnalysis),
        ] {
            cache.insert(q, t, 0.95, true);
        }

        // Near-duplicate of a cached query; should land in the semantic tier.
        if let Some((query_type, confidence, source)) =
            cache.get("compare tools in the workshop table")
        {
            assert_eq!(query_type, QueryType::StructuredData);
            assert_eq!(source, ClassificationSource::SemanticCache);
            assert!(confidence <= 0.95);
        }
    }

    #[test]
    fn test_ttl_expiry_removes_entry() {
        let cache = ClassificationCache::with_thresholds(
            None,
            0.75,
            0.70,
            100,
            Duration::milliseconds(0),
        );
        cache.insert("old query", QueryType::General, 0.9, false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(cache.get("old query").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_eviction_keeps_cache_bounded() {
        let cache =
            ClassificationCache::with_thresholds(None, 0.75, 0.70, 10, Duration::days(30));
        for i in 0..12 {
            cache.insert(
                &format!("query number {}", i),
                QueryType::General,
                0.9,
                false,
            );
        }
        assert!(cache.len() <= 11);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classification_cache.json");

        {
            let cache = ClassificationCache::new(Some(path.clone()));
            cache.insert("who wrote it", QueryType::FactualDetail, 0.95, true);
        }

        let reloaded = ClassificationCache::new(Some(path));
        let hit = reloaded.get("who wrote it").unwrap();
        assert_eq!(hit.0, QueryType::FactualDetail);
        assert_eq!(reloaded.stats().llm_calls, 1);
    }
}
