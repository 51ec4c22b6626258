//! Multi-layer answer cache.
//!
//! One logical store with three lookup paths, consulted in order:
//!
//! 1. Exact hash: MD5 over the normalized query (lowercase, punctuation
//!    stripped, tokens sorted), O(1).
//! 2. Keyword: TF-IDF (uni+bi-grams, capped vocabulary) cosine match.
//! 3. Semantic: dense embedding dot product.
//!
//! Insertions populate every path so the layers stay coherent; eviction
//! drops the oldest record from all of them at once, and invalidation
//! removes by record and rebuilds the keyword index. Writes are gated on
//! answer quality: at least one citation and one retrieved chunk.
//! The gate is known to be weak (an irrelevant-but-cited answer still
//! caches); calibration is deliberately deferred.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::rag::embedding::ModelAdapter;
use crate::rag::tfidf::TfidfVectorizer;
use crate::types::{Citation, Result};

const TFIDF_FEATURES: usize = 100;
const TFIDF_NGRAM_MAX: usize = 2;

// ============================================================================
// Records
// ============================================================================

/// The cached portion of an answer, replayed on a hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAnswer {
    /// Rendered answer text.
    pub answer: String,
    /// Citations as originally returned.
    pub citations: Vec<Citation>,
    /// Confidence of the original answer.
    pub confidence: f32,
    /// Chunk count of the original retrieval.
    pub num_chunks_retrieved: usize,
    /// Strategy that produced the answer.
    pub selected_strategy: String,
    /// Router reasoning of the original request.
    pub strategy_reason: String,
}

struct CacheRecord {
    original_query: String,
    normalized_hash: String,
    answer: CachedAnswer,
    embedding: Vec<f32>,
    created_at: DateTime<Utc>,
    hit_count: u64,
}

/// A cache hit with its provenance.
#[derive(Debug, Clone)]
pub struct AnswerCacheHit {
    /// The cached answer.
    pub answer: CachedAnswer,
    /// 1 = exact, 2 = keyword, 3 = semantic.
    pub cache_layer: u8,
    /// Lookup technique, for logs and stats.
    pub cache_method: &'static str,
    /// Similarity of the matched query (1.0 for exact).
    pub similarity: f32,
}

/// Hit/miss counters per layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnswerCacheStats {
    /// Lookups served.
    pub total_queries: u64,
    /// Exact-hash hits.
    pub layer1_hits: u64,
    /// TF-IDF hits.
    pub layer2_hits: u64,
    /// Embedding hits.
    pub layer3_hits: u64,
    /// Lookups that missed every layer.
    pub misses: u64,
    /// Records dropped by the size bound.
    pub evictions: u64,
    /// Records currently held.
    pub entries: usize,
}

// ============================================================================
// Store
// ============================================================================

struct Inner {
    records: HashMap<u64, CacheRecord>,
    /// Insertion order; front is oldest.
    order: VecDeque<u64>,
    /// Normalized-hash lookup (layer 1).
    exact: HashMap<String, u64>,
    /// Keyword index (layer 2), rebuilt on insert/remove.
    vectorizer: TfidfVectorizer,
    tfidf_vectors: Vec<(u64, Vec<f32>)>,
    next_id: u64,
    stats: AnswerCacheStats,
}

impl Inner {
    fn rebuild_tfidf(&mut self) {
        let mut ids: Vec<u64> = self.order.iter().copied().collect();
        ids.sort_unstable();
        let corpus: Vec<String> = ids
            .iter()
            .filter_map(|id| self.records.get(id))
            .map(|r| r.original_query.clone())
            .collect();

        self.vectorizer = TfidfVectorizer::new(TFIDF_FEATURES, TFIDF_NGRAM_MAX);
        if !corpus.is_empty() {
            self.vectorizer.fit(&corpus);
        }
        self.tfidf_vectors = ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| (*id, r)))
            .map(|(id, r)| (id, self.vectorizer.transform(&r.original_query)))
            .collect();
    }

    fn remove_record(&mut self, id: u64) -> Option<CacheRecord> {
        let record = self.records.remove(&id)?;
        self.order.retain(|other| *other != id);
        self.exact.remove(&record.normalized_hash);
        self.rebuild_tfidf();
        Some(record)
    }
}

/// Three-layer answer cache.
pub struct AnswerCache {
    inner: RwLock<Inner>,
    models: Arc<ModelAdapter>,
    semantic_threshold: f32,
    tfidf_threshold: f32,
    max_size: usize,
    ttl: Duration,
}

/// Canonical query normalization: lowercase, strip punctuation, sort tokens.
///
/// Idempotent, and word permutations map to the same string.
pub fn normalize_query(query: &str) -> String {
    let cleaned: String = query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let mut words: Vec<&str> = cleaned.split_whitespace().collect();
    words.sort_unstable();
    words.join(" ")
}

fn hash_normalized(query: &str) -> String {
    format!("{:x}", md5::compute(normalize_query(query).as_bytes()))
}

impl AnswerCache {
    /// Create a cache backed by the model adapter for semantic lookups.
    pub fn new(
        models: Arc<ModelAdapter>,
        semantic_threshold: f32,
        tfidf_threshold: f32,
        max_size: usize,
        ttl_hours: i64,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                order: VecDeque::new(),
                exact: HashMap::new(),
                vectorizer: TfidfVectorizer::new(TFIDF_FEATURES, TFIDF_NGRAM_MAX),
                tfidf_vectors: Vec::new(),
                next_id: 0,
                stats: AnswerCacheStats::default(),
            }),
            models,
            semantic_threshold,
            tfidf_threshold,
            max_size,
            ttl: Duration::hours(ttl_hours),
        }
    }

    fn expired(&self, record: &CacheRecord) -> bool {
        Utc::now() - record.created_at > self.ttl
    }

    /// Look up a cached answer, trying the layers in order.
    pub async fn find(&self, query: &str) -> Result<Option<AnswerCacheHit>> {
        // Layers 1 and 2 are synchronous; do them under one lock.
        {
            let mut inner = self.inner.write();
            inner.stats.total_queries += 1;

            // Layer 1: exact hash.
            let hash = hash_normalized(query);
            if let Some(&id) = inner.exact.get(&hash) {
                let expired = inner.records.get(&id).map(|r| self.expired(r));
                if expired == Some(true) {
                    inner.remove_record(id);
                } else if let Some(record) = inner.records.get_mut(&id) {
                    record.hit_count += 1;
                    let hit = AnswerCacheHit {
                        answer: record.answer.clone(),
                        cache_layer: 1,
                        cache_method: "exact_hash",
                        similarity: 1.0,
                    };
                    inner.stats.layer1_hits += 1;
                    tracing::info!(query = %truncate(query), "answer cache hit (layer 1, exact hash)");
                    return Ok(Some(hit));
                }
            }

            // Layer 2: TF-IDF keyword match.
            if inner.vectorizer.is_fitted() {
                let query_vec = inner.vectorizer.transform(query);
                let best = inner
                    .tfidf_vectors
                    .iter()
                    .map(|(id, v)| (*id, TfidfVectorizer::cosine(&query_vec, v)))
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

                if let Some((id, similarity)) = best {
                    if similarity >= self.tfidf_threshold {
                        let expired = inner.records.get(&id).map(|r| self.expired(r));
                        if expired == Some(true) {
                            inner.remove_record(id);
                        } else if let Some(record) = inner.records.get_mut(&id) {
                            record.hit_count += 1;
                            let hit = AnswerCacheHit {
                                answer: record.answer.clone(),
                                cache_layer: 2,
                                cache_method: "tfidf_cosine",
                                similarity,
                            };
                            inner.stats.layer2_hits += 1;
                            tracing::info!(
                                query = %truncate(query),
                                similarity,
                                "answer cache hit (layer 2, tf-idf)"
                            );
                            return Ok(Some(hit));
                        }
                    }
                }
            }

            if inner.records.is_empty() {
                inner.stats.misses += 1;
                return Ok(None);
            }
        }

        // Layer 3: dense embedding; computed outside the lock.
        let query_embedding = match self.models.embed_one(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                tracing::warn!(error = %err, "semantic cache lookup skipped, embed failed");
                self.inner.write().stats.misses += 1;
                return Ok(None);
            }
        };

        let mut inner = self.inner.write();
        let best = inner
            .records
            .iter()
            .filter(|(_, r)| !r.embedding.is_empty() && !self.expired(r))
            .map(|(id, r)| {
                let similarity: f32 = query_embedding
                    .iter()
                    .zip(&r.embedding)
                    .map(|(a, b)| a * b)
                    .sum();
                (*id, similarity)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((id, similarity)) = best {
            if similarity >= self.semantic_threshold {
                if let Some(record) = inner.records.get_mut(&id) {
                    record.hit_count += 1;
                    let hit = AnswerCacheHit {
                        answer: record.answer.clone(),
                        cache_layer: 3,
                        cache_method: "dense_embedding",
                        similarity,
                    };
                    inner.stats.layer3_hits += 1;
                    tracing::info!(
                        query = %truncate(query),
                        similarity,
                        "answer cache hit (layer 3, semantic)"
                    );
                    return Ok(Some(hit));
                }
            }
        }

        inner.stats.misses += 1;
        Ok(None)
    }

    /// Store an answer in every layer, subject to the quality gate.
    /// Returns whether the answer was cached.
    pub async fn store(&self, query: &str, answer: CachedAnswer) -> bool {
        if answer.citations.is_empty() || answer.num_chunks_retrieved == 0 {
            tracing::debug!(
                query = %truncate(query),
                citations = answer.citations.len(),
                chunks = answer.num_chunks_retrieved,
                "answer not cached, quality gate"
            );
            return false;
        }

        // Embedding failures degrade the record to layers 1 and 2.
        let embedding = match self.models.embed_one(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                tracing::warn!(error = %err, "caching without semantic layer, embed failed");
                Vec::new()
            }
        };

        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;

        let record = CacheRecord {
            original_query: query.to_string(),
            normalized_hash: hash_normalized(query),
            answer,
            embedding,
            created_at: Utc::now(),
            hit_count: 0,
        };
        inner.exact.insert(record.normalized_hash.clone(), id);
        inner.records.insert(id, record);
        inner.order.push_back(id);

        while inner.order.len() > self.max_size {
            if let Some(oldest) = inner.order.front().copied() {
                inner.remove_record(oldest);
                inner.stats.evictions += 1;
            }
        }

        inner.rebuild_tfidf();
        true
    }

    /// Remove a query from every layer. Returns whether anything was
    /// removed. Invoked by negative feedback.
    pub fn invalidate(&self, query: &str) -> bool {
        let mut inner = self.inner.write();
        let hash = hash_normalized(query);

        let id = inner.exact.get(&hash).copied().or_else(|| {
            inner
                .records
                .iter()
                .find(|(_, r)| r.original_query == query)
                .map(|(id, _)| *id)
        });

        match id {
            Some(id) => {
                inner.remove_record(id);
                tracing::info!(query = %truncate(query), "answer cache invalidated");
                true
            }
            None => {
                tracing::warn!(query = %truncate(query), "invalidation requested for uncached query");
                false
            }
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.records.clear();
        inner.order.clear();
        inner.exact.clear();
        inner.tfidf_vectors.clear();
        inner.vectorizer = TfidfVectorizer::new(TFIDF_FEATURES, TFIDF_NGRAM_MAX);
    }

    /// Current counters.
    pub fn stats(&self) -> AnswerCacheStats {
        let inner = self.inner.read();
        let mut stats = inner.stats.clone();
        stats.entries = inner.records.len();
        stats
    }
}

fn truncate(query: &str) -> &str {
    let end = query
        .char_indices()
        .nth(50)
        .map(|(idx, _)| idx)
        .unwrap_or(query.len());
    &query[..end]
}

// ============================================================================
// Tests
// ============================================================================
