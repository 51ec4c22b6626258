//! Hybrid retrieval: BM25 and vector search fused by weighted score.
//!
//! The two passes run concurrently; BM25 scores are min-max normalized
//! within the candidate set, vector scores are taken as-is, and the fused
//! score is `alpha * vector + (1 - alpha) * bm25`. Output order is a
//! stable sort by fused score descending with ties broken by chunk id.
//! An optional cross-encoder pass reorders the final top-k.
//!
//! The BM25 index initializes lazily on the first request (loading the
//! disk cache when present), and rebuilds are serialized while readers
//! keep using the previous snapshot.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::db::index::VectorIndex;
use crate::rag::bm25::{tokenize, Bm25Index};
use crate::rag::embedding::ModelAdapter;
use crate::types::{AppError, Provenance, Result, RetrievedChunk};

/// Hard cap on per-side candidate counts.
const MAX_CANDIDATES: usize = 100;

/// Per-request knobs for a hybrid search.
#[derive(Debug, Clone)]
pub struct HybridOptions {
    /// Final number of chunks to return.
    pub top_k: usize,
    /// Vector-vs-BM25 weight; the retriever default applies when `None`.
    pub alpha: Option<f32>,
    /// Override for the vector-side candidate count.
    pub vector_limit: Option<usize>,
    /// Apply the cross-encoder after fusion.
    pub rerank: bool,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            alpha: None,
            vector_limit: None,
            rerank: true,
        }
    }
}

/// Wall times of the retrieval passes, in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct HybridTimings {
    /// BM25 scoring (worker pool).
    pub bm25_ms: f64,
    /// Vector search.
    pub vector_ms: f64,
    /// Payload retrieval and fusion.
    pub fusion_ms: f64,
    /// Cross-encoder pass, 0 when skipped.
    pub rerank_ms: f64,
}

/// BM25 + vector retriever over one collection.
pub struct HybridRetriever {
    index: Arc<dyn VectorIndex>,
    models: Arc<ModelAdapter>,
    collection: String,
    cache_file: Option<PathBuf>,
    default_alpha: f32,
    bm25: RwLock<Option<Arc<Bm25Index>>>,
    rebuild_lock: Mutex<()>,
}

impl HybridRetriever {
    /// Create a retriever. `cache_file` holds the persisted BM25 index.
    pub fn new(
        index: Arc<dyn VectorIndex>,
        models: Arc<ModelAdapter>,
        collection: impl Into<String>,
        cache_file: Option<PathBuf>,
        default_alpha: f32,
    ) -> Self {
        Self {
            index,
            models,
            collection: collection.into(),
            cache_file,
            default_alpha,
            bm25: RwLock::new(None),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Collection this retriever serves.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Get the BM25 snapshot, building it if needed. Rebuilds are
    /// exclusive; concurrent readers keep the previous snapshot.
    pub async fn ensure_bm25(&self, force_rebuild: bool) -> Result<Arc<Bm25Index>> {
        if !force_rebuild {
            if let Some(snapshot) = self.bm25.read().clone() {
                return Ok(snapshot);
            }
        }

        let _guard = self.rebuild_lock.lock().await;
        if !force_rebuild {
            if let Some(snapshot) = self.bm25.read().clone() {
                return Ok(snapshot);
            }
        }

        // Disk cache first, unless this is an explicit rebuild.
        if !force_rebuild {
            if let Some(cache_file) = &self.cache_file {
                if let Some(index) = Bm25Index::load(cache_file) {
                    tracing::info!(
                        path = %cache_file.display(),
                        num_docs = index.len(),
                        "loaded BM25 index from cache"
                    );
                    let snapshot = Arc::new(index);
                    *self.bm25.write() = Some(snapshot.clone());
                    return Ok(snapshot);
                }
            }
        }

        let built = Bm25Index::build_from_index(self.index.as_ref(), &self.collection).await?;
        if let Some(cache_file) = &self.cache_file {
            if let Err(err) = built.save(cache_file) {
                tracing::warn!(error = %err, "failed to cache BM25 index");
            }
        }
        let snapshot = Arc::new(built);
        *self.bm25.write() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Rebuild the BM25 index from the vector store, replacing the snapshot.
    pub async fn rebuild_bm25(&self) -> Result<usize> {
        let snapshot = self.ensure_bm25(true).await?;
        Ok(snapshot.len())
    }

    /// Run the fused retrieval.
    pub async fn search(
        &self,
        query_text: &str,
        query_vector: &[f32],
        options: &HybridOptions,
    ) -> Result<(Vec<RetrievedChunk>, HybridTimings)> {
        let alpha = options.alpha.unwrap_or(self.default_alpha).clamp(0.0, 1.0);
        let top_k = options.top_k.max(1);
        let bm25_candidates = (top_k * 2).min(MAX_CANDIDATES);
        let vector_candidates = options
            .vector_limit
            .unwrap_or(top_k * 2)
            .min(MAX_CANDIDATES);

        let bm25_index = self.ensure_bm25(false).await?;
        let mut timings = HybridTimings::default();

        // BM25 scoring is CPU-bound; it runs on the worker pool in parallel
        // with the vector search.
        let query_tokens = tokenize(query_text);
        let bm25_snapshot = bm25_index.clone();
        let bm25_fut = async move {
            let start = Instant::now();
            let scores = tokio::task::spawn_blocking(move || {
                let scores = bm25_snapshot.score(&query_tokens);
                let mut ranked: Vec<(String, f32)> = bm25_snapshot
                    .doc_ids()
                    .iter()
                    .zip(scores)
                    .filter(|(_, score)| *score > 0.0)
                    .map(|(id, score)| (id.clone(), score))
                    .collect();
                ranked.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                ranked.truncate(bm25_candidates);
                ranked
            })
            .await
            .map_err(|e| AppError::Internal(format!("BM25 task failed: {}", e)))?;
            Ok::<_, AppError>((scores, start.elapsed().as_secs_f64() * 1000.0))
        };

        let vector_fut = async {
            let start = Instant::now();
            let results = self
                .index
                .search(&self.collection, query_vector, vector_candidates)
                .await?;
            Ok::<_, AppError>((results, start.elapsed().as_secs_f64() * 1000.0))
        };

        let (bm25_result, vector_result) = tokio::join!(bm25_fut, vector_fut);
        let (bm25_ranked, bm25_ms) = bm25_result?;
        let (vector_results, vector_ms) = vector_result?;
        timings.bm25_ms = bm25_ms;
        timings.vector_ms = vector_ms;

        let fusion_start = Instant::now();

        // Min-max normalize BM25 within the candidate set.
        let bm25_normalized: HashMap<String, f32> = if bm25_ranked.is_empty() {
            HashMap::new()
        } else {
            let max = bm25_ranked
                .iter()
                .map(|(_, s)| *s)
                .fold(f32::MIN, f32::max);
            let min = bm25_ranked
                .iter()
                .map(|(_, s)| *s)
                .fold(f32::MAX, f32::min);
            let range = max - min;
            bm25_ranked
                .iter()
                .map(|(id, score)| {
                    let normalized = if range > 0.0 {
                        (score - min) / range
                    } else if *score > 0.0 {
                        1.0
                    } else {
                        0.0
                    };
                    (id.clone(), normalized)
                })
                .collect()
        };

        let vector_scores: HashMap<String, f32> = vector_results
            .iter()
            .map(|p| (p.id.clone(), p.score))
            .collect();
        let mut payloads: HashMap<String, crate::db::index::ChunkPayload> = vector_results
            .into_iter()
            .map(|p| (p.id, p.payload))
            .collect();

        // Union of both candidate sets; one empty side degrades the fusion
        // to the other side's score.
        let mut all_ids: Vec<String> = bm25_normalized
            .keys()
            .chain(vector_scores.keys())
            .cloned()
            .collect();
        all_ids.sort();
        all_ids.dedup();

        let mut fused: Vec<(String, f32, f32, f32)> = all_ids
            .into_iter()
            .map(|id| {
                let bm25_score = bm25_normalized.get(&id).copied().unwrap_or(0.0);
                let vector_score = vector_scores.get(&id).copied().unwrap_or(0.0);
                let fused_score = if bm25_normalized.is_empty() {
                    vector_score
                } else if vector_scores.is_empty() {
                    bm25_score
                } else {
                    alpha * vector_score + (1.0 - alpha) * bm25_score
                };
                (id, fused_score, bm25_score, vector_score)
            })
            .collect();

        fused.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        fused.truncate(top_k);

        // Fetch payloads the vector pass didn't return.
        let missing: Vec<String> = fused
            .iter()
            .filter(|(id, ..)| !payloads.contains_key(id))
            .map(|(id, ..)| id.clone())
            .collect();
        if !missing.is_empty() {
            for point in self.index.retrieve(&self.collection, &missing).await? {
                payloads.insert(point.id, point.payload);
            }
        }

        let mut chunks: Vec<RetrievedChunk> = fused
            .into_iter()
            .filter_map(|(id, fused_score, bm25_score, vector_score)| {
                let payload = payloads.remove(&id)?;
                Some(RetrievedChunk {
                    chunk_id: id,
                    text: payload.text.clone(),
                    source: payload.source.clone(),
                    score: fused_score,
                    bm25_score,
                    vector_score,
                    fused_score,
                    provenance: Provenance::Hybrid,
                    metadata: payload.metadata_map(),
                })
            })
            .collect();
        timings.fusion_ms = fusion_start.elapsed().as_secs_f64() * 1000.0;

        // Final ordering by cross-encoder when requested.
        if options.rerank && !chunks.is_empty() {
            let rerank_start = Instant::now();
            let documents: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            match self.models.rerank(query_text, &documents).await {
                Ok(scores) => {
                    for (chunk, score) in chunks.iter_mut().zip(&scores) {
                        chunk.score = *score;
                    }
                    chunks.sort_by(|a, b| {
                        b.score
                            .partial_cmp(&a.score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
                    });
                }
                Err(err) => {
                    // Fused order stands when the reranker is unavailable.
                    tracing::warn!(error = %err, "rerank failed, keeping fused order");
                }
            }
            timings.rerank_ms = rerank_start.elapsed().as_secs_f64() * 1000.0;
        }

        Ok((chunks, timings))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::index::{ChunkPayload, IndexPoint, MemoryIndex};
    use crate::rag::embedding::{HashingEmbedder, LexicalReranker, ModelPair};

    async fn retriever_with_docs(docs: &[(&str, &str)]) -> (HybridRetriever, Arc<ModelAdapter>) {
        let index = Arc::new(MemoryIndex::new());
        let models = Arc::new(ModelAdapter::new(
            ModelPair {
                embed: Arc::new(HashingEmbedder::new(64)),
                rerank: Arc::new(LexicalReranker),
            },
            None,
            5000.0,
        ));

        index.ensure_collection("docs", 64).await.unwrap();
        for (id, text) in docs {
            let vector = models.embed_one(text).await.unwrap();
            index
                .upsert(
                    "docs",
                    vec![IndexPoint {
                        id: id.to_string(),
                        vector,
                        payload: ChunkPayload {
                            text: text.to_string(),
                            source: format!("source-{}", id),
                            ..Default::default()
                        },
                    }],
                )
                .await
                .unwrap();
        }

        let retriever =
            HybridRetriever::new(index, models.clone(), "docs", None, 0.7);
        (retriever, models)
    }

    #[tokio::test]
    async fn test_search_finds_keyword_match() {
        let (retriever, models) = retriever_with_docs(&[
            ("a", "Daddy Take Me Skating was written by Ruth Doan MacDougall"),
            ("b", "An unrelated text about gardening and tomatoes"),
        ])
        .await;

        let query = "Who wrote Daddy Take Me Skating?";
        let vector = models.embed_one(query).await.unwrap();
        let (chunks, timings) = retriever
            .search(query, &vector, &HybridOptions::default())
            .await
            .unwrap();

        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].chunk_id, "a");
        assert!(chunks[0].fused_score > 0.0);
        assert!(timings.vector_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_scores_recorded_on_chunks() {
        let (retriever, models) = retriever_with_docs(&[
            ("a", "the quick brown fox jumps"),
            ("b", "lazy dogs sleep all day"),
        ])
        .await;

        let vector = models.embed_one("quick brown fox").await.unwrap();
        let (chunks, _) = retriever
            .search(
                "quick brown fox",
                &vector,
                &HybridOptions {
                    rerank: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let top = &chunks[0];
        assert_eq!(top.chunk_id, "a");
        assert!(top.bm25_score > 0.0);
        assert_eq!(top.fused_score, top.score);
    }

    #[tokio::test]
    async fn test_stable_order_on_score_ties() {
        let (retriever, models) = retriever_with_docs(&[
            ("b", "identical text body"),
            ("a", "identical text body"),
        ])
        .await;

        let vector = models.embed_one("identical text body").await.unwrap();
        let (chunks, _) = retriever
            .search(
                "identical text body",
                &vector,
                &HybridOptions {
                    rerank: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Equal scores: chunk id ascending breaks the tie.
        assert_eq!(chunks[0].chunk_id, "a");
        assert_eq!(chunks[1].chunk_id, "b");
    }

    #[tokio::test]
    async fn test_empty_collection_returns_empty() {
        let (retriever, models) = retriever_with_docs(&[]).await;
        let vector = models.embed_one("anything").await.unwrap();
        let (chunks, _) = retriever
            .search("anything", &vector, &HybridOptions::default())
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_bm25_lazy_init_and_rebuild() {
        let (retriever, _) = retriever_with_docs(&[("a", "some text here")]).await;
        let snapshot = retriever.ensure_bm25(false).await.unwrap();
        assert_eq!(snapshot.len(), 1);

        let rebuilt = retriever.rebuild_bm25().await.unwrap();
        assert_eq!(rebuilt, 1);
    }
}
