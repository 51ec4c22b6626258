//! In-process BM25 keyword index.
//!
//! Built by scrolling the vector index, persisted to disk as a versioned
//! JSON blob, and rebuilt whenever the blob is missing or from another
//! format version. Scoring returns a vector aligned with `doc_ids` so the
//! hybrid retriever can fuse by position.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::db::index::VectorIndex;
use crate::types::{AppError, Result};

/// Bump when the serialized layout changes; stale files are rebuilt.
const FORMAT_VERSION: u32 = 1;

/// Scroll batch size while building from the vector index.
const BUILD_BATCH: usize = 100;

/// Tokenize text for BM25: lowercase whitespace split.
///
/// Kept as a free function so alternative tokenizations can slot in.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect()
}

/// BM25 index over the chunks of one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Index {
    version: u32,
    /// Point ids, aligned with `doc_tokens` and `score` output.
    doc_ids: Vec<String>,
    doc_tokens: Vec<Vec<String>>,
    document_frequencies: HashMap<String, usize>,
    avg_doc_length: f32,
    k1: f32,
    b: f32,
}

impl Bm25Index {
    /// Build an index from `(id, text)` pairs.
    pub fn build(docs: Vec<(String, String)>) -> Self {
        let mut doc_ids = Vec::with_capacity(docs.len());
        let mut doc_tokens = Vec::with_capacity(docs.len());
        let mut document_frequencies: HashMap<String, usize> = HashMap::new();

        for (id, text) in docs {
            let tokens = tokenize(&text);
            let mut unique: Vec<&String> = tokens.iter().collect();
            unique.sort();
            unique.dedup();
            for term in unique {
                *document_frequencies.entry(term.clone()).or_insert(0) += 1;
            }
            doc_ids.push(id);
            doc_tokens.push(tokens);
        }

        let total_tokens: usize = doc_tokens.iter().map(|t| t.len()).sum();
        let avg_doc_length = if doc_ids.is_empty() {
            0.0
        } else {
            total_tokens as f32 / doc_ids.len() as f32
        };

        Self {
            version: FORMAT_VERSION,
            doc_ids,
            doc_tokens,
            document_frequencies,
            avg_doc_length,
            k1: 1.2,
            b: 0.75,
        }
    }

    /// Build by scrolling every chunk out of the vector index.
    pub async fn build_from_index(index: &dyn VectorIndex, collection: &str) -> Result<Self> {
        let mut docs = Vec::new();
        let mut offset = 0;
        loop {
            let batch = index.scroll(collection, offset, BUILD_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len();
            for point in batch {
                docs.push((point.id, point.payload.text));
            }
        }
        tracing::info!(collection, num_docs = docs.len(), "built BM25 index");
        Ok(Self::build(docs))
    }

    fn idf(&self, term: &str) -> f32 {
        let df = self.document_frequencies.get(term).copied().unwrap_or(0) as f32;
        let n = self.doc_ids.len() as f32;
        if df == 0.0 || n == 0.0 {
            return 0.0;
        }
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// BM25 scores for the query, aligned with `doc_ids`.
    pub fn score(&self, query_tokens: &[String]) -> Vec<f32> {
        let mut scores = vec![0.0f32; self.doc_ids.len()];
        if query_tokens.is_empty() || self.avg_doc_length == 0.0 {
            return scores;
        }

        for (idx, tokens) in self.doc_tokens.iter().enumerate() {
            let doc_len = tokens.len() as f32;
            let mut term_freq: HashMap<&str, usize> = HashMap::new();
            for token in tokens {
                *term_freq.entry(token.as_str()).or_insert(0) += 1;
            }

            let mut score = 0.0;
            for term in query_tokens {
                let tf = term_freq.get(term.as_str()).copied().unwrap_or(0) as f32;
                if tf == 0.0 {
                    continue;
                }
                let idf = self.idf(term);
                let numerator = tf * (self.k1 + 1.0);
                let denominator =
                    tf + self.k1 * (1.0 - self.b + self.b * doc_len / self.avg_doc_length);
                score += idf * numerator / denominator;
            }
            scores[idx] = score;
        }
        scores
    }

    /// Top-k `(doc_id, score)` pairs for a raw query string.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(String, f32)> {
        let query_tokens = tokenize(query);
        let scores = self.score(&query_tokens);

        let mut results: Vec<(String, f32)> = self
            .doc_ids
            .iter()
            .zip(scores)
            .filter(|(_, score)| *score > 0.0)
            .map(|(id, score)| (id.clone(), score))
            .collect();

        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(top_k);
        results
    }

    /// Point ids in score order.
    pub fn doc_ids(&self) -> &[String] {
        &self.doc_ids
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    /// Whether the index holds no documents.
    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    /// Persist to disk as versioned JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::Internal(format!("failed to create cache dir: {}", e)))?;
        }
        let json = serde_json::to_string(self)
            .map_err(|e| AppError::Internal(format!("failed to serialize BM25 index: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| AppError::Internal(format!("failed to write BM25 index: {}", e)))?;
        Ok(())
    }

    /// Load from disk; `None` when the file is missing, unreadable, or from
    /// a different format version (callers rebuild in that case).
    pub fn load<P: AsRef<Path>>(path: P) -> Option<Self> {
        let json = std::fs::read_to_string(path).ok()?;
        let index: Self = serde_json::from_str(&json).ok()?;
        if index.version != FORMAT_VERSION {
            tracing::warn!(
                found = index.version,
                expected = FORMAT_VERSION,
                "BM25 cache version mismatch, rebuilding"
            );
            return None;
        }
        Some(index)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bm25Index {
        Bm25Index::build(vec![
            ("d1".into(), "the quick brown fox jumps over the lazy dog".into()),
            ("d2".into(), "a fast brown fox leaps over sleeping dogs".into()),
            ("d3".into(), "the cat sleeps on the mat".into()),
        ])
    }

    #[test]
    fn test_score_alignment() {
        let index = sample();
        let scores = index.score(&tokenize("quick brown fox"));
        assert_eq!(scores.len(), index.doc_ids().len());
        // d1 contains all three query terms
        assert!(scores[0] > scores[1]);
        assert!(scores[1] > scores[2]);
    }

    #[test]
    fn test_search_ranking() {
        let index = Bm25Index::build(vec![
            ("d1".into(), "apple apple apple".into()),
            ("d2".into(), "apple banana".into()),
            ("d3".into(), "banana banana banana".into()),
        ]);
        let results = index.search("apple", 10);
        assert!(!results.is_empty());
        assert_eq!(results[0].0, "d1");
    }

    #[test]
    fn test_empty_query_scores_zero() {
        let index = sample();
        let scores = index.score(&[]);
        assert!(scores.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bm25_docs.json");

        let index = sample();
        index.save(&path).unwrap();

        let loaded = Bm25Index::load(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        let results = loaded.search("quick brown", 10);
        assert_eq!(results[0].0, "d1");
    }

    #[test]
    fn test_load_missing_is_none() {
        assert!(Bm25Index::load("/nonexistent/bm25.json").is_none());
    }

    #[tokio::test]
    async fn test_build_from_index() {
        use crate::db::index::{ChunkPayload, IndexPoint, MemoryIndex};

        let store = MemoryIndex::new();
        store.ensure_collection("docs", 2).await.unwrap();
        store
            .upsert(
                "docs",
                vec![
                    IndexPoint {
                        id: "a".into(),
                        vector: vec![1.0, 0.0],
                        payload: ChunkPayload {
                            text: "rust is fast".into(),
                            ..Default::default()
                        },
                    },
                    IndexPoint {
                        id: "b".into(),
                        vector: vec![0.0, 1.0],
                        payload: ChunkPayload {
                            text: "python is popular".into(),
                            ..Default::default()
                        },
                    },
                ],
            )
            .await
            .unwrap();

        let index = Bm25Index::build_from_index(&store, "docs").await.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.search("rust", 5)[0].0, "a");
    }
}
