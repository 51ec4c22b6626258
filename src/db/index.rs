//! Typed client over the ANN store.
//!
//! The `VectorIndex` trait is the seam between the RAG core and whatever
//! vector database backs it. The in-process `MemoryIndex` implementation
//! scores by dot product over unit-normalized vectors (equal to cosine)
//! and keeps points in insertion-stable order so `scroll` is deterministic.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{AppError, Result};

// ============================================================================
// Payload and Point Types
// ============================================================================

/// Chunk payload carried through upsert and search.
///
/// Field set is fixed by the ingestion contract; unknown fields ride along
/// in `extra` so round-trips never drop data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkPayload {
    /// Chunk text. Legacy records may call this field `content`.
    #[serde(default, alias = "content")]
    pub text: String,
    /// Source label.
    #[serde(default)]
    pub source: String,
    /// Document title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Owning document id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Ordinal within the document.
    #[serde(default)]
    pub chunk_index: usize,
    /// Document authors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    /// Subject tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
    /// Original file path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Uploaded file name, set for user uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_file: Option<String>,
    /// Upload directory for resolving uploaded files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_dir: Option<String>,
    /// Document type tag (`book`, `spreadsheet`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Any additional payload fields.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ChunkPayload {
    /// Flatten the payload into a metadata map for citations.
    pub fn metadata_map(&self) -> HashMap<String, serde_json::Value> {
        let mut map = self.extra.clone();
        if let Some(title) = &self.title {
            map.insert("title".into(), title.clone().into());
        }
        if let Some(document_id) = &self.document_id {
            map.insert("document_id".into(), document_id.clone().into());
        }
        if !self.authors.is_empty() {
            map.insert(
                "authors".into(),
                serde_json::Value::Array(self.authors.iter().map(|a| a.clone().into()).collect()),
            );
        }
        if let Some(uploaded_file) = &self.uploaded_file {
            map.insert("uploaded_file".into(), uploaded_file.clone().into());
        }
        if let Some(upload_dir) = &self.upload_dir {
            map.insert("upload_dir".into(), upload_dir.clone().into());
        }
        if let Some(file_path) = &self.file_path {
            map.insert("file_path".into(), file_path.clone().into());
        }
        if let Some(doc_type) = &self.doc_type {
            map.insert("doc_type".into(), doc_type.clone().into());
        }
        map
    }
}

/// A point submitted to or scrolled out of the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexPoint {
    /// Globally unique chunk id.
    pub id: String,
    /// Unit-normalized embedding.
    pub vector: Vec<f32>,
    /// Chunk payload.
    pub payload: ChunkPayload,
}

/// A point returned by search with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    /// Chunk id.
    pub id: String,
    /// Cosine similarity to the query vector.
    pub score: f32,
    /// Chunk payload.
    pub payload: ChunkPayload,
}

// ============================================================================
// Vector Index Trait
// ============================================================================

/// Typed wrapper over the ANN store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if absent. Idempotent for a matching vector
    /// size; an existing collection with a different size is a typed error,
    /// never a silent recreation.
    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<()>;

    /// Insert or replace points.
    async fn upsert(&self, collection: &str, points: Vec<IndexPoint>) -> Result<()>;

    /// Nearest-neighbor search by cosine similarity.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>>;

    /// Page through all points in a stable order.
    async fn scroll(&self, collection: &str, offset: usize, batch: usize)
        -> Result<Vec<IndexPoint>>;

    /// Fetch specific points by id. Missing ids are skipped.
    async fn retrieve(&self, collection: &str, ids: &[String]) -> Result<Vec<IndexPoint>>;

    /// Drop a collection and everything in it.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Number of points in a collection (0 when absent).
    async fn count(&self, collection: &str) -> Result<usize>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

struct MemoryCollection {
    vector_size: usize,
    points: BTreeMap<String, IndexPoint>,
}

/// In-process vector index used by the default deployment and by tests.
pub struct MemoryIndex {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<()> {
        let mut collections = self.collections.write();
        match collections.get(name) {
            Some(existing) if existing.vector_size == vector_size => Ok(()),
            Some(existing) => Err(AppError::InvalidInput(format!(
                "collection '{}' exists with vector size {}, requested {}",
                name, existing.vector_size, vector_size
            ))),
            None => {
                collections.insert(
                    name.to_string(),
                    MemoryCollection {
                        vector_size,
                        points: BTreeMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn upsert(&self, collection: &str, points: Vec<IndexPoint>) -> Result<()> {
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| AppError::VectorStore(format!("unknown collection '{}'", collection)))?;

        for point in points {
            if point.vector.len() != coll.vector_size {
                return Err(AppError::VectorStore(format!(
                    "vector size mismatch for point '{}': expected {}, got {}",
                    point.id,
                    coll.vector_size,
                    point.vector.len()
                )));
            }
            coll.points.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read();
        let coll = match collections.get(collection) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };

        let mut scored: Vec<ScoredPoint> = coll
            .points
            .values()
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: dot(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn scroll(
        &self,
        collection: &str,
        offset: usize,
        batch: usize,
    ) -> Result<Vec<IndexPoint>> {
        let collections = self.collections.read();
        let coll = match collections.get(collection) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        Ok(coll
            .points
            .values()
            .skip(offset)
            .take(batch)
            .cloned()
            .collect())
    }

    async fn retrieve(&self, collection: &str, ids: &[String]) -> Result<Vec<IndexPoint>> {
        let collections = self.collections.read();
        let coll = match collections.get(collection) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| coll.points.get(id).cloned())
            .collect())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.collections.write().remove(name);
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .map(|c| c.points.len())
            .unwrap_or(0))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, vector: Vec<f32>, text: &str) -> IndexPoint {
        IndexPoint {
            id: id.to_string(),
            vector,
            payload: ChunkPayload {
                text: text.to_string(),
                source: "test".to_string(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_ensure_collection_idempotent() {
        let index = MemoryIndex::new();
        index.ensure_collection("docs", 4).await.unwrap();
        index.ensure_collection("docs", 4).await.unwrap();

        let err = index.ensure_collection("docs", 8).await.unwrap_err();
        assert_eq!(err.kind(), "input_validation");
    }

    #[tokio::test]
    async fn test_upsert_and_search() {
        let index = MemoryIndex::new();
        index.ensure_collection("docs", 3).await.unwrap();
        index
            .upsert(
                "docs",
                vec![
                    point("a", vec![1.0, 0.0, 0.0], "alpha"),
                    point("b", vec![0.0, 1.0, 0.0], "beta"),
                ],
            )
            .await
            .unwrap();

        let results = index.search("docs", &[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "a");
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_upsert_dimension_mismatch() {
        let index = MemoryIndex::new();
        index.ensure_collection("docs", 3).await.unwrap();
        let err = index
            .upsert("docs", vec![point("a", vec![1.0, 0.0], "short")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "vector_store_unavailable");
    }

    #[tokio::test]
    async fn test_scroll_pages_in_stable_order() {
        let index = MemoryIndex::new();
        index.ensure_collection("docs", 1).await.unwrap();
        for i in 0..5 {
            index
                .upsert("docs", vec![point(&format!("p{}", i), vec![1.0], "x")])
                .await
                .unwrap();
        }

        let first = index.scroll("docs", 0, 2).await.unwrap();
        let second = index.scroll("docs", 2, 2).await.unwrap();
        let third = index.scroll("docs", 4, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(third.len(), 1);

        let all: Vec<String> = first
            .iter()
            .chain(&second)
            .chain(&third)
            .map(|p| p.id.clone())
            .collect();
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted);
    }

    #[tokio::test]
    async fn test_retrieve_skips_missing() {
        let index = MemoryIndex::new();
        index.ensure_collection("docs", 1).await.unwrap();
        index
            .upsert("docs", vec![point("a", vec![1.0], "x")])
            .await
            .unwrap();

        let found = index
            .retrieve("docs", &["a".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }

    #[test]
    fn test_payload_content_alias() {
        let payload: ChunkPayload =
            serde_json::from_str(r#"{"content": "hello", "source": "s"}"#).unwrap();
        assert_eq!(payload.text, "hello");
    }
}
