//! In-process embedding and rerank backends over fastembed.
//!
//! Enabled by the `local-embeddings` feature. Model loading and inference
//! are synchronous ONNX calls, so everything runs under `spawn_blocking`.

use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{
    EmbeddingModel, InitOptions, RerankInitOptions, RerankerModel, TextEmbedding, TextRerank,
};
use tokio::sync::{Mutex, OnceCell};

use crate::rag::embedding::{EmbeddingBackend, RerankBackend};
use crate::types::{AppError, Result};

/// Fastembed text-embedding backend, lazily initialized.
pub struct FastembedEmbedding {
    model: EmbeddingModel,
    dimensions: usize,
    id: String,
    handle: OnceCell<Arc<Mutex<TextEmbedding>>>,
}

impl FastembedEmbedding {
    /// Create a backend for `model` with its known output dimension.
    pub fn new(model: EmbeddingModel, dimensions: usize, id: impl Into<String>) -> Self {
        Self {
            model,
            dimensions,
            id: id.into(),
            handle: OnceCell::new(),
        }
    }

    /// The default pairing: bge-small English embeddings.
    pub fn bge_small() -> Self {
        Self::new(EmbeddingModel::BGESmallENV15, 384, "bge-small-en-v1.5")
    }

    async fn model(&self) -> Result<Arc<Mutex<TextEmbedding>>> {
        self.handle
            .get_or_try_init(|| async {
                let model = self.model.clone();
                tokio::task::spawn_blocking(move || {
                    let embedding = TextEmbedding::try_new(
                        InitOptions::new(model).with_show_download_progress(false),
                    )
                    .map_err(|e| {
                        AppError::Internal(format!("failed to load embedding model: {}", e))
                    })?;
                    Ok(Arc::new(Mutex::new(embedding)))
                })
                .await
                .map_err(|e| AppError::Internal(format!("embedding init task failed: {}", e)))?
            })
            .await
            .map(Arc::clone)
    }
}

#[async_trait]
impl EmbeddingBackend for FastembedEmbedding {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model().await?;
        let owned: Vec<String> = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut model = model.blocking_lock();
            let refs: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
            model
                .embed(refs, None)
                .map_err(|e| AppError::Internal(format!("embedding failed: {}", e)))
        })
        .await
        .map_err(|e| AppError::Internal(format!("embedding task failed: {}", e)))?
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Fastembed cross-encoder backend, lazily initialized.
pub struct FastembedReranker {
    model: RerankerModel,
    id: String,
    handle: OnceCell<Arc<Mutex<TextRerank>>>,
}

impl FastembedReranker {
    /// Create a backend for `model`.
    pub fn new(model: RerankerModel, id: impl Into<String>) -> Self {
        Self {
            model,
            id: id.into(),
            handle: OnceCell::new(),
        }
    }

    /// The default pairing: bge-reranker-base.
    pub fn bge_base() -> Self {
        Self::new(RerankerModel::BGERerankerBase, "bge-reranker-base")
    }

    async fn model(&self) -> Result<Arc<Mutex<TextRerank>>> {
        self.handle
            .get_or_try_init(|| async {
                let model = self.model.clone();
                tokio::task::spawn_blocking(move || {
                    let reranker = TextRerank::try_new(
                        RerankInitOptions::new(model).with_show_download_progress(false),
                    )
                    .map_err(|e| AppError::Internal(format!("failed to load reranker: {}", e)))?;
                    Ok(Arc::new(Mutex::new(reranker)))
                })
                .await
                .map_err(|e| AppError::Internal(format!("reranker init task failed: {}", e)))?
            })
            .await
            .map(Arc::clone)
    }
}

#[async_trait]
impl RerankBackend for FastembedReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model().await?;
        let query = query.to_string();
        let documents: Vec<String> = documents.to_vec();
        let count = documents.len();

        let scored = tokio::task::spawn_blocking(move || {
            let mut model = model.blocking_lock();
            model
                .rerank(query, &documents, true, None)
                .map_err(|e| AppError::Internal(format!("reranking failed: {}", e)))
        })
        .await
        .map_err(|e| AppError::Internal(format!("rerank task failed: {}", e)))??;

        // Scores come back ranked; restore input order.
        let mut scores = vec![0.0f32; count];
        for result in scored {
            if result.index < count {
                scores[result.index] = result.score;
            }
        }
        Ok(scores)
    }

    fn id(&self) -> &str {
        &self.id
    }
}
