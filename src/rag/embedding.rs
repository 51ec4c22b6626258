//! Embedding and rerank model adapter.
//!
//! Uniform async facade over the embedding and cross-encoder backends with
//! hot-swap between a high-accuracy primary pair and a fast fallback pair.
//! Embeddings come back L2-normalized so dot product equals cosine
//! similarity; rerank scores come back in input order and are only used
//! for sorting.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::rag::classifier::QueryDifficulty;
use crate::types::{AppError, Result};

// ============================================================================
// Backend Traits
// ============================================================================

/// Text embedding backend.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed a batch of texts. Output vectors need not be normalized;
    /// the adapter normalizes.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Stable backend identifier.
    fn id(&self) -> &str;

    /// Output dimension.
    fn dimensions(&self) -> usize;
}

/// Cross-encoder rerank backend.
#[async_trait]
pub trait RerankBackend: Send + Sync {
    /// Score `documents` against `query`, one score per document, in input
    /// order. Scores are not required to lie in [0, 1].
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;

    /// Stable backend identifier.
    fn id(&self) -> &str;
}

/// An embedding backend paired with its matching reranker.
#[derive(Clone)]
pub struct ModelPair {
    /// Embedding side of the pair.
    pub embed: Arc<dyn EmbeddingBackend>,
    /// Rerank side of the pair.
    pub rerank: Arc<dyn RerankBackend>,
}

// ============================================================================
// Mode
// ============================================================================

/// Model selection mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelMode {
    /// Difficulty-driven pair selection.
    Auto,
    /// Pin the high-accuracy pair.
    Primary,
    /// Pin the fast fallback pair.
    Fallback,
    /// Pin a pair by backend id.
    Custom(String),
    /// Pin whatever remote pair is configured (alias of primary here).
    Remote,
}

impl FromStr for ModelMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "primary" => Ok(Self::Primary),
            "fallback" => Ok(Self::Fallback),
            "remote" => Ok(Self::Remote),
            other if !other.is_empty() => Ok(Self::Custom(other.to_string())),
            _ => Err(AppError::InvalidInput("empty model mode".into())),
        }
    }
}

/// Normalize a vector in place to unit length.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Facade over the model pairs with adaptive switching.
pub struct ModelAdapter {
    primary: ModelPair,
    fallback: Option<ModelPair>,
    mode: RwLock<ModelMode>,
    /// Auto-mode suggestion: use the fast pair for simple queries.
    prefer_fast: AtomicBool,
    /// One-shot escalation: primary reranker was too slow, stay on fallback.
    rerank_latched: AtomicBool,
    rerank_latency_threshold_ms: f64,
}

impl ModelAdapter {
    /// Create an adapter over a primary pair and an optional fast fallback.
    pub fn new(
        primary: ModelPair,
        fallback: Option<ModelPair>,
        rerank_latency_threshold_ms: f64,
    ) -> Self {
        Self {
            primary,
            fallback,
            mode: RwLock::new(ModelMode::Auto),
            prefer_fast: AtomicBool::new(false),
            rerank_latched: AtomicBool::new(false),
            rerank_latency_threshold_ms,
        }
    }

    fn resolve_pair(&self, for_rerank: bool) -> ModelPair {
        if for_rerank && self.rerank_latched.load(Ordering::Relaxed) {
            if let Some(fallback) = &self.fallback {
                return fallback.clone();
            }
        }

        let mode = self.mode.read().clone();
        match mode {
            ModelMode::Primary | ModelMode::Remote => self.primary.clone(),
            ModelMode::Fallback => self.fallback.clone().unwrap_or_else(|| self.primary.clone()),
            ModelMode::Custom(id) => {
                if let Some(fallback) = &self.fallback {
                    if fallback.embed.id() == id || fallback.rerank.id() == id {
                        return fallback.clone();
                    }
                }
                self.primary.clone()
            }
            ModelMode::Auto => {
                if self.prefer_fast.load(Ordering::Relaxed) {
                    if let Some(fallback) = &self.fallback {
                        return fallback.clone();
                    }
                }
                self.primary.clone()
            }
        }
    }

    /// Embed texts, retrying once on a transient failure, and return
    /// unit-normalized vectors.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let backend = self.resolve_pair(false).embed;

        let mut vectors = match backend.embed(texts).await {
            Err(AppError::LlmTransient(msg)) => {
                tracing::warn!(error = %msg, backend = backend.id(), "transient embed failure, retrying once");
                backend.embed(texts).await?
            }
            other => other?,
        };

        for vector in &mut vectors {
            l2_normalize(vector);
        }
        Ok(vectors)
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(std::slice::from_ref(&text.to_string()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Internal("embedding backend returned no vector".into()))
    }

    /// Rerank documents, retrying once on a transient failure.
    ///
    /// If the primary reranker overruns the configured latency threshold and
    /// a fallback pair exists, the adapter latches onto the fallback for the
    /// rest of the process.
    pub async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let pair = self.resolve_pair(true);
        let on_primary = pair.rerank.id() == self.primary.rerank.id();

        let start = Instant::now();
        let scores = match pair.rerank.rerank(query, documents).await {
            Err(AppError::LlmTransient(msg)) => {
                tracing::warn!(error = %msg, backend = pair.rerank.id(), "transient rerank failure, retrying once");
                pair.rerank.rerank(query, documents).await?
            }
            other => other?,
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        if on_primary
            && self.fallback.is_some()
            && elapsed_ms > self.rerank_latency_threshold_ms
            && !self.rerank_latched.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                elapsed_ms,
                threshold_ms = self.rerank_latency_threshold_ms,
                "primary reranker over latency threshold, latching onto fallback"
            );
        }

        Ok(scores)
    }

    /// Identifier of the currently selected embedding backend.
    pub fn current_embed_id(&self) -> String {
        self.resolve_pair(false).embed.id().to_string()
    }

    /// Identifier of the currently selected rerank backend.
    pub fn current_rerank_id(&self) -> String {
        self.resolve_pair(true).rerank.id().to_string()
    }

    /// Embedding dimension of the currently selected backend.
    pub fn dimensions(&self) -> usize {
        self.resolve_pair(false).embed.dimensions()
    }

    /// Switch mode. Manual overrides latch until reset to `Auto`; switching
    /// back to `Auto` also clears the rerank escalation latch.
    pub fn switch(&self, mode: ModelMode) {
        if mode == ModelMode::Auto {
            self.rerank_latched.store(false, Ordering::Relaxed);
        }
        tracing::info!(?mode, "model adapter mode switch");
        *self.mode.write() = mode;
    }

    /// Feed a difficulty classification into auto mode. Only switches when
    /// the suggestion differs from the current selection; in-flight requests
    /// keep the pair they started with.
    pub fn apply_difficulty(&self, difficulty: QueryDifficulty) {
        if *self.mode.read() != ModelMode::Auto || self.fallback.is_none() {
            return;
        }
        let want_fast = difficulty == QueryDifficulty::Simple;
        let was = self.prefer_fast.swap(want_fast, Ordering::Relaxed);
        if was != want_fast {
            tracing::debug!(
                ?difficulty,
                fast_pair = want_fast,
                "auto mode switched model pair"
            );
        }
    }
}

// ============================================================================
// Remote Backends
// ============================================================================

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embedding backend over a remote HTTP service.
pub struct RemoteEmbeddingBackend {
    http: reqwest::Client,
    url: String,
    id: String,
    dimensions: usize,
}

impl RemoteEmbeddingBackend {
    /// Create a backend posting to `url`.
    pub fn new(url: impl Into<String>, id: impl Into<String>, dimensions: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            id: id.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingBackend for RemoteEmbeddingBackend {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .http
            .post(&self.url)
            .json(&EmbedRequest { texts })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    AppError::LlmTransient(format!("embedding service: {}", e))
                } else {
                    AppError::Internal(format!("embedding service: {}", e))
                }
            })?;

        if !response.status().is_success() {
            return Err(AppError::Internal(format!(
                "embedding service returned {}",
                response.status()
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("malformed embedding response: {}", e)))?;
        Ok(parsed.embeddings)
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

/// Rerank backend over a remote HTTP service.
pub struct RemoteRerankBackend {
    http: reqwest::Client,
    url: String,
    id: String,
}

impl RemoteRerankBackend {
    /// Create a backend posting to `url`.
    pub fn new(url: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            id: id.into(),
        }
    }
}

#[async_trait]
impl RerankBackend for RemoteRerankBackend {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let response = self
            .http
            .post(&self.url)
            .json(&RerankRequest { query, documents })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    AppError::LlmTransient(format!("rerank service: {}", e))
                } else {
                    AppError::Internal(format!("rerank service: {}", e))
                }
            })?;

        if !response.status().is_success() {
            return Err(AppError::Internal(format!(
                "rerank service returned {}",
                response.status()
            )));
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("malformed rerank response: {}", e)))?;
        Ok(parsed.scores)
    }

    fn id(&self) -> &str {
        &self.id
    }
}

// ============================================================================
// Deterministic Local Backends
// ============================================================================

/// Feature-hashing embedder: deterministic, dependency-free, usable when no
/// model service is configured and in tests.
pub struct HashingEmbedder {
    dimensions: usize,
    id: String,
}

impl HashingEmbedder {
    /// Create an embedder producing `dimensions`-sized vectors.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            id: format!("hashing-{}d", dimensions),
        }
    }

    fn bucket(&self, term: &str) -> (usize, f32) {
        let mut hasher = DefaultHasher::new();
        term.hash(&mut hasher);
        let h = hasher.finish();
        let idx = (h % self.dimensions as u64) as usize;
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        (idx, sign)
    }
}

#[async_trait]
impl EmbeddingBackend for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let mut vector = vec![0.0f32; self.dimensions];
            let tokens: Vec<String> = text
                .to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
            for token in &tokens {
                let (idx, sign) = self.bucket(token);
                vector[idx] += sign;
            }
            for pair in tokens.windows(2) {
                let (idx, sign) = self.bucket(&pair.join(" "));
                vector[idx] += sign * 0.5;
            }
            out.push(vector);
        }
        Ok(out)
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Token-overlap reranker: deterministic companion to `HashingEmbedder`.
pub struct LexicalReranker;

#[async_trait]
impl RerankBackend for LexicalReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let query_tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(String::from)
            .collect();

        Ok(documents
            .iter()
            .map(|doc| {
                let doc_lower = doc.to_lowercase();
                let hits = query_tokens
                    .iter()
                    .filter(|t| doc_lower.contains(t.as_str()))
                    .count();
                if query_tokens.is_empty() {
                    0.0
                } else {
                    hits as f32 / query_tokens.len() as f32
                }
            })
            .collect())
    }

    fn id(&self) -> &str {
        "lexical-overlap"
    }
}

// ============================================================================
// Tests
// ============================================================================
