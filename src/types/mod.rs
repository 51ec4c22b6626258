//! Core types used throughout the SAGE server.
//!
//! This module contains the common data structures used for:
//! - Ask requests and responses (the public RAG contract)
//! - Retrieved chunks and citations
//! - Token accounting
//! - User feedback
//! - Error handling

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::governance::GovernanceSummary;

/// Free-form timing map attached to responses when `include_timings` is set.
///
/// Strategies record their own keys (`embed_ms`, `vector_ms`, `rerank_ms`,
/// `llm_ms`, `iterations`, `graph_context`, ...) so the shape is a JSON map.
pub type Timings = serde_json::Map<String, serde_json::Value>;

// ============= Query Classification Types =============

/// Classified query type driving strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Simple factual lookup; answered well by a single hybrid pass.
    FactualDetail,
    /// Deep analysis or explanation; benefits from iterative refinement.
    ComplexAnalysis,
    /// Question about connections between entities; routed to the graph.
    RelationshipQuery,
    /// List/compare/aggregate request; routed to the table strategy.
    StructuredData,
    /// Anything else; all strategies remain available.
    General,
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::FactualDetail => "factual_detail",
            Self::ComplexAnalysis => "complex_analysis",
            Self::RelationshipQuery => "relationship_query",
            Self::StructuredData => "structured_data",
            Self::General => "general",
        };
        write!(f, "{}", name)
    }
}

// ============= Retrieval Types =============

/// Which retrieval pass produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// Dense vector similarity search.
    Vector,
    /// BM25 keyword scoring.
    Bm25,
    /// Weighted fusion of vector and BM25.
    Hybrid,
    /// Seed chunk used to build the entity graph.
    GraphSeed,
    /// Table strategy retrieval.
    Table,
    /// Whole-file fallback when chunk retrieval came up empty.
    FileLevelFallback,
}

/// A chunk returned by a retrieval pass, decorated with its scores.
///
/// Transient: exists only within a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    /// Vector-index point id.
    pub chunk_id: String,
    /// Chunk text.
    pub text: String,
    /// Source label (document title, path, or collection tag).
    pub source: String,
    /// Final score used for ordering (fused or rerank score).
    pub score: f32,
    /// BM25 contribution (min-max normalized within the candidate set).
    #[serde(default)]
    pub bm25_score: f32,
    /// Vector similarity contribution.
    #[serde(default)]
    pub vector_score: f32,
    /// Weighted fusion of the two.
    #[serde(default)]
    pub fused_score: f32,
    /// Which pass produced this chunk.
    pub provenance: Provenance,
    /// Payload metadata carried through from the index.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A citation attached to an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    /// Source label of the cited chunk.
    pub source: String,
    /// Cited text content.
    pub content: String,
    /// Retrieval score of the cited chunk.
    pub score: f32,
    /// Optional chunk metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl Citation {
    /// Build a citation from a retrieved chunk.
    pub fn from_chunk(chunk: &RetrievedChunk) -> Self {
        Self {
            source: chunk.source.clone(),
            content: chunk.text.clone(),
            score: chunk.score,
            metadata: if chunk.metadata.is_empty() {
                None
            } else {
                Some(chunk.metadata.clone())
            },
        }
    }
}

// ============= Token Accounting =============

/// Token usage reported (or estimated) for LLM calls.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub prompt: u64,
    /// Completion tokens.
    pub completion: u64,
    /// Total tokens.
    pub total: u64,
    /// True when the numbers were estimated (streaming without usage).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub estimated: bool,
}

impl TokenUsage {
    /// Sum another usage record into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
        self.estimated |= other.estimated;
    }
}

/// One section of the per-request token breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenBreakdownEntry {
    /// Total tokens consumed by this phase.
    pub tokens: u64,
    /// Prompt tokens.
    pub prompt_tokens: u64,
    /// Completion tokens.
    pub completion_tokens: u64,
    /// Estimated cost in USD.
    pub cost: f64,
    /// Whether an LLM call happened in this phase.
    pub llm_used: bool,
    /// How this phase was satisfied (llm, keyword, exact_cache, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Whether this phase was served from a cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

/// Token breakdown attached to every ask response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenBreakdown {
    /// Classification phase accounting.
    pub query_classification: TokenBreakdownEntry,
    /// Answer-cache lookup accounting (embedding lookups count no tokens).
    pub answer_cache_lookup: TokenBreakdownEntry,
    /// Answer generation accounting.
    pub answer_generation: TokenBreakdownEntry,
    /// Totals across all phases.
    pub total: TokenBreakdownEntry,
}

// ============= Ask Request/Response =============

/// Request payload for the ask endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    /// The user's question.
    pub question: String,
    /// Number of chunks to retrieve (strategy default when absent).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    /// Include a detailed timing breakdown in the response.
    #[serde(default)]
    pub include_timings: bool,
    /// Reranker mode override (`auto`, `primary`, `fallback`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranker: Option<String>,
    /// Cap on vector-search candidates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_limit: Option<usize>,
    /// Cap on characters taken from each chunk for LLM context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_char_limit: Option<usize>,
    /// Optional request metadata, echoed into the audit trail.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AskRequest {
    /// Build a request with only a question and defaults for every knob.
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            top_k: None,
            include_timings: false,
            reranker: None,
            vector_limit: None,
            content_char_limit: None,
            metadata: HashMap::new(),
        }
    }
}

/// Response from the ask endpoint: the public RAG contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    /// Grounded answer text. Empty on failure.
    pub answer: String,
    /// Ordered citations backing the answer.
    pub citations: Vec<Citation>,
    /// Id to correlate later feedback with this response.
    pub query_id: String,
    /// Human-readable strategy name (`Hybrid RAG`, `Graph RAG`, ...).
    pub selected_strategy: String,
    /// Why the router picked that strategy.
    pub strategy_reason: String,
    /// Answer confidence in [0, 1].
    pub confidence: f32,
    /// How many chunks retrieval produced.
    pub num_chunks_retrieved: usize,
    /// Retrieval wall time in milliseconds.
    pub retrieval_time_ms: f64,
    /// LLM wall time in milliseconds.
    pub llm_time_ms: f64,
    /// End-to-end wall time in milliseconds.
    pub total_time_ms: f64,
    /// Detailed timing breakdown when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timings: Option<Timings>,
    /// Models involved in producing this answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<HashMap<String, String>>,
    /// LLM token usage; `None` for cache hits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    /// Estimated LLM cost in USD.
    pub token_cost_usd: f64,
    /// Per-phase token accounting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_breakdown: Option<TokenBreakdown>,
    /// Whether the answer was served from the answer cache.
    pub cache_hit: bool,
    /// Which cache layer hit (1 = exact, 2 = keyword, 3 = semantic).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_layer: Option<u8>,
    /// Sealed governance summary for this operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub governance_context: Option<GovernanceSummary>,
    /// False when the pipeline failed upstream; the error field says why.
    #[serde(default = "default_success")]
    pub success: bool,
    /// Error category on failure (`llm_upstream`, `vector_store_unavailable`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_success() -> bool {
    true
}

// ============= Feedback Types =============

/// Request payload for user feedback on a previous answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    /// The `query_id` returned by ask.
    pub query_id: String,
    /// User rating in [0, 1].
    pub rating: f32,
    /// Optional free-text comment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Response from the feedback endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackResponse {
    /// Echo of the query id.
    pub query_id: String,
    /// Echo of the rating.
    pub rating: f32,
    /// Whether the rated strategy's record was annotated.
    pub strategy_updated: bool,
    /// Whether the bandit posteriors changed.
    pub bandit_updated: bool,
    /// Human-readable outcome.
    pub message: String,
}

// ============= Ingestion Boundary =============

/// A pre-chunked record submitted for indexing.
///
/// Chunking and file parsing happen upstream; this is the index boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Text content of the chunk.
    pub text: String,
    /// Source label.
    pub source: String,
    /// Logical document this chunk belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Ordinal of the chunk within its document.
    #[serde(default)]
    pub chunk_index: usize,
    /// Optional document title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Additional payload fields (authors, file_path, doc_type, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Request to ingest pre-chunked records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Records to embed and upsert.
    pub chunks: Vec<ChunkRecord>,
}

/// Response from ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Number of chunks upserted.
    pub chunks_indexed: usize,
    /// Collection they landed in.
    pub collection: String,
}

// ============= History =============

/// Per-query record kept in the bounded history ring for feedback routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Chosen strategy arm name, or `"cached"` for cache hits.
    pub strategy: String,
    /// Reward computed from the automated signals.
    pub automated_reward: f32,
    /// First 200 chars of the question.
    pub question: String,
    /// Whether the response came from the answer cache.
    pub is_cached: bool,
    /// Cache layer for cached responses.
    pub cache_layer: Option<u8>,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// User rating once feedback arrives; guards against double-counting.
    pub user_rating: Option<f32>,
}

// ============= Error Types =============

/// Application-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Malformed or out-of-range request knobs; rejected before any work.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Requested resource was not found (expired query id, missing collection).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Retryable LLM failure (rate limit, connection reset).
    #[error("LLM transient error: {0}")]
    LlmTransient(String),

    /// Non-retryable LLM failure (auth, content filter, bad request).
    #[error("LLM upstream error: {0}")]
    LlmUpstream(String),

    /// LLM call exceeded its deadline.
    #[error("LLM timeout: {0}")]
    LlmTimeout(String),

    /// Vector store operation failed.
    #[error("Vector store error: {0}")]
    VectorStore(String),

    /// External tool invocation failed.
    #[error("Tool error: {0}")]
    Tool(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable kind label, used in metrics and responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "input_validation",
            Self::NotFound(_) => "not_found",
            Self::LlmTransient(_) => "llm_transient",
            Self::LlmUpstream(_) => "llm_upstream",
            Self::LlmTimeout(_) => "llm_timeout",
            Self::VectorStore(_) => "vector_store_unavailable",
            Self::Tool(_) => "tool_failure",
            Self::Configuration(_) => "configuration",
            Self::Internal(_) => "internal",
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::LlmTransient(_) | AppError::LlmUpstream(_) => StatusCode::BAD_GATEWAY,
            AppError::LlmTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::VectorStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Tool(_) => StatusCode::BAD_GATEWAY,
            AppError::Configuration(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });

        (status, axum::Json(body)).into_response()
    }
}

/// A specialized Result type for SAGE operations.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_type_display() {
        assert_eq!(QueryType::FactualDetail.to_string(), "factual_detail");
        assert_eq!(QueryType::StructuredData.to_string(), "structured_data");
        assert_eq!(QueryType::General.to_string(), "general");
    }

    #[test]
    fn test_token_usage_add() {
        let mut a = TokenUsage {
            prompt: 10,
            completion: 5,
            total: 15,
            estimated: false,
        };
        let b = TokenUsage {
            prompt: 3,
            completion: 2,
            total: 5,
            estimated: true,
        };
        a.add(&b);
        assert_eq!(a.prompt, 13);
        assert_eq!(a.completion, 7);
        assert_eq!(a.total, 20);
        assert!(a.estimated);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(AppError::InvalidInput("x".into()).kind(), "input_validation");
        assert_eq!(
            AppError::VectorStore("down".into()).kind(),
            "vector_store_unavailable"
        );
        assert_eq!(AppError::LlmTimeout("8s".into()).kind(), "llm_timeout");
    }

    #[test]
    fn test_ask_request_roundtrip() {
        let req = AskRequest::new("Who wrote it?");
        let json = serde_json::to_string(&req).unwrap();
        let back: AskRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.question, "Who wrote it?");
        assert!(back.top_k.is_none());
        assert!(!back.include_timings);
    }
}
