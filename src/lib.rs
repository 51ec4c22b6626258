//! # SAGE - Strategy-Adaptive Grounded Engine
//!
//! An adaptive retrieval-augmented question-answering server. A classifier
//! and a Thompson-sampling bandit pick among four retrieval strategies
//! (hybrid, iterative self-reflective, graph, table), answers flow through
//! a three-layer semantic cache, and every request carries a risk-tiered
//! governance audit trail. User feedback closes the learning loop.
//!
//! ## Usage
//!
//! SAGE runs as a standalone server (the `sage-server` binary) or embeds
//! as a library:
//!
//! ```rust,ignore
//! use sage::{AppState, Config, types::AskRequest};
//!
//! let config = Config::from_env()?;
//! let state = AppState::from_config(&config).await?;
//! let response = state.pipeline.ask(AskRequest::new("Who wrote it?")).await?;
//! println!("{}", response.answer);
//! ```
//!
//! ## Modules
//!
//! - [`rag`] - the adaptive core: classifier, bandit router, strategies,
//!   caches, feedback
//! - [`db`] - vector index client and seed bootstrap
//! - [`llm`] - chat-completion client abstraction
//! - [`governance`] - risk-tiered audit tracking
//! - [`api`] - Axum route table and handlers
//! - [`types`] - requests, responses, errors

#![warn(missing_docs)]

/// HTTP API handlers and routes.
pub mod api;
/// Vector index client and bootstrap seeding.
pub mod db;
/// Governance tracking (risk tiers, checkpoints, audit summaries).
pub mod governance;
/// LLM provider clients and abstractions.
pub mod llm;
/// The adaptive RAG core.
pub mod rag;
/// Core types (requests, responses, errors).
pub mod types;
/// Configuration utilities.
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

pub use rag::{RagPipeline, StrategyArm};
pub use types::{AppError, Result};
pub use utils::Config;

use db::index::{MemoryIndex, VectorIndex};
use llm::{LlmClient, OpenAiClient};
use rag::classification_cache::ClassificationCache;
use rag::embedding::{
    HashingEmbedder, LexicalReranker, ModelAdapter, ModelPair, RemoteEmbeddingBackend,
    RemoteRerankBackend,
};
use rag::strategies::graph_rag::{GraphConfig, GraphRag};
use rag::strategies::hybrid_rag::HybridStrategy;
use rag::strategies::self_rag::{SelfRagConfig, SelfRagStrategy};
use rag::strategies::{SpreadsheetAnalyzer, TableRag};
use rag::{
    AnswerCache, FeedbackService, HybridRetriever, QueryClassifier, QueryHistory, StrategyRouter,
};

/// Application state shared across handlers.
///
/// The single typed handle to all process-wide state; tests inject
/// replacements through [`AppState::build`].
#[derive(Clone)]
pub struct AppState {
    /// The RAG facade.
    pub pipeline: Arc<RagPipeline>,
    /// The feedback service.
    pub feedback: Arc<FeedbackService>,
    /// Classification cache (exposed for stats).
    pub classification_cache: Arc<ClassificationCache>,
}

impl AppState {
    /// Wire the full state from explicit components. This is the seam used
    /// by tests and embedders; [`AppState::from_config`] provides the
    /// default wiring.
    pub async fn build(
        config: &Config,
        llm: Arc<dyn LlmClient>,
        index: Arc<dyn VectorIndex>,
        models: Arc<ModelAdapter>,
        analyzer: Option<Arc<dyn SpreadsheetAnalyzer>>,
    ) -> Result<Self> {
        let collection = config.index.collection.clone();
        index
            .ensure_collection(&collection, models.dimensions())
            .await?;

        let llm_deadline = Duration::from_secs(config.llm.request_timeout_secs);

        let retriever = Arc::new(HybridRetriever::new(
            index.clone(),
            models.clone(),
            collection.clone(),
            Some(config.index.bm25_cache_file(&collection)),
            config.strategies.hybrid_alpha,
        ));

        let classification_cache = Arc::new(ClassificationCache::new(Some(
            config.index.classification_cache_file(),
        )));
        let classifier = Arc::new(QueryClassifier::new(classification_cache.clone()));

        let router = Arc::new(StrategyRouter::load(
            config.bandit.enabled,
            &config.index.bandit_state_file(),
            &config.index.default_bandit_state_file(),
        ));

        let answer_cache = Arc::new(AnswerCache::new(
            models.clone(),
            config.cache.semantic_threshold,
            config.cache.tfidf_threshold,
            config.cache.max_cache_size,
            config.cache.ttl_hours,
        ));

        let governance = Arc::new(governance::GovernanceTracker::new());
        let history = Arc::new(QueryHistory::default());

        let hybrid = Arc::new(HybridStrategy::new(retriever.clone(), models.clone()));
        let self_rag = Arc::new(SelfRagStrategy::new(
            hybrid.clone(),
            SelfRagConfig {
                max_iterations: config.strategies.max_iterations,
                confidence_threshold: config.strategies.confidence_threshold,
                min_improvement: config.strategies.min_improvement,
                llm_deadline,
            },
        ));
        let graph = Arc::new(GraphRag::new(
            index.clone(),
            models.clone(),
            collection.clone(),
            GraphConfig {
                max_jit_chunks: config.strategies.graph_max_jit_chunks,
                batch_size: config.strategies.graph_batch_size,
                batch_timeout: Duration::from_secs(config.strategies.graph_batch_timeout_secs),
                max_hops: config.strategies.graph_max_hops,
                llm_deadline,
            },
        ));
        let table = Arc::new(TableRag::new(
            retriever.clone(),
            models.clone(),
            analyzer,
            llm_deadline,
        ));

        let pipeline = Arc::new(RagPipeline::new(
            llm,
            models,
            index,
            retriever,
            classifier,
            router.clone(),
            answer_cache.clone(),
            governance,
            history.clone(),
            hybrid,
            self_rag,
            graph,
            table,
            collection,
            config.bandit.latency_budget_ms,
            llm_deadline,
        ));

        let feedback = Arc::new(FeedbackService::new(history, router, answer_cache));

        Ok(Self {
            pipeline,
            feedback,
            classification_cache,
        })
    }

    /// Default wiring: OpenAI-compatible LLM, in-memory vector index, and
    /// a remote model pair with a fast deterministic fallback pair.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
            config.llm.api_base.clone(),
            config.llm.api_key.clone(),
            config.llm.model.clone(),
        ));

        let primary = ModelPair {
            embed: Arc::new(RemoteEmbeddingBackend::new(
                config.models.embed_url.clone(),
                "remote-embed",
                config.models.embedding_dim,
            )),
            rerank: Arc::new(RemoteRerankBackend::new(
                config.models.rerank_url.clone(),
                "remote-rerank",
            )),
        };
        let fallback = ModelPair {
            embed: Arc::new(HashingEmbedder::new(config.models.embedding_dim)),
            rerank: Arc::new(LexicalReranker),
        };
        let models = Arc::new(ModelAdapter::new(
            primary,
            Some(fallback),
            config.models.rerank_latency_threshold_ms,
        ));

        let index: Arc<dyn VectorIndex> = Arc::new(MemoryIndex::new());

        Self::build(config, llm, index, models, None).await
    }
}
