//! The adaptive RAG core.
//!
//! Components, roughly in request order:
//!
//! - [`classifier`] / [`classification_cache`] - query typing with a
//!   two-tier memo
//! - [`router`] - Thompson-sampling bandit over the four strategy arms
//! - [`embedding`] - embedding/rerank model adapter with hot-swap
//! - [`bm25`] / [`tfidf`] / [`hybrid`] - keyword scoring and fused retrieval
//! - [`strategies`] - the four answerers (hybrid, iterative, graph, table)
//! - [`answer_cache`] - three-layer semantic answer cache
//! - [`history`] / [`feedback`] - query correlation and the feedback loop
//! - [`pipeline`] - the facade exposing `ask`

pub mod answer_cache;
pub mod bm25;
pub mod classification_cache;
pub mod classifier;
pub mod embedding;
#[cfg(feature = "local-embeddings")]
pub mod embedding_local;
pub mod feedback;
pub mod history;
pub mod hybrid;
pub mod pipeline;
pub mod router;
pub mod strategies;
pub mod tfidf;

pub use answer_cache::AnswerCache;
pub use classification_cache::ClassificationCache;
pub use classifier::QueryClassifier;
pub use embedding::ModelAdapter;
pub use feedback::FeedbackService;
pub use history::QueryHistory;
pub use hybrid::HybridRetriever;
pub use pipeline::RagPipeline;
pub use router::{StrategyArm, StrategyRouter};
