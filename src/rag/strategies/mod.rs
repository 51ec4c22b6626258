//! Retrieval strategies selectable by the router.
//!
//! Each strategy turns a question into a `StrategyOutcome`: answer text,
//! citations, confidence, and accounting. The facade owns everything
//! around them (caching, governance, bandit updates).

pub mod graph_rag;
pub mod hybrid_rag;
pub mod self_rag;
pub mod table_rag;

pub use graph_rag::GraphRag;
pub use hybrid_rag::{HybridParams, HybridStrategy};
pub use self_rag::SelfRagStrategy;
pub use table_rag::{SpreadsheetAnalyzer, SpreadsheetReport, TableRag};

use crate::types::{Citation, Timings, TokenUsage};

/// Result of one strategy execution.
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    /// Answer text.
    pub answer: String,
    /// Citations backing the answer (may be empty for graph/table answers).
    pub citations: Vec<Citation>,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Chunks (or graph entities) backing the answer.
    pub num_chunks_retrieved: usize,
    /// Retrieval wall time in milliseconds.
    pub retrieval_time_ms: f64,
    /// LLM wall time in milliseconds.
    pub llm_time_ms: f64,
    /// Accumulated token usage; `None` when no LLM ran.
    pub token_usage: Option<TokenUsage>,
    /// Strategy-specific timing map.
    pub timings: Timings,
}

impl StrategyOutcome {
    /// Outcome for an empty retrieval: canned answer, zero confidence,
    /// still a success.
    pub fn no_information() -> Self {
        Self {
            answer: "I could not find relevant information in the indexed documents to answer \
                     this question."
                .to_string(),
            citations: Vec::new(),
            confidence: 0.0,
            num_chunks_retrieved: 0,
            retrieval_time_ms: 0.0,
            llm_time_ms: 0.0,
            token_usage: None,
            timings: Timings::new(),
        }
    }
}
