//! Hybrid RAG strategy: fused retrieval followed by grounded generation.
//!
//! The pipeline: embed the question, run the hybrid retriever, take the
//! top chunks as context, prompt the LLM for an answer with `[1]..[n]`
//! citations, and report the top retrieved score as confidence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::llm::{ChatMessage, ChatOptions, LlmClient};
use crate::rag::embedding::ModelAdapter;
use crate::rag::hybrid::{HybridOptions, HybridRetriever};
use crate::rag::strategies::StrategyOutcome;
use crate::types::{Citation, Result, RetrievedChunk, Timings};

/// At most this many chunks enter the LLM context window.
const MAX_CONTEXT_CHUNKS: usize = 30;

/// Parameters resolved from the classifier plus request knobs.
#[derive(Debug, Clone)]
pub struct HybridParams {
    /// Chunks to retrieve.
    pub top_k: usize,
    /// Fusion weight override.
    pub alpha: Option<f32>,
    /// Vector candidate cap override.
    pub vector_limit: Option<usize>,
    /// Per-chunk character cap for LLM context.
    pub content_char_limit: Option<usize>,
    /// Apply the cross-encoder after fusion.
    pub rerank: bool,
    /// Run answer generation; `false` retrieves only (used by the
    /// iterative strategy's follow-up rounds).
    pub generate_answer: bool,
    /// Deadline for the generation call.
    pub llm_deadline: Duration,
}

impl Default for HybridParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            alpha: None,
            vector_limit: None,
            content_char_limit: None,
            rerank: true,
            generate_answer: true,
            llm_deadline: Duration::from_secs(60),
        }
    }
}

/// End-to-end hybrid question answering.
pub struct HybridStrategy {
    retriever: Arc<HybridRetriever>,
    models: Arc<ModelAdapter>,
}

impl HybridStrategy {
    /// Create the strategy over shared retrieval components.
    pub fn new(retriever: Arc<HybridRetriever>, models: Arc<ModelAdapter>) -> Self {
        Self { retriever, models }
    }

    /// Build the grounded-answer prompt over numbered excerpts.
    fn build_prompt(question: &str, chunks: &[RetrievedChunk], char_limit: Option<usize>) -> String {
        let mut context = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let text = match char_limit {
                Some(limit) if chunk.text.len() > limit => {
                    let end = chunk
                        .text
                        .char_indices()
                        .nth(limit)
                        .map(|(idx, _)| idx)
                        .unwrap_or(chunk.text.len());
                    &chunk.text[..end]
                }
                _ => chunk.text.as_str(),
            };
            context.push_str(&format!("[{}] ({})\n{}\n\n", i + 1, chunk.source, text));
        }

        format!(
            "Answer the question using ONLY the context excerpts below. \
             Cite the excerpts you used as [1]..[{n}]. If the context does not \
             contain the answer, say so.\n\n\
             Context:\n{context}\n\
             Question: {question}\n\n\
             Answer:",
            n = chunks.len(),
        )
    }

    /// Run the full pipeline for `question`.
    pub async fn run(
        &self,
        llm: &dyn LlmClient,
        question: &str,
        params: &HybridParams,
    ) -> Result<StrategyOutcome> {
        let total_start = Instant::now();
        let mut timings = Timings::new();

        let embed_start = Instant::now();
        let query_vector = self.models.embed_one(question).await?;
        let embed_ms = embed_start.elapsed().as_secs_f64() * 1000.0;

        let options = HybridOptions {
            top_k: params.top_k,
            alpha: params.alpha,
            vector_limit: params.vector_limit,
            rerank: params.rerank,
        };
        let (chunks, retrieval_timings) = self
            .retriever
            .search(question, &query_vector, &options)
            .await?;

        timings.insert("embed_ms".into(), embed_ms.into());
        timings.insert("vector_ms".into(), retrieval_timings.vector_ms.into());
        timings.insert("bm25_ms".into(), retrieval_timings.bm25_ms.into());
        timings.insert(
            "candidate_prep_ms".into(),
            retrieval_timings.fusion_ms.into(),
        );
        timings.insert("rerank_ms".into(), retrieval_timings.rerank_ms.into());

        let retrieval_time_ms = embed_ms
            + retrieval_timings.vector_ms
            + retrieval_timings.bm25_ms
            + retrieval_timings.fusion_ms
            + retrieval_timings.rerank_ms;

        if chunks.is_empty() {
            let mut outcome = StrategyOutcome::no_information();
            timings.insert(
                "end_to_end_ms".into(),
                (total_start.elapsed().as_secs_f64() * 1000.0).into(),
            );
            outcome.retrieval_time_ms = retrieval_time_ms;
            outcome.timings = timings;
            return Ok(outcome);
        }

        let confidence = chunks
            .iter()
            .map(|c| c.score)
            .fold(f32::MIN, f32::max)
            .clamp(0.0, 1.0);
        let citations: Vec<Citation> = chunks.iter().map(Citation::from_chunk).collect();
        let num_chunks = chunks.len();

        if !params.generate_answer {
            timings.insert(
                "end_to_end_ms".into(),
                (total_start.elapsed().as_secs_f64() * 1000.0).into(),
            );
            return Ok(StrategyOutcome {
                answer: String::new(),
                citations,
                confidence,
                num_chunks_retrieved: num_chunks,
                retrieval_time_ms,
                llm_time_ms: 0.0,
                token_usage: None,
                timings,
            });
        }

        let context_chunks = &chunks[..chunks.len().min(MAX_CONTEXT_CHUNKS)];
        let prompt = Self::build_prompt(question, context_chunks, params.content_char_limit);
        let messages = [
            ChatMessage::system(
                "You are a careful assistant that answers strictly from the provided context \
                 and cites its sources.",
            ),
            ChatMessage::user(prompt),
        ];

        let llm_start = Instant::now();
        let completion = llm
            .complete(
                &messages,
                &ChatOptions {
                    temperature: 0.2,
                    max_tokens: Some(700),
                    json_mode: false,
                    deadline: params.llm_deadline,
                },
            )
            .await?;
        let llm_time_ms = llm_start.elapsed().as_secs_f64() * 1000.0;

        timings.insert("llm_ms".into(), llm_time_ms.into());
        timings.insert(
            "end_to_end_ms".into(),
            (total_start.elapsed().as_secs_f64() * 1000.0).into(),
        );

        Ok(StrategyOutcome {
            answer: completion.content,
            citations,
            confidence,
            num_chunks_retrieved: num_chunks,
            retrieval_time_ms,
            llm_time_ms,
            token_usage: Some(completion.usage),
            timings,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provenance;
    use std::collections::HashMap;

    fn chunk(id: &str, text: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.to_string(),
            text: text.to_string(),
            source: format!("src-{}", id),
            score,
            bm25_score: 0.0,
            vector_score: score,
            fused_score: score,
            provenance: Provenance::Hybrid,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_prompt_numbers_excerpts() {
        let chunks = vec![chunk("a", "first text", 0.9), chunk("b", "second text", 0.5)];
        let prompt = HybridStrategy::build_prompt("What?", &chunks, None);
        assert!(prompt.contains("[1] (src-a)"));
        assert!(prompt.contains("[2] (src-b)"));
        assert!(prompt.contains("[1]..[2]"));
    }

    #[test]
    fn test_prompt_respects_char_limit() {
        let chunks = vec![chunk("a", &"x".repeat(500), 0.9)];
        let prompt = HybridStrategy::build_prompt("What?", &chunks, Some(100));
        assert!(prompt.matches('x').count() <= 100);
    }

    #[test]
    fn test_no_information_outcome() {
        let outcome = StrategyOutcome::no_information();
        assert_eq!(outcome.confidence, 0.0);
        assert_eq!(outcome.num_chunks_retrieved, 0);
        assert!(outcome.citations.is_empty());
        assert!(outcome.answer.contains("could not find"));
    }
}
