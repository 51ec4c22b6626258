//! Iterative self-reflective retrieval.
//!
//! Bounded retrieve → answer → reflect loop. The first round is a full
//! hybrid pass; later rounds retrieve with a reflection-generated follow-up
//! query and re-answer with an incremental prompt that only ships the new
//! excerpts. The loop stops on confidence convergence, insufficient
//! improvement, or the iteration cap, returning the best answer seen.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::governance::GovernanceTracker;
use crate::llm::{strip_code_fences, ChatMessage, ChatOptions, LlmClient};
use crate::rag::strategies::hybrid_rag::{HybridParams, HybridStrategy};
use crate::rag::strategies::StrategyOutcome;
use crate::types::{AppError, Citation, Result, Timings, TokenUsage};

/// Timing keys summed across iterations for the aggregate report.
const AGGREGATED_TIMING_KEYS: &[&str] = &[
    "embed_ms",
    "vector_ms",
    "bm25_ms",
    "rerank_ms",
    "candidate_prep_ms",
];

/// Self-RAG loop configuration.
#[derive(Debug, Clone, Copy)]
pub struct SelfRagConfig {
    /// Iteration cap.
    pub max_iterations: usize,
    /// Confidence at which the loop converges.
    pub confidence_threshold: f32,
    /// Minimum confidence gain required to keep iterating.
    pub min_improvement: f32,
    /// Per-call LLM deadline.
    pub llm_deadline: Duration,
}

impl Default for SelfRagConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            confidence_threshold: 0.75,
            min_improvement: 0.05,
            llm_deadline: Duration::from_secs(60),
        }
    }
}

#[derive(Deserialize)]
struct Reflection {
    #[serde(default)]
    missing_info: String,
    #[serde(default)]
    follow_up_query: String,
}

/// Iterative retrieval strategy.
pub struct SelfRagStrategy {
    hybrid: Arc<HybridStrategy>,
    config: SelfRagConfig,
}

impl SelfRagStrategy {
    /// Create the strategy over the hybrid pipeline it iterates with.
    pub fn new(hybrid: Arc<HybridStrategy>, config: SelfRagConfig) -> Self {
        Self { hybrid, config }
    }

    /// Pull the first numeric token out of a confidence section.
    fn extract_number(text: &str) -> Option<f32> {
        let bytes = text.as_bytes();
        let mut start = None;
        for (i, b) in bytes.iter().enumerate() {
            if b.is_ascii_digit() {
                start = Some(i);
                break;
            }
        }
        let start = start?;
        let mut end = start;
        let mut seen_dot = false;
        while end < bytes.len() {
            match bytes[end] {
                b'0'..=b'9' => end += 1,
                b'.' if !seen_dot => {
                    seen_dot = true;
                    end += 1;
                }
                _ => break,
            }
        }
        text[start..end].parse().ok()
    }

    /// Parse the `**Answer:** / **Confidence:** / **Reasoning:**` format.
    /// Parse failures default the confidence to 0.5.
    pub fn parse_answer_and_confidence(content: &str) -> (String, f32) {
        let answer = content
            .split("**Answer:**")
            .nth(1)
            .map(|rest| {
                rest.split("**Confidence:**")
                    .next()
                    .unwrap_or(rest)
                    .trim()
                    .to_string()
            })
            .unwrap_or_else(|| content.trim().to_string());

        let confidence = content
            .split("**Confidence:**")
            .nth(1)
            .map(|rest| rest.split("**Reasoning:**").next().unwrap_or(rest))
            .and_then(Self::extract_number)
            .unwrap_or(0.5);

        (answer, confidence.clamp(0.0, 1.0))
    }

    async fn reflect(
        &self,
        llm: &dyn LlmClient,
        question: &str,
        current_answer: &str,
        confidence: f32,
        num_chunks: usize,
    ) -> (String, String, Option<TokenUsage>) {
        let prompt = format!(
            "You are analyzing why a retrieval system has low confidence answering a question.\n\n\
             Question: {question}\n\
             Current answer: {current_answer}\n\
             Confidence: {confidence:.2}\n\
             Context chunks analyzed: {num_chunks}\n\n\
             What specific information is missing, and what follow-up retrieval query would find it?\n\n\
             Respond in JSON:\n\
             {{\"missing_info\": \"...\", \"follow_up_query\": \"...\"}}"
        );
        let messages = [
            ChatMessage::system("You identify information gaps in retrieval results."),
            ChatMessage::user(prompt),
        ];

        match llm
            .complete(&messages, &ChatOptions::json(200, self.config.llm_deadline))
            .await
        {
            Ok(completion) => {
                match serde_json::from_str::<Reflection>(strip_code_fences(&completion.content)) {
                    Ok(reflection) if !reflection.follow_up_query.is_empty() => (
                        reflection.missing_info,
                        reflection.follow_up_query,
                        Some(completion.usage),
                    ),
                    _ => (
                        "Additional context or details".to_string(),
                        format!("{} details context", question),
                        Some(completion.usage),
                    ),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "reflection failed, expanding original question");
                (
                    "Additional context or details".to_string(),
                    format!("{} details context", question),
                    None,
                )
            }
        }
    }

    /// Answer with accumulated context, shipping only the new excerpts.
    async fn generate_incremental(
        &self,
        llm: &dyn LlmClient,
        question: &str,
        previous_answer: &str,
        total_chunks: usize,
        new_chunks: &[Citation],
    ) -> Result<(String, f32, TokenUsage)> {
        let previously = total_chunks - new_chunks.len();
        let mut new_context = String::new();
        for (offset, chunk) in new_chunks.iter().enumerate() {
            new_context.push_str(&format!(
                "[{}] ({})\n{}\n\n",
                previously + offset + 1,
                chunk.source,
                chunk.content
            ));
        }

        let prompt = format!(
            "Excerpts [1..{previously}] were available in earlier rounds; you have already seen \
             them. Newly retrieved excerpts:\n\n{new_context}\
             Question: {question}\n\n\
             Using everything retrieved so far, respond in exactly this format:\n\
             **Answer:** <your answer>\n\
             **Confidence:** <number between 0 and 1>\n\
             **Reasoning:** <one sentence>"
        );

        let messages = [
            ChatMessage::system(
                "You are a careful assistant refining an answer over multiple retrieval rounds.",
            ),
            ChatMessage::assistant(previous_answer.to_string()),
            ChatMessage::user(prompt),
        ];

        let completion = llm
            .complete(
                &messages,
                &ChatOptions {
                    temperature: 0.2,
                    max_tokens: Some(700),
                    json_mode: false,
                    deadline: self.config.llm_deadline,
                },
            )
            .await?;

        let (answer, confidence) = Self::parse_answer_and_confidence(&completion.content);
        Ok((answer, confidence, completion.usage))
    }

    /// Run the bounded reflection loop.
    pub async fn run(
        &self,
        llm: &dyn LlmClient,
        question: &str,
        top_k: usize,
        governance: &GovernanceTracker,
        trace_id: &str,
    ) -> Result<StrategyOutcome> {
        let total_start = Instant::now();

        let mut all_chunks: Vec<Citation> = Vec::new();
        let mut seen_contents: HashSet<String> = HashSet::new();
        let mut iteration_details: Vec<serde_json::Value> = Vec::new();
        let mut iteration_timings: Vec<Timings> = Vec::new();

        let mut best_answer = String::new();
        let mut best_confidence = 0.0f32;
        let mut previous_confidence = 0.0f32;
        let mut follow_up_query = String::new();
        let mut total_usage = TokenUsage::default();
        let mut any_llm = false;
        let mut retrieval_time_ms = 0.0;
        let mut llm_time_ms = 0.0;
        let mut converged = false;
        let mut deadline_hit = false;

        for iteration in 0..self.config.max_iterations {
            let iteration_start = Instant::now();
            let mut iteration_usage = TokenUsage::default();

            let (answer, confidence, num_new) = if iteration == 0 {
                let params = HybridParams {
                    top_k,
                    llm_deadline: self.config.llm_deadline,
                    ..Default::default()
                };
                let result = self.hybrid.run(llm, question, &params).await?;

                for citation in &result.citations {
                    seen_contents.insert(citation.content.clone());
                }
                let num_new = result.citations.len();
                all_chunks.extend(result.citations);
                retrieval_time_ms += result.retrieval_time_ms;
                llm_time_ms += result.llm_time_ms;
                if let Some(usage) = result.token_usage {
                    iteration_usage.add(&usage);
                    any_llm = true;
                }
                iteration_timings.push(result.timings);
                (result.answer, result.confidence, num_new)
            } else {
                let params = HybridParams {
                    top_k: (top_k / 2).max(1),
                    generate_answer: false,
                    llm_deadline: self.config.llm_deadline,
                    ..Default::default()
                };
                let result = self.hybrid.run(llm, &follow_up_query, &params).await?;
                retrieval_time_ms += result.retrieval_time_ms;
                iteration_timings.push(result.timings);

                let new_chunks: Vec<Citation> = result
                    .citations
                    .into_iter()
                    .filter(|c| seen_contents.insert(c.content.clone()))
                    .collect();
                let num_new = new_chunks.len();
                all_chunks.extend(new_chunks.iter().cloned());

                let generation_start = Instant::now();
                match self
                    .generate_incremental(
                        llm,
                        question,
                        &best_answer,
                        all_chunks.len(),
                        &new_chunks,
                    )
                    .await
                {
                    Ok((answer, confidence, usage)) => {
                        llm_time_ms += generation_start.elapsed().as_secs_f64() * 1000.0;
                        iteration_usage.add(&usage);
                        any_llm = true;
                        (answer, confidence, num_new)
                    }
                    Err(AppError::LlmTimeout(msg)) => {
                        // Deadline mid-loop: the best answer so far stands.
                        tracing::warn!(error = %msg, iteration, "iteration deadline hit, returning best so far");
                        deadline_hit = true;
                        (best_answer.clone(), best_confidence, num_new)
                    }
                    Err(other) => return Err(other),
                }
            };

            governance.checkpoint_iteration(trace_id, iteration + 1, confidence);

            if confidence > best_confidence || iteration == 0 {
                best_answer = answer.clone();
                best_confidence = confidence;
            }

            let stop = deadline_hit
                || confidence >= self.config.confidence_threshold
                || (iteration > 0
                    && confidence - previous_confidence < self.config.min_improvement)
                || iteration + 1 == self.config.max_iterations;

            if confidence >= self.config.confidence_threshold {
                converged = true;
            }

            let mut reflection_note = serde_json::Value::Null;
            if !stop {
                let reflection_start = Instant::now();
                let (missing_info, next_query, reflection_usage) = self
                    .reflect(llm, question, &answer, confidence, all_chunks.len())
                    .await;
                llm_time_ms += reflection_start.elapsed().as_secs_f64() * 1000.0;
                if let Some(usage) = reflection_usage {
                    iteration_usage.add(&usage);
                    any_llm = true;
                }
                reflection_note = missing_info.into();
                follow_up_query = next_query;
            }

            total_usage.add(&iteration_usage);
            iteration_details.push(serde_json::json!({
                "iteration": iteration + 1,
                "confidence": confidence,
                "num_chunks_total": all_chunks.len(),
                "num_new_chunks": num_new,
                "iteration_time_ms": iteration_start.elapsed().as_secs_f64() * 1000.0,
                "reflection": reflection_note,
                "token_usage": iteration_usage,
            }));

            previous_confidence = confidence;
            if stop {
                if converged {
                    tracing::info!(iteration = iteration + 1, confidence, "self-RAG converged");
                } else {
                    tracing::info!(
                        iteration = iteration + 1,
                        confidence,
                        "self-RAG stopping without convergence"
                    );
                }
                break;
            }
        }

        let mut timings = Timings::new();
        for key in AGGREGATED_TIMING_KEYS {
            let sum: f64 = iteration_timings
                .iter()
                .filter_map(|t| t.get(*key).and_then(|v| v.as_f64()))
                .sum();
            if sum > 0.0 {
                timings.insert((*key).into(), sum.into());
            }
        }
        timings.insert(
            "iterations".into(),
            serde_json::Value::Array(iteration_details.clone()),
        );
        timings.insert("total_iterations".into(), iteration_details.len().into());
        timings.insert("converged".into(), converged.into());
        timings.insert(
            "end_to_end_ms".into(),
            (total_start.elapsed().as_secs_f64() * 1000.0).into(),
        );

        let answer = if best_answer.is_empty() {
            "I could not produce a confident answer after multiple retrieval rounds.".to_string()
        } else {
            best_answer
        };

        Ok(StrategyOutcome {
            answer,
            citations: all_chunks.clone(),
            confidence: best_confidence,
            num_chunks_retrieved: all_chunks.len(),
            retrieval_time_ms,
            llm_time_ms,
            token_usage: any_llm.then_some(total_usage),
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

    #[test]
    fn test_parse_full_format() {
        let content = "**Answer:** Ruth wrote it.\n**Confidence:** 0.85\n**Reasoning:** stated directly.";
        let (answer, confidence) = SelfRagStrategy::parse_answer_and_confidence(content);
        assert_eq!(answer, "Ruth wrote it.");
        assert!((confidence - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_parse_without_sections_defaults() {
        let (answer, confidence) =
            SelfRagStrategy::parse_answer_and_confidence("Just a plain answer.");
        assert_eq!(answer, "Just a plain answer.");
        assert!((confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_parse_clamps_out_of_range() {
        let content = "**Answer:** x\n**Confidence:** 7\n**Reasoning:** y";
        let (_, confidence) = SelfRagStrategy::parse_answer_and_confidence(content);
        assert!((confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_confidence_without_reasoning() {
        let content = "**Answer:** the fox\n**Confidence:** 0.6";
        let (answer, confidence) = SelfRagStrategy::parse_answer_and_confidence(content);
        assert_eq!(answer, "the fox");
        assert!((confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_extract_number_variants() {
        assert_eq!(SelfRagStrategy::extract_number("about 0.75 or so"), Some(0.75));
        assert_eq!(SelfRagStrategy::extract_number("1"), Some(1.0));
        assert_eq!(SelfRagStrategy::extract_number("no digits"), None);
    }
}
