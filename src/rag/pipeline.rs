//! RAG facade: the public `ask` operation.
//!
//! Wires cache → classifier → router → strategy → bandit update →
//! governance, in that order, and guarantees a sealed governance summary on
//! every path including failures. Failed answers are never cached, and a
//! cancelled or failed request commits no bandit update.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::try_stream;
use futures::StreamExt;
use metrics::counter;
use uuid::Uuid;

use crate::db::index::VectorIndex;
use crate::governance::{CheckpointStatus, GovernanceTracker};
use crate::llm::client::estimate_usage;
use crate::llm::{ChatMessage, ChatOptions, LlmClient, TokenStream};
use crate::rag::answer_cache::{AnswerCache, CachedAnswer};
use crate::rag::classifier::{cue_hits, Classification, QueryClassifier, GRAPH_CUES};
use crate::rag::embedding::{ModelAdapter, ModelMode};
use crate::rag::history::QueryHistory;
use crate::rag::hybrid::HybridRetriever;
use crate::rag::router::{StrategyArm, StrategyRouter};
use crate::rag::strategies::hybrid_rag::{HybridParams, HybridStrategy};
use crate::rag::strategies::{GraphRag, SelfRagStrategy, StrategyOutcome, TableRag};
use crate::types::{
    AppError, AskRequest, AskResponse, ChunkRecord, IngestResponse, Result, TokenBreakdown,
    TokenBreakdownEntry, TokenUsage,
};

/// Upper bound accepted for the `top_k` knob.
const MAX_TOP_K: usize = 100;

/// Upper bound accepted for the `vector_limit` knob.
const MAX_VECTOR_LIMIT: usize = 1000;

/// PII patterns scanned before retrieval; matches feed the privacy
/// checkpoint.
fn detect_pii(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    if text.contains('@') && text.split('@').nth(1).map(|d| d.contains('.')) == Some(true) {
        found.push("email".to_string());
    }
    let digit_runs: Vec<usize> = text
        .split(|c: char| !c.is_ascii_digit())
        .map(|run| run.len())
        .filter(|len| *len > 0)
        .collect();
    if digit_runs.iter().any(|len| *len >= 10) {
        found.push("phone".to_string());
    }
    if digit_runs.windows(3).any(|w| w == [3usize, 2, 4].as_slice()) {
        found.push("ssn".to_string());
    }
    if digit_runs.iter().filter(|len| **len == 4).count() >= 4 {
        found.push("credit_card".to_string());
    }
    found
}

/// Rough cost model for token accounting (per-million USD rates).
fn estimate_cost(usage: &TokenUsage) -> f64 {
    usage.prompt as f64 * 2.50 / 1_000_000.0 + usage.completion as f64 * 10.0 / 1_000_000.0
}

/// The RAG facade. One instance per process, shared across requests.
pub struct RagPipeline {
    llm: Arc<dyn LlmClient>,
    models: Arc<ModelAdapter>,
    index: Arc<dyn VectorIndex>,
    retriever: Arc<HybridRetriever>,
    classifier: Arc<QueryClassifier>,
    router: Arc<StrategyRouter>,
    answer_cache: Arc<AnswerCache>,
    governance: Arc<GovernanceTracker>,
    history: Arc<QueryHistory>,
    hybrid: Arc<HybridStrategy>,
    self_rag: Arc<SelfRagStrategy>,
    graph: Arc<GraphRag>,
    table: Arc<TableRag>,
    collection: String,
    latency_budget_ms: f64,
    llm_deadline: Duration,
}

#[allow(clippy::too_many_arguments)]
impl RagPipeline {
    /// Assemble the facade from shared components.
    pub fn new(
        llm: Arc<dyn LlmClient>,
        models: Arc<ModelAdapter>,
        index: Arc<dyn VectorIndex>,
        retriever: Arc<HybridRetriever>,
        classifier: Arc<QueryClassifier>,
        router: Arc<StrategyRouter>,
        answer_cache: Arc<AnswerCache>,
        governance: Arc<GovernanceTracker>,
        history: Arc<QueryHistory>,
        hybrid: Arc<HybridStrategy>,
        self_rag: Arc<SelfRagStrategy>,
        graph: Arc<GraphRag>,
        table: Arc<TableRag>,
        collection: impl Into<String>,
        latency_budget_ms: f64,
        llm_deadline: Duration,
    ) -> Self {
        Self {
            llm,
            models,
            index,
            retriever,
            classifier,
            router,
            answer_cache,
            governance,
            history,
            hybrid,
            self_rag,
            graph,
            table,
            collection: collection.into(),
            latency_budget_ms,
            llm_deadline,
        }
    }

    /// The governance tracker, exposed for the API layer.
    pub fn governance(&self) -> &Arc<GovernanceTracker> {
        &self.governance
    }

    /// The answer cache, exposed for the API layer.
    pub fn answer_cache(&self) -> &Arc<AnswerCache> {
        &self.answer_cache
    }

    /// The strategy router, exposed for the API layer.
    pub fn router(&self) -> &Arc<StrategyRouter> {
        &self.router
    }

    /// The vector index, exposed for seeding and diagnostics.
    pub fn index_ref(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    /// Shared handle to the vector index.
    pub fn index_arc(&self) -> Arc<dyn VectorIndex> {
        self.index.clone()
    }

    fn validate(&self, request: &AskRequest) -> Result<bool> {
        if request.question.trim().is_empty() {
            return Err(AppError::InvalidInput("question must not be empty".into()));
        }
        if let Some(top_k) = request.top_k {
            if top_k == 0 || top_k > MAX_TOP_K {
                return Err(AppError::InvalidInput(format!(
                    "top_k must be in 1..={}, got {}",
                    MAX_TOP_K, top_k
                )));
            }
        }
        if let Some(vector_limit) = request.vector_limit {
            if vector_limit == 0 || vector_limit > MAX_VECTOR_LIMIT {
                return Err(AppError::InvalidInput(format!(
                    "vector_limit must be in 1..={}, got {}",
                    MAX_VECTOR_LIMIT, vector_limit
                )));
            }
        }

        // The reranker knob either disables reranking or switches the
        // model adapter mode.
        let rerank_enabled = match request.reranker.as_deref() {
            None => true,
            Some("none") | Some("off") => false,
            Some(mode) => {
                let mode: ModelMode = mode.parse()?;
                self.models.switch(mode);
                true
            }
        };
        Ok(rerank_enabled)
    }

    /// Answer a question. The single public operation of the core.
    pub async fn ask(&self, request: AskRequest) -> Result<AskResponse> {
        let total_start = Instant::now();
        let rerank_enabled = self.validate(&request)?;
        let question = request.question.trim().to_string();

        let trace_id = self.governance.start_operation("rag");
        self.governance.checkpoint_policy_gate(
            &trace_id,
            true,
            "R1 policy allows RAG queries with citations required",
        );
        self.governance.checkpoint_permission(&trace_id, "public", true);
        self.governance
            .checkpoint_privacy(&trace_id, &detect_pii(&question), false);
        self.governance
            .checkpoint_data_governance(&trace_id, &[self.collection.clone()]);
        self.governance.checkpoint_dashboard(&trace_id);

        // Model-pair suggestion for this query; only switches in auto mode.
        self.models
            .apply_difficulty(QueryClassifier::difficulty(&question));

        // Relationship-heavy questions bypass the answer cache so a stale
        // hybrid answer never shadows the graph.
        let bypass_cache = !cue_hits(&question.to_lowercase(), GRAPH_CUES).is_empty();

        if !bypass_cache {
            if let Some(hit) = self.answer_cache.find(&question).await? {
                counter!("sage_answer_cache_total", "result" => "hit").increment(1);
                let query_id = Uuid::new_v4().to_string();
                self.history
                    .record_cached(&query_id, hit.cache_layer, &question);

                self.governance
                    .checkpoint_evidence(&trace_id, hit.answer.citations.len());
                self.governance.checkpoint_audit(&trace_id);
                let governance_context = self.governance.complete_operation(&trace_id);

                let total_time_ms = total_start.elapsed().as_secs_f64() * 1000.0;
                let mut breakdown = TokenBreakdown::default();
                breakdown.query_classification.method = Some("answer_cache".into());
                breakdown.query_classification.cached = Some(true);
                breakdown.answer_cache_lookup.cached = Some(true);

                return Ok(AskResponse {
                    answer: hit.answer.answer,
                    citations: hit.answer.citations,
                    query_id,
                    selected_strategy: hit.answer.selected_strategy,
                    strategy_reason: hit.answer.strategy_reason,
                    confidence: hit.answer.confidence,
                    num_chunks_retrieved: hit.answer.num_chunks_retrieved,
                    retrieval_time_ms: 0.0,
                    llm_time_ms: 0.0,
                    total_time_ms,
                    timings: None,
                    models: None,
                    token_usage: None,
                    token_cost_usd: 0.0,
                    token_breakdown: Some(breakdown),
                    cache_hit: true,
                    cache_layer: Some(hit.cache_layer),
                    governance_context,
                    success: true,
                    error: None,
                });
            }
            counter!("sage_answer_cache_total", "result" => "miss").increment(1);
        }

        // Classify, route, and run the chosen strategy.
        let classification = self
            .classifier
            .classify(&question, Some(self.llm.as_ref()))
            .await?;
        let decision = self.router.route(&question, &classification);
        tracing::info!(
            arm = %decision.arm,
            forced = decision.forced,
            query_type = %classification.query_type,
            "strategy selected"
        );

        let outcome = match self
            .execute_strategy(&decision.arm, &question, &request, &classification, &trace_id, rerank_enabled)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                return self.fail(&trace_id, total_start, err);
            }
        };

        // Automated bandit update happens after the answer exists and
        // before the response is returned.
        let total_time_ms = total_start.elapsed().as_secs_f64() * 1000.0;
        let reward = StrategyRouter::automated_reward(
            outcome.confidence,
            outcome.num_chunks_retrieved,
            total_time_ms,
            self.latency_budget_ms,
        );
        if self.router.is_enabled() {
            self.router.update(decision.arm, reward);
        }

        let query_id = Uuid::new_v4().to_string();
        self.history
            .record_strategy(&query_id, decision.arm.as_str(), reward, &question);

        // Cache writes only after the quality gate, and never for
        // cache-bypassed (graph-cue) questions.
        if !bypass_cache {
            self.answer_cache
                .store(
                    &question,
                    CachedAnswer {
                        answer: outcome.answer.clone(),
                        citations: outcome.citations.clone(),
                        confidence: outcome.confidence,
                        num_chunks_retrieved: outcome.num_chunks_retrieved,
                        selected_strategy: decision.arm.display_name().to_string(),
                        strategy_reason: decision.reason.clone(),
                    },
                )
                .await;
        }

        self.governance.checkpoint_retrieval(
            &trace_id,
            outcome.num_chunks_retrieved,
            &self.collection,
        );
        self.governance
            .checkpoint_evidence(&trace_id, outcome.citations.len());
        self.governance
            .checkpoint_generation(&trace_id, self.llm.model_name(), "v1.0");
        self.governance
            .checkpoint_quality(&trace_id, total_time_ms, outcome.confidence);
        self.governance.checkpoint_audit(&trace_id);
        self.governance.checkpoint_reliability(
            &trace_id,
            CheckpointStatus::Passed,
            &format!("completed via {}", decision.arm.display_name()),
        );
        let governance_context = self.governance.complete_operation(&trace_id);

        let token_breakdown =
            self.build_breakdown(&classification, &outcome.token_usage);
        let token_cost_usd = outcome
            .token_usage
            .as_ref()
            .map(estimate_cost)
            .unwrap_or(0.0);

        let mut models = std::collections::HashMap::new();
        models.insert("llm".to_string(), self.llm.model_name().to_string());
        models.insert("embedding".to_string(), self.models.current_embed_id());
        models.insert("reranker".to_string(), self.models.current_rerank_id());

        Ok(AskResponse {
            answer: outcome.answer,
            citations: outcome.citations,
            query_id,
            selected_strategy: decision.arm.display_name().to_string(),
            strategy_reason: decision.reason,
            confidence: outcome.confidence,
            num_chunks_retrieved: outcome.num_chunks_retrieved,
            retrieval_time_ms: outcome.retrieval_time_ms,
            llm_time_ms: outcome.llm_time_ms,
            total_time_ms,
            timings: request.include_timings.then_some(outcome.timings),
            models: Some(models),
            token_usage: outcome.token_usage,
            token_cost_usd,
            token_breakdown: Some(token_breakdown),
            cache_hit: false,
            cache_layer: None,
            governance_context,
            success: true,
            error: None,
        })
    }

    async fn execute_strategy(
        &self,
        arm: &StrategyArm,
        question: &str,
        request: &AskRequest,
        classification: &Classification,
        trace_id: &str,
        rerank_enabled: bool,
    ) -> Result<StrategyOutcome> {
        let top_k = request.top_k.unwrap_or(classification.top_k);

        match arm {
            StrategyArm::Hybrid => {
                let params = HybridParams {
                    top_k,
                    alpha: Some(classification.hybrid_alpha),
                    vector_limit: request.vector_limit,
                    content_char_limit: request.content_char_limit,
                    rerank: rerank_enabled,
                    generate_answer: true,
                    llm_deadline: self.llm_deadline,
                };
                self.hybrid.run(self.llm.as_ref(), question, &params).await
            }
            StrategyArm::Iterative => {
                self.self_rag
                    .run(
                        self.llm.as_ref(),
                        question,
                        top_k.max(10),
                        &self.governance,
                        trace_id,
                    )
                    .await
            }
            StrategyArm::Graph => {
                self.graph
                    .run(self.llm.as_ref(), question, top_k, true)
                    .await
            }
            StrategyArm::Table => {
                self.table
                    .run(
                        self.llm.as_ref(),
                        question,
                        top_k.max(20),
                        classification.hybrid_alpha,
                    )
                    .await
            }
        }
    }

    /// Seal governance and shape the failure. Upstream failures become a
    /// non-success response; everything else propagates as an error after
    /// sealing.
    fn fail(
        &self,
        trace_id: &str,
        total_start: Instant,
        err: AppError,
    ) -> Result<AskResponse> {
        counter!(
            "sage_failures_total",
            "operation" => "rag",
            "kind" => err.kind(),
        )
        .increment(1);

        self.governance.checkpoint_reliability(
            trace_id,
            CheckpointStatus::Failed,
            &format!("request failed: {}", err),
        );
        self.governance.checkpoint_audit(trace_id);
        let governance_context = self.governance.complete_operation(trace_id);

        let user_visible = matches!(
            err,
            AppError::LlmUpstream(_) | AppError::LlmTimeout(_) | AppError::VectorStore(_)
        );
        if !user_visible {
            return Err(err);
        }

        Ok(AskResponse {
            answer: String::new(),
            citations: Vec::new(),
            query_id: Uuid::new_v4().to_string(),
            selected_strategy: String::new(),
            strategy_reason: String::new(),
            confidence: 0.0,
            num_chunks_retrieved: 0,
            retrieval_time_ms: 0.0,
            llm_time_ms: 0.0,
            total_time_ms: total_start.elapsed().as_secs_f64() * 1000.0,
            timings: None,
            models: None,
            token_usage: None,
            token_cost_usd: 0.0,
            token_breakdown: None,
            cache_hit: false,
            cache_layer: None,
            governance_context,
            success: false,
            error: Some(err.kind().to_string()),
        })
    }

    fn build_breakdown(
        &self,
        classification: &Classification,
        generation_usage: &Option<TokenUsage>,
    ) -> TokenBreakdown {
        let classification_usage = classification.tokens.unwrap_or_default();
        let classification_cost = classification
            .tokens
            .as_ref()
            .map(estimate_cost)
            .unwrap_or(0.0);
        let generation = generation_usage.unwrap_or_default();
        let generation_cost = generation_usage.as_ref().map(estimate_cost).unwrap_or(0.0);

        TokenBreakdown {
            query_classification: TokenBreakdownEntry {
                tokens: classification_usage.total,
                prompt_tokens: classification_usage.prompt,
                completion_tokens: classification_usage.completion,
                cost: classification_cost,
                llm_used: classification.tokens.is_some(),
                method: Some(classification.source.to_string()),
                cached: Some(matches!(
                    classification.source,
                    crate::rag::classifier::ClassificationSource::ExactCache
                        | crate::rag::classifier::ClassificationSource::SemanticCache
                )),
            },
            answer_cache_lookup: TokenBreakdownEntry {
                cached: Some(false),
                ..Default::default()
            },
            answer_generation: TokenBreakdownEntry {
                tokens: generation.total,
                prompt_tokens: generation.prompt,
                completion_tokens: generation.completion,
                cost: generation_cost,
                llm_used: generation_usage.is_some(),
                method: None,
                cached: None,
            },
            total: TokenBreakdownEntry {
                tokens: classification_usage.total + generation.total,
                prompt_tokens: classification_usage.prompt + generation.prompt,
                completion_tokens: classification_usage.completion + generation.completion,
                cost: classification_cost + generation_cost,
                llm_used: classification.tokens.is_some() || generation_usage.is_some(),
                method: None,
                cached: None,
            },
        }
    }

    /// Streaming ask: forwards answer deltas as they arrive, then applies
    /// the cache quality gate over the accumulated text at stream end.
    /// A partially delivered stream is never cached.
    pub async fn ask_stream(&self, request: AskRequest) -> Result<TokenStream> {
        self.validate(&request)?;
        let question = request.question.trim().to_string();

        // Cache hits replay the stored answer as a single delta.
        if let Some(hit) = self.answer_cache.find(&question).await? {
            counter!("sage_answer_cache_total", "result" => "hit").increment(1);
            let answer = hit.answer.answer;
            let stream = try_stream! {
                yield answer;
            };
            return Ok(Box::pin(stream));
        }

        let classification = self
            .classifier
            .classify(&question, Some(self.llm.as_ref()))
            .await?;
        let top_k = request.top_k.unwrap_or(classification.top_k);

        // Streaming always takes the hybrid path; the looping strategies
        // have no meaningful delta stream.
        let retrieval = HybridParams {
            top_k,
            alpha: Some(classification.hybrid_alpha),
            generate_answer: false,
            llm_deadline: self.llm_deadline,
            ..Default::default()
        };
        let chunks = self
            .hybrid
            .run(self.llm.as_ref(), &question, &retrieval)
            .await?;

        if chunks.num_chunks_retrieved == 0 {
            let canned = StrategyOutcome::no_information().answer;
            let stream = try_stream! {
                yield canned;
            };
            return Ok(Box::pin(stream));
        }

        let context: String = chunks
            .citations
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{}] ({})\n{}\n\n", i + 1, c.source, c.content))
            .collect();
        let prompt = format!(
            "Answer the question using ONLY the context excerpts below, citing them as \
             [1]..[{}].\n\nContext:\n{}\nQuestion: {}\n\nAnswer:",
            chunks.citations.len(),
            context,
            question
        );
        let messages = vec![
            ChatMessage::system("You answer strictly from the provided context with citations."),
            ChatMessage::user(prompt.clone()),
        ];

        let mut deltas = self
            .llm
            .stream(
                &messages,
                &ChatOptions {
                    temperature: 0.2,
                    max_tokens: Some(700),
                    json_mode: false,
                    deadline: self.llm_deadline,
                },
            )
            .await?;

        let cache = self.answer_cache.clone();
        let history = self.history.clone();
        let router = self.router.clone();
        let latency_budget_ms = self.latency_budget_ms;
        let start = Instant::now();

        let stream = try_stream! {
            let mut accumulated = String::new();

            // An error mid-stream propagates out here, so nothing after the
            // loop runs for a partially delivered stream.
            while let Some(delta) = deltas.next().await {
                let token = delta?;
                accumulated.push_str(&token);
                yield token;
            }

            // Stream fully delivered: account, learn, and cache.
            if !accumulated.is_empty() {
                let usage = estimate_usage(&prompt, &accumulated);
                let confidence = chunks.confidence;
                let total_time_ms = start.elapsed().as_secs_f64() * 1000.0;
                let reward = StrategyRouter::automated_reward(
                    confidence,
                    chunks.num_chunks_retrieved,
                    total_time_ms,
                    latency_budget_ms,
                );
                if router.is_enabled() {
                    router.update(StrategyArm::Hybrid, reward);
                }
                let query_id = Uuid::new_v4().to_string();
                history.record_strategy(&query_id, StrategyArm::Hybrid.as_str(), reward, &question);
                tracing::debug!(
                    tokens = usage.total,
                    estimated = usage.estimated,
                    "stream completed"
                );

                cache
                    .store(
                        &question,
                        CachedAnswer {
                            answer: accumulated.clone(),
                            citations: chunks.citations.clone(),
                            confidence,
                            num_chunks_retrieved: chunks.num_chunks_retrieved,
                            selected_strategy: StrategyArm::Hybrid.display_name().to_string(),
                            strategy_reason: "Streaming request (hybrid path)".to_string(),
                        },
                    )
                    .await;
            }
        };

        Ok(Box::pin(stream))
    }

    /// Ingest pre-chunked records: embed and upsert into the collection.
    pub async fn ingest(&self, chunks: Vec<ChunkRecord>) -> Result<IngestResponse> {
        if chunks.is_empty() {
            return Err(AppError::InvalidInput("no chunks provided".into()));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.models.embed(&texts).await?;

        let points: Vec<crate::db::index::IndexPoint> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(record, vector)| {
                let id = record
                    .document_id
                    .clone()
                    .map(|d| format!("{}:{}", d, record.chunk_index))
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                crate::db::index::IndexPoint {
                    id,
                    vector,
                    payload: crate::db::index::ChunkPayload {
                        text: record.text,
                        source: record.source,
                        title: record.title,
                        document_id: record.document_id,
                        chunk_index: record.chunk_index,
                        extra: record.metadata,
                        ..Default::default()
                    },
                }
            })
            .collect();
        let count = points.len();

        self.index.upsert(&self.collection, points).await?;

        // The keyword side is stale now; rebuild from the updated index.
        self.retriever.rebuild_bm25().await?;

        Ok(IngestResponse {
            chunks_indexed: count,
            collection: self.collection.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_pii_email_and_ssn() {
        assert_eq!(detect_pii("mail me at a@b.com"), vec!["email".to_string()]);
        assert!(detect_pii("ssn is 123-45-6789").contains(&"ssn".to_string()));
        assert!(detect_pii("plain question").is_empty());
    }

    #[test]
    fn test_detect_pii_credit_card() {
        assert!(detect_pii("card 1234 5678 9012 3456").contains(&"credit_card".to_string()));
    }

    #[test]
    fn test_estimate_cost_scales_with_tokens() {
        let usage = TokenUsage {
            prompt: 1_000_000,
            completion: 0,
            total: 1_000_000,
            estimated: false,
        };
        assert!((estimate_cost(&usage) - 2.50).abs() < 1e-9);
    }
}
