//! End-to-end flows through the ask facade: strategy selection, the
//! answer cache layers, feedback-driven invalidation, and governance
//! invariants.

mod common;

use std::sync::Arc;

use common::{ingest_texts, test_state, ScriptedLlm};
use sage::governance::Criterion;
use sage::types::{AskRequest, FeedbackRequest};

const SKATING_SOURCE: &str = "Daddy Take Me Skating";
const SKATING_TEXT: &str = "Daddy Take Me Skating was written by Ruth Doan MacDougall.";
const SKATING_QUESTION: &str = "Who wrote Daddy Take Me Skating?";

#[tokio::test]
async fn factual_question_uses_hybrid_then_hits_cache() {
    let (state, _dir) = test_state(Arc::new(ScriptedLlm::default())).await;
    ingest_texts(&state, &[(SKATING_SOURCE, SKATING_TEXT)]).await;

    // First ask: full pipeline.
    let first = state
        .pipeline
        .ask(AskRequest::new(SKATING_QUESTION))
        .await
        .unwrap();

    assert!(first.success);
    assert_eq!(first.selected_strategy, "Hybrid RAG");
    assert!(!first.cache_hit);
    assert!(first.confidence > 0.0);
    assert!(first.token_usage.is_some());
    assert!(first
        .citations
        .iter()
        .any(|c| c.source == SKATING_SOURCE));

    // Second ask, identical text: layer-1 exact hit.
    let second = state
        .pipeline
        .ask(AskRequest::new(SKATING_QUESTION))
        .await
        .unwrap();

    assert!(second.cache_hit);
    assert_eq!(second.cache_layer, Some(1));
    assert_eq!(second.answer, first.answer);
    assert!(second.token_usage.is_none());
    assert_ne!(second.query_id, first.query_id);
}

#[tokio::test]
async fn permuted_query_hits_exact_layer() {
    let (state, _dir) = test_state(Arc::new(ScriptedLlm::default())).await;
    ingest_texts(&state, &[(SKATING_SOURCE, SKATING_TEXT)]).await;

    state
        .pipeline
        .ask(AskRequest::new(SKATING_QUESTION))
        .await
        .unwrap();

    let permuted = state
        .pipeline
        .ask(AskRequest::new("  who   WROTE daddy take me skating ? "))
        .await
        .unwrap();

    assert!(permuted.cache_hit);
    assert_eq!(permuted.cache_layer, Some(1));
}

#[tokio::test]
async fn negative_feedback_invalidates_cached_answer() {
    let (state, _dir) = test_state(Arc::new(ScriptedLlm::default())).await;
    ingest_texts(&state, &[(SKATING_SOURCE, SKATING_TEXT)]).await;

    state
        .pipeline
        .ask(AskRequest::new(SKATING_QUESTION))
        .await
        .unwrap();
    let cached = state
        .pipeline
        .ask(AskRequest::new(SKATING_QUESTION))
        .await
        .unwrap();
    assert!(cached.cache_hit);

    let feedback = state
        .feedback
        .submit(&FeedbackRequest {
            query_id: cached.query_id.clone(),
            rating: 0.0,
            comment: Some("wrong answer".to_string()),
        })
        .unwrap();

    assert!(!feedback.bandit_updated);
    assert!(feedback.message.contains("cleared"));

    // The identical query misses every layer and re-runs the pipeline.
    let after = state
        .pipeline
        .ask(AskRequest::new(SKATING_QUESTION))
        .await
        .unwrap();
    assert!(!after.cache_hit);
}

#[tokio::test]
async fn feedback_on_strategy_answer_updates_bandit() {
    let (state, _dir) = test_state(Arc::new(ScriptedLlm::default())).await;
    ingest_texts(&state, &[(SKATING_SOURCE, SKATING_TEXT)]).await;

    let response = state
        .pipeline
        .ask(AskRequest::new(SKATING_QUESTION))
        .await
        .unwrap();
    assert!(!response.cache_hit);

    let before = state.pipeline.router().arm_stats()[&sage::StrategyArm::Hybrid];
    let feedback = state
        .feedback
        .submit(&FeedbackRequest {
            query_id: response.query_id,
            rating: 1.0,
            comment: None,
        })
        .unwrap();

    assert!(feedback.bandit_updated);
    let after = state.pipeline.router().arm_stats()[&sage::StrategyArm::Hybrid];
    assert!((after.trials() - before.trials() - 1.0).abs() < 1e-9);
    assert!(after.alpha > before.alpha);
}

#[tokio::test]
async fn unknown_query_id_feedback_fails() {
    let (state, _dir) = test_state(Arc::new(ScriptedLlm::default())).await;

    let err = state
        .feedback
        .submit(&FeedbackRequest {
            query_id: "does-not-exist".to_string(),
            rating: 0.5,
            comment: None,
        })
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn governance_summary_holds_invariants() {
    let (state, _dir) = test_state(Arc::new(ScriptedLlm::default())).await;
    ingest_texts(&state, &[(SKATING_SOURCE, SKATING_TEXT)]).await;

    let response = state
        .pipeline
        .ask(AskRequest::new(SKATING_QUESTION))
        .await
        .unwrap();
    let summary = response.governance_context.expect("summary present");

    // Exactly one policy gate.
    let policy_gates = summary
        .checkpoints
        .iter()
        .filter(|c| c.criterion == Criterion::G2RiskTiering)
        .count();
    assert_eq!(policy_gates, 1);

    // At least one retrieval checkpoint: a strategy ran.
    let retrievals = summary
        .checkpoints
        .iter()
        .filter(|c| c.criterion == Criterion::G10DomainIsolation)
        .count();
    assert!(retrievals >= 1);

    // Exactly one audit-trail record.
    let audits = summary
        .checkpoints
        .iter()
        .filter(|c| c.message.starts_with("Audit trail"))
        .count();
    assert_eq!(audits, 1);

    // Timestamps never decrease.
    for pair in summary.checkpoints.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    assert_eq!(summary.failed_checkpoints, 0);
}

#[tokio::test]
async fn empty_question_rejected_before_any_work() {
    let (state, _dir) = test_state(Arc::new(ScriptedLlm::default())).await;
    let err = state
        .pipeline
        .ask(AskRequest::new("   "))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "input_validation");
}

#[tokio::test]
async fn out_of_range_top_k_rejected() {
    let (state, _dir) = test_state(Arc::new(ScriptedLlm::default())).await;
    let mut request = AskRequest::new("valid question");
    request.top_k = Some(0);
    let err = state.pipeline.ask(request).await.unwrap_err();
    assert_eq!(err.kind(), "input_validation");
}

#[tokio::test]
async fn empty_retrieval_is_canned_answer_not_failure() {
    // No documents ingested at all.
    let (state, _dir) = test_state(Arc::new(ScriptedLlm::default())).await;

    let response = state
        .pipeline
        .ask(AskRequest::new("Who wrote an unindexed book?"))
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.confidence, 0.0);
    assert_eq!(response.num_chunks_retrieved, 0);
    assert!(response.answer.contains("could not find"));
    // Low-quality answers stay out of the cache.
    let again = state
        .pipeline
        .ask(AskRequest::new("Who wrote an unindexed book?"))
        .await
        .unwrap();
    assert!(!again.cache_hit);
}

#[tokio::test]
async fn iterative_converges_in_one_round_on_strong_retrieval() {
    use sage::governance::GovernanceTracker;
    use sage::rag::strategies::hybrid_rag::HybridStrategy;
    use sage::rag::strategies::self_rag::{SelfRagConfig, SelfRagStrategy};
    use sage::rag::HybridRetriever;

    let llm = Arc::new(ScriptedLlm::default());
    let (state, _dir) = test_state(llm.clone()).await;
    // A chunk that matches the query wholesale scores 1.0 on overlap.
    ingest_texts(
        &state,
        &[("analysis", "the detailed analysis of the skating book themes")],
    )
    .await;

    let models = common::test_models(64);
    let retriever = Arc::new(HybridRetriever::new(
        state.pipeline.index_arc(),
        models.clone(),
        "test_docs",
        None,
        0.7,
    ));
    let hybrid = Arc::new(HybridStrategy::new(retriever, models));
    let strategy = SelfRagStrategy::new(hybrid, SelfRagConfig::default());

    let governance = GovernanceTracker::new();
    let trace = governance.start_operation("self_rag");
    let outcome = strategy
        .run(
            llm.as_ref(),
            "the detailed analysis of the skating book themes",
            10,
            &governance,
            &trace,
        )
        .await
        .unwrap();

    assert!(outcome.confidence >= 0.75);
    assert_eq!(
        outcome.timings.get("total_iterations").and_then(|v| v.as_u64()),
        Some(1)
    );
    assert_eq!(
        outcome.timings.get("converged").and_then(|v| v.as_bool()),
        Some(true)
    );

    // Token invariant: the accumulated total equals the sum over
    // iteration_details.
    let iterations = outcome.timings["iterations"].as_array().unwrap();
    let per_iteration: u64 = iterations
        .iter()
        .map(|i| i["token_usage"]["total"].as_u64().unwrap_or(0))
        .sum();
    assert_eq!(outcome.token_usage.unwrap().total, per_iteration);
}
