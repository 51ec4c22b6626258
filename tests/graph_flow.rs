//! Relationship questions: cue-forced graph routing, just-in-time graph
//! construction, and subgraph reporting.

mod common;

use std::sync::Arc;

use common::{ingest_texts, test_state, ScriptedLlm};
use sage::types::AskRequest;

const NOVEL_CHUNKS: &[(&str, &str)] = &[
    (
        "pride-and-prejudice",
        "Elizabeth walked the gardens while Darcy watched from the terrace.",
    ),
    (
        "pride-and-prejudice",
        "Darcy wrote a letter to Elizabeth explaining everything that had passed.",
    ),
];

#[tokio::test]
async fn relationship_cues_force_graph_strategy() {
    let llm = Arc::new(ScriptedLlm::default());
    let (state, _dir) = test_state(llm).await;
    ingest_texts(&state, NOVEL_CHUNKS).await;

    let mut request =
        AskRequest::new("Show me the relationship between Elizabeth and Darcy");
    request.include_timings = true;

    let response = state.pipeline.ask(request).await.unwrap();

    assert!(response.success);
    assert_eq!(response.selected_strategy, "Graph RAG");
    assert!(response.strategy_reason.contains("Forced"));
    assert!(!response.cache_hit);

    let timings = response.timings.expect("timings requested");
    let graph_context = &timings["graph_context"];
    assert!(graph_context["num_entities"].as_u64().unwrap() >= 2);

    // The subgraph carries the extracted edge between the two names.
    let relationships = graph_context["relationships"].as_array().unwrap();
    assert!(relationships.iter().any(|rel| {
        rel["source"] == "elizabeth" && rel["target"] == "darcy" && rel["relation"] == "family"
    }));
}

#[tokio::test]
async fn graph_questions_bypass_answer_cache() {
    let llm = Arc::new(ScriptedLlm::default());
    let (state, _dir) = test_state(llm).await;
    ingest_texts(&state, NOVEL_CHUNKS).await;

    let question = "Show me the relationship between Elizabeth and Darcy";
    let first = state.pipeline.ask(AskRequest::new(question)).await.unwrap();
    let second = state.pipeline.ask(AskRequest::new(question)).await.unwrap();

    // Same question twice: never served from the answer cache.
    assert!(!first.cache_hit);
    assert!(!second.cache_hit);
}

#[tokio::test]
async fn repeated_graph_builds_share_extraction_via_memo() {
    let llm = Arc::new(ScriptedLlm::default());
    let (state, _dir) = test_state(llm.clone()).await;
    ingest_texts(&state, NOVEL_CHUNKS).await;

    let question = "Show me the relationship between Elizabeth and Darcy";
    let first = state.pipeline.ask(AskRequest::new(question)).await.unwrap();
    assert!(first.success);

    let mut request = AskRequest::new(question);
    request.include_timings = true;
    let second = state.pipeline.ask(request).await.unwrap();

    // Second request finds its entities in the graph (or the memo) and
    // processes no new chunks.
    let timings = second.timings.expect("timings requested");
    let jit_stats = &timings["jit_stats"];
    assert_eq!(jit_stats["chunks_processed"].as_u64(), Some(0));
}

#[tokio::test]
async fn unknown_entities_render_as_isolated_nodes() {
    let llm = Arc::new(ScriptedLlm::default());
    // The extractor names entities for which no chunk exists.
    *llm.entities.lock() = vec!["phantom".into(), "ghost".into()];
    *llm.relationships.lock() = Vec::new();

    let (state, _dir) = test_state(llm).await;
    // Empty collection: JIT finds no candidate chunks.

    let mut request = AskRequest::new("What is the relationship between phantom and ghost?");
    request.include_timings = true;
    let response = state.pipeline.ask(request).await.unwrap();

    assert!(response.success);
    let timings = response.timings.expect("timings requested");
    let graph_context = &timings["graph_context"];
    // Query entities still show up as isolated nodes for rendering.
    assert_eq!(graph_context["num_entities"].as_u64(), Some(2));
    assert_eq!(graph_context["num_relationships"].as_u64(), Some(0));
}
