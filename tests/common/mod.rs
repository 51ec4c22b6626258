//! Shared test fixtures: a scripted LLM, deterministic model wiring, and
//! state construction over the in-memory index.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use sage::db::index::{MemoryIndex, VectorIndex};
use sage::llm::{ChatCompletion, ChatMessage, ChatOptions, LlmClient, TokenStream};
use sage::rag::embedding::{HashingEmbedder, LexicalReranker, ModelAdapter, ModelPair};
use sage::types::{ChunkRecord, Result, TokenUsage};
use sage::{AppState, Config};

/// Scripted LLM: routes each prompt to a canned response by inspecting the
/// request, so one instance serves classification, extraction, reflection,
/// and generation calls.
pub struct ScriptedLlm {
    /// Canned answer for generation prompts.
    pub answer: Mutex<String>,
    /// Entities returned by extraction prompts.
    pub entities: Mutex<Vec<String>>,
    /// Relationships returned by batch extraction, as (source, target, relation).
    pub relationships: Mutex<Vec<(String, String, String)>>,
    /// Confidence values consumed by iterative-format prompts, in order.
    pub confidences: Mutex<VecDeque<f32>>,
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self {
            answer: Mutex::new("The book was written by Ruth Doan MacDougall [1].".to_string()),
            entities: Mutex::new(vec!["elizabeth".into(), "darcy".into()]),
            relationships: Mutex::new(vec![(
                "elizabeth".into(),
                "darcy".into(),
                "family".into(),
            )]),
            confidences: Mutex::new(VecDeque::new()),
        }
    }
}

impl ScriptedLlm {
    fn respond(&self, messages: &[ChatMessage]) -> String {
        let prompt = messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        if prompt.contains("factual_detail: single fact lookup") {
            // Classification prompt.
            return r#"{"query_type": "factual_detail", "reasoning": "single fact"}"#.to_string();
        }
        if prompt.contains("Extract key entities") {
            let entities = self.entities.lock().clone();
            return serde_json::json!({ "entities": entities }).to_string();
        }
        if prompt.contains("Extract characters, people, and named roles") {
            // Batch extraction: one result per chunk in the prompt.
            let num_chunks = prompt.matches("[Chunk ").count().max(1);
            let entities: Vec<serde_json::Value> = self
                .entities
                .lock()
                .iter()
                .map(|e| serde_json::json!({ "name": e, "type": "character" }))
                .collect();
            let relationships: Vec<serde_json::Value> = self
                .relationships
                .lock()
                .iter()
                .map(|(s, t, r)| {
                    serde_json::json!({ "source": s, "target": t, "relation": r })
                })
                .collect();
            let results: Vec<serde_json::Value> = (1..=num_chunks)
                .map(|i| {
                    serde_json::json!({
                        "chunk_index": i,
                        "entities": entities,
                        "relationships": relationships,
                    })
                })
                .collect();
            return serde_json::json!({ "results": results }).to_string();
        }
        if prompt.contains("missing_info") {
            return serde_json::json!({
                "missing_info": "supporting details",
                "follow_up_query": "more supporting details",
            })
            .to_string();
        }
        if prompt.contains("**Answer:**") {
            // Iterative format prompt; consume a scripted confidence.
            let confidence = self.confidences.lock().pop_front().unwrap_or(0.9);
            return format!(
                "**Answer:** {}\n**Confidence:** {:.2}\n**Reasoning:** scripted",
                self.answer.lock(),
                confidence
            );
        }
        if prompt.contains("\"headers\"") {
            return serde_json::json!({
                "headers": ["Item", "Value"],
                "rows": [["a", "1"]],
                "summary": "scripted table",
            })
            .to_string();
        }

        self.answer.lock().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<ChatCompletion> {
        Ok(ChatCompletion {
            content: self.respond(messages),
            usage: TokenUsage {
                prompt: 100,
                completion: 20,
                total: 120,
                estimated: false,
            },
            model: "scripted".to_string(),
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<TokenStream> {
        let content = self.respond(messages);
        let words: Vec<Result<String>> = content
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(words)))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Deterministic model adapter over the hashing embedder.
pub fn test_models(dim: usize) -> Arc<ModelAdapter> {
    Arc::new(ModelAdapter::new(
        ModelPair {
            embed: Arc::new(HashingEmbedder::new(dim)),
            rerank: Arc::new(LexicalReranker),
        },
        None,
        60_000.0,
    ))
}

/// Config pointing all persisted state at a temp directory.
pub fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.index.data_dir = dir.to_path_buf();
    config.index.collection = "test_docs".to_string();
    config
}

/// Full application state over the scripted LLM and in-memory index.
pub async fn test_state(llm: Arc<ScriptedLlm>) -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let index: Arc<dyn VectorIndex> = Arc::new(MemoryIndex::new());
    let state = AppState::build(&config, llm, index, test_models(64), None)
        .await
        .expect("state builds");
    (state, dir)
}

/// Ingest `(source, text)` records through the pipeline.
pub async fn ingest_texts(state: &AppState, docs: &[(&str, &str)]) {
    let chunks: Vec<ChunkRecord> = docs
        .iter()
        .enumerate()
        .map(|(i, (source, text))| ChunkRecord {
            text: text.to_string(),
            source: source.to_string(),
            document_id: Some(format!("doc-{}", i)),
            chunk_index: 0,
            title: Some(source.to_string()),
            metadata: Default::default(),
        })
        .collect();
    state.pipeline.ingest(chunks).await.expect("ingest succeeds");
}
