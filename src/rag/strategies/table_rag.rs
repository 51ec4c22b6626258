//! Table RAG: structured-data question answering.
//!
//! Pipeline: intent extraction (LLM with a keyword fallback), hybrid
//! retrieval with an elevated top-k, an LLM structuring pass producing
//! `{headers, rows, summary}`, and answer generation over the assembled
//! table. When the query or a retrieved chunk points at an uploaded
//! spreadsheet and an analyzer tool is wired in, the tool's numbers
//! override LLM-generated content verbatim; tool failures are recorded and
//! the LLM path continues.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::llm::{strip_code_fences, ChatMessage, ChatOptions, LlmClient};
use crate::rag::embedding::ModelAdapter;
use crate::rag::hybrid::{HybridOptions, HybridRetriever};
use crate::rag::strategies::StrategyOutcome;
use crate::types::{Result, RetrievedChunk, Timings, TokenUsage};

/// Chunks fed to the structuring prompt.
const STRUCTURING_CHUNK_LIMIT: usize = 10;

/// Cues that point at metering/spreadsheet data.
const SPREADSHEET_CUES: &[&str] = &[
    "光伏", "电表", "发电", "用电", "正向", "反向", "kwh", "excel", "spreadsheet", "倍率",
];

// ============================================================================
// Spreadsheet Tool Seam
// ============================================================================

/// Per-meter readings in a PV-energy analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterBreakdown {
    /// Meter label.
    pub meter: String,
    /// Forward energy delta in kWh.
    pub forward_kwh: f64,
    /// Reverse energy delta in kWh.
    pub reverse_kwh: f64,
    /// Sum of both deltas.
    pub total_kwh: f64,
}

/// Structured result of a spreadsheet analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadsheetReport {
    /// Total generation across PV meters.
    pub total_generation_kwh: f64,
    /// Number of PV meters found.
    pub num_pv_meters: usize,
    /// Per-meter breakdown.
    pub meter_breakdown: Vec<MeterBreakdown>,
    /// Raw rows for detail rendering.
    #[serde(default)]
    pub all_rows: Vec<serde_json::Value>,
    /// How the numbers were computed.
    pub method: String,
}

/// External spreadsheet analyzer invoked on uploaded files.
#[async_trait]
pub trait SpreadsheetAnalyzer: Send + Sync {
    /// Analyze the file at `path`.
    async fn analyze(&self, path: &str) -> Result<SpreadsheetReport>;
}

/// Record of a tool invocation attempt, returned with the answer.
#[derive(Debug, Clone, Serialize)]
pub struct ToolUsage {
    /// Whether the tool was invoked.
    pub triggered: bool,
    /// Tool name.
    pub tool_name: &'static str,
    /// Wall time of the invocation in milliseconds.
    pub execution_time_ms: f64,
    /// `success`, `failed`, or `skipped`.
    pub status: &'static str,
    /// Failure detail when status is `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ToolUsage {
    fn skipped() -> Self {
        Self {
            triggered: false,
            tool_name: "analyze-spreadsheet",
            execution_time_ms: 0.0,
            status: "skipped",
            reason: None,
        }
    }
}

// ============================================================================
// Intent and Table Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueryIntent {
    #[serde(default = "default_intent_type")]
    query_type: String,
    #[serde(default)]
    entities_to_extract: Vec<String>,
    #[serde(default)]
    attributes: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

fn default_intent_type() -> String {
    "list".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TableData {
    #[serde(default)]
    headers: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    summary: String,
}

// ============================================================================
// Strategy
// ============================================================================

/// Structured-data strategy.
pub struct TableRag {
    retriever: Arc<HybridRetriever>,
    models: Arc<ModelAdapter>,
    analyzer: Option<Arc<dyn SpreadsheetAnalyzer>>,
    llm_deadline: Duration,
}

impl TableRag {
    /// Create the strategy; `analyzer` is the optional spreadsheet tool.
    pub fn new(
        retriever: Arc<HybridRetriever>,
        models: Arc<ModelAdapter>,
        analyzer: Option<Arc<dyn SpreadsheetAnalyzer>>,
        llm_deadline: Duration,
    ) -> Self {
        Self {
            retriever,
            models,
            analyzer,
            llm_deadline,
        }
    }

    async fn extract_intent(
        &self,
        llm: &dyn LlmClient,
        question: &str,
    ) -> (QueryIntent, Option<TokenUsage>) {
        let prompt = format!(
            "Analyze this query and determine what structured data the user wants.\n\n\
             Query: \"{question}\"\n\n\
             Identify the entities to extract, the attributes to compare or list, and the \
             structure (comparison, list, or aggregation).\n\n\
             Respond in JSON:\n\
             {{\"query_type\": \"comparison|list|aggregation\",\n\
              \"entities_to_extract\": [\"...\"],\n\
              \"attributes\": [\"...\"],\n\
              \"reasoning\": \"brief explanation\"}}"
        );
        let messages = [
            ChatMessage::system("You are a query analyzer that extracts structured intent."),
            ChatMessage::user(prompt),
        ];

        match llm
            .complete(&messages, &ChatOptions::json(300, self.llm_deadline))
            .await
        {
            Ok(completion) => {
                let intent = serde_json::from_str(strip_code_fences(&completion.content))
                    .unwrap_or_else(|_| Self::keyword_intent(question));
                (intent, Some(completion.usage))
            }
            Err(err) => {
                tracing::warn!(error = %err, "intent extraction failed, using keyword fallback");
                (Self::keyword_intent(question), None)
            }
        }
    }

    fn keyword_intent(question: &str) -> QueryIntent {
        let q_lower = question.to_lowercase();
        let aggregation_cues = ["发电", "用电", "总", "多少", "总计", "total", "generation", "sum", "kwh"];
        let comparison_cues = ["比较", "对比", "compare", "vs", "versus"];

        let query_type = if aggregation_cues.iter().any(|c| q_lower.contains(c)) {
            "aggregation"
        } else if comparison_cues.iter().any(|c| q_lower.contains(c)) {
            "comparison"
        } else {
            "list"
        };

        let entities: Vec<String> = question
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() >= 3)
            .take(5)
            .map(|w| w.to_lowercase())
            .collect();

        QueryIntent {
            query_type: query_type.to_string(),
            entities_to_extract: if entities.is_empty() {
                vec!["data".to_string()]
            } else {
                entities
            },
            attributes: vec!["value".to_string(), "total".to_string()],
            reasoning: "Keyword-based extraction (LLM unavailable)".to_string(),
        }
    }

    /// Resolve the uploaded-spreadsheet path from a chunk's payload fields.
    fn resolve_spreadsheet_path(chunks: &[RetrievedChunk]) -> Option<String> {
        for chunk in chunks {
            if let Some(uploaded) = chunk.metadata.get("uploaded_file").and_then(|v| v.as_str()) {
                if let Some(dir) = chunk.metadata.get("upload_dir").and_then(|v| v.as_str()) {
                    return Some(format!("{}/{}", dir.trim_end_matches('/'), uploaded));
                }
                return Some(uploaded.to_string());
            }
            if let Some(path) = chunk.metadata.get("file_path").and_then(|v| v.as_str()) {
                if path.ends_with(".xlsx") || path.ends_with(".xls") || path.ends_with(".csv") {
                    return Some(path.to_string());
                }
            }
        }
        None
    }

    fn render_report(report: &SpreadsheetReport, file: &str) -> String {
        let mut answer = format!(
            "Based on the analysis of **{}**:\n\n\
             **Total generation**: {:.2} kWh\n\n\
             **PV meters**: {}\n\n",
            file, report.total_generation_kwh, report.num_pv_meters
        );
        if !report.meter_breakdown.is_empty() {
            answer.push_str("**Per-meter breakdown**:\n");
            for meter in &report.meter_breakdown {
                answer.push_str(&format!(
                    "  - **{}**: forward {:.2} kWh + reverse {:.2} kWh = **{:.2} kWh**\n",
                    meter.meter, meter.forward_kwh, meter.reverse_kwh, meter.total_kwh
                ));
            }
        }
        answer.push_str(&format!("\n**Method**: {}\n", report.method));
        answer
    }

    fn render_markdown_table(table: &TableData) -> String {
        if table.headers.is_empty() {
            return table.summary.clone();
        }
        let mut out = String::new();
        out.push_str(&format!("| {} |\n", table.headers.join(" | ")));
        out.push_str(&format!(
            "|{}\n",
            " --- |".repeat(table.headers.len())
        ));
        for row in &table.rows {
            let cells: Vec<String> = row
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        if !table.summary.is_empty() {
            out.push_str(&format!("\n{}\n", table.summary));
        }
        out
    }

    async fn structure_data(
        &self,
        llm: &dyn LlmClient,
        question: &str,
        chunks: &[RetrievedChunk],
        intent: &QueryIntent,
    ) -> (TableData, Option<TokenUsage>) {
        let context: String = chunks
            .iter()
            .take(STRUCTURING_CHUNK_LIMIT)
            .enumerate()
            .map(|(i, c)| format!("[Chunk {}]\n{}\n\n", i + 1, c.text))
            .collect();

        let prompt = format!(
            "Structure the information from the context as a table.\n\n\
             Query: {question}\n\
             Intent: {}\n\n\
             Context:\n{context}\n\
             Return JSON:\n\
             {{\"headers\": [\"Column1\", ...],\n\
              \"rows\": [[\"value1\", ...], ...],\n\
              \"summary\": \"brief summary of the table\"}}",
            intent.reasoning
        );
        let messages = [
            ChatMessage::system("You are a data structuring assistant."),
            ChatMessage::user(prompt),
        ];

        match llm
            .complete(&messages, &ChatOptions::json(800, self.llm_deadline))
            .await
        {
            Ok(completion) => {
                let table = serde_json::from_str(strip_code_fences(&completion.content))
                    .unwrap_or_else(|_| TableData {
                        headers: Vec::new(),
                        rows: Vec::new(),
                        summary: "Could not structure data".to_string(),
                    });
                (table, Some(completion.usage))
            }
            Err(err) => {
                tracing::warn!(error = %err, "structuring failed");
                (TableData::default(), None)
            }
        }
    }

    /// Run the table pipeline.
    pub async fn run(
        &self,
        llm: &dyn LlmClient,
        question: &str,
        top_k: usize,
        hybrid_alpha: f32,
    ) -> Result<StrategyOutcome> {
        let total_start = Instant::now();
        let mut timings = Timings::new();
        let mut usage = TokenUsage::default();
        let mut any_llm = false;

        // 1. Intent extraction.
        let intent_start = Instant::now();
        let (intent, intent_usage) = self.extract_intent(llm, question).await;
        if let Some(u) = intent_usage {
            usage.add(&u);
            any_llm = true;
        }
        let intent_ms = intent_start.elapsed().as_secs_f64() * 1000.0;
        timings.insert("intent_extraction_ms".into(), intent_ms.into());

        // 2. Hybrid retrieval with elevated top-k.
        let retrieval_start = Instant::now();
        let query_vector = self.models.embed_one(question).await?;
        let (chunks, _) = self
            .retriever
            .search(
                question,
                &query_vector,
                &HybridOptions {
                    top_k,
                    alpha: Some(hybrid_alpha),
                    vector_limit: None,
                    rerank: false,
                },
            )
            .await?;
        let retrieval_ms = retrieval_start.elapsed().as_secs_f64() * 1000.0;
        timings.insert("retrieval_ms".into(), retrieval_ms.into());

        // 3. Spreadsheet tool path: a metering cue in the query or an
        // uploaded-spreadsheet payload triggers the tool, provided a file
        // path resolves.
        let q_lower = question.to_lowercase();
        let cue_triggered = SPREADSHEET_CUES.iter().any(|c| q_lower.contains(c));
        let file_path = Self::resolve_spreadsheet_path(&chunks);
        let mut tool_usage = ToolUsage::skipped();

        if let (Some(analyzer), Some(path)) = (&self.analyzer, &file_path) {
            let tool_start = Instant::now();
            tool_usage.triggered = true;
            tracing::info!(path = %path, cue_triggered, "invoking spreadsheet analyzer");
            match analyzer.analyze(path).await {
                Ok(report) => {
                    tool_usage.execution_time_ms = tool_start.elapsed().as_secs_f64() * 1000.0;
                    tool_usage.status = "success";

                    // Tool numbers are authoritative; no generation call.
                    let answer = Self::render_report(&report, path);
                    timings.insert(
                        "tool_usage".into(),
                        serde_json::to_value(&tool_usage).unwrap_or_default(),
                    );
                    timings.insert(
                        "query_intent".into(),
                        serde_json::to_value(&intent).unwrap_or_default(),
                    );
                    timings.insert(
                        "end_to_end_ms".into(),
                        (total_start.elapsed().as_secs_f64() * 1000.0).into(),
                    );
                    return Ok(StrategyOutcome {
                        answer,
                        citations: Vec::new(),
                        confidence: 1.0,
                        num_chunks_retrieved: chunks.len(),
                        retrieval_time_ms: intent_ms + retrieval_ms,
                        llm_time_ms: 0.0,
                        token_usage: any_llm.then_some(usage),
                        timings,
                    });
                }
                Err(err) => {
                    tool_usage.execution_time_ms = tool_start.elapsed().as_secs_f64() * 1000.0;
                    tool_usage.status = "failed";
                    tool_usage.reason = Some(err.to_string());
                    tracing::warn!(error = %err, "spreadsheet tool failed, continuing with LLM path");
                }
            }
        }

        // 4. LLM structuring pass.
        let structure_start = Instant::now();
        let (table, structure_usage) = self.structure_data(llm, question, &chunks, &intent).await;
        if let Some(u) = structure_usage {
            usage.add(&u);
            any_llm = true;
        }
        let structuring_ms = structure_start.elapsed().as_secs_f64() * 1000.0;
        timings.insert("structuring_ms".into(), structuring_ms.into());

        // 5. Answer generation over the table.
        let rendered_table = Self::render_markdown_table(&table);
        let prompt = format!(
            "Answer the question using the structured table below.\n\n\
             Question: {question}\n\n\
             Table:\n{rendered_table}\n\
             Present the answer clearly; keep the table in the answer when it helps."
        );
        let generation_start = Instant::now();
        let completion = llm
            .complete(
                &[ChatMessage::user(prompt)],
                &ChatOptions {
                    temperature: 0.2,
                    max_tokens: Some(800),
                    json_mode: false,
                    deadline: self.llm_deadline,
                },
            )
            .await?;
        let generation_ms = generation_start.elapsed().as_secs_f64() * 1000.0;
        usage.add(&completion.usage);
        any_llm = true;

        timings.insert("answer_generation_ms".into(), generation_ms.into());
        timings.insert(
            "table_data".into(),
            serde_json::to_value(&table).unwrap_or_default(),
        );
        timings.insert(
            "query_intent".into(),
            serde_json::to_value(&intent).unwrap_or_default(),
        );
        timings.insert(
            "tool_usage".into(),
            serde_json::to_value(&tool_usage).unwrap_or_default(),
        );
        timings.insert(
            "end_to_end_ms".into(),
            (total_start.elapsed().as_secs_f64() * 1000.0).into(),
        );

        Ok(StrategyOutcome {
            answer: completion.content,
            citations: Vec::new(),
            confidence: 1.0,
            num_chunks_retrieved: chunks.len(),
            retrieval_time_ms: intent_ms + retrieval_ms + structuring_ms,
            llm_time_ms: generation_ms,
            token_usage: any_llm.then_some(usage),
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

    #[test]
    fn test_keyword_intent_detects_aggregation() {
        let intent = TableRag::keyword_intent("总发电量是多少 kwh");
        assert_eq!(intent.query_type, "aggregation");

        let intent = TableRag::keyword_intent("compare tool A vs tool B");
        assert_eq!(intent.query_type, "comparison");

        let intent = TableRag::keyword_intent("which items exist");
        assert_eq!(intent.query_type, "list");
    }

    #[test]
    fn test_markdown_table_rendering() {
        let table = TableData {
            headers: vec!["Name".into(), "Value".into()],
            rows: vec![
                vec!["a".into(), serde_json::json!(1)],
                vec!["b".into(), serde_json::json!(2)],
            ],
            summary: "two rows".into(),
        };
        let rendered = TableRag::render_markdown_table(&table);
        assert!(rendered.contains("| Name | Value |"));
        assert!(rendered.contains("| a | 1 |"));
        assert!(rendered.contains("two rows"));
    }

    #[test]
    fn test_resolve_spreadsheet_path_from_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert("uploaded_file".to_string(), serde_json::json!("meters.xlsx"));
        metadata.insert("upload_dir".to_string(), serde_json::json!("/uploads/"));
        let chunk = RetrievedChunk {
            chunk_id: "c1".into(),
            text: "row data".into(),
            source: "meters.xlsx".into(),
            score: 0.9,
            bm25_score: 0.0,
            vector_score: 0.9,
            fused_score: 0.9,
            provenance: Provenance::Table,
            metadata,
        };

        let path = TableRag::resolve_spreadsheet_path(&[chunk]).unwrap();
        assert_eq!(path, "/uploads/meters.xlsx");
    }

    #[test]
    fn test_render_report_uses_tool_numbers() {
        let report = SpreadsheetReport {
            total_generation_kwh: 1234.5,
            num_pv_meters: 2,
            meter_breakdown: vec![MeterBreakdown {
                meter: "PV-1".into(),
                forward_kwh: 1000.0,
                reverse_kwh: 234.5,
                total_kwh: 1234.5,
            }],
            all_rows: Vec::new(),
            method: "delta of consecutive readings".into(),
        };
        let answer = TableRag::render_report(&report, "meters.xlsx");
        assert!(answer.contains("1234.50 kWh"));
        assert!(answer.contains("PV-1"));
        assert!(answer.contains("meters.xlsx"));
    }
}
