//! Query classification.
//!
//! Two paths in priority order: deterministic cue lists (English and
//! Chinese) with word-count promotion, and an optional LLM-assisted path
//! that produces the same record. Results are memoized in the two-tier
//! classification cache.
//!
//! The same module hosts the lightweight difficulty classifier that drives
//! the embedding adapter's auto model selection.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::{strip_code_fences, ChatMessage, ChatOptions, LlmClient};
use crate::rag::classification_cache::ClassificationCache;
use crate::types::{QueryType, Result, TokenUsage};

// ============================================================================
// Cue Lists
// ============================================================================

/// Structured-data cues: list/compare/aggregate requests.
pub const TABLE_CUES: &[&str] = &[
    // English
    "list", "compare", "contrast", "difference", "similarity", "versus", "vs", "table", "data",
    "statistics", "excel", "spreadsheet", "aggregate", "sum", "kwh",
    // Chinese
    "列出", "列举", "有哪些", "所有", "比较", "对比", "区别", "异同", "优缺点", "差异", "表格",
    "数据", "统计", "反向用电", "发电", "用电", "抄表", "电表", "倍率", "列表", "清单", "目录",
    "分类", "汇总", "总计", "合计",
];

/// Relationship cues: connection questions routed to the graph.
pub const GRAPH_CUES: &[&str] = &[
    // English
    "relationship", "relationships", "relation", "relations", "connection", "connections", "link",
    "associate", "interact", "role", "roles", "character", "characters", "family tree",
    // Chinese
    "关系", "人物关系", "角色关系", "角色", "关系网", "图谱", "联系", "连接", "相关", "交互",
    "影响", "作用", "人物", "之间",
];

/// Deep-analysis cues: queries promoted to the iterative strategy.
pub const COMPLEX_CUES: &[&str] = &[
    // English
    "explain", "analyze", "describe", "discuss", "elaborate", "detailed", "in-depth",
    "comprehensive", "thorough", "why", "how", "process", "methodology", "pros and cons",
    "advantages", "disadvantages", "trade-off", "tradeoff",
    // Chinese
    "分析", "解释", "说明", "阐述", "讨论", "详细", "深入", "全面", "完整", "综合", "为什么",
    "怎么样", "如何", "原理", "机制", "步骤", "流程", "过程", "方法", "方式",
];

/// Moderate-complexity cues used only by the difficulty classifier.
const MODERATE_CUES: &[&str] = &[
    "and", "or", "also", "additionally", "various", "several", "multiple", "including", "such as",
    "for example", "when", "where", "context", "scenario", "以及", "或者", "还有", "哪些",
];

/// Word count at which a query is promoted to complex analysis.
const COMPLEX_WORD_COUNT: usize = 16;

/// Count cue hits in a lowercased question.
pub fn cue_hits<'a>(question_lower: &str, cues: &[&'a str]) -> Vec<&'a str> {
    cues.iter()
        .filter(|cue| question_lower.contains(*cue))
        .copied()
        .collect()
}

// ============================================================================
// Classification Record
// ============================================================================

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    /// LLM-assisted classification.
    Llm,
    /// Exact-string cache tier.
    ExactCache,
    /// TF-IDF semantic cache tier.
    SemanticCache,
    /// Deterministic cue lists.
    Keyword,
}

impl std::fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Llm => "llm",
            Self::ExactCache => "exact_cache",
            Self::SemanticCache => "semantic_cache",
            Self::Keyword => "keyword",
        };
        write!(f, "{}", name)
    }
}

/// Full classification record with strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    /// Classified type.
    pub query_type: QueryType,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Which path produced this record.
    pub source: ClassificationSource,
    /// Short explanation.
    pub description: String,
    /// Recommended chunk count for retrieval.
    pub top_k: usize,
    /// Recommended vector-vs-BM25 fusion weight.
    pub hybrid_alpha: f32,
    /// Classifier believes the graph strategy fits.
    pub use_graph: bool,
    /// Classifier believes the table strategy fits.
    pub use_table: bool,
    /// LLM tokens spent classifying, when the LLM path ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
}

/// Strategy parameters derived from a query type.
pub fn params_for(query_type: QueryType) -> (usize, f32, &'static str) {
    match query_type {
        QueryType::StructuredData => (20, 0.6, "Structured data query requiring table assembly"),
        QueryType::RelationshipQuery => (15, 0.7, "Relationship query requiring graph traversal"),
        QueryType::ComplexAnalysis => (10, 0.7, "Complex query requiring iterative refinement"),
        QueryType::FactualDetail => (5, 0.7, "Simple factual query using hybrid search"),
        QueryType::General => (10, 0.7, "General query, all strategies available"),
    }
}

fn record(query_type: QueryType, confidence: f32, source: ClassificationSource) -> Classification {
    let (top_k, hybrid_alpha, description) = params_for(query_type);
    Classification {
        query_type,
        confidence,
        source,
        description: description.to_string(),
        top_k,
        hybrid_alpha,
        use_graph: query_type == QueryType::RelationshipQuery,
        use_table: query_type == QueryType::StructuredData,
        tokens: None,
    }
}

// ============================================================================
// Difficulty (for model selection)
// ============================================================================

/// Coarse query difficulty for embedding/rerank model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryDifficulty {
    /// Short single-concept factual query.
    Simple,
    /// Multi-concept or context-dependent.
    Moderate,
    /// Relationships, comparisons, deep reasoning.
    Complex,
}

// ============================================================================
// Classifier
// ============================================================================

/// Rule-based + LLM-assisted query classifier with a two-tier cache.
pub struct QueryClassifier {
    cache: Arc<ClassificationCache>,
}

#[derive(Deserialize)]
struct LlmClassification {
    query_type: String,
    #[serde(default)]
    reasoning: String,
}

impl QueryClassifier {
    /// Create a classifier over a classification cache.
    pub fn new(cache: Arc<ClassificationCache>) -> Self {
        Self { cache }
    }

    /// Deterministic keyword classification. Cue-list priority: structured
    /// data, then relationships, then complex analysis (cue or length),
    /// then the factual default.
    pub fn classify_keyword(question: &str) -> Classification {
        let q_lower = question.to_lowercase();

        if !cue_hits(&q_lower, TABLE_CUES).is_empty() {
            return record(QueryType::StructuredData, 0.85, ClassificationSource::Keyword);
        }
        if !cue_hits(&q_lower, GRAPH_CUES).is_empty() {
            return record(
                QueryType::RelationshipQuery,
                0.85,
                ClassificationSource::Keyword,
            );
        }

        let word_count = question.split_whitespace().count();
        if !cue_hits(&q_lower, COMPLEX_CUES).is_empty() || word_count >= COMPLEX_WORD_COUNT {
            return record(
                QueryType::ComplexAnalysis,
                0.80,
                ClassificationSource::Keyword,
            );
        }

        record(QueryType::FactualDetail, 0.60, ClassificationSource::Keyword)
    }

    /// Difficulty tier for the embedding adapter's auto mode.
    pub fn difficulty(question: &str) -> QueryDifficulty {
        let q = question.trim();
        let q_lower = q.to_lowercase();

        if !cue_hits(&q_lower, GRAPH_CUES).is_empty() || !cue_hits(&q_lower, COMPLEX_CUES).is_empty()
        {
            return QueryDifficulty::Complex;
        }
        if !cue_hits(&q_lower, MODERATE_CUES).is_empty() {
            return QueryDifficulty::Moderate;
        }

        match q.split_whitespace().count() {
            0..=5 => QueryDifficulty::Simple,
            6..=15 => QueryDifficulty::Moderate,
            _ => QueryDifficulty::Complex,
        }
    }

    /// Full classification: cache, then cues, then (optionally) the LLM for
    /// queries the cue lists could not place confidently.
    pub async fn classify(
        &self,
        question: &str,
        llm: Option<&dyn LlmClient>,
    ) -> Result<Classification> {
        if let Some((query_type, confidence, source)) = self.cache.get(question) {
            let mut classification = record(query_type, confidence, source);
            classification.tokens = None;
            return Ok(classification);
        }

        let keyword = Self::classify_keyword(question);

        // A cue match is decisive; only the factual-default result is weak
        // enough to be worth an LLM opinion.
        let llm = match llm {
            Some(llm) if keyword.confidence < 0.8 => llm,
            _ => {
                self.cache
                    .insert(question, keyword.query_type, keyword.confidence, false);
                return Ok(keyword);
            }
        };

        match self.classify_with_llm(question, llm).await {
            Ok(classification) => {
                self.cache
                    .insert(question, classification.query_type, classification.confidence, true);
                Ok(classification)
            }
            Err(err) => {
                // Classifier failures are handled locally; the deterministic
                // result stands.
                tracing::warn!(error = %err, "LLM classification failed, using keyword result");
                self.cache
                    .insert(question, keyword.query_type, keyword.confidence, false);
                Ok(keyword)
            }
        }
    }

    async fn classify_with_llm(
        &self,
        question: &str,
        llm: &dyn LlmClient,
    ) -> Result<Classification> {
        let prompt = format!(
            "Classify this question for retrieval strategy selection.\n\n\
             Question: {question}\n\n\
             Types:\n\
             - factual_detail: single fact lookup\n\
             - complex_analysis: explanation, analysis, multi-step reasoning\n\
             - relationship_query: connections between entities or characters\n\
             - structured_data: lists, comparisons, tables, aggregations\n\
             - general: none of the above\n\n\
             Respond in JSON: {{\"query_type\": \"...\", \"reasoning\": \"...\"}}"
        );

        let messages = [
            ChatMessage::system("You classify questions for a retrieval system."),
            ChatMessage::user(prompt),
        ];
        let completion = llm
            .complete(&messages, &ChatOptions::json(150, Duration::from_secs(15)))
            .await?;

        let parsed: LlmClassification =
            serde_json::from_str(strip_code_fences(&completion.content)).map_err(|e| {
                crate::types::AppError::LlmUpstream(format!("unparseable classification: {}", e))
            })?;

        let query_type = match parsed.query_type.as_str() {
            "factual_detail" => QueryType::FactualDetail,
            "complex_analysis" => QueryType::ComplexAnalysis,
            "relationship_query" => QueryType::RelationshipQuery,
            "structured_data" => QueryType::StructuredData,
            _ => QueryType::General,
        };

        let mut classification = record(query_type, 0.95, ClassificationSource::Llm);
        if !parsed.reasoning.is_empty() {
            classification.description = parsed.reasoning;
        }
        classification.tokens = Some(completion.usage);
        Ok(classification)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("List all the tools in the workshop", QueryType::StructuredData)]
    #[case("Compare the forward and reverse readings", QueryType::StructuredData)]
    #[case("统计所有电表的发电量", QueryType::StructuredData)]
    #[case(
        "Show me the relationship between Elizabeth and Darcy",
        QueryType::RelationshipQuery
    )]
    #[case("主要人物之间的关系是什么", QueryType::RelationshipQuery)]
    #[case("Explain the reasoning behind the decision", QueryType::ComplexAnalysis)]
    #[case("Who wrote Daddy Take Me Skating?", QueryType::FactualDetail)]
    fn test_keyword_classification(#[case] question: &str, #[case] expected: QueryType) {
        let classification = QueryClassifier::classify_keyword(question);
        assert_eq!(classification.query_type, expected);
    }

    #[test]
    fn test_long_query_promotes_to_complex() {
        let question =
            "what were the main events in the story of the old man and his garden over the years told";
        assert!(question.split_whitespace().count() >= COMPLEX_WORD_COUNT);
        let classification = QueryClassifier::classify_keyword(question);
        assert_eq!(classification.query_type, QueryType::ComplexAnalysis);
    }

    #[test]
    fn test_confidence_in_unit_interval() {
        for q in ["a", "compare things", "关系", "who is x"] {
            let c = QueryClassifier::classify_keyword(q);
            assert!((0.0..=1.0).contains(&c.confidence));
        }
    }

    #[test]
    fn test_params_follow_type() {
        let c = QueryClassifier::classify_keyword("list every item in a table");
        assert_eq!(c.top_k, 20);
        assert!((c.hybrid_alpha - 0.6).abs() < f32::EPSILON);
        assert!(c.use_table);
        assert!(!c.use_graph);

        let c = QueryClassifier::classify_keyword("Who wrote it?");
        assert_eq!(c.top_k, 5);
        assert!((c.hybrid_alpha - 0.7).abs() < f32::EPSILON);
    }

    #[rstest]
    #[case("Who is Bob?", QueryDifficulty::Simple)]
    #[case("What happened at the workshop when the door opened wide?", QueryDifficulty::Moderate)]
    #[case("Compare and analyze the relationship between the two", QueryDifficulty::Complex)]
    fn test_difficulty(#[case] question: &str, #[case] expected: QueryDifficulty) {
        assert_eq!(QueryClassifier::difficulty(question), expected);
    }
}
