use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Top-level configuration, assembled from environment variables with
/// local-first defaults. `.env` files are honored via `dotenvy`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub models: ModelConfig,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub bandit: BanditConfig,
    pub strategies: StrategyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions base URL.
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Per-call deadline in seconds.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Remote embedding service URL (unused when local-embeddings is on).
    pub embed_url: String,
    /// Remote reranker service URL.
    pub rerank_url: String,
    /// Embedding dimension; non-negotiable at runtime.
    pub embedding_dim: usize,
    /// Rerank latency above which the fallback pair latches, in ms.
    pub rerank_latency_threshold_ms: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Vector collection holding the document chunks.
    pub collection: String,
    /// Directory for persisted runtime state (bandit, caches, BM25).
    pub data_dir: PathBuf,
    /// Optional JSONL seed file applied when the collection starts empty.
    pub seed_file: Option<PathBuf>,
}

impl IndexConfig {
    /// Runtime bandit state file.
    pub fn bandit_state_file(&self) -> PathBuf {
        self.data_dir.join("bandit_state.json")
    }

    /// Pre-warmed default bandit state shipped with a deployment.
    pub fn default_bandit_state_file(&self) -> PathBuf {
        self.data_dir.join("default_bandit_state.json")
    }

    /// Persisted classification cache.
    pub fn classification_cache_file(&self) -> PathBuf {
        self.data_dir.join("classification_cache.json")
    }

    /// Persisted BM25 index for a collection.
    pub fn bm25_cache_file(&self, collection: &str) -> PathBuf {
        self.data_dir.join(format!("bm25_{}.json", collection))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Dense-embedding similarity threshold (layer 3).
    pub semantic_threshold: f32,
    /// TF-IDF cosine threshold (layer 2).
    pub tfidf_threshold: f32,
    /// Maximum cached answers across layers.
    pub max_cache_size: usize,
    /// Entry time-to-live in hours.
    pub ttl_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BanditConfig {
    pub enabled: bool,
    /// Latency budget for the reward penalty, in ms.
    pub latency_budget_ms: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Vector-vs-BM25 fusion weight.
    pub hybrid_alpha: f32,
    /// Self-RAG iteration cap.
    pub max_iterations: usize,
    /// Self-RAG convergence threshold.
    pub confidence_threshold: f32,
    /// Self-RAG minimum per-iteration improvement.
    pub min_improvement: f32,
    /// Graph JIT: max candidate chunks per build.
    pub graph_max_jit_chunks: usize,
    /// Graph JIT: chunks per extraction batch.
    pub graph_batch_size: usize,
    /// Graph JIT: per-batch wall-clock timeout in seconds.
    pub graph_batch_timeout_secs: u64,
    /// Graph subgraph traversal depth.
    pub graph_max_hops: usize,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env_or("HOST", "127.0.0.1"),
                port: env_parse("PORT", 8888u16),
            },
            llm: LlmConfig {
                api_base: env_or("LLM_API_BASE", "http://localhost:11434/v1"),
                api_key: env::var("LLM_API_KEY").ok(),
                model: env_or("LLM_MODEL", "gpt-4o-mini"),
                request_timeout_secs: env_parse("LLM_TIMEOUT_SECS", 60u64),
            },
            models: ModelConfig {
                embed_url: env_or("EMBED_URL", "http://localhost:9100/embed"),
                rerank_url: env_or("RERANK_URL", "http://localhost:9100/rerank"),
                embedding_dim: env_parse("EMBEDDING_DIM", 384usize),
                rerank_latency_threshold_ms: env_parse("RERANK_LATENCY_THRESHOLD_MS", 2000.0f64),
            },
            index: IndexConfig {
                collection: env_or("COLLECTION_NAME", "sage_docs"),
                data_dir: PathBuf::from(env_or("DATA_DIR", "./data")),
                seed_file: env::var("SEED_FILE").ok().map(PathBuf::from),
            },
            cache: CacheConfig {
                semantic_threshold: env_parse("ANSWER_CACHE_SEMANTIC_THRESHOLD", 0.88f32),
                tfidf_threshold: env_parse("ANSWER_CACHE_TFIDF_THRESHOLD", 0.30f32),
                max_cache_size: env_parse("ANSWER_CACHE_MAX_SIZE", 1000usize),
                ttl_hours: env_parse("ANSWER_CACHE_TTL_HOURS", 72i64),
            },
            bandit: BanditConfig {
                enabled: env_or("SMART_BANDIT_ENABLED", "true").to_lowercase() != "false",
                latency_budget_ms: env_parse("SMART_RAG_LATENCY_BUDGET_MS", 8000.0f64),
            },
            strategies: StrategyConfig {
                hybrid_alpha: env_parse("HYBRID_ALPHA", 0.7f32),
                max_iterations: env_parse("SELF_RAG_MAX_ITERATIONS", 3usize),
                confidence_threshold: env_parse("SELF_RAG_CONFIDENCE_THRESHOLD", 0.75f32),
                min_improvement: env_parse("SELF_RAG_MIN_IMPROVEMENT", 0.05f32),
                graph_max_jit_chunks: env_parse("GRAPH_JIT_MAX_CHUNKS", 50usize),
                graph_batch_size: env_parse("GRAPH_JIT_BATCH_SIZE", 4usize),
                graph_batch_timeout_secs: env_parse("GRAPH_JIT_BATCH_TIMEOUT", 30u64),
                graph_max_hops: env_parse("GRAPH_MAX_HOPS", 2usize),
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8888,
            },
            llm: LlmConfig {
                api_base: "http://localhost:11434/v1".to_string(),
                api_key: None,
                model: "gpt-4o-mini".to_string(),
                request_timeout_secs: 60,
            },
            models: ModelConfig {
                embed_url: "http://localhost:9100/embed".to_string(),
                rerank_url: "http://localhost:9100/rerank".to_string(),
                embedding_dim: 384,
                rerank_latency_threshold_ms: 2000.0,
            },
            index: IndexConfig {
                collection: "sage_docs".to_string(),
                data_dir: PathBuf::from("./data"),
                seed_file: None,
            },
            cache: CacheConfig {
                semantic_threshold: 0.88,
                tfidf_threshold: 0.30,
                max_cache_size: 1000,
                ttl_hours: 72,
            },
            bandit: BanditConfig {
                enabled: true,
                latency_budget_ms: 8000.0,
            },
            strategies: StrategyConfig {
                hybrid_alpha: 0.7,
                max_iterations: 3,
                confidence_threshold: 0.75,
                min_improvement: 0.05,
                graph_max_jit_chunks: 50,
                graph_batch_size: 4,
                graph_batch_timeout_secs: 30,
                graph_max_hops: 2,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.index.collection, "sage_docs");
        assert!((config.strategies.hybrid_alpha - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.cache.max_cache_size, 1000);
        assert!(config.bandit.enabled);
    }

    #[test]
    fn test_state_file_paths() {
        let config = Config::default();
        assert!(config
            .index
            .bandit_state_file()
            .ends_with("bandit_state.json"));
        assert!(config
            .index
            .bm25_cache_file("sage_docs")
            .ends_with("bm25_sage_docs.json"));
    }
}
