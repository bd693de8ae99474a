use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::SearchOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the lexical index and vector store are persisted
    pub data_dir: PathBuf,
    /// Server bind address
    pub bind_addr: String,
    /// Embedding / LLM provider configuration
    pub llm: LlmConfig,
    /// Cross-encoder reranker configuration
    pub reranker: RerankerConfig,
    /// Defaults applied to every search request before per-request overrides
    pub search: SearchOptions,
    /// Quality-scoring constants
    pub scoring: ScoringConfig,
    /// Threshold used by the single zero-result retry
    pub fallback_threshold: f32,
    /// Result cache settings
    pub cache: CacheConfig,
    /// Use the LLM to generate query variants instead of keyword heuristics
    pub llm_expansion: bool,
}

/// Configuration for the cross-encoder reranker sidecar (e.g. a Cohere-compatible
/// `/v1/rerank` endpoint or llama-server with a reranker model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    /// Base URL for the reranker API (e.g. "http://127.0.0.1:8082").
    /// If None, searches run without reranking.
    pub base_url: Option<String>,
    /// Model name to send in the rerank request.
    pub model: Option<String>,
    /// API key sent as a bearer token, if the endpoint needs one.
    pub api_key: Option<String>,
    /// Request timeout in seconds (capped at 30).
    pub timeout_secs: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: None,
            api_key: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "ollama" or "openai"
    pub provider: String,
    /// Base URL for the LLM API
    pub base_url: String,
    /// Model name for query expansion
    pub chat_model: String,
    /// Model name for embeddings
    pub embedding_model: String,
    /// API key (only needed for cloud providers)
    pub api_key: Option<String>,
    /// Embedding vector dimension
    pub embedding_dim: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            chat_model: "llama3.2".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            api_key: None,
            embedding_dim: 768,
        }
    }
}

/// Heuristic quality-score constants. Tuned empirically, so kept configurable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Weight of the literal query-term overlap ratio.
    pub term_match_weight: f32,
    /// Weight of the conversation-context overlap ratio.
    pub context_match_weight: f32,
    /// Content shorter than this many characters is penalized.
    pub short_content_chars: usize,
    /// Multiplier applied to short content.
    pub short_content_penalty: f32,
}

impl ScoringConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("term_match_weight", self.term_match_weight),
            ("context_match_weight", self.context_match_weight),
            ("short_content_penalty", self.short_content_penalty),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{name} must be between 0 and 1, got {value}");
            }
        }
        Ok(())
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            term_match_weight: 0.1,
            context_match_weight: 0.05,
            short_content_chars: 100,
            short_content_penalty: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_entries: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Threshold used by the zero-result retry.
pub const DEFAULT_FALLBACK_THRESHOLD: f32 = 0.1;

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:9000".to_string(),
            llm: LlmConfig::default(),
            reranker: RerankerConfig::default(),
            search: SearchOptions::default(),
            scoring: ScoringConfig::default(),
            fallback_threshold: DEFAULT_FALLBACK_THRESHOLD,
            cache: CacheConfig::default(),
            llm_expansion: false,
        }
    }
}

/// Overwrite `target` with the parsed value of env var `key`, ignoring parse failures.
fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = std::env::var(key) {
        if let Ok(v) = val.parse() {
            *target = v;
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("RAG_SEARCH_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("RAG_SEARCH_BIND_ADDR") {
            config.bind_addr = addr;
        }

        // Embedding provider
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_CHAT_MODEL") {
            config.llm.chat_model = model;
        }
        if let Ok(model) = std::env::var("LLM_EMBEDDING_MODEL") {
            config.llm.embedding_model = model;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }
        env_parse("LLM_EMBEDDING_DIM", &mut config.llm.embedding_dim);

        // Reranker config
        if let Ok(url) = std::env::var("RERANKER_BASE_URL") {
            config.reranker.base_url = Some(url);
        }
        if let Ok(model) = std::env::var("RERANKER_MODEL") {
            config.reranker.model = Some(model);
        }
        if let Ok(key) = std::env::var("RERANKER_API_KEY") {
            config.reranker.api_key = Some(key);
        }
        if let Ok(val) = std::env::var("RERANKER_TIMEOUT_SECS") {
            if let Ok(v) = val.parse::<u64>() {
                config.reranker.timeout_secs = v.min(30); // Cap at 30s
            }
        }

        // Search defaults
        env_parse("RAG_SEARCH_DEFAULT_LIMIT", &mut config.search.limit);
        env_parse("RAG_SEARCH_DEFAULT_THRESHOLD", &mut config.search.threshold);
        env_parse(
            "RAG_SEARCH_CONFIDENCE_THRESHOLD",
            &mut config.search.confidence_threshold,
        );
        env_parse("RAG_SEARCH_FALLBACK_THRESHOLD", &mut config.fallback_threshold);
        env_parse("RAG_SEARCH_LLM_EXPANSION", &mut config.llm_expansion);

        // Cache
        env_parse("RAG_SEARCH_CACHE_ENABLED", &mut config.cache.enabled);
        env_parse("RAG_SEARCH_CACHE_TTL_SECS", &mut config.cache.ttl_secs);
        env_parse("RAG_SEARCH_CACHE_CAPACITY", &mut config.cache.max_entries);

        // Scoring constants
        env_parse("RAG_SCORING_TERM_WEIGHT", &mut config.scoring.term_match_weight);
        env_parse(
            "RAG_SCORING_CONTEXT_WEIGHT",
            &mut config.scoring.context_match_weight,
        );
        env_parse("RAG_SCORING_SHORT_LENGTH", &mut config.scoring.short_content_chars);
        env_parse(
            "RAG_SCORING_SHORT_PENALTY",
            &mut config.scoring.short_content_penalty,
        );

        config.sanitized()
    }

    /// Replace out-of-range values (including NaN and infinities) with defaults.
    fn sanitized(mut self) -> Self {
        if let Err(e) = self.search.validate() {
            tracing::warn!("Ignoring invalid search defaults from environment: {e}");
            self.search = SearchOptions::default();
        }
        if let Err(e) = self.scoring.validate() {
            tracing::warn!("Ignoring invalid scoring constants from environment: {e}");
            self.scoring = ScoringConfig::default();
        }
        if !(0.0..=1.0).contains(&self.fallback_threshold) {
            tracing::warn!(
                "Ignoring invalid fallback threshold {}, using {DEFAULT_FALLBACK_THRESHOLD}",
                self.fallback_threshold
            );
            self.fallback_threshold = DEFAULT_FALLBACK_THRESHOLD;
        }
        if self.llm.embedding_dim == 0 {
            tracing::warn!("Ignoring zero embedding dimension");
            self.llm.embedding_dim = LlmConfig::default().embedding_dim;
        }
        self
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("documents.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.search.validate().is_ok());
        assert_eq!(config.fallback_threshold, 0.1);
        assert_eq!(config.scoring, ScoringConfig::default());
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_sanitized_replaces_non_finite_overrides() {
        let mut config = Config::default();
        config.scoring.term_match_weight = f32::NAN;
        config.fallback_threshold = f32::INFINITY;
        config.search.threshold = -0.5;
        config.llm.embedding_dim = 0;

        let config = config.sanitized();
        assert_eq!(config.scoring, ScoringConfig::default());
        assert_eq!(config.fallback_threshold, DEFAULT_FALLBACK_THRESHOLD);
        assert_eq!(config.search, SearchOptions::default());
        assert_eq!(config.llm.embedding_dim, 768);
    }

    #[test]
    fn test_sanitized_keeps_valid_overrides() {
        let mut config = Config::default();
        config.scoring.short_content_penalty = 0.5;
        config.fallback_threshold = 0.05;
        let config = config.sanitized();
        assert_eq!(config.scoring.short_content_penalty, 0.5);
        assert_eq!(config.fallback_threshold, 0.05);
    }

    #[test]
    fn test_env_parse_ignores_garbage() {
        let mut v = 7usize;
        std::env::set_var("RAG_TEST_ENV_PARSE_GARBAGE", "not-a-number");
        env_parse("RAG_TEST_ENV_PARSE_GARBAGE", &mut v);
        assert_eq!(v, 7);
        std::env::set_var("RAG_TEST_ENV_PARSE_GARBAGE", "12");
        env_parse("RAG_TEST_ENV_PARSE_GARBAGE", &mut v);
        assert_eq!(v, 12);
        std::env::remove_var("RAG_TEST_ENV_PARSE_GARBAGE");
    }
}
