//! Configuration parsing, validation, and environment overlay.
//!
//! The backend is configured via a TOML file (default: `config/docsynth.toml`)
//! that defines storage paths, search tuning, embedding routing, reranker
//! selection, budget limits, and crawler bounds. Every recognized runtime
//! environment variable overrides its TOML counterpart, so a container
//! deployment needs no config file at all.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory for stored document files, one subdirectory per
    /// collection.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// SQLite database file path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            db_path: default_db_path(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data/files")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./data/docsynth.sqlite")
}
fn default_pool_size() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// `"vector"` or `"hybrid"`.
    #[serde(default = "default_search_mode")]
    pub mode: String,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_bm25_weight")]
    pub bm25_weight: f64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    /// FTS tokenizer language.
    #[serde(default = "default_fts_language")]
    pub fts_language: String,
    /// Trust/recency rescoring toggle.
    #[serde(default)]
    pub trust_scoring: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            mode: default_search_mode(),
            vector_weight: default_vector_weight(),
            bm25_weight: default_bm25_weight(),
            rrf_k: default_rrf_k(),
            min_similarity: default_min_similarity(),
            fts_language: default_fts_language(),
            trust_scoring: false,
        }
    }
}

fn default_search_mode() -> String {
    "hybrid".to_string()
}
fn default_vector_weight() -> f64 {
    0.7
}
fn default_bm25_weight() -> f64 {
    0.3
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_min_similarity() -> f64 {
    0.5
}
fn default_fts_language() -> String {
    "english".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Per-content-type provider defaults. Valid ids: `local`,
    /// `general_cloud`, `code_cloud`.
    #[serde(default = "default_local_provider")]
    pub docs_provider: String,
    #[serde(default = "default_code_provider")]
    pub code_provider: String,
    #[serde(default = "default_general_provider")]
    pub writing_provider: String,
    /// Global override; empty means no override.
    #[serde(default)]
    pub provider_override: Option<String>,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            docs_provider: default_local_provider(),
            code_provider: default_code_provider(),
            writing_provider: default_general_provider(),
            provider_override: None,
            batch_size: default_embed_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_local_provider() -> String {
    "local".to_string()
}
fn default_code_provider() -> String {
    "code_cloud".to_string()
}
fn default_general_provider() -> String {
    "general_cloud".to_string()
}
fn default_embed_batch_size() -> usize {
    8
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// `"cloud_rerank"`, `"local_rerank"`, or `"none"`.
    #[serde(default = "default_rerank_provider")]
    pub provider: String,
    /// Environment-level override applied above the configured default.
    #[serde(default)]
    pub provider_override: Option<String>,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_rerank_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_rerank_batch_size")]
    pub batch_size: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_rerank_provider(),
            provider_override: None,
            max_candidates: default_max_candidates(),
            default_top_k: default_rerank_top_k(),
            batch_size: default_rerank_batch_size(),
        }
    }
}

fn default_rerank_provider() -> String {
    "none".to_string()
}
fn default_max_candidates() -> usize {
    50
}
fn default_rerank_top_k() -> usize {
    10
}
fn default_rerank_batch_size() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub contradiction_enabled: bool,
    #[serde(default = "default_contradiction_model")]
    pub contradiction_model: String,
    /// Lexical-overlap band for contradiction pair selection.
    #[serde(default = "default_min_overlap")]
    pub min_overlap: f64,
    #[serde(default = "default_max_overlap")]
    pub max_overlap: f64,
    #[serde(default = "default_max_pairs")]
    pub max_pairs: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            contradiction_enabled: true,
            contradiction_model: default_contradiction_model(),
            min_overlap: default_min_overlap(),
            max_overlap: default_max_overlap(),
            max_pairs: default_max_pairs(),
            max_results: default_max_results(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_contradiction_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}
fn default_min_overlap() -> f64 {
    0.2
}
fn default_max_overlap() -> f64 {
    0.7
}
fn default_max_pairs() -> usize {
    6
}
fn default_max_results() -> usize {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct BudgetConfig {
    #[serde(default = "default_monthly_budget")]
    pub monthly_usd: f64,
    #[serde(default)]
    pub alerts_enabled: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_usd: default_monthly_budget(),
            alerts_enabled: false,
        }
    }
}

fn default_monthly_budget() -> f64 {
    50.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Documents processed in parallel across the system.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Upload size cap in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_file_size: default_max_file_size(),
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}
fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlerConfig {
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_nav_timeout")]
    pub nav_timeout_secs: u64,
    /// Politeness delay between page loads after the first, in milliseconds.
    #[serde(default = "default_page_delay")]
    pub page_delay_ms: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            nav_timeout_secs: default_nav_timeout(),
            page_delay_ms: default_page_delay(),
        }
    }
}

fn default_max_pages() -> usize {
    20
}
fn default_nav_timeout() -> u64 {
    30
}
fn default_page_delay() -> u64 {
    1000
}

/// Load configuration: TOML file when present, defaults otherwise, then
/// the environment overlay, then validation.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    env_str(name).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_str(name).and_then(|v| v.parse().ok())
}

/// Apply the recognized runtime environment variables on top of the
/// file-provided configuration.
fn apply_env_overrides(config: &mut Config) {
    if let Some(v) = env_str("STORAGE_PATH") {
        config.storage.path = PathBuf::from(v);
    }
    if let Some(v) = env_str("DATABASE_URL") {
        // Accept both plain paths and sqlite: URLs.
        config.storage.db_path = PathBuf::from(v.trim_start_matches("sqlite:").to_string());
    }
    if let Some(v) = env_parse("MONTHLY_BUDGET_USD") {
        config.budget.monthly_usd = v;
    }
    if let Some(v) = env_bool("ENABLE_COST_ALERTS") {
        config.budget.alerts_enabled = v;
    }
    if let Some(v) = env_bool("ENABLE_TRUST_SCORING") {
        config.search.trust_scoring = v;
    }
    if let Some(v) = env_bool("ENABLE_SYNTHESIS") {
        config.synthesis.enabled = v;
    }
    if let Some(v) = env_bool("ENABLE_CONTRADICTION_DETECTION") {
        config.synthesis.contradiction_enabled = v;
    }
    if let Some(v) = env_str("SEARCH_MODE") {
        config.search.mode = v;
    }
    if let Some(v) = env_parse("HYBRID_VECTOR_WEIGHT") {
        config.search.vector_weight = v;
    }
    if let Some(v) = env_parse("HYBRID_BM25_WEIGHT") {
        config.search.bm25_weight = v;
    }
    if let Some(v) = env_str("FTS_LANGUAGE") {
        config.search.fts_language = v;
    }
    if let Some(v) = env_str("RERANKER_PROVIDER") {
        config.rerank.provider = v;
    }
    if let Some(v) = env_str("RERANKER_PROVIDER_OVERRIDE") {
        config.rerank.provider_override = Some(v);
    }
    if let Some(v) = env_parse("RERANK_MAX_CANDIDATES") {
        config.rerank.max_candidates = v;
    }
    if let Some(v) = env_parse("RERANK_DEFAULT_TOP_K") {
        config.rerank.default_top_k = v;
    }
    if let Some(v) = env_parse("RERANK_BATCH_SIZE") {
        config.rerank.batch_size = v;
    }
    if let Some(v) = env_str("DOC_EMBEDDING_PROVIDER") {
        config.embedding.docs_provider = v;
    }
    if let Some(v) = env_str("CODE_EMBEDDING_PROVIDER") {
        config.embedding.code_provider = v;
    }
    if let Some(v) = env_str("WRITING_EMBEDDING_PROVIDER") {
        config.embedding.writing_provider = v;
    }
    if let Some(v) = env_str("EMBEDDING_PROVIDER_OVERRIDE") {
        config.embedding.provider_override = Some(v);
    }
    if let Some(v) = env_str("CONTRADICTION_MODEL") {
        config.synthesis.contradiction_model = v;
    }
    if let Some(v) = env_parse("CONTRADICTION_MIN_SIMILARITY") {
        config.synthesis.min_overlap = v;
    }
    if let Some(v) = env_parse("CONTRADICTION_MAX_SIMILARITY") {
        config.synthesis.max_overlap = v;
    }
    if let Some(v) = env_parse::<usize>("CONTRADICTION_MAX_PAIRS") {
        config.synthesis.max_pairs = v.min(default_max_pairs());
    }
}

fn validate(config: &Config) -> Result<()> {
    match config.search.mode.as_str() {
        "vector" | "hybrid" => {}
        other => anyhow::bail!("Unknown search mode: '{}'. Must be vector or hybrid.", other),
    }

    match config.rerank.provider.as_str() {
        "cloud_rerank" | "local_rerank" | "none" => {}
        other => anyhow::bail!(
            "Unknown reranker provider: '{}'. Must be cloud_rerank, local_rerank, or none.",
            other
        ),
    }

    if config.budget.monthly_usd < 0.0 {
        anyhow::bail!("budget.monthly_usd must be >= 0");
    }

    if config.ingest.max_concurrent == 0 {
        anyhow::bail!("ingest.max_concurrent must be > 0");
    }

    if !(0.0..=1.0).contains(&config.synthesis.min_overlap)
        || !(0.0..=1.0).contains(&config.synthesis.max_overlap)
        || config.synthesis.min_overlap > config.synthesis.max_overlap
    {
        anyhow::bail!("synthesis overlap bounds must satisfy 0 <= min <= max <= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(validate(&config).is_ok());
        assert_eq!(config.search.mode, "hybrid");
        assert_eq!(config.search.rrf_k, 60.0);
        assert_eq!(config.ingest.max_concurrent, 3);
        assert_eq!(config.rerank.max_candidates, 50);
    }

    #[test]
    fn bad_search_mode_rejected() {
        let mut config = Config::default();
        config.search.mode = "keyword".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn bad_rerank_provider_rejected() {
        let mut config = Config::default();
        config.rerank.provider = "gpu_rerank".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn overlap_bounds_checked() {
        let mut config = Config::default();
        config.synthesis.min_overlap = 0.9;
        config.synthesis.max_overlap = 0.2;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn toml_parse_with_partial_sections() {
        let toml_str = r#"
[search]
mode = "vector"
vector_weight = 0.6

[budget]
monthly_usd = 10.0
alerts_enabled = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.search.mode, "vector");
        assert_eq!(config.budget.monthly_usd, 10.0);
        assert!(config.budget.alerts_enabled);
        // Untouched sections keep defaults
        assert_eq!(config.rerank.provider, "none");
    }
}
