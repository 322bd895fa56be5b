//! TOML configuration parsing and validation.
//!
//! Every tunable has a serde default; only `[db].path` is required.
//! [`load_config`] rejects out-of-range values up front so the rest of the
//! application can trust them.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use coach_context_core::models::SearchMethod;
use coach_context_core::search::RetrievalParams;
use coach_context_core::window::WindowPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_encoding_format")]
    pub encoding_format: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between consecutive embedding calls within one document.
    #[serde(default = "default_call_delay_ms")]
    pub call_delay_ms: u64,
    /// Documents re-embedded concurrently by the backfill job.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Pause between backfill batches.
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: default_url(),
            api_key_env: default_api_key_env(),
            encoding_format: default_encoding_format(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            call_delay_ms: default_call_delay_ms(),
            concurrency: default_concurrency(),
            batch_pause_ms: default_batch_pause_ms(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_encoding_format() -> String {
    "float".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}
fn default_call_delay_ms() -> u64 {
    200
}
fn default_concurrency() -> usize {
    5
}
fn default_batch_pause_ms() -> u64 {
    1500
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn call_delay(&self) -> Duration {
        Duration::from_millis(self.call_delay_ms)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub default_method: SearchMethod,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_relevance_floor")]
    pub relevance_floor: f64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_context_char_budget")]
    pub context_char_budget: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// `0` disables the query cache.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_method: SearchMethod::default(),
            semantic_weight: default_semantic_weight(),
            lexical_weight: default_lexical_weight(),
            relevance_floor: default_relevance_floor(),
            max_results: default_max_results(),
            context_char_budget: default_context_char_budget(),
            candidate_k: default_candidate_k(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

fn default_semantic_weight() -> f64 {
    0.7
}
fn default_lexical_weight() -> f64 {
    0.3
}
fn default_relevance_floor() -> f64 {
    0.3
}
fn default_max_results() -> usize {
    5
}
fn default_context_char_budget() -> usize {
    4000
}
fn default_candidate_k() -> usize {
    20
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_max_entries() -> usize {
    256
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            semantic_weight: self.semantic_weight,
            lexical_weight: self.lexical_weight,
            relevance_floor: self.relevance_floor,
            candidate_k: self.candidate_k,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WindowConfig {
    #[serde(default = "default_window_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_summary_token_cap")]
    pub summary_token_cap: usize,
    #[serde(default = "default_min_recent_turns")]
    pub min_recent_turns: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_window_max_tokens(),
            summary_token_cap: default_summary_token_cap(),
            min_recent_turns: default_min_recent_turns(),
        }
    }
}

fn default_window_max_tokens() -> usize {
    2000
}
fn default_summary_token_cap() -> usize {
    500
}
fn default_min_recent_turns() -> usize {
    3
}

impl WindowConfig {
    pub fn policy(&self) -> WindowPolicy {
        WindowPolicy {
            summary_token_cap: self.summary_token_cap,
            min_recent_turns: self.min_recent_turns,
        }
    }
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
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }

    let r = &config.retrieval;
    for (name, w) in [
        ("semantic_weight", r.semantic_weight),
        ("lexical_weight", r.lexical_weight),
        ("relevance_floor", r.relevance_floor),
    ] {
        if !(0.0..=1.0).contains(&w) {
            bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }
    if r.semantic_weight == 0.0 && r.lexical_weight == 0.0 {
        bail!("retrieval.semantic_weight and retrieval.lexical_weight cannot both be 0");
    }
    if r.max_results < 1 {
        bail!("retrieval.max_results must be >= 1");
    }

    let e = &config.embedding;
    match e.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if e.is_enabled() {
        if e.dims.is_none() || e.dims == Some(0) {
            bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
        }
        if e.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                e.provider
            );
        }
        if e.concurrency == 0 {
            bail!("embedding.concurrency must be >= 1");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse_config("[db]\npath = \"./data/coach.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.max_chars, 1000);
        assert_eq!(config.retrieval.default_method, SearchMethod::Hybrid);
        assert_eq!(config.retrieval.params(), RetrievalParams::default());
        assert_eq!(config.window.policy(), WindowPolicy::default());
        assert_eq!(config.window.max_tokens, 2000);
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.server.bind, "127.0.0.1:7341");
    }

    #[test]
    fn test_enabled_provider_requires_model_and_dims() {
        let err = parse_config(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("dims"));

        let ok = parse_config(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\nmodel = \"m\"\ndims = 1536\n",
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_rejects_bad_weights() {
        let err = parse_config(
            "[db]\npath = \"x.sqlite\"\n[retrieval]\nsemantic_weight = 0.0\nlexical_weight = 0.0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("both"));

        assert!(parse_config("[db]\npath = \"x.sqlite\"\n[retrieval]\nrelevance_floor = 1.5\n").is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        assert!(parse_config("[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"local\"\n").is_err());
    }
}
