//! Runtime configuration: built-in defaults, an optional JSON file, then
//! `ADVOCATE_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use advocate_types::{AdvocateError, Result};

use crate::retry::BackoffPolicy;

/// Which embedder ranks strategies against tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderKind {
    /// The embeddings API, via `OPENAI_API_KEY`.
    #[serde(rename = "openai")]
    OpenAi,
    /// Local feature hashing. Offline and deterministic.
    Hashing,
}

impl std::str::FromStr for EmbedderKind {
    type Err = AdvocateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(EmbedderKind::OpenAi),
            "hashing" => Ok(EmbedderKind::Hashing),
            other => Err(AdvocateError::ConfigError(format!(
                "unknown embedder '{other}' (expected openai or hashing)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvocateConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Pins sampling for reproducible runs when set.
    pub seed: Option<u64>,
    /// Number of strategies handed to the reply generator.
    pub top_k: usize,
    pub embedder: EmbedderKind,
    pub embedding_model: String,
    /// Vector length. Precomputed corpus vectors must come from the same
    /// embedder at this length; others are re-embedded at load.
    pub embedding_dimensions: usize,
    pub call_timeout_ms: u64,
    pub turn_timeout_ms: u64,
    /// Extra attempts after a schema violation.
    pub max_format_retries: usize,
    /// Extra attempts after a transport failure.
    pub max_service_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub min_input_chars: usize,
    pub min_input_words: usize,
    /// JSON strategy corpus. The built-in corpus is used when unset.
    pub corpus_path: Option<PathBuf>,
    /// Append-only JSONL session log. Sessions are kept in memory only when unset.
    pub session_log: Option<PathBuf>,
    pub persist_retries: usize,
}

impl Default for AdvocateConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 400,
            seed: None,
            top_k: 4,
            embedder: EmbedderKind::OpenAi,
            embedding_model: advocate_llm::DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimensions: 256,
            call_timeout_ms: 30_000,
            turn_timeout_ms: 120_000,
            max_format_retries: 2,
            max_service_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            min_input_chars: 12,
            min_input_words: 3,
            corpus_path: None,
            session_log: None,
            persist_retries: 3,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AdvocateError::ConfigError(format!("{key}: cannot parse '{raw}'")))
}

impl AdvocateConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            AdvocateError::ConfigError(format!("reading {}: {e}", path.display()))
        })?;
        serde_json::from_str(&data)
            .map_err(|e| AdvocateError::ConfigError(format!("parsing {}: {e}", path.display())))
    }

    /// Apply `ADVOCATE_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("ADVOCATE_MODEL") {
            self.model = v;
        }
        if let Some(v) = lookup("ADVOCATE_TEMPERATURE") {
            self.temperature = parse_env("ADVOCATE_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("ADVOCATE_SEED") {
            self.seed = Some(parse_env("ADVOCATE_SEED", &v)?);
        }
        if let Some(v) = lookup("ADVOCATE_TOP_K") {
            self.top_k = parse_env("ADVOCATE_TOP_K", &v)?;
        }
        if let Some(v) = lookup("ADVOCATE_EMBEDDER") {
            self.embedder = v.parse()?;
        }
        if let Some(v) = lookup("ADVOCATE_EMBEDDING_MODEL") {
            self.embedding_model = v;
        }
        if let Some(v) = lookup("ADVOCATE_EMBEDDING_DIMENSIONS") {
            self.embedding_dimensions = parse_env("ADVOCATE_EMBEDDING_DIMENSIONS", &v)?;
        }
        if let Some(v) = lookup("ADVOCATE_CALL_TIMEOUT_MS") {
            self.call_timeout_ms = parse_env("ADVOCATE_CALL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("ADVOCATE_TURN_TIMEOUT_MS") {
            self.turn_timeout_ms = parse_env("ADVOCATE_TURN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("ADVOCATE_CORPUS") {
            self.corpus_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ADVOCATE_SESSION_LOG") {
            self.session_log = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(AdvocateError::ConfigError("model must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(AdvocateError::ConfigError(format!(
                "temperature {} outside 0.0..=2.0",
                self.temperature
            )));
        }
        if self.top_k == 0 {
            return Err(AdvocateError::ConfigError("top_k must be at least 1".into()));
        }
        if self.call_timeout_ms == 0 || self.turn_timeout_ms == 0 {
            return Err(AdvocateError::ConfigError("timeouts must be non-zero".into()));
        }
        if self.embedding_dimensions == 0 {
            return Err(AdvocateError::ConfigError(
                "embedding_dimensions must be non-zero".into(),
            ));
        }
        if self.embedder == EmbedderKind::OpenAi && self.embedding_model.trim().is_empty() {
            return Err(AdvocateError::ConfigError(
                "embedding_model must not be empty".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(AdvocateError::ConfigError("max_tokens must be non-zero".into()));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}
