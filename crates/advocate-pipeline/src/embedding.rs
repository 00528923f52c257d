//! Text embeddings for strategy retrieval.
//!
//! [`OpenAiEmbedder`] calls the embeddings API and is the configured default.
//! [`HashingEmbedder`] is a local feature-hashing embedder for offline runs
//! and tests: lowercase word unigrams and adjacent bigrams, lightly stemmed,
//! hashed with FNV-1a into a fixed number of signed buckets, then
//! L2-normalized. It makes no network call, so the same text always yields
//! the same vector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use advocate_llm::{EmbeddingRequest, OpenAiAdapter};
use advocate_types::{AdvocateError, Result};

use crate::config::{AdvocateConfig, EmbedderKind};
use crate::retry::{execute_with_retry, BackoffPolicy};

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AdvocateError::Other("embedder returned no vector".into()))
    }

    /// One vector per text, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimensions(&self) -> usize;
}

/// The embedder named by `config.embedder`.
pub fn embedder_from_config(config: &AdvocateConfig) -> Result<Arc<dyn Embedder>> {
    Ok(match config.embedder {
        EmbedderKind::Hashing => Arc::new(HashingEmbedder::new(config.embedding_dimensions)),
        EmbedderKind::OpenAi => Arc::new(OpenAiEmbedder::from_env(config)?),
    })
}

// ---------------------------------------------------------------------------
// OpenAiEmbedder
// ---------------------------------------------------------------------------

pub struct OpenAiEmbedder {
    adapter: OpenAiAdapter,
    model: String,
    dims: usize,
    call_timeout: Duration,
    max_retries: usize,
    backoff: BackoffPolicy,
}

impl OpenAiEmbedder {
    /// Uses the config's embedding model and dimensions, and the same call
    /// timeout and transport retries as the generating stages.
    pub fn new(adapter: OpenAiAdapter, config: &AdvocateConfig) -> Self {
        Self {
            adapter,
            model: config.embedding_model.clone(),
            dims: config.embedding_dimensions,
            call_timeout: config.call_timeout(),
            max_retries: config.max_service_retries,
            backoff: config.backoff(),
        }
    }

    pub fn from_env(config: &AdvocateConfig) -> Result<Self> {
        let adapter = OpenAiAdapter::from_env().map_err(|_| {
            AdvocateError::ConfigError(
                "OPENAI_API_KEY is not set; set embedder to \"hashing\" to rank offline".into(),
            )
        })?;
        Ok(Self::new(adapter, config))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: self.model.clone(),
            inputs: texts.to_vec(),
            dimensions: Some(self.dims),
        };
        let adapter = &self.adapter;
        let request = &request;
        let timeout = self.call_timeout;

        let result = execute_with_retry(
            move || async move {
                match tokio::time::timeout(timeout, adapter.embed(request)).await {
                    Ok(res) => res,
                    Err(_) => Err(AdvocateError::RequestTimeout {
                        provider: "openai".into(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            },
            self.max_retries,
            &self.backoff,
            "embedding",
        )
        .await;

        match result {
            Ok(response) => {
                if let Some(bad) = response.vectors.iter().find(|v| v.len() != self.dims) {
                    return Err(AdvocateError::ProviderError {
                        provider: "openai".into(),
                        status: 200,
                        message: format!(
                            "embedding has {} dimensions, expected {}",
                            bad.len(),
                            self.dims
                        ),
                        retryable: false,
                    });
                }
                tracing::debug!(
                    inputs = texts.len(),
                    tokens = response.usage.input_tokens,
                    "Texts embedded"
                );
                Ok(response.vectors)
            }
            Err(e) if e.is_transport_failure() => {
                tracing::error!(error = %e, "Embedding service unreachable");
                Err(AdvocateError::ServiceUnavailable {
                    message: format!("embedding: {e}"),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

// ---------------------------------------------------------------------------
// HashingEmbedder
// ---------------------------------------------------------------------------

pub const DEFAULT_DIMENSIONS: usize = 256;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "i",
    "in", "is", "it", "its", "of", "on", "or", "so", "that", "the", "their", "them", "they",
    "this", "to", "was", "we", "were", "with", "you", "your",
];

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let h = fnv1a(feature.as_bytes());
        let idx = (h % self.dims as u64) as usize;
        // High bit picks the sign so unrelated features tend to cancel.
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        (idx, sign)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

impl HashingEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let tokens = tokenize(text);

        for token in &tokens {
            let (idx, sign) = self.bucket(token);
            vector[idx] += sign;
        }
        for pair in tokens.windows(2) {
            let (idx, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[idx] += 0.5 * sign;
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1 && !STOPWORDS.contains(w))
        .map(stem)
        .collect()
}

/// Strip a handful of English suffixes so "eating", "eats", and "eat" share a
/// bucket. Deliberately crude.
fn stem(word: &str) -> String {
    for suffix in ["ing", "ies", "ed", "es", "ly", "s"] {
        if let Some(root) = word.strip_suffix(suffix) {
            if root.len() >= 3 {
                return if suffix == "ies" {
                    format!("{root}y")
                } else {
                    root.to_string()
                };
            }
        }
    }
    word.to_string()
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity. Zero when lengths differ or either vector is all zeros.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
