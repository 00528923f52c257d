//! Strategy corpus access.
//!
//! The corpus is read-only to the pipeline. A [`StrategyCorpus`] source is
//! read once into a [`CorpusHandle`], which hands out cheap immutable
//! snapshots and swaps in a fresh one on [`CorpusHandle::reload`]. Turns
//! already running keep the snapshot they started with.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use advocate_types::{AdvocateError, Result, Strategy};

use crate::embedding::Embedder;

const BUILTIN_CORPUS: &str = include_str!("../../../corpus/strategies.json");

#[async_trait]
pub trait StrategyCorpus: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Strategy>>;
}

/// The corpus compiled into the binary.
pub struct BuiltinCorpus;

#[async_trait]
impl StrategyCorpus for BuiltinCorpus {
    async fn get_all(&self) -> Result<Vec<Strategy>> {
        parse_corpus(BUILTIN_CORPUS, "builtin")
    }
}

/// A JSON array of strategies on disk.
pub struct JsonFileCorpus {
    path: PathBuf,
}

impl JsonFileCorpus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StrategyCorpus for JsonFileCorpus {
    async fn get_all(&self) -> Result<Vec<Strategy>> {
        let data = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            AdvocateError::CorpusError(format!("reading {}: {e}", self.path.display()))
        })?;
        parse_corpus(&data, &self.path.display().to_string())
    }
}

/// A fixed in-memory list. Mostly for tests.
pub struct StaticCorpus(pub Vec<Strategy>);

#[async_trait]
impl StrategyCorpus for StaticCorpus {
    async fn get_all(&self) -> Result<Vec<Strategy>> {
        Ok(self.0.clone())
    }
}

fn parse_corpus(data: &str, origin: &str) -> Result<Vec<Strategy>> {
    serde_json::from_str(data)
        .map_err(|e| AdvocateError::CorpusError(format!("parsing {origin}: {e}")))
}

/// Reject corpora the retriever cannot rank sensibly.
pub fn validate_corpus(strategies: &[Strategy]) -> Result<()> {
    if strategies.is_empty() {
        return Err(AdvocateError::CorpusError("corpus is empty".into()));
    }
    let mut seen = HashSet::new();
    for s in strategies {
        if s.id.trim().is_empty() {
            return Err(AdvocateError::CorpusError("strategy with empty id".into()));
        }
        if !seen.insert(s.id.as_str()) {
            return Err(AdvocateError::CorpusError(format!(
                "duplicate strategy id '{}'",
                s.id
            )));
        }
        if s.principle.trim().is_empty() {
            return Err(AdvocateError::CorpusError(format!(
                "strategy '{}' has no principle",
                s.id
            )));
        }
    }
    Ok(())
}

/// Text a strategy is embedded from when the corpus carries no vector.
fn embedding_text(s: &Strategy) -> String {
    format!(
        "{} {} {} {}",
        s.name,
        s.description,
        s.principle,
        s.applicability.join(" ")
    )
}

pub struct CorpusHandle {
    source: Arc<dyn StrategyCorpus>,
    embedder: Arc<dyn Embedder>,
    current: RwLock<Arc<[Strategy]>>,
}

impl CorpusHandle {
    /// Read and validate `source`, embedding any strategy that lacks a vector
    /// of the embedder's dimension.
    pub async fn load(
        source: Arc<dyn StrategyCorpus>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let strategies = Self::fetch(source.as_ref(), embedder.as_ref()).await?;
        Ok(Self {
            source,
            embedder,
            current: RwLock::new(strategies),
        })
    }

    async fn fetch(source: &dyn StrategyCorpus, embedder: &dyn Embedder) -> Result<Arc<[Strategy]>> {
        let mut strategies = source.get_all().await?;
        validate_corpus(&strategies)?;
        let dims = embedder.dimensions();
        let missing: Vec<usize> = (0..strategies.len())
            .filter(|&i| strategies[i].embedding.len() != dims)
            .collect();
        if !missing.is_empty() {
            let texts: Vec<String> = missing
                .iter()
                .map(|&i| embedding_text(&strategies[i]))
                .collect();
            let vectors = embedder.embed_batch(&texts).await?;
            if vectors.len() != missing.len() {
                return Err(AdvocateError::CorpusError(format!(
                    "embedder returned {} vectors for {} strategies",
                    vectors.len(),
                    missing.len()
                )));
            }
            for (i, vector) in missing.into_iter().zip(vectors) {
                strategies[i].embedding = vector;
            }
        }
        tracing::info!(strategies = strategies.len(), "Strategy corpus loaded");
        Ok(strategies.into())
    }

    /// Re-read the source. On failure the previous snapshot stays in place.
    pub async fn reload(&self) -> Result<usize> {
        let fresh = Self::fetch(self.source.as_ref(), self.embedder.as_ref()).await?;
        let count = fresh.len();
        *self.current.write().await = fresh;
        Ok(count)
    }

    pub async fn snapshot(&self) -> Arc<[Strategy]> {
        self.current.read().await.clone()
    }
}
