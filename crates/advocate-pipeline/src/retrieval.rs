//! Strategy retrieval: rank the corpus against a turn's tags.
//!
//! The query vector is the score-weighted centroid of the tag embeddings
//! (each tag embedded as "category label", all tags in one batch). Every
//! strategy is scored by cosine similarity and the list is stable-sorted
//! descending, so equal scores keep corpus order.

use std::sync::Arc;

use advocate_types::{Result, RetrievedStrategy, Strategy, Tag};

use crate::embedding::{cosine, Embedder};

pub struct StrategyRetriever {
    embedder: Arc<dyn Embedder>,
}

impl StrategyRetriever {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    pub async fn query_vector(&self, tags: &[Tag]) -> Result<Vec<f32>> {
        let dims = self.embedder.dimensions();
        let mut centroid = vec![0.0f32; dims];
        if tags.is_empty() {
            return Ok(centroid);
        }

        let texts: Vec<String> = tags
            .iter()
            .map(|t| format!("{} {}", category_words(t), t.label))
            .collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let total: f32 = tags.iter().map(|t| t.score.max(0.0)).sum();
        let uniform = total <= f32::EPSILON;

        for (tag, vector) in tags.iter().zip(vectors) {
            let weight = if uniform { 1.0 } else { tag.score.max(0.0) };
            for (c, v) in centroid.iter_mut().zip(vector) {
                *c += weight * v;
            }
        }
        Ok(centroid)
    }

    /// Top `k` strategies for `tags`. Returns fewer when the corpus is smaller,
    /// and nothing when `k` is zero.
    pub async fn retrieve(
        &self,
        tags: &[Tag],
        corpus: &[Strategy],
        k: usize,
    ) -> Result<Vec<RetrievedStrategy>> {
        if k == 0 || corpus.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.query_vector(tags).await?;

        let mut scored: Vec<(usize, f32)> = corpus
            .iter()
            .enumerate()
            .map(|(i, s)| (i, cosine(&query, &s.embedding)))
            .collect();
        // sort_by is stable: ties stay in corpus order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let picked: Vec<RetrievedStrategy> = scored
            .into_iter()
            .take(k)
            .map(|(i, score)| RetrievedStrategy::from_strategy(&corpus[i], score))
            .collect();

        tracing::debug!(
            tags = tags.len(),
            corpus = corpus.len(),
            selected = ?picked.iter().map(|s| s.strategy_id.as_str()).collect::<Vec<_>>(),
            "Strategies ranked"
        );
        Ok(picked)
    }
}

fn category_words(tag: &Tag) -> &'static str {
    use advocate_types::TagCategory::*;
    match tag.category {
        Theme => "theme",
        Topic => "topic",
        EmotionalTone => "tone",
    }
}
