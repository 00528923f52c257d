use std::collections::HashSet;

use serde::Deserialize;

use advocate_types::{Result, Tag};

use crate::prompts;
use crate::structured::{StageOutput, StructuredCaller};

#[derive(Debug, Deserialize)]
pub struct TagOutput {
    pub tags: Vec<Tag>,
}

impl StageOutput for TagOutput {
    const STAGE: &'static str = "tags";
    const SCHEMA: &'static str = r#"{"tags": [{"category": "theme" | "topic" | "emotional_tone", "label": string, "score": number between 0 and 1}]}"#;

    fn check(&self) -> std::result::Result<(), String> {
        if self.tags.is_empty() {
            return Err("tags must not be empty".into());
        }
        for tag in &self.tags {
            if tag.label.trim().is_empty() {
                return Err("tag label must not be empty".into());
            }
            if !tag.score.is_finite() || !(0.0..=1.0).contains(&tag.score) {
                return Err(format!(
                    "score for '{}' must be between 0 and 1, got {}",
                    tag.label, tag.score
                ));
            }
        }
        Ok(())
    }
}

/// Derives themes, topics and emotional tone from admissible input.
pub struct TagExtractor {
    caller: StructuredCaller,
}

impl TagExtractor {
    pub fn new(caller: StructuredCaller) -> Self {
        Self { caller }
    }

    /// Non-empty on success. Labels are trimmed and repeated
    /// (category, label) pairs collapse to their first occurrence.
    pub async fn extract(&self, raw_input: &str, draft_reply: Option<&str>) -> Result<Vec<Tag>> {
        let output: TagOutput = self
            .caller
            .call(prompts::tag_messages(raw_input, draft_reply), |_: &TagOutput| Ok(()))
            .await?;
        Ok(dedupe(output.tags))
    }
}

fn dedupe(tags: Vec<Tag>) -> Vec<Tag> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .filter_map(|mut tag| {
            tag.label = tag.label.trim().to_string();
            seen.insert((tag.category, tag.label.to_lowercase()))
                .then_some(tag)
        })
        .collect()
}
