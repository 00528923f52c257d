//! Feedback-driven regeneration.
//!
//! A regenerated turn always replays the full context of the turn it revises:
//! original input, draft, tags, strategies, reply, rationale and rebuttal.
//! Tags and strategies are reused as-is unless the caller asks the
//! orchestrator for a full re-analysis.

use advocate_types::{AdvocateError, Feedback, Result, RetrievedStrategy, Tag, Turn, TurnState};

use crate::rebuttal::RebuttalGenerator;
use crate::reply::{DraftedReply, ReplyGenerator};
use crate::turn::TurnBuilder;

#[derive(Debug, Clone, PartialEq)]
pub struct PriorTurnContext {
    pub original_input: String,
    pub draft_reply: Option<String>,
    pub tags: Vec<Tag>,
    pub strategies: Vec<RetrievedStrategy>,
    pub reply: String,
    pub rationale: String,
    pub rebuttal: String,
}

impl PriorTurnContext {
    /// Context of a finalized turn. Anything else has no reply to revise.
    pub fn from_turn(turn: &Turn) -> Result<Self> {
        match (turn.is_finalized(), turn.reply(), turn.rationale(), turn.rebuttal()) {
            (true, Some(reply), Some(rationale), Some(rebuttal)) => Ok(Self {
                original_input: turn.original_input.clone(),
                draft_reply: turn.draft_reply.clone(),
                tags: turn.tags.clone(),
                strategies: turn.strategies.clone(),
                reply: reply.to_string(),
                rationale: rationale.to_string(),
                rebuttal: rebuttal.to_string(),
            }),
            _ => Err(AdvocateError::InvalidFeedback(format!(
                "turn {} has no finalized reply to revise",
                turn.id
            ))),
        }
    }
}

/// (keywords, instruction) pairs matched against the critique.
const CRITIQUE_RULES: &[(&[&str], &str)] = &[
    (
        &["preachy", "aggressive", "harsh", "pushy", "judgmental", "judgy", "rude", "confrontational", "condescending", "moralizing", "angry"],
        "Use a softer framing: acknowledge the reader's view first, drop any moralizing, and keep the ask small and optional.",
    ),
    (
        &["long", "wordy", "verbose", "rambling", "shorter"],
        "Make it shorter: two sentences at most.",
    ),
    (
        &["vague", "generic", "abstract", "specific", "concrete"],
        "Be more concrete: use one specific example or fact instead of general statements.",
    ),
    (
        &["source", "evidence", "cite", "citation", "proof", "facts", "data"],
        "Back the main claim with a credible source such as a major health or science organization.",
    ),
    (
        &["formal", "robotic", "stiff", "academic", "casual"],
        "Sound more casual and human, like a friend talking in a comment thread.",
    ),
    (
        &["weak", "wishy", "passive", "direct", "bolder"],
        "Be more direct and confident about the main point while staying respectful.",
    ),
];

/// Instructions for the reviser derived from the rating and critique.
pub fn revision_guidance(feedback: &Feedback) -> Vec<String> {
    let mut guidance = Vec::new();
    guidance.push(
        match feedback.rating {
            0..=2 => "The previous reply missed the mark. Change the approach substantially, not just the wording.",
            3 => "The previous reply was acceptable. Make clear, moderate improvements.",
            _ => "The previous reply worked well. Keep its approach and polish it lightly.",
        }
        .to_string(),
    );

    let critique = feedback.critique.to_lowercase();
    for (keywords, instruction) in CRITIQUE_RULES {
        if keywords.iter().any(|k| critique.contains(k)) {
            guidance.push(instruction.to_string());
        }
    }

    guidance.push(
        "In the rationale, say what changed from the previous reply and why that should land better."
            .to_string(),
    );
    guidance
}

pub struct FeedbackRegenerator<'a> {
    replies: &'a ReplyGenerator,
    rebuttals: &'a RebuttalGenerator,
}

impl<'a> FeedbackRegenerator<'a> {
    pub fn new(replies: &'a ReplyGenerator, rebuttals: &'a RebuttalGenerator) -> Self {
        Self { replies, rebuttals }
    }

    pub async fn revise_reply(
        &self,
        context: &PriorTurnContext,
        feedback: &Feedback,
    ) -> Result<DraftedReply> {
        let guidance = revision_guidance(feedback);
        tracing::debug!(
            rating = feedback.rating,
            instructions = guidance.len(),
            "Revising reply from feedback"
        );
        self.replies.revise(context, feedback, &guidance).await
    }

    /// Revise the reply and draft a fresh rebuttal into `turn`, which must be
    /// in `gated`. Leaves it in `rebuttal_drafted`.
    pub async fn regenerate_into(
        &self,
        turn: &mut TurnBuilder,
        context: &PriorTurnContext,
        feedback: &Feedback,
    ) -> Result<(DraftedReply, String)> {
        let drafted = self.revise_reply(context, feedback).await?;
        turn.advance(TurnState::ReplyDrafted)?;
        let rebuttal = self.rebuttals.critique(&drafted.reply).await?;
        turn.advance(TurnState::RebuttalDrafted)?;
        Ok((drafted, rebuttal))
    }

    /// A complete successor turn for `feedback`. Its index is assigned when it
    /// is appended to the session.
    pub async fn regenerate(&self, context: &PriorTurnContext, feedback: &Feedback) -> Result<Turn> {
        let mut turn = TurnBuilder::successor(
            &context.original_input,
            context.draft_reply.as_deref(),
            context.tags.clone(),
            context.strategies.clone(),
            feedback.clone(),
        );
        turn.advance(TurnState::Gated)?;
        let (drafted, rebuttal) = self.regenerate_into(&mut turn, context, feedback).await?;
        turn.finalize(drafted.reply, drafted.rationale, rebuttal, drafted.input_kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn feedback(rating: u8, critique: &str) -> Feedback {
        Feedback::new(Uuid::new_v4(), rating, critique).unwrap()
    }

    #[test]
    fn preachy_low_rating_asks_for_softer_framing() {
        let g = revision_guidance(&feedback(2, "too preachy"));
        assert!(g[0].contains("substantially"));
        assert!(g.iter().any(|s| s.contains("softer framing")));
        assert!(g.last().unwrap().contains("rationale"));
    }

    #[test]
    fn multiple_critique_groups_stack() {
        let g = revision_guidance(&feedback(3, "Too long and a bit robotic"));
        assert!(g[0].contains("moderate"));
        assert!(g.iter().any(|s| s.contains("shorter")));
        assert!(g.iter().any(|s| s.contains("casual")));
        assert!(!g.iter().any(|s| s.contains("softer")));
    }

    #[test]
    fn high_rating_without_critique_is_polish_only() {
        let g = revision_guidance(&feedback(5, ""));
        assert_eq!(g.len(), 2);
        assert!(g[0].contains("polish"));
    }

    #[test]
    fn context_requires_finalized_turn() {
        let mut b = TurnBuilder::fresh("Meat is natural", None);
        b.advance(TurnState::Gated).unwrap();
        let halted = b.halt("x").unwrap();
        assert!(matches!(
            PriorTurnContext::from_turn(&halted),
            Err(AdvocateError::InvalidFeedback(_))
        ));
    }
}
