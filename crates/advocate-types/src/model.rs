use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AdvocateError, Result, TurnState};

/// Reason shown to the caller for every injection halt. The matched pattern
/// is only ever logged.
pub const GENERIC_HALT_REASON: &str =
    "This request can't be processed. Please share the comment you'd like to respond to.";

// ---------------------------------------------------------------------------
// GateVerdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GateVerdict {
    Admissible,
    NeedsClarification { reason: String },
    InjectionSuspected { pattern: String },
}

impl GateVerdict {
    pub fn is_admissible(&self) -> bool {
        matches!(self, GateVerdict::Admissible)
    }

    /// The reason handed back to the caller when this verdict halts a turn.
    /// Injection verdicts never reveal what matched.
    pub fn user_reason(&self) -> Option<&str> {
        match self {
            GateVerdict::Admissible => None,
            GateVerdict::NeedsClarification { reason } => Some(reason),
            GateVerdict::InjectionSuspected { .. } => Some(GENERIC_HALT_REASON),
        }
    }
}

// ---------------------------------------------------------------------------
// Tag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagCategory {
    Theme,
    Topic,
    #[serde(alias = "emotional-tone", alias = "tone")]
    EmotionalTone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub category: TagCategory,
    pub label: String,
    /// Confidence in [0, 1].
    pub score: f32,
}

impl Tag {
    pub fn new(category: TagCategory, label: impl Into<String>, score: f32) -> Self {
        Self {
            category,
            label: label.into(),
            score,
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy corpus entries
// ---------------------------------------------------------------------------

/// One behavioral-science persuasion technique from the read-only corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    /// Research background for curators. Never sent to the model.
    pub description: String,
    /// Short, catalog-free guidance the reply generator is conditioned on.
    pub principle: String,
    #[serde(default)]
    pub applicability: Vec<String>,
    /// Precomputed embedding; computed at load when absent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

/// A strategy selected for a turn together with its similarity score.
///
/// Stores a snapshot of the fields the turn used rather than the whole corpus
/// entry, so session records stay small and stable across corpus reloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedStrategy {
    pub strategy_id: String,
    pub name: String,
    pub principle: String,
    /// Cosine similarity against the tag query; not a probability.
    pub score: f32,
}

impl RetrievedStrategy {
    pub fn from_strategy(strategy: &Strategy, score: f32) -> Self {
        Self {
            strategy_id: strategy.id.clone(),
            name: strategy.name.clone(),
            principle: strategy.principle.clone(),
            score,
        }
    }
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// The turn being rated.
    pub turn_id: Uuid,
    pub rating: u8,
    pub critique: String,
    pub submitted_at: DateTime<Utc>,
}

impl Feedback {
    pub fn new(turn_id: Uuid, rating: u8, critique: impl Into<String>) -> Result<Self> {
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(AdvocateError::InvalidFeedback(format!(
                "rating {rating} outside {MIN_RATING}..={MAX_RATING}"
            )));
        }
        Ok(Self {
            turn_id,
            rating,
            critique: critique.into().trim().to_string(),
            submitted_at: Utc::now(),
        })
    }

    pub fn is_low(&self) -> bool {
        self.rating <= 2
    }
}

// ---------------------------------------------------------------------------
// Turn
// ---------------------------------------------------------------------------

/// Whether the user's text was their own draft or somebody else's comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    DraftReply,
    Comment,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::DraftReply => "draft_reply",
            InputKind::Comment => "comment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Halted {
        reason: String,
    },
    Completed {
        reply: String,
        rationale: String,
        rebuttal: String,
        input_kind: InputKind,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub index: usize,
    /// The turn this one regenerates, if any.
    pub parent: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub original_input: String,
    pub draft_reply: Option<String>,
    pub verdict: GateVerdict,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub strategies: Vec<RetrievedStrategy>,
    /// Feedback on the parent turn that produced this one.
    pub feedback: Option<Feedback>,
    pub outcome: TurnOutcome,
    pub states: Vec<TurnState>,
}

impl Turn {
    pub fn is_finalized(&self) -> bool {
        self.states.last() == Some(&TurnState::Finalized)
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Halted { .. })
    }

    pub fn reply(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::Completed { reply, .. } => Some(reply),
            _ => None,
        }
    }

    pub fn rationale(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::Completed { rationale, .. } => Some(rationale),
            _ => None,
        }
    }

    pub fn rebuttal(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::Completed { rebuttal, .. } => Some(rebuttal),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One advocacy interaction: the submitted text and every turn run against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub raw_input: String,
    pub draft_reply: Option<String>,
    pub turns: Vec<Turn>,
}

impl Session {
    pub fn new(raw_input: impl Into<String>, draft_reply: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            raw_input: raw_input.into(),
            draft_reply,
            turns: Vec::new(),
        }
    }

    /// Append a finished turn. Earlier turns are never modified.
    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turn(&self, id: Uuid) -> Option<&Turn> {
        self.turns.iter().find(|t| t.id == id)
    }

    pub fn latest_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn next_index(&self) -> usize {
        self.turns.len()
    }
}

// ---------------------------------------------------------------------------
// TurnResult: what the user-facing API hands back
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TurnResult {
    Halted {
        session_id: Uuid,
        turn_id: Uuid,
        reason: String,
    },
    Completed {
        session_id: Uuid,
        turn_id: Uuid,
        reply: String,
        rationale: String,
        rebuttal: String,
        input_kind: InputKind,
    },
}

impl TurnResult {
    /// Project a turn onto the caller-facing result. Failed turns have no
    /// result; their error is returned instead.
    pub fn from_turn(session_id: Uuid, turn: &Turn) -> Option<Self> {
        match &turn.outcome {
            TurnOutcome::Halted { reason } => Some(TurnResult::Halted {
                session_id,
                turn_id: turn.id,
                reason: reason.clone(),
            }),
            TurnOutcome::Completed {
                reply,
                rationale,
                rebuttal,
                input_kind,
            } => Some(TurnResult::Completed {
                session_id,
                turn_id: turn.id,
                reply: reply.clone(),
                rationale: rationale.clone(),
                rebuttal: rebuttal.clone(),
                input_kind: *input_kind,
            }),
            TurnOutcome::Failed { .. } => None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            TurnResult::Halted { session_id, .. } | TurnResult::Completed { session_id, .. } => {
                *session_id
            }
        }
    }

    pub fn turn_id(&self) -> Uuid {
        match self {
            TurnResult::Halted { turn_id, .. } | TurnResult::Completed { turn_id, .. } => *turn_id,
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self, TurnResult::Halted { .. })
    }
}
