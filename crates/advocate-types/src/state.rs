//! Per-turn state machine.
//!
//! A forward turn walks `start → gated → tags_extracted → strategies_selected →
//! reply_drafted → rebuttal_drafted → finalized`, or stops at `halted` straight
//! after the gate. A regenerated turn begins at `regeneration_requested` and,
//! unless a full re-analysis was asked for, jumps from `gated` to
//! `reply_drafted`. Any non-terminal state may fall into `failed`.

use serde::{Deserialize, Serialize};

use crate::{AdvocateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Start,
    RegenerationRequested,
    Gated,
    Halted,
    TagsExtracted,
    StrategiesSelected,
    ReplyDrafted,
    RebuttalDrafted,
    Finalized,
    Failed,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Start => "start",
            TurnState::RegenerationRequested => "regeneration_requested",
            TurnState::Gated => "gated",
            TurnState::Halted => "halted",
            TurnState::TagsExtracted => "tags_extracted",
            TurnState::StrategiesSelected => "strategies_selected",
            TurnState::ReplyDrafted => "reply_drafted",
            TurnState::RebuttalDrafted => "rebuttal_drafted",
            TurnState::Finalized => "finalized",
            TurnState::Failed => "failed",
        }
    }

    /// No further forward progress is possible from a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnState::Halted | TurnState::Finalized | TurnState::Failed
        )
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the current state of one turn and every state it passed through.
#[derive(Debug, Clone)]
pub struct TurnMachine {
    state: TurnState,
    history: Vec<TurnState>,
    regenerating: bool,
}

impl TurnMachine {
    /// A turn created by a fresh submission.
    pub fn new() -> Self {
        Self {
            state: TurnState::Start,
            history: vec![TurnState::Start],
            regenerating: false,
        }
    }

    /// A successor turn created by feedback on a finalized turn.
    pub fn regeneration() -> Self {
        Self {
            state: TurnState::RegenerationRequested,
            history: vec![TurnState::RegenerationRequested],
            regenerating: true,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn history(&self) -> &[TurnState] {
        &self.history
    }

    pub fn into_history(self) -> Vec<TurnState> {
        self.history
    }

    fn allows(&self, to: TurnState) -> bool {
        use TurnState::*;
        if self.state.is_terminal() {
            return false;
        }
        if to == Failed {
            return true;
        }
        match (self.state, to) {
            (Start, Gated) | (RegenerationRequested, Gated) => true,
            (Gated, Halted) | (Gated, TagsExtracted) => true,
            (Gated, ReplyDrafted) => self.regenerating,
            (TagsExtracted, StrategiesSelected) => true,
            (StrategiesSelected, ReplyDrafted) => true,
            (ReplyDrafted, RebuttalDrafted) => true,
            (RebuttalDrafted, Finalized) => true,
            _ => false,
        }
    }

    /// Move to `to`, or fail with `InvalidTransition` if the edge does not exist.
    pub fn transition(&mut self, to: TurnState) -> Result<()> {
        if !self.allows(to) {
            return Err(AdvocateError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.history.push(to);
        Ok(())
    }
}

impl Default for TurnMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_reaches_finalized() {
        let mut m = TurnMachine::new();
        for s in [
            TurnState::Gated,
            TurnState::TagsExtracted,
            TurnState::StrategiesSelected,
            TurnState::ReplyDrafted,
            TurnState::RebuttalDrafted,
            TurnState::Finalized,
        ] {
            m.transition(s).unwrap();
        }
        assert_eq!(m.state(), TurnState::Finalized);
        assert_eq!(m.history().len(), 7);
        assert_eq!(m.history()[0], TurnState::Start);
    }

    #[test]
    fn halted_only_from_gated() {
        let mut m = TurnMachine::new();
        assert!(m.transition(TurnState::Halted).is_err());
        m.transition(TurnState::Gated).unwrap();
        m.transition(TurnState::Halted).unwrap();
        assert!(m.state().is_terminal());
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut m = TurnMachine::new();
        m.transition(TurnState::Gated).unwrap();
        m.transition(TurnState::Halted).unwrap();
        let err = m.transition(TurnState::TagsExtracted).unwrap_err();
        assert!(matches!(
            err,
            AdvocateError::InvalidTransition {
                from: TurnState::Halted,
                to: TurnState::TagsExtracted
            }
        ));
        assert!(m.transition(TurnState::Failed).is_err());
    }

    #[test]
    fn forward_turn_cannot_skip_retrieval() {
        let mut m = TurnMachine::new();
        m.transition(TurnState::Gated).unwrap();
        assert!(m.transition(TurnState::ReplyDrafted).is_err());
    }

    #[test]
    fn regeneration_may_skip_straight_to_reply() {
        let mut m = TurnMachine::regeneration();
        m.transition(TurnState::Gated).unwrap();
        m.transition(TurnState::ReplyDrafted).unwrap();
        m.transition(TurnState::RebuttalDrafted).unwrap();
        m.transition(TurnState::Finalized).unwrap();
        assert_eq!(
            m.into_history(),
            vec![
                TurnState::RegenerationRequested,
                TurnState::Gated,
                TurnState::ReplyDrafted,
                TurnState::RebuttalDrafted,
                TurnState::Finalized,
            ]
        );
    }

    #[test]
    fn any_live_state_can_fail() {
        let mut m = TurnMachine::new();
        m.transition(TurnState::Gated).unwrap();
        m.transition(TurnState::TagsExtracted).unwrap();
        m.transition(TurnState::Failed).unwrap();
        assert_eq!(m.state(), TurnState::Failed);
    }

    #[test]
    fn state_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&TurnState::StrategiesSelected).unwrap(),
            "\"strategies_selected\""
        );
        let s: TurnState = serde_json::from_str("\"rebuttal_drafted\"").unwrap();
        assert_eq!(s, TurnState::RebuttalDrafted);
    }
}
