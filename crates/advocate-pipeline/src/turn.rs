//! Assembles a [`Turn`] while it moves through the state machine.

use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use advocate_types::{
    AdvocateError, Feedback, GateVerdict, InputKind, Result, RetrievedStrategy, Tag, Turn,
    TurnMachine, TurnOutcome, TurnState,
};

use crate::events::{EventEmitter, PipelineEvent};

pub struct TurnBuilder {
    pub id: Uuid,
    parent: Option<Uuid>,
    created_at: chrono::DateTime<Utc>,
    pub original_input: String,
    pub draft_reply: Option<String>,
    verdict: GateVerdict,
    pub tags: Vec<Tag>,
    pub strategies: Vec<RetrievedStrategy>,
    feedback: Option<Feedback>,
    machine: TurnMachine,
    events: Option<EventEmitter>,
    stage_started: Instant,
}

impl TurnBuilder {
    /// A turn for a new submission, in `start`.
    pub fn fresh(raw_input: &str, draft_reply: Option<&str>) -> Self {
        Self::with_machine(TurnMachine::new(), raw_input, draft_reply, None, None)
    }

    /// A turn regenerating `feedback.turn_id`, in `regeneration_requested`.
    /// Input, tags and strategies are copied from the predecessor.
    pub fn successor(
        original_input: &str,
        draft_reply: Option<&str>,
        tags: Vec<Tag>,
        strategies: Vec<RetrievedStrategy>,
        feedback: Feedback,
    ) -> Self {
        let parent = feedback.turn_id;
        let mut builder = Self::with_machine(
            TurnMachine::regeneration(),
            original_input,
            draft_reply,
            Some(parent),
            Some(feedback),
        );
        builder.tags = tags;
        builder.strategies = strategies;
        builder
    }

    fn with_machine(
        machine: TurnMachine,
        original_input: &str,
        draft_reply: Option<&str>,
        parent: Option<Uuid>,
        feedback: Option<Feedback>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent,
            created_at: Utc::now(),
            original_input: original_input.to_string(),
            draft_reply: draft_reply.map(str::to_string),
            verdict: GateVerdict::Admissible,
            tags: Vec::new(),
            strategies: Vec::new(),
            feedback,
            machine,
            events: None,
            stage_started: Instant::now(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> TurnState {
        self.machine.state()
    }

    pub fn set_verdict(&mut self, verdict: GateVerdict) {
        self.verdict = verdict;
    }

    /// Transition and report how long the finished stage took.
    pub fn advance(&mut self, to: TurnState) -> Result<()> {
        self.machine.transition(to)?;
        let duration_ms = self.stage_started.elapsed().as_millis() as u64;
        self.stage_started = Instant::now();
        tracing::debug!(turn_id = %self.id, state = %to, duration_ms, "Turn advanced");
        if let Some(events) = &self.events {
            events.emit(PipelineEvent::StageCompleted {
                turn_id: self.id,
                state: to,
                duration_ms,
            });
        }
        Ok(())
    }

    pub fn halt(mut self, reason: &str) -> Result<Turn> {
        self.advance(TurnState::Halted)?;
        Ok(self.build(TurnOutcome::Halted {
            reason: reason.to_string(),
        }))
    }

    /// Move from `rebuttal_drafted` to `finalized`.
    pub fn finalize(
        mut self,
        reply: String,
        rationale: String,
        rebuttal: String,
        input_kind: InputKind,
    ) -> Result<Turn> {
        self.advance(TurnState::Finalized)?;
        Ok(self.build(TurnOutcome::Completed {
            reply,
            rationale,
            rebuttal,
            input_kind,
        }))
    }

    /// Record a failure. Never finalized, so never mistaken for a usable reply.
    pub fn fail(mut self, error: &AdvocateError) -> Turn {
        if !self.machine.state().is_terminal() {
            // Every non-terminal state may fail.
            let _ = self.advance(TurnState::Failed);
        }
        self.build(TurnOutcome::Failed {
            error: error.to_string(),
        })
    }

    /// The index is assigned when the turn is appended to its session.
    fn build(self, outcome: TurnOutcome) -> Turn {
        Turn {
            id: self.id,
            index: 0,
            parent: self.parent,
            created_at: self.created_at,
            original_input: self.original_input,
            draft_reply: self.draft_reply,
            verdict: self.verdict,
            tags: self.tags,
            strategies: self.strategies,
            feedback: self.feedback,
            outcome,
            states: self.machine.into_history(),
        }
    }
}
