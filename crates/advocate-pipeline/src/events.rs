//! Turn lifecycle events.
//!
//! [`PipelineEvent`]s go out over a [`tokio::sync::broadcast`] channel, so
//! observers such as the CLI's verbose mode can follow a turn without touching
//! orchestrator internals.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use advocate_types::{GateVerdict, TurnState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    TurnStarted {
        session_id: Uuid,
        turn_id: Uuid,
        regeneration: bool,
    },
    StageCompleted {
        turn_id: Uuid,
        state: TurnState,
        duration_ms: u64,
    },
    /// A submission or critique the gate refused. Carries the internal
    /// verdict, so it is for audit consumers only.
    InputRejected {
        session_id: Uuid,
        turn_id: Uuid,
        verdict: GateVerdict,
    },
    TurnHalted {
        turn_id: Uuid,
        reason: String,
    },
    TurnCompleted {
        turn_id: Uuid,
        duration_ms: u64,
    },
    TurnFailed {
        turn_id: Uuid,
        error: String,
    },
    SessionPersisted {
        session_id: Uuid,
        turns: usize,
    },
    PersistenceFailed {
        session_id: Uuid,
        error: String,
    },
}

#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Send to every current subscriber. Dropped when nobody is listening.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_stage_events_in_order() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let turn_id = Uuid::new_v4();

        for state in [TurnState::Gated, TurnState::TagsExtracted] {
            emitter.emit(PipelineEvent::StageCompleted {
                turn_id,
                state,
                duration_ms: 1,
            });
        }

        for expected in [TurnState::Gated, TurnState::TagsExtracted] {
            match rx.recv().await.unwrap() {
                PipelineEvent::StageCompleted { state, .. } => assert_eq!(state, expected),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let emitter = EventEmitter::default();
        emitter.emit(PipelineEvent::PersistenceFailed {
            session_id: Uuid::new_v4(),
            error: "disk full".into(),
        });
    }

    #[test]
    fn halted_event_serializes_reason() {
        let event = PipelineEvent::TurnHalted {
            turn_id: Uuid::nil(),
            reason: "input too vague".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["TurnHalted"]["reason"], "input too vague");
    }

    #[test]
    fn rejection_event_carries_verdict() {
        let event = PipelineEvent::InputRejected {
            session_id: Uuid::nil(),
            turn_id: Uuid::nil(),
            verdict: GateVerdict::InjectionSuspected {
                pattern: "role_override".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["InputRejected"]["verdict"]["verdict"], "injection_suspected");
        assert_eq!(json["InputRejected"]["verdict"]["pattern"], "role_override");
    }
}
