//! Shared error taxonomy and data model for the advocate reply pipeline.
//!
//! This crate provides the foundational types used across all other advocate crates:
//! - `AdvocateError`: unified error taxonomy
//! - `Session` / `Turn`: the interaction record and its pipeline passes
//! - `GateVerdict`, `Tag`, `Strategy`, `RetrievedStrategy`, `Feedback`: stage outputs
//! - `TurnState`: the per-turn state machine

mod model;
mod state;

pub use model::*;
pub use state::{TurnMachine, TurnState};

use uuid::Uuid;

/// Unified error type for all advocate subsystems.
#[derive(Debug, thiserror::Error)]
pub enum AdvocateError {
    // === LLM Provider Errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout { provider: String, timeout_ms: u64 },

    // === Stage Errors ===
    #[error("Malformed output from stage '{stage}': {message}")]
    MalformedOutput { stage: String, message: String },

    #[error("Generation failed for stage '{stage}' after {attempts} attempts")]
    GenerationFailed { stage: String, attempts: usize },

    #[error("Generation service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("Session store write failed: {0}")]
    PersistenceFailure(String),

    // === Session Errors ===
    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error("Turn {turn} not found in session {session}")]
    TurnNotFound { session: Uuid, turn: Uuid },

    #[error("Invalid feedback: {0}")]
    InvalidFeedback(String),

    #[error("Invalid turn transition from {from} to {to}")]
    InvalidTransition { from: TurnState, to: TurnState },

    // === Setup Errors ===
    #[error("Strategy corpus error: {0}")]
    CorpusError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl AdvocateError {
    /// Returns `true` if the error is transient and the call may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdvocateError::RateLimited { .. }
                | AdvocateError::RequestTimeout { .. }
                | AdvocateError::ProviderError {
                    retryable: true,
                    ..
                }
        )
    }

    /// Returns `true` if the error means the generation service could not be
    /// reached or did not answer in time.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            AdvocateError::RateLimited { .. }
                | AdvocateError::RequestTimeout { .. }
                | AdvocateError::ProviderError { .. }
                | AdvocateError::ServiceUnavailable { .. }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AdvocateError::AuthError { .. }
                | AdvocateError::ConfigError(_)
                | AdvocateError::CorpusError(_)
                | AdvocateError::InvalidFeedback(_)
        )
    }

    /// Text safe to show the person using the tool. Internal detail stays in
    /// the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            AdvocateError::ServiceUnavailable { .. }
            | AdvocateError::RequestTimeout { .. }
            | AdvocateError::RateLimited { .. }
            | AdvocateError::ProviderError { .. }
            | AdvocateError::AuthError { .. } => {
                "Sorry, the writing assistant is unavailable right now. Please try again in a moment."
            }
            AdvocateError::GenerationFailed { .. } | AdvocateError::MalformedOutput { .. } => {
                "Sorry, we couldn't put together a reply this time. Try rephrasing your input."
            }
            AdvocateError::SessionNotFound(_) | AdvocateError::TurnNotFound { .. } => {
                "That conversation could not be found. Please start a new one."
            }
            AdvocateError::InvalidFeedback(_) => {
                "Feedback needs a rating from 1 to 5 on a reply that was generated."
            }
            _ => "Sorry, something went wrong. Please try again.",
        }
    }
}

/// A convenience alias for `Result<T, AdvocateError>`.
pub type Result<T> = std::result::Result<T, AdvocateError>;
