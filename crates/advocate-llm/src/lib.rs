//! Language-model client used by the advocate pipeline stages.
//!
//! Provides the `ProviderAdapter` trait, `DynProvider` wrapper, middleware chain,
//! model catalog, and `LlmClient` for routing requests by provider.

mod client;
mod openai;
mod provider;
mod types;

pub use client::*;
pub use openai::{OpenAiAdapter, DEFAULT_EMBEDDING_MODEL};
pub use provider::*;
pub use types::*;
