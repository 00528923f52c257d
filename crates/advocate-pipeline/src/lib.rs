//! Reply pipeline: safety gate, tag extraction, strategy retrieval, reply and
//! rebuttal generation, and feedback-driven regeneration.
//!
//! [`Orchestrator`] is the entry point. It sequences the stages for each turn,
//! enforces halts and deadlines, and hands every session snapshot to a
//! background [`SessionWriter`].

pub mod config;
pub mod corpus;
pub mod embedding;
pub mod events;
pub mod feedback;
pub mod gate;
pub mod orchestrator;
pub mod prompts;
pub mod rebuttal;
pub mod reply;
pub mod retrieval;
pub mod retry;
pub mod store;
pub mod structured;
pub mod tags;
pub mod turn;

pub use config::{AdvocateConfig, EmbedderKind};
pub use corpus::{BuiltinCorpus, CorpusHandle, JsonFileCorpus, StaticCorpus, StrategyCorpus};
pub use embedding::{cosine, embedder_from_config, Embedder, HashingEmbedder, OpenAiEmbedder};
pub use events::{EventEmitter, PipelineEvent};
pub use feedback::{revision_guidance, FeedbackRegenerator, PriorTurnContext};
pub use gate::SafetyGate;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use rebuttal::RebuttalGenerator;
pub use reply::{DraftedReply, ReplyGenerator};
pub use retrieval::StrategyRetriever;
pub use retry::{execute_with_retry, BackoffPolicy};
pub use store::{JsonlSessionStore, MemorySessionStore, SessionStore, SessionWriter};
pub use structured::{GenerationSettings, StageOutput, StructuredCaller};
pub use tags::TagExtractor;
pub use turn::TurnBuilder;
