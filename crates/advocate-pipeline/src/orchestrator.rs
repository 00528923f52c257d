//! The turn orchestrator.
//!
//! Runs gate → tags → strategies → reply → rebuttal for a submission, and
//! gate → (optional re-analysis) → revised reply → rebuttal for feedback. The
//! gate always finishes before any generation call is made, and everything
//! after it runs under the per-turn deadline. Every turn, whatever its
//! outcome, is appended to its session and handed to the session writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use uuid::Uuid;

use advocate_llm::LlmClient;
use advocate_types::{
    AdvocateError, Feedback, GateVerdict, Result, Session, Turn, TurnOutcome, TurnResult,
    TurnState,
};

use crate::config::AdvocateConfig;
use crate::corpus::{BuiltinCorpus, CorpusHandle, JsonFileCorpus, StrategyCorpus};
use crate::embedding::{embedder_from_config, Embedder};
use crate::events::{EventEmitter, PipelineEvent};
use crate::feedback::{FeedbackRegenerator, PriorTurnContext};
use crate::gate::SafetyGate;
use crate::rebuttal::RebuttalGenerator;
use crate::reply::{DraftedReply, ReplyGenerator};
use crate::retrieval::StrategyRetriever;
use crate::store::{JsonlSessionStore, MemorySessionStore, SessionStore, SessionWriter};
use crate::structured::{GenerationSettings, StructuredCaller};
use crate::tags::TagExtractor;
use crate::turn::TurnBuilder;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct OrchestratorBuilder {
    config: AdvocateConfig,
    client: Arc<LlmClient>,
    embedder: Option<Arc<dyn Embedder>>,
    corpus: Option<Arc<CorpusHandle>>,
    store: Option<Arc<dyn SessionStore>>,
    events: Option<EventEmitter>,
}

impl OrchestratorBuilder {
    /// Embedder used for tag queries; defaults to the one the config names.
    /// A supplied corpus must have been loaded with an embedder of the same
    /// kind.
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn corpus(mut self, corpus: Arc<CorpusHandle>) -> Self {
        self.corpus = Some(corpus);
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Load whatever was not supplied from the config and start the session
    /// writer. Must run inside a tokio runtime.
    pub async fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let embedder = match self.embedder {
            Some(e) => e,
            None => embedder_from_config(&config)?,
        };

        let corpus = match self.corpus {
            Some(c) => c,
            None => {
                let source: Arc<dyn StrategyCorpus> = match &config.corpus_path {
                    Some(path) => Arc::new(JsonFileCorpus::new(path)),
                    None => Arc::new(BuiltinCorpus),
                };
                Arc::new(CorpusHandle::load(source, embedder.clone()).await?)
            }
        };

        let store: Arc<dyn SessionStore> = match (self.store, &config.session_log) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(JsonlSessionStore::new(path)),
            (None, None) => Arc::new(MemorySessionStore::new()),
        };

        let events = self.events.unwrap_or_default();
        let writer = SessionWriter::spawn(
            store,
            config.persist_retries,
            config.backoff(),
            events.clone(),
        );

        let caller = StructuredCaller::new(self.client, GenerationSettings::from(&config));

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                gate: SafetyGate::new(config.min_input_chars, config.min_input_words)?,
                tags: TagExtractor::new(caller.clone()),
                retriever: StrategyRetriever::new(embedder),
                replies: ReplyGenerator::new(caller.clone()),
                rebuttals: RebuttalGenerator::new(caller),
                corpus,
                sessions: RwLock::new(HashMap::new()),
                writer,
                events,
                config,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: AdvocateConfig,
    gate: SafetyGate,
    tags: TagExtractor,
    retriever: StrategyRetriever,
    replies: ReplyGenerator,
    rebuttals: RebuttalGenerator,
    corpus: Arc<CorpusHandle>,
    sessions: RwLock<HashMap<Uuid, Session>>,
    writer: SessionWriter,
    events: EventEmitter,
}

impl Orchestrator {
    pub fn builder(config: AdvocateConfig, client: Arc<LlmClient>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            client,
            embedder: None,
            corpus: None,
            store: None,
            events: None,
        }
    }

    pub fn config(&self) -> &AdvocateConfig {
        &self.inner.config
    }

    pub fn corpus(&self) -> &CorpusHandle {
        &self.inner.corpus
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// A copy of the session as it stands now.
    pub async fn session(&self, id: Uuid) -> Option<Session> {
        self.inner.sessions.read().await.get(&id).cloned()
    }

    /// Wait for queued session writes to finish.
    pub async fn flush_persistence(&self) {
        self.inner.writer.flush().await;
    }

    /// Start a session with `raw_input` and run its first turn.
    ///
    /// A halt is an `Ok` result. A generation failure is recorded as a failed
    /// turn in the session and returned as `Err`.
    pub async fn submit(&self, raw_input: &str, draft_reply: Option<&str>) -> Result<TurnResult> {
        let inner = &self.inner;
        let draft_reply = draft_reply.map(str::trim).filter(|d| !d.is_empty());
        let session = Session::new(raw_input, draft_reply.map(str::to_string));
        let session_id = session.id;
        inner.sessions.write().await.insert(session_id, session);

        let started = Instant::now();
        let mut turn = TurnBuilder::fresh(raw_input, draft_reply).with_events(inner.events.clone());
        self.announce(session_id, &turn, false);

        let verdict = inner.gate.evaluate(raw_input, draft_reply);
        self.report_rejection(session_id, &turn, &verdict);
        turn.set_verdict(verdict.clone());
        turn.advance(TurnState::Gated)?;

        if let Some(reason) = verdict.user_reason() {
            let halted = turn.halt(reason)?;
            return self.finish(session_id, halted, started).await;
        }

        let outcome = tokio::time::timeout(
            inner.config.turn_timeout(),
            self.forward_stages(&mut turn, raw_input, draft_reply),
        )
        .await
        .unwrap_or_else(|_| Err(self.turn_timed_out()));

        self.conclude(session_id, turn, outcome, started).await
    }

    /// Revise a finalized turn from a rating and critique, reusing its tags
    /// and strategies.
    pub async fn submit_feedback(
        &self,
        session_id: Uuid,
        turn_id: Uuid,
        rating: u8,
        critique: &str,
    ) -> Result<TurnResult> {
        self.submit_feedback_with(session_id, turn_id, rating, critique, false)
            .await
    }

    /// As [`submit_feedback`](Self::submit_feedback). With `reanalyze` set,
    /// tags and strategies are extracted and retrieved again first.
    pub async fn submit_feedback_with(
        &self,
        session_id: Uuid,
        turn_id: Uuid,
        rating: u8,
        critique: &str,
        reanalyze: bool,
    ) -> Result<TurnResult> {
        let inner = &self.inner;
        let feedback = Feedback::new(turn_id, rating, critique)?;

        let context = {
            let sessions = inner.sessions.read().await;
            let session = sessions
                .get(&session_id)
                .ok_or(AdvocateError::SessionNotFound(session_id))?;
            let prior = session.turn(turn_id).ok_or(AdvocateError::TurnNotFound {
                session: session_id,
                turn: turn_id,
            })?;
            PriorTurnContext::from_turn(prior)?
        };

        let started = Instant::now();
        let mut turn = TurnBuilder::successor(
            &context.original_input,
            context.draft_reply.as_deref(),
            context.tags.clone(),
            context.strategies.clone(),
            feedback.clone(),
        )
        .with_events(inner.events.clone());
        self.announce(session_id, &turn, true);

        let verdict = inner.gate.screen_feedback(&feedback.critique);
        self.report_rejection(session_id, &turn, &verdict);
        turn.set_verdict(verdict.clone());
        turn.advance(TurnState::Gated)?;

        if let Some(reason) = verdict.user_reason() {
            let halted = turn.halt(reason)?;
            return self.finish(session_id, halted, started).await;
        }

        let outcome = tokio::time::timeout(
            inner.config.turn_timeout(),
            self.regeneration_stages(&mut turn, context, &feedback, reanalyze),
        )
        .await
        .unwrap_or_else(|_| Err(self.turn_timed_out()));

        self.conclude(session_id, turn, outcome, started).await
    }

    // -- stages -------------------------------------------------------------

    async fn forward_stages(
        &self,
        turn: &mut TurnBuilder,
        raw_input: &str,
        draft_reply: Option<&str>,
    ) -> Result<(DraftedReply, String)> {
        self.analyze(turn, raw_input, draft_reply).await?;

        let inner = &self.inner;
        let drafted = inner
            .replies
            .generate(raw_input, draft_reply, &turn.strategies)
            .await?;
        turn.advance(TurnState::ReplyDrafted)?;

        let rebuttal = inner.rebuttals.critique(&drafted.reply).await?;
        turn.advance(TurnState::RebuttalDrafted)?;
        Ok((drafted, rebuttal))
    }

    async fn regeneration_stages(
        &self,
        turn: &mut TurnBuilder,
        mut context: PriorTurnContext,
        feedback: &Feedback,
        reanalyze: bool,
    ) -> Result<(DraftedReply, String)> {
        if reanalyze {
            self.analyze(turn, &context.original_input, context.draft_reply.as_deref())
                .await?;
            context.tags = turn.tags.clone();
            context.strategies = turn.strategies.clone();
        }
        FeedbackRegenerator::new(&self.inner.replies, &self.inner.rebuttals)
            .regenerate_into(turn, &context, feedback)
            .await
    }

    /// Tag extraction then strategy retrieval against the current corpus.
    async fn analyze(
        &self,
        turn: &mut TurnBuilder,
        raw_input: &str,
        draft_reply: Option<&str>,
    ) -> Result<()> {
        let inner = &self.inner;
        turn.tags = inner.tags.extract(raw_input, draft_reply).await?;
        turn.advance(TurnState::TagsExtracted)?;

        let corpus = inner.corpus.snapshot().await;
        turn.strategies = inner
            .retriever
            .retrieve(&turn.tags, &corpus, inner.config.top_k)
            .await?;
        turn.advance(TurnState::StrategiesSelected)?;
        Ok(())
    }

    // -- bookkeeping --------------------------------------------------------

    fn announce(&self, session_id: Uuid, turn: &TurnBuilder, regeneration: bool) {
        tracing::info!(%session_id, turn_id = %turn.id, regeneration, "Turn started");
        self.inner.events.emit(PipelineEvent::TurnStarted {
            session_id,
            turn_id: turn.id,
            regeneration,
        });
    }

    fn report_rejection(&self, session_id: Uuid, turn: &TurnBuilder, verdict: &GateVerdict) {
        if verdict.is_admissible() {
            return;
        }
        self.inner.events.emit(PipelineEvent::InputRejected {
            session_id,
            turn_id: turn.id,
            verdict: verdict.clone(),
        });
    }

    fn turn_timed_out(&self) -> AdvocateError {
        AdvocateError::ServiceUnavailable {
            message: format!(
                "turn exceeded {}ms deadline",
                self.inner.config.turn_timeout_ms
            ),
        }
    }

    /// Append `turn` to its session, queue the session for persistence and
    /// return the updated snapshot.
    async fn append(&self, session_id: Uuid, mut turn: Turn) -> Result<Session> {
        let snapshot = {
            let mut sessions = self.inner.sessions.write().await;
            let session = sessions
                .get_mut(&session_id)
                .ok_or(AdvocateError::SessionNotFound(session_id))?;
            turn.index = session.next_index();
            session.push_turn(turn);
            session.clone()
        };
        self.inner.writer.enqueue(snapshot.clone());
        Ok(snapshot)
    }

    async fn finish(&self, session_id: Uuid, turn: Turn, started: Instant) -> Result<TurnResult> {
        let turn_id = turn.id;
        let duration_ms = started.elapsed().as_millis() as u64;

        if let TurnOutcome::Halted { reason } = &turn.outcome {
            tracing::info!(%session_id, %turn_id, reason = %reason, "Turn halted");
            self.inner.events.emit(PipelineEvent::TurnHalted {
                turn_id,
                reason: reason.to_string(),
            });
        } else {
            tracing::info!(%session_id, %turn_id, duration_ms, "Turn completed");
            self.inner
                .events
                .emit(PipelineEvent::TurnCompleted { turn_id, duration_ms });
        }

        let session = self.append(session_id, turn).await?;
        session
            .turn(turn_id)
            .and_then(|t| TurnResult::from_turn(session_id, t))
            .ok_or_else(|| AdvocateError::Other(format!("turn {turn_id} has no result")))
    }

    async fn conclude(
        &self,
        session_id: Uuid,
        turn: TurnBuilder,
        outcome: Result<(DraftedReply, String)>,
        started: Instant,
    ) -> Result<TurnResult> {
        match outcome {
            Ok((drafted, rebuttal)) => {
                let done = turn.finalize(
                    drafted.reply,
                    drafted.rationale,
                    rebuttal,
                    drafted.input_kind,
                )?;
                self.finish(session_id, done, started).await
            }
            Err(error) => {
                let turn_id = turn.id;
                tracing::error!(%session_id, %turn_id, error = %error, "Turn failed");
                self.inner.events.emit(PipelineEvent::TurnFailed {
                    turn_id,
                    error: error.to_string(),
                });
                self.append(session_id, turn.fail(&error)).await?;
                Err(error)
            }
        }
    }
}
