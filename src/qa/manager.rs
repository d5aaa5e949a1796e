//! Question turn orchestration
//!
//! One turn: detect the quota, size and run retrieval, compact the
//! conversation if it would crowd out evidence, trim, prepare the context's
//! session, stream the structured answer, then record the turn and rebase the
//! session when it is nearly full.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::prompts;
use super::protocol::{AskRequest, QaRequest, QaResponse, StreamEvent, TurnOutcome, TurnResult};
use crate::config::{Config, SummarizerBackend};
use crate::context::budget_detector::BudgetDetector;
use crate::context::conversation::{ConversationStateManager, SummarizationOutcome};
use crate::context::formatting::{format_chunks, resolve_citations};
use crate::context::models::{ChatMessage, ConversationState, UseCase};
use crate::context::retrieval_sizer::RetrievalSizer;
use crate::context::summarizer::{
    ConcatenationSummarizer, EngineSummarizer, LLMSummarizer, Summarizer,
};
use crate::context::token_budget::BudgetError;
use crate::context::token_estimator::build_estimator;
use crate::context::trimmer::{BudgetTrimmer, TrimResult};
use crate::engine::{
    EngineError, GenerationEngine, GenerationSession, PromptOptions, SessionInput, SessionOptions,
};
use crate::error::{ContextError, Result};
use crate::metrics::METRICS;
use crate::session::{session_options_for, stream_with_retry, RequestGuard, SessionRegistry};
use crate::store::ChunkStore;
use crate::stream::{answer_schema, StreamDecoder};
use crate::time_operation;

/// A streamed turn before post-turn bookkeeping
struct Streamed {
    result: TurnResult,
    session: Option<Arc<dyn GenerationSession>>,
    system_prompt: String,
}

pub struct QaManager {
    config: Config,
    store: Arc<dyn ChunkStore>,
    registry: Arc<SessionRegistry>,
    detector: BudgetDetector,
    sizer: RetrievalSizer,
    trimmer: BudgetTrimmer,
    conversation: ConversationStateManager,
}

impl QaManager {
    /// Manager with an explicit summarizer
    pub fn new(
        config: Config,
        engine: Arc<dyn GenerationEngine>,
        store: Arc<dyn ChunkStore>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(engine));
        Self::assemble(config, registry, store, summarizer)
    }

    /// Manager whose summarizer is chosen by `config.summarizer.backend`
    pub fn from_config(
        config: Config,
        engine: Arc<dyn GenerationEngine>,
        store: Arc<dyn ChunkStore>,
    ) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(engine));
        let summarizer: Arc<dyn Summarizer> = match config.summarizer.backend {
            SummarizerBackend::Engine => Arc::new(EngineSummarizer::new(
                registry.clone(),
                config.session.retry.clone(),
            )),
            SummarizerBackend::Http => {
                Arc::new(LLMSummarizer::new(config.summarizer.http.clone())?)
            }
            SummarizerBackend::Concatenation => Arc::new(ConcatenationSummarizer),
        };
        Self::assemble(config, registry, store, summarizer)
    }

    fn assemble(
        config: Config,
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ChunkStore>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self> {
        config.validate()?;

        let estimator = build_estimator(config.qa.estimator);
        let detector = BudgetDetector::new(
            registry.engine().clone(),
            config.token_budget.fallback_quota,
        );
        let sizer = RetrievalSizer::new(config.retrieval.clone());
        let trimmer = BudgetTrimmer::new(config.token_budget.clone(), estimator.clone());
        let conversation =
            ConversationStateManager::new(config.conversation.clone(), summarizer, estimator);

        info!(
            "QA manager ready (summarizer: {:?}, estimator: {:?})",
            config.summarizer.backend, config.qa.estimator
        );

        Ok(Self {
            config,
            store,
            registry,
            detector,
            sizer,
            trimmer,
            conversation,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn detector(&self) -> &BudgetDetector {
        &self.detector
    }

    /// Dispatch a boundary request. Stream events of an `Ask` go to `events`.
    pub async fn handle(
        &self,
        request: QaRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<QaResponse> {
        request.validate()?;
        match request {
            QaRequest::Ask(ask) => {
                let context_id = ask.context_id.clone();
                match self.ask(ask, events).await? {
                    TurnOutcome::Completed(result) => Ok(QaResponse::Answered(result)),
                    TurnOutcome::Cancelled => Ok(QaResponse::Cancelled { context_id }),
                }
            }
            QaRequest::Cancel { context_id } => {
                let found = self.cancel(&context_id);
                Ok(QaResponse::CancelRequested { context_id, found })
            }
            QaRequest::Reset { context_id } => {
                self.reset(context_id.as_deref()).await;
                Ok(QaResponse::ResetComplete { context_id })
            }
        }
    }

    /// Cancel the in-flight request of a context
    pub fn cancel(&self, context_id: &str) -> bool {
        self.registry.cancel(context_id)
    }

    /// Destroy one context, or everything including the cached quota
    pub async fn reset(&self, context_id: Option<&str>) {
        match context_id {
            Some(context_id) => self.registry.destroy(context_id).await,
            None => {
                self.registry.reset().await;
                self.detector.invalidate().await;
                info!("Reset all generation sessions");
            }
        }
    }

    /// Append multimodal input to a chat context's session
    pub async fn attach(&self, context_id: &str, input: SessionInput) -> Result<()> {
        let system_prompt = prompts::system_prompt(&self.config.qa.system_prompt, UseCase::Chat);
        let session = self
            .registry
            .get_or_create(context_id, &self.session_options(&system_prompt, None))
            .await?;
        session.append(input).await?;
        Ok(())
    }

    /// Answer one question, streaming events to `events`.
    ///
    /// A newer request on the same context cancels this one; the caller then
    /// gets [`TurnOutcome::Cancelled`] and a `Cancelled` event, and nothing is
    /// recorded. Failures send an `Error` event before returning the error.
    pub async fn ask(
        &self,
        request: AskRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<TurnOutcome> {
        request.validate()?;

        let guard = self.registry.begin_request(&request.context_id);
        let streamed = time_operation!(
            METRICS.turn_duration,
            request.use_case.as_str(),
            self.run_turn(&request, &guard, &events).await
        );
        self.registry.finish_request(&guard);

        match streamed {
            Ok(streamed) => {
                let result = self.after_turn(&request, streamed).await;
                Ok(TurnOutcome::Completed(Box::new(result)))
            }
            Err(ContextError::Cancelled) => {
                debug!("Request on {} cancelled", request.context_id);
                send(&events, StreamEvent::Cancelled).await;
                Ok(TurnOutcome::Cancelled)
            }
            Err(e) => {
                warn!("Turn on {} failed: {}", request.context_id, e);
                send(
                    &events,
                    StreamEvent::Error {
                        message: e.to_string(),
                    },
                )
                .await;
                Err(e)
            }
        }
    }

    async fn run_turn(
        &self,
        request: &AskRequest,
        guard: &RequestGuard,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<Streamed> {
        let cancel = guard.token();
        let context_id = request.context_id.as_str();
        let use_case = request.use_case;
        let chat = use_case == UseCase::Chat;
        let system_prompt = prompts::system_prompt(&self.config.qa.system_prompt, use_case);

        let quota = self.detector.detect().await;

        let avg_chunk_chars = match self.store.average_chunk_chars(&request.doc_id).await {
            Ok(avg) => avg.unwrap_or(self.sizer.config().default_chunk_chars),
            Err(e) => {
                warn!("Chunk statistics unavailable for {}: {}", request.doc_id, e);
                self.sizer.config().default_chunk_chars
            }
        };
        let limit = self.sizer.adaptive_chunk_limit(quota, avg_chunk_chars, use_case);

        let candidates = tokio::select! {
            _ = cancel.cancelled() => return Err(ContextError::Cancelled),
            chunks = self.store.get_relevant_chunks(&request.doc_id, &request.question, limit) => chunks?,
        };
        debug!(
            "Retrieved {} candidates (limit {}) for quota {}",
            candidates.len(),
            limit,
            quota
        );

        let mut state = request.state.clone();
        let mut pre_summarized = false;
        if chat {
            match self
                .conversation
                .perform_pre_summarization(&request.history, &state, &request.doc_title, quota)
                .await
            {
                SummarizationOutcome::Summarized(next) => {
                    state = next;
                    pre_summarized = true;
                }
                SummarizationOutcome::Skipped(reason) => {
                    debug!("Pre-summarization skipped: {}", reason)
                }
                SummarizationOutcome::Failed(reason) => {
                    warn!("Continuing with prior conversation state: {}", reason)
                }
            }
            if cancel.is_cancelled() {
                return Err(ContextError::Cancelled);
            }
        }

        let trim = self.trimmer.trim_with_progressive_fallback(
            &candidates,
            quota,
            use_case,
            &system_prompt,
            &request.question,
            chat.then_some(&state),
        );
        if !trim.status.floor_met && self.config.qa.refuse_when_floor_unmet {
            return Err(BudgetError::InsufficientBudget {
                needed: self.trimmer.config().min_evidence_tokens,
                available: trim.status.used_tokens,
            }
            .into());
        }

        let (session, options) = self
            .prepare_session(context_id, &system_prompt, &state, &trim, pre_summarized, chat)
            .await?;

        let evidence = format_chunks(&trim.selected, &self.config.qa.format);
        let user_prompt =
            prompts::user_prompt(use_case, &request.doc_title, &evidence, &request.question);
        let options = self
            .ensure_capacity(context_id, &system_prompt, &trim, session, options, &user_prompt)
            .await?;

        let schema = answer_schema();
        let mut decoder = StreamDecoder::for_schema(&schema)?;
        let prompt_options = PromptOptions {
            response_schema: Some(schema),
        };
        let mut stream = stream_with_retry(
            &self.registry,
            context_id,
            &options,
            &user_prompt,
            &prompt_options,
            &self.config.session.retry,
            cancel,
        )
        .await?;

        let mut received = false;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(ContextError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(fragment)) => {
                    received = true;
                    if let Some(text) = decoder.push(&fragment) {
                        send(events, StreamEvent::Chunk { text }).await;
                    }
                }
                Some(Err(e)) if received => {
                    warn!("Stream on {} ended early: {}", context_id, e);
                    break;
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        let decoded = decoder.finish();
        let citations =
            resolve_citations(&decoded.sources, &trim.selected, &self.config.qa.format);
        send(
            events,
            StreamEvent::End {
                answer: decoded.answer.clone(),
                citations: citations.clone(),
                trim: trim.status.clone(),
                parsed: decoded.parsed,
            },
        )
        .await;

        let user_message = ChatMessage::user(request.question.clone());
        let assistant_message =
            ChatMessage::assistant(decoded.answer.clone()).with_citations(citations.clone());
        let state = if chat {
            self.conversation
                .record_turn(&state, user_message.clone(), assistant_message.clone())
        } else {
            state
        };

        Ok(Streamed {
            result: TurnResult {
                answer: decoded.answer,
                citations,
                parsed: decoded.parsed,
                state,
                user_message,
                assistant_message,
                trim: trim.status,
                rebased: pre_summarized,
            },
            session: self.registry.session(context_id),
            system_prompt,
        })
    }

    /// Session the prompt will run on, plus the options that recreate it.
    ///
    /// One-shot use cases always start clean. Chat reuses the live session
    /// unless the history was just compacted or shrunk to make room, in which
    /// case it is rebased onto the state the budget was computed against.
    async fn prepare_session(
        &self,
        context_id: &str,
        system_prompt: &str,
        state: &ConversationState,
        trim: &TrimResult,
        pre_summarized: bool,
        chat: bool,
    ) -> Result<(Arc<dyn GenerationSession>, SessionOptions)> {
        if !chat {
            let options = self.session_options(system_prompt, None);
            self.registry.discard_session(context_id).await;
            let session = self.registry.get_or_create(context_id, &options).await?;
            return Ok((session, options));
        }

        let prompt_state = trim.state.clone().unwrap_or_else(|| state.clone());
        let options = self.session_options(system_prompt, Some(&prompt_state));
        let window_shrank = prompt_state.recent_messages.len() < state.recent_messages.len();
        let live = self.registry.session(context_id).is_some();

        if live && (pre_summarized || window_shrank) {
            debug!(
                "Rebasing {} before prompting (summarized: {}, window {} -> {})",
                context_id,
                pre_summarized,
                state.recent_messages.len(),
                prompt_state.recent_messages.len()
            );
            let session = self
                .registry
                .clone_session(context_id, &prompt_state, system_prompt)
                .await?;
            return Ok((session, options));
        }

        let session = self.registry.get_or_create(context_id, &options).await?;
        Ok((session, options))
    }

    /// Make sure the prompt fits the session's remaining quota, rebasing onto
    /// the trimmed state when it does not.
    async fn ensure_capacity(
        &self,
        context_id: &str,
        system_prompt: &str,
        trim: &TrimResult,
        session: Arc<dyn GenerationSession>,
        options: SessionOptions,
        prompt: &str,
    ) -> Result<SessionOptions> {
        let measured = self.detector.measure(session.as_ref(), prompt).await;
        let remaining = session.input_quota().saturating_sub(session.input_usage());
        if measured.tokens <= remaining {
            return Ok(options);
        }

        info!(
            "Prompt of {} tokens exceeds remaining {} on {}, rebasing",
            measured.tokens, remaining, context_id
        );
        let state = trim.state.clone().unwrap_or_default();
        let session = self
            .registry
            .clone_session(context_id, &state, system_prompt)
            .await?;

        let measured = self.detector.measure(session.as_ref(), prompt).await;
        let remaining = session.input_quota().saturating_sub(session.input_usage());
        if measured.tokens > remaining && !measured.degraded {
            return Err(EngineError::QuotaExceeded {
                used: session.input_usage() + measured.tokens,
                quota: session.input_quota(),
            }
            .into());
        }
        Ok(self.session_options(system_prompt, Some(&state)))
    }

    /// Record-keeping once the answer is delivered. Failures here are logged
    /// and never reach the caller.
    async fn after_turn(&self, request: &AskRequest, streamed: Streamed) -> TurnResult {
        let Streamed {
            mut result,
            session,
            system_prompt,
        } = streamed;
        let context_id = request.context_id.as_str();

        if request.use_case != UseCase::Chat {
            self.registry.discard_session(context_id).await;
            return result;
        }
        let Some(session) = session else {
            return result;
        };

        let usage = session.input_usage();
        let quota = session.input_quota();
        if !self.conversation.should_rebase(usage, quota) && !result.trim.tight {
            return result;
        }
        if self.registry.has_request_in_flight(context_id) {
            debug!("Newer request on {}, leaving its session alone", context_id);
            return result;
        }

        info!(
            "Session {} at {}/{} tokens (tight: {}), rebasing",
            context_id, usage, quota, result.trim.tight
        );

        let mut history = request.history.clone();
        history.push(result.user_message.clone());
        history.push(result.assistant_message.clone());

        let state = match self
            .conversation
            .absorb_history(&history, &result.state, &request.doc_title)
            .await
        {
            SummarizationOutcome::Summarized(next) => next,
            SummarizationOutcome::Skipped(_) => result.state.clone(),
            SummarizationOutcome::Failed(reason) => {
                warn!("Keeping live session for {}: {}", context_id, reason);
                return result;
            }
        };

        match self
            .registry
            .clone_session(context_id, &state, &system_prompt)
            .await
        {
            Ok(_) => {
                result.state = state;
                result.rebased = true;
            }
            Err(e) => warn!("Post-turn rebase of {} failed: {}", context_id, e),
        }
        result
    }

    fn session_options(
        &self,
        system_prompt: &str,
        state: Option<&ConversationState>,
    ) -> SessionOptions {
        let mut options = session_options_for(system_prompt, state);
        options.temperature = self.config.session.temperature;
        options.top_k = self.config.session.top_k;
        options
    }
}

async fn send(events: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    if events.send(event).await.is_err() {
        debug!("Event receiver dropped");
    }
}
