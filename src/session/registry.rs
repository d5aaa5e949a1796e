//! Session registry
//!
//! Owns exactly one generation session per context id and at most one
//! outstanding request per context. Starting a request cancels the one it
//! supersedes. Distinct contexts never contend: map shards are only locked for
//! the duration of a lookup or insert, never across an engine call.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::models::{ConversationState, Role};
use crate::engine::{
    EngineResult, GenerationEngine, GenerationSession, InitialTurn, SessionOptions,
};
use crate::metrics::METRICS;

/// Handle for one in-flight request
#[derive(Debug, Clone)]
pub struct RequestGuard {
    context_id: String,
    request_id: u64,
    token: CancellationToken,
}

impl RequestGuard {
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct InFlight {
    request_id: u64,
    token: CancellationToken,
}

/// Opening turns for a session that continues `state`:
/// `[system(prompt + summary), ...recent messages]`
pub fn session_options_for(
    system_prompt: &str,
    state: Option<&ConversationState>,
) -> SessionOptions {
    let mut system = system_prompt.to_string();
    let mut turns = Vec::new();

    if let Some(state) = state {
        if let Some(summary) = &state.summary {
            system.push_str("\n\nSummary of the conversation so far:\n");
            system.push_str(summary);
        }
        turns.extend(
            state
                .recent_messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| InitialTurn::new(m.role, m.content.clone())),
        );
    }

    let mut initial_turns = vec![InitialTurn::new(Role::System, system)];
    initial_turns.extend(turns);

    SessionOptions {
        initial_turns,
        ..Default::default()
    }
}

pub struct SessionRegistry {
    engine: Arc<dyn GenerationEngine>,
    sessions: DashMap<String, Arc<dyn GenerationSession>>,
    in_flight: DashMap<String, InFlight>,
    next_request_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(engine: Arc<dyn GenerationEngine>) -> Self {
        Self {
            engine,
            sessions: DashMap::new(),
            in_flight: DashMap::new(),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> &Arc<dyn GenerationEngine> {
        &self.engine
    }

    /// Live session for a context, if any
    pub fn session(&self, context_id: &str) -> Option<Arc<dyn GenerationSession>> {
        self.sessions.get(context_id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Return the context's session, creating it with `options` if needed
    pub async fn get_or_create(
        &self,
        context_id: &str,
        options: &SessionOptions,
    ) -> EngineResult<Arc<dyn GenerationSession>> {
        if let Some(session) = self.session(context_id) {
            return Ok(session);
        }

        let created = self.engine.create_session(options.clone()).await?;
        METRICS.record_session_created();

        // another task may have created one while we awaited the engine
        let existing = match self.sessions.entry(context_id.to_string()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(created.clone());
                None
            }
        };

        match existing {
            Some(existing) => {
                created.destroy().await;
                Ok(existing)
            }
            None => {
                debug!("Created session for context {}", context_id);
                Ok(created)
            }
        }
    }

    /// Register a new request for a context, cancelling its predecessor
    pub fn begin_request(&self, context_id: &str) -> RequestGuard {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let previous = self.in_flight.insert(
            context_id.to_string(),
            InFlight {
                request_id,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(
                "Request {} supersedes {} for context {}",
                request_id, previous.request_id, context_id
            );
            previous.token.cancel();
            METRICS.record_cancellation();
        }

        RequestGuard {
            context_id: context_id.to_string(),
            request_id,
            token,
        }
    }

    /// Release a request slot if it still belongs to `guard`
    pub fn finish_request(&self, guard: &RequestGuard) {
        self.in_flight
            .remove_if(&guard.context_id, |_, f| f.request_id == guard.request_id);
    }

    /// Cancel the outstanding request of a context. Returns whether one existed.
    pub fn cancel(&self, context_id: &str) -> bool {
        match self.in_flight.remove(context_id) {
            Some((_, in_flight)) => {
                in_flight.token.cancel();
                METRICS.record_cancellation();
                true
            }
            None => false,
        }
    }

    pub fn has_request_in_flight(&self, context_id: &str) -> bool {
        self.in_flight.contains_key(context_id)
    }

    /// Drop and destroy the session without touching in-flight requests
    pub async fn discard_session(&self, context_id: &str) {
        if let Some((_, session)) = self.sessions.remove(context_id) {
            session.destroy().await;
        }
    }

    /// Cancel any in-flight request and destroy the context's session
    pub async fn destroy(&self, context_id: &str) {
        self.cancel(context_id);
        self.discard_session(context_id).await;
        debug!("Destroyed context {}", context_id);
    }

    /// Replace the context's session with one seeded from `state`.
    ///
    /// The old session is destroyed first; the conversation continues on a
    /// fresh budget through the summary and recent messages. Callers must
    /// finish or cancel any request on the context before rebasing.
    pub async fn clone_session(
        &self,
        context_id: &str,
        state: &ConversationState,
        system_prompt: &str,
    ) -> EngineResult<Arc<dyn GenerationSession>> {
        if self.has_request_in_flight(context_id) {
            warn!("Rebasing context {} with a request in flight", context_id);
        }
        self.discard_session(context_id).await;

        let options = session_options_for(system_prompt, Some(state));
        let session = self.engine.create_session(options).await?;
        METRICS.record_session_created();
        METRICS.record_rebase();

        if let Some(stale) = self
            .sessions
            .insert(context_id.to_string(), session.clone())
        {
            stale.destroy().await;
        }

        info!(
            "Rebased context {} onto a fresh session ({} opening turns)",
            context_id,
            state.recent_messages.len() + 1
        );
        Ok(session)
    }

    /// Cancel every request and destroy every session
    pub async fn reset(&self) {
        let contexts: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for entry in self.in_flight.iter() {
            entry.value().token.cancel();
        }
        self.in_flight.clear();
        for context_id in contexts {
            self.discard_session(&context_id).await;
        }
    }
}
