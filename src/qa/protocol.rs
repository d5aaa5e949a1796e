//! Request and event types exchanged with the caller
//!
//! Requests arrive as tagged JSON (`{"type": "ask", ...}`) and are validated
//! here, before anything touches the engine. Streaming output travels back as
//! [`StreamEvent`]s over a channel.

use serde::{Deserialize, Serialize};

use crate::context::models::{ChatMessage, Citation, ConversationState, UseCase};
use crate::context::trimmer::TrimStatus;
use crate::error::{ContextError, Result};

/// A question about one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    /// Conversation key; one engine session lives per context
    pub context_id: String,
    pub doc_id: String,
    #[serde(default)]
    pub doc_title: String,
    pub question: String,
    #[serde(default = "default_use_case")]
    pub use_case: UseCase,
    /// Full message history of the conversation, oldest first
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub state: ConversationState,
}

fn default_use_case() -> UseCase {
    UseCase::Chat
}

impl AskRequest {
    pub fn new(
        context_id: impl Into<String>,
        doc_id: impl Into<String>,
        question: impl Into<String>,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            doc_id: doc_id.into(),
            doc_title: String::new(),
            question: question.into(),
            use_case: UseCase::Chat,
            history: Vec::new(),
            state: ConversationState::default(),
        }
    }

    pub fn with_use_case(mut self, use_case: UseCase) -> Self {
        self.use_case = use_case;
        self
    }

    pub fn with_title(mut self, doc_title: impl Into<String>) -> Self {
        self.doc_title = doc_title.into();
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>, state: ConversationState) -> Self {
        self.history = history;
        self.state = state;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.context_id.trim().is_empty() {
            return Err(ContextError::InvalidRequest(
                "context_id must not be empty".to_string(),
            ));
        }
        if self.doc_id.trim().is_empty() {
            return Err(ContextError::InvalidRequest(
                "doc_id must not be empty".to_string(),
            ));
        }
        if self.question.trim().is_empty() {
            return Err(ContextError::InvalidRequest(
                "question must not be empty".to_string(),
            ));
        }
        if self.state.recent_messages.len() > crate::context::models::MAX_RECENT_MESSAGES {
            return Err(ContextError::InvalidRequest(format!(
                "state carries {} recent messages",
                self.state.recent_messages.len()
            )));
        }
        if let Some(index) = self.state.last_summarized_index {
            if index >= self.history.len() {
                return Err(ContextError::InvalidRequest(format!(
                    "last_summarized_index {} is past the end of a {}-message history",
                    index,
                    self.history.len()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QaRequest {
    Ask(AskRequest),
    /// Cancel the in-flight request of a context
    Cancel { context_id: String },
    /// Destroy one context, or every context when `context_id` is absent
    Reset {
        #[serde(default)]
        context_id: Option<String>,
    },
}

impl QaRequest {
    pub fn validate(&self) -> Result<()> {
        match self {
            QaRequest::Ask(ask) => ask.validate(),
            QaRequest::Cancel { context_id } if context_id.trim().is_empty() => Err(
                ContextError::InvalidRequest("context_id must not be empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Parse and validate a JSON request
pub fn parse_request(json: &str) -> Result<QaRequest> {
    let request: QaRequest = serde_json::from_str(json)
        .map_err(|e| ContextError::InvalidRequest(format!("Malformed request: {}", e)))?;
    request.validate()?;
    Ok(request)
}

/// Incremental output of one question turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Newly displayable answer text
    Chunk { text: String },
    /// Final answer with resolved citations
    End {
        answer: String,
        citations: Vec<Citation>,
        trim: TrimStatus,
        /// False when the response was not valid JSON and the streamed text was kept
        parsed: bool,
    },
    Cancelled,
    Error { message: String },
}

/// Everything a finished turn produced
#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub parsed: bool,
    /// Conversation state to persist for the next turn
    pub state: ConversationState,
    pub user_message: ChatMessage,
    pub assistant_message: ChatMessage,
    pub trim: TrimStatus,
    /// The session was rebased onto a fresh budget after the turn
    pub rebased: bool,
}

#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Completed(Box<TurnResult>),
    /// Superseded or cancelled; nothing was recorded
    Cancelled,
}

impl TurnOutcome {
    pub fn into_result(self) -> Option<TurnResult> {
        match self {
            TurnOutcome::Completed(result) => Some(*result),
            TurnOutcome::Cancelled => None,
        }
    }
}

/// Reply to a [`QaRequest`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QaResponse {
    Answered(Box<TurnResult>),
    Cancelled { context_id: String },
    CancelRequested { context_id: String, found: bool },
    ResetComplete { context_id: Option<String> },
}
