//! Crate-wide error type

use crate::context::conversation::ConversationError;
use crate::context::summarizer::SummarizerError;
use crate::context::token_budget::BudgetError;
use crate::engine::EngineError;
use crate::store::StoreError;
use crate::stream::DecoderError;
use thiserror::Error;

/// Errors surfaced by the document QA pipeline
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Summarizer(#[from] SummarizerError),

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Decoder(#[from] DecoderError),

    #[error("Timed out after {attempts} attempts")]
    Timeout { attempts: usize },

    /// The request was superseded or explicitly cancelled. Never retried.
    #[error("Request cancelled")]
    Cancelled,
}

impl ContextError {
    /// Whether this error is a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ContextError::Cancelled)
    }
}

impl From<config::ConfigError> for ContextError {
    fn from(e: config::ConfigError) -> Self {
        ContextError::Configuration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ContextError>;
