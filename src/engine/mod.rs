//! Text generation engine interface
//!
//! The engine itself lives outside this crate. It hands out stateful sessions
//! that accept a bounded input quota and report how much of it is used.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use crate::context::models::Role;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Session creation failed: {0}")]
    SessionCreation(String),

    #[error("Prompt failed: {0}")]
    Prompt(String),

    #[error("Input of {used} tokens exceeds quota of {quota}")]
    QuotaExceeded { used: usize, quota: usize },

    #[error("Measurement failed: {0}")]
    Measurement(String),

    #[error("Session destroyed")]
    SessionDestroyed,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Incremental text fragments produced by a streaming prompt
pub type TextStream = Pin<Box<dyn Stream<Item = EngineResult<String>> + Send>>;

/// Whether the engine can serve sessions right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Downloadable,
    Unavailable,
}

/// A role-tagged opening turn of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialTurn {
    pub role: Role,
    pub content: String,
}

impl InitialTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Session creation options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    pub initial_turns: Vec<InitialTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

impl SessionOptions {
    pub fn with_system_prompt(system_prompt: impl Into<String>) -> Self {
        Self {
            initial_turns: vec![InitialTurn::new(Role::System, system_prompt)],
            ..Default::default()
        }
    }
}

/// Content appended to a session outside a prompt
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Text(String),
    Image { mime_type: String, data: Vec<u8> },
}

/// Prompt constraint asking the engine for schema-conforming JSON
#[derive(Debug, Clone, Default)]
pub struct PromptOptions {
    pub response_schema: Option<serde_json::Value>,
}

/// A stateful generation session with a bounded input quota
#[async_trait]
pub trait GenerationSession: Send + Sync {
    /// Run a prompt to completion
    async fn prompt(&self, input: &str, options: &PromptOptions) -> EngineResult<String>;

    /// Run a prompt and stream text fragments as they are produced
    async fn prompt_streaming(
        &self,
        input: &str,
        options: &PromptOptions,
    ) -> EngineResult<TextStream>;

    /// Ask the engine how many tokens `input` would consume
    async fn measure_input_usage(&self, input: &str) -> EngineResult<usize>;

    /// Tokens consumed by the session so far
    fn input_usage(&self) -> usize;

    /// Maximum tokens the session accepts
    fn input_quota(&self) -> usize;

    /// Append multimodal content to the session context
    async fn append(&self, input: SessionInput) -> EngineResult<()>;

    /// Release the session. Further calls fail with `SessionDestroyed`.
    async fn destroy(&self);
}

/// Factory for generation sessions
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Stable identifier, used to key the detected quota
    fn id(&self) -> &str;

    async fn availability(&self) -> Availability;

    async fn create_session(
        &self,
        options: SessionOptions,
    ) -> EngineResult<Arc<dyn GenerationSession>>;
}
