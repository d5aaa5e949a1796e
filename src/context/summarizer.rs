//! Summarization backends for conversation compaction

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::token_estimator::CHARS_PER_TOKEN;
use crate::engine::{PromptOptions, SessionOptions};
use crate::session::retry::{prompt_with_retry, RetryPolicy};
use crate::session::SessionRegistry;

const SUMMARIZER_INSTRUCTIONS: &str =
    "You are a concise summarizer. Extract key information and compress it efficiently.";

/// Summarizer trait for different summarization strategies
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize a list of text segments into a concise brief
    async fn summarize(&self, texts: &[String], max_tokens: usize)
        -> Result<String, SummarizerError>;
}

fn build_prompt(texts: &[String], max_tokens: usize) -> String {
    let combined = texts.join("\n\n---\n\n");
    format!(
        "Summarize the following conversation about a document into a concise running brief. \
        Keep the questions asked, the answers given and any facts cited from the document. \
        Keep the summary under {} tokens.\n\n{}",
        max_tokens, combined
    )
}

/// Configuration for the HTTP summarizer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub endpoint: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    /// First retry delay, doubled on each further attempt
    pub retry_backoff_ms: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 30_000,
            max_retries: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl SummarizerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// LLM-based summarizer using an OpenAI-compatible API
pub struct LLMSummarizer {
    client: Client,
    config: SummarizerConfig,
}

impl LLMSummarizer {
    /// Create a new LLM summarizer
    pub fn new(config: SummarizerConfig) -> Result<Self, SummarizerError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SummarizerError::InitializationError(e.to_string()))?;

        Ok(Self { client, config })
    }

    async fn call_api(&self, request: &ChatCompletionRequest) -> Result<String, SummarizerError> {
        let mut req = self.client.post(&self.config.endpoint).json(request);

        if let Some(api_key) = &self.config.api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }

        let response = req
            .send()
            .await
            .map_err(|e| SummarizerError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SummarizerError::ApiError(format!("HTTP {}: {}", status, body)));
        }

        let resp = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| SummarizerError::ApiError(format!("Failed to parse response: {}", e)))?;

        resp.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| SummarizerError::ApiError("No choices in response".to_string()))
    }
}

#[async_trait]
impl Summarizer for LLMSummarizer {
    async fn summarize(
        &self,
        texts: &[String],
        max_tokens: usize,
    ) -> Result<String, SummarizerError> {
        if texts.is_empty() {
            return Ok(String::new());
        }

        debug!(
            "Summarizing {} text segments, target: {} tokens",
            texts.len(),
            max_tokens
        );

        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ApiMessage {
                    role: "system".to_string(),
                    content: SUMMARIZER_INSTRUCTIONS.to_string(),
                },
                ApiMessage {
                    role: "user".to_string(),
                    content: build_prompt(texts, max_tokens),
                },
            ],
            max_tokens: Some(max_tokens),
            temperature: Some(0.3),
        };

        let attempts = self.config.max_retries.max(1);
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let mut outcome = Err(SummarizerError::Unknown);
        for attempt in 1..=attempts {
            outcome = self.call_api(&request).await;
            match &outcome {
                Ok(_) => break,
                Err(e) if attempt < attempts => {
                    debug!("Summarization attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => warn!("Summarization failed after {} attempts: {}", attempts, e),
            }
        }
        outcome
    }
}

/// Summarizer backed by the generation engine itself.
///
/// Each call runs on its own throwaway context: the session is created,
/// prompted under the retry policy and destroyed again. Concurrent calls never
/// share a context, so they cannot cancel each other.
pub struct EngineSummarizer {
    registry: Arc<SessionRegistry>,
    policy: RetryPolicy,
}

impl EngineSummarizer {
    pub fn new(registry: Arc<SessionRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }
}

#[async_trait]
impl Summarizer for EngineSummarizer {
    async fn summarize(
        &self,
        texts: &[String],
        max_tokens: usize,
    ) -> Result<String, SummarizerError> {
        if texts.is_empty() {
            return Ok(String::new());
        }

        let context_id = format!("summarizer-{}", uuid::Uuid::new_v4());
        let options = SessionOptions::with_system_prompt(SUMMARIZER_INSTRUCTIONS);
        let guard = self.registry.begin_request(&context_id);
        let result = prompt_with_retry(
            &self.registry,
            &context_id,
            &options,
            &build_prompt(texts, max_tokens),
            &PromptOptions::default(),
            &self.policy,
            guard.token(),
        )
        .await;
        self.registry.finish_request(&guard);
        self.registry.destroy(&context_id).await;

        result.map_err(|e| SummarizerError::ApiError(e.to_string()))
    }
}

/// Joins the texts and cuts them to the target length. Needs no model.
#[derive(Debug, Clone, Default)]
pub struct ConcatenationSummarizer;

#[async_trait]
impl Summarizer for ConcatenationSummarizer {
    async fn summarize(
        &self,
        texts: &[String],
        max_tokens: usize,
    ) -> Result<String, SummarizerError> {
        let joined = texts.join("\n");
        let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
        Ok(joined.chars().take(max_chars).collect())
    }
}

/// Summarizer errors
#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Unknown error")]
    Unknown,
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ApiMessage,
}
