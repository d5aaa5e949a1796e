//! Configuration loading
//!
//! Every section has defaults, so an empty file (or no file) is a valid
//! configuration. Values are layered: optional TOML file, then `DOCQA__`
//! prefixed environment variables (`DOCQA__TOKEN_BUDGET__RESPONSE_RESERVE=400`).

use config::{Environment, File, FileFormat};
use serde::Deserialize;

use crate::context::conversation::ConversationConfig;
use crate::context::formatting::FormatLimits;
use crate::context::retrieval_sizer::RetrievalConfig;
use crate::context::summarizer::SummarizerConfig;
use crate::context::token_budget::TokenBudgetConfig;
use crate::context::token_estimator::EstimatorKind;
use crate::error::{ContextError, Result};
use crate::qa::prompts::DEFAULT_SYSTEM_PROMPT;
use crate::session::RetryPolicy;

const ENV_PREFIX: &str = "DOCQA";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub token_budget: TokenBudgetConfig,
    pub retrieval: RetrievalConfig,
    pub conversation: ConversationConfig,
    pub session: SessionConfig,
    pub qa: QaConfig,
    pub summarizer: SummarizerSettings,
    pub logging: LoggingConfig,
}

/// Generation session settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub retry: RetryPolicy,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
}

/// Question answering settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QaConfig {
    pub system_prompt: String,
    /// Refuse to prompt when the evidence floor cannot be met
    pub refuse_when_floor_unmet: bool,
    pub estimator: EstimatorKind,
    pub format: FormatLimits,
    /// Capacity of the per-request event channel
    pub event_buffer: usize,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            refuse_when_floor_unmet: false,
            estimator: EstimatorKind::default(),
            format: FormatLimits::default(),
            event_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizerBackend {
    /// Summarize with the generation engine
    #[default]
    Engine,
    /// OpenAI-compatible HTTP endpoint
    Http,
    Concatenation,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SummarizerSettings {
    pub backend: SummarizerBackend,
    pub http: SummarizerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load from an optional TOML file and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let config: Config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document, without consulting the environment
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.token_budget.validate()?;

        let conversation = &self.conversation;
        for (name, ratio) in [
            ("pre_summarize_ratio", conversation.pre_summarize_ratio),
            ("rebase_ratio", conversation.rebase_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ContextError::Configuration(format!(
                    "conversation.{} must be in (0, 1], got {}",
                    name, ratio
                )));
            }
        }
        if conversation.merge_after_rounds == 0 {
            return Err(ContextError::Configuration(
                "conversation.merge_after_rounds must be at least 1".to_string(),
            ));
        }
        if self.session.retry.max_attempts == 0 || self.session.retry.timeout_ms == 0 {
            return Err(ContextError::Configuration(
                "session.retry needs a positive timeout and at least one attempt".to_string(),
            ));
        }
        if self.qa.event_buffer == 0 {
            return Err(ContextError::Configuration(
                "qa.event_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
