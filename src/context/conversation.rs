//! Conversation state manager
//!
//! Keeps a rolling `{summary, recent_messages}` pair per conversation. Older
//! turns are folded into the summary before they would crowd the quota, and the
//! summary itself is re-compressed every few rounds so it cannot grow without
//! bound.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::models::{ChatMessage, ConversationState, MAX_RECENT_MESSAGES};
use super::summarizer::{Summarizer, SummarizerError};
use super::token_estimator::TokenEstimator;
use crate::metrics::METRICS;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("Summarization failed: {0}")]
    Summarization(#[from] SummarizerError),

    #[error("Summarizer returned an empty summary")]
    EmptySummary,
}

/// Conversation compaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Share of quota used by recent messages + summary that triggers summarization
    pub pre_summarize_ratio: f64,
    /// Share of the session quota in use that triggers a rebase after a turn
    pub rebase_ratio: f64,
    /// Summary rounds after which old and new summaries are merged
    pub merge_after_rounds: u32,
    /// Target length of a summary
    pub summary_max_tokens: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            pre_summarize_ratio: 0.85,
            rebase_ratio: 0.8,
            merge_after_rounds: 2,
            summary_max_tokens: 300,
        }
    }
}

/// Where a conversation is in its compaction cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPhase {
    NoHistory,
    LiveSession,
    PendingSummarization,
    Summarized,
}

/// Result of a summarization attempt. On `Skipped` and `Failed` the caller
/// keeps its prior state.
#[derive(Debug, Clone, PartialEq)]
pub enum SummarizationOutcome {
    Skipped(&'static str),
    Summarized(ConversationState),
    Failed(String),
}

impl SummarizationOutcome {
    /// The new state, if one was produced
    pub fn into_state(self) -> Option<ConversationState> {
        match self {
            SummarizationOutcome::Summarized(state) => Some(state),
            _ => None,
        }
    }
}

pub struct ConversationStateManager {
    config: ConversationConfig,
    summarizer: Arc<dyn Summarizer>,
    estimator: Arc<dyn TokenEstimator>,
}

impl ConversationStateManager {
    pub fn new(
        config: ConversationConfig,
        summarizer: Arc<dyn Summarizer>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        Self {
            config,
            summarizer,
            estimator,
        }
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    /// Estimated tokens of the last six messages plus the summary
    pub fn estimate_carryover(&self, history: &[ChatMessage], state: &ConversationState) -> usize {
        let skip = history.len().saturating_sub(MAX_RECENT_MESSAGES);
        let recent: usize = history[skip..]
            .iter()
            .map(|m| self.estimator.estimate(&m.transcript_line()))
            .sum();
        let summary = state
            .summary
            .as_deref()
            .map(|s| self.estimator.estimate(s))
            .unwrap_or(0);
        recent + summary
    }

    pub fn needs_pre_summarization(
        &self,
        history: &[ChatMessage],
        state: &ConversationState,
        quota_tokens: usize,
    ) -> bool {
        let carryover = self.estimate_carryover(history, state);
        carryover as f64 >= quota_tokens as f64 * self.config.pre_summarize_ratio
    }

    /// Whether the live session is full enough to rebase after this turn
    pub fn should_rebase(&self, input_usage: usize, input_quota: usize) -> bool {
        input_quota > 0 && input_usage as f64 / input_quota as f64 >= self.config.rebase_ratio
    }

    pub fn phase(
        &self,
        history: &[ChatMessage],
        state: &ConversationState,
        quota_tokens: usize,
    ) -> ConversationPhase {
        if history.is_empty() && !state.has_history() {
            ConversationPhase::NoHistory
        } else if self.needs_pre_summarization(history, state, quota_tokens) {
            ConversationPhase::PendingSummarization
        } else if state.summary.is_some() {
            ConversationPhase::Summarized
        } else {
            ConversationPhase::LiveSession
        }
    }

    /// Summarize before the next turn if carryover reaches 85% of the quota
    pub async fn perform_pre_summarization(
        &self,
        history: &[ChatMessage],
        state: &ConversationState,
        doc_title: &str,
        quota_tokens: usize,
    ) -> SummarizationOutcome {
        if !self.needs_pre_summarization(history, state, quota_tokens) {
            return SummarizationOutcome::Skipped("below threshold");
        }
        info!(
            "Conversation carryover near quota ({} tokens), summarizing",
            quota_tokens
        );
        self.absorb_history(history, state, doc_title).await
    }

    /// Fold every message not yet in the summary, except the last six, into it
    pub async fn absorb_history(
        &self,
        history: &[ChatMessage],
        state: &ConversationState,
        doc_title: &str,
    ) -> SummarizationOutcome {
        let start = state.last_summarized_index.map(|i| i + 1).unwrap_or(0);
        let end = history.len().saturating_sub(MAX_RECENT_MESSAGES);
        if start >= end {
            return SummarizationOutcome::Skipped("nothing to absorb");
        }

        match self.fold(&history[start..end], state, doc_title).await {
            Ok((summary, summary_count, kind)) => {
                METRICS.record_summarization(kind);
                debug!(
                    "Absorbed messages {}..{} ({}), summary round {}",
                    start, end, kind, summary_count
                );
                SummarizationOutcome::Summarized(ConversationState {
                    summary: Some(summary),
                    recent_messages: history[end..].to_vec(),
                    last_summarized_index: Some(end - 1),
                    summary_count,
                })
            }
            Err(e) => {
                METRICS.record_summarization("failed");
                warn!("Conversation summarization failed: {}", e);
                SummarizationOutcome::Failed(e.to_string())
            }
        }
    }

    async fn fold(
        &self,
        messages: &[ChatMessage],
        state: &ConversationState,
        doc_title: &str,
    ) -> Result<(String, u32, &'static str), ConversationError> {
        let mut texts = vec![format!("Document: {}", doc_title)];
        texts.extend(messages.iter().map(|m| m.transcript_line()));

        let fresh = self.summarize(&texts).await?;

        match &state.summary {
            None => Ok((fresh, 1, "append")),
            Some(previous) if state.summary_count >= self.config.merge_after_rounds => {
                let merged = self.summarize(&[previous.clone(), fresh]).await?;
                Ok((merged, 1, "merge"))
            }
            Some(previous) => Ok((
                format!("{}\n\n{}", previous, fresh),
                state.summary_count + 1,
                "append",
            )),
        }
    }

    async fn summarize(&self, texts: &[String]) -> Result<String, ConversationError> {
        let summary = self
            .summarizer
            .summarize(texts, self.config.summary_max_tokens)
            .await?;
        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Err(ConversationError::EmptySummary);
        }
        Ok(summary)
    }

    /// Append a finished turn, keeping at most six recent messages
    pub fn record_turn(
        &self,
        state: &ConversationState,
        user: ChatMessage,
        assistant: ChatMessage,
    ) -> ConversationState {
        let mut next = state.clone();
        next.recent_messages.push(user);
        next.recent_messages.push(assistant);
        let excess = next.recent_messages.len().saturating_sub(MAX_RECENT_MESSAGES);
        next.recent_messages.drain(..excess);
        next
    }
}
