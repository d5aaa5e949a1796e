//! Budget trimmer
//!
//! Cuts a relevance-ordered chunk list down to the longest prefix that fits the
//! margined budget left after the real prompt overhead. Evidence and history
//! compete for the same budget; when evidence falls short, history is shrunk
//! first.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::models::{ContentChunk, ConversationState, UseCase, MAX_RECENT_MESSAGES};
use super::token_budget::TokenBudgetConfig;
use super::token_estimator::TokenEstimator;
use crate::metrics::METRICS;

/// Recent-message windows tried by the progressive fallback, widest first
pub const HISTORY_WINDOWS: [usize; 4] = [MAX_RECENT_MESSAGES, 3, 1, 0];

/// Outcome of a trimming pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimStatus {
    /// Evidence reached the minimum floor, or every candidate fit
    pub floor_met: bool,
    /// Usage at or above the tight ratio; summarize before the next turn
    pub tight: bool,
    pub used_tokens: usize,
    pub budget_tokens: usize,
    pub overhead_tokens: usize,
    /// Recent messages kept in the prompt
    pub history_window: usize,
    pub total_candidates: usize,
}

/// Selected chunks plus status
#[derive(Debug, Clone)]
pub struct TrimResult {
    pub selected: Vec<ContentChunk>,
    pub status: TrimStatus,
    /// Conversation state the budget was computed against
    pub state: Option<ConversationState>,
}

/// Selects the evidence that fits one request
pub struct BudgetTrimmer {
    config: TokenBudgetConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl BudgetTrimmer {
    pub fn new(config: TokenBudgetConfig, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { config, estimator }
    }

    pub fn config(&self) -> &TokenBudgetConfig {
        &self.config
    }

    /// Tokens the prompt costs before any evidence is added
    pub fn prompt_overhead(
        &self,
        system_prompt: &str,
        question: &str,
        state: Option<&ConversationState>,
    ) -> usize {
        let mut overhead = self.estimator.estimate(system_prompt)
            + self.estimator.estimate(question)
            + self.config.formatting_overhead;
        if let Some(state) = state {
            if let Some(summary) = &state.summary {
                overhead += self.estimator.estimate(summary);
            }
            overhead += state
                .recent_messages
                .iter()
                .map(|m| self.estimator.estimate(&m.transcript_line()))
                .sum::<usize>();
        }
        overhead
    }

    /// Margined evidence budget for a quota and a known overhead
    pub fn evidence_budget(&self, quota_tokens: usize, use_case: UseCase, overhead: usize) -> usize {
        let available = quota_tokens
            .saturating_sub(overhead)
            .saturating_sub(self.config.response_reserve);
        self.config.budget_for(quota_tokens, use_case).margined(available)
    }

    /// Select the longest relevance-ordered prefix of `chunks` that fits.
    ///
    /// Until the evidence floor is reached the total may run up to
    /// `floor_overflow_ratio` times the budget; past the floor the budget is
    /// strict. Chunks are never reordered.
    pub fn trim(
        &self,
        chunks: &[ContentChunk],
        quota_tokens: usize,
        use_case: UseCase,
        system_prompt: &str,
        question: &str,
        state: Option<&ConversationState>,
    ) -> TrimResult {
        let overhead = self.prompt_overhead(system_prompt, question, state);
        let budget = self.evidence_budget(quota_tokens, use_case, overhead);
        let relaxed =
            (budget as f64 * self.config.floor_overflow_ratio as f64).floor() as usize;
        let floor = self.config.min_evidence_tokens;

        let mut used = 0usize;
        let mut selected = Vec::new();

        for chunk in chunks {
            let cost = chunk.token_count + self.config.per_chunk_overhead;
            let limit = if used < floor { relaxed } else { budget };
            if used + cost > limit {
                break;
            }
            used += cost;
            selected.push(chunk.clone());
        }

        let floor_met = used >= floor || selected.len() == chunks.len();
        let tight = budget > 0
            && used as f64 >= budget as f64 * self.config.tight_ratio as f64;

        debug!(
            "Trimmed {} -> {} chunks: used={}, budget={}, overhead={}, floor_met={}",
            chunks.len(),
            selected.len(),
            used,
            budget,
            overhead,
            floor_met
        );

        TrimResult {
            selected,
            status: TrimStatus {
                floor_met,
                tight,
                used_tokens: used,
                budget_tokens: budget,
                overhead_tokens: overhead,
                history_window: state.map(|s| s.recent_messages.len()).unwrap_or(0),
                total_candidates: chunks.len(),
            },
            state: state.cloned(),
        }
    }

    /// Trim, shrinking the recent-message window 6 → 3 → 1 → 0 until the
    /// evidence floor is met. The summary is always kept. Returns the first
    /// passing attempt, otherwise the last one.
    pub fn trim_with_progressive_fallback(
        &self,
        chunks: &[ContentChunk],
        quota_tokens: usize,
        use_case: UseCase,
        system_prompt: &str,
        question: &str,
        state: Option<&ConversationState>,
    ) -> TrimResult {
        let Some(state) = state else {
            let result = self.trim(chunks, quota_tokens, use_case, system_prompt, question, None);
            self.record(&result);
            return result;
        };

        let mut last = None;
        for window in HISTORY_WINDOWS {
            if window > state.recent_messages.len() && window != MAX_RECENT_MESSAGES {
                continue;
            }
            let narrowed = state.with_window(window);
            let result = self.trim(
                chunks,
                quota_tokens,
                use_case,
                system_prompt,
                question,
                Some(&narrowed),
            );
            if result.status.floor_met {
                if window < state.recent_messages.len() {
                    debug!("Evidence floor met after shrinking history to {}", window);
                }
                self.record(&result);
                return result;
            }
            last = Some(result);
        }

        let result = match last {
            Some(result) => result,
            None => self.trim(
                chunks,
                quota_tokens,
                use_case,
                system_prompt,
                question,
                Some(state),
            ),
        };
        warn!(
            "Evidence floor not met even without history: {} of {} tokens",
            result.status.used_tokens, self.config.min_evidence_tokens
        );
        self.record(&result);
        result
    }

    fn record(&self, result: &TrimResult) {
        METRICS.record_trim(
            result.status.used_tokens,
            result.status.budget_tokens,
            result.status.floor_met,
            result.status.history_window,
        );
    }
}
