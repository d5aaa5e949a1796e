//! Token budget configuration for quota-bound engines
//!
//! The engine accepts a small, host-dependent input quota. Everything that goes
//! into a request (instructions, summary, recent turns, retrieved evidence) is
//! admitted against that quota after a response reserve and a safety margin:
//! - Safety margin: 75% for chat (overhead measured), 65% otherwise
//! - Evidence floor: 1000 tokens, with 20% overflow allowed while filling it
//! - Tight usage: ≥90% of the margined budget

use super::models::UseCase;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quota used when the engine cannot report one
pub const FALLBACK_QUOTA_TOKENS: usize = 1024;

/// Detected input quota plus the margin applied against estimation error
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub quota_tokens: usize,
    pub safety_margin_ratio: f32,
}

impl TokenBudget {
    pub fn new(quota_tokens: usize, safety_margin_ratio: f32) -> Self {
        Self {
            quota_tokens,
            safety_margin_ratio,
        }
    }

    /// Apply the safety margin to an available token count
    pub fn margined(&self, available: usize) -> usize {
        (available as f64 * self.safety_margin_ratio as f64).floor() as usize
    }
}

/// Token budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBudgetConfig {
    /// Margin when prompt overhead is measured exactly (interactive chat)
    pub precise_safety_margin: f32,
    /// Margin for one-shot use cases where overhead is estimated
    pub estimated_safety_margin: f32,
    /// Tokens held back for the model's answer
    pub response_reserve: usize,
    /// Labels, separators and instructions framing the evidence block
    pub formatting_overhead: usize,
    /// Label/separator cost charged per selected chunk
    pub per_chunk_overhead: usize,
    /// Evidence floor the trimmer tries to reach
    pub min_evidence_tokens: usize,
    /// Overflow allowed while the floor is not yet reached
    pub floor_overflow_ratio: f32,
    /// Fraction of budget at which usage is reported as tight
    pub tight_ratio: f32,
    /// Quota assumed when detection fails
    pub fallback_quota: usize,
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            precise_safety_margin: 0.75,
            estimated_safety_margin: 0.65,
            response_reserve: 300,
            formatting_overhead: 50,
            per_chunk_overhead: 10,
            min_evidence_tokens: 1000,
            floor_overflow_ratio: 1.2,
            tight_ratio: 0.9,
            fallback_quota: FALLBACK_QUOTA_TOKENS,
        }
    }
}

impl TokenBudgetConfig {
    /// Validate that the budget configuration is consistent
    pub fn validate(&self) -> Result<(), BudgetError> {
        for (name, ratio) in [
            ("precise_safety_margin", self.precise_safety_margin),
            ("estimated_safety_margin", self.estimated_safety_margin),
            ("tight_ratio", self.tight_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(BudgetError::ConfigurationInvalid(format!(
                    "{} must be in (0, 1], got {}",
                    name, ratio
                )));
            }
        }

        if self.floor_overflow_ratio < 1.0 {
            return Err(BudgetError::ConfigurationInvalid(format!(
                "floor_overflow_ratio must be >= 1.0, got {}",
                self.floor_overflow_ratio
            )));
        }

        if self.fallback_quota == 0 {
            return Err(BudgetError::ConfigurationInvalid(
                "fallback_quota must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Safety margin for a use case
    pub fn safety_margin(&self, use_case: UseCase) -> f32 {
        if use_case.has_precise_overhead() {
            self.precise_safety_margin
        } else {
            self.estimated_safety_margin
        }
    }

    /// Budget for a quota and use case
    pub fn budget_for(&self, quota_tokens: usize, use_case: UseCase) -> TokenBudget {
        TokenBudget::new(quota_tokens, self.safety_margin(use_case))
    }
}

/// Token budget errors
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("Insufficient budget: need {needed} tokens, have {available} tokens")]
    InsufficientBudget { needed: usize, available: usize },
}
