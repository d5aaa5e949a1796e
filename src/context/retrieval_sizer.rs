//! Adaptive retrieval sizing
//!
//! Decides how many chunks to request from the store. The request is
//! oversampled so the trimmer can drop weak chunks without a second
//! round-trip to the store.

use serde::{Deserialize, Serialize};

use super::models::UseCase;
use super::token_estimator::CHARS_PER_TOKEN;

pub const MIN_OPTIMAL_CHUNKS: usize = 2;
pub const MAX_OPTIMAL_CHUNKS: usize = 8;

/// Average chunk size above which oversampling turns conservative
const LARGE_CHUNK_CHARS: usize = 1000;
const SMALL_CHUNK_CHARS: usize = 500;

/// Retrieval sizing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub chat_overhead: usize,
    pub summary_overhead: usize,
    pub explain_overhead: usize,
    pub analysis_overhead: usize,
    pub glossary_overhead: usize,
    /// Tokens reserved for the answer when sizing
    pub response_reserve: usize,
    /// Label/separator tokens charged per chunk
    pub per_chunk_overhead: usize,
    /// Assumed average chunk size when the store does not know
    pub default_chunk_chars: usize,
    pub conservative_multiplier: usize,
    pub aggressive_multiplier: usize,
    pub small_chunk_ceiling: usize,
    pub medium_chunk_ceiling: usize,
    pub large_chunk_ceiling: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chat_overhead: 400,
            summary_overhead: 200,
            explain_overhead: 250,
            analysis_overhead: 300,
            glossary_overhead: 250,
            response_reserve: 300,
            per_chunk_overhead: 10,
            default_chunk_chars: 800,
            conservative_multiplier: 3,
            aggressive_multiplier: 4,
            small_chunk_ceiling: 40,
            medium_chunk_ceiling: 30,
            large_chunk_ceiling: 20,
        }
    }
}

impl RetrievalConfig {
    /// Prompt overhead estimate for a use case
    pub fn overhead_estimate(&self, use_case: UseCase) -> usize {
        match use_case {
            UseCase::Chat => self.chat_overhead,
            UseCase::Summary => self.summary_overhead,
            UseCase::Explain => self.explain_overhead,
            UseCase::Analysis => self.analysis_overhead,
            UseCase::Glossary => self.glossary_overhead,
        }
    }
}

/// Computes retrieval limits from the detected quota
#[derive(Debug, Clone, Default)]
pub struct RetrievalSizer {
    config: RetrievalConfig,
}

impl RetrievalSizer {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Number of chunks that should fit one request, in `[2, 8]`
    pub fn optimal_chunk_count(
        &self,
        quota_tokens: usize,
        use_case: UseCase,
        avg_chunk_chars: usize,
    ) -> usize {
        let available = quota_tokens
            .saturating_sub(self.config.overhead_estimate(use_case))
            .saturating_sub(self.config.response_reserve);
        let per_chunk =
            avg_chunk_chars.div_ceil(CHARS_PER_TOKEN) + self.config.per_chunk_overhead;

        (available / per_chunk.max(1)).clamp(MIN_OPTIMAL_CHUNKS, MAX_OPTIMAL_CHUNKS)
    }

    /// Oversampled retrieval limit
    ///
    /// Large chunks (>1000 chars) are oversampled 3x, smaller ones 4x, then
    /// capped at 40/30/20 for small/medium/large averages.
    pub fn adaptive_chunk_limit(
        &self,
        quota_tokens: usize,
        avg_chunk_chars: usize,
        use_case: UseCase,
    ) -> usize {
        let optimal = self.optimal_chunk_count(quota_tokens, use_case, avg_chunk_chars);

        let multiplier = if avg_chunk_chars > LARGE_CHUNK_CHARS {
            self.config.conservative_multiplier
        } else {
            self.config.aggressive_multiplier
        };

        let ceiling = if avg_chunk_chars < SMALL_CHUNK_CHARS {
            self.config.small_chunk_ceiling
        } else if avg_chunk_chars <= LARGE_CHUNK_CHARS {
            self.config.medium_chunk_ceiling
        } else {
            self.config.large_chunk_ceiling
        };

        (optimal * multiplier).min(ceiling)
    }
}
