//! Context management under a small, fixed input quota
//!
//! Sizes retrieval against the detected quota, trims evidence to a margined
//! budget, and keeps conversation history compact enough to share that budget.

pub mod budget_detector;
pub mod conversation;
pub mod formatting;
pub mod models;
pub mod retrieval_sizer;
pub mod summarizer;
pub mod token_budget;
pub mod token_estimator;
pub mod trimmer;

pub use budget_detector::{BudgetDetector, Measurement};
pub use conversation::{
    ConversationConfig, ConversationPhase, ConversationStateManager, SummarizationOutcome,
};
pub use formatting::{format_chunks, resolve_citations, FormatLimits};
pub use models::{
    ChatMessage, ChunkLocator, Citation, ContentChunk, ConversationState, Role, UseCase,
    MAX_RECENT_MESSAGES,
};
pub use retrieval_sizer::{RetrievalConfig, RetrievalSizer};
pub use summarizer::{
    ConcatenationSummarizer, EngineSummarizer, LLMSummarizer, Summarizer, SummarizerConfig,
};
pub use token_budget::{BudgetError, TokenBudget, TokenBudgetConfig, FALLBACK_QUOTA_TOKENS};
pub use token_estimator::{CharRatioEstimator, EstimatorKind, TiktokenEstimator, TokenEstimator};
pub use trimmer::{BudgetTrimmer, TrimResult, TrimStatus};
