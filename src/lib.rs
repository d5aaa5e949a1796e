//! Budget-aware document question answering
//!
//! Retrieval-augmented answering against a generation engine whose input quota
//! is small and shrinks as a conversation grows. The crate sizes retrieval to
//! the quota, trims evidence to a safety-margined budget, compacts conversation
//! history into a rolling summary, owns one engine session per conversation and
//! decodes the engine's streamed JSON answers for incremental display.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod qa;
pub mod session;
pub mod store;
pub mod stream;
pub mod telemetry;

pub use crate::config::Config;
pub use error::{ContextError, Result};
pub use qa::{AskRequest, QaManager, QaRequest, QaResponse, StreamEvent, TurnOutcome};
