//! Generation session lifecycle

pub mod registry;
pub mod retry;

pub use registry::{session_options_for, RequestGuard, SessionRegistry};
pub use retry::{prompt_with_retry, run_with_retry, stream_with_retry, RetryPolicy};
