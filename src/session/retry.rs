//! Timeout-bounded engine calls with retry

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::registry::SessionRegistry;
use crate::engine::{EngineResult, GenerationSession, PromptOptions, SessionOptions, TextStream};
use crate::error::{ContextError, Result};
use crate::metrics::METRICS;

/// Retry policy for long engine calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Wall-clock limit per attempt
    pub timeout_ms: u64,
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Backoff bookkeeping carried across attempts
#[derive(Debug, Default)]
struct RetryState {
    attempt: usize,
    waited: Duration,
}

impl RetryState {
    fn next_delay(&mut self, policy: &RetryPolicy) -> Duration {
        let exp = policy
            .base_backoff_ms
            .saturating_mul(1 << self.attempt.saturating_sub(1).min(16))
            .min(policy.max_backoff_ms);
        let jitter = rand::thread_rng().gen_range(0..=exp / 4);
        let delay = Duration::from_millis(exp + jitter);
        self.waited += delay;
        delay
    }
}

/// Run `op` against the context's session, racing each attempt against the
/// policy timeout.
///
/// A timed-out session is destroyed and recreated from `options` before the
/// next attempt. Cancellation ends the loop at once and is never retried.
pub async fn run_with_retry<T, F, Fut>(
    registry: &SessionRegistry,
    context_id: &str,
    options: &SessionOptions,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(Arc<dyn GenerationSession>) -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut state = RetryState::default();

    loop {
        if cancel.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        state.attempt += 1;

        let session = registry.get_or_create(context_id, options).await?;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(ContextError::Cancelled),
            outcome = tokio::time::timeout(policy.timeout(), op(session)) => outcome,
        };

        match outcome {
            Ok(Ok(value)) => {
                if state.attempt > 1 {
                    debug!(
                        "Engine call on {} succeeded after {} attempts ({:?} backoff)",
                        context_id, state.attempt, state.waited
                    );
                }
                return Ok(value);
            }
            Ok(Err(e)) => {
                if state.attempt >= max_attempts {
                    return Err(e.into());
                }
                METRICS.record_retry("error");
                warn!(
                    "Engine call attempt {} on {} failed: {}",
                    state.attempt, context_id, e
                );
            }
            Err(_) => {
                warn!(
                    "Engine call attempt {} on {} timed out after {:?}, recreating session",
                    state.attempt,
                    context_id,
                    policy.timeout()
                );
                registry.discard_session(context_id).await;
                if state.attempt >= max_attempts {
                    return Err(ContextError::Timeout {
                        attempts: state.attempt,
                    });
                }
                METRICS.record_retry("timeout");
            }
        }

        let delay = state.next_delay(policy);
        tokio::select! {
            _ = cancel.cancelled() => return Err(ContextError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Prompt to completion under the retry policy
pub async fn prompt_with_retry(
    registry: &SessionRegistry,
    context_id: &str,
    options: &SessionOptions,
    input: &str,
    prompt_options: &PromptOptions,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<String> {
    run_with_retry(registry, context_id, options, policy, cancel, |session| async move {
        session.prompt(input, prompt_options).await
    })
    .await
}

/// Open a streaming prompt under the retry policy.
///
/// Only opening the stream is retried; fragments already delivered are never
/// replayed.
pub async fn stream_with_retry(
    registry: &SessionRegistry,
    context_id: &str,
    options: &SessionOptions,
    input: &str,
    prompt_options: &PromptOptions,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<TextStream> {
    run_with_retry(registry, context_id, options, policy, cancel, |session| async move {
        session.prompt_streaming(input, prompt_options).await
    })
    .await
}
