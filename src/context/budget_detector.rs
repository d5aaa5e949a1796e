//! Engine quota detection and best-effort token measurement

use moka::future::Cache;
use std::sync::Arc;
use tracing::{debug, warn};

use super::token_estimator::{CharRatioEstimator, TokenEstimator};
use crate::engine::{Availability, GenerationEngine, GenerationSession, SessionOptions};
use crate::metrics::METRICS;

/// Result of a token measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub tokens: usize,
    /// True when the engine could not measure and the heuristic was used
    pub degraded: bool,
}

/// Discovers and caches the engine's input quota
pub struct BudgetDetector {
    engine: Arc<dyn GenerationEngine>,
    cache: Cache<String, usize>,
    fallback_quota: usize,
    heuristic: CharRatioEstimator,
}

impl BudgetDetector {
    pub fn new(engine: Arc<dyn GenerationEngine>, fallback_quota: usize) -> Self {
        Self {
            engine,
            cache: Cache::new(16),
            fallback_quota,
            heuristic: CharRatioEstimator::default(),
        }
    }

    /// Input quota of the engine.
    ///
    /// Detected once through a throwaway session and cached; if the engine is
    /// unavailable the conservative fallback is returned and not cached.
    pub async fn detect(&self) -> usize {
        let key = self.engine.id().to_string();
        if let Some(quota) = self.cache.get(&key).await {
            METRICS.record_quota_detection("cache");
            return quota;
        }

        match self.probe().await {
            Some(quota) => {
                debug!("Detected input quota of {} tokens for {}", quota, key);
                self.cache.insert(key, quota).await;
                METRICS.record_quota_detection("engine");
                quota
            }
            None => {
                METRICS.record_quota_detection("fallback");
                self.fallback_quota
            }
        }
    }

    async fn probe(&self) -> Option<usize> {
        if self.engine.availability().await != Availability::Available {
            warn!(
                "Engine {} not available, assuming {} token quota",
                self.engine.id(),
                self.fallback_quota
            );
            return None;
        }

        let session = match self.engine.create_session(SessionOptions::default()).await {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    "Quota probe failed ({}), assuming {} token quota",
                    e, self.fallback_quota
                );
                return None;
            }
        };

        let quota = session.input_quota();
        session.destroy().await;

        (quota > 0).then_some(quota)
    }

    /// Drop the cached quota, e.g. after the engine was reset
    pub async fn invalidate(&self) {
        self.cache.invalidate(self.engine.id()).await;
    }

    /// Tokens `text` would consume in `session`.
    ///
    /// Prefers the engine's own measurement; falls back to `chars / 4`.
    pub async fn measure(&self, session: &dyn GenerationSession, text: &str) -> Measurement {
        let measurement = match session.measure_input_usage(text).await {
            Ok(tokens) => Measurement {
                tokens,
                degraded: false,
            },
            Err(e) => {
                debug!("Engine measurement failed ({}), using heuristic", e);
                self.estimate(text)
            }
        };
        METRICS.record_measurement(measurement.degraded);
        measurement
    }

    /// Heuristic measurement without an engine round-trip
    pub fn estimate(&self, text: &str) -> Measurement {
        Measurement {
            tokens: self.heuristic.estimate(text),
            degraded: true,
        }
    }
}
