//! Metrics collection for observability

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry, register_histogram_with_registry, Counter, CounterVec,
    Histogram, HistogramVec, Opts, Registry,
};
use std::sync::Arc;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> =
    Lazy::new(|| Arc::new(Metrics::new().expect("Failed to initialize metrics")));

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Budget detection and measurement
    pub quota_detections: CounterVec,
    pub token_measurements: CounterVec,

    // Trimming
    pub trims: CounterVec,
    pub trim_budget_used: Histogram,
    pub trim_history_window: Histogram,

    // Conversation compaction
    pub summarizations: CounterVec,
    pub session_rebases: Counter,

    // Sessions and requests
    pub sessions_created: Counter,
    pub requests_cancelled: Counter,
    pub engine_retries: CounterVec,

    // Decoding
    pub decode_fallbacks: Counter,
    pub turn_duration: HistogramVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        let quota_detections = register_counter_vec_with_registry!(
            Opts::new("quota_detections_total", "Engine quota detections"),
            &["source"],
            registry
        )?;

        let token_measurements = register_counter_vec_with_registry!(
            Opts::new("token_measurements_total", "Token measurements by method"),
            &["method"],
            registry
        )?;

        let trims = register_counter_vec_with_registry!(
            Opts::new("trims_total", "Evidence trimming passes"),
            &["floor"],
            registry
        )?;

        let trim_budget_used = register_histogram_with_registry!(
            "trim_budget_used_ratio",
            "Share of the margined budget used by selected evidence",
            registry
        )?;

        let trim_history_window = register_histogram_with_registry!(
            "trim_history_window",
            "Recent-message window kept after progressive fallback",
            registry
        )?;

        let summarizations = register_counter_vec_with_registry!(
            Opts::new("summarizations_total", "Conversation summarizations"),
            &["kind"],
            registry
        )?;

        let session_rebases = register_counter_with_registry!(
            Opts::new("session_rebases_total", "Sessions rebased onto a fresh budget"),
            registry
        )?;

        let sessions_created = register_counter_with_registry!(
            Opts::new("sessions_created_total", "Generation sessions created"),
            registry
        )?;

        let requests_cancelled = register_counter_with_registry!(
            Opts::new("requests_cancelled_total", "Requests cancelled or superseded"),
            registry
        )?;

        let engine_retries = register_counter_vec_with_registry!(
            Opts::new("engine_retries_total", "Engine call retries by cause"),
            &["cause"],
            registry
        )?;

        let decode_fallbacks = register_counter_with_registry!(
            Opts::new(
                "decode_fallbacks_total",
                "Responses whose final JSON failed to parse"
            ),
            registry
        )?;

        let turn_duration = register_histogram_vec_with_registry!(
            "turn_duration_seconds",
            "Question turn duration in seconds",
            &["use_case"],
            registry
        )?;

        Ok(Self {
            registry,
            quota_detections,
            token_measurements,
            trims,
            trim_budget_used,
            trim_history_window,
            summarizations,
            session_rebases,
            sessions_created,
            requests_cancelled,
            engine_retries,
            decode_fallbacks,
            turn_duration,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record where a quota came from ("engine", "cache", "fallback")
    pub fn record_quota_detection(&self, source: &str) {
        self.quota_detections.with_label_values(&[source]).inc();
    }

    /// Record a token measurement
    pub fn record_measurement(&self, degraded: bool) {
        let method = if degraded { "heuristic" } else { "engine" };
        self.token_measurements.with_label_values(&[method]).inc();
    }

    /// Record a trimming pass
    pub fn record_trim(&self, used: usize, budget: usize, floor_met: bool, window: usize) {
        let floor = if floor_met { "met" } else { "unmet" };
        self.trims.with_label_values(&[floor]).inc();
        if budget > 0 {
            self.trim_budget_used.observe(used as f64 / budget as f64);
        }
        self.trim_history_window.observe(window as f64);
    }

    /// Record a summarization ("append", "merge", "failed")
    pub fn record_summarization(&self, kind: &str) {
        self.summarizations.with_label_values(&[kind]).inc();
    }

    pub fn record_rebase(&self) {
        self.session_rebases.inc();
    }

    pub fn record_session_created(&self) {
        self.sessions_created.inc();
    }

    pub fn record_cancellation(&self) {
        self.requests_cancelled.inc();
    }

    /// Record a retry ("timeout", "error")
    pub fn record_retry(&self, cause: &str) {
        self.engine_retries.with_label_values(&[cause]).inc();
    }

    pub fn record_decode_fallback(&self) {
        self.decode_fallbacks.inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Helper macro to time operations
#[macro_export]
macro_rules! time_operation {
    ($histogram:expr, $label:expr, $operation:expr) => {{
        let timer = $histogram.with_label_values(&[$label]).start_timer();
        let result = $operation;
        timer.observe_duration();
        result
    }};
}
