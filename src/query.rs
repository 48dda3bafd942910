//! Query identity, completion records and the SUT metric merge policy.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Query id, contiguous from 0 within one run
pub type QueryId = i64;

/// Extra values a SUT reports alongside a completion
pub type Metrics = HashMap<String, Value>;

/// Metric key that replaces the measured latency (milliseconds, non-negative)
pub const LATENCY_OVERRIDE_KEY: &str = "latency_ms";

/// Metric key that marks a completion as failed when `true`
pub const ERROR_OVERRIDE_KEY: &str = "error";

/// Metric key that sets the completion outcome directly
pub const SUCCESS_OVERRIDE_KEY: &str = "success";

/// A query produced by a load generator
#[derive(Debug, Clone)]
pub struct Query<P> {
    pub id: QueryId,
    /// Opaque sample; `None` lets the SUT build its own input from the id
    pub payload: Option<P>,
    /// When the generator intended to issue this query
    pub scheduled_at: Instant,
}

impl<P> Query<P> {
    pub fn new(id: QueryId, scheduled_at: Instant) -> Self {
        Self {
            id,
            payload: None,
            scheduled_at,
        }
    }

    pub fn with_payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Outcome of one issued query, created once when its response is drained
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub id: QueryId,
    pub issue_time: Instant,
    pub completion_time: Instant,
    pub success: bool,
    /// Latency reported by the SUT, replacing `completion_time - issue_time`
    pub latency_override: Option<Duration>,
    /// Every other SUT-reported value, verbatim
    pub metrics: Metrics,
}

impl QueryRecord {
    /// Latency in milliseconds, preferring the SUT override
    pub fn latency_ms(&self) -> f64 {
        self.latency().as_secs_f64() * 1e3
    }

    pub fn latency(&self) -> Duration {
        self.latency_override.unwrap_or_else(|| {
            self.completion_time
                .saturating_duration_since(self.issue_time)
        })
    }
}

/// Result of applying SUT metrics to a completion
#[derive(Debug, Clone, PartialEq)]
pub struct MergedOutcome {
    pub success: bool,
    pub latency_override: Option<Duration>,
    pub metrics: Metrics,
}

/// Merge SUT-reported metrics into a completion outcome.
///
/// The harness owns issue and completion timestamps; the SUT may only replace the
/// latency (`latency_ms`) and the outcome (`error` / `success`). An `infer` that
/// returned an error stays failed whatever the metrics say. Unrecognised keys and
/// malformed override values are kept in `metrics` untouched.
pub fn merge_metrics(executed_ok: bool, mut metrics: Metrics) -> MergedOutcome {
    let mut success = executed_ok;

    let latency_override = metrics
        .get(LATENCY_OVERRIDE_KEY)
        .and_then(Value::as_f64)
        .and_then(|ms| Duration::try_from_secs_f64(ms / 1e3).ok());
    if latency_override.is_some() {
        metrics.remove(LATENCY_OVERRIDE_KEY);
    }

    if let Some(failed) = metrics.get(ERROR_OVERRIDE_KEY).and_then(Value::as_bool) {
        metrics.remove(ERROR_OVERRIDE_KEY);
        success = success && !failed;
    }

    if let Some(ok) = metrics.get(SUCCESS_OVERRIDE_KEY).and_then(Value::as_bool) {
        metrics.remove(SUCCESS_OVERRIDE_KEY);
        success = success && ok;
    }

    MergedOutcome {
        success,
        latency_override,
        metrics,
    }
}
