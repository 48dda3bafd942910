//! Concurrency-safe ledger of query outcomes with percentile computation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::LedgerError;
use crate::query::{merge_metrics, Metrics, QueryId, QueryRecord};
use crate::report::LatencySummary;

/// Percentiles reported in every latency summary
pub const REPORT_PERCENTILES: [f64; 6] = [0.5, 0.9, 0.95, 0.97, 0.99, 0.999];

/// How a percentile rank between two samples is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Sample at `floor(p * (n - 1))`
    #[default]
    Nearest,
    /// Linear blend of the two samples around `p * (n - 1)`
    Linear,
}

impl std::str::FromStr for Interpolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nearest" => Ok(Interpolation::Nearest),
            "linear" => Ok(Interpolation::Linear),
            _ => Err(format!("Unknown interpolation: {}", s)),
        }
    }
}

#[derive(Default)]
struct Ledger {
    /// Run epoch, bumped by every reset
    run: u64,
    /// Issued, not yet completed
    pending: HashMap<QueryId, Instant>,
    /// Completed, keyed by id
    records: BTreeMap<QueryId, QueryRecord>,
    /// Latencies of successful records in milliseconds, unsorted
    success_latencies_ms: Vec<f64>,
    success_latency_sum_ms: f64,
    first_issue: Option<Instant>,
    last_completion: Option<Instant>,
    closed: bool,
}

/// Thread-safe ledger keyed by query id.
///
/// Written by the load generator (issues) and the drain thread (completions), read
/// concurrently by report callers. Reports only ever see completed records, so a
/// mid-run report is a partial view that refines as completions arrive.
pub struct PerfResult {
    ledger: Mutex<Ledger>,
    completed: Condvar,
    issued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    interpolation: Interpolation,
}

impl PerfResult {
    /// Create an empty ledger with nearest-rank percentiles
    pub fn new() -> Self {
        Self::with_interpolation(Interpolation::Nearest)
    }

    pub fn with_interpolation(interpolation: Interpolation) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            completed: Condvar::new(),
            issued: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            interpolation,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear every record and counter for a new run and return its number.
    ///
    /// Completions tagged with an older run are rejected from then on.
    pub fn reset(&self) -> u64 {
        let mut ledger = self.ledger();
        let run = ledger.run + 1;
        *ledger = Ledger {
            run,
            ..Ledger::default()
        };
        self.issued.store(0, Ordering::Relaxed);
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        drop(ledger);
        self.completed.notify_all();
        run
    }

    /// Number of the run currently being recorded
    pub fn current_run(&self) -> u64 {
        self.ledger().run
    }

    /// Wake any closed-loop waiter and stop further waiting
    pub fn close(&self) {
        self.ledger().closed = true;
        self.completed.notify_all();
    }

    /// Record that `id` was issued at `issued_at`
    pub fn add_query(&self, id: QueryId, issued_at: Instant) {
        let mut ledger = self.ledger();
        ledger.first_issue = Some(match ledger.first_issue {
            Some(first) if first <= issued_at => first,
            _ => issued_at,
        });
        ledger.pending.insert(id, issued_at);
        self.issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of `id`, completed now
    pub fn complete_query(
        &self,
        id: QueryId,
        success: bool,
        metrics: Metrics,
    ) -> Result<(), LedgerError> {
        self.complete_query_at(id, success, Instant::now(), metrics)
    }

    /// Record the outcome of `id`, completed at `completed_at`.
    ///
    /// `metrics` go through [`merge_metrics`]; ids that were never issued or that
    /// already completed are rejected and leave the ledger untouched.
    pub fn complete_query_at(
        &self,
        id: QueryId,
        success: bool,
        completed_at: Instant,
        metrics: Metrics,
    ) -> Result<(), LedgerError> {
        let run = self.current_run();
        self.complete_for_run(run, id, success, completed_at, metrics)
    }

    /// Like [`PerfResult::complete_query_at`], but only if `run` is still current.
    ///
    /// The run check and the insertion happen under one lock, so a reset can never
    /// interleave with a late completion from the previous run.
    pub fn complete_for_run(
        &self,
        run: u64,
        id: QueryId,
        success: bool,
        completed_at: Instant,
        metrics: Metrics,
    ) -> Result<(), LedgerError> {
        let mut ledger = self.ledger();
        if ledger.run != run {
            return Err(LedgerError::StaleRun {
                run,
                current: ledger.run,
            });
        }
        let issue_time = match ledger.pending.remove(&id) {
            Some(issued_at) => issued_at,
            None if ledger.records.contains_key(&id) => {
                return Err(LedgerError::DuplicateCompletion(id))
            }
            None => return Err(LedgerError::UnknownQuery(id)),
        };

        let merged = merge_metrics(success, metrics);
        let record = QueryRecord {
            id,
            issue_time,
            completion_time: completed_at.max(issue_time),
            success: merged.success,
            latency_override: merged.latency_override,
            metrics: merged.metrics,
        };

        if record.success {
            let latency_ms = record.latency_ms();
            ledger.success_latencies_ms.push(latency_ms);
            ledger.success_latency_sum_ms += latency_ms;
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        ledger.last_completion = Some(match ledger.last_completion {
            Some(last) if last >= record.completion_time => last,
            _ => record.completion_time,
        });
        ledger.records.insert(id, record);
        drop(ledger);

        self.completed.notify_all();
        Ok(())
    }

    /// Block until `id` has completed, the ledger is reset or closed.
    ///
    /// Returns `true` only if `id` has a recorded outcome.
    pub fn wait_for_completion(&self, id: QueryId) -> bool {
        let mut ledger = self.ledger();
        loop {
            if ledger.records.contains_key(&id) {
                return true;
            }
            if ledger.closed || !ledger.pending.contains_key(&id) {
                return false;
            }
            ledger = self
                .completed
                .wait_timeout(ledger, Duration::from_millis(100))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Block until no issued query is pending or `timeout` elapses.
    ///
    /// Returns `true` once drained.
    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ledger = self.ledger();
        while !ledger.pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            ledger = self
                .completed
                .wait_timeout(ledger, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn count_issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn count_succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn count_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn count_completed(&self) -> u64 {
        self.count_succeeded() + self.count_failed()
    }

    /// Issued queries still waiting for an outcome
    pub fn count_pending(&self) -> u64 {
        self.ledger().pending.len() as u64
    }

    /// Completed queries per second, from the first issue to the last completion
    pub fn get_actual_qps(&self) -> f64 {
        let ledger = self.ledger();
        let (Some(first), Some(last)) = (ledger.first_issue, ledger.last_completion) else {
            return 0.0;
        };
        let span = last.saturating_duration_since(first).as_secs_f64();
        if span == 0.0 {
            return 0.0;
        }
        ledger.records.len() as f64 / span
    }

    /// Latencies in milliseconds over successful records: one value per entry of
    /// `percentiles` (each in `[0, 1]`), then min, avg and max when requested.
    /// Empty when nothing has succeeded yet.
    pub fn get_latencies(&self, percentiles: &[f64], min: bool, avg: bool, max: bool) -> Vec<f64> {
        let (mut sorted, sum) = {
            let ledger = self.ledger();
            (
                ledger.success_latencies_ms.clone(),
                ledger.success_latency_sum_ms,
            )
        };
        if sorted.is_empty() {
            return Vec::new();
        }
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mut res: Vec<f64> = percentiles
            .iter()
            .map(|&p| percentile(&sorted, p, self.interpolation))
            .collect();
        if min {
            res.push(sorted[0]);
        }
        if avg {
            res.push(sum / sorted.len() as f64);
        }
        if max {
            res.push(sorted[sorted.len() - 1]);
        }
        res
    }

    /// Latency summary over [`REPORT_PERCENTILES`], or `None` before the first success
    pub fn latency_summary(&self) -> Option<LatencySummary> {
        let values = self.get_latencies(&REPORT_PERCENTILES, true, true, true);
        LatencySummary::from_values(&values)
    }

    /// Snapshot of completed records ordered by id
    pub fn records(&self) -> Vec<QueryRecord> {
        self.ledger().records.values().cloned().collect()
    }
}

impl Default for PerfResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Value at rank `p * (n - 1)` of an ascending, non-empty slice
fn percentile(sorted: &[f64], p: f64, interpolation: Interpolation) -> f64 {
    let last = sorted.len() - 1;
    let rank = p.clamp(0.0, 1.0) * last as f64;
    let lower = (rank.floor() as usize).min(last);
    match interpolation {
        Interpolation::Nearest => sorted[lower],
        Interpolation::Linear => {
            let upper = (lower + 1).min(last);
            let frac = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * frac
        }
    }
}
