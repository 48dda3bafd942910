// Error handling module
// Defines error types for the harness lifecycle, the result ledger and QPS search

use thiserror::Error;

use crate::coordinator::State;
use crate::query::QueryId;

/// Errors raised by the harness lifecycle and configuration
#[derive(Error, Debug)]
pub enum HarnessError {
    /// A worker could not construct or set up its SUT
    #[error("Worker {worker} failed to start: {message}")]
    WorkerStartup { worker: usize, message: String },

    /// Not every execution unit reported ready in time
    #[error("Timed out after {timeout_ms}ms waiting for workers: {ready} of {expected} units ready")]
    StartupTimeout {
        timeout_ms: u64,
        ready: usize,
        expected: usize,
    },

    /// Operation called in the wrong lifecycle state
    #[error("Invalid coordinator state: expected {expected:?}, found {actual:?}")]
    InvalidState { expected: State, actual: State },

    /// Configuration or parameter error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A queue was closed while the harness still needed it
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Spawning an OS thread failed
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Draining did not finish before the deadline
    #[error("Timed out waiting for completions: {completed} of {issued} queries drained")]
    DrainTimeout { issued: u64, completed: u64 },
}

/// Rejected completion reported by the result ledger
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The id was never issued in the current run
    #[error("Query {0} was never issued")]
    UnknownQuery(QueryId),

    /// The id already has a recorded outcome
    #[error("Query {0} already completed")]
    DuplicateCompletion(QueryId),

    /// The completion belongs to an earlier run
    #[error("Completion from run {run} arrived during run {current}")]
    StaleRun { run: u64, current: u64 },
}

/// Calibration outcomes other than a found QPS
#[derive(Error, Debug)]
pub enum SearchError {
    /// Halving the rate stopped changing latency while still above the bound
    #[error("P{percentile} latency bound of {latency_bound_ms}ms looks unreachable: {last_latency_ms:.3}ms at {target_qps:.3} qps")]
    Unreachable {
        latency_bound_ms: f64,
        percentile: f64,
        target_qps: f64,
        last_latency_ms: f64,
    },

    /// Doubling never pushed latency above the bound
    #[error("Latency stayed below {latency_bound_ms}ms after {doublings} doublings (last target {target_qps:.3} qps)")]
    Unbounded {
        latency_bound_ms: f64,
        doublings: u32,
        target_qps: f64,
    },

    /// A trial completed without any successful query
    #[error("No successful queries at {target_qps:.3} qps")]
    NoSamples { target_qps: f64 },

    /// Invalid search parameters
    #[error("Invalid search parameters: {0}")]
    InvalidParams(String),

    /// The underlying benchmark run failed
    #[error("Benchmark run failed: {0}")]
    Harness(#[from] HarnessError),
}

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;
