use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarnessError, Result};
use crate::load_gen::server::Arrival;
use crate::perf_result::Interpolation;
use crate::synthetic::SyntheticConfig;
use crate::worker::{PoolConfig, WorkerKind};

/// Throughput/latency benchmarking harness
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long, env = "PERF_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Number of workers
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Executor threads per sync worker
    #[arg(short, long, global = true)]
    pub threads: Option<usize>,

    /// In-flight tasks per async worker
    #[arg(long, global = true)]
    pub tasks: Option<usize>,

    /// Run the SUT on async workers
    #[arg(long = "async", global = true)]
    pub use_async: bool,

    /// Arrival policy of server runs (uniform, poisson)
    #[arg(long, global = true)]
    pub arrival: Option<Arrival>,

    /// RNG seed for arrivals and payload sampling
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Progress logging interval in milliseconds, 0 disables
    #[arg(long, global = true)]
    pub telemetry_ms: Option<u64>,

    /// Print the report as JSON instead of a table
    #[arg(long, global = true)]
    pub json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Emit log lines as JSON objects
    #[arg(long, env = "LOG_JSON", global = true)]
    pub log_json: bool,

    #[command(flatten)]
    pub sut: SutArgs,
}

/// Synthetic SUT behaviour
#[derive(Args, Debug, Clone)]
pub struct SutArgs {
    /// Mean service time of the synthetic SUT
    #[arg(long, default_value = "10", global = true)]
    pub latency_ms: f64,

    /// Extra service time per other query in flight on the same SUT
    #[arg(long, default_value = "0", global = true)]
    pub slope_ms: f64,

    /// Uniform jitter around the service time
    #[arg(long, default_value = "0", global = true)]
    pub jitter_ms: f64,

    /// Fraction of queries that fail
    #[arg(long, default_value = "0", global = true)]
    pub error_rate: f64,
}

impl SutArgs {
    pub fn synthetic(&self) -> Result<SyntheticConfig> {
        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(HarnessError::Config("latency_ms must be non-negative".to_string()));
        }
        if !self.slope_ms.is_finite() || self.slope_ms < 0.0 {
            return Err(HarnessError::Config("slope_ms must be non-negative".to_string()));
        }
        if !self.jitter_ms.is_finite() || self.jitter_ms < 0.0 {
            return Err(HarnessError::Config("jitter_ms must be non-negative".to_string()));
        }
        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(HarnessError::Config("error_rate must be in [0, 1]".to_string()));
        }
        Ok(SyntheticConfig {
            latency_ms: self.latency_ms,
            slope_ms: self.slope_ms,
            jitter_ms: self.jitter_ms,
            error_rate: self.error_rate,
        })
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open-loop run at a fixed target rate
    Server {
        /// Target queries per second
        #[arg(long)]
        qps: f64,
        #[arg(long, default_value = "100")]
        min_queries: u64,
        #[arg(long, default_value = "10000")]
        min_duration_ms: u64,
    },
    /// Closed-loop run with one query in flight
    SingleStream {
        #[arg(long, default_value = "100")]
        min_queries: u64,
        #[arg(long, default_value = "10000")]
        min_duration_ms: u64,
    },
    /// Find the highest rate meeting a percentile latency bound
    Search {
        #[arg(long)]
        latency_bound_ms: f64,
        #[arg(long, default_value = "90")]
        percentile: f64,
        #[arg(long, default_value = "10")]
        init_qps: f64,
        #[arg(long, default_value = "0.05")]
        eps: f64,
        #[arg(long, default_value = "100")]
        min_queries: u64,
        #[arg(long, default_value = "1000")]
        min_duration_ms: u64,
    },
}

impl CliArgs {
    /// Overlay command-line flags on a loaded configuration
    pub fn apply(&self, config: &mut HarnessConfig) {
        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        if let Some(threads) = self.threads {
            config.num_threads = threads;
        }
        if let Some(tasks) = self.tasks {
            config.num_tasks = tasks;
        }
        if self.use_async {
            config.worker_kind = WorkerKind::Async;
        }
        if let Some(arrival) = self.arrival {
            config.arrival = arrival;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(interval) = self.telemetry_ms {
            config.telemetry_interval_ms = interval;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

/// Harness configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    // Worker pool
    pub num_workers: usize,
    pub worker_kind: WorkerKind,
    /// Executor threads per sync worker
    pub num_threads: usize,
    /// In-flight tasks per async worker
    pub num_tasks: usize,
    pub startup_timeout_ms: u64,

    // Async worker loop
    pub poll_interval_ms: u64,
    pub idle_sleep_ms: u64,

    /// Progress logging and resource sampling period, 0 disables
    pub telemetry_interval_ms: u64,

    // Load generation and statistics
    pub arrival: Arrival,
    pub interpolation: Interpolation,
    pub seed: Option<u64>,

    pub log_level: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            worker_kind: WorkerKind::Sync,
            num_threads: 1,
            num_tasks: 16,
            startup_timeout_ms: 60_000,
            poll_interval_ms: 100,
            idle_sleep_ms: 100,
            telemetry_interval_ms: 0,
            arrival: Arrival::Uniform,
            interpolation: Interpolation::Nearest,
            seed: None,
            log_level: "info".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration with priority: ENV (`PERF_*`) > file > defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let loaded: HarnessConfig = builder
            .add_source(::config::Environment::with_prefix("PERF").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| HarnessError::Config(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(HarnessError::Config("num_workers must be at least 1".to_string()));
        }
        if self.num_threads == 0 {
            return Err(HarnessError::Config("num_threads must be at least 1".to_string()));
        }
        if self.num_tasks == 0 {
            return Err(HarnessError::Config("num_tasks must be at least 1".to_string()));
        }
        if self.startup_timeout_ms == 0 {
            return Err(HarnessError::Config(
                "startup_timeout_ms must be positive".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 || self.idle_sleep_ms == 0 {
            return Err(HarnessError::Config(
                "poll_interval_ms and idle_sleep_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Concurrency degree of one worker of `kind`
    pub fn concurrency(&self, kind: WorkerKind) -> usize {
        match kind {
            WorkerKind::Sync => self.num_threads,
            WorkerKind::Async => self.num_tasks,
        }
    }

    pub fn pool_config(&self, kind: WorkerKind) -> PoolConfig {
        PoolConfig {
            num_workers: self.num_workers,
            concurrency: self.concurrency(kind),
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            idle_interval: Duration::from_millis(self.idle_sleep_ms),
        }
    }

    pub fn telemetry_interval(&self) -> Option<Duration> {
        (self.telemetry_interval_ms > 0).then(|| Duration::from_millis(self.telemetry_interval_ms))
    }
}

/// Parameters of one open-loop run
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkParams {
    pub target_qps: f64,
    pub min_query_count: u64,
    pub min_duration_ms: u64,
}

impl BenchmarkParams {
    pub fn new(target_qps: f64, min_query_count: u64, min_duration_ms: u64) -> Self {
        Self {
            target_qps,
            min_query_count,
            min_duration_ms,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.target_qps.is_finite() || self.target_qps <= 0.0 {
            return Err(HarnessError::Config(format!(
                "target_qps must be positive and finite, got {}",
                self.target_qps
            )));
        }
        Ok(())
    }
}

/// Parameters of a QPS search
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub latency_bound_ms: f64,
    /// Percentile the bound applies to, e.g. 90 or 99.9
    pub percentile: f64,
    pub init_qps: f64,
    /// Relative tolerance around the bound
    pub eps: f64,
    /// Per trial
    pub min_query_count: u64,
    /// Per trial
    pub min_duration_ms: u64,
    /// Cap on the doubling phase
    pub max_doublings: u32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            latency_bound_ms: 100.0,
            percentile: 90.0,
            init_qps: 10.0,
            eps: 0.05,
            min_query_count: 100,
            min_duration_ms: 1_000,
            max_doublings: 20,
        }
    }
}

impl SearchParams {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(HarnessError::Config(msg.to_string()));
        if !self.latency_bound_ms.is_finite() || self.latency_bound_ms <= 0.0 {
            return invalid("latency_bound_ms must be positive");
        }
        if !(self.percentile > 0.0 && self.percentile <= 100.0) {
            return invalid("percentile must be in (0, 100]");
        }
        if !self.init_qps.is_finite() || self.init_qps <= 0.0 {
            return invalid("init_qps must be positive");
        }
        if !(self.eps > 0.0 && self.eps < 1.0) {
            return invalid("eps must be in (0, 1)");
        }
        Ok(())
    }

    /// Run parameters for one trial at `target_qps`
    pub fn trial(&self, target_qps: f64) -> BenchmarkParams {
        BenchmarkParams::new(target_qps, self.min_query_count, self.min_duration_ms)
    }
}
