//! Report generation for benchmark results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::perf_result::PerfResult;
use crate::telemetry::ResourceUsage;
use crate::worker::WorkerKind;

/// Load generation policy a report was produced under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Server,
    SingleStream,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Server => write!(f, "server"),
            Mode::SingleStream => write!(f, "single_stream"),
        }
    }
}

/// Latency percentiles in milliseconds, rounded to 3 decimals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p97: f64,
    pub p99: f64,
    pub p999: f64,
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

impl LatencySummary {
    /// Build from `[p50, p90, p95, p97, p99, p99.9, min, avg, max]`
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let &[p50, p90, p95, p97, p99, p999, min, avg, max] = values else {
            return None;
        };
        Some(Self {
            p50: round3(p50),
            p90: round3(p90),
            p95: round3(p95),
            p97: round3(p97),
            p99: round3(p99),
            p999: round3(p999),
            min: round3(min),
            avg: round3(avg),
            max: round3(max),
        })
    }

    /// Look up a reported percentile by its number (50, 90, 95, 97, 99, 99.9)
    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        let key = (percentile * 10.0).round() as i64;
        match key {
            500 => Some(self.p50),
            900 => Some(self.p90),
            950 => Some(self.p95),
            970 => Some(self.p97),
            990 => Some(self.p99),
            999 => Some(self.p999),
            _ => None,
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Complete benchmark report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub host: String,
    pub mode: Mode,
    pub worker_kind: WorkerKind,
    pub num_workers: usize,
    /// Threads (sync) or tasks (async) per worker
    pub concurrency: usize,
    /// `None` for single-stream runs
    pub target_qps: Option<f64>,
    pub issued_qps: f64,
    pub actual_qps: f64,
    pub count_issued: u64,
    pub count_succeeded: u64,
    pub count_failed: u64,
    /// `None` until at least one query succeeded
    pub latency: Option<LatencySummary>,
    /// Present when telemetry sampling was enabled
    pub resources: Option<ResourceUsage>,
}

/// Per-run facts that do not come from the result ledger
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub mode: Mode,
    pub worker_kind: WorkerKind,
    pub num_workers: usize,
    pub concurrency: usize,
    pub target_qps: Option<f64>,
}

impl Report {
    /// Snapshot the ledger into a report
    pub fn build(
        context: &RunContext,
        result: &PerfResult,
        count_issued: u64,
        issued_qps: f64,
        resources: Option<ResourceUsage>,
    ) -> Self {
        Self {
            run_id: context.run_id,
            started_at: context.started_at,
            host: host_name(),
            mode: context.mode,
            worker_kind: context.worker_kind,
            num_workers: context.num_workers,
            concurrency: context.concurrency,
            target_qps: context.target_qps,
            issued_qps,
            actual_qps: result.get_actual_qps(),
            count_issued,
            count_succeeded: result.count_succeeded(),
            count_failed: result.count_failed(),
            latency: result.latency_summary(),
            resources,
        }
    }

    /// True once every issued query has an outcome
    pub fn is_complete(&self) -> bool {
        self.count_issued == self.count_succeeded + self.count_failed
    }

    /// Export the report as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Print the report as an ASCII table
    pub fn print_table(&self) {
        println!();
        println!("╔════════════════════════════════════════════════════════════════════╗");
        println!("║                        BENCHMARK RESULTS                           ║");
        println!("╚════════════════════════════════════════════════════════════════════╝");
        println!();
        println!(
            "  Mode: {}   Workers: {} x {} ({:?})   Host: {}",
            self.mode, self.num_workers, self.concurrency, self.worker_kind, self.host
        );
        println!();
        println!("┌──────────┬──────────┬──────────┬──────────┬──────────┬──────────┐");
        println!("│ QPS tgt  │ QPS iss  │ QPS act  │  Issued  │    OK    │  Failed  │");
        println!("├──────────┼──────────┼──────────┼──────────┼──────────┼──────────┤");
        let target = self
            .target_qps
            .map(|q| format!("{:>8.1}", q))
            .unwrap_or_else(|| format!("{:>8}", "-"));
        println!(
            "│ {} │ {:>8.1} │ {:>8.1} │ {:>8} │ {:>8} │ {:>8} │",
            target,
            self.issued_qps,
            self.actual_qps,
            self.count_issued,
            self.count_succeeded,
            self.count_failed
        );
        println!("└──────────┴──────────┴──────────┴──────────┴──────────┴──────────┘");

        if let Some(l) = &self.latency {
            println!();
            println!("┌─────────┬─────────┬─────────┬─────────┬─────────┬─────────┬─────────┬─────────┬─────────┐");
            println!("│   p50   │   p90   │   p95   │   p97   │   p99   │  p99.9  │   min   │   avg   │   max   │");
            println!("├─────────┼─────────┼─────────┼─────────┼─────────┼─────────┼─────────┼─────────┼─────────┤");
            println!(
                "│ {:>7.2} │ {:>7.2} │ {:>7.2} │ {:>7.2} │ {:>7.2} │ {:>7.2} │ {:>7.2} │ {:>7.2} │ {:>7.2} │",
                l.p50, l.p90, l.p95, l.p97, l.p99, l.p999, l.min, l.avg, l.max
            );
            println!("└─────────┴─────────┴─────────┴─────────┴─────────┴─────────┴─────────┴─────────┴─────────┘");
            println!("  (latency in ms)");
        } else {
            println!("  No successful queries; latency unavailable.");
        }

        if let Some(r) = &self.resources {
            println!(
                "  CPU avg/max: {:.1}%/{:.1}%   Memory avg/max: {:.0}/{:.0} MB",
                r.avg_cpu, r.max_cpu, r.avg_memory_mb, r.max_memory_mb
            );
        }
        println!();
    }

    /// One-line summary for logs
    pub fn summary_line(&self) -> String {
        let p50 = self.latency.map(|l| l.p50).unwrap_or(0.0);
        let p99 = self.latency.map(|l| l.p99).unwrap_or(0.0);
        format!(
            "issued {} ({:.1} qps), ok {}, failed {}, actual {:.1} qps, p50 {:.1}ms, p99 {:.1}ms",
            self.count_issued,
            self.issued_qps,
            self.count_succeeded,
            self.count_failed,
            self.actual_qps,
            p50,
            p99
        )
    }
}

fn host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
