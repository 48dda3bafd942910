use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;

use perf_harness::config::{CliArgs, Command};
use perf_harness::synthetic::{self, SyntheticConfig};
use perf_harness::{
    BenchmarkParams, Coordinator, CoordinatorProbe, HarnessConfig, QpsSearch, Report, SearchParams,
    SutFactory, WorkerKind,
};

/// Synthetic runs carry no payload; the SUT works from the query id
type Payload = ();

/// How long a finished run may take to report every outcome
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let mut config = HarnessConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let synthetic = args.sut.synthetic()?;
    tracing::info!("perf-harness starting with {:?}", synthetic);
    tracing::debug!("Configuration: {:?}", config);

    let factory = sut_factory(config.worker_kind, synthetic);
    let mut coordinator = Coordinator::new(config, factory)?;
    coordinator.start().context("failed to start workers")?;

    match args.command {
        Command::Server {
            qps,
            min_queries,
            min_duration_ms,
        } => {
            coordinator.benchmark(None, BenchmarkParams::new(qps, min_queries, min_duration_ms))?;
            let report = finish(&mut coordinator)?;
            print_report(&report, args.json);
        }
        Command::SingleStream {
            min_queries,
            min_duration_ms,
        } => {
            coordinator.benchmark_single_stream(None, min_queries, min_duration_ms)?;
            let report = finish(&mut coordinator)?;
            print_report(&report, args.json);
        }
        Command::Search {
            latency_bound_ms,
            percentile,
            init_qps,
            eps,
            min_queries,
            min_duration_ms,
        } => {
            let params = SearchParams {
                latency_bound_ms,
                percentile,
                init_qps,
                eps,
                min_query_count: min_queries,
                min_duration_ms,
                ..Default::default()
            };
            let outcome = {
                let mut probe = CoordinatorProbe::new(&mut coordinator, None, params.clone());
                QpsSearch::new(params).run(&mut probe)
            };
            coordinator.stop()?;

            let outcome = outcome?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!();
                println!("Trials:");
                for trial in &outcome.trials {
                    match trial.latency_ms {
                        Some(latency) => {
                            println!("  {:>12.3} qps  P{} {:>10.3} ms", trial.target_qps, percentile, latency)
                        }
                        None => println!("  {:>12.3} qps  no successful queries", trial.target_qps),
                    }
                }
                println!();
                println!(
                    "Found {:.3} qps at P{} {:.3} ms ({:?})",
                    outcome.target_qps, percentile, outcome.latency_ms, outcome.converged_by
                );
                if let Some(report) = &outcome.report {
                    report.print_table();
                }
            }
        }
    }

    Ok(())
}

fn sut_factory(kind: WorkerKind, synthetic: SyntheticConfig) -> SutFactory<Payload> {
    match kind {
        WorkerKind::Sync => synthetic::sync_factory(synthetic),
        WorkerKind::Async => synthetic::async_factory(synthetic),
    }
}

/// Stop once the last run drained and return its report
fn finish(coordinator: &mut Coordinator<Payload>) -> Result<Report> {
    coordinator
        .stop_after_drain(DRAIN_TIMEOUT)?
        .context("no run was recorded")
}

fn print_report(report: &Report, json: bool) {
    if json {
        println!("{}", report.to_json());
    } else {
        report.print_table();
    }
}
