// Integration tests for perf-harness
//
// These tests drive the full stack: coordinator, worker pool, queues, drain thread,
// result ledger and QPS search, against small in-process SUTs.

use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use perf_harness::synthetic::{self, SyntheticConfig};
use perf_harness::worker::async_worker::CANCELLED_KEY;
use perf_harness::{
    AsyncSut, BenchmarkParams, Coordinator, CoordinatorProbe, HarnessConfig, HarnessError,
    Metrics, QpsSearch, Request, SearchParams, State, SutFactory, SyncSut, WorkerKind,
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

fn sync_config(num_workers: usize, num_threads: usize) -> HarnessConfig {
    HarnessConfig {
        num_workers,
        num_threads,
        startup_timeout_ms: 10_000,
        ..Default::default()
    }
}

fn async_config(num_workers: usize, num_tasks: usize) -> HarnessConfig {
    HarnessConfig {
        num_workers,
        worker_kind: WorkerKind::Async,
        num_tasks,
        startup_timeout_ms: 10_000,
        poll_interval_ms: 10,
        idle_sleep_ms: 10,
        ..Default::default()
    }
}

fn sleeping_sut(latency_ms: f64) -> SutFactory<u32> {
    synthetic::sync_factory(SyntheticConfig {
        latency_ms,
        ..Default::default()
    })
}

// ==================================================================================================
// Lifecycle Tests
// ==================================================================================================

#[test]
fn test_readiness_barrier_counts_every_thread() {
    let mut coordinator = Coordinator::new(sync_config(4, 2), sleeping_sut(1.0)).unwrap();
    assert_eq!(coordinator.start().unwrap(), 8);
    assert_eq!(coordinator.ready_units(), 8);

    let handles = coordinator.handles();
    assert_eq!(handles.len(), 4);
    assert!(handles.iter().all(|h| h.ready && h.concurrency_degree == 2));

    coordinator.stop().unwrap();
}

#[test]
fn test_benchmark_before_start_is_rejected() {
    let mut coordinator = Coordinator::new(sync_config(1, 1), sleeping_sut(1.0)).unwrap();
    match coordinator.benchmark(None, BenchmarkParams::new(100.0, 10, 0)) {
        Err(HarnessError::InvalidState { expected, actual }) => {
            assert_eq!(expected, State::Ready);
            assert_eq!(actual, State::New);
        }
        other => panic!("unexpected {:?}", other.map(|r| r.count_issued)),
    }
}

#[test]
fn test_startup_failure_surfaces_instead_of_hanging() {
    let factory: SutFactory<u32> = SutFactory::sync(|worker| {
        Ok(SyncSut::new(|_: Request<u32>| Ok(Metrics::new())).with_setup(move || {
            if worker == 2 {
                anyhow::bail!("missing weights for worker {}", worker);
            }
            Ok(())
        }))
    });
    let mut coordinator = Coordinator::new(sync_config(3, 2), factory).unwrap();

    match coordinator.start() {
        Err(HarnessError::WorkerStartup { worker, message }) => {
            assert_eq!(worker, 2);
            assert!(message.contains("missing weights"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(coordinator.state(), State::Stopped);
}

#[test]
fn test_setup_and_teardown_once_per_worker() {
    let setups = Arc::new(AtomicUsize::new(0));
    let teardowns = Arc::new(AtomicUsize::new(0));
    let factory: SutFactory<u32> = {
        let setups = setups.clone();
        let teardowns = teardowns.clone();
        SutFactory::sync(move |_| {
            let setups = setups.clone();
            let teardowns = teardowns.clone();
            Ok(SyncSut::new(|_: Request<u32>| Ok(Metrics::new()))
                .with_setup(move || {
                    setups.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .with_teardown(move || {
                    teardowns.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
        })
    };

    let mut coordinator = Coordinator::new(sync_config(3, 2), factory).unwrap();
    coordinator.start().unwrap();
    assert_eq!(setups.load(Ordering::SeqCst), 3);
    coordinator
        .benchmark(None, BenchmarkParams::new(2000.0, 30, 0))
        .unwrap();
    coordinator.stop().unwrap();

    assert_eq!(setups.load(Ordering::SeqCst), 3);
    assert_eq!(teardowns.load(Ordering::SeqCst), 3);
}

// ==================================================================================================
// Server Mode Tests
// ==================================================================================================

#[test]
fn test_every_issued_query_accounted_after_stop() {
    let factory: SutFactory<u32> = synthetic::sync_factory(SyntheticConfig {
        latency_ms: 2.0,
        slope_ms: 0.0,
        jitter_ms: 1.0,
        error_rate: 0.1,
    });
    let mut coordinator = Coordinator::new(sync_config(2, 2), factory).unwrap();
    coordinator.start().unwrap();

    let partial = coordinator
        .benchmark(None, BenchmarkParams::new(500.0, 100, 0))
        .unwrap();
    assert_eq!(partial.count_issued, 100);
    assert_eq!(partial.target_qps, Some(500.0));

    let report = coordinator.stop().unwrap().unwrap();
    assert!(report.is_complete());
    assert_eq!(report.count_succeeded + report.count_failed, 100);
    assert!(report.count_succeeded > 50);
    assert!(report.actual_qps > 0.0);

    let latency = report.latency.unwrap();
    assert!(latency.min >= 0.9, "min latency {}", latency.min);
    assert!(latency.p50 <= latency.p99);
}

#[test]
fn test_successive_runs_are_independent() {
    let mut coordinator = Coordinator::new(sync_config(2, 1), sleeping_sut(1.0)).unwrap();
    coordinator.start().unwrap();

    coordinator
        .benchmark(None, BenchmarkParams::new(1000.0, 50, 0))
        .unwrap();
    let first = coordinator.wait_for_completion(Duration::from_secs(10)).unwrap();
    assert_eq!(first.count_issued, 50);

    coordinator
        .benchmark(None, BenchmarkParams::new(1000.0, 20, 0))
        .unwrap();
    let second = coordinator.wait_for_completion(Duration::from_secs(10)).unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.count_issued, 20);
    assert_eq!(second.count_succeeded, 20);
    let ids: Vec<i64> = coordinator
        .perf_result()
        .records()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, (0..20).collect::<Vec<_>>());

    coordinator.stop().unwrap();
}

#[test]
fn test_rerun_after_overload_skips_stale_backlog() {
    let mut coordinator = Coordinator::new(sync_config(1, 1), sleeping_sut(20.0)).unwrap();
    coordinator.start().unwrap();

    // 100 queries of 20ms land at once on a single thread: about 2s of backlog
    coordinator
        .benchmark(None, BenchmarkParams::new(10_000.0, 100, 0))
        .unwrap();

    coordinator
        .benchmark(None, BenchmarkParams::new(1000.0, 5, 0))
        .unwrap();
    let report = coordinator.wait_for_completion(Duration::from_secs(10)).unwrap();

    assert_eq!(report.count_issued, 5);
    assert_eq!(report.count_succeeded, 5);
    let latency = report.latency.unwrap();
    assert!(latency.max < 500.0, "max latency {}ms", latency.max);

    coordinator.stop().unwrap();
}

#[test]
fn test_sut_failures_are_recorded_not_fatal() {
    let factory: SutFactory<u32> = SutFactory::sync(|_| {
        Ok(SyncSut::new(|req: Request<u32>| {
            if req.id % 2 == 1 {
                anyhow::bail!("odd query {}", req.id);
            }
            if req.id == 4 {
                panic!("SUT crashed");
            }
            Ok(Metrics::new())
        }))
    });
    let mut coordinator = Coordinator::new(sync_config(1, 2), factory).unwrap();
    coordinator.start().unwrap();
    coordinator
        .benchmark(None, BenchmarkParams::new(2000.0, 20, 0))
        .unwrap();

    let report = coordinator.stop().unwrap().unwrap();
    assert_eq!(report.count_failed, 11);
    assert_eq!(report.count_succeeded, 9);
}

#[test]
fn test_payloads_reach_the_sut() {
    let factory: SutFactory<u32> = SutFactory::sync(|_| {
        Ok(SyncSut::new(|req: Request<u32>| {
            let mut metrics = Metrics::new();
            metrics.insert("payload".to_string(), json!(req.payload));
            Ok(metrics)
        }))
    });
    let mut coordinator = Coordinator::new(sync_config(2, 1), factory).unwrap();
    coordinator.start().unwrap();
    coordinator
        .benchmark(Some(&[11u32, 22, 33][..]), BenchmarkParams::new(2000.0, 40, 0))
        .unwrap();
    coordinator.stop().unwrap();

    let seen: HashSet<u64> = coordinator
        .perf_result()
        .records()
        .iter()
        .map(|r| r.metrics["payload"].as_u64().unwrap())
        .collect();
    assert!(seen.is_subset(&HashSet::from([11, 22, 33])));
    assert!(!seen.is_empty());
}

#[test]
fn test_latency_override_from_sut() {
    let factory: SutFactory<u32> = SutFactory::sync(|_| {
        Ok(SyncSut::new(|_: Request<u32>| {
            let mut metrics = Metrics::new();
            metrics.insert("latency_ms".to_string(), json!(42.0));
            Ok(metrics)
        }))
    });
    let mut coordinator = Coordinator::new(sync_config(1, 1), factory).unwrap();
    coordinator.start().unwrap();
    coordinator
        .benchmark(None, BenchmarkParams::new(1000.0, 10, 0))
        .unwrap();

    let report = coordinator.stop().unwrap().unwrap();
    let latency = report.latency.unwrap();
    assert_eq!(latency.p50, 42.0);
    assert_eq!(latency.max, 42.0);
}

#[test]
fn test_oversized_latency_override_does_not_stall_the_drain() {
    let factory: SutFactory<u32> = SutFactory::sync(|_| {
        Ok(SyncSut::new(|req: Request<u32>| {
            let mut metrics = Metrics::new();
            if req.id == 0 {
                metrics.insert("latency_ms".to_string(), json!(1e300));
            }
            Ok(metrics)
        }))
    });
    let mut coordinator = Coordinator::new(sync_config(1, 1), factory).unwrap();
    coordinator.start().unwrap();
    coordinator
        .benchmark(None, BenchmarkParams::new(1000.0, 10, 0))
        .unwrap();

    let report = coordinator.wait_for_completion(Duration::from_secs(10)).unwrap();
    assert_eq!(report.count_succeeded, 10);
    let records = coordinator.perf_result().records();
    assert_eq!(records[0].metrics["latency_ms"], json!(1e300));
    assert!(report.latency.unwrap().max < 1000.0);

    coordinator.stop().unwrap();
}

// ==================================================================================================
// Single-Stream Mode Tests
// ==================================================================================================

#[test]
fn test_single_stream_keeps_one_query_in_flight() {
    let mut coordinator = Coordinator::new(sync_config(2, 2), sleeping_sut(2.0)).unwrap();
    coordinator.start().unwrap();

    let report = coordinator
        .benchmark_single_stream(None, 30, 0)
        .unwrap();
    // the last query may still be draining
    assert_eq!(report.count_issued, 30);
    assert!(report.target_qps.is_none());

    let report = coordinator.stop().unwrap().unwrap();
    assert!(report.is_complete());

    let records = coordinator.perf_result().records();
    assert_eq!(records.len(), 30);
    for pair in records.windows(2) {
        assert!(pair[1].issue_time >= pair[0].completion_time);
    }
}

// ==================================================================================================
// Async Worker Tests
// ==================================================================================================

#[test]
fn test_async_workers_serve_and_account() {
    let factory: SutFactory<u32> = synthetic::async_factory(SyntheticConfig {
        latency_ms: 5.0,
        ..Default::default()
    });
    let mut coordinator = Coordinator::new(async_config(2, 4), factory).unwrap();
    assert_eq!(coordinator.start().unwrap(), 2);

    coordinator
        .benchmark(None, BenchmarkParams::new(400.0, 80, 0))
        .unwrap();
    coordinator.wait_for_completion(Duration::from_secs(10)).unwrap();
    let report = coordinator.stop().unwrap().unwrap();

    assert!(report.is_complete());
    assert_eq!(report.count_succeeded, 80);
    assert_eq!(report.worker_kind, WorkerKind::Async);
    assert_eq!(report.concurrency, 4);
}

#[test]
fn test_stop_after_drain_keeps_async_queries() {
    let factory: SutFactory<u32> = synthetic::async_factory(SyntheticConfig {
        latency_ms: 20.0,
        ..Default::default()
    });
    let mut coordinator = Coordinator::new(async_config(1, 8), factory).unwrap();
    coordinator.start().unwrap();
    coordinator
        .benchmark(None, BenchmarkParams::new(1000.0, 16, 0))
        .unwrap();

    let report = coordinator
        .stop_after_drain(Duration::from_secs(10))
        .unwrap()
        .unwrap();

    assert_eq!(coordinator.state(), State::Stopped);
    assert!(report.is_complete());
    assert_eq!(report.count_succeeded, 16);
    assert_eq!(report.count_failed, 0);
}

#[test]
fn test_stop_cancels_in_flight_async_queries() {
    let factory: SutFactory<u32> = SutFactory::asynchronous(|_| {
        Ok(AsyncSut::new(|_: Request<u32>| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Metrics::new())
        }))
    });
    let mut coordinator = Coordinator::new(async_config(1, 8), factory).unwrap();
    coordinator.start().unwrap();
    coordinator
        .benchmark(None, BenchmarkParams::new(10_000.0, 4, 0))
        .unwrap();

    let started = std::time::Instant::now();
    let report = coordinator.stop().unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(report.is_complete());
    assert_eq!(report.count_failed, 4);
    assert!(report.latency.is_none());
    for record in coordinator.perf_result().records() {
        assert_eq!(record.metrics[CANCELLED_KEY], json!(true));
    }
}

// ==================================================================================================
// QPS Search Tests
// ==================================================================================================

#[test]
fn test_search_finds_capacity_of_single_thread() {
    // one 10ms thread saturates near 100 qps; queueing beyond that blows the bound
    let mut coordinator = Coordinator::new(sync_config(1, 1), sleeping_sut(10.0)).unwrap();
    coordinator.start().unwrap();

    let params = SearchParams {
        latency_bound_ms: 30.0,
        percentile: 90.0,
        init_qps: 20.0,
        min_query_count: 40,
        min_duration_ms: 500,
        ..Default::default()
    };
    let outcome = {
        let mut probe = CoordinatorProbe::new(&mut coordinator, None, params.clone());
        QpsSearch::new(params).run(&mut probe).unwrap()
    };
    coordinator.stop().unwrap();

    assert!(
        outcome.target_qps > 50.0 && outcome.target_qps < 140.0,
        "found {} qps",
        outcome.target_qps
    );
    assert!(outcome.trials.len() >= 3);
    assert!(outcome.report.is_some());
}

#[test]
fn test_search_tracks_load_dependent_latency() {
    // 5ms alone plus 1ms per concurrent query: mean latency is about 5 / (1 - qps/1000) ms,
    // so a 20ms bound sits somewhere below 1000 qps
    let factory: SutFactory<u32> = synthetic::async_factory(SyntheticConfig {
        latency_ms: 5.0,
        slope_ms: 1.0,
        ..Default::default()
    });
    let mut coordinator = Coordinator::new(async_config(1, 64), factory).unwrap();
    coordinator.start().unwrap();

    let params = SearchParams {
        latency_bound_ms: 20.0,
        percentile: 90.0,
        init_qps: 100.0,
        min_query_count: 200,
        min_duration_ms: 500,
        ..Default::default()
    };
    let outcome = {
        let mut probe = CoordinatorProbe::new(&mut coordinator, None, params.clone());
        QpsSearch::new(params).run(&mut probe).unwrap()
    };
    coordinator.stop().unwrap();

    assert!(
        outcome.target_qps > 300.0 && outcome.target_qps < 950.0,
        "found {} qps",
        outcome.target_qps
    );
    // latency grows with the rate across the measured trials
    let lowest = outcome
        .trials
        .iter()
        .min_by(|a, b| a.target_qps.total_cmp(&b.target_qps))
        .and_then(|t| t.latency_ms)
        .unwrap();
    let highest = outcome
        .trials
        .iter()
        .max_by(|a, b| a.target_qps.total_cmp(&b.target_qps))
        .and_then(|t| t.latency_ms)
        .unwrap();
    assert!(highest > lowest, "latency {} at lowest rate, {} at highest", lowest, highest);
}
