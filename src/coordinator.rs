//! Benchmark coordinator.
//!
//! Owns the queues, the worker pool, the response-drain thread and the optional
//! telemetry thread, and drives load generators into the query queue.
//!
//! Lifecycle: `New -> Starting -> Ready -> (Running -> Ready)* -> Stopping -> Stopped`.

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

use crate::config::{BenchmarkParams, HarnessConfig};
use crate::error::{HarnessError, LedgerError, Result};
use crate::load_gen::{LoadGen, PayloadPool, ServerLoadGen, SingleStreamLoadGen};
use crate::perf_result::PerfResult;
use crate::report::{Mode, Report, RunContext};
use crate::sut::{Request, SutFactory};
use crate::telemetry::Telemetry;
use crate::worker::{QueryMessage, ResponseMessage, UnitChannels, WorkerHandle, WorkerKind, WorkerPool};

/// Coordinator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
}

/// Facts about the latest run needed to rebuild its report
struct RunSnapshot {
    context: RunContext,
    count_issued: u64,
    issued_qps: f64,
}

pub struct Coordinator<P: Clone + Send + 'static> {
    config: HarnessConfig,
    factory: SutFactory<P>,
    state: State,
    result: Arc<PerfResult>,
    pool: Option<WorkerPool<P>>,
    query_tx: Option<Sender<QueryMessage<P>>>,
    /// Coordinator-side handle on the query queue, used to discard a previous run's backlog
    query_rx: Option<Receiver<QueryMessage<P>>>,
    response_tx: Option<Sender<ResponseMessage>>,
    drain: Option<JoinHandle<()>>,
    telemetry: Option<Telemetry>,
    ready_units: usize,
    last_run: Option<RunSnapshot>,
}

impl<P: Clone + Send + 'static> Coordinator<P> {
    pub fn new(config: HarnessConfig, factory: SutFactory<P>) -> Result<Self> {
        config.validate()?;
        let result = Arc::new(PerfResult::with_interpolation(config.interpolation));
        Ok(Self {
            config,
            factory,
            state: State::New,
            result,
            pool: None,
            query_tx: None,
            query_rx: None,
            response_tx: None,
            drain: None,
            telemetry: None,
            ready_units: 0,
            last_run: None,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn worker_kind(&self) -> WorkerKind {
        self.factory.kind()
    }

    /// Shared result ledger of the current run
    pub fn perf_result(&self) -> Arc<PerfResult> {
        self.result.clone()
    }

    /// Execution units that passed the readiness barrier
    pub fn ready_units(&self) -> usize {
        self.ready_units
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        match &self.pool {
            Some(pool) => pool.handles(),
            None => &[],
        }
    }

    fn expect_state(&self, expected: State) -> Result<()> {
        if self.state != expected {
            return Err(HarnessError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Spawn the workers, wait for every execution unit to report ready, then start
    /// draining responses. Returns the number of ready units.
    pub fn start(&mut self) -> Result<usize> {
        self.expect_state(State::New)?;
        self.state = State::Starting;

        let kind = self.worker_kind();
        tracing::info!(
            "Starting {} {} workers with concurrency {}",
            self.config.num_workers,
            kind,
            self.config.concurrency(kind)
        );

        let (query_tx, query_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();
        let channels = UnitChannels {
            query_tx: query_tx.clone(),
            query_rx: query_rx.clone(),
            response_tx: response_tx.clone(),
        };

        let mut pool = WorkerPool::new(self.config.pool_config(kind), self.factory.clone());
        let ready = match pool.start(channels, &response_rx) {
            Ok(ready) => ready,
            Err(e) => {
                tracing::error!("Worker pool failed to start: {}", e);
                self.state = State::Stopped;
                return Err(e);
            }
        };

        let result = self.result.clone();
        let drain = thread::Builder::new()
            .name("perf-drain".to_string())
            .spawn(move || drain_responses(response_rx, result));
        let drain = match drain {
            Ok(handle) => handle,
            Err(e) => {
                pool.shutdown();
                self.state = State::Stopped;
                return Err(HarnessError::Spawn(e));
            }
        };

        if let Some(interval) = self.config.telemetry_interval() {
            match Telemetry::spawn(interval, self.result.clone()) {
                Ok(telemetry) => self.telemetry = Some(telemetry),
                Err(e) => tracing::warn!("Telemetry disabled: {}", e),
            }
        }

        self.pool = Some(pool);
        self.query_tx = Some(query_tx);
        self.query_rx = Some(query_rx);
        self.response_tx = Some(response_tx);
        self.drain = Some(drain);
        self.ready_units = ready;
        self.state = State::Ready;
        tracing::info!("Coordinator ready with {} execution units", ready);
        Ok(ready)
    }

    /// Run an open-loop benchmark at `params.target_qps`.
    ///
    /// Payloads are sampled at random from `payloads` when given; otherwise workers
    /// receive bare ids. Returns once issuance ends, so the report may still be
    /// missing outcomes of queries in flight; see [`Coordinator::wait_for_completion`].
    pub fn benchmark(&mut self, payloads: Option<&[P]>, params: BenchmarkParams) -> Result<Report> {
        self.expect_state(State::Ready)?;
        params.validate()?;

        let run = self.begin_run();
        let mut gen = ServerLoadGen::new(
            self.result.clone(),
            params.target_qps,
            params.min_query_count,
            params.min_duration_ms,
        )
        .with_arrival(self.config.arrival, self.config.seed);
        if let Some(pool) = self.payload_pool(payloads) {
            gen = gen.with_payloads(pool);
        }
        tracing::info!(
            "Server run {}: {} qps, at least {} queries over {}ms",
            run,
            params.target_qps,
            params.min_query_count,
            params.min_duration_ms
        );

        let context = self.context(Mode::Server, Some(params.target_qps));
        self.drive(run, &mut gen, context)
    }

    /// Run a closed-loop benchmark: one query in flight at a time
    pub fn benchmark_single_stream(
        &mut self,
        payloads: Option<&[P]>,
        min_query_count: u64,
        min_duration_ms: u64,
    ) -> Result<Report> {
        self.expect_state(State::Ready)?;

        let run = self.begin_run();
        let mut gen = SingleStreamLoadGen::new(self.result.clone(), min_query_count, min_duration_ms);
        if let Some(pool) = self.payload_pool(payloads) {
            gen = gen.with_payloads(pool);
        }
        tracing::info!(
            "Single-stream run {}: at least {} queries over {}ms",
            run,
            min_query_count,
            min_duration_ms
        );

        let context = self.context(Mode::SingleStream, None);
        self.drive(run, &mut gen, context)
    }

    fn begin_run(&mut self) -> u64 {
        self.state = State::Running;
        self.discard_backlog();
        if let Some(telemetry) = &self.telemetry {
            telemetry.reset();
        }
        self.result.reset()
    }

    /// Drop queries of the previous run that no worker has picked up yet
    fn discard_backlog(&self) {
        let (Some(query_rx), Some(query_tx)) = (&self.query_rx, &self.query_tx) else {
            return;
        };
        let mut discarded = 0usize;
        for message in query_rx.try_iter() {
            match message {
                QueryMessage::Query { .. } => discarded += 1,
                QueryMessage::Shutdown => {
                    let _ = query_tx.send(QueryMessage::Shutdown);
                    break;
                }
            }
        }
        if discarded > 0 {
            tracing::info!("Discarded {} queued queries of the previous run", discarded);
        }
    }

    fn payload_pool(&self, payloads: Option<&[P]>) -> Option<PayloadPool<P>> {
        match payloads {
            Some(items) if !items.is_empty() => {
                Some(PayloadPool::new(Arc::from(items), self.config.seed))
            }
            _ => None,
        }
    }

    fn context(&self, mode: Mode, target_qps: Option<f64>) -> RunContext {
        let kind = self.worker_kind();
        RunContext {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            mode,
            worker_kind: kind,
            num_workers: self.config.num_workers,
            concurrency: self.config.concurrency(kind),
            target_qps,
        }
    }

    /// Feed every query of `gen` into the query queue
    fn drive<G: LoadGen<Payload = P>>(
        &mut self,
        run: u64,
        gen: &mut G,
        context: RunContext,
    ) -> Result<Report> {
        let issued = match &self.query_tx {
            Some(query_tx) => enqueue_all(run, gen, query_tx),
            None => Err(HarnessError::ChannelClosed("query queue")),
        };
        let snapshot = RunSnapshot {
            context,
            count_issued: gen.count_issued(),
            issued_qps: gen.get_issued_qps(),
        };
        let report = self.build_report(&snapshot);
        self.last_run = Some(snapshot);
        self.state = State::Ready;
        issued?;

        tracing::info!(
            "Issued {} queries at {:.2} qps",
            report.count_issued,
            report.issued_qps
        );
        Ok(report)
    }

    fn build_report(&self, snapshot: &RunSnapshot) -> Report {
        let resources = self.telemetry.as_ref().and_then(Telemetry::usage);
        Report::build(
            &snapshot.context,
            &self.result,
            snapshot.count_issued,
            snapshot.issued_qps,
            resources,
        )
    }

    /// Report of the latest run as of now; partial while responses are still draining
    pub fn report(&self) -> Option<Report> {
        self.last_run
            .as_ref()
            .map(|snapshot| self.build_report(snapshot))
    }

    /// Block until every issued query of the latest run has an outcome
    pub fn wait_for_completion(&self, timeout: Duration) -> Result<Report> {
        if !self.result.wait_until_drained(timeout) {
            return Err(HarnessError::DrainTimeout {
                issued: self.result.count_issued(),
                completed: self.result.count_completed(),
            });
        }
        self.report().ok_or(HarnessError::InvalidState {
            expected: State::Ready,
            actual: self.state,
        })
    }

    /// Give the latest run up to `timeout` to report every outcome, then [`stop`].
    ///
    /// Queries still in flight after the timeout are handled as by `stop`.
    ///
    /// [`stop`]: Coordinator::stop
    pub fn stop_after_drain(&mut self, timeout: Duration) -> Result<Option<Report>> {
        if self.state == State::Ready && self.last_run.is_some() {
            if let Err(e) = self.wait_for_completion(timeout) {
                tracing::warn!("{}; stopping with queries still in flight", e);
            }
        }
        self.stop()
    }

    /// Shut the workers down, drain what they produced and stop background threads.
    ///
    /// Queries still queued are served first; in-flight async queries are cancelled
    /// and recorded as failed. Returns the final report of the latest run, if any.
    pub fn stop(&mut self) -> Result<Option<Report>> {
        match self.state {
            State::Stopped => return Ok(self.report()),
            State::Ready => {}
            actual => {
                return Err(HarnessError::InvalidState {
                    expected: State::Ready,
                    actual,
                })
            }
        }
        self.state = State::Stopping;
        tracing::info!("Stopping coordinator");

        if let Some(pool) = self.pool.as_mut() {
            pool.shutdown();
        }
        self.query_tx.take();
        self.query_rx.take();
        if let Some(response_tx) = self.response_tx.take() {
            let _ = response_tx.send(ResponseMessage::Shutdown);
        }
        if let Some(drain) = self.drain.take() {
            if drain.join().is_err() {
                tracing::error!("Drain thread panicked");
            }
        }
        self.result.close();
        if let Some(telemetry) = self.telemetry.as_mut() {
            telemetry.stop();
        }

        self.state = State::Stopped;
        let report = self.report();
        if let Some(report) = &report {
            tracing::info!("{}", report.summary_line());
        }
        Ok(report)
    }
}

impl<P: Clone + Send + 'static> Drop for Coordinator<P> {
    fn drop(&mut self) {
        if self.state == State::Ready {
            if let Err(e) = self.stop() {
                tracing::warn!("Failed to stop coordinator: {}", e);
            }
        }
    }
}

fn enqueue_all<P, G: LoadGen<Payload = P>>(
    run: u64,
    gen: &mut G,
    query_tx: &Sender<QueryMessage<P>>,
) -> Result<()> {
    for query in gen.queries() {
        let request = Request {
            id: query.id,
            payload: query.payload,
        };
        query_tx
            .send(QueryMessage::Query { run, request })
            .map_err(|_| HarnessError::ChannelClosed("query queue"))?;
    }
    Ok(())
}

/// Drain thread body: move completions into the ledger until the shutdown message
fn drain_responses(response_rx: Receiver<ResponseMessage>, result: Arc<PerfResult>) {
    for message in response_rx.iter() {
        match message {
            ResponseMessage::Completed(c) => {
                match result.complete_for_run(c.run, c.id, c.success, c.completed_at, c.metrics) {
                    Ok(()) => {}
                    Err(e @ LedgerError::StaleRun { .. }) => {
                        tracing::debug!("Dropping response for query {}: {}", c.id, e)
                    }
                    Err(e) => tracing::warn!("Dropping response: {}", e),
                }
            }
            ResponseMessage::Shutdown => break,
            ResponseMessage::StartupFailed { worker, message } => {
                tracing::error!("Worker {} failed after startup: {}", worker, message)
            }
            ResponseMessage::Ready { worker, unit } => {
                tracing::debug!("Late readiness from unit {}-{}", worker, unit)
            }
        }
    }
    tracing::debug!("Drain thread stopped");
}
