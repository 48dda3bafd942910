//! Asynchronous worker: one thread, one current-thread runtime, a bounded set of
//! in-flight `infer` futures.

use crossbeam_channel::{RecvTimeoutError, TryRecvError};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet, LocalSet};

use super::{Completion, QueryMessage, ResponseMessage, UnitChannels};
use crate::query::Metrics;
use crate::sut::{call_async, panic_message, AsyncSut, InferOutput, Request};

type AsyncFactory<P> = Arc<dyn Fn(usize) -> anyhow::Result<AsyncSut<P>> + Send + Sync>;
type AsyncInfer<P> = Rc<dyn Fn(Request<P>) -> futures::future::LocalBoxFuture<'static, InferOutput>>;

/// Wait for a completion while there is still room to admit new queries
const ADMISSION_TICK: Duration = Duration::from_millis(1);

/// Metric set on completions of tasks cancelled by shutdown
pub const CANCELLED_KEY: &str = "cancelled";

/// Timeouts of the admission loop
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopTiming {
    /// Longest wait for a completion when at capacity
    pub poll: Duration,
    /// Longest blocking wait on the query queue when nothing is in flight
    pub idle: Duration,
}

/// Body of an async worker thread
pub(crate) fn run<P: Send + 'static>(
    worker: usize,
    num_tasks: usize,
    timing: LoopTiming,
    factory: AsyncFactory<P>,
    channels: UnitChannels<P>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            channels.respond(ResponseMessage::StartupFailed {
                worker,
                message: format!("failed to build runtime: {}", e),
            });
            return;
        }
    };
    let local = LocalSet::new();
    local.block_on(&runtime, serve(worker, num_tasks, timing, factory, channels));
}

async fn build<P: 'static>(worker: usize, factory: &AsyncFactory<P>) -> Result<AsyncSut<P>, String> {
    let mut sut = match std::panic::catch_unwind(AssertUnwindSafe(|| factory(worker))) {
        Ok(Ok(sut)) => sut,
        Ok(Err(e)) => return Err(format!("{:#}", e)),
        Err(panic) => return Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    };
    let setup = AssertUnwindSafe(sut.setup()).catch_unwind().await;
    match setup {
        Ok(Ok(())) => Ok(sut),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(format!("setup panicked: {}", panic_message(panic.as_ref()))),
    }
}

async fn serve<P: 'static>(
    worker: usize,
    num_tasks: usize,
    timing: LoopTiming,
    factory: AsyncFactory<P>,
    channels: UnitChannels<P>,
) {
    let mut sut = match build(worker, &factory).await {
        Ok(sut) => sut,
        Err(message) => {
            tracing::error!("Worker {} failed to start: {}", worker, message);
            channels.respond(ResponseMessage::StartupFailed { worker, message });
            return;
        }
    };
    tracing::info!(
        "SUT hosted in process {} worker {} with {} tasks",
        std::process::id(),
        worker,
        num_tasks
    );
    channels.respond(ResponseMessage::Ready { worker, unit: 0 });

    let mut admission = Admission {
        infer: sut.infer_handle(),
        tasks: JoinSet::new(),
        cancel: watch::channel(false),
        shutdown: false,
    };

    loop {
        while !admission.shutdown && admission.tasks.len() < num_tasks {
            match channels.query_rx.try_recv() {
                Ok(message) => admission.admit(message, &channels),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => admission.shutdown = true,
            }
        }
        if admission.shutdown {
            break;
        }

        if admission.tasks.is_empty() {
            match channels.query_rx.recv_timeout(timing.idle) {
                Ok(message) => admission.admit(message, &channels),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            continue;
        }

        let wait = if admission.tasks.len() < num_tasks {
            ADMISSION_TICK.min(timing.poll)
        } else {
            timing.poll
        };
        if let Ok(Some(joined)) = tokio::time::timeout(wait, admission.tasks.join_next()).await {
            deliver(joined, &channels);
        }
        while let Some(Some(joined)) = admission.tasks.join_next().now_or_never() {
            deliver(joined, &channels);
        }
    }

    let in_flight = admission.tasks.len();
    if in_flight > 0 {
        tracing::info!("Worker {} cancelling {} in-flight queries", worker, in_flight);
    }
    let _ = admission.cancel.0.send(true);
    while let Some(joined) = admission.tasks.join_next().await {
        deliver(joined, &channels);
    }
    tracing::info!("Worker {} terminated", worker);

    let teardown = AssertUnwindSafe(sut.teardown()).catch_unwind().await;
    match teardown {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Teardown of worker {} failed: {:#}", worker, e),
        Err(panic) => tracing::warn!(
            "Teardown of worker {} panicked: {}",
            worker,
            panic_message(panic.as_ref())
        ),
    }
}

struct Admission<P> {
    infer: AsyncInfer<P>,
    tasks: JoinSet<Completion>,
    cancel: (watch::Sender<bool>, watch::Receiver<bool>),
    shutdown: bool,
}

impl<P: 'static> Admission<P> {
    fn admit(&mut self, message: QueryMessage<P>, channels: &UnitChannels<P>) {
        match message {
            QueryMessage::Query { run, request } => {
                let id = request.id;
                let fut = call_async((self.infer)(request), id);
                let mut cancel = self.cancel.1.clone();
                self.tasks.spawn_local(async move {
                    tokio::select! {
                        output = fut => Completion::from_output(run, id, output, Instant::now()),
                        _ = cancel.changed() => {
                            let mut metrics = Metrics::new();
                            metrics.insert(CANCELLED_KEY.to_string(), serde_json::Value::Bool(true));
                            Completion {
                                run,
                                id,
                                success: false,
                                completed_at: Instant::now(),
                                metrics,
                            }
                        }
                    }
                });
            }
            QueryMessage::Shutdown => {
                channels.forward_shutdown();
                self.shutdown = true;
            }
        }
    }
}

fn deliver<P>(joined: Result<Completion, JoinError>, channels: &UnitChannels<P>) {
    match joined {
        Ok(completion) => channels.respond(ResponseMessage::Completed(completion)),
        Err(e) => tracing::error!("Inference task aborted: {}", e),
    }
}
