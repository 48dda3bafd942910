//! Synchronous worker: one SUT shared by a fixed pool of executor threads.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use super::{Completion, QueryMessage, ResponseMessage, UnitChannels};
use crate::sut::{call_sync, panic_message, InferOutput, Request, SyncSut};

type SyncFactory<P> = Arc<dyn Fn(usize) -> anyhow::Result<SyncSut<P>> + Send + Sync>;

/// Body of a sync worker thread: build and set up the SUT, serve with
/// `num_threads` executor threads until shutdown, then tear down.
pub(crate) fn run<P: Send + 'static>(
    worker: usize,
    num_threads: usize,
    factory: SyncFactory<P>,
    channels: UnitChannels<P>,
) {
    let mut sut = match build(worker, &factory) {
        Ok(sut) => sut,
        Err(message) => {
            tracing::error!("Worker {} failed to start: {}", worker, message);
            channels.respond(ResponseMessage::StartupFailed { worker, message });
            return;
        }
    };
    tracing::info!(
        "SUT hosted in process {} worker {} with {} threads",
        std::process::id(),
        worker,
        num_threads
    );

    let infer = sut.infer_handle();
    let mut executors = Vec::with_capacity(num_threads);
    for unit in 0..num_threads {
        let infer = infer.clone();
        let unit_channels = channels.clone();
        let spawned = thread::Builder::new()
            .name(format!("perf-worker-{}-{}", worker, unit))
            .spawn(move || serve(worker, unit, infer.as_ref(), &unit_channels));
        match spawned {
            Ok(handle) => executors.push(handle),
            Err(e) => {
                channels.respond(ResponseMessage::StartupFailed {
                    worker,
                    message: format!("failed to spawn executor thread {}: {}", unit, e),
                });
                break;
            }
        }
    }

    for handle in executors {
        if handle.join().is_err() {
            tracing::error!("Executor thread of worker {} panicked", worker);
        }
    }
    tracing::info!("Worker {} terminated", worker);

    if let Err(e) = sut.teardown() {
        tracing::warn!("Teardown of worker {} failed: {:#}", worker, e);
    }
}

fn build<P>(worker: usize, factory: &SyncFactory<P>) -> Result<SyncSut<P>, String> {
    let built = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let mut sut = factory(worker)?;
        sut.setup()?;
        Ok::<_, anyhow::Error>(sut)
    }));
    match built {
        Ok(Ok(sut)) => Ok(sut),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

/// Executor loop: one readiness signal, then pop, infer, respond until the sentinel
fn serve<P>(
    worker: usize,
    unit: usize,
    infer: &(dyn Fn(Request<P>) -> InferOutput + Send + Sync),
    channels: &UnitChannels<P>,
) {
    channels.respond(ResponseMessage::Ready { worker, unit });

    loop {
        match channels.query_rx.recv() {
            Ok(QueryMessage::Query { run, request }) => {
                let id = request.id;
                let output = call_sync(infer, request);
                let completed_at = Instant::now();
                channels.respond(ResponseMessage::Completed(Completion::from_output(
                    run,
                    id,
                    output,
                    completed_at,
                )));
            }
            Ok(QueryMessage::Shutdown) => {
                channels.forward_shutdown();
                break;
            }
            Err(_) => break,
        }
    }
    tracing::debug!("Executor {}-{} stopped", worker, unit);
}
