//! Worker pool: spawns workers, runs the readiness barrier, shuts them down.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::async_worker::{self, LoopTiming};
use super::{sync_worker, QueryMessage, ResponseMessage, UnitChannels, WorkerKind};
use crate::error::{HarnessError, Result};
use crate::sut::SutFactory;

/// Pool sizing and timing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub num_workers: usize,
    /// Threads per sync worker or in-flight tasks per async worker
    pub concurrency: usize,
    /// Longest wait for the readiness barrier
    pub startup_timeout: Duration,
    /// Async completion poll when at capacity
    pub poll_interval: Duration,
    /// Async blocking wait on an empty queue
    pub idle_interval: Duration,
}

/// One spawned worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub worker: usize,
    /// Process hosting the worker thread
    pub process_id: u32,
    pub concurrency_degree: usize,
    /// Every execution unit of this worker has signalled readiness
    pub ready: bool,
    ready_units: usize,
}

impl WorkerHandle {
    fn new(worker: usize, concurrency_degree: usize) -> Self {
        Self {
            worker,
            process_id: std::process::id(),
            concurrency_degree,
            ready: false,
            ready_units: 0,
        }
    }
}

/// Spawns `num_workers` worker threads, each owning its own SUT instance
pub struct WorkerPool<P> {
    config: PoolConfig,
    factory: SutFactory<P>,
    channels: Option<UnitChannels<P>>,
    threads: Vec<JoinHandle<()>>,
    handles: Vec<WorkerHandle>,
}

impl<P: Send + 'static> WorkerPool<P> {
    pub fn new(config: PoolConfig, factory: SutFactory<P>) -> Self {
        Self {
            config,
            factory,
            channels: None,
            threads: Vec::new(),
            handles: Vec::new(),
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.factory.kind()
    }

    /// Readiness signals the barrier waits for: one per thread for sync workers,
    /// one per worker for async workers
    pub fn expected_ready(&self) -> usize {
        match self.kind() {
            WorkerKind::Sync => self.config.num_workers * self.config.concurrency,
            WorkerKind::Async => self.config.num_workers,
        }
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    /// Spawn every worker on `channels` and block until all execution units are ready.
    ///
    /// A worker that fails to build or set up its SUT aborts the start; so does a
    /// barrier that does not complete within `startup_timeout`.
    pub(crate) fn start(
        &mut self,
        channels: UnitChannels<P>,
        response_rx: &Receiver<ResponseMessage>,
    ) -> Result<usize> {
        let timing = LoopTiming {
            poll: self.config.poll_interval,
            idle: self.config.idle_interval,
        };
        self.channels = Some(channels.clone());

        for worker in 0..self.config.num_workers {
            let unit_channels = channels.clone();
            let concurrency = self.config.concurrency;
            let builder = thread::Builder::new().name(format!("perf-worker-{}", worker));
            let spawned = match &self.factory {
                SutFactory::Sync(factory) => {
                    let factory = factory.clone();
                    builder.spawn(move || {
                        sync_worker::run(worker, concurrency, factory, unit_channels)
                    })
                }
                SutFactory::Async(factory) => {
                    let factory = factory.clone();
                    builder.spawn(move || {
                        async_worker::run(worker, concurrency, timing, factory, unit_channels)
                    })
                }
            };
            match spawned {
                Ok(handle) => {
                    self.threads.push(handle);
                    self.handles.push(WorkerHandle::new(worker, concurrency));
                }
                Err(e) => {
                    self.shutdown();
                    return Err(HarnessError::Spawn(e));
                }
            }
        }

        self.await_ready(response_rx)
    }

    fn await_ready(&mut self, response_rx: &Receiver<ResponseMessage>) -> Result<usize> {
        let expected = self.expected_ready();
        let per_worker = match self.kind() {
            WorkerKind::Sync => self.config.concurrency,
            WorkerKind::Async => 1,
        };
        let deadline = Instant::now() + self.config.startup_timeout;
        let mut ready = 0;

        while ready < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match response_rx.recv_timeout(remaining) {
                Ok(ResponseMessage::Ready { worker, unit }) => {
                    ready += 1;
                    if let Some(handle) = self.handles.get_mut(worker) {
                        handle.ready_units += 1;
                        handle.ready = handle.ready_units >= per_worker;
                    }
                    tracing::debug!("Unit {}-{} ready", worker, unit);
                    tracing::info!("{} out of {} execution units ready", ready, expected);
                }
                Ok(ResponseMessage::StartupFailed { worker, message }) => {
                    self.shutdown();
                    return Err(HarnessError::WorkerStartup { worker, message });
                }
                Ok(other) => {
                    tracing::debug!("Ignoring {:?} during startup", other);
                }
                Err(RecvTimeoutError::Timeout) => {
                    // workers stuck in setup may never see the sentinel, so no join
                    self.signal_shutdown();
                    self.threads.clear();
                    return Err(HarnessError::StartupTimeout {
                        timeout_ms: self.config.startup_timeout.as_millis() as u64,
                        ready,
                        expected,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.shutdown();
                    return Err(HarnessError::ChannelClosed("response queue"));
                }
            }
        }
        Ok(ready)
    }

    fn signal_shutdown(&self) {
        if let Some(channels) = &self.channels {
            let _ = channels.query_tx.send(QueryMessage::Shutdown);
        }
    }

    /// Send the shutdown sentinel and join every worker thread.
    ///
    /// Queries already queued ahead of the sentinel are still served.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.signal_shutdown();
        for (worker, handle) in self.threads.drain(..).enumerate() {
            if handle.join().is_err() {
                tracing::error!("Worker {} panicked", worker);
            }
        }
        for handle in &mut self.handles {
            handle.ready = false;
        }
        tracing::info!("All {} workers stopped", self.handles.len());
    }
}

impl<P> Drop for WorkerPool<P> {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            if let Some(channels) = &self.channels {
                let _ = channels.query_tx.send(QueryMessage::Shutdown);
            }
            for handle in self.threads.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Metrics;
    use crate::sut::{AsyncSut, Request, SyncSut};
    use crossbeam_channel::unbounded;

    fn config(num_workers: usize, concurrency: usize) -> PoolConfig {
        PoolConfig {
            num_workers,
            concurrency,
            startup_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            idle_interval: Duration::from_millis(10),
        }
    }

    fn channels() -> (UnitChannels<()>, Receiver<ResponseMessage>) {
        let (query_tx, query_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();
        (
            UnitChannels {
                query_tx,
                query_rx,
                response_tx,
            },
            response_rx,
        )
    }

    fn echo_sync() -> SutFactory<()> {
        SutFactory::sync(|_| Ok(SyncSut::new(|_: Request<()>| Ok(Metrics::new()))))
    }

    #[test]
    fn test_sync_barrier_counts_threads() {
        let (channels, responses) = channels();
        let mut pool = WorkerPool::new(config(4, 2), echo_sync());
        assert_eq!(pool.expected_ready(), 8);

        let ready = pool.start(channels, &responses).unwrap();
        assert_eq!(ready, 8);
        assert_eq!(pool.handles().len(), 4);
        assert!(pool.handles().iter().all(|h| h.ready));
        assert!(pool
            .handles()
            .iter()
            .all(|h| h.process_id == std::process::id() && h.concurrency_degree == 2));
        // no stray readiness signals
        assert!(responses.try_recv().is_err());

        pool.shutdown();
        assert!(pool.handles().iter().all(|h| !h.ready));
    }

    #[test]
    fn test_async_barrier_counts_workers() {
        let (channels, responses) = channels();
        let factory: SutFactory<()> = SutFactory::asynchronous(|_| {
            Ok(AsyncSut::new(|_: Request<()>| async { Ok(Metrics::new()) }))
        });
        let mut pool = WorkerPool::new(config(3, 16), factory);
        assert_eq!(pool.expected_ready(), 3);
        assert_eq!(pool.start(channels, &responses).unwrap(), 3);
        pool.shutdown();
    }

    #[test]
    fn test_startup_failure_surfaces() {
        let (channels, responses) = channels();
        let factory: SutFactory<()> = SutFactory::sync(|worker| {
            if worker == 1 {
                anyhow::bail!("worker {} has no model", worker);
            }
            Ok(SyncSut::new(|_: Request<()>| Ok(Metrics::new())))
        });
        let mut pool = WorkerPool::new(config(2, 1), factory);

        match pool.start(channels, &responses) {
            Err(HarnessError::WorkerStartup { worker, message }) => {
                assert_eq!(worker, 1);
                assert!(message.contains("no model"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_startup_timeout() {
        let (channels, responses) = channels();
        let factory: SutFactory<()> = SutFactory::sync(|_| {
            Ok(SyncSut::new(|_: Request<()>| Ok(Metrics::new())).with_setup(|| {
                thread::sleep(Duration::from_millis(500));
                Ok(())
            }))
        });
        let mut cfg = config(1, 1);
        cfg.startup_timeout = Duration::from_millis(50);
        let mut pool = WorkerPool::new(cfg, factory);

        let started = Instant::now();
        match pool.start(channels, &responses) {
            Err(HarnessError::StartupTimeout { ready, expected, .. }) => {
                assert_eq!(ready, 0);
                assert_eq!(expected, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
