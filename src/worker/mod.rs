//! Worker execution units and the pool that hosts them.
//!
//! Workers pull from a shared FIFO query queue and push to a shared FIFO response
//! queue. Both are unbounded `crossbeam-channel` channels, so a slow reader never
//! blocks a writer. A [`QueryMessage::Shutdown`] sentinel ends every unit: each unit
//! that receives it puts it back before exiting so its siblings see it too.

pub mod async_worker;
pub mod pool;
pub mod sync_worker;

pub use pool::{PoolConfig, WorkerHandle, WorkerPool};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::query::{Metrics, QueryId};
use crate::sut::{InferOutput, Request};

/// How a worker runs its SUT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// `num_threads` OS threads per worker, blocking `infer`
    #[default]
    Sync,
    /// One thread per worker, up to `num_tasks` cooperative `infer` futures
    Async,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Sync => write!(f, "sync"),
            WorkerKind::Async => write!(f, "async"),
        }
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(WorkerKind::Sync),
            "async" => Ok(WorkerKind::Async),
            _ => Err(format!("Unknown worker kind: {}", s)),
        }
    }
}

/// Query queue message
#[derive(Debug)]
pub enum QueryMessage<P> {
    Query { run: u64, request: Request<P> },
    Shutdown,
}

/// Response queue message
#[derive(Debug)]
pub enum ResponseMessage {
    /// One execution unit is ready to serve
    Ready { worker: usize, unit: usize },
    /// A worker could not construct or set up its SUT
    StartupFailed { worker: usize, message: String },
    Completed(Completion),
    /// Ends the drain thread
    Shutdown,
}

/// Outcome of one query as produced by an execution unit
#[derive(Debug)]
pub struct Completion {
    pub run: u64,
    pub id: QueryId,
    pub success: bool,
    /// Stamped when `infer` returned
    pub completed_at: Instant,
    pub metrics: Metrics,
}

impl Completion {
    pub(crate) fn from_output(run: u64, id: QueryId, output: InferOutput, completed_at: Instant) -> Self {
        match output {
            Ok(metrics) => Self {
                run,
                id,
                success: true,
                completed_at,
                metrics,
            },
            Err(e) => {
                tracing::warn!("Error while processing query {}: {:#}", id, e);
                Self {
                    run,
                    id,
                    success: false,
                    completed_at,
                    metrics: Metrics::new(),
                }
            }
        }
    }
}

/// Channel endpoints an execution unit needs
pub(crate) struct UnitChannels<P> {
    pub query_tx: Sender<QueryMessage<P>>,
    pub query_rx: Receiver<QueryMessage<P>>,
    pub response_tx: Sender<ResponseMessage>,
}

impl<P> Clone for UnitChannels<P> {
    fn clone(&self) -> Self {
        Self {
            query_tx: self.query_tx.clone(),
            query_rx: self.query_rx.clone(),
            response_tx: self.response_tx.clone(),
        }
    }
}

impl<P> UnitChannels<P> {
    /// Put the sentinel back for the next unit
    pub(crate) fn forward_shutdown(&self) {
        let _ = self.query_tx.send(QueryMessage::Shutdown);
    }

    pub(crate) fn respond(&self, message: ResponseMessage) {
        if self.response_tx.send(message).is_err() {
            tracing::debug!("Response queue closed; dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_kind_from_str() {
        assert_eq!("sync".parse::<WorkerKind>(), Ok(WorkerKind::Sync));
        assert_eq!("ASYNC".parse::<WorkerKind>(), Ok(WorkerKind::Async));
        assert!("threads".parse::<WorkerKind>().is_err());
        assert_eq!(WorkerKind::Async.to_string(), "async");
    }

    #[test]
    fn test_completion_from_error() {
        let at = Instant::now();
        let c = Completion::from_output(3, 9, Err(anyhow::anyhow!("boom")), at);
        assert!(!c.success);
        assert_eq!(c.run, 3);
        assert_eq!(c.id, 9);

        let c = Completion::from_output(3, 10, Ok(Metrics::new()), at);
        assert!(c.success);
    }

    #[test]
    fn test_forward_shutdown_requeues_sentinel() {
        let (query_tx, query_rx) = crossbeam_channel::unbounded::<QueryMessage<()>>();
        let (response_tx, _response_rx) = crossbeam_channel::unbounded();
        let channels = UnitChannels {
            query_tx,
            query_rx: query_rx.clone(),
            response_tx,
        };

        channels.forward_shutdown();
        assert!(matches!(query_rx.try_recv(), Ok(QueryMessage::Shutdown)));
        assert!(query_rx.try_recv().is_err());
    }
}
