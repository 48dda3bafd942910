// perf-harness - Library root

pub mod config;
pub mod coordinator;
pub mod error;
pub mod load_gen;
pub mod perf_result;
pub mod query;
pub mod report;
pub mod search;
pub mod sut;
pub mod synthetic;
pub mod telemetry;
pub mod worker;

pub use config::{BenchmarkParams, HarnessConfig, SearchParams};
pub use coordinator::{Coordinator, State};
pub use error::{HarnessError, LedgerError, SearchError};
pub use perf_result::PerfResult;
pub use query::{Metrics, Query, QueryId, QueryRecord};
pub use report::{Report, LatencySummary};
pub use search::{CoordinatorProbe, QpsSearch, SearchOutcome};
pub use sut::{AsyncSut, Request, SutFactory, SyncSut};
pub use worker::WorkerKind;
