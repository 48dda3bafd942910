//! Synthetic SUT: sleeps for a configurable service time and fails at a
//! configurable rate. Used by the CLI and for harness self-tests.
//!
//! The service time is `latency_ms + slope_ms * k` (plus jitter), where `k` is the
//! number of other queries the same SUT instance is serving at that moment. A zero
//! slope gives a fixed service time; a positive slope makes latency grow with load.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::query::Metrics;
use crate::sut::{AsyncSut, Request, SutFactory, SyncSut};

/// Metric reporting the service time the synthetic SUT chose
pub const SERVICE_TIME_KEY: &str = "service_ms";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Mean service time with nothing else in flight
    pub latency_ms: f64,
    /// Extra service time per other query in flight on the same SUT
    #[serde(default)]
    pub slope_ms: f64,
    /// Uniform jitter added to the service time, in `[-jitter_ms, jitter_ms]`
    pub jitter_ms: f64,
    /// Probability that a query fails, in `[0, 1]`
    pub error_rate: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            latency_ms: 10.0,
            slope_ms: 0.0,
            jitter_ms: 0.0,
            error_rate: 0.0,
        }
    }
}

impl SyntheticConfig {
    /// Draw one service time and outcome with `others` queries in flight
    fn draw(&self, others: usize) -> (Duration, bool) {
        let mut rng = rand::thread_rng();
        let jitter = if self.jitter_ms > 0.0 {
            rng.gen_range(-self.jitter_ms..=self.jitter_ms)
        } else {
            0.0
        };
        let service_ms = (self.latency_ms + self.slope_ms * others as f64 + jitter).max(0.0);
        let failed = self.error_rate > 0.0 && rng.gen_bool(self.error_rate.clamp(0.0, 1.0));
        (Duration::from_secs_f64(service_ms / 1000.0), failed)
    }
}

/// Count of queries a SUT instance is serving
#[derive(Clone, Default)]
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    /// Register one more query; returns the guard and how many others were in flight
    fn enter(&self) -> (InFlightGuard, usize) {
        let others = self.0.fetch_add(1, Ordering::SeqCst);
        (InFlightGuard(self.0.clone()), others)
    }
}

/// Leaves the in-flight count on drop, including when a task is cancelled
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn outcome<P>(request: &Request<P>, service: Duration, failed: bool) -> anyhow::Result<Metrics> {
    if failed {
        anyhow::bail!("synthetic failure on query {}", request.id);
    }
    let mut metrics = Metrics::new();
    metrics.insert(
        SERVICE_TIME_KEY.to_string(),
        json!(service.as_secs_f64() * 1000.0),
    );
    Ok(metrics)
}

/// Blocking synthetic SUT for sync workers
pub fn sync_factory<P: 'static>(config: SyntheticConfig) -> SutFactory<P> {
    SutFactory::sync(move |worker| {
        tracing::debug!("Synthetic SUT for worker {}: {:?}", worker, config);
        let in_flight = InFlight::default();
        Ok(SyncSut::new(move |request: Request<P>| {
            let (_guard, others) = in_flight.enter();
            let (service, failed) = config.draw(others);
            std::thread::sleep(service);
            outcome(&request, service, failed)
        }))
    })
}

/// Cooperative synthetic SUT for async workers
pub fn async_factory<P: 'static>(config: SyntheticConfig) -> SutFactory<P> {
    SutFactory::asynchronous(move |worker| {
        tracing::debug!("Synthetic SUT for worker {}: {:?}", worker, config);
        let in_flight = InFlight::default();
        Ok(AsyncSut::new(move |request: Request<P>| {
            let (guard, others) = in_flight.enter();
            async move {
                let _guard = guard;
                let (service, failed) = config.draw(others);
                tokio::time::sleep(service).await;
                outcome(&request, service, failed)
            }
        }))
    })
}
