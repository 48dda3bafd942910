//! QPS search: bracket then bisect toward the highest target rate whose
//! percentile latency sits at a bound.

use serde::Serialize;
use std::time::Duration;

use crate::config::SearchParams;
use crate::coordinator::Coordinator;
use crate::error::{HarnessError, SearchError};
use crate::report::Report;

/// Bisection stops once the bracket is this narrow relative to its low end
const MIN_BRACKET_WIDTH: f64 = 0.01;

/// One measured run
#[derive(Debug, Clone, Serialize)]
pub struct Trial {
    pub target_qps: f64,
    /// Percentile latency of the run, `None` when no query succeeded
    pub latency_ms: Option<f64>,
    #[serde(skip)]
    pub report: Option<Report>,
}

/// Anything that can run a benchmark at a target rate and report a percentile latency
pub trait QpsProbe {
    fn measure(&mut self, target_qps: f64, percentile: f64) -> Result<Trial, HarnessError>;
}

/// Runs each trial as a full benchmark on a started coordinator
pub struct CoordinatorProbe<'a, P: Clone + Send + 'static> {
    coordinator: &'a mut Coordinator<P>,
    payloads: Option<&'a [P]>,
    params: SearchParams,
    drain_timeout: Duration,
}

impl<'a, P: Clone + Send + 'static> CoordinatorProbe<'a, P> {
    pub fn new(
        coordinator: &'a mut Coordinator<P>,
        payloads: Option<&'a [P]>,
        params: SearchParams,
    ) -> Self {
        Self {
            coordinator,
            payloads,
            params,
            drain_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

impl<P: Clone + Send + 'static> QpsProbe for CoordinatorProbe<'_, P> {
    fn measure(&mut self, target_qps: f64, percentile: f64) -> Result<Trial, HarnessError> {
        self.coordinator
            .benchmark(self.payloads, self.params.trial(target_qps))?;
        let report = self.coordinator.wait_for_completion(self.drain_timeout)?;
        let latency_ms = self
            .coordinator
            .perf_result()
            .get_latencies(&[percentile / 100.0], false, false, false)
            .first()
            .copied();
        Ok(Trial {
            target_qps,
            latency_ms,
            report: Some(report),
        })
    }
}

/// How the search stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Convergence {
    /// The last trial landed within `eps` of the bound
    WithinTolerance,
    /// The bisection bracket became too narrow to split further
    BracketWidth,
}

/// A found rate and the trials that led to it
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub target_qps: f64,
    pub latency_ms: f64,
    pub converged_by: Convergence,
    pub trials: Vec<Trial>,
    /// Report of the trial the result was taken from
    #[serde(skip)]
    pub report: Option<Report>,
}

/// Bracket-and-bisect search over target QPS
pub struct QpsSearch {
    params: SearchParams,
    trials: Vec<Trial>,
}

impl QpsSearch {
    pub fn new(params: SearchParams) -> Self {
        Self {
            params,
            trials: Vec::new(),
        }
    }

    /// Every trial run so far, in order
    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    fn within_tolerance(&self, latency_ms: f64) -> bool {
        (latency_ms - self.params.latency_bound_ms).abs() / self.params.latency_bound_ms
            <= self.params.eps
    }

    fn measure<Q: QpsProbe>(&mut self, probe: &mut Q, target_qps: f64) -> Result<f64, SearchError> {
        let trial = probe.measure(target_qps, self.params.percentile)?;
        let latency_ms = trial.latency_ms;
        tracing::info!(
            "Trial at {:.3} qps: P{} latency {}",
            target_qps,
            self.params.percentile,
            latency_ms.map_or_else(|| "n/a".to_string(), |l| format!("{:.3}ms", l))
        );
        self.trials.push(trial);
        latency_ms.ok_or(SearchError::NoSamples { target_qps })
    }

    fn found(&mut self, target_qps: f64, latency_ms: f64, converged_by: Convergence) -> SearchOutcome {
        let report = self
            .trials
            .iter()
            .rev()
            .find(|t| t.target_qps == target_qps)
            .and_then(|t| t.report.clone());
        tracing::info!(
            "QPS search converged at {:.3} qps ({:.3}ms, {:?}) after {} trials",
            target_qps,
            latency_ms,
            converged_by,
            self.trials.len()
        );
        SearchOutcome {
            target_qps,
            latency_ms,
            converged_by,
            trials: std::mem::take(&mut self.trials),
            report,
        }
    }

    /// Search for the rate at which the configured percentile latency meets the bound
    pub fn run<Q: QpsProbe>(&mut self, probe: &mut Q) -> Result<SearchOutcome, SearchError> {
        self.params
            .validate()
            .map_err(|e| SearchError::InvalidParams(e.to_string()))?;
        self.trials.clear();
        let bound = self.params.latency_bound_ms;
        let eps = self.params.eps;

        let mut qps = self.params.init_qps;
        let mut latency = self.measure(probe, qps)?;
        if self.within_tolerance(latency) {
            return Ok(self.found(qps, latency, Convergence::WithinTolerance));
        }

        // bracket with left below the bound and right above it
        let (mut left, mut left_latency, mut right) = if latency < bound {
            let mut doublings = 0;
            loop {
                if doublings == self.params.max_doublings {
                    return Err(SearchError::Unbounded {
                        latency_bound_ms: bound,
                        doublings,
                        target_qps: qps,
                    });
                }
                let lower = (qps, latency);
                qps *= 2.0;
                doublings += 1;
                latency = self.measure(probe, qps)?;
                if self.within_tolerance(latency) {
                    return Ok(self.found(qps, latency, Convergence::WithinTolerance));
                }
                if latency > bound {
                    break (lower.0, lower.1, qps);
                }
            }
        } else {
            loop {
                let upper = qps;
                let previous = latency;
                qps /= 2.0;
                latency = self.measure(probe, qps)?;
                if self.within_tolerance(latency) {
                    return Ok(self.found(qps, latency, Convergence::WithinTolerance));
                }
                if latency < bound {
                    break (qps, latency, upper);
                }
                if (previous - latency).abs() / previous < eps {
                    return Err(SearchError::Unreachable {
                        latency_bound_ms: bound,
                        percentile: self.params.percentile,
                        target_qps: qps,
                        last_latency_ms: latency,
                    });
                }
            }
        };
        tracing::debug!("Bracketed bound between {:.3} and {:.3} qps", left, right);

        // a closed bracket settles on the highest measured rate that met the bound
        while (right - left) / left >= MIN_BRACKET_WIDTH {
            let mid = (left + right) / 2.0;
            latency = self.measure(probe, mid)?;
            if self.within_tolerance(latency) {
                return Ok(self.found(mid, latency, Convergence::WithinTolerance));
            }
            if latency < bound {
                left = mid;
                left_latency = latency;
            } else {
                right = mid;
            }
        }
        Ok(self.found(left, left_latency, Convergence::BracketWidth))
    }
}
