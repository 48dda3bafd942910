//! Periodic progress logging and process resource sampling.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::error::Result;
use crate::perf_result::PerfResult;

/// CPU and memory of the harness process over a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Percent of one core
    pub avg_cpu: f32,
    pub max_cpu: f32,
    pub avg_memory_mb: f64,
    pub max_memory_mb: f64,
    pub samples: u64,
}

#[derive(Debug, Default)]
struct ResourceStats {
    cpu_sum: f64,
    cpu_max: f32,
    memory_sum_mb: f64,
    memory_max_mb: f64,
    samples: u64,
}

impl ResourceStats {
    fn record(&mut self, cpu: f32, memory_mb: f64) {
        self.cpu_sum += cpu as f64;
        self.cpu_max = self.cpu_max.max(cpu);
        self.memory_sum_mb += memory_mb;
        self.memory_max_mb = self.memory_max_mb.max(memory_mb);
        self.samples += 1;
    }

    fn usage(&self) -> Option<ResourceUsage> {
        if self.samples == 0 {
            return None;
        }
        let n = self.samples as f64;
        Some(ResourceUsage {
            avg_cpu: (self.cpu_sum / n) as f32,
            max_cpu: self.cpu_max,
            avg_memory_mb: self.memory_sum_mb / n,
            max_memory_mb: self.memory_max_mb,
            samples: self.samples,
        })
    }
}

/// Background thread that logs run progress and samples resource usage every
/// `interval` until stopped
pub struct Telemetry {
    stop_tx: Option<Sender<()>>,
    stats: Arc<Mutex<ResourceStats>>,
    handle: Option<JoinHandle<()>>,
}

impl Telemetry {
    pub fn spawn(interval: Duration, result: Arc<PerfResult>) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let stats = Arc::new(Mutex::new(ResourceStats::default()));
        let sampled = stats.clone();

        let handle = thread::Builder::new()
            .name("perf-telemetry".to_string())
            .spawn(move || {
                let mut sampler = Sampler::new();
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    if let Some((cpu, memory_mb)) = sampler.sample() {
                        sampled
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .record(cpu, memory_mb);
                    }
                    log_progress(&result);
                }
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            stats,
            handle: Some(handle),
        })
    }

    /// Forget samples from earlier runs
    pub fn reset(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = ResourceStats::default();
    }

    pub fn usage(&self) -> Option<ResourceUsage> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .usage()
    }

    pub fn stop(&mut self) {
        // dropping the sender wakes the thread
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Telemetry thread panicked");
            }
        }
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Sampler {
    system: System,
    pid: Option<Pid>,
}

impl Sampler {
    fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!("Resource sampling disabled: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    /// CPU percent and resident memory in MB of this process
    fn sample(&mut self) -> Option<(f32, f64)> {
        let pid = self.pid?;
        self.system.refresh_cpu_usage();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = self.system.process(pid)?;
        Some((
            process.cpu_usage(),
            process.memory() as f64 / (1024.0 * 1024.0),
        ))
    }
}

fn log_progress(result: &PerfResult) {
    let issued = result.count_issued();
    let succeeded = result.count_succeeded();
    let failed = result.count_failed();
    match result.latency_summary() {
        Some(latency) => tracing::info!(
            "Progress: {} issued, {} succeeded, {} failed, {:.1} qps, p50 {:.3}ms, p99 {:.3}ms",
            issued,
            succeeded,
            failed,
            result.get_actual_qps(),
            latency.p50,
            latency.p99
        ),
        None => tracing::info!(
            "Progress: {} issued, {} succeeded, {} failed",
            issued,
            succeeded,
            failed
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_stats() {
        let mut stats = ResourceStats::default();
        assert!(stats.usage().is_none());

        stats.record(10.0, 100.0);
        stats.record(30.0, 300.0);
        let usage = stats.usage().unwrap();
        assert!((usage.avg_cpu - 20.0).abs() < 1e-4);
        assert!((usage.max_cpu - 30.0).abs() < 1e-4);
        assert!((usage.avg_memory_mb - 200.0).abs() < 1e-9);
        assert!((usage.max_memory_mb - 300.0).abs() < 1e-9);
        assert_eq!(usage.samples, 2);
    }

    #[test]
    fn test_sampler_tracks_only_this_process() {
        let mut sampler = Sampler::new();
        let (_, memory_mb) = sampler.sample().unwrap();
        assert!(memory_mb > 0.0);
        // the harness process and its own threads are all the system view holds
        let pid = sampler.pid.unwrap();
        assert!(sampler
            .system
            .processes()
            .iter()
            .all(|(p, process)| *p == pid || process.thread_kind().is_some()));
        assert!(sampler.sample().is_some());
    }

    #[test]
    fn test_telemetry_samples_and_stops() {
        let result = Arc::new(PerfResult::new());
        let mut telemetry = Telemetry::spawn(Duration::from_millis(20), result).unwrap();
        thread::sleep(Duration::from_millis(150));
        telemetry.stop();

        let usage = telemetry.usage().unwrap();
        assert!(usage.samples >= 1);
        assert!(usage.max_memory_mb > 0.0);

        telemetry.reset();
        assert!(telemetry.usage().is_none());
        // idempotent
        telemetry.stop();
    }
}
