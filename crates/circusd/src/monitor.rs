//! Resource usage of the daemon process.
//!
//! Backs the `dstats` command and a background task that logs usage
//! periodically, warning when a threshold is crossed.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - A vanished process reads as zero usage

use std::process;
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Memory usage warning threshold in MB.
pub const HIGH_MEMORY_THRESHOLD_MB: u64 = 100;

/// CPU usage warning threshold (percentage).
pub const HIGH_CPU_THRESHOLD_PERCENT: f32 = 80.0;

/// How often the background task samples.
pub const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// One sample of the daemon's resource usage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessMetrics {
    pub pid: u32,

    /// Resident memory in bytes
    pub memory_bytes: u64,

    pub memory_mb: u64,

    /// CPU usage as percentage (0.0 - 100.0+)
    pub cpu_percent: f32,

    /// Seconds since the daemon started
    pub run_time_secs: u64,

    pub memory_high: bool,
    pub cpu_high: bool,
}

impl ProcessMetrics {
    pub fn is_any_high(&self) -> bool {
        self.memory_high || self.cpu_high
    }
}

/// Samples the current process through `sysinfo`.
///
/// CPU usage is computed against the previous refresh, so the first
/// [`ProcessMonitor::refresh`] always reports zero. [`ProcessMonitor::sample`]
/// takes two measurements and blocks in between.
pub struct ProcessMonitor {
    system: System,
    pid: Pid,
    memory_threshold_mb: u64,
    cpu_threshold_percent: f32,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self::with_thresholds(HIGH_MEMORY_THRESHOLD_MB, HIGH_CPU_THRESHOLD_PERCENT)
    }

    pub fn with_thresholds(memory_threshold_mb: u64, cpu_threshold_percent: f32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
            memory_threshold_mb,
            cpu_threshold_percent,
        }
    }

    /// Refreshes and returns the current metrics.
    pub fn refresh(&mut self) -> ProcessMetrics {
        // refresh_all is needed for CPU accounting; a single-process
        // refresh leaves cpu_usage at zero
        self.system.refresh_all();

        let (memory_bytes, cpu_percent, run_time_secs) = self
            .system
            .process(self.pid)
            .map(|p| (p.memory(), p.cpu_usage(), p.run_time()))
            .unwrap_or((0, 0.0, 0));

        let memory_mb = memory_bytes / 1024 / 1024;

        ProcessMetrics {
            pid: self.pid.as_u32(),
            memory_bytes,
            memory_mb,
            cpu_percent,
            run_time_secs,
            memory_high: memory_mb > self.memory_threshold_mb,
            cpu_high: cpu_percent > self.cpu_threshold_percent,
        }
    }

    /// Takes a baseline, waits the minimum CPU update interval, then
    /// refreshes again. Blocks the calling thread.
    pub fn sample(&mut self) -> ProcessMetrics {
        self.system.refresh_all();
        std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
        self.refresh()
    }

    pub fn memory_threshold_mb(&self) -> u64 {
        self.memory_threshold_mb
    }

    pub fn cpu_threshold_percent(&self) -> f32 {
        self.cpu_threshold_percent
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the task that logs daemon resource usage every
/// [`METRICS_INTERVAL`] until `cancel_token` fires.
pub fn spawn_monitor_task(cancel_token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = ProcessMonitor::new();
        let mut tick = interval(METRICS_INTERVAL);

        // Baseline for CPU accounting
        let _ = monitor.refresh();

        info!(
            memory_threshold_mb = monitor.memory_threshold_mb(),
            cpu_threshold_percent = monitor.cpu_threshold_percent(),
            interval_secs = METRICS_INTERVAL.as_secs(),
            "Process monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Process monitor shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let metrics = monitor.refresh();
                    log_metrics(&metrics, &monitor);
                }
            }
        }

        debug!("Process monitor task completed");
    })
}

fn log_metrics(metrics: &ProcessMetrics, monitor: &ProcessMonitor) {
    if metrics.memory_high {
        warn!(
            memory_mb = metrics.memory_mb,
            threshold_mb = monitor.memory_threshold_mb(),
            cpu_percent = format!("{:.1}", metrics.cpu_percent),
            "Daemon memory usage above threshold"
        );
    } else if metrics.cpu_high {
        warn!(
            memory_mb = metrics.memory_mb,
            cpu_percent = format!("{:.1}", metrics.cpu_percent),
            threshold_percent = monitor.cpu_threshold_percent(),
            "Daemon CPU usage above threshold"
        );
    } else {
        debug!(
            memory_mb = metrics.memory_mb,
            cpu_percent = format!("{:.1}", metrics.cpu_percent),
            "Daemon resource usage"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_thresholds() {
        assert!(!ProcessMetrics::default().is_any_high());

        let metrics = ProcessMetrics {
            memory_high: true,
            ..Default::default()
        };
        assert!(metrics.is_any_high());
    }

    #[test]
    fn test_refresh_reports_this_process() {
        let mut monitor = ProcessMonitor::new();
        let metrics = monitor.refresh();
        assert_eq!(metrics.pid, process::id());
        assert!(metrics.memory_bytes > 0);
        assert_eq!(metrics.memory_mb, metrics.memory_bytes / 1024 / 1024);
    }

    #[test]
    fn test_zero_thresholds_flag_usage() {
        let mut monitor = ProcessMonitor::with_thresholds(0, -1.0);
        let metrics = monitor.refresh();
        assert!(metrics.cpu_high);
    }

    #[test]
    fn test_metrics_serialize() {
        let value = serde_json::to_value(ProcessMetrics::default()).unwrap();
        assert_eq!(value["memory_bytes"], 0);
        assert_eq!(value["cpu_high"], false);
    }

    #[tokio::test]
    async fn test_monitor_task_stops_on_cancel() {
        let token = CancellationToken::new();
        let handle = spawn_monitor_task(token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
