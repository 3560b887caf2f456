//! Per-process CPU usage measurement over a fixed window.
//!
//! A sample takes two snapshots of the process' CPU time and the host's total
//! CPU time, `window` apart, and reports the process share normalized so that
//! one fully busy core reads 100%.

pub mod procfs;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub use procfs::ProcSampler;

/// CPU usage percentages for one process over one window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CpuUsage {
    pub user_pct: f64,
    pub system_pct: f64,
    pub total_pct: f64,
}

impl CpuUsage {
    /// Builds a usage value, deriving the total from its parts.
    pub fn new(user_pct: f64, system_pct: f64) -> Self {
        Self {
            user_pct,
            system_pct,
            total_pct: user_pct + system_pct,
        }
    }
}

/// Errors that can occur while sampling a process.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("process {pid} unavailable: {reason}")]
    ProcessUnavailable { pid: u32, reason: String },

    #[error("sampling window must be positive")]
    InvalidWindow,
}

/// Measures CPU usage of a process.
pub trait Sampler: Send + Sync + 'static {
    /// Blocks the calling task for `window`, then reports usage for `pid`.
    fn sample(
        &self,
        pid: u32,
        window: Duration,
    ) -> impl Future<Output = Result<CpuUsage, SampleError>> + Send;
}

/// Cumulative CPU counters captured at one instant, in clock ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSnapshot {
    pub utime: u64,
    pub stime: u64,
    pub host_total: u64,
}

/// Computes usage between two snapshots.
///
/// `cpu_pct = cores * delta_process * 100 / delta_host_total`. A host total
/// that did not advance yields zero usage.
pub fn compute_usage(before: &CpuSnapshot, after: &CpuSnapshot, cores: u32) -> CpuUsage {
    let total_delta = after.host_total.saturating_sub(before.host_total);
    if total_delta == 0 {
        return CpuUsage::default();
    }

    let scale = f64::from(cores) * 100.0 / total_delta as f64;
    let user = after.utime.saturating_sub(before.utime) as f64 * scale;
    let system = after.stime.saturating_sub(before.stime) as f64 * scale;

    CpuUsage::new(user, system)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(utime: u64, stime: u64, host_total: u64) -> CpuSnapshot {
        CpuSnapshot {
            utime,
            stime,
            host_total,
        }
    }

    #[test]
    fn test_compute_usage_single_core_busy() {
        let usage = compute_usage(&snap(0, 0, 0), &snap(100, 0, 100), 1);
        assert!((usage.user_pct - 100.0).abs() < 1e-9);
        assert_eq!(usage.system_pct, 0.0);
        assert!((usage.total_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_usage_scales_by_cores() {
        // 4 cores, host advanced 400 ticks, process used 50 user + 50 system.
        let usage = compute_usage(&snap(10, 20, 1000), &snap(60, 70, 1400), 4);
        assert!((usage.user_pct - 50.0).abs() < 1e-9);
        assert!((usage.system_pct - 50.0).abs() < 1e-9);
        assert!((usage.total_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_usage_total_is_sum() {
        let usage = compute_usage(&snap(0, 0, 0), &snap(7, 3, 200), 8);
        assert!((usage.total_pct - (usage.user_pct + usage.system_pct)).abs() < 1e-12);
    }

    #[test]
    fn test_compute_usage_no_host_progress() {
        let usage = compute_usage(&snap(5, 5, 100), &snap(9, 9, 100), 2);
        assert_eq!(usage, CpuUsage::default());
    }

    #[test]
    fn test_sample_error_display() {
        let err = SampleError::ProcessUnavailable {
            pid: 42,
            reason: "exited".to_string(),
        };
        assert_eq!(err.to_string(), "process 42 unavailable: exited");
        assert_eq!(
            SampleError::InvalidWindow.to_string(),
            "sampling window must be positive"
        );
    }
}
