use std::time::Duration;

use super::{compute_usage, CpuSnapshot, CpuUsage, SampleError, Sampler};

/// Samples processes by reading /proc.
pub struct ProcSampler {
    cores: u32,
}

impl ProcSampler {
    /// Creates a sampler, detecting the number of online cores.
    pub fn new() -> Self {
        let cores = match parse_cpu_online() {
            0 => std::thread::available_parallelism()
                .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
                .unwrap_or(1),
            n => n,
        };
        tracing::info!(cores, "detected online CPU cores");
        Self { cores }
    }

    /// Creates a sampler with a fixed core count.
    pub fn with_cores(cores: u32) -> Self {
        Self { cores: cores.max(1) }
    }
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for ProcSampler {
    async fn sample(&self, pid: u32, window: Duration) -> Result<CpuUsage, SampleError> {
        if window.is_zero() {
            return Err(SampleError::InvalidWindow);
        }

        let (before, start_time) = read_snapshot(pid)?;
        tokio::time::sleep(window).await;
        let (after, end_start_time) = read_snapshot(pid)?;

        // A different start time means the pid was recycled mid-window.
        if start_time != end_start_time {
            return Err(SampleError::ProcessUnavailable {
                pid,
                reason: "pid reused during sampling window".to_string(),
            });
        }

        Ok(compute_usage(&before, &after, self.cores))
    }
}

/// Reads the process counters and host total, plus the process start time.
fn read_snapshot(pid: u32) -> Result<(CpuSnapshot, u64), SampleError> {
    let unavailable = |reason: String| SampleError::ProcessUnavailable { pid, reason };

    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .map_err(|e| unavailable(e.to_string()))?;
    let proc_times = parse_proc_stat(&stat)
        .ok_or_else(|| unavailable("malformed /proc/<pid>/stat".to_string()))?;

    let host = std::fs::read_to_string("/proc/stat").map_err(|e| unavailable(e.to_string()))?;
    let host_total =
        parse_host_total(&host).ok_or_else(|| unavailable("malformed /proc/stat".to_string()))?;

    Ok((
        CpuSnapshot {
            utime: proc_times.utime,
            stime: proc_times.stime,
            host_total,
        },
        proc_times.start_time,
    ))
}

#[derive(Debug, PartialEq, Eq)]
struct ProcTimes {
    utime: u64,
    stime: u64,
    start_time: u64,
}

/// Parses utime, stime and starttime out of /proc/<pid>/stat.
///
/// The comm field may contain spaces and parentheses, so fields are counted
/// from the last ')'. After it, state is field 3; utime, stime and starttime
/// are fields 14, 15 and 22.
fn parse_proc_stat(text: &str) -> Option<ProcTimes> {
    let rest = &text[text.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    let field = |n: usize| fields.get(n - 3)?.parse::<u64>().ok();

    Some(ProcTimes {
        utime: field(14)?,
        stime: field(15)?,
        start_time: field(22)?,
    })
}

/// Sums the aggregate "cpu" line of /proc/stat.
///
/// guest and guest_nice are already included in user and nice.
fn parse_host_total(text: &str) -> Option<u64> {
    let line = text.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>().ok())
        .collect::<Option<_>>()?;

    if values.is_empty() {
        return None;
    }

    Some(values.iter().take(8).sum())
}

fn parse_cpu_online() -> u32 {
    let Ok(raw) = std::fs::read_to_string("/sys/devices/system/cpu/online") else {
        return 0;
    };
    parse_cpu_online_text(raw.trim()).unwrap_or(0)
}

/// Counts CPUs in a kernel cpu list such as "0-3,8-11".
fn parse_cpu_online_text(text: &str) -> Option<u32> {
    if text.is_empty() {
        return None;
    }

    let mut total = 0u32;
    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start = start.trim().parse::<u32>().ok()?;
            let end = end.trim().parse::<u32>().ok()?;
            if end < start {
                return None;
            }
            total = total.saturating_add(end - start + 1);
        } else {
            part.parse::<u32>().ok()?;
            total = total.saturating_add(1);
        }
    }

    (total > 0).then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (my (odd) proc) S 1 4242 4242 0 -1 4194560 1200 0 0 0 \
                        731 129 0 0 20 0 3 0 98765 12345678 900 18446744073709551615";

    #[test]
    fn test_parse_proc_stat() {
        let times = parse_proc_stat(STAT).expect("parse");
        assert_eq!(
            times,
            ProcTimes {
                utime: 731,
                stime: 129,
                start_time: 98765,
            }
        );
    }

    #[test]
    fn test_parse_proc_stat_truncated() {
        assert!(parse_proc_stat("12 (x) S 1 2 3").is_none());
        assert!(parse_proc_stat("no parens here").is_none());
    }

    #[test]
    fn test_parse_host_total() {
        let text = "cpu  100 20 30 400 5 6 7 8 9 10\ncpu0 50 10 15 200 2 3 3 4 4 5\n";
        assert_eq!(parse_host_total(text), Some(100 + 20 + 30 + 400 + 5 + 6 + 7 + 8));
        assert_eq!(parse_host_total("intr 1 2 3\n"), None);
    }

    #[test]
    fn test_parse_cpu_online_text() {
        assert_eq!(parse_cpu_online_text("0"), Some(1));
        assert_eq!(parse_cpu_online_text("0-3"), Some(4));
        assert_eq!(parse_cpu_online_text("0-3,8-11"), Some(8));
        assert_eq!(parse_cpu_online_text("0,2,4"), Some(3));
        assert_eq!(parse_cpu_online_text(""), None);
        assert_eq!(parse_cpu_online_text("3-1"), None);
        assert_eq!(parse_cpu_online_text("abc"), None);
    }

    #[tokio::test]
    async fn test_zero_window_fails_fast() {
        let sampler = ProcSampler::with_cores(2);
        let err = sampler
            .sample(std::process::id(), Duration::ZERO)
            .await
            .expect_err("zero window");
        assert!(matches!(err, SampleError::InvalidWindow));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sample_self() {
        let sampler = ProcSampler::with_cores(1);
        let usage = sampler
            .sample(std::process::id(), Duration::from_millis(50))
            .await
            .expect("sampling own process");
        assert!(usage.total_pct >= 0.0);
        assert!((usage.total_pct - (usage.user_pct + usage.system_pct)).abs() < 1e-9);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sample_missing_process() {
        let sampler = ProcSampler::with_cores(1);
        let err = sampler
            .sample(u32::MAX - 1, Duration::from_millis(10))
            .await
            .expect_err("no such pid");
        assert!(matches!(err, SampleError::ProcessUnavailable { .. }));
    }
}
