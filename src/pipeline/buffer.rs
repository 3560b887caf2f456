use std::time::Duration;

use tokio::time::Instant;

use super::row::{Row, UploadBatch};

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Buffered row count reached the size threshold.
    Size,
    /// Time since the last flush reached the time threshold.
    Time,
    /// Explicit drain, e.g. on shutdown.
    Drain,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Time => "time",
            Self::Drain => "drain",
        }
    }
}

/// A snapshot taken out of the buffer, ready for upload.
#[derive(Debug, Clone)]
pub struct Flush {
    pub batch: UploadBatch,
    pub trigger: FlushTrigger,
}

/// Ordered row buffer with size-or-time flush policy.
///
/// Not synchronized on its own; callers hold it behind one lock so that the
/// append, the predicate check and the snapshot happen together.
#[derive(Debug)]
pub struct RowBuffer {
    rows: Vec<Row>,
    last_flush: Instant,
    size_threshold: usize,
    time_threshold: Duration,
}

impl RowBuffer {
    pub fn new(size_threshold: usize, time_threshold: Duration, now: Instant) -> Self {
        Self {
            rows: Vec::with_capacity(size_threshold.min(4096)),
            last_flush: now,
            size_threshold: size_threshold.max(1),
            time_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Instant of the most recent flush (or of creation).
    pub fn last_flush(&self) -> Instant {
        self.last_flush
    }

    /// Appends a row and flushes if either threshold is met.
    pub fn push(&mut self, row: Row, now: Instant) -> Option<Flush> {
        self.rows.push(row);

        let trigger = if self.rows.len() >= self.size_threshold {
            FlushTrigger::Size
        } else if self.time_elapsed(now) {
            FlushTrigger::Time
        } else {
            return None;
        };

        Some(self.take(trigger, now))
    }

    /// Appends rows in order, checking the predicate after each one.
    pub fn extend(&mut self, rows: impl IntoIterator<Item = Row>, now: Instant) -> Vec<Flush> {
        rows.into_iter()
            .filter_map(|row| self.push(row, now))
            .collect()
    }

    /// Re-evaluates the time threshold without new rows.
    ///
    /// An empty buffer never flushes and keeps its last flush instant.
    pub fn tick(&mut self, now: Instant) -> Option<Flush> {
        if self.rows.is_empty() || !self.time_elapsed(now) {
            return None;
        }
        Some(self.take(FlushTrigger::Time, now))
    }

    /// Takes whatever is buffered regardless of thresholds.
    pub fn drain(&mut self, now: Instant) -> Option<Flush> {
        if self.rows.is_empty() {
            return None;
        }
        Some(self.take(FlushTrigger::Drain, now))
    }

    fn time_elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_flush) >= self.time_threshold
    }

    fn take(&mut self, trigger: FlushTrigger, now: Instant) -> Flush {
        let rows = std::mem::replace(&mut self.rows, Vec::with_capacity(self.size_threshold.min(4096)));
        self.last_flush = now;
        Flush {
            batch: UploadBatch::new(rows),
            trigger,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::pid::{ServiceIdentity, ServiceKind};
    use crate::pipeline::row::ServiceSample;
    use crate::sampler::CpuUsage;

    fn row(pid: u32) -> Row {
        let sample = ServiceSample {
            identity: ServiceIdentity::new(format!("svc-{pid}"), pid, ServiceKind::Process),
            usage: CpuUsage::new(1.0, 1.0),
            measured_at: SystemTime::UNIX_EPOCH,
        };
        Row::from_sample(&sample, "host")
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_size_trigger() {
        let t0 = Instant::now();
        let mut buf = RowBuffer::new(3, secs(10), t0);

        assert!(buf.push(row(1), t0).is_none());
        assert!(buf.push(row(2), t0).is_none());
        let flush = buf.push(row(3), t0).expect("size flush");

        assert_eq!(flush.trigger, FlushTrigger::Size);
        assert_eq!(flush.batch.len(), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_time_trigger_on_push() {
        let t0 = Instant::now();
        let mut buf = RowBuffer::new(100, secs(10), t0);

        assert!(buf.push(row(1), t0 + secs(5)).is_none());
        let flush = buf.push(row(2), t0 + secs(10)).expect("time flush");
        assert_eq!(flush.trigger, FlushTrigger::Time);
        assert_eq!(flush.batch.len(), 2);
        assert_eq!(buf.last_flush(), t0 + secs(10));
    }

    #[test]
    fn test_idle_tick_flushes_aged_rows() {
        let t0 = Instant::now();
        let mut buf = RowBuffer::new(100, secs(10), t0);

        assert!(buf.push(row(1), t0 + secs(1)).is_none());
        assert!(buf.tick(t0 + secs(9)).is_none());
        let flush = buf.tick(t0 + secs(10)).expect("idle flush");
        assert_eq!(flush.trigger, FlushTrigger::Time);
        assert_eq!(flush.batch.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_idle_tick_on_empty_buffer_is_noop() {
        let t0 = Instant::now();
        let mut buf = RowBuffer::new(100, secs(10), t0);

        assert!(buf.tick(t0 + secs(60)).is_none());
        assert_eq!(buf.last_flush(), t0);
    }

    #[test]
    fn test_size_then_time_scenario() {
        let t0 = Instant::now();
        let mut buf = RowBuffer::new(3, secs(10), t0);

        assert!(buf.push(row(1), t0).is_none());
        assert!(buf.push(row(2), t0).is_none());
        let first = buf.push(row(3), t0 + secs(1)).expect("size flush at 1s");
        assert_eq!(first.trigger, FlushTrigger::Size);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.last_flush(), t0 + secs(1));

        // Nothing buffered, so the idle tick at 11s does nothing.
        assert!(buf.tick(t0 + secs(11)).is_none());
        assert_eq!(buf.last_flush(), t0 + secs(1));

        // A row at 12s lands 11s after the last flush.
        let second = buf.push(row(4), t0 + secs(12)).expect("time flush at 12s");
        assert_eq!(second.trigger, FlushTrigger::Time);
        assert_eq!(second.batch.len(), 1);
        assert_eq!(buf.last_flush(), t0 + secs(12));
    }

    #[test]
    fn test_extend_checks_after_every_append() {
        let t0 = Instant::now();
        let mut buf = RowBuffer::new(2, secs(10), t0);

        let flushes = buf.extend((1..=5).map(row), t0);
        assert_eq!(flushes.len(), 2);
        assert!(flushes.iter().all(|f| f.batch.len() == 2));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_length_never_exceeds_threshold() {
        let t0 = Instant::now();
        let mut buf = RowBuffer::new(4, secs(3600), t0);

        for pid in 0..50 {
            buf.push(row(pid), t0);
            assert!(buf.len() < 4);
        }
    }

    #[test]
    fn test_flush_preserves_order() {
        let t0 = Instant::now();
        let mut buf = RowBuffer::new(3, secs(10), t0);
        buf.push(row(7), t0);
        buf.push(row(8), t0);
        let flush = buf.push(row(9), t0).expect("flush");
        let instances: Vec<&str> = flush.batch.rows().iter().map(|r| r.instance.as_str()).collect();
        assert_eq!(instances, vec!["7", "8", "9"]);
    }

    #[test]
    fn test_drain() {
        let t0 = Instant::now();
        let mut buf = RowBuffer::new(10, secs(10), t0);
        assert!(buf.drain(t0).is_none());

        buf.push(row(1), t0);
        let flush = buf.drain(t0 + secs(2)).expect("drain");
        assert_eq!(flush.trigger, FlushTrigger::Drain);
        assert_eq!(flush.batch.len(), 1);
        assert_eq!(buf.last_flush(), t0 + secs(2));
    }
}
