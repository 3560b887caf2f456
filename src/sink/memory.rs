use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use crate::pipeline::row::UploadBatch;

/// In-process sink that records every batch it accepts.
///
/// Backs `--dry-run` and tests. Can be configured to reject every put or to
/// stall before accepting. Dry runs use [`MemoryExporter::discarding`] so a
/// long-running agent does not accumulate batches.
pub struct MemoryExporter {
    name: String,
    batches: Arc<Mutex<Vec<UploadBatch>>>,
    record: bool,
    fail_with: Option<String>,
    delay: Option<Duration>,
}

/// Read side of a [`MemoryExporter`], usable after the exporter is moved.
#[derive(Clone)]
pub struct MemoryHandle {
    batches: Arc<Mutex<Vec<UploadBatch>>>,
}

impl MemoryExporter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batches: Arc::new(Mutex::new(Vec::new())),
            record: true,
            fail_with: None,
            delay: None,
        }
    }

    /// Accepts and logs batches without keeping them.
    pub fn discarding(mut self) -> Self {
        self.record = false;
        self
    }

    /// Rejects every put with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    /// Sleeps for `delay` before handling each put.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            batches: Arc::clone(&self.batches),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn put(&self, batch: &UploadBatch) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = &self.fail_with {
            bail!("{message}");
        }

        tracing::debug!(sink = %self.name, rows = batch.len(), "memory sink accepted batch");
        if self.record {
            self.batches.lock().push(batch.clone());
        }

        Ok(())
    }
}

impl MemoryHandle {
    /// Batches accepted so far, in arrival order.
    pub fn batches(&self) -> Vec<UploadBatch> {
        self.batches.lock().clone()
    }

    /// Total rows accepted so far.
    pub fn row_count(&self) -> usize {
        self.batches.lock().iter().map(UploadBatch::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::pid::{ServiceIdentity, ServiceKind};
    use crate::pipeline::row::{Row, ServiceSample};
    use crate::sampler::CpuUsage;

    fn batch() -> UploadBatch {
        let sample = ServiceSample {
            identity: ServiceIdentity::new("cron.service", 7, ServiceKind::SystemdUnit),
            usage: CpuUsage::new(1.0, 0.0),
            measured_at: SystemTime::now(),
        };
        UploadBatch::from(Row::from_sample(&sample, "h"))
    }

    #[tokio::test]
    async fn test_records_batches() {
        let sink = MemoryExporter::new("m");
        let handle = sink.handle();
        sink.put(&batch()).await.expect("put");
        sink.put(&batch()).await.expect("put");
        assert_eq!(handle.batches().len(), 2);
        assert_eq!(handle.row_count(), 2);
    }

    #[tokio::test]
    async fn test_discarding_keeps_nothing() {
        let sink = MemoryExporter::new("memory").discarding();
        let handle = sink.handle();
        for _ in 0..100 {
            sink.put(&batch()).await.expect("put");
        }
        assert!(handle.batches().is_empty());
    }
}
