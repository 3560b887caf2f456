//! Sampling pipeline: cycle fan-out, row fan-in and buffered upload.
//!
//! The [`Pipeline`] owns the row buffer behind a single lock. The aggregator
//! loop and the ingress handlers both append through it, so every append,
//! flush decision and snapshot is serialized. Uploads run outside the lock.

pub mod aggregator;
pub mod buffer;
pub mod coordinator;
pub mod row;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::BufferConfig;
use crate::export::health::HealthMetrics;
use crate::sink::{UploadError, Uploader};

use buffer::{Flush, RowBuffer};
use row::{Row, UploadBatch};

/// Where a buffered row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSource {
    Sampler,
    Event,
}

impl RowSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sampler => "sampler",
            Self::Event => "event",
        }
    }
}

/// Shared entry point for buffered and immediate rows.
pub struct Pipeline {
    buffer: Mutex<RowBuffer>,
    uploader: Arc<Uploader>,
    uploads: Mutex<JoinSet<()>>,
    health: Option<Arc<HealthMetrics>>,
}

impl Pipeline {
    pub fn new(
        cfg: &BufferConfig,
        uploader: Arc<Uploader>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            buffer: Mutex::new(RowBuffer::new(
                cfg.size_threshold,
                cfg.time_threshold,
                Instant::now(),
            )),
            uploader,
            uploads: Mutex::new(JoinSet::new()),
            health,
        }
    }

    /// Number of rows currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Appends one row; a resulting flush is uploaded in the background.
    pub fn append(&self, row: Row, source: RowSource) {
        self.append_all(vec![row], source);
    }

    /// Appends rows in order under one lock acquisition.
    ///
    /// The flush predicate is evaluated after every row, so a large group can
    /// produce several flushes.
    pub fn append_all(&self, rows: Vec<Row>, source: RowSource) {
        let count = rows.len();
        let (flushes, buffered) = {
            let mut buffer = self.buffer.lock();
            let flushes = buffer.extend(rows, Instant::now());
            (flushes, buffer.len())
        };

        if let Some(health) = &self.health {
            health
                .rows_appended
                .with_label_values(&[source.as_str()])
                .inc_by(count as f64);
            health.rows_buffered.set(buffered as f64);
        }

        for flush in flushes {
            self.record_flush(&flush, buffered);
            self.spawn_upload(flush);
        }
    }

    /// Re-checks the time threshold; called on the aggregator's idle tick.
    pub fn tick(&self) {
        let flush = self.buffer.lock().tick(Instant::now());
        if let Some(flush) = flush {
            self.record_flush(&flush, 0);
            self.spawn_upload(flush);
        }
    }

    /// Drains the buffer and uploads it, waiting for the result.
    pub async fn flush_now(&self) -> Result<usize, UploadError> {
        let flush = self.buffer.lock().drain(Instant::now());
        let Some(flush) = flush else {
            return Ok(0);
        };

        self.record_flush(&flush, 0);
        let rows = flush.batch.len();
        self.uploader.upload(&flush.batch).await?;
        Ok(rows)
    }

    /// Uploads `batch` directly, bypassing the buffer.
    ///
    /// Blocks until every sink was attempted or `timeout` elapsed. Errors go
    /// back to the caller instead of the log.
    pub async fn submit_immediate(
        &self,
        batch: UploadBatch,
        timeout: Duration,
    ) -> Result<(), UploadError> {
        let result = match tokio::time::timeout(timeout, self.uploader.upload(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(UploadError::TimedOut(timeout)),
        };

        if let Some(health) = &self.health {
            let label = if result.is_ok() { "ok" } else { "failed" };
            health
                .immediate_submissions
                .with_label_values(&[label])
                .inc();
        }

        result
    }

    /// Waits for background uploads spawned so far.
    pub async fn wait_uploads(&self) {
        let mut uploads = std::mem::take(&mut *self.uploads.lock());
        while let Some(joined) = uploads.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "background upload task join failed");
            }
        }
    }

    fn spawn_upload(&self, flush: Flush) {
        let uploader = Arc::clone(&self.uploader);
        let mut uploads = self.uploads.lock();

        // Reap finished uploads.
        while uploads.try_join_next().is_some() {}

        uploads.spawn(async move {
            let rows = flush.batch.len();
            if let Err(e) = uploader.upload(&flush.batch).await {
                error!(
                    rows,
                    trigger = flush.trigger.as_str(),
                    error = %e,
                    "background flush upload failed",
                );
            }
        });
    }

    fn record_flush(&self, flush: &Flush, buffered: usize) {
        info!(
            rows = flush.batch.len(),
            trigger = flush.trigger.as_str(),
            "flushing row buffer",
        );

        if let Some(health) = &self.health {
            health
                .flushes
                .with_label_values(&[flush.trigger.as_str()])
                .inc();
            health.flush_batch_size.observe(flush.batch.len() as f64);
            health.rows_buffered.set(buffered as f64);
        }
    }
}
