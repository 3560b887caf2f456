pub mod clickhouse;
pub mod exporter;
pub mod http;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::export::health::HealthMetrics;
use crate::pipeline::row::UploadBatch;

use exporter::Exporter;

/// One sink's failure within an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFailure {
    pub sink: String,
    pub message: String,
}

impl fmt::Display for SinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink {}: {}", self.sink, self.message)
    }
}

/// Errors returned by an upload.
#[derive(Error, Debug)]
pub enum UploadError {
    /// One or more sinks rejected or timed out on the batch.
    #[error("{}", join_failures(.0))]
    Sinks(Vec<SinkFailure>),

    /// The whole upload exceeded its caller-supplied deadline.
    #[error("upload timed out after {0:?}")]
    TimedOut(Duration),
}

impl UploadError {
    /// Per-sink failures, empty for a timeout.
    pub fn failures(&self) -> &[SinkFailure] {
        match self {
            Self::Sinks(failures) => failures,
            Self::TimedOut(_) => &[],
        }
    }
}

fn join_failures(failures: &[SinkFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Reports whether `name` is usable as a table or column name in every sink:
/// ASCII letters, digits and underscores, not starting with a digit.
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Pushes batches to every configured sink.
///
/// Each sink gets an attempt regardless of earlier failures. Failed rows are
/// not retried.
pub struct Uploader {
    exporters: Vec<Exporter>,
    put_timeout: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl Uploader {
    pub fn new(
        exporters: Vec<Exporter>,
        put_timeout: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            exporters,
            put_timeout,
            health,
        }
    }

    /// Starts every exporter.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        for exporter in &mut self.exporters {
            exporter.start().await?;
            info!(sink = exporter.name(), "sink started");
        }
        Ok(())
    }

    /// Names of the configured sinks, in upload order.
    pub fn sink_names(&self) -> Vec<&str> {
        self.exporters.iter().map(Exporter::name).collect()
    }

    /// Uploads `batch` to every sink, collecting failures.
    pub async fn upload(&self, batch: &UploadBatch) -> Result<(), UploadError> {
        if batch.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let mut failures = Vec::new();

        for exporter in &self.exporters {
            let sink_start = Instant::now();

            let result = match tokio::time::timeout(self.put_timeout, exporter.put(batch)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("put timed out after {:?}", self.put_timeout)),
            };

            if let Some(health) = &self.health {
                health
                    .upload_duration
                    .with_label_values(&[exporter.name()])
                    .observe(sink_start.elapsed().as_secs_f64());
            }

            if let Err(e) = result {
                warn!(sink = exporter.name(), rows = batch.len(), error = %e, "sink put failed");
                if let Some(health) = &self.health {
                    health
                        .upload_errors
                        .with_label_values(&[exporter.name()])
                        .inc();
                }
                failures.push(SinkFailure {
                    sink: exporter.name().to_string(),
                    message: format!("{e:#}"),
                });
            }
        }

        info!(
            rows = batch.len(),
            sinks = self.exporters.len(),
            failed = failures.len(),
            duration = ?start.elapsed(),
            "processed upload batch",
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(UploadError::Sinks(failures))
        }
    }
}
