use anyhow::Result;

use super::clickhouse::ClickHouseExporter;
use super::http::HttpExporter;
use super::memory::MemoryExporter;
use crate::pipeline::row::UploadBatch;

/// Exporter dispatches upload batches to one sink backend.
///
/// Uses enum dispatch rather than trait objects so `put` stays a plain
/// async fn without boxing its future.
pub enum Exporter {
    ClickHouse(ClickHouseExporter),
    Http(HttpExporter),
    Memory(MemoryExporter),
}

impl Exporter {
    /// Returns the sink name for logging and metrics.
    pub fn name(&self) -> &str {
        match self {
            Self::ClickHouse(e) => e.name(),
            Self::Http(e) => e.name(),
            Self::Memory(e) => e.name(),
        }
    }

    /// Prepare the sink before the first put.
    pub async fn start(&mut self) -> Result<()> {
        match self {
            Self::ClickHouse(e) => e.start().await,
            Self::Http(e) => e.start().await,
            Self::Memory(_) => Ok(()),
        }
    }

    /// Append a batch to the sink.
    pub async fn put(&self, batch: &UploadBatch) -> Result<()> {
        match self {
            Self::ClickHouse(e) => e.put(batch).await,
            Self::Http(e) => e.put(batch).await,
            Self::Memory(e) => e.put(batch).await,
        }
    }
}
