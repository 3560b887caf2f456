use std::io::Write;

use anyhow::{bail, Context, Result};

use crate::config::HttpExportConfig;
use crate::pipeline::row::{Row, UploadBatch};

/// HTTP NDJSON sink.
///
/// Each put serializes the batch to newline-delimited JSON, compresses it and
/// POSTs it once. A non-2xx status fails the put.
pub struct HttpExporter {
    cfg: HttpExportConfig,
    default_table: String,
    client: Option<reqwest::Client>,
}

impl HttpExporter {
    /// Creates a new HTTP exporter.
    pub fn new(cfg: HttpExportConfig, default_table: String) -> Self {
        Self {
            cfg,
            default_table,
            client: None,
        }
    }

    pub fn name(&self) -> &str {
        "http"
    }

    /// Builds the HTTP client.
    pub async fn start(&mut self) -> Result<()> {
        if self.cfg.address.is_empty() {
            bail!("http address is required");
        }

        let mut builder = reqwest::Client::builder().timeout(self.cfg.export_timeout);
        if !self.cfg.keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }

        self.client = Some(builder.build().context("building HTTP client")?);

        Ok(())
    }

    /// Sends one batch.
    pub async fn put(&self, batch: &UploadBatch) -> Result<()> {
        let Some(client) = &self.client else {
            bail!("http exporter not started");
        };

        let mut buf = Vec::with_capacity(batch.len() * 256);
        encode_ndjson(batch.rows(), &self.default_table, &mut buf)?;
        let raw_len = buf.len();

        let body = compress(&buf, &self.cfg.compression).context("compressing NDJSON data")?;

        let mut request = client
            .post(&self.cfg.address)
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request.send().await.context("sending HTTP export request")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("HTTP export unexpected status: {status}");
        }

        tracing::debug!(rows = batch.len(), bytes = raw_len, "exported batch via HTTP");

        Ok(())
    }
}

/// Serializes rows as NDJSON into `buf`.
pub fn encode_ndjson(rows: &[Row], default_table: &str, buf: &mut Vec<u8>) -> Result<()> {
    for row in rows {
        serde_json::to_writer(&mut *buf, &row.to_json(default_table))
            .context("serializing row to JSON")?;
        buf.push(b'\n');
    }
    Ok(())
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).context("gzip write")?;
            encoder.finish().context("gzip finish")
        }
        "zlib" => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).context("zlib write")?;
            encoder.finish().context("zlib finish")
        }
        "zstd" => zstd::encode_all(data, 0).context("zstd encode"),
        "snappy" => snap::raw::Encoder::new()
            .compress_vec(data)
            .context("snappy encode"),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        "snappy" => Some("snappy"),
        _ => None,
    }
}
