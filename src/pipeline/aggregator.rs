use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::row::{Row, ServiceSample};
use super::{Pipeline, RowSource};

/// Single consumer of sampler results.
///
/// Converts each result into a row and appends it to the pipeline. An idle
/// ticker re-checks the time threshold so rows are not held forever when
/// sampling goes quiet.
pub struct Aggregator {
    pipeline: Arc<Pipeline>,
    results: mpsc::Receiver<ServiceSample>,
    hostname: Arc<str>,
    idle_tick: Duration,
}

impl Aggregator {
    pub fn new(
        pipeline: Arc<Pipeline>,
        results: mpsc::Receiver<ServiceSample>,
        hostname: Arc<str>,
        idle_tick: Duration,
    ) -> Self {
        Self {
            pipeline,
            results,
            hostname,
            idle_tick,
        }
    }

    /// Runs the aggregator loop until cancelled or all senders are gone.
    ///
    /// On exit, pending results are drained, the buffer is flushed and
    /// in-flight background uploads are awaited.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.idle_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    while let Ok(sample) = self.results.try_recv() {
                        self.append(&sample);
                    }
                    break;
                }
                received = self.results.recv() => match received {
                    Some(sample) => self.append(&sample),
                    None => {
                        debug!("sampler result channel closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.pipeline.tick(),
            }
        }

        self.shutdown().await;
    }

    fn append(&self, sample: &ServiceSample) {
        let row = Row::from_sample(sample, &self.hostname);
        self.pipeline.append(row, RowSource::Sampler);
    }

    async fn shutdown(&self) {
        match self.pipeline.flush_now().await {
            Ok(rows) => info!(rows, "flushed row buffer on shutdown"),
            Err(e) => error!(error = %e, "final flush failed"),
        }
        self.pipeline.wait_uploads().await;
    }
}
