use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::ClickHouseWriter;
use crate::ingress::{IngressServer, IngressState};
use crate::pid::CompositeDiscovery;
use crate::pipeline::aggregator::Aggregator;
use crate::pipeline::coordinator::CycleCoordinator;
use crate::pipeline::Pipeline;
use crate::sampler::ProcSampler;
use crate::sink::exporter::Exporter;
use crate::sink::http::HttpExporter;
use crate::sink::memory::MemoryExporter;
use crate::sink::Uploader;

const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";
const UNDEFINED_HOSTNAME: &str = "<undefined>";

/// Agent orchestrates all components: sampling, buffering, sinks, ingress.
pub struct Agent {
    cfg: Config,
    dry_run: bool,
    health: Arc<HealthMetrics>,
    ch_writer: Option<ClickHouseWriter>,
    pipeline: Option<Arc<Pipeline>>,
    ingress: Option<IngressServer>,
    aggregator: Option<JoinHandle<()>>,
    coordinator: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    ///
    /// With `dry_run`, every configured sink is replaced by an in-memory one.
    pub fn new(cfg: Config, dry_run: bool) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            dry_run,
            health,
            ch_writer: None,
            pipeline: None,
            ingress: None,
            aggregator: None,
            coordinator: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin sampling.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Sinks.
        let exporters = self.build_exporters().await?;
        let mut uploader = Uploader::new(
            exporters,
            self.cfg.upload.put_timeout,
            Some(Arc::clone(&self.health)),
        );
        uploader.start().await.context("starting sinks")?;
        info!(sinks = ?uploader.sink_names(), "sinks ready");

        let pipeline = Arc::new(Pipeline::new(
            &self.cfg.buffer,
            Arc::new(uploader),
            Some(Arc::clone(&self.health)),
        ));

        // 2. Aggregator, the single consumer of sampler results.
        let hostname: Arc<str> = Arc::from(resolve_hostname(&self.cfg.hostname));
        let (tx, rx) = mpsc::channel(self.cfg.buffer.channel_capacity);

        let aggregator = Aggregator::new(
            Arc::clone(&pipeline),
            rx,
            Arc::clone(&hostname),
            self.cfg.buffer.idle_tick,
        );
        self.aggregator = Some(aggregator.spawn(self.cancel.child_token()));

        // 3. Cycle coordinator.
        let coordinator = CycleCoordinator::new(
            Arc::new(CompositeDiscovery::new(&self.cfg.discovery)),
            Arc::new(ProcSampler::new()),
            &self.cfg.sampling,
            tx,
            Some(Arc::clone(&self.health)),
        );
        self.coordinator = Some(coordinator.spawn(self.cancel.child_token()));

        // 4. Event ingress.
        if self.cfg.ingress.enabled {
            let state = IngressState::new(
                Arc::clone(&pipeline),
                self.cfg.upload.immediate_timeout,
                self.cfg.meta_cluster_id.clone(),
                Some(Arc::clone(&self.health)),
            )
            .with_event_stream(self.cfg.sinks.event_stream_table.clone());
            let server = IngressServer::new(&self.cfg.ingress.addr, state);
            server.start().await.context("starting event ingress")?;
            self.ingress = Some(server);
        }

        self.pipeline = Some(pipeline);

        info!(
            hostname = %hostname,
            window = ?self.cfg.sampling.window,
            interval = ?self.cfg.sampling.interval,
            dry_run = self.dry_run,
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Reject new events before the final flush.
        if let Some(ingress) = &self.ingress {
            ingress.stop();
        }

        // Stops cycle launches and makes the aggregator drain and flush.
        self.cancel.cancel();

        if let Some(handle) = self.coordinator.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "cycle coordinator task failed");
            }
        }

        if let Some(handle) = self.aggregator.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "aggregator task failed");
            }
        }

        // Buffered events that arrived after the aggregator's final flush.
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.flush_now().await {
                error!(error = %e, "late flush failed");
            }
            pipeline.wait_uploads().await;
        }

        if let Some(writer) = &mut self.ch_writer {
            if let Err(e) = writer.stop().await {
                error!(error = %e, "error stopping ClickHouse writer");
            }
        }

        self.health.stop().await?;

        Ok(())
    }

    async fn build_exporters(&mut self) -> Result<Vec<Exporter>> {
        let default_table = self.cfg.sinks.default_table.clone();

        if self.dry_run {
            warn!("dry run: configured sinks replaced by in-memory sink");
            return Ok(vec![Exporter::Memory(dry_run_sink())]);
        }

        let mut exporters = Vec::with_capacity(2);

        if self.cfg.sinks.clickhouse.enabled {
            let mut writer = ClickHouseWriter::new(self.cfg.sinks.clickhouse.clone());
            writer
                .start()
                .await
                .context("starting ClickHouse writer")?;

            exporters.push(Exporter::ClickHouse(
                writer.exporter(default_table.clone(), Some(Arc::clone(&self.health)))?,
            ));
            self.ch_writer = Some(writer);
        }

        if self.cfg.sinks.http.enabled {
            exporters.push(Exporter::Http(HttpExporter::new(
                self.cfg.sinks.http.clone(),
                default_table,
            )));
        }

        Ok(exporters)
    }
}

/// Sink used in place of every configured one during a dry run.
fn dry_run_sink() -> MemoryExporter {
    MemoryExporter::new("memory").discarding()
}

/// Picks the configured hostname, else the kernel's, else a placeholder.
fn resolve_hostname(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }

    match std::fs::read_to_string(HOSTNAME_PATH) {
        Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
        Ok(_) => UNDEFINED_HOSTNAME.to_string(),
        Err(e) => {
            warn!(error = %e, "reading hostname");
            UNDEFINED_HOSTNAME.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_hostname_prefers_config() {
        assert_eq!(resolve_hostname("node-a"), "node-a");
    }

    #[test]
    fn test_resolve_hostname_never_empty() {
        assert!(!resolve_hostname("").is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_sink_does_not_retain_batches() {
        use std::time::SystemTime;

        use crate::pid::{ServiceIdentity, ServiceKind};
        use crate::pipeline::row::{Row, ServiceSample, UploadBatch};
        use crate::sampler::CpuUsage;

        let sink = dry_run_sink();
        let handle = sink.handle();
        let sample = ServiceSample {
            identity: ServiceIdentity::new("sshd.service", 41, ServiceKind::SystemdUnit),
            usage: CpuUsage::new(1.0, 1.0),
            measured_at: SystemTime::now(),
        };
        let batch = UploadBatch::from(Row::from_sample(&sample, "h"));

        sink.put(&batch).await.expect("accepted");
        assert_eq!(handle.row_count(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_lifecycle() {
        let mut cfg = Config::default();
        cfg.health.addr = "127.0.0.1:0".to_string();
        cfg.ingress.addr = "127.0.0.1:0".to_string();
        cfg.hostname = "test-host".to_string();
        cfg.discovery.systemd = false;
        cfg.discovery.process_names = vec!["unitwatch-none".to_string()];

        let mut agent = Agent::new(cfg, true).expect("agent");
        agent.start().await.expect("start");
        agent.stop().await.expect("stop");
    }
}
