use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SamplingConfig;
use crate::export::health::HealthMetrics;
use crate::pid::Discovery;
use crate::sampler::Sampler;

use super::row::ServiceSample;

/// Outcome of one sampling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub launched: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Errors that skip a whole cycle.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("service enumeration failed: {0:#}")]
    Enumeration(anyhow::Error),
}

/// Drives periodic sampling cycles.
///
/// Each cycle enumerates services, samples all of them concurrently and
/// forwards every successful result to the aggregator. A failing sampler
/// only drops its own service for that cycle.
pub struct CycleCoordinator<D, S> {
    discovery: Arc<D>,
    sampler: Arc<S>,
    window: Duration,
    interval: Duration,
    cycle_timeout: Option<Duration>,
    results: mpsc::Sender<ServiceSample>,
    health: Option<Arc<HealthMetrics>>,
}

impl<D, S> CycleCoordinator<D, S>
where
    D: Discovery + 'static,
    S: Sampler,
{
    pub fn new(
        discovery: Arc<D>,
        sampler: Arc<S>,
        cfg: &SamplingConfig,
        results: mpsc::Sender<ServiceSample>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            discovery,
            sampler,
            window: cfg.window,
            interval: cfg.interval,
            cycle_timeout: cfg.cycle_timeout,
            results,
            health,
        }
    }

    /// Runs one cycle to completion.
    ///
    /// Waits for every launched sampler unless a cycle timeout is configured,
    /// in which case samplers still running at the deadline are aborted and
    /// counted as failed.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, CycleError> {
        let started = Instant::now();

        let discovery = Arc::clone(&self.discovery);
        let services = match tokio::task::spawn_blocking(move || discovery.discover()).await {
            Ok(found) => found.map_err(CycleError::Enumeration)?,
            Err(e) => {
                return Err(CycleError::Enumeration(anyhow::anyhow!(
                    "discovery task failed: {e}"
                )))
            }
        };

        if let Some(health) = &self.health {
            health.services_discovered.set(services.len() as f64);
        }

        if cancel.is_cancelled() {
            debug!("shutdown requested, skipping sampler launch");
            return Ok(CycleReport::default());
        }

        let mut tasks = JoinSet::new();
        for identity in services {
            let sampler = Arc::clone(&self.sampler);
            let window = self.window;
            tasks.spawn(async move {
                let result = sampler.sample(identity.pid, window).await;
                (identity, result)
            });
        }

        let mut report = CycleReport {
            launched: tasks.len(),
            ..Default::default()
        };
        let deadline = self.cycle_timeout.map(|timeout| started + timeout);

        loop {
            let joined = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            let aborted = tasks.len();
                            tasks.abort_all();
                            warn!(aborted, "cycle timeout reached, aborting samplers");
                            report.failed += aborted;
                            break;
                        }
                    }
                }
                None => tasks.join_next().await,
            };

            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((identity, Ok(usage))) => {
                    report.succeeded += 1;
                    let sample = ServiceSample {
                        identity,
                        usage,
                        measured_at: SystemTime::now(),
                    };
                    if self.results.send(sample).await.is_err() {
                        debug!("aggregator stopped, dropping sample");
                    }
                }
                Ok((identity, Err(e))) => {
                    report.failed += 1;
                    warn!(
                        service = %identity.name,
                        pid = identity.pid,
                        error = %e,
                        "sampling failed",
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, "sampler task failed");
                }
            }
        }

        if let Some(health) = &self.health {
            health.cycles.inc();
            health
                .cycle_duration
                .observe(started.elapsed().as_secs_f64());
            health
                .samples
                .with_label_values(&["ok"])
                .inc_by(report.succeeded as f64);
            health
                .samples
                .with_label_values(&["failed"])
                .inc_by(report.failed as f64);
        }

        Ok(report)
    }

    /// Starts the cycle loop. A cycle in progress when `cancel` fires runs to
    /// completion; no further cycle is launched.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match self.run_cycle(&cancel).await {
                            Ok(report) => debug!(
                                launched = report.launched,
                                succeeded = report.succeeded,
                                failed = report.failed,
                                "sampling cycle complete",
                            ),
                            Err(e) => {
                                warn!(error = %e, "skipping sampling cycle");
                                if let Some(health) = &self.health {
                                    health.enumeration_failures.inc();
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}
