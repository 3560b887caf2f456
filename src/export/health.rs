use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "unitwatch";

/// Prometheus metrics for agent health and pipeline observability.
///
/// All metrics use the "unitwatch" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Sampling ===
    /// Completed sampling cycles.
    pub cycles: Counter,
    /// Wall-clock duration of a sampling cycle.
    pub cycle_duration: Histogram,
    /// Services found by the latest enumeration.
    pub services_discovered: Gauge,
    /// Sampler outcomes by result (ok/failed).
    pub samples: CounterVec,
    /// Cycles skipped because enumeration failed.
    pub enumeration_failures: Counter,

    // === Buffer ===
    /// Rows appended to the buffer by source (sampler/event).
    pub rows_appended: CounterVec,
    /// Rows currently buffered.
    pub rows_buffered: Gauge,
    /// Flushes by trigger (size/time/drain).
    pub flushes: CounterVec,
    /// Rows per flushed batch.
    pub flush_batch_size: Histogram,

    // === Upload ===
    /// Per-sink put duration.
    pub upload_duration: HistogramVec,
    /// Per-sink put failures.
    pub upload_errors: CounterVec,
    /// ClickHouse insert duration by table.
    pub clickhouse_insert_duration: HistogramVec,
    /// ClickHouse insert failures by table.
    pub clickhouse_insert_errors: CounterVec,

    // === Ingress ===
    /// Immediate submissions by result (ok/failed).
    pub immediate_submissions: CounterVec,
    /// Ingress requests by HTTP status code.
    pub ingress_requests: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let cycles = Counter::with_opts(
            Opts::new("cycles_total", "Completed sampling cycles.").namespace(NAMESPACE),
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Wall-clock duration of a sampling cycle.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.5, 1.0, 2.0, 3.0, 5.0, 10.0, 30.0]),
        )?;
        let services_discovered = Gauge::with_opts(
            Opts::new(
                "services_discovered",
                "Services found by the latest enumeration.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples = CounterVec::new(
            Opts::new("samples_total", "Sampler outcomes by result.").namespace(NAMESPACE),
            &["result"],
        )?;
        let enumeration_failures = Counter::with_opts(
            Opts::new(
                "enumeration_failures_total",
                "Cycles skipped because service enumeration failed.",
            )
            .namespace(NAMESPACE),
        )?;
        let rows_appended = CounterVec::new(
            Opts::new("rows_appended_total", "Rows appended to the buffer by source.")
                .namespace(NAMESPACE),
            &["source"],
        )?;
        let rows_buffered = Gauge::with_opts(
            Opts::new("rows_buffered", "Rows currently buffered.").namespace(NAMESPACE),
        )?;
        let flushes = CounterVec::new(
            Opts::new("flushes_total", "Buffer flushes by trigger.").namespace(NAMESPACE),
            &["trigger"],
        )?;
        let flush_batch_size = Histogram::with_opts(
            HistogramOpts::new("flush_batch_size", "Rows per flushed batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
        )?;
        let upload_duration = HistogramVec::new(
            HistogramOpts::new("upload_duration_seconds", "Per-sink put duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["sink"],
        )?;
        let upload_errors = CounterVec::new(
            Opts::new("upload_errors_total", "Per-sink put failures.").namespace(NAMESPACE),
            &["sink"],
        )?;
        let clickhouse_insert_duration = HistogramVec::new(
            HistogramOpts::new(
                "clickhouse_insert_duration_seconds",
                "ClickHouse insert duration by table.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
            &["table"],
        )?;
        let clickhouse_insert_errors = CounterVec::new(
            Opts::new(
                "clickhouse_insert_errors_total",
                "ClickHouse insert failures by table.",
            )
            .namespace(NAMESPACE),
            &["table"],
        )?;
        let immediate_submissions = CounterVec::new(
            Opts::new(
                "immediate_submissions_total",
                "Immediate event submissions by result.",
            )
            .namespace(NAMESPACE),
            &["result"],
        )?;
        let ingress_requests = CounterVec::new(
            Opts::new("ingress_requests_total", "Ingress requests by status code.")
                .namespace(NAMESPACE),
            &["status"],
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(services_discovered.clone()))?;
        registry.register(Box::new(samples.clone()))?;
        registry.register(Box::new(enumeration_failures.clone()))?;
        registry.register(Box::new(rows_appended.clone()))?;
        registry.register(Box::new(rows_buffered.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_batch_size.clone()))?;
        registry.register(Box::new(upload_duration.clone()))?;
        registry.register(Box::new(upload_errors.clone()))?;
        registry.register(Box::new(clickhouse_insert_duration.clone()))?;
        registry.register(Box::new(clickhouse_insert_errors.clone()))?;
        registry.register(Box::new(immediate_submissions.clone()))?;
        registry.register(Box::new(ingress_requests.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            cycles,
            cycle_duration,
            services_discovered,
            samples,
            enumeration_failures,
            rows_appended,
            rows_buffered,
            flushes,
            flush_batch_size,
            upload_duration,
            upload_errors,
            clickhouse_insert_duration,
            clickhouse_insert_errors,
            immediate_submissions,
            ingress_requests,
        })
    }

    /// Encodes all registered metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr, ":9090");

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Resolves a listen address, expanding the ":port" shorthand to all interfaces.
pub fn bind_address(addr: &str, default: &str) -> String {
    let addr = if addr.is_empty() { default } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn render_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
