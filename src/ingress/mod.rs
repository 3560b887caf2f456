//! HTTP ingress for externally submitted events.
//!
//! Events arrive as JSON on `POST /events` (or `/incoming`). Each data entry
//! becomes one row. Buffered events join the shared row buffer, while events
//! flagged `send_immediately` are uploaded synchronously and the sink outcome
//! is returned in the response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::export::health::{bind_address, HealthMetrics};
use crate::pipeline::row::{EventContext, Row, UploadBatch};
use crate::pipeline::{Pipeline, RowSource};
use crate::sink::is_identifier;

/// A user-submitted event.
#[derive(Debug, Deserialize)]
pub struct Event {
    /// Destination table for every row of the event.
    #[serde(default)]
    pub table: String,

    #[serde(default)]
    pub node_type: String,

    #[serde(default)]
    pub hostname: String,

    /// Bypass the buffer and upload before responding.
    #[serde(default)]
    pub send_immediately: bool,

    /// Deadline for an immediate upload, e.g. "3s".
    #[serde(default)]
    pub upload_timeout: Option<String>,

    #[serde(default)]
    pub data: EventData,
}

/// Event payload: a single object or a list of objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Many(Vec<Map<String, Value>>),
    One(Map<String, Value>),
}

impl Default for EventData {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl EventData {
    pub fn len(&self) -> usize {
        match self {
            Self::Many(entries) => entries.len(),
            Self::One(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_entries(self) -> Vec<Map<String, Value>> {
        match self {
            Self::Many(entries) => entries,
            Self::One(entry) => vec![entry],
        }
    }
}

/// Reasons an event is rejected before entering the pipeline.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing table")]
    MissingTable,

    #[error("invalid table name {0:?}")]
    InvalidTable(String),

    #[error("data must not be empty")]
    EmptyData,

    #[error("missing node_type")]
    MissingNodeType,

    #[error("missing hostname")]
    MissingHostname,
}

impl Event {
    /// Checks the required event headers.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.table.is_empty() {
            return Err(ValidationError::MissingTable);
        }
        if !is_identifier(&self.table) {
            return Err(ValidationError::InvalidTable(self.table.clone()));
        }
        if self.data.is_empty() {
            return Err(ValidationError::EmptyData);
        }
        if self.node_type.is_empty() {
            return Err(ValidationError::MissingNodeType);
        }
        if self.hostname.is_empty() {
            return Err(ValidationError::MissingHostname);
        }
        Ok(())
    }
}

/// Parses an event's upload timeout, falling back to `default`.
pub fn resolve_timeout(raw: Option<&str>, default: Duration) -> Duration {
    let raw = match raw.map(str::trim) {
        None | Some("") => return default,
        Some(raw) => raw,
    };

    match humantime::parse_duration(raw) {
        Ok(timeout) if !timeout.is_zero() => timeout,
        Ok(_) => {
            warn!(upload_timeout = raw, "zero upload timeout, using default");
            default
        }
        Err(e) => {
            warn!(upload_timeout = raw, error = %e, "unparseable upload timeout, using default");
            default
        }
    }
}

/// Shared state for the ingress handlers.
pub struct IngressState {
    pipeline: Arc<Pipeline>,
    immediate_timeout: Duration,
    cluster_id: String,
    event_stream_table: Option<String>,
    health: Option<Arc<HealthMetrics>>,
}

impl IngressState {
    pub fn new(
        pipeline: Arc<Pipeline>,
        immediate_timeout: Duration,
        cluster_id: String,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            pipeline,
            immediate_timeout,
            cluster_id,
            event_stream_table: None,
            health,
        }
    }

    /// Records one index row per accepted event in `table`. An empty name
    /// disables it.
    pub fn with_event_stream(mut self, table: impl Into<String>) -> Self {
        let table = table.into();
        self.event_stream_table = (!table.is_empty()).then_some(table);
        self
    }
}

/// Decodes, validates and dispatches one request body.
pub async fn process_event(state: &IngressState, body: &[u8]) -> (StatusCode, String) {
    let event: Event = match serde_json::from_slice(body) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "rejecting malformed event");
            return (
                StatusCode::BAD_REQUEST,
                "Unable to unmarshal user input".to_string(),
            );
        }
    };

    if let Err(e) = event.validate() {
        debug!(error = %e, "rejecting invalid event");
        return (StatusCode::BAD_REQUEST, format!("Bad request: {e}"));
    }

    let timeout = resolve_timeout(event.upload_timeout.as_deref(), state.immediate_timeout);
    let event_id = Uuid::new_v4().to_string();
    let ctx = EventContext {
        table: &event.table,
        hostname: &event.hostname,
        node_type: &event.node_type,
        event_id: &event_id,
        cluster_id: &state.cluster_id,
        received_at: SystemTime::now(),
    };

    let entries = event.data.into_entries();
    let mut rows: Vec<Row> = Vec::with_capacity(entries.len() + 1);
    if let Some(stream_table) = &state.event_stream_table {
        rows.push(Row::event_stream(&ctx, stream_table));
    }
    rows.extend(entries.into_iter().map(|entry| Row::from_event(&ctx, entry)));

    if !event.send_immediately {
        state.pipeline.append_all(rows, RowSource::Event);
        return (StatusCode::OK, "OK".to_string());
    }

    let count = rows.len();
    match state
        .pipeline
        .submit_immediate(UploadBatch::new(rows), timeout)
        .await
    {
        Ok(()) => {
            debug!(table = %event.table, rows = count, "immediate event uploaded");
            (StatusCode::OK, "OK".to_string())
        }
        Err(e) => {
            warn!(table = %event.table, rows = count, error = %e, "immediate event upload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal server error: {e}"),
            )
        }
    }
}

async fn events_handler(
    State(state): State<Arc<IngressState>>,
    body: Bytes,
) -> (StatusCode, String) {
    let (status, message) = process_event(&state, &body).await;

    if let Some(health) = &state.health {
        health
            .ingress_requests
            .with_label_values(&[status.as_str()])
            .inc();
    }

    (status, message)
}

/// HTTP server accepting events.
pub struct IngressServer {
    addr: String,
    state: Arc<IngressState>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl IngressServer {
    pub fn new(addr: &str, state: IngressState) -> Self {
        Self {
            addr: addr.to_string(),
            state: Arc::new(state),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener and serves in the background.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr, ":9123");

        let app = Router::new()
            .route("/events", post(events_handler))
            .route("/incoming", post(events_handler))
            .with_state(Arc::clone(&self.state));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            info!(addr = %local_addr, "event ingress server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "event ingress server error");
            }
        });

        Ok(local_addr)
    }

    /// Stops accepting new requests.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}
