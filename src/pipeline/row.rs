use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::pid::ServiceIdentity;
use crate::sampler::CpuUsage;

/// Keys of event data that map onto fixed row columns.
pub const FIELD_NAME: &str = "name";
pub const FIELD_INSTANCE: &str = "instance";
pub const FIELD_HOSTNAME: &str = "hostname";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_USER: &str = "user_cpu_usage";
pub const FIELD_SYSTEM: &str = "system_cpu_usage";
pub const FIELD_TOTAL: &str = "total_cpu_usage";

/// Keys filled from the event itself. Same-named data keys are dropped so
/// every encoded row carries each key once.
const RESERVED_FIELDS: &[&str] = &["table", "node_type", "event_id", "cluster_id"];

/// A completed measurement of one service.
#[derive(Debug, Clone)]
pub struct ServiceSample {
    pub identity: ServiceIdentity,
    pub usage: CpuUsage,
    pub measured_at: SystemTime,
}

/// One flattened measurement record.
///
/// `table` is `None` for sampled rows, which go to the sink's default table.
/// Free-form event fields live in `extra` and are checked against each sink's
/// accepted field set when uploaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub table: Option<String>,
    pub name: String,
    pub instance: String,
    pub user_cpu_usage: f64,
    pub system_cpu_usage: f64,
    pub total_cpu_usage: f64,
    pub hostname: String,
    pub timestamp: SystemTime,
    pub extra: Map<String, Value>,
}

/// Event-level values applied to every row of one ingested event.
#[derive(Debug, Clone)]
pub struct EventContext<'a> {
    pub table: &'a str,
    pub hostname: &'a str,
    pub node_type: &'a str,
    pub event_id: &'a str,
    pub cluster_id: &'a str,
    pub received_at: SystemTime,
}

impl EventContext<'_> {
    fn insert_fields(&self, extra: &mut Map<String, Value>) {
        extra.insert("node_type".to_string(), Value::from(self.node_type));
        extra.insert("event_id".to_string(), Value::from(self.event_id));
        if !self.cluster_id.is_empty() {
            extra.insert("cluster_id".to_string(), Value::from(self.cluster_id));
        }
    }
}

impl Row {
    /// Builds a row from a sampler result.
    pub fn from_sample(sample: &ServiceSample, hostname: &str) -> Self {
        Self {
            table: None,
            name: sample.identity.name.clone(),
            instance: sample.identity.pid.to_string(),
            user_cpu_usage: sample.usage.user_pct,
            system_cpu_usage: sample.usage.system_pct,
            total_cpu_usage: sample.usage.total_pct,
            hostname: hostname.to_string(),
            timestamp: sample.measured_at,
            extra: Map::new(),
        }
    }

    /// Builds a row from one data entry of an ingested event.
    ///
    /// Known keys fill the fixed columns; every other key is kept in `extra`
    /// next to the event's node type, id and cluster id, which replace any
    /// user-supplied values. Rows are stamped with the receive time.
    pub fn from_event(ctx: &EventContext<'_>, mut data: Map<String, Value>) -> Self {
        let name = data
            .remove(FIELD_NAME)
            .map(value_to_string)
            .unwrap_or_default();
        let instance = data
            .remove(FIELD_INSTANCE)
            .map(value_to_string)
            .unwrap_or_default();
        let hostname = match data.remove(FIELD_HOSTNAME).map(value_to_string) {
            Some(h) if !h.is_empty() => h,
            _ => ctx.hostname.to_string(),
        };
        data.remove(FIELD_TIMESTAMP);

        let user = data.remove(FIELD_USER).and_then(|v| v.as_f64()).unwrap_or(0.0);
        let system = data
            .remove(FIELD_SYSTEM)
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let total = data
            .remove(FIELD_TOTAL)
            .and_then(|v| v.as_f64())
            .unwrap_or(user + system);

        for key in RESERVED_FIELDS {
            if data.remove(*key).is_some() {
                tracing::debug!(key = *key, "dropping reserved event field");
            }
        }

        ctx.insert_fields(&mut data);

        Self {
            table: Some(ctx.table.to_string()),
            name,
            instance,
            user_cpu_usage: user,
            system_cpu_usage: system,
            total_cpu_usage: total,
            hostname,
            timestamp: ctx.received_at,
            extra: data,
        }
    }

    /// Builds the index row recorded once per accepted event in
    /// `stream_table`. `name` holds the event's own table.
    pub fn event_stream(ctx: &EventContext<'_>, stream_table: &str) -> Self {
        let mut extra = Map::new();
        ctx.insert_fields(&mut extra);

        Self {
            table: Some(stream_table.to_string()),
            name: ctx.table.to_string(),
            instance: String::new(),
            user_cpu_usage: 0.0,
            system_cpu_usage: 0.0,
            total_cpu_usage: 0.0,
            hostname: ctx.hostname.to_string(),
            timestamp: ctx.received_at,
            extra,
        }
    }

    /// Returns the destination table, falling back to `default_table`.
    pub fn table_or<'a>(&'a self, default_table: &'a str) -> &'a str {
        self.table.as_deref().unwrap_or(default_table)
    }

    /// Returns a serializable view with `extra` flattened into the object.
    pub fn to_json<'a>(&'a self, default_table: &'a str) -> RowJson<'a> {
        RowJson {
            table: self.table_or(default_table),
            name: &self.name,
            instance: &self.instance,
            user_cpu_usage: self.user_cpu_usage,
            system_cpu_usage: self.system_cpu_usage,
            total_cpu_usage: self.total_cpu_usage,
            hostname: &self.hostname,
            timestamp: format_datetime(self.timestamp),
            extra: &self.extra,
        }
    }
}

/// JSON shape of a row as sent to sinks.
#[derive(Debug, Serialize)]
pub struct RowJson<'a> {
    pub table: &'a str,
    pub name: &'a str,
    pub instance: &'a str,
    pub user_cpu_usage: f64,
    pub system_cpu_usage: f64,
    pub total_cpu_usage: f64,
    pub hostname: &'a str,
    pub timestamp: String,
    #[serde(flatten)]
    pub extra: &'a Map<String, Value>,
}

fn value_to_string(v: Value) -> String {
    match v {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Immutable snapshot of rows handed to the uploader.
///
/// Cloning shares the underlying rows.
#[derive(Debug, Clone)]
pub struct UploadBatch {
    rows: Arc<[Row]>,
}

impl UploadBatch {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into() }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl From<Row> for UploadBatch {
    fn from(row: Row) -> Self {
        Self::new(vec![row])
    }
}

/// Formats a SystemTime as "YYYY-MM-DD HH:MM:SS.mmm" in UTC.
pub fn format_datetime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
