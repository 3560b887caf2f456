use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;
use serde_json::Value;

use crate::config::ClickHouseConfig;
use crate::export::health::HealthMetrics;
use crate::pipeline::row::{self, Row, UploadBatch};

use super::is_identifier;

/// Fixed columns present in every table, in insert order.
const FIXED_COLUMNS: &[&str] = &[
    "name",
    "instance",
    "user_cpu_usage",
    "system_cpu_usage",
    "total_cpu_usage",
    "hostname",
    "timestamp",
];

/// ClickHouse batch sink.
///
/// Groups rows by destination table and issues one INSERT per table. Free-form
/// fields are written only for the configured extra columns; anything else is
/// dropped, since the table schema is fixed.
pub struct ClickHouseExporter {
    pool: Pool,
    database: String,
    default_table: String,
    extra_columns: Vec<String>,
    create_table: bool,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseExporter {
    /// Creates a new ClickHouse exporter over an open pool.
    pub fn new(
        pool: Pool,
        cfg: &ClickHouseConfig,
        default_table: String,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            pool,
            database: cfg.database.clone(),
            default_table,
            extra_columns: cfg.extra_columns.clone(),
            create_table: cfg.create_table,
            health,
        }
    }

    pub fn name(&self) -> &str {
        "clickhouse"
    }

    /// Creates the default table when configured to.
    pub async fn start(&mut self) -> Result<()> {
        for column in &self.extra_columns {
            validate_identifier(column).context("invalid extra column")?;
        }
        validate_identifier(&self.default_table).context("invalid default table")?;

        if !self.create_table {
            return Ok(());
        }

        let ddl = create_table_sql(&self.database, &self.default_table, &self.extra_columns);
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse connection")?;
        handle
            .execute(ddl.as_str())
            .await
            .with_context(|| format!("creating table {}", self.default_table))?;

        tracing::info!(table = %self.default_table, "ensured ClickHouse table");

        Ok(())
    }

    /// Inserts a batch, one statement per destination table.
    ///
    /// Every table is attempted even when an earlier one fails; failures are
    /// returned joined.
    pub async fn put(&self, batch: &UploadBatch) -> Result<()> {
        let inserts = plan_inserts(
            &self.database,
            &self.default_table,
            &self.extra_columns,
            batch,
        );
        insert_all(inserts, self.health.as_deref(), |sql| self.execute(sql)).await
    }

    async fn execute(&self, sql: String) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse connection")?;
        handle.execute(sql.as_str()).await?;

        Ok(())
    }
}

/// One INSERT statement for one destination table.
struct TableInsert<'a> {
    table: &'a str,
    rows: usize,
    sql: Result<String>,
}

/// Groups a batch by destination table and builds each table's statement.
fn plan_inserts<'a>(
    database: &str,
    default_table: &'a str,
    extra_columns: &[String],
    batch: &'a UploadBatch,
) -> Vec<TableInsert<'a>> {
    let mut by_table: BTreeMap<&str, Vec<&Row>> = BTreeMap::new();
    for row in batch.rows() {
        by_table
            .entry(row.table_or(default_table))
            .or_default()
            .push(row);
    }

    by_table
        .into_iter()
        .map(|(table, rows)| TableInsert {
            table,
            rows: rows.len(),
            sql: validate_identifier(table)
                .map(|()| insert_sql(database, table, extra_columns, &rows)),
        })
        .collect()
}

/// Runs every planned insert and joins the failures.
async fn insert_all<F, Fut>(
    inserts: Vec<TableInsert<'_>>,
    health: Option<&HealthMetrics>,
    mut execute: F,
) -> Result<()>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut failures = Vec::new();

    for insert in inserts {
        let start = std::time::Instant::now();
        let result = match insert.sql {
            Ok(sql) => execute(sql)
                .await
                .with_context(|| format!("inserting {} rows into {}", insert.rows, insert.table)),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                if let Some(health) = health {
                    health
                        .clickhouse_insert_duration
                        .with_label_values(&[insert.table])
                        .observe(start.elapsed().as_secs_f64());
                }
            }
            Err(e) => {
                tracing::warn!(
                    table = insert.table,
                    rows = insert.rows,
                    error = %e,
                    "ClickHouse insert failed",
                );
                if let Some(health) = health {
                    health
                        .clickhouse_insert_errors
                        .with_label_values(&[insert.table])
                        .inc();
                }
                failures.push(format!("{e:#}"));
            }
        }
    }

    if !failures.is_empty() {
        bail!("{}", failures.join("; "));
    }

    Ok(())
}

/// Builds the INSERT statement for rows of one table.
fn insert_sql(database: &str, table: &str, extra_columns: &[String], rows: &[&Row]) -> String {
    let accepted: HashSet<&str> = extra_columns.iter().map(String::as_str).collect();

    let mut columns = FIXED_COLUMNS.join(", ");
    for column in extra_columns {
        columns.push_str(", ");
        columns.push_str(column);
    }

    let mut sql = String::with_capacity(64 + columns.len() + rows.len() * 160);
    let _ = write!(sql, "INSERT INTO {database}.{table} ({columns}) VALUES ");

    for (idx, row) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let _ = write!(
            sql,
            "('{}', '{}', {}, {}, {}, '{}', {}",
            escape_sql(&row.name),
            escape_sql(&row.instance),
            format_float(row.user_cpu_usage),
            format_float(row.system_cpu_usage),
            format_float(row.total_cpu_usage),
            escape_sql(&row.hostname),
            format_datetime(row.timestamp),
        );

        for column in extra_columns {
            let value = row.extra.get(column).map(extra_value).unwrap_or_default();
            let _ = write!(sql, ", '{}'", escape_sql(&value));
        }
        sql.push(')');

        let dropped = row
            .extra
            .keys()
            .filter(|k| !accepted.contains(k.as_str()))
            .count();
        if dropped > 0 {
            tracing::debug!(table, dropped, "dropping fields without a matching column");
        }
    }

    sql
}

/// Builds the CREATE TABLE statement for a row table.
fn create_table_sql(database: &str, table: &str, extra_columns: &[String]) -> String {
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {database}.{table} (\
         name String, instance String, \
         user_cpu_usage Float64, system_cpu_usage Float64, total_cpu_usage Float64, \
         hostname LowCardinality(String), timestamp DateTime64(3, 'UTC')"
    );
    for column in extra_columns {
        let _ = write!(sql, ", {column} String");
    }
    sql.push_str(") ENGINE = MergeTree ORDER BY (hostname, name, timestamp)");
    sql
}

/// Rejects anything that is not a plain SQL identifier.
fn validate_identifier(name: &str) -> Result<()> {
    if !is_identifier(name) {
        bail!("invalid identifier: {name:?}");
    }
    Ok(())
}

fn extra_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn format_float(v: f64) -> String {
    if v.is_finite() {
        v.to_string()
    } else {
        "0".to_string()
    }
}

/// Formats a SystemTime as a ClickHouse DateTime64(3, 'UTC') literal.
fn format_datetime(t: SystemTime) -> String {
    format!("'{}'", row::format_datetime(t))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;
    use crate::pid::{ServiceIdentity, ServiceKind};
    use crate::pipeline::row::{EventContext, ServiceSample};
    use crate::sampler::CpuUsage;

    #[test]
    fn test_format_datetime() {
        assert_eq!(format_datetime(SystemTime::UNIX_EPOCH), "'1970-01-01 00:00:00.000'");
    }

    #[test]
    fn test_escape_sql() {
        assert_eq!(escape_sql("hello"), "hello");
        assert_eq!(escape_sql("it's"), "it\\'s");
        assert_eq!(escape_sql("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("service_cpu_usage").is_ok());
        assert!(validate_identifier("t2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2t").is_err());
        assert!(validate_identifier("t; DROP TABLE x").is_err());
        assert!(validate_identifier("db.t").is_err());
    }

    #[test]
    fn test_insert_sql_sampled_row() {
        let sample = ServiceSample {
            identity: ServiceIdentity::new("cron.service", 812, ServiceKind::SystemdUnit),
            usage: CpuUsage::new(1.5, 0.5),
            measured_at: SystemTime::UNIX_EPOCH,
        };
        let row = Row::from_sample(&sample, "host-a");
        let sql = insert_sql("default", "service_cpu_usage", &[], &[&row]);
        assert_eq!(
            sql,
            "INSERT INTO default.service_cpu_usage (name, instance, user_cpu_usage, \
             system_cpu_usage, total_cpu_usage, hostname, timestamp) VALUES \
             ('cron.service', '812', 1.5, 0.5, 2, 'host-a', '1970-01-01 00:00:00.000')"
        );
    }

    #[test]
    fn test_insert_sql_extra_columns() {
        let ctx = EventContext {
            table: "events",
            hostname: "n1",
            node_type: "master",
            event_id: "e'1",
            cluster_id: "",
            received_at: SystemTime::UNIX_EPOCH,
        };
        let mut data = Map::new();
        data.insert("ignored".to_string(), json!(5));
        let row = Row::from_event(&ctx, data);

        let extra = vec!["node_type".to_string(), "event_id".to_string(), "phase".to_string()];
        let sql = insert_sql("db", "events", &extra, &[&row]);
        assert!(sql.contains("(name, instance, user_cpu_usage, system_cpu_usage, total_cpu_usage, hostname, timestamp, node_type, event_id, phase)"));
        assert!(sql.ends_with(", 'master', 'e\\'1', '')"));
        assert!(!sql.contains("ignored"));
    }

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql("default", "service_cpu_usage", &["node_type".to_string()]);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS default.service_cpu_usage ("));
        assert!(sql.contains("node_type String"));
        assert!(sql.contains("timestamp DateTime64(3, 'UTC')"));
        assert!(sql.ends_with("ENGINE = MergeTree ORDER BY (hostname, name, timestamp)"));
    }

    fn event_row(table: &str) -> Row {
        let ctx = EventContext {
            table,
            hostname: "n1",
            node_type: "worker",
            event_id: "e1",
            cluster_id: "",
            received_at: SystemTime::UNIX_EPOCH,
        };
        Row::from_event(&ctx, Map::new())
    }

    fn sampled_row() -> Row {
        let sample = ServiceSample {
            identity: ServiceIdentity::new("cron.service", 812, ServiceKind::SystemdUnit),
            usage: CpuUsage::new(1.0, 1.0),
            measured_at: SystemTime::UNIX_EPOCH,
        };
        Row::from_sample(&sample, "host-a")
    }

    #[tokio::test]
    async fn test_invalid_table_does_not_block_other_tables() {
        let batch = UploadBatch::new(vec![sampled_row(), event_row("deploy-events")]);
        let inserts = plan_inserts("db", "service_cpu_usage", &[], &batch);

        let mut executed = Vec::new();
        let err = insert_all(inserts, None, |sql| {
            executed.push(sql);
            std::future::ready(Ok(()))
        })
        .await
        .expect_err("invalid table fails");

        assert_eq!(err.to_string(), "invalid identifier: \"deploy-events\"");
        assert_eq!(executed.len(), 1);
        assert!(executed[0].starts_with("INSERT INTO db.service_cpu_usage "));
    }

    #[tokio::test]
    async fn test_failed_insert_does_not_skip_later_tables() {
        let batch = UploadBatch::new(vec![event_row("beta"), event_row("alpha"), sampled_row()]);
        let inserts = plan_inserts("db", "service_cpu_usage", &[], &batch);

        let mut attempted = Vec::new();
        let err = insert_all(inserts, None, |sql| {
            let failed = sql.contains("db.alpha ");
            attempted.push(sql);
            std::future::ready(if failed {
                Err(anyhow::anyhow!("table is read-only"))
            } else {
                Ok(())
            })
        })
        .await
        .expect_err("alpha fails");

        assert_eq!(attempted.len(), 3);
        assert_eq!(
            err.to_string(),
            "inserting 1 rows into alpha: table is read-only"
        );
    }

    #[test]
    fn test_format_float_non_finite() {
        assert_eq!(format_float(f64::NAN), "0");
        assert_eq!(format_float(2.25), "2.25");
    }
}
