use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sink::is_identifier;

/// Top-level configuration for the unitwatch agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Sampling cadence configuration.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Row buffer flush thresholds.
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Upload timeouts.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Service discovery configuration.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Upload sink configuration.
    #[serde(default)]
    pub sinks: SinksConfig,

    /// Event ingress HTTP server configuration.
    #[serde(default)]
    pub ingress: IngressConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Hostname stamped on sampled rows. Read from the kernel when empty.
    #[serde(default)]
    pub hostname: String,

    /// Cluster identifier attached to ingested events.
    #[serde(default)]
    pub meta_cluster_id: String,
}

/// Sampling cadence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// CPU measurement window per service. Default: 2s.
    #[serde(default = "default_sampling_window", with = "humantime_serde")]
    pub window: Duration,

    /// Time between sampling cycles. Default: 3s.
    #[serde(default = "default_sampling_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound on one cycle's fan-out. Unbounded when unset.
    #[serde(default, with = "humantime_serde")]
    pub cycle_timeout: Option<Duration>,
}

/// Row buffer flush thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Flush once this many rows are buffered. Default: 1000.
    #[serde(default = "default_size_threshold")]
    pub size_threshold: usize,

    /// Flush once this much time passed since the last flush. Default: 10s.
    #[serde(default = "default_time_threshold", with = "humantime_serde")]
    pub time_threshold: Duration,

    /// How often the aggregator re-checks the time threshold. Default: 1s.
    #[serde(default = "default_idle_tick", with = "humantime_serde")]
    pub idle_tick: Duration,

    /// Capacity of the sampler result channel. Default: 1024.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Upload timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Per-sink bound on a single put. Default: 30s.
    #[serde(default = "default_put_timeout", with = "humantime_serde")]
    pub put_timeout: Duration,

    /// Timeout for immediate submissions without their own. Default: 5s.
    #[serde(default = "default_immediate_timeout", with = "humantime_serde")]
    pub immediate_timeout: Duration,
}

/// Service discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Enumerate running systemd services. Default: true.
    #[serde(default = "default_true")]
    pub systemd: bool,

    /// Process names to discover by scanning /proc.
    #[serde(default)]
    pub process_names: Vec<String>,

    /// Cgroup v2 path containing target processes.
    #[serde(default)]
    pub cgroup_path: String,

    /// Unit name prefixes to skip. Default: ["ssh@"].
    #[serde(default = "default_exclude_prefixes")]
    pub exclude_prefixes: Vec<String>,
}

/// Upload sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinksConfig {
    /// Table used for sampled rows and events without one. Default: "service_cpu_usage".
    #[serde(default = "default_table")]
    pub default_table: String,

    /// Table receiving one index row per ingested event. Empty disables it.
    #[serde(default)]
    pub event_stream_table: String,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// HTTP NDJSON export configuration.
    #[serde(default)]
    pub http: HttpExportConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Enable the ClickHouse sink. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Create the default table on startup if missing. Default: false.
    #[serde(default)]
    pub create_table: bool,

    /// String columns accepted from free-form event fields.
    #[serde(default)]
    pub extra_columns: Vec<String>,
}

/// HTTP export configuration (e.g., for Vector).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpExportConfig {
    /// Enable the HTTP sink. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint to send data to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib, snappy). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Request timeout enforced by the HTTP client. Default: 30s.
    #[serde(default = "default_http_export_timeout", with = "humantime_serde")]
    pub export_timeout: Duration,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

/// Event ingress HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    /// Serve POST /events and /incoming. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9123".
    #[serde(default = "default_ingress_addr")]
    pub addr: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_sampling_window() -> Duration {
    Duration::from_secs(2)
}

fn default_sampling_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_size_threshold() -> usize {
    1000
}

fn default_time_threshold() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_put_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_immediate_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_exclude_prefixes() -> Vec<String> {
    vec!["ssh@".to_string()]
}

fn default_table() -> String {
    "service_cpu_usage".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_http_export_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ingress_addr() -> String {
    ":9123".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            buffer: BufferConfig::default(),
            upload: UploadConfig::default(),
            discovery: DiscoveryConfig::default(),
            sinks: SinksConfig::default(),
            ingress: IngressConfig::default(),
            health: HealthConfig::default(),
            hostname: String::new(),
            meta_cluster_id: String::new(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            window: default_sampling_window(),
            interval: default_sampling_interval(),
            cycle_timeout: None,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size_threshold: default_size_threshold(),
            time_threshold: default_time_threshold(),
            idle_tick: default_idle_tick(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            put_timeout: default_put_timeout(),
            immediate_timeout: default_immediate_timeout(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            systemd: true,
            process_names: Vec::new(),
            cgroup_path: String::new(),
            exclude_prefixes: default_exclude_prefixes(),
        }
    }
}

impl Default for SinksConfig {
    fn default() -> Self {
        Self {
            default_table: default_table(),
            event_stream_table: String::new(),
            clickhouse: ClickHouseConfig::default(),
            http: HttpExportConfig::default(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            create_table: false,
            extra_columns: Vec::new(),
        }
    }
}

impl Default for HttpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            export_timeout: default_http_export_timeout(),
            keep_alive: true,
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_ingress_addr(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg = Self::parse_file(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a YAML file without validating it.
    pub fn parse_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Validate the configuration for required fields and consistency.
    ///
    /// `allow_no_sinks` skips the sink requirement for dry runs, where the
    /// in-memory sink replaces every configured one.
    pub fn validate_with(&self, allow_no_sinks: bool) -> Result<()> {
        if self.sampling.window.is_zero() {
            bail!("sampling.window must be positive");
        }
        if self.sampling.interval.is_zero() {
            bail!("sampling.interval must be positive");
        }
        if self.sampling.cycle_timeout.is_some_and(|t| t.is_zero()) {
            bail!("sampling.cycle_timeout must be positive when set");
        }

        if self.buffer.size_threshold == 0 {
            bail!("buffer.size_threshold must be positive");
        }
        if self.buffer.time_threshold.is_zero() {
            bail!("buffer.time_threshold must be positive");
        }
        if self.buffer.idle_tick.is_zero() {
            bail!("buffer.idle_tick must be positive");
        }
        if self.buffer.channel_capacity == 0 {
            bail!("buffer.channel_capacity must be positive");
        }

        if self.upload.put_timeout.is_zero() {
            bail!("upload.put_timeout must be positive");
        }
        if self.upload.immediate_timeout.is_zero() {
            bail!("upload.immediate_timeout must be positive");
        }

        if self.sinks.default_table.is_empty() {
            bail!("sinks.default_table is required");
        }
        let stream_table = &self.sinks.event_stream_table;
        if !stream_table.is_empty() && !is_identifier(stream_table) {
            bail!("invalid sinks.event_stream_table: {stream_table:?}");
        }

        if !allow_no_sinks && !self.sinks.clickhouse.enabled && !self.sinks.http.enabled {
            bail!("at least one sink must be enabled");
        }

        if self.sinks.clickhouse.enabled && self.sinks.clickhouse.endpoint.is_empty() {
            bail!("clickhouse endpoint is required when enabled");
        }

        if self.sinks.http.enabled {
            if self.sinks.http.address.is_empty() {
                bail!("http address is required when enabled");
            }
            if self.sinks.http.export_timeout.is_zero() {
                bail!("http export_timeout must be positive when enabled");
            }

            let compression = &self.sinks.http.compression;
            match compression.as_str() {
                "none" | "gzip" | "zstd" | "zlib" | "snappy" => {}
                _ => bail!("invalid compression type: {compression}"),
            }
        }

        Ok(())
    }

    /// Validate with at least one sink required.
    pub fn validate(&self) -> Result<()> {
        self.validate_with(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            sinks: SinksConfig {
                http: HttpExportConfig {
                    enabled: true,
                    address: "http://localhost:8080".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.sampling.window, Duration::from_secs(2));
        assert_eq!(cfg.sampling.interval, Duration::from_secs(3));
        assert_eq!(cfg.buffer.size_threshold, 1000);
        assert_eq!(cfg.buffer.time_threshold, Duration::from_secs(10));
        assert_eq!(cfg.upload.immediate_timeout, Duration::from_secs(5));
        assert_eq!(cfg.ingress.addr, ":9123");
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.discovery.exclude_prefixes, vec!["ssh@".to_string()]);
        assert!(cfg.sampling.cycle_timeout.is_none());
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_requires_a_sink() {
        let err = Config::default().validate().expect_err("should fail");
        assert!(err.to_string().contains("at least one sink"));
        assert!(Config::default().validate_with(true).is_ok());
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut cfg = valid_config();
        cfg.sampling.window = Duration::ZERO;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("sampling.window"));
    }

    #[test]
    fn test_zero_thresholds_rejected() {
        let mut cfg = valid_config();
        cfg.buffer.size_threshold = 0;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("size_threshold"));

        let mut cfg = valid_config();
        cfg.buffer.time_threshold = Duration::ZERO;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("time_threshold"));
    }

    #[test]
    fn test_zero_cycle_timeout_rejected() {
        let mut cfg = valid_config();
        cfg.sampling.cycle_timeout = Some(Duration::ZERO);
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("cycle_timeout"));
    }

    #[test]
    fn test_event_stream_table_must_be_identifier() {
        let mut cfg = valid_config();
        cfg.sinks.event_stream_table = "event_stream".to_string();
        assert!(cfg.validate().is_ok());

        cfg.sinks.event_stream_table = "event-stream".to_string();
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("event_stream_table"));
    }

    #[test]
    fn test_invalid_compression_rejected() {
        let mut cfg = valid_config();
        cfg.sinks.http.compression = "brotli".to_string();
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("invalid compression type"));
    }

    #[test]
    fn test_clickhouse_requires_endpoint() {
        let mut cfg = valid_config();
        cfg.sinks.clickhouse.enabled = true;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("clickhouse endpoint"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
sampling:
  window: 500ms
  interval: 5s
  cycle_timeout: 4s
buffer:
  size_threshold: 3
  time_threshold: 1m
upload:
  immediate_timeout: 2s
discovery:
  systemd: false
  process_names: ["nginx"]
sinks:
  default_table: cpu
  clickhouse:
    enabled: true
    endpoint: "localhost:9000"
    extra_columns: ["node_type", "event_id"]
meta_cluster_id: "cluster-a"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        assert_eq!(cfg.sampling.window, Duration::from_millis(500));
        assert_eq!(cfg.sampling.cycle_timeout, Some(Duration::from_secs(4)));
        assert_eq!(cfg.buffer.size_threshold, 3);
        assert_eq!(cfg.buffer.time_threshold, Duration::from_secs(60));
        assert_eq!(cfg.buffer.idle_tick, Duration::from_secs(1));
        assert_eq!(cfg.upload.immediate_timeout, Duration::from_secs(2));
        assert!(!cfg.discovery.systemd);
        assert_eq!(cfg.discovery.process_names, vec!["nginx".to_string()]);
        assert_eq!(cfg.sinks.default_table, "cpu");
        assert_eq!(cfg.sinks.clickhouse.extra_columns.len(), 2);
        assert_eq!(cfg.meta_cluster_id, "cluster-a");
        assert!(cfg.validate().is_ok());
    }
}
