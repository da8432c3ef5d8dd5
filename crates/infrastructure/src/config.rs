use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_client_id() -> String {
    "rtk-controller".to_string()
}

fn default_keep_alive() -> u64 {
    20
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_path() -> String {
    "data/controller.sled".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchemaConfig {
    #[serde(default)]
    pub schema_dir: Option<String>,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default)]
    pub strict: bool,
}

fn default_cache_size() -> usize {
    1024
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Retention horizon for `mqtt_log:` entries only (default 1 day / 24h).
    /// `event:` retention is tracked separately by `ControllerConfig::event_retention_days`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default)]
    pub excluded_topics: Vec<String>,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

fn default_batch_size() -> usize {
    100
}

fn default_retention_days() -> u64 {
    1
}

fn default_max_payload_bytes() -> usize {
    256 * 1024
}

fn default_purge_interval_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CommandConfig {
    #[serde(default = "default_command_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_command_max_timeout_ms")]
    pub max_timeout_ms: u64,
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_command_max_timeout_ms() -> u64 {
    600_000
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TopologyConfig {
    #[serde(default = "default_edge_staleness")]
    pub edge_staleness_secs: u64,
    #[serde(default = "default_edge_expiry")]
    pub edge_expiry_secs: u64,
}

fn default_edge_staleness() -> u64 {
    600
}

fn default_edge_expiry() -> u64 {
    3_600
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ControllerConfig {
    pub tenant: String,
    pub site: String,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub command: CommandConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default = "default_skew_window")]
    pub skew_window_secs: i64,
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_secs: u64,
    #[serde(default = "default_storage_failure_budget")]
    pub storage_failure_budget: u32,
    /// Retention for the `event:` keyspace (C9), separate from the
    /// `mqtt_log:` retention in `log.retention_days` (C4) — the spec gives
    /// each its own default (24h vs 30 days).
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: u64,
}

fn default_event_retention_days() -> u64 {
    30
}

fn default_skew_window() -> i64 {
    5
}

fn default_flush_timeout() -> u64 {
    10
}

fn default_storage_failure_budget() -> u32 {
    100
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            schema_dir: None,
            cache_size: default_cache_size(),
            strict: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            retention_days: default_retention_days(),
            excluded_topics: Vec::new(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_command_timeout_ms(),
            max_timeout_ms: default_command_max_timeout_ms(),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            edge_staleness_secs: default_edge_staleness(),
            edge_expiry_secs: default_edge_expiry(),
        }
    }
}

impl ControllerConfig {
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .set_default("mqtt.host", "localhost")?
            .set_default("mqtt.port", 1883)?
            .add_source(File::with_name(&format!("{config_dir}/default")).required(true))
            .add_source(File::with_name(&format!("{config_dir}/{run_mode}")).required(false))
            .add_source(Environment::with_prefix("RTK").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
