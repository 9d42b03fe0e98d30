use serde::Deserialize;

use crate::types::ColumnType;

/// Root application configuration. Loaded from an optional
/// `audience-express.toml` file and environment variables with the prefix
/// `AUDIENCE_EXPRESS__`; environment values win.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Source dataset and field catalog settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    #[serde(default = "default_dataset_path")]
    pub path: String,
    /// Table name raw queries refer to.
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// String columns with more distinct values than this are not categorical.
    #[serde(default = "default_max_categorical_values")]
    pub max_categorical_values: usize,
    #[serde(default = "default_percentage_precision")]
    pub percentage_precision: u32,
    #[serde(default)]
    pub columns: Vec<ColumnOverride>,
}

/// Catalog override for one column: forced type and/or business description.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnOverride {
    pub name: String,
    #[serde(default, rename = "type")]
    pub column_type: Option<ColumnType>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_segments_dir")]
    pub segments_dir: String,
    #[serde(default = "default_schedules_path")]
    pub schedules_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_dir")]
    pub output_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cadence of the due-check loop.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Offset applied to UTC when interpreting daily run times.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorsConfig {
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
    #[serde(default)]
    pub salesforce: EndpointConfig,
    #[serde(default)]
    pub google_ads: EndpointConfig,
    #[serde(default)]
    pub meta_ads: EndpointConfig,
}

/// Credentials and endpoint for one external destination.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
}

// Default functions
fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8000
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_dataset_path() -> String {
    "bank_customer_data.csv".to_string()
}
fn default_table_name() -> String {
    "dataset".to_string()
}
fn default_max_categorical_values() -> usize {
    500
}
fn default_percentage_precision() -> u32 {
    2
}
fn default_query_timeout_ms() -> u64 {
    10_000
}
fn default_segments_dir() -> String {
    "segments".to_string()
}
fn default_schedules_path() -> String {
    "schedules.json".to_string()
}
fn default_export_dir() -> String {
    "exports".to_string()
}
fn default_tick_interval_secs() -> u64 {
    60
}
fn default_delivery_timeout_secs() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_metrics_port(),
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: default_dataset_path(),
            table_name: default_table_name(),
            max_categorical_values: default_max_categorical_values(),
            percentage_precision: default_percentage_precision(),
            columns: Vec::new(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            segments_dir: default_segments_dir(),
            schedules_path: default_schedules_path(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_export_dir(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            tick_interval_secs: default_tick_interval_secs(),
            utc_offset_minutes: 0,
        }
    }
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_secs: default_delivery_timeout_secs(),
            salesforce: EndpointConfig::default(),
            google_ads: EndpointConfig::default(),
            meta_ads: EndpointConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `audience-express.toml` (if present) and the environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from("audience-express")
    }

    /// Load configuration from the given file stem (if present) and the environment.
    pub fn load_from(file: &str) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("AUDIENCE_EXPRESS")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
