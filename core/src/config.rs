use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ConfigError;

/// Placeholder substituted with the partition identifier in `target-template`.
pub const PARTITION_PLACEHOLDER: &str = "{partition}";

/// Rows per flush; a DuckDB row group holds 122_880 rows.
pub const DEFAULT_BATCH_SIZE: usize = 122_880;
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_PARTITION_COUNT: usize = 4;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SinkConfig {
    /// Database location, optionally containing `{partition}`.
    /// Without the placeholder the sink runs with a single partition.
    pub target_template: String,
    pub table_name: String,
    #[serde(default)]
    pub create_table_statement: Option<String>,
    #[serde(default)]
    pub table_creation: TableCreationPolicy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    #[serde(default = "default_partition_count")]
    pub partition_count: usize,
    #[serde(default)]
    pub write_mode: WriteMode,
    #[serde(default)]
    pub checkpoint_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableCreationPolicy {
    /// Run the statement on every partition build; it must be idempotent.
    #[default]
    AlwaysExecute,
    /// Run the statement only when the target did not exist before connecting.
    OnceIfNew,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Columnar insert with a row-by-row fallback.
    #[default]
    Bulk,
    /// Row-by-row inserts only.
    Row,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_flush_timeout_ms() -> u64 {
    DEFAULT_FLUSH_TIMEOUT_MS
}

fn default_partition_count() -> usize {
    DEFAULT_PARTITION_COUNT
}

pub fn load_config(config_path: Option<&str>) -> anyhow::Result<SinkConfig> {
    match config_path {
        Some(path) => SinkConfig::from_file(path),
        None => SinkConfig::from_env(),
    }
}

impl SinkConfig {
    pub fn new(target_template: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            target_template: target_template.into(),
            table_name: table_name.into(),
            create_table_statement: None,
            table_creation: TableCreationPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            partition_count: DEFAULT_PARTITION_COUNT,
            write_mode: WriteMode::default(),
            checkpoint_path: None,
        }
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SinkConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var("SINK_CONFIG")
            .map_err(|_| anyhow::anyhow!("SINK_CONFIG environment variable not set"))?;
        let config: SinkConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_template.is_empty() {
            return Err(ConfigError::MissingField {
                field: "target-template".to_string(),
            });
        }
        if self.table_name.is_empty() {
            return Err(ConfigError::MissingField {
                field: "table-name".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "batch-size must be at least 1".to_string(),
            });
        }
        if self.partition_count == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "partition-count must be at least 1".to_string(),
            });
        }
        if let Some(statement) = &self.create_table_statement {
            if statement.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    message: "create-table-statement is empty".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn with_create_table_statement(mut self, statement: impl Into<String>) -> Self {
        self.create_table_statement = Some(statement.into());
        self
    }

    pub fn with_table_creation(mut self, policy: TableCreationPolicy) -> Self {
        self.table_creation = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_partition_count(mut self, partition_count: usize) -> Self {
        self.partition_count = partition_count;
        self
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    /// A template without the placeholder names one fixed location.
    pub fn is_single_partition(&self) -> bool {
        !self.target_template.contains(PARTITION_PLACEHOLDER)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}
