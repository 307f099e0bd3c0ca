//! Configuration loader and validator for the snapshot relay.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub platform: Platform,
    pub blob: Blob,
    #[serde(default)]
    pub export: Export,
    #[serde(default)]
    pub restore: Restore,
    #[serde(default)]
    pub retention: Retention,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_concurrent_operations: usize,
    /// Schema captured by introspection and data extraction.
    #[serde(default = "default_schema")]
    pub schema: String,
}

/// Control-plane and instance endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub api_url: String,
    /// Instance base URL; `{ref}` is replaced with the project reference.
    pub instance_url_template: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

/// Where snapshot documents are stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum Blob {
    Fs {
        root: String,
    },
    Http {
        base_url: String,
        bucket: String,
        token: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Export {
    pub page_size: u64,
    pub max_rows_per_table: u64,
    pub large_snapshot_mb: u64,
    pub very_large_snapshot_mb: u64,
    pub max_snapshot_mb: u64,
    pub signed_url_expiry_secs: u64,
    /// Export requests allowed per user per hour; 0 disables the limit.
    pub rate_limit_per_hour: u32,
}

impl Default for Export {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_rows_per_table: 1_000_000,
            large_snapshot_mb: 5,
            very_large_snapshot_mb: 50,
            max_snapshot_mb: 500,
            signed_url_expiry_secs: 7200,
            rate_limit_per_hour: 10,
        }
    }
}

/// Batch size and inter-batch delay for one restore phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchPolicy {
    pub size: usize,
    pub delay_ms: u64,
}

impl BatchPolicy {
    pub const fn new(size: usize, delay_ms: u64) -> Self {
        Self { size, delay_ms }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Batches {
    pub extensions: BatchPolicy,
    pub custom_types: BatchPolicy,
    pub tables: BatchPolicy,
    pub sequences: BatchPolicy,
    pub check_constraints: BatchPolicy,
    pub unique_constraints: BatchPolicy,
    pub indexes: BatchPolicy,
    pub policies: BatchPolicy,
    pub functions: BatchPolicy,
    pub views: BatchPolicy,
    pub materialized_views: BatchPolicy,
    pub triggers: BatchPolicy,
    pub foreign_keys: BatchPolicy,
    pub storage_policies: BatchPolicy,
}

impl Default for Batches {
    fn default() -> Self {
        Self {
            extensions: BatchPolicy::new(1, 0),
            custom_types: BatchPolicy::new(5, 1500),
            tables: BatchPolicy::new(10, 2000),
            sequences: BatchPolicy::new(10, 500),
            check_constraints: BatchPolicy::new(10, 500),
            unique_constraints: BatchPolicy::new(10, 500),
            indexes: BatchPolicy::new(10, 500),
            policies: BatchPolicy::new(15, 500),
            functions: BatchPolicy::new(50, 200),
            views: BatchPolicy::new(1, 200),
            materialized_views: BatchPolicy::new(1, 200),
            triggers: BatchPolicy::new(1, 200),
            foreign_keys: BatchPolicy::new(10, 500),
            storage_policies: BatchPolicy::new(10, 500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Restore {
    /// Additional attempts for a statement that failed transiently.
    pub statement_retries: u32,
    pub retry_delay_ms: u64,
    /// Rows per insert call in the data phase.
    pub data_chunk_size: usize,
    pub copy_storage_objects: bool,
    pub batches: Batches,
}

impl Default for Restore {
    fn default() -> Self {
        Self {
            statement_retries: 2,
            retry_delay_ms: 500,
            data_chunk_size: 500,
            copy_storage_objects: true,
            batches: Batches::default(),
        }
    }
}

impl Restore {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Retention {
    /// Applied to backups that do not belong to a schedule.
    pub default_days: u32,
    pub sweep_interval_secs: u64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            default_days: 30,
            sweep_interval_secs: 3600,
        }
    }
}

fn default_schema() -> String {
    "public".to_string()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` and a filesystem blob root).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if !self.app.data_dir.trim().is_empty() {
            fs::create_dir_all(&self.app.data_dir)?;
        }
        if let Blob::Fs { root } = &self.blob {
            fs::create_dir_all(root)?;
        }
        Ok(())
    }

    /// Base URL for one project instance.
    pub fn instance_url(&self, project_ref: &str) -> String {
        self.platform
            .instance_url_template
            .replace("{ref}", project_ref)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.platform.request_timeout_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_concurrent_operations == 0 {
        return Err(ConfigError::Invalid(
            "app.max_concurrent_operations must be > 0",
        ));
    }
    if cfg.app.schema.trim().is_empty() {
        return Err(ConfigError::Invalid("app.schema must be non-empty"));
    }

    if reqwest::Url::parse(&cfg.platform.api_url).is_err() {
        return Err(ConfigError::Invalid("platform.api_url must be a valid URL"));
    }
    if !cfg.platform.instance_url_template.contains("{ref}") {
        return Err(ConfigError::Invalid(
            "platform.instance_url_template must contain {ref}",
        ));
    }
    if cfg.platform.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "platform.request_timeout_secs must be > 0",
        ));
    }

    match &cfg.blob {
        Blob::Fs { root } if root.trim().is_empty() => {
            return Err(ConfigError::Invalid("blob.root must be non-empty"));
        }
        Blob::Http { base_url, .. } if reqwest::Url::parse(base_url).is_err() => {
            return Err(ConfigError::Invalid("blob.base_url must be a valid URL"));
        }
        Blob::Http { bucket, .. } if bucket.trim().is_empty() => {
            return Err(ConfigError::Invalid("blob.bucket must be non-empty"));
        }
        _ => {}
    }

    let ex = &cfg.export;
    if ex.page_size == 0 {
        return Err(ConfigError::Invalid("export.page_size must be > 0"));
    }
    if ex.max_rows_per_table < ex.page_size {
        return Err(ConfigError::Invalid(
            "export.max_rows_per_table must be >= export.page_size",
        ));
    }
    if !(ex.large_snapshot_mb <= ex.very_large_snapshot_mb
        && ex.very_large_snapshot_mb <= ex.max_snapshot_mb)
    {
        return Err(ConfigError::Invalid(
            "export snapshot size thresholds must be ordered large <= very_large <= max",
        ));
    }

    if cfg.restore.data_chunk_size == 0 {
        return Err(ConfigError::Invalid("restore.data_chunk_size must be > 0"));
    }
    let b = &cfg.restore.batches;
    let sizes = [
        b.extensions,
        b.custom_types,
        b.tables,
        b.sequences,
        b.check_constraints,
        b.unique_constraints,
        b.indexes,
        b.policies,
        b.functions,
        b.views,
        b.materialized_views,
        b.triggers,
        b.foreign_keys,
        b.storage_policies,
    ];
    if sizes.iter().any(|p| p.size == 0) {
        return Err(ConfigError::Invalid("restore.batches.*.size must be > 0"));
    }

    if cfg.retention.default_days == 0 {
        return Err(ConfigError::Invalid("retention.default_days must be > 0"));
    }

    Ok(())
}

/// Returns the example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 1000
  max_concurrent_operations: 2
  schema: "public"

platform:
  api_url: "https://api.supabase.com/"
  instance_url_template: "https://{ref}.supabase.co/"
  request_timeout_secs: 30
  max_retries: 3
  retry_base_ms: 1000

blob:
  backend: fs
  root: "./data/snapshots"

export:
  page_size: 1000
  max_rows_per_table: 1000000
  large_snapshot_mb: 5
  very_large_snapshot_mb: 50
  max_snapshot_mb: 500
  signed_url_expiry_secs: 7200
  rate_limit_per_hour: 10

restore:
  statement_retries: 2
  retry_delay_ms: 500
  data_chunk_size: 500
  copy_storage_objects: true
  batches:
    tables: { size: 10, delay_ms: 2000 }
    policies: { size: 15, delay_ms: 500 }
    functions: { size: 50, delay_ms: 200 }

retention:
  default_days: 30
  sweep_interval_secs: 3600
"#
}
