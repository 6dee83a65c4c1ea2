use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use strum::IntoEnumIterator;
use tracing::warn;

use crate::error::{ServiceError, ServiceResult};
use crate::task::{ConversionMethod, FileType};

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 16;
pub const MIN_QUEUE_CAPACITY: usize = 10;
pub const MAX_RETRIES_LIMIT: u32 = 10;

// ==================== Service Configuration (startup-only) ====================

/// Top-level configuration, read once at startup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Scheduling policy. Immutable once handed to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of concurrent workers, clamped to 1..=16
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Admitted tasks (queued, in flight, or awaiting retry) before submit blocks
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Time budget handed to converters for a single attempt
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Retries after the first failed attempt, clamped to 0..=10
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Double the delay for every retry instead of waiting a constant delay
    #[serde(default = "default_exponential_backoff")]
    pub exponential_backoff: bool,

    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Which conversion strategy serves each file type.
    /// File types missing from the map are rejected at submit time.
    #[serde(default = "default_supported_types")]
    pub supported_types: HashMap<FileType, ConversionMethod>,

    /// How long an idle worker waits on the queue before re-checking for shutdown
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on a single callback invocation
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            task_timeout_secs: default_task_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            exponential_backoff: default_exponential_backoff(),
            max_file_size_bytes: default_max_file_size(),
            supported_types: default_supported_types(),
            poll_interval_ms: default_poll_interval_ms(),
            callback_timeout_secs: default_callback_timeout_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Clamp out-of-range values so the scheduler can always start.
    pub fn validated(mut self) -> Self {
        let worker_count = self.worker_count.clamp(MIN_WORKERS, MAX_WORKERS);
        if worker_count != self.worker_count {
            warn!(
                requested = self.worker_count,
                applied = worker_count,
                "worker_count out of range, clamping"
            );
            self.worker_count = worker_count;
        }

        if self.queue_capacity < MIN_QUEUE_CAPACITY {
            warn!(
                requested = self.queue_capacity,
                applied = MIN_QUEUE_CAPACITY,
                "queue_capacity too small, raising"
            );
            self.queue_capacity = MIN_QUEUE_CAPACITY;
        }

        if self.max_retries > MAX_RETRIES_LIMIT {
            warn!(
                requested = self.max_retries,
                applied = MAX_RETRIES_LIMIT,
                "max_retries out of range, clamping"
            );
            self.max_retries = MAX_RETRIES_LIMIT;
        }

        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = default_poll_interval_ms();
        }

        if self.task_timeout_secs == 0 {
            warn!(
                applied = default_task_timeout_secs(),
                "task_timeout_secs of 0 would fail every conversion, using default"
            );
            self.task_timeout_secs = default_task_timeout_secs();
        }

        self
    }

    pub fn is_supported(&self, file_type: FileType) -> bool {
        self.supported_types.contains_key(&file_type)
    }

    pub fn method_for(&self, file_type: FileType) -> Option<ConversionMethod> {
        self.supported_types.get(&file_type).copied()
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    /// Delay before re-queueing after the `retry_count`-th failure (1-based).
    ///
    /// Exponential: `base * 2^(retry_count - 1)`. Constant: `base`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let base = self.retry_base_delay();
        if !self.exponential_backoff {
            return base;
        }
        let exponent = retry_count.saturating_sub(1).min(MAX_RETRIES_LIMIT);
        base.saturating_mul(1u32 << exponent)
    }
}

/// Batched persistence of task state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_status_flush_interval_secs")]
    pub status_flush_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            database_path: default_database_path(),
            status_flush_interval_secs: default_status_flush_interval_secs(),
        }
    }
}

impl PersistenceConfig {
    pub fn status_flush_interval(&self) -> Duration {
        Duration::from_secs(self.status_flush_interval_secs.max(1))
    }
}

/// Background sweeps over the task store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Run the terminal-task cleanup every N seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// How long finished tasks are kept before cleanup
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Log tasks stuck in processing every N seconds
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval_secs(),
            retention_secs: default_retention_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
        }
    }
}

impl MaintenanceConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Optional auto-import directory. Supported files placed here are
    /// submitted automatically; files rejected at submit time are moved to failed/.
    #[serde(default)]
    pub auto_import_dir: Option<PathBuf>,

    #[serde(default = "default_auto_import_poll_secs")]
    pub poll_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            auto_import_dir: None,
            poll_interval_secs: default_auto_import_poll_secs(),
        }
    }
}

impl StorageConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Prometheus exporter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address for the Prometheus scrape endpoint, e.g. "0.0.0.0:9000". Disabled when unset.
    #[serde(default)]
    pub listen_addr: Option<String>,
}

// ==================== Loading ====================

/// Load configuration from `config.toml` (optional) and `DOCFLOW__*` env vars
pub fn load_config() -> ServiceResult<ServiceConfig> {
    let mut loaded: ServiceConfig = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("DOCFLOW")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to build config: {}", e),
        })?
        .try_deserialize()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to deserialize config: {}", e),
        })?;

    loaded.scheduler = loaded.scheduler.validated();
    Ok(loaded)
}

// ==================== Default Value Functions ====================

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    100
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_exponential_backoff() -> bool {
    true
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024 // 100 MB
}

pub(crate) fn default_supported_types() -> HashMap<FileType, ConversionMethod> {
    FileType::iter()
        .map(|file_type| {
            let method = match file_type {
                FileType::Pdf => ConversionMethod::PdfExtract,
                FileType::Word | FileType::PowerPoint => ConversionMethod::OfficeDocument,
                FileType::Excel | FileType::Csv => ConversionMethod::Spreadsheet,
                FileType::Html => ConversionMethod::Html,
                FileType::Markdown | FileType::Text | FileType::Json => {
                    ConversionMethod::PlainText
                }
                FileType::Image => ConversionMethod::ImageCaption,
            };
            (file_type, method)
        })
        .collect()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_callback_timeout_secs() -> u64 {
    30
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/docflow.db")
}

fn default_status_flush_interval_secs() -> u64 {
    5
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_retention_secs() -> u64 {
    7 * 24 * 3600 // 1 week
}

fn default_watchdog_interval_secs() -> u64 {
    60
}

fn default_auto_import_poll_secs() -> u64 {
    10
}
