use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::{PoolSettings, RetryPolicy};
use crate::retention::RetentionPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            queue: QueueConfig::default(),
            retention: RetentionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.pipeline.max_retries,
            base_delay: Duration::from_secs(self.queue.backoff_base_secs),
            max_delay: Duration::from_secs(self.queue.backoff_max_secs),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            worker_count: self.queue.worker_count,
            lease: Duration::from_secs(self.queue.lease_secs),
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            window: Duration::from_secs(self.retention.window_days * 24 * 60 * 60),
            batch_limit: self.retention.batch_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `~/.docflow/data/docflow.db`.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    crate::db::default_database_path().unwrap_or_else(|| PathBuf::from("docflow.db"))
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the object store; staged uploads live under `<root>/staging`.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// HMAC key for presigned URLs. `DOCFLOW_PRESIGN_SECRET` overrides it.
    #[serde(default)]
    pub presign_secret: String,
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_max_object_bytes")]
    pub max_object_bytes: u64,
}

fn default_storage_root() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("docflow").join("objects"))
        .unwrap_or_else(|| PathBuf::from("docflow-objects"))
}

fn default_public_base_url() -> String {
    "http://localhost:8080/objects".to_string()
}

fn default_max_object_bytes() -> u64 {
    100 * 1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            presign_secret: String::new(),
            public_base_url: default_public_base_url(),
            max_object_bytes: default_max_object_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_retries: u32,
    /// Hard job timeout, evaluated when the next attempt claims the job.
    pub job_timeout_secs: u64,
    /// Soft deadline checked between the steps of a stage.
    pub soft_deadline_secs: u64,
    pub max_text_bytes: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            job_timeout_secs: 600,
            soft_deadline_secs: 300,
            max_text_bytes: 10 * 1024 * 1024,
            chunk_size: 512,
            chunk_overlap: 50,
            min_chunk_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// How long a claimed task stays invisible before redelivery.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_lease_secs() -> u64 {
    900
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_backoff_base_secs() -> u64 {
    30
}

fn default_backoff_max_secs() -> u64 {
    600
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub window_days: u64,
    pub batch_limit: u64,
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_days: 30,
            batch_limit: 100,
            interval_secs: 6 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}
