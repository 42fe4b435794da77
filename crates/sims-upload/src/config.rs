//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ingest::pipeline::{PartialFailurePolicy, PipelineSettings};
use crate::runner::admission::AdmissionLimits;
use crate::runner::queue::DEFAULT_QUEUE_NAME;
use crate::runner::worker::WorkerConfig;

// ============================================================================
// Database
// ============================================================================

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Queue and worker
// ============================================================================

pub const DEFAULT_WORKER_CONCURRENCY: usize = 1;

pub const DEFAULT_WORKER_POLL_INTERVAL_MS: u64 = 1000;

/// Claims older than this are assumed to belong to a dead worker.
pub const DEFAULT_WORKER_STALE_AFTER_SECS: u64 = 3600;

// ============================================================================
// Uploads
// ============================================================================

/// 100 MiB
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 100 * 1024 * 1024;

pub const DEFAULT_MAX_ROWS: u64 = 500_000;

pub const DEFAULT_UPLOAD_DIR: &str = "uploads";

pub const DEFAULT_REJECTED_DIR: &str = "uploads/rejected";

pub const DEFAULT_ARTIFACT_DIR: &str = "uploads/normalized";

pub const DEFAULT_SCHEMA_LOCK_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Only commands that touch PostgreSQL require it
    pub url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub worker_concurrency: usize,
    pub poll_interval_ms: u64,
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// `0` disables the limit
    pub max_file_size_bytes: u64,
    /// `0` disables the limit
    pub max_rows: u64,
    pub upload_dir: PathBuf,
    pub rejected_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub partial_failure_policy: PartialFailurePolicy,
    pub schema_lock_timeout_secs: u64,
    /// Sheet configs come from this JSON file instead of the database
    pub sheet_config_file: Option<PathBuf>,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let partial_failure_policy = match env_string("UPLOAD_PARTIAL_FAILURE_POLICY") {
            Some(raw) => raw.parse()?,
            None => PartialFailurePolicy::default(),
        };

        let config = Config {
            database: DatabaseConfig {
                url: env_string("DATABASE_URL"),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                connect_timeout_secs: env_parse("DATABASE_CONNECT_TIMEOUT")
                    .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
            },
            queue: QueueConfig {
                name: env_string("UPLOAD_QUEUE_NAME")
                    .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
                worker_concurrency: env_parse("UPLOAD_WORKER_CONCURRENCY")
                    .unwrap_or(DEFAULT_WORKER_CONCURRENCY),
                poll_interval_ms: env_parse("UPLOAD_WORKER_POLL_INTERVAL_MS")
                    .unwrap_or(DEFAULT_WORKER_POLL_INTERVAL_MS),
                stale_after_secs: env_parse("UPLOAD_WORKER_STALE_AFTER_SECS")
                    .unwrap_or(DEFAULT_WORKER_STALE_AFTER_SECS),
            },
            upload: UploadConfig {
                max_file_size_bytes: env_parse("UPLOAD_MAX_FILE_SIZE_BYTES")
                    .unwrap_or(DEFAULT_MAX_FILE_SIZE_BYTES),
                max_rows: env_parse("UPLOAD_MAX_ROWS").unwrap_or(DEFAULT_MAX_ROWS),
                upload_dir: env_string("UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
                rejected_dir: env_string("UPLOAD_REJECTED_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_REJECTED_DIR)),
                artifact_dir: env_string("UPLOAD_ARTIFACT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_DIR)),
                partial_failure_policy,
                schema_lock_timeout_secs: env_parse("UPLOAD_SCHEMA_LOCK_TIMEOUT_SECS")
                    .unwrap_or(DEFAULT_SCHEMA_LOCK_TIMEOUT_SECS),
                sheet_config_file: env_string("UPLOAD_SHEET_CONFIG_FILE").map(PathBuf::from),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.queue.name.trim().is_empty() {
            anyhow::bail!("Queue name cannot be empty");
        }

        if self.queue.worker_concurrency == 0 {
            anyhow::bail!("Worker concurrency must be greater than 0");
        }

        if self.queue.poll_interval_ms == 0 {
            anyhow::bail!("Worker poll interval must be greater than 0");
        }

        if self.upload.schema_lock_timeout_secs == 0 {
            anyhow::bail!("Schema lock timeout must be greater than 0");
        }

        if self.upload.max_file_size_bytes == 0 {
            tracing::warn!("UPLOAD_MAX_FILE_SIZE_BYTES is 0 - file size is not limited");
        }

        Ok(())
    }

    /// The database URL, for commands that cannot run without one
    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))
    }

    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits::from_config(self.upload.max_file_size_bytes, self.upload.max_rows)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            rejected_dir: self.upload.rejected_dir.clone(),
            artifact_dir: Some(self.upload.artifact_dir.clone()),
            partial_failure: self.upload.partial_failure_policy,
            schema_lock_timeout: Duration::from_secs(self.upload.schema_lock_timeout_secs),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.queue.worker_concurrency,
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
            stale_after: Duration::from_secs(self.queue.stale_after_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: None,
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            queue: QueueConfig {
                name: DEFAULT_QUEUE_NAME.to_string(),
                worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
                poll_interval_ms: DEFAULT_WORKER_POLL_INTERVAL_MS,
                stale_after_secs: DEFAULT_WORKER_STALE_AFTER_SECS,
            },
            upload: UploadConfig {
                max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
                max_rows: DEFAULT_MAX_ROWS,
                upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
                rejected_dir: PathBuf::from(DEFAULT_REJECTED_DIR),
                artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
                partial_failure_policy: PartialFailurePolicy::default(),
                schema_lock_timeout_secs: DEFAULT_SCHEMA_LOCK_TIMEOUT_SECS,
                sheet_config_file: None,
            },
        }
    }
}
