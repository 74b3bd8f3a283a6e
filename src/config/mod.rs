use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::models::job::WorkerIdentity;
use crate::services::paths::FsLayout;
use crate::services::reconciler::RetryPolicy;
use crate::services::storage::{ObjectStore, S3Store, StorageError};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the task queue
    pub redis_url: String,

    /// Health/metrics listener address. Only the foreman binds it.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root of the local data directory (temp files always live here)
    #[serde(default = "default_local_root_dir")]
    pub local_root_dir: PathBuf,

    #[serde(default = "default_raw_prefix")]
    pub raw_prefix: String,

    #[serde(default = "default_temp_prefix")]
    pub temp_prefix: String,

    #[serde(default = "default_processed_prefix")]
    pub processed_prefix: String,

    /// Keep raw and processed files in S3 instead of under `local_root_dir`
    #[serde(default)]
    pub use_s3: bool,

    pub s3_bucket_name: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    #[serde(default = "default_one_day")]
    pub max_run_time_secs: i64,

    #[serde(default = "default_one_day")]
    pub max_queue_time_secs: i64,

    #[serde(default = "default_min_loop_period_secs")]
    pub min_loop_period_secs: u64,

    /// Worker id recorded on jobs. Falls back to HOSTNAME, then a random id.
    pub worker_id: Option<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_local_root_dir() -> PathBuf {
    PathBuf::from("/tmp/data_store")
}

fn default_raw_prefix() -> String {
    "raw".to_string()
}

fn default_temp_prefix() -> String {
    "temp".to_string()
}

fn default_processed_prefix() -> String {
    "processed".to_string()
}

fn default_max_retries() -> i32 {
    2
}

fn default_one_day() -> i64 {
    86_400
}

fn default_min_loop_period_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Build from explicit key/value pairs, e.g. in tests.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_s3 && self.s3_bucket_name.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Invalid(
                "USE_S3 is set but S3_BUCKET_NAME is missing".to_string(),
            ));
        }
        if self.max_retries < 0 {
            return Err(ConfigError::Invalid("MAX_RETRIES must not be negative".to_string()));
        }
        if self.max_run_time_secs <= 0 || self.max_queue_time_secs <= 0 {
            return Err(ConfigError::Invalid(
                "MAX_RUN_TIME_SECS and MAX_QUEUE_TIME_SECS must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            max_run_time: chrono::Duration::seconds(self.max_run_time_secs),
            max_queue_time: chrono::Duration::seconds(self.max_queue_time_secs),
            min_loop_period: Duration::from_secs(self.min_loop_period_secs),
        }
    }

    pub fn layout(&self) -> FsLayout {
        FsLayout {
            local_root: self.local_root_dir.clone(),
            raw_prefix: self.raw_prefix.clone(),
            temp_prefix: self.temp_prefix.clone(),
            processed_prefix: self.processed_prefix.clone(),
            remote: self.use_s3,
        }
    }

    pub fn worker_identity(&self) -> WorkerIdentity {
        let id = self
            .worker_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        WorkerIdentity::new(id)
    }

    /// S3 client for remote raw/processed files, when `USE_S3` is set.
    pub fn object_store(&self) -> Result<Option<Arc<dyn ObjectStore>>, StorageError> {
        if !self.use_s3 {
            return Ok(None);
        }
        let bucket = self
            .s3_bucket_name
            .as_deref()
            .ok_or_else(|| StorageError::Config("S3_BUCKET_NAME is not set".to_string()))?;
        let store = S3Store::new(
            bucket,
            self.s3_endpoint.as_deref().unwrap_or_default(),
            self.s3_access_key.as_deref().unwrap_or_default(),
            self.s3_secret_key.as_deref().unwrap_or_default(),
        )?;
        let store: Arc<dyn ObjectStore> = Arc::new(store);
        Ok(Some(store))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
