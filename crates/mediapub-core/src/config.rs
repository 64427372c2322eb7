//! Configuration module
//!
//! Settings for the HTTP surface, the task bus workers, upload storage and
//! blob destinations. Everything is read from the environment with typed
//! defaults; `validate` rejects combinations that cannot work.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::storage_types::StorageBackend;

// Common constants
const SERVER_PORT: u16 = 3000;
const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const REDIS_URL: &str = "redis://127.0.0.1:6379/0";
const RPC_TIMEOUT_SECS: u64 = 300;
const LOCK_LEASE_SECS: u64 = 100;
const TASK_BUS_CONCURRENCY: usize = 4;
const TASK_BUS_POLL_INTERVAL_MS: u64 = 1000;
const TASK_BUS_STATS_INTERVAL_SECS: u64 = 60;
const TASK_BUS_SHUTDOWN_GRACE_SECS: u64 = 30;
const TASK_BUS_QUEUE: &str = "mediapub";

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

/// One blob destination, written as `local:/path` or `s3:bucket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDestinationConfig {
    /// Name recorded in the blob index: the configured `<backend>:<location>` string.
    pub name: String,
    pub backend: StorageBackend,
    /// Directory for `local`, bucket for `s3`.
    pub location: String,
}

impl FromStr for BlobDestinationConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (backend, location) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Blob destination must be <backend>:<location>: {}", s))?;
        let location = location.trim();
        if location.is_empty() {
            return Err(anyhow::anyhow!("Blob destination has no location: {}", s));
        }
        Ok(BlobDestinationConfig {
            name: s.to_string(),
            backend: backend.parse()?,
            location: location.to_string(),
        })
    }
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_port: u16,
    pub environment: String,
    pub log_format: LogFormat,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub redis_url: String,
    pub jwt_secret: String,
    // Resumable upload storage
    pub upload_storage_backend: StorageBackend,
    pub uploads_dir: PathBuf,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    // Blob engine
    pub blobs_dir: PathBuf,
    pub blob_destinations: Vec<BlobDestinationConfig>,
    // Downstream RPC
    pub rpc_url: String,
    pub rpc_timeout_seconds: u64,
    pub ffprobe_path: String,
    pub lock_lease_seconds: u64,
    // Task bus
    pub worker_enabled: bool,
    pub task_bus_queue: String,
    pub task_bus_concurrency: usize,
    pub task_bus_poll_interval_ms: u64,
    /// Interval in seconds between queue depth reports. 0 = disabled.
    pub task_bus_stats_interval_secs: u64,
    pub task_bus_shutdown_grace_secs: u64,
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse::<T>().ok()).unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(|v| v.trim().to_lowercase()) {
        Some(v) if v == "true" || v == "1" || v == "yes" => true,
        Some(v) if v == "false" || v == "0" || v == "no" => false,
        _ => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_vars<F>(var: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = var("ENVIRONMENT")
            .or_else(|| var("APP_ENV"))
            .unwrap_or_else(|| "development".to_string());

        let database_url = var("DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let jwt_secret =
            var("JWT_SECRET").ok_or_else(|| anyhow::anyhow!("JWT_SECRET must be set"))?;

        let log_format = match var("LOG_FORMAT") {
            Some(v) => v.parse()?,
            None => LogFormat::default(),
        };

        let upload_storage_backend = match var("UPLOAD_STORAGE_BACKEND") {
            Some(v) => v.parse()?,
            None => StorageBackend::Local,
        };

        let uploads_dir = PathBuf::from(var("UPLOADS_DIR").unwrap_or_else(|| "./uploads".into()));
        let blobs_dir = PathBuf::from(var("BLOBS_DIR").unwrap_or_else(|| "./blobs".into()));

        let blob_destinations = var("BLOB_DESTINATIONS")
            .map(|list| {
                list.split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(str::parse::<BlobDestinationConfig>)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let rpc_url = var("RPC_URL").unwrap_or_else(|| "http://localhost:5279".to_string());

        Ok(Config {
            server_port: parse_or(var("SERVER_PORT").or_else(|| var("PORT")), SERVER_PORT),
            environment,
            log_format,
            database_url,
            db_max_connections: parse_or(var("DB_MAX_CONNECTIONS"), MAX_CONNECTIONS),
            db_timeout_seconds: parse_or(var("DB_TIMEOUT_SECONDS"), CONNECTION_TIMEOUT_SECS),
            redis_url: var("REDIS_URL").unwrap_or_else(|| REDIS_URL.to_string()),
            jwt_secret,
            upload_storage_backend,
            uploads_dir,
            s3_bucket: var("S3_BUCKET"),
            s3_region: var("S3_REGION").or_else(|| var("AWS_REGION")),
            s3_endpoint: var("S3_ENDPOINT"),
            blobs_dir,
            blob_destinations,
            rpc_url,
            rpc_timeout_seconds: parse_or(var("RPC_TIMEOUT_SECONDS"), RPC_TIMEOUT_SECS),
            ffprobe_path: var("FFPROBE_PATH").unwrap_or_else(|| "ffprobe".to_string()),
            lock_lease_seconds: parse_or(var("LOCK_LEASE_SECONDS"), LOCK_LEASE_SECS),
            worker_enabled: parse_bool(var("WORKER_ENABLED"), true),
            task_bus_queue: var("TASK_BUS_QUEUE").unwrap_or_else(|| TASK_BUS_QUEUE.to_string()),
            task_bus_concurrency: parse_or(var("TASK_BUS_CONCURRENCY"), TASK_BUS_CONCURRENCY),
            task_bus_poll_interval_ms: parse_or(
                var("TASK_BUS_POLL_INTERVAL_MS"),
                TASK_BUS_POLL_INTERVAL_MS,
            ),
            task_bus_stats_interval_secs: parse_or(
                var("TASK_BUS_STATS_INTERVAL_SECS"),
                TASK_BUS_STATS_INTERVAL_SECS,
            ),
            task_bus_shutdown_grace_secs: parse_or(
                var("TASK_BUS_SHUTDOWN_GRACE_SECS"),
                TASK_BUS_SHUTDOWN_GRACE_SECS,
            ),
        })
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.is_production() && self.jwt_secret.len() < 32 {
            return Err(anyhow::anyhow!(
                "JWT_SECRET must be at least 32 characters long"
            ));
        }

        if !self.database_url.starts_with("postgres://")
            && !self.database_url.starts_with("postgresql://")
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }

        if self.upload_storage_backend == StorageBackend::S3 && self.s3_bucket.is_none() {
            return Err(anyhow::anyhow!(
                "UPLOAD_STORAGE_BACKEND=s3 requires S3_BUCKET to be set"
            ));
        }

        if self.worker_enabled && self.blob_destinations.is_empty() {
            return Err(anyhow::anyhow!(
                "WORKER_ENABLED=true requires at least one BLOB_DESTINATIONS entry"
            ));
        }

        if self.task_bus_concurrency == 0 {
            return Err(anyhow::anyhow!("TASK_BUS_CONCURRENCY must be at least 1"));
        }

        if self.lock_lease_seconds == 0 {
            return Err(anyhow::anyhow!("LOCK_LEASE_SECONDS must be at least 1"));
        }

        Ok(())
    }
}
