//! Configuration management for the sync service.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling on writes per remote batch.
pub const MAX_BATCH_WRITES: usize = 400;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local API host address
    pub host: String,
    /// Local API port
    pub port: u16,
    /// Directory holding the three durable queue records
    pub data_dir: PathBuf,
    /// Namespace of this application's remote collections
    pub app_id: String,
    /// PostgreSQL connection URL; the in-process remote is used without one
    pub database_url: Option<String>,
    /// Token the session endpoint requires before flipping readiness
    pub auth_token: Option<String>,
    /// Writes per remote batch, at most [`MAX_BATCH_WRITES`]
    pub batch_limit: usize,
    /// Delay between drain retries while operations stay queued
    pub retry_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3100".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let data_dir = env::var("TALLY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./tally-data"));

        let app_id = env::var("TALLY_APP_ID").unwrap_or_else(|_| "default".to_string());
        if app_id.trim().is_empty() {
            return Err(ConfigError::EmptyAppId);
        }

        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());
        let auth_token = env::var("TALLY_AUTH_TOKEN").ok().filter(|token| !token.is_empty());

        let batch_limit = match env::var("TALLY_BATCH_LIMIT") {
            Ok(raw) => raw
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidBatchLimit(raw))?
                .clamp(1, MAX_BATCH_WRITES),
            Err(_) => MAX_BATCH_WRITES,
        };

        let retry_secs: u64 = env::var("TALLY_RETRY_SECS")
            .unwrap_or_else(|_| "15".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidRetryInterval)?;
        if retry_secs == 0 {
            return Err(ConfigError::InvalidRetryInterval);
        }

        Ok(Self {
            host,
            port,
            data_dir,
            app_id,
            database_url,
            auth_token,
            batch_limit,
            retry_interval: Duration::from_secs(retry_secs),
        })
    }

    /// Configuration for tests and embedding: in-memory remote, no token.
    pub fn local(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            data_dir: data_dir.into(),
            app_id: "default".to_string(),
            database_url: None,
            auth_token: None,
            batch_limit: MAX_BATCH_WRITES,
            retry_interval: Duration::from_secs(15),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("TALLY_APP_ID must not be empty")]
    EmptyAppId,

    #[error("Invalid TALLY_BATCH_LIMIT value: {0}")]
    InvalidBatchLimit(String),

    #[error("TALLY_RETRY_SECS must be a positive number of seconds")]
    InvalidRetryInterval,
}
