//! Configuration for the run coordinator.
//!
//! This module provides the settings used when starting and driving pipeline
//! runs: database connectivity, concurrency caps, job retry backoff, per-job
//! timeouts and the bounded retry applied to storage writes.

use std::time::Duration;

use thiserror::Error;

use crate::retry::{BackoffPolicy, StorageRetry};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the run coordinator and job executor.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    // Storage settings
    /// PostgreSQL database connection URL.
    pub database_url: String,
    /// Maximum connections held by the pool.
    pub max_connections: u32,

    // Run settings
    /// Cap applied to pipelines that do not set their own concurrency limit.
    /// `None` leaves such pipelines unbounded.
    pub default_concurrency_cap: Option<u32>,
    /// Maximum job-runs executing at once within one batch.
    pub max_parallel_jobs: usize,

    // Job settings
    /// Backoff between attempts of a failing job.
    pub job_backoff: BackoffPolicy,
    /// Per-attempt timeout for jobs without their own.
    pub default_job_timeout: Duration,

    /// Attempts for each status write before the failure is recorded.
    pub storage_retry_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/catalog".to_string(),
            max_connections: 10,

            default_concurrency_cap: None,
            max_parallel_jobs: 4,

            job_backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
            default_job_timeout: Duration::from_secs(1800), // 30 minutes

            storage_retry_attempts: 3,
        }
    }
}

impl CoordinatorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `ORCHESTRATOR_DB_MAX_CONNECTIONS`: Pool size (default: 10)
    /// - `ORCHESTRATOR_DEFAULT_CONCURRENCY_CAP`: Cap for pipelines without a limit (default: unbounded)
    /// - `ORCHESTRATOR_MAX_PARALLEL_JOBS`: Parallel jobs per batch (default: 4)
    /// - `ORCHESTRATOR_JOB_BACKOFF_BASE_MS`: First retry delay (default: 1000)
    /// - `ORCHESTRATOR_JOB_BACKOFF_MAX_MS`: Retry delay cap (default: 60000)
    /// - `ORCHESTRATOR_JOB_TIMEOUT_SECS`: Default per-attempt job timeout (default: 1800)
    /// - `ORCHESTRATOR_STORAGE_RETRY_ATTEMPTS`: Attempts per status write (default: 3)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Storage settings - DATABASE_URL is required
        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        if let Ok(val) = std::env::var("ORCHESTRATOR_DB_MAX_CONNECTIONS") {
            config.max_connections = parse_env_value(&val, "ORCHESTRATOR_DB_MAX_CONNECTIONS")?;
        }

        // Run settings
        if let Ok(val) = std::env::var("ORCHESTRATOR_DEFAULT_CONCURRENCY_CAP") {
            config.default_concurrency_cap = Some(parse_env_value(
                &val,
                "ORCHESTRATOR_DEFAULT_CONCURRENCY_CAP",
            )?);
        }

        if let Ok(val) = std::env::var("ORCHESTRATOR_MAX_PARALLEL_JOBS") {
            config.max_parallel_jobs = parse_env_value(&val, "ORCHESTRATOR_MAX_PARALLEL_JOBS")?;
        }

        // Job settings
        if let Ok(val) = std::env::var("ORCHESTRATOR_JOB_BACKOFF_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "ORCHESTRATOR_JOB_BACKOFF_BASE_MS")?;
            config.job_backoff.base = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("ORCHESTRATOR_JOB_BACKOFF_MAX_MS") {
            let ms: u64 = parse_env_value(&val, "ORCHESTRATOR_JOB_BACKOFF_MAX_MS")?;
            config.job_backoff.max = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("ORCHESTRATOR_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ORCHESTRATOR_JOB_TIMEOUT_SECS")?;
            config.default_job_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("ORCHESTRATOR_STORAGE_RETRY_ATTEMPTS") {
            config.storage_retry_attempts =
                parse_env_value(&val, "ORCHESTRATOR_STORAGE_RETRY_ATTEMPTS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.default_concurrency_cap == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "default_concurrency_cap must be greater than 0".to_string(),
            ));
        }

        if self.max_parallel_jobs == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_parallel_jobs must be greater than 0".to_string(),
            ));
        }

        if self.job_backoff.base > self.job_backoff.max {
            return Err(ConfigError::ValidationFailed(
                "job backoff base cannot exceed job backoff max".to_string(),
            ));
        }

        if self.default_job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "default_job_timeout must be greater than 0".to_string(),
            ));
        }

        if self.storage_retry_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "storage_retry_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Retry helper for status writes built from `storage_retry_attempts`.
    pub fn storage_retry(&self) -> StorageRetry {
        StorageRetry::new(self.storage_retry_attempts)
    }

    /// Builder method to set database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the pool size.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder method to set the default concurrency cap.
    pub fn with_default_concurrency_cap(mut self, cap: u32) -> Self {
        self.default_concurrency_cap = Some(cap);
        self
    }

    /// Builder method to set max parallel jobs per batch.
    pub fn with_max_parallel_jobs(mut self, max: usize) -> Self {
        self.max_parallel_jobs = max;
        self
    }

    /// Builder method to set the job retry backoff.
    pub fn with_job_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.job_backoff = backoff;
        self
    }

    /// Builder method to set the default job timeout.
    pub fn with_default_job_timeout(mut self, timeout: Duration) -> Self {
        self.default_job_timeout = timeout;
        self
    }

    /// Builder method to set storage retry attempts.
    pub fn with_storage_retry_attempts(mut self, attempts: u32) -> Self {
        self.storage_retry_attempts = attempts;
        self
    }
}

/// Parse an environment variable value into a type.
pub(crate) fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
pub(crate) fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.default_concurrency_cap, None);
        assert_eq!(config.max_parallel_jobs, 4);
        assert_eq!(config.job_backoff.base, Duration::from_secs(1));
        assert_eq!(config.job_backoff.delay(3), Duration::from_secs(4));
        assert_eq!(config.default_job_timeout, Duration::from_secs(1800));
        assert_eq!(config.storage_retry_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CoordinatorConfig::new()
            .with_database_url("postgres://test/db")
            .with_max_connections(2)
            .with_default_concurrency_cap(5)
            .with_max_parallel_jobs(8)
            .with_default_job_timeout(Duration::from_secs(60))
            .with_storage_retry_attempts(1);

        assert_eq!(config.database_url, "postgres://test/db");
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.default_concurrency_cap, Some(5));
        assert_eq!(config.max_parallel_jobs, 8);
        assert_eq!(config.default_job_timeout, Duration::from_secs(60));
        assert_eq!(config.storage_retry().max_attempts, 1);
    }

    #[test]
    fn test_validation_zero_cap() {
        let result = CoordinatorConfig::default()
            .with_default_concurrency_cap(0)
            .validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("default_concurrency_cap"));
    }

    #[test]
    fn test_validation_zero_parallel_jobs() {
        let result = CoordinatorConfig::default()
            .with_max_parallel_jobs(0)
            .validate();
        assert!(result.unwrap_err().to_string().contains("max_parallel_jobs"));
    }

    #[test]
    fn test_validation_inverted_backoff() {
        let result = CoordinatorConfig::default()
            .with_job_backoff(BackoffPolicy::new(
                Duration::from_secs(10),
                Duration::from_secs(1),
            ))
            .validate();
        assert!(result.unwrap_err().to_string().contains("backoff"));
    }

    #[test]
    fn test_validation_empty_database_url() {
        let result = CoordinatorConfig::default().with_database_url("").validate();
        assert!(result.unwrap_err().to_string().contains("database_url"));
    }

    #[test]
    fn test_parse_env_value() {
        let n: u32 = parse_env_value("12", "KEY").unwrap();
        assert_eq!(n, 12);

        let err = parse_env_value::<u32>("twelve", "KEY").unwrap_err();
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("twelve"));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("ON", "test").unwrap());
        assert!(!parse_env_bool("0", "test").unwrap());
        assert!(!parse_env_bool("no", "test").unwrap());
        assert!(parse_env_bool("maybe", "test").is_err());
    }
}
