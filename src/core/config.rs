//! Configuration management

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use config::{builder::DefaultState, Config as ConfigBuilder, ConfigBuilder as Builder, ConfigError as BuilderError, Environment, File};
use clap::Parser;

use crate::core::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid database configuration: {0}")]
    InvalidDatabase(String),

    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),

    #[error("Invalid remote configuration: {0}")]
    InvalidRemote(String),

    #[error("Invalid retry configuration: {0}")]
    InvalidRetry(String),

    #[error("Invalid job configuration: {0}")]
    InvalidJobs(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub remote: RemoteConfig,
    pub retry: RetryConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
}

/// Environment variables are prefixed with COMIC and use `__` for nesting,
/// e.g. `COMIC__REMOTE__BASE_URL=https://comics.example`.
const ENV_PREFIX: &str = "COMIC";

fn with_defaults() -> Result<Builder<DefaultState>, ConfigError> {
    let builder = ConfigBuilder::builder()
        .set_default("database.path", "./data/comic-offline.db")?
        .set_default("database.connection_pool_size", 4)?
        .set_default("database.busy_timeout", 5000)?
        .set_default("storage.root_dir", "./data")?
        .set_default("storage.min_free_bytes", 104857600u64)? // 100 MB
        .set_default("remote.base_url", "http://127.0.0.1:8080")?
        .set_default("remote.request_timeout", 30)?
        .set_default("remote.user_agent", concat!("comic-offline/", env!("CARGO_PKG_VERSION")))?
        .set_default("retry.times", 3)?
        .set_default("retry.initial_delay_ms", 500)?
        .set_default("retry.factor", 2.0)?
        .set_default("retry.max_delay_ms", 10000)?
        .set_default("jobs.max_concurrent_jobs", 2)?
        .set_default("jobs.constraint_poll_interval_ms", 5000)?
        .set_default("jobs.requires_network", true)?
        .set_default("jobs.requires_storage_not_low", true)?
        .set_default("jobs.finished_job_retention_days", 7)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stdout")?
        .set_default("logging.rotation", "daily")?
        .set_default("logging.max_log_files", 5)?;
    Ok(builder)
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(&CliArgs::parse())
    }

    /// Build configuration from already parsed command-line arguments
    pub fn from_args(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = with_defaults()?;

        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(
                    config_path.display().to_string()
                ));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
        );

        if let Some(db_path) = &cli_args.database {
            builder = builder.set_override("database.path", db_path.display().to_string())?;
        }
        if let Some(root) = &cli_args.storage_root {
            builder = builder.set_override("storage.root_dir", root.display().to_string())?;
        }
        if let Some(base_url) = &cli_args.base_url {
            builder = builder.set_override("remote.base_url", base_url.clone())?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, falling back to defaults
    /// for anything the file leaves out
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = with_defaults()?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults only
    pub fn defaults() -> Result<Self, ConfigError> {
        let config: Config = with_defaults()?.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.storage.validate()?;
        self.remote.validate()?;
        self.retry.validate()?;
        self.jobs.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Command-line arguments
#[derive(Debug, Default, Parser)]
#[command(name = "comic-offline")]
#[command(about = "Downloads comic chapters for offline reading", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Database file path
    #[arg(short, long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Directory that receives downloaded images
    #[arg(long, value_name = "DIR")]
    pub storage_root: Option<PathBuf>,

    /// Base URL of the remote comic API
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Comic link whose chapters should be downloaded
    #[arg(long, value_name = "LINK")]
    pub comic: Option<String>,

    /// Chapter link to download (repeatable). Downloads every chapter of --comic when omitted.
    #[arg(long = "chapter", value_name = "LINK", requires = "comic")]
    pub chapters: Vec<String>,

    /// Delete image files no downloaded chapter refers to before downloading
    #[arg(long)]
    pub reclaim_orphans: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub connection_pool_size: u32,
    pub busy_timeout: u64, // milliseconds
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidDatabase("path cannot be empty".to_string()));
        }

        if self.connection_pool_size == 0 {
            return Err(ConfigError::InvalidDatabase("connection_pool_size must be greater than 0".to_string()));
        }

        if self.busy_timeout == 0 {
            return Err(ConfigError::InvalidDatabase("busy_timeout must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub root_dir: PathBuf,
    pub min_free_bytes: u64,
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidStorage("root_dir cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    pub request_timeout: u64, // seconds
    pub user_agent: String,
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(&self.base_url)
            .map_err(|e| ConfigError::InvalidRemote(format!("base_url is not a valid URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidRemote("base_url must use http or https".to_string()));
        }

        if self.request_timeout == 0 {
            return Err(ConfigError::InvalidRemote("request_timeout must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub times: u32,
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.times == 0 {
            return Err(ConfigError::InvalidRetry("times must be at least 1".to_string()));
        }

        if self.factor.is_nan() || self.factor < 1.0 {
            return Err(ConfigError::InvalidRetry("factor must be >= 1.0".to_string()));
        }

        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::InvalidRetry("max_delay_ms must not be below initial_delay_ms".to_string()));
        }

        Ok(())
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            times: self.times,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            factor: self.factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    pub max_concurrent_jobs: usize,
    pub constraint_poll_interval_ms: u64,
    pub requires_network: bool,
    pub requires_storage_not_low: bool,
    pub finished_job_retention_days: i64,
}

impl JobsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidJobs("max_concurrent_jobs must be greater than 0".to_string()));
        }

        if self.constraint_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidJobs("constraint_poll_interval_ms must be greater than 0".to_string()));
        }

        if self.finished_job_retention_days < 0 {
            return Err(ConfigError::InvalidJobs("finished_job_retention_days cannot be negative".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
    pub rotation: String,
    pub max_log_files: usize,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("level must be one of: {:?}", valid_levels)
            ));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("format must be one of: {:?}", valid_formats)
            ));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("output must be one of: {:?}", valid_outputs)
            ));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string()
            ));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&self.rotation.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("rotation must be one of: {:?}", valid_rotations)
            ));
        }

        if self.max_log_files == 0 {
            return Err(ConfigError::InvalidLogging("max_log_files must be greater than 0".to_string()));
        }

        Ok(())
    }
}
