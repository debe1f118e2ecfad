//! Pipeline configuration from environment variables
//!
//! Both binaries load `.env` first (dotenv) and then read the process
//! environment. Parsing goes through a lookup function so tests can feed
//! variables without touching the real environment.

use chrono::NaiveDate;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Store and ingestion-runtime settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `*.sql` schema files
    pub schema_dir: String,

    /// How long a statement waits on a locked store before failing
    pub busy_timeout: Duration,

    /// Maximum snapshots ingested concurrently
    pub ingest_workers: usize,

    /// Retries for transient store errors (busy/locked) per snapshot
    pub ingest_max_retries: u32,

    /// Snapshot channel buffer size
    pub channel_buffer: usize,
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `PARKFLOW_DB_PATH` (default: data/parkflow.db)
    /// - `PARKFLOW_SCHEMA_DIR` (default: sql)
    /// - `PARKFLOW_BUSY_TIMEOUT_MS` (default: 5000)
    /// - `INGEST_WORKERS` (default: 4)
    /// - `INGEST_MAX_RETRIES` (default: 3)
    /// - `SNAPSHOT_CHANNEL_BUFFER` (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ingest_workers: usize = parse_or(&lookup, "INGEST_WORKERS", 4)?;
        if ingest_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "INGEST_WORKERS must be at least 1".to_string(),
            ));
        }

        let channel_buffer: usize = parse_or(&lookup, "SNAPSHOT_CHANNEL_BUFFER", 100)?;
        if channel_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "SNAPSHOT_CHANNEL_BUFFER must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            db_path: lookup("PARKFLOW_DB_PATH").unwrap_or_else(|| "data/parkflow.db".to_string()),
            schema_dir: lookup("PARKFLOW_SCHEMA_DIR").unwrap_or_else(|| "sql".to_string()),
            busy_timeout: Duration::from_millis(parse_or(&lookup, "PARKFLOW_BUSY_TIMEOUT_MS", 5_000)?),
            ingest_workers,
            ingest_max_retries: parse_or(&lookup, "INGEST_MAX_RETRIES", 3)?,
            channel_buffer,
        })
    }
}

/// Settings for one compaction pass
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionConfig {
    /// Days before today (UTC) to compact when no explicit date is given
    pub days_back: u32,

    /// Explicit target date; overrides `days_back`
    pub date: Option<NaiveDate>,

    /// Row ids per DELETE statement
    pub batch_size: usize,

    /// Compute the plan without deleting anything
    pub dry_run: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            days_back: 1,
            date: None,
            batch_size: 100,
            dry_run: false,
        }
    }
}

impl CompactionConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `DAYS_BACK` (default: 1, i.e. yesterday)
    /// - `COMPACT_DATE` (optional, YYYY-MM-DD)
    /// - `BATCH_SIZE` (default: 100)
    /// - `DRY_RUN` (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let date = lookup("COMPACT_DATE")
            .map(|s| parse_date("COMPACT_DATE", &s))
            .transpose()?;

        let config = Self {
            days_back: parse_or(&lookup, "DAYS_BACK", defaults.days_back)?,
            date,
            batch_size: parse_or(&lookup, "BATCH_SIZE", defaults.batch_size)?,
            dry_run: lookup("DRY_RUN")
                .map(|s| parse_bool("DRY_RUN", &s))
                .transpose()?
                .unwrap_or(defaults.dry_run),
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides: `--date`, `--days-back`, `--batch-size`, `--dry-run`
    pub fn apply_args<I>(mut self, args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--dry-run" => self.dry_run = true,
                "--date" => {
                    let value = next_value(&mut args, "--date")?;
                    self.date = Some(parse_date("--date", &value)?);
                }
                "--days-back" => {
                    let value = next_value(&mut args, "--days-back")?;
                    self.days_back = parse_value("--days-back", &value)?;
                    self.date = None;
                }
                "--batch-size" => {
                    let value = next_value(&mut args, "--batch-size")?;
                    self.batch_size = parse_value("--batch-size", &value)?;
                }
                other => {
                    return Err(ConfigError::InvalidValue(format!("Unknown argument: {}", other)));
                }
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{} = '{}'", key, raw)))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue(format!("{} = '{}'", key, raw))),
    }
}

fn parse_date(key: &str, raw: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        ConfigError::InvalidValue(format!("{} must be YYYY-MM-DD, got '{}'", key, raw))
    })
}

fn next_value<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> Result<String, ConfigError> {
    args.next()
        .ok_or_else(|| ConfigError::MissingVariable(format!("value for {}", flag)))
}
