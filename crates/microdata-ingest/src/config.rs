//! Ingestion configuration
//!
//! All tuning knobs of a run live in [`IngestConfig`], which is built once
//! (defaults, then environment, then CLI overrides) and handed to the driver.

use crate::error::{IngestError, Result};
use crate::schema::SurveyKey;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/statathon";

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Rows read from a file per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;

/// Chunks larger than this many records are loaded with COPY.
pub const DEFAULT_COPY_THRESHOLD: usize = 1_000;

/// Rows per multi-row INSERT statement.
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 1_000;

/// Commit after this many applied chunks.
pub const DEFAULT_COMMIT_EVERY: u64 = 5;

/// Attempts per chunk for transient database errors.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between attempts; attempt `n` waits `n` times this.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Destination table for records.
pub const DEFAULT_TARGET_TABLE: &str = "survey_data";

pub const DEFAULT_SURVEY_NAME: &str = "ASI";
pub const DEFAULT_SURVEY_YEAR: i32 = 2023;
pub const DEFAULT_LEVEL: &str = "ASI_BLOCK_C";

/// Columns carried by one bound INSERT row
pub const BIND_PARAMS_PER_ROW: usize = 4;

/// Postgres limit on bind parameters per statement
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub session: SessionSettings,
    pub loader: LoaderConfig,
    /// Rows read per chunk
    pub chunk_size: usize,
    /// Commit cadence, in applied chunks
    pub commit_every: u64,
    pub survey: SurveyKey,
    /// Level used for files without an explicit mapping
    pub default_level: Option<String>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub connect_timeout_secs: u64,
}

/// Session settings applied when the run's connection is opened
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSettings {
    pub synchronous_commit_off: bool,
    pub work_mem: String,
    pub maintenance_work_mem: String,
    pub temp_buffers: String,
    pub effective_cache_size: String,
}

/// ChunkLoader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Whether COPY may be used at all
    pub use_copy: bool,
    pub copy_threshold: usize,
    pub insert_batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub target_table: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            synchronous_commit_off: true,
            work_mem: "256MB".to_string(),
            maintenance_work_mem: "256MB".to_string(),
            temp_buffers: "64MB".to_string(),
            effective_cache_size: "1GB".to_string(),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            use_copy: true,
            copy_threshold: DEFAULT_COPY_THRESHOLD,
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            target_table: DEFAULT_TARGET_TABLE.to_string(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            session: SessionSettings::default(),
            loader: LoaderConfig::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            commit_every: DEFAULT_COMMIT_EVERY,
            survey: SurveyKey {
                name: DEFAULT_SURVEY_NAME.to_string(),
                year: DEFAULT_SURVEY_YEAR,
            },
            default_level: Some(DEFAULT_LEVEL.to_string()),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl IngestConfig {
    /// Load configuration from `.env` and environment variables, then validate.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let session = SessionSettings::default();
        let loader = LoaderConfig::default();

        let config = Self {
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            session: SessionSettings {
                synchronous_commit_off: env_or(
                    "INGEST_SYNC_COMMIT_OFF",
                    session.synchronous_commit_off,
                ),
                work_mem: env_string("INGEST_WORK_MEM", &session.work_mem),
                maintenance_work_mem: env_string(
                    "INGEST_MAINTENANCE_WORK_MEM",
                    &session.maintenance_work_mem,
                ),
                temp_buffers: env_string("INGEST_TEMP_BUFFERS", &session.temp_buffers),
                effective_cache_size: env_string(
                    "INGEST_EFFECTIVE_CACHE_SIZE",
                    &session.effective_cache_size,
                ),
            },
            loader: LoaderConfig {
                use_copy: env_or("INGEST_USE_COPY", loader.use_copy),
                copy_threshold: env_or("INGEST_COPY_THRESHOLD", loader.copy_threshold),
                insert_batch_size: env_or("INGEST_INSERT_BATCH_SIZE", loader.insert_batch_size),
                max_retries: env_or("INGEST_MAX_RETRIES", loader.max_retries),
                retry_delay_ms: env_or("INGEST_RETRY_DELAY_MS", loader.retry_delay_ms),
                target_table: env_string("INGEST_TARGET_TABLE", &loader.target_table),
            },
            chunk_size: env_or("INGEST_CHUNK_SIZE", defaults.chunk_size),
            commit_every: env_or("INGEST_COMMIT_EVERY", defaults.commit_every),
            survey: SurveyKey {
                name: env_string("INGEST_SURVEY_NAME", DEFAULT_SURVEY_NAME),
                year: env_or("INGEST_SURVEY_YEAR", DEFAULT_SURVEY_YEAR),
            },
            default_level: match std::env::var("INGEST_DEFAULT_LEVEL") {
                Ok(level) if level.trim().is_empty() => None,
                Ok(level) => Some(level),
                Err(_) => defaults.default_level,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(IngestError::Config("Database URL cannot be empty".into()));
        }
        if self.chunk_size == 0 {
            return Err(IngestError::Config("chunk_size must be greater than 0".into()));
        }
        if self.commit_every == 0 {
            return Err(IngestError::Config("commit_every must be greater than 0".into()));
        }
        self.loader.validate()?;
        self.session.validate()?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.insert_batch_size == 0 {
            return Err(IngestError::Config(
                "insert_batch_size must be greater than 0".into(),
            ));
        }
        if self.insert_batch_size * BIND_PARAMS_PER_ROW > MAX_BIND_PARAMS {
            return Err(IngestError::Config(format!(
                "insert_batch_size {} exceeds the bind parameter limit ({} rows max)",
                self.insert_batch_size,
                MAX_BIND_PARAMS / BIND_PARAMS_PER_ROW
            )));
        }
        if self.max_retries == 0 {
            return Err(IngestError::Config("max_retries must be at least 1".into()));
        }
        if !table_name_pattern().is_match(&self.target_table) {
            return Err(IngestError::Config(format!(
                "Invalid target table name: {}",
                self.target_table
            )));
        }
        Ok(())
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

impl SessionSettings {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in self.memory_settings() {
            if !memory_value_pattern().is_match(value) {
                return Err(IngestError::Config(format!(
                    "Invalid value for {}: '{}'",
                    name, value
                )));
            }
        }
        Ok(())
    }

    fn memory_settings(&self) -> [(&'static str, &str); 4] {
        [
            ("work_mem", self.work_mem.as_str()),
            ("maintenance_work_mem", self.maintenance_work_mem.as_str()),
            ("temp_buffers", self.temp_buffers.as_str()),
            ("effective_cache_size", self.effective_cache_size.as_str()),
        ]
    }

    /// `SET` statements applied at session start.
    ///
    /// Values are interpolated, so callers must have validated them first.
    pub fn statements(&self) -> Vec<String> {
        let mut statements = Vec::with_capacity(5);
        if self.synchronous_commit_off {
            statements.push("SET synchronous_commit TO off".to_string());
        }
        for (name, value) in self.memory_settings() {
            statements.push(format!("SET {} TO '{}'", name, value));
        }
        statements
    }
}

fn table_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

fn memory_value_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9]+(kB|MB|GB|TB)?$").unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}
