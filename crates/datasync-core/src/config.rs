//! Engine configuration
//!
//! [`EngineConfig`] is deserialised by the caller (file, environment, CLI)
//! and validated once. The store path is resolved up front through
//! [`resolve_database_path`]; the engine never searches for it itself.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use validator::Validate;

use crate::connection::{ConnectionConfig, RetryPolicy};
use crate::error::{Error, Result};
use crate::recovery::DEFAULT_RETENTION_DAYS;

/// Environment variable consulted by [`resolve_database_path`]
pub const DATABASE_PATH_ENV: &str = "DATASYNC_DATABASE";

/// File extensions recognised when scanning a directory for a store
pub const STORE_EXTENSIONS: &[&str] = &["db", "sqlite", "sqlite3", "accdb", "mdb"];

/// Configuration for [`DataSyncEngine`](crate::engine::DataSyncEngine)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EngineConfig {
    /// Store file
    pub database_path: PathBuf,

    /// Driver name used in the connection string
    #[serde(default = "default_driver_name")]
    #[validate(length(min = 1))]
    pub driver_name: String,

    /// Create the store file when it does not exist
    #[serde(default)]
    pub create_if_missing: bool,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,

    /// Per-statement timeout in milliseconds
    #[serde(default = "default_statement_timeout_ms")]
    #[validate(range(min = 1))]
    pub statement_timeout_ms: u64,

    /// Retries after the first attempt for connection, timeout and syntax errors
    #[serde(default = "default_max_retries")]
    #[validate(range(max = 10))]
    pub max_retries: u32,

    /// Linear backoff step in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Rows per chunk transaction; 1 processes row by row
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 1000000))]
    pub batch_size: usize,

    /// Column used by date filters
    #[serde(default = "default_date_column")]
    #[validate(length(min = 1))]
    pub date_column: String,

    /// Days a snapshot table is kept
    #[serde(default = "default_retention_days")]
    pub snapshot_retention_days: u32,

    /// Abort a batch before writing when any row fails validation
    #[serde(default)]
    pub strict_validation: bool,

    /// Operations slower than this are logged as slow
    #[serde(default = "default_slow_operation_threshold_ms")]
    pub slow_operation_threshold_ms: u64,
}

fn default_driver_name() -> String {
    "SQLite3".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_statement_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    1
}

fn default_date_column() -> String {
    "Time".to_string()
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_slow_operation_threshold_ms() -> u64 {
    5_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::new(),
            driver_name: default_driver_name(),
            create_if_missing: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            statement_timeout_ms: default_statement_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            batch_size: default_batch_size(),
            date_column: default_date_column(),
            snapshot_retention_days: default_retention_days(),
            strict_validation: false,
            slow_operation_threshold_ms: default_slow_operation_threshold_ms(),
        }
    }
}

impl EngineConfig {
    /// Configuration for the store at `path` with defaults elsewhere
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
            ..Self::default()
        }
    }

    /// Set create-if-missing
    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Set the driver name
    pub fn with_driver(mut self, driver_name: impl Into<String>) -> Self {
        self.driver_name = driver_name.into();
        self
    }

    /// Set the statement timeout
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set retry count and backoff step
    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the default batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the date column
    pub fn with_date_column(mut self, column: impl Into<String>) -> Self {
        self.date_column = column.into();
        self
    }

    /// Set snapshot retention
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.snapshot_retention_days = days;
        self
    }

    /// Enable strict validation
    pub fn with_strict_validation(mut self, strict: bool) -> Self {
        self.strict_validation = strict;
        self
    }

    /// Set the slow operation threshold
    pub fn with_slow_operation_threshold(mut self, threshold: Duration) -> Self {
        self.slow_operation_threshold_ms = threshold.as_millis() as u64;
        self
    }

    /// Validate field ranges and the store path
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("invalid engine configuration: {}", e)))?;
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::config("database_path is not set"));
        }
        Ok(())
    }

    /// Retry policy derived from `max_retries` and `retry_backoff_ms`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries + 1,
            backoff_step: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Connection settings for the store
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.database_path.clone())
            .with_driver(self.driver_name.clone())
            .with_create_if_missing(self.create_if_missing)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_statement_timeout(Duration::from_millis(self.statement_timeout_ms))
            .with_retry(self.retry_policy())
    }

    /// Slow operation threshold
    pub fn slow_operation_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_operation_threshold_ms)
    }
}

/// Resolve the store path: explicit path, then the environment variable
/// `env_var`, then the first store-like file in `scan_dir` by name.
pub fn resolve_database_path(
    explicit: Option<&Path>,
    env_var: &str,
    scan_dir: Option<&Path>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        debug!(path = %path.display(), "using explicit database path");
        return Ok(path.to_path_buf());
    }

    if let Ok(value) = std::env::var(env_var) {
        let value = value.trim();
        if !value.is_empty() {
            debug!(env_var, path = value, "using database path from environment");
            return Ok(PathBuf::from(value));
        }
    }

    if let Some(dir) = scan_dir {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::config(format!("cannot scan {} for a database: {}", dir.display(), e))
        })?;
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_store_file(path))
            .collect();
        candidates.sort();
        if let Some(found) = candidates.into_iter().next() {
            debug!(path = %found.display(), "found database by directory scan");
            return Ok(found);
        }
    }

    Err(Error::config(format!(
        "no database path: pass one explicitly, set {}, or place a store file in the scan directory",
        env_var
    )))
}

fn is_store_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| STORE_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(ext)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new("sales.db");
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.date_column, "Time");
        assert_eq!(config.snapshot_retention_days, 7);
        assert!(!config.strict_validation);
        assert!(config.check().is_ok());
        assert_eq!(config.retry_policy().max_attempts, 3);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"database_path": "/data/sales.db", "batch_size": 500}"#)
                .unwrap();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.driver_name, "SQLite3");
        assert_eq!(config.statement_timeout_ms, 30_000);
    }

    #[test]
    fn test_check_rejects_bad_values() {
        assert!(EngineConfig::new("a.db").with_batch_size(0).check().is_err());
        assert!(EngineConfig::new("a.db").with_date_column("").check().is_err());
        assert!(EngineConfig::default().check().is_err());
    }

    #[test]
    fn test_connection_config() {
        let config = EngineConfig::new("/data/sales.db")
            .with_retries(0, Duration::from_millis(10))
            .with_statement_timeout(Duration::from_secs(5));
        let conn = config.connection_config();
        assert_eq!(conn.path, PathBuf::from("/data/sales.db"));
        assert_eq!(conn.retry.max_attempts, 1);
        assert_eq!(conn.statement_timeout, Duration::from_secs(5));
        assert_eq!(conn.connection_string(), "DRIVER={SQLite3};DBQ=/data/sales.db;");
    }

    #[test]
    fn test_resolve_explicit_first() {
        let path = resolve_database_path(
            Some(Path::new("/x/explicit.db")),
            "DATASYNC_TEST_RESOLVE_EXPLICIT",
            None,
        )
        .unwrap();
        assert_eq!(path, PathBuf::from("/x/explicit.db"));
    }

    #[test]
    fn test_resolve_from_environment() {
        std::env::set_var("DATASYNC_TEST_RESOLVE_ENV", "/x/from_env.db");
        let path = resolve_database_path(None, "DATASYNC_TEST_RESOLVE_ENV", None).unwrap();
        assert_eq!(path, PathBuf::from("/x/from_env.db"));
        std::env::remove_var("DATASYNC_TEST_RESOLVE_ENV");
    }

    #[test]
    fn test_resolve_by_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        std::fs::write(dir.path().join("b.sqlite"), b"").unwrap();
        std::fs::write(dir.path().join("a.accdb"), b"").unwrap();

        let path =
            resolve_database_path(None, "DATASYNC_TEST_RESOLVE_SCAN", Some(dir.path())).unwrap();
        assert_eq!(path, dir.path().join("a.accdb"));

        let empty = tempfile::tempdir().unwrap();
        assert!(
            resolve_database_path(None, "DATASYNC_TEST_RESOLVE_SCAN", Some(empty.path())).is_err()
        );
    }
}
