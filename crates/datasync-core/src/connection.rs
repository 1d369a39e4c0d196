//! Connection traits for datasync-core
//!
//! Core abstractions for store connectivity:
//! - Connection: statement execution plus connection-level transaction control
//! - ConnectionFactory: opens connections from a [`ConnectionConfig`]
//! - RetryPolicy: bounded attempts with linear backoff for retriable failures
//!
//! The store supports a single transaction per connection, so `begin`,
//! `commit` and `rollback` live on the connection itself. Nesting is handled
//! by the transaction manager, never by the backend.

use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Database connection trait
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a query and return all rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement and return the number of affected rows
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a query and return the first row
    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Start the connection's native transaction
    async fn begin(&self) -> Result<()>;

    /// Commit the connection's native transaction
    async fn commit(&self) -> Result<()>;

    /// Roll back the connection's native transaction
    async fn rollback(&self) -> Result<()>;

    /// Check if connection is still valid
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Read a single non-negative integer from the first column of the first
/// row. A missing row or a non-integer value is an error, never zero.
pub async fn query_count(conn: &dyn Connection, sql: &str, params: &[Value]) -> Result<u64> {
    let row = conn
        .query_one(sql, params)
        .await?
        .ok_or_else(|| Error::query_with_sql("count query returned no row", sql))?;
    let value = row
        .get(0)
        .ok_or_else(|| Error::query_with_sql("count query returned no columns", sql))?;
    value
        .as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| {
            Error::query_with_sql(format!("count query returned {} instead of a count", value), sql)
        })
}

/// Bounded retry with linear backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay added per failed attempt
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_step: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }

    /// Run `op` until it succeeds, fails with a non-retriable error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation = what,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after retriable error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Configuration for creating connections
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Driver name used in the connection string
    pub driver_name: String,
    /// Path of the store file
    pub path: PathBuf,
    /// Create the file when it does not exist
    pub create_if_missing: bool,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Per-statement timeout (zero = no timeout)
    pub statement_timeout: Duration,
    /// Retry policy for opening connections and retriable statements
    pub retry: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            driver_name: "SQLite3".into(),
            path: PathBuf::new(),
            create_if_missing: false,
            connect_timeout: Duration::from_secs(10),
            statement_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create configuration for a store file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the driver name
    pub fn with_driver(mut self, driver_name: impl Into<String>) -> Self {
        self.driver_name = driver_name.into();
        self
    }

    /// Create the store file when missing
    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set per-statement timeout
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Driver connection string built from driver name and file path
    pub fn connection_string(&self) -> String {
        format!("DRIVER={{{}}};DBQ={};", self.driver_name, self.path.display())
    }
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;

    /// Name of the backend
    fn backend_name(&self) -> &'static str;
}
