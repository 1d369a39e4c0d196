//! Embedded store backend for datasync-core
//!
//! Provides the single-file store implementation:
//! - Connection with connection-level transaction control
//! - Parameter binding (values are never interpolated into SQL text)
//! - Driver error classification into the crate's error taxonomy
//! - Per-statement timeouts with interruption of the running statement
//!
//! The driver is blocking, so every statement runs on the blocking thread
//! pool and is awaited under the configured statement timeout.
//!
//! Statements are retried only outside a native transaction. An interrupted
//! write can make the store roll the whole transaction back, after which a
//! retry would run in autocommit mode. The failure is surfaced instead, and
//! commit reports a transaction the store already discarded.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{ErrorCode, InterruptHandle, OpenFlags};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, RetryPolicy};
use crate::error::{Error, ErrorCategory, Result};
use crate::types::{Row, Value};

/// Embedded store connection
pub struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
    interrupt: Arc<InterruptHandle>,
    statement_timeout: Duration,
    retry: RetryPolicy,
    in_transaction: AtomicBool,
    closed: AtomicBool,
    created_at: Instant,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("statement_timeout", &self.statement_timeout)
            .field("in_transaction", &self.in_transaction.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

impl SqliteConnection {
    /// Open a connection to the store file named by `config`
    pub async fn open(config: &ConnectionConfig) -> Result<Self> {
        if !config.create_if_missing && !config.path.exists() {
            return Err(Error::config(format!(
                "database file not found: {}",
                config.path.display()
            )));
        }

        let path = config.path.clone();
        let create = config.create_if_missing;
        let busy_timeout = config.statement_timeout;
        let task = tokio::task::spawn_blocking(move || open_blocking(&path, create, busy_timeout));

        let opened = if config.connect_timeout.is_zero() {
            task.await
        } else {
            tokio::time::timeout(config.connect_timeout, task)
                .await
                .map_err(|_| {
                    Error::timeout(format!(
                        "opening {} exceeded {:?}",
                        config.path.display(),
                        config.connect_timeout
                    ))
                })?
        };

        let conn = opened
            .map_err(|e| Error::internal(format!("open task failed: {}", e)))?
            .map_err(|e| {
                Error::connection_with_source(
                    format!("failed to open {}", config.connection_string()),
                    e,
                )
            })?;

        debug!(path = %config.path.display(), "opened store connection");
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            statement_timeout: config.statement_timeout,
            retry: config.retry,
            in_transaction: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
        })
    }

    /// Time since the connection was opened
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether a native transaction was started and not yet settled
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    fn statement_retry(&self) -> RetryPolicy {
        if self.in_transaction() {
            RetryPolicy::none()
        } else {
            self.retry
        }
    }

    async fn run<T, F>(&self, sql: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::connection("connection is closed"));
        }

        let conn = Arc::clone(&self.conn);
        let abandoned = Arc::new(AtomicBool::new(false));
        let gave_up = Arc::clone(&abandoned);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            // The caller stopped waiting before the statement got the lock
            if gave_up.load(Ordering::SeqCst) {
                return Err(abandoned_error());
            }
            f(&mut guard)
        });

        let joined = if self.statement_timeout.is_zero() {
            task.await
        } else {
            match tokio::time::timeout(self.statement_timeout, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    abandoned.store(true, Ordering::SeqCst);
                    self.interrupt.interrupt();
                    warn!(sql, timeout = ?self.statement_timeout, "statement timed out, interrupted");
                    return Err(Error::timeout(format!(
                        "statement exceeded {:?}",
                        self.statement_timeout
                    )));
                }
            }
        };

        joined
            .map_err(|e| Error::internal(format!("statement task failed: {}", e)))?
            .map_err(|e| map_sqlite_error(e, sql))
    }
}

fn abandoned_error() -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
        Some("statement abandoned after timeout".to_string()),
    )
}

fn open_blocking(
    path: &std::path::Path,
    create: bool,
    busy_timeout: Duration,
) -> rusqlite::Result<rusqlite::Connection> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    if create {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }
    let conn = rusqlite::Connection::open_with_flags(path, flags)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    if !busy_timeout.is_zero() {
        conn.busy_timeout(busy_timeout)?;
    }
    Ok(conn)
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int64(n) => SqlValue::Integer(*n),
        Value::Float64(n) => SqlValue::Real(*n),
        // Text keeps full precision; numeric column affinity converts it on store
        Value::Decimal(d) => SqlValue::Text(d.to_string()),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
        Value::DateTime(dt) => SqlValue::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Int64(n),
        ValueRef::Real(n) => Value::Float64(n),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn bind(params: &[Value]) -> Vec<SqlValue> {
    params.iter().map(to_sql_value).collect()
}

/// Classify a driver error
fn map_sqlite_error(err: rusqlite::Error, sql: &str) -> Error {
    let (code, message) = match &err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            (Some(e.code), msg.clone().unwrap_or_else(|| e.to_string()))
        }
        other => (None, other.to_string()),
    };

    match code {
        Some(ErrorCode::ConstraintViolation) => Error::Integrity {
            constraint: constraint_name(&message),
            message,
            source: Some(Box::new(err)),
        },
        Some(ErrorCode::DatabaseBusy)
        | Some(ErrorCode::DatabaseLocked)
        | Some(ErrorCode::OperationInterrupted) => Error::timeout(message),
        Some(ErrorCode::CannotOpen)
        | Some(ErrorCode::NotADatabase)
        | Some(ErrorCode::DatabaseCorrupt)
        | Some(ErrorCode::SystemIoFailure) => Error::connection_with_source(message, err),
        _ if message.contains("syntax error") || message.contains("unrecognized token") => {
            Error::Syntax {
                message,
                sql: Some(sql.to_string()),
                source: Some(Box::new(err)),
            }
        }
        _ if message.starts_with("no such table") => Error::TableNotFound {
            table: message
                .trim_start_matches("no such table:")
                .trim()
                .to_string(),
        },
        _ if message.contains("no such column") || message.contains("has no column named") => {
            Error::schema(message)
        }
        _ => Error::Query {
            message,
            sql: Some(sql.to_string()),
            source: Some(Box::new(err)),
        },
    }
}

/// Constraint kind from a driver message such as
/// `UNIQUE constraint failed: Sales.ID`
fn constraint_name(message: &str) -> String {
    match message.split_once(':') {
        Some((kind, target)) => format!("{} ({})", kind.trim_end_matches(" constraint failed"), target.trim()),
        None => message.to_string(),
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.statement_retry()
            .run("query", move || {
                let owned_sql = sql.to_string();
                let bound = bind(params);
                self.run(sql, move |conn| {
                    let mut stmt = conn.prepare(&owned_sql)?;
                    let columns: Vec<String> =
                        stmt.column_names().into_iter().map(String::from).collect();
                    let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter()))?;
                    let mut out = Vec::new();
                    while let Some(row) = rows.next()? {
                        let mut values = Vec::with_capacity(columns.len());
                        for idx in 0..columns.len() {
                            values.push(from_value_ref(row.get_ref(idx)?));
                        }
                        out.push(Row::new(columns.clone(), values));
                    }
                    Ok(out)
                })
            })
            .await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.statement_retry()
            .run("execute", move || {
                let owned_sql = sql.to_string();
                let bound = bind(params);
                self.run(sql, move |conn| {
                    let affected = conn.execute(&owned_sql, rusqlite::params_from_iter(bound.iter()))?;
                    Ok(affected as u64)
                })
            })
            .await
    }

    async fn begin(&self) -> Result<()> {
        self.run("BEGIN", |conn| conn.execute_batch("BEGIN"))
            .await
            .map_err(|e| match e.category() {
                ErrorCategory::Connection | ErrorCategory::Timeout => e,
                _ => Error::transaction(format!("failed to begin transaction: {}", e)),
            })?;
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let committed = self
            .run("COMMIT", |conn| {
                // The store rolls back on its own after an interrupted write
                if conn.is_autocommit() {
                    return Ok(false);
                }
                conn.execute_batch("COMMIT")?;
                Ok(true)
            })
            .await?;
        self.in_transaction.store(false, Ordering::SeqCst);
        if !committed {
            warn!("native transaction was rolled back by the store before commit");
            return Err(Error::transaction(
                "commit failed: the store already rolled the transaction back",
            ));
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.in_transaction.store(false, Ordering::SeqCst);
        self.run("ROLLBACK", |conn| {
            // The store may already have rolled back on its own
            if conn.is_autocommit() {
                return Ok(false);
            }
            conn.execute_batch("ROLLBACK")?;
            Ok(true)
        })
        .await
        .map(|issued| {
            if !issued {
                debug!("no native transaction active at rollback");
            }
        })
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.run("SELECT 1", |conn| conn.execute_batch("SELECT 1"))
            .await
            .is_ok()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(age = ?self.age(), "closing store connection");
        // The file handle is released when the last reference drops
        Ok(())
    }
}

/// Factory opening [`SqliteConnection`]s with bounded retry
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnectionFactory;

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let conn = config
            .retry
            .run("connect", move || SqliteConnection::open(config))
            .await?;
        Ok(Box::new(conn))
    }

    fn backend_name(&self) -> &'static str {
        "SQLite"
    }
}
