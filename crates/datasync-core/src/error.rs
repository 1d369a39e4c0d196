//! Error types for datasync-core
//!
//! Provides granular error classification for retry and propagation handling:
//! - Retriable errors (connection, timeout, generated-SQL rejections)
//! - Row-scoped errors (validation, integrity) that never abort a run
//! - Run-stopping errors that no smaller chunk would get past
//! - Operation-fatal errors (recovery verification, schema, configuration)

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type for datasync-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Opening the store or losing the connection (retriable)
    Connection,
    /// Statement or connect timeout (retriable)
    Timeout,
    /// Missing table/column, stale schema cache, illegal query shape
    Schema,
    /// Per-row/column violation found before any write
    Validation,
    /// Store rejected generated SQL (retriable, then an internal defect)
    Syntax,
    /// Key or uniqueness violation surfacing at the store
    Integrity,
    /// Snapshot verification mismatch during delete
    Recovery,
    /// Transaction state machine violation
    Transaction,
    /// Invalid configuration or caller input
    Configuration,
    /// Cancelled by the caller at a chunk boundary
    Cancelled,
    /// Unknown/other errors
    Internal,
}

impl ErrorCategory {
    /// Whether errors in this category are retried with backoff before surfacing
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::Syntax)
    }

    /// Whether errors in this category are scoped to one row and must not abort a run
    #[inline]
    pub const fn is_row_scoped(self) -> bool {
        matches!(self, Self::Validation | Self::Integrity)
    }

    /// Whether errors in this category end a batch run instead of being
    /// isolated by splitting the failing chunk. Retries have already been
    /// spent on them, and no smaller chunk would succeed.
    #[inline]
    pub const fn stops_run(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::Syntax | Self::Configuration | Self::Transaction
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Schema => write!(f, "schema"),
            Self::Validation => write!(f, "validation"),
            Self::Syntax => write!(f, "syntax"),
            Self::Integrity => write!(f, "integrity"),
            Self::Recovery => write!(f, "recovery"),
            Self::Transaction => write!(f, "transaction"),
            Self::Configuration => write!(f, "configuration"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Diagnostic context attached to an error: enough to diagnose a failure
/// without rerunning the operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorContext {
    /// Table the failing statement targeted
    pub table: Option<String>,
    /// Rendered predicate (placeholders, not values)
    pub predicate: Option<String>,
    /// Offending row, rendered as `column=value` pairs
    pub row: Option<String>,
    /// Input index of the offending row
    pub row_index: Option<usize>,
    /// SQL text of the failing statement
    pub sql: Option<String>,
}

impl ErrorContext {
    /// Context for a table
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            ..Default::default()
        }
    }

    /// Attach a predicate
    pub fn with_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    /// Attach an offending row
    pub fn with_row(mut self, index: usize, row: impl Into<String>) -> Self {
        self.row_index = Some(index);
        self.row = Some(row.into());
        self
    }

    /// Attach SQL text
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.table.is_none()
            && self.predicate.is_none()
            && self.row.is_none()
            && self.sql.is_none()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(t) = &self.table {
            parts.push(format!("table={}", t));
        }
        if let Some(p) = &self.predicate {
            parts.push(format!("predicate={}", p));
        }
        if let Some(i) = self.row_index {
            parts.push(format!("row_index={}", i));
        }
        if let Some(r) = &self.row {
            parts.push(format!("row={{{}}}", r));
        }
        if let Some(s) = &self.sql {
            parts.push(format!("sql={}", s));
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// Main error type for datasync-core
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed or was lost
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Schema error (stale cache, unsupported shape)
    #[error("schema error: {message}")]
    Schema { message: String },

    /// Table not found
    #[error("table not found: {table}")]
    TableNotFound { table: String },

    /// Column not found
    #[error("column not found: {column} in table {table}")]
    ColumnNotFound { table: String, column: String },

    /// Query builder rejected a statement before it reached the store
    #[error("build error: {message}")]
    Build { message: String },

    /// Aggregated validation failure
    #[error("validation failed: {violations} violation(s) in {rows} row(s)")]
    Validation { rows: usize, violations: usize },

    /// Store rejected generated SQL
    #[error("syntax error: {message}")]
    Syntax {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Key or uniqueness violation reported by the store
    #[error("integrity violation: {constraint} - {message}")]
    Integrity {
        constraint: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Snapshot verification mismatch
    #[error("recovery error during {stage}: expected {expected} row(s), found {actual}")]
    Recovery {
        stage: String,
        expected: u64,
        actual: u64,
    },

    /// Snapshot name already taken and appending was not confirmed
    #[error("snapshot table already exists: {name}")]
    SnapshotExists { name: String },

    /// Transaction state machine violation
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// Other driver-reported statement failure
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Cancelled at a chunk boundary
    #[error("operation cancelled after {processed} of {total} row(s)")]
    Cancelled { processed: u64, total: u64 },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },

    /// An error annotated with diagnostic context
    #[error("{source} [{context}]")]
    WithContext {
        context: ErrorContext,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Schema { .. }
            | Self::TableNotFound { .. }
            | Self::ColumnNotFound { .. }
            | Self::Build { .. } => ErrorCategory::Schema,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Syntax { .. } => ErrorCategory::Syntax,
            Self::Integrity { .. } => ErrorCategory::Integrity,
            Self::Recovery { .. } | Self::SnapshotExists { .. } => ErrorCategory::Recovery,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Query { .. } | Self::Internal { .. } => ErrorCategory::Internal,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::WithContext { source, .. } => source.category(),
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error poisons the connection it happened on
    pub fn is_connection_fatal(&self) -> bool {
        self.category() == ErrorCategory::Connection
    }

    /// Attach diagnostic context. Context already present is kept and the
    /// new fields fill the gaps.
    pub fn with_context(self, context: ErrorContext) -> Self {
        match self {
            Self::WithContext {
                context: existing,
                source,
            } => Self::WithContext {
                context: ErrorContext {
                    table: existing.table.or(context.table),
                    predicate: existing.predicate.or(context.predicate),
                    row: existing.row.or(context.row),
                    row_index: existing.row_index.or(context.row_index),
                    sql: existing.sql.or(context.sql),
                },
                source,
            },
            other if context.is_empty() => other,
            other => Self::WithContext {
                context,
                source: Box::new(other),
            },
        }
    }

    /// Get the attached context, if any
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::WithContext { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Innermost error with context stripped
    pub fn root(&self) -> &Error {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a build error
    pub fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
        }
    }

    /// Create a syntax error with the offending SQL
    pub fn syntax(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create an integrity error
    pub fn integrity(constraint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Integrity {
            constraint: constraint.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a recovery error
    pub fn recovery(stage: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::Recovery {
            stage: stage.into(),
            expected,
            actual,
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Serialisable summary of an error, carried by structured operation results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    /// Error category
    pub category: ErrorCategory,
    /// Rendered message of the innermost error
    pub message: String,
    /// Underlying driver message, when the store reported one
    pub driver_message: Option<String>,
    /// Diagnostic context
    pub context: ErrorContext,
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        let root = err.root();
        let driver_message = std::error::Error::source(root).map(|s| s.to_string());
        Self {
            category: err.category(),
            message: root.to_string(),
            driver_message,
            context: err.context().cloned().unwrap_or_default(),
        }
    }
}

impl From<Error> for ErrorReport {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)?;
        if let Some(d) = &self.driver_message {
            write!(f, ": {}", d)?;
        }
        if !self.context.is_empty() {
            write!(f, " ({})", self.context)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::Connection.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());
        assert!(ErrorCategory::Syntax.is_retriable());

        assert!(!ErrorCategory::Integrity.is_retriable());
        assert!(!ErrorCategory::Recovery.is_retriable());
        assert!(!ErrorCategory::Validation.is_retriable());
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(Error::connection("failed").is_retriable());
        assert!(Error::timeout("timed out").is_retriable());
        assert!(!Error::integrity("pk", "duplicate").is_retriable());
        assert!(!Error::recovery("copy", 4, 3).is_retriable());
    }

    #[test]
    fn test_context_preserves_category() {
        let err = Error::integrity("UNIQUE", "duplicate key")
            .with_context(ErrorContext::table("Sales").with_row(3, "id=7"));

        assert_eq!(err.category(), ErrorCategory::Integrity);
        assert!(err.category().is_row_scoped());
        let ctx = err.context().unwrap();
        assert_eq!(ctx.table.as_deref(), Some("Sales"));
        assert_eq!(ctx.row_index, Some(3));
    }

    #[test]
    fn test_context_merges_without_overwriting() {
        let err = Error::timeout("slow")
            .with_context(ErrorContext::table("A"))
            .with_context(ErrorContext::table("B").with_sql("SELECT 1"));

        let ctx = err.context().unwrap();
        assert_eq!(ctx.table.as_deref(), Some("A"));
        assert_eq!(ctx.sql.as_deref(), Some("SELECT 1"));
        assert!(matches!(err.root(), Error::Timeout { .. }));
    }

    #[test]
    fn test_error_report() {
        let driver = std::io::Error::new(std::io::ErrorKind::Other, "disk I/O error");
        let err = Error::connection_with_source("open failed", driver)
            .with_context(ErrorContext::table("Sales").with_predicate("[Time] >= ?"));

        let report = ErrorReport::from(&err);
        assert_eq!(report.category, ErrorCategory::Connection);
        assert!(report.message.contains("open failed"));
        assert_eq!(report.driver_message.as_deref(), Some("disk I/O error"));
        assert_eq!(report.context.predicate.as_deref(), Some("[Time] >= ?"));
        assert!(report.to_string().contains("table=Sales"));
    }
}
