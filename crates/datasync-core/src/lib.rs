//! # datasync-core
//!
//! Transactional batch engine for moving spreadsheet rows into an embedded
//! relational store, built for a single operator running bulk loads and
//! destructive deletes on business-critical data.
//!
//! ## Features
//!
//! - **Universal Identifier Quoting**: every identifier is bracket-quoted, idempotently
//! - **Parameterized Statements**: values are always bound, never inlined
//! - **Logical Nested Transactions**: depth counting over one native transaction,
//!   rollback-only marking, single rollback per context
//! - **Validation Pipeline**: schema-aware checks with an explicit coercion table
//!   for currency, percent and thousands-formatted input
//! - **Batch Executor**: per-chunk transactions with bisection retry down to single rows
//! - **Delete Recovery**: snapshot, verify, delete, verify; snapshots expire after a
//!   retention period
//! - **Monitoring**: per-operation timing and row counts through the `metrics` facade
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use datasync_core::prelude::*;
//!
//! let config = EngineConfig::new("sales.db").with_batch_size(1000);
//! let mut engine = DataSyncEngine::new(config)?;
//!
//! // Load rows, upserting on the table's key
//! let result = engine
//!     .insert_batch("Sales", &rows, 1000, WriteMode::Upsert, |done, total| {
//!         println!("{done}/{total}");
//!     })
//!     .await;
//!
//! // Delete one year, keeping a snapshot of every removed row
//! let deleted = engine
//!     .delete_by_date("Sales", DateFilter::parse("2025")?)
//!     .await;
//!
//! // Drop snapshots older than a week
//! engine.cleanup_snapshots(7).await;
//! engine.close().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod batch;
pub mod coercion;
pub mod config;
pub mod connection;
pub mod date_filter;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod monitoring;
pub mod query;
pub mod recovery;
pub mod schema;
pub mod sqlite;
pub mod transaction;
pub mod types;
pub mod validation;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, ErrorContext, ErrorReport, Result};

    // Value and type system
    pub use crate::types::{ColumnMetadata, ColumnType, KeyDescriptor, Row, TableSchema, Value};

    // Connection traits and config
    pub use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, RetryPolicy};
    pub use crate::sqlite::{SqliteConnection, SqliteConnectionFactory};

    // Dialect and statements
    pub use crate::date_filter::DateFilter;
    pub use crate::dialect::{SqlDialect, SqliteDialect};
    pub use crate::query::{Predicate, QueryBuilder, Select, Statement};

    // Transactions
    pub use crate::transaction::{TransactionContext, TransactionManager, TransactionState};

    // Validation
    pub use crate::coercion::FormatTag;
    pub use crate::validation::{
        validate_row, validate_rows, ValidationError, ValidationErrorKind, ValidationResult,
        ValidationRules, ValueRange,
    };

    // Batches and deletes
    pub use crate::batch::{BatchOptions, BatchResult, FailedRow, WriteMode};
    pub use crate::recovery::{
        CleanupResult, DeleteOptions, DeleteResult, DeleteState, SnapshotInfo, SnapshotName,
    };

    // Engine
    pub use crate::config::{resolve_database_path, EngineConfig};
    pub use crate::engine::{DataSyncEngine, OperationResult, TableInfo};
    pub use crate::monitoring::{AggregatedMetrics, OperationMetrics, OperationMonitor};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::Value;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _value = Value::Int64(42);
        let _config = ConnectionConfig::new("sales.db");
        let _options = BatchOptions::default();
        let _mode = WriteMode::Upsert;
    }

    #[test]
    fn test_error_types() {
        let err = Error::connection("test error");
        assert!(err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Connection);
    }

    #[test]
    fn test_write_modes() {
        assert_eq!(WriteMode::default(), WriteMode::Insert);
    }

    #[test]
    fn test_dialect_name() {
        assert_eq!(SqliteDialect.name(), "SQLite");
    }
}
