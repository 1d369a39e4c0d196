//! Public operation surface
//!
//! [`DataSyncEngine`] owns the transaction manager, the schema catalog and
//! the operation monitor. Every operation returns an [`OperationResult`]
//! carrying success, rows affected, errors and duration; nothing is
//! discarded silently.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::batch::{AtomicBatchStats, BatchExecutor, BatchOptions, BatchResult, BatchStats, WriteMode};
use crate::coercion::from_store;
use crate::config::EngineConfig;
use crate::connection::ConnectionFactory;
use crate::date_filter::DateFilter;
use crate::dialect::{SqlDialect, SqliteDialect};
use crate::error::{Error, ErrorCategory, ErrorContext, ErrorReport, Result};
use crate::monitoring::{OperationId, OperationMonitor};
use crate::query::{OrderBy, QueryBuilder, Select, Statement};
use crate::recovery::{
    CleanupResult, Clock, DeleteOptions, DeleteResult, RecoveryManager, SnapshotInfo, SystemClock,
};
use crate::schema::{SchemaCatalog, StoreSchemaProvider};
use crate::sqlite::SqliteConnectionFactory;
use crate::transaction::TransactionManager;
use crate::types::{ForeignKeyDescriptor, KeyDescriptor, Row, TableSchema, Value};
use crate::validation::{composite_key, ValidationRules};

const OPERATIONS: &[&str] = &[
    "list_tables",
    "get_table_info",
    "read_filtered",
    "delete_by_date",
    "insert_batch",
    "cleanup_snapshots",
    "list_snapshots",
];

/// Structured result of a public operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult<T> {
    /// Whether the operation completed without errors
    pub success: bool,
    /// Rows read, written or deleted
    pub rows_affected: u64,
    /// Every error observed
    pub errors: Vec<ErrorReport>,
    /// Wall time
    #[serde(skip)]
    pub duration: Duration,
    /// Operation output; `None` when the operation failed before producing one
    pub value: Option<T>,
}

impl<T> OperationResult<T> {
    /// Output, if any
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Take the output
    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// First error, if any
    pub fn first_error(&self) -> Option<&ErrorReport> {
        self.errors.first()
    }
}

/// Output types that know their own outcome
pub trait Outcome {
    /// Rows read, written or deleted
    fn rows_affected(&self) -> u64;

    /// Errors carried inside the output
    fn errors(&self) -> Vec<ErrorReport> {
        Vec::new()
    }
}

impl Outcome for Vec<String> {
    fn rows_affected(&self) -> u64 {
        0
    }
}

impl Outcome for Vec<Row> {
    fn rows_affected(&self) -> u64 {
        self.len() as u64
    }
}

impl Outcome for Vec<SnapshotInfo> {
    fn rows_affected(&self) -> u64 {
        0
    }
}

impl Outcome for BatchResult {
    fn rows_affected(&self) -> u64 {
        self.committed_count
    }

    fn errors(&self) -> Vec<ErrorReport> {
        let mut errors: Vec<ErrorReport> = self
            .failed_rows
            .iter()
            .map(|failed| match &failed.error {
                Some(report) => report.clone(),
                None => ErrorReport {
                    category: ErrorCategory::Validation,
                    message: failed
                        .validation
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join("; "),
                    driver_message: None,
                    context: ErrorContext::default().with_row(failed.index, failed.row.describe()),
                },
            })
            .collect();
        errors.extend(self.error.clone());
        errors
    }
}

impl Outcome for DeleteResult {
    fn rows_affected(&self) -> u64 {
        self.deleted
    }

    fn errors(&self) -> Vec<ErrorReport> {
        self.error.iter().cloned().collect()
    }
}

impl Outcome for CleanupResult {
    fn rows_affected(&self) -> u64 {
        self.dropped.len() as u64
    }

    fn errors(&self) -> Vec<ErrorReport> {
        self.failed.iter().map(|(_, e)| e.clone()).collect()
    }
}

/// Table details returned by [`DataSyncEngine::get_table_info`]
#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    /// Column layout
    pub schema: TableSchema,
    /// Current row count
    pub record_count: u64,
    /// Primary key and unique indexes
    pub keys: Vec<KeyDescriptor>,
    /// Declared foreign keys
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl Outcome for TableInfo {
    fn rows_affected(&self) -> u64 {
        0
    }
}

/// Transactional batch engine over one store file
pub struct DataSyncEngine {
    config: EngineConfig,
    transactions: TransactionManager,
    catalog: SchemaCatalog,
    dialect: SqliteDialect,
    monitor: OperationMonitor,
    stats: AtomicBatchStats,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DataSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSyncEngine")
            .field("config", &self.config)
            .field("transactions", &self.transactions)
            .field("cached_tables", &self.catalog.len())
            .finish()
    }
}

impl DataSyncEngine {
    /// Engine over the embedded store backend
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_factory(config, Arc::new(SqliteConnectionFactory))
    }

    /// Engine over a custom connection factory
    pub fn with_factory(config: EngineConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        config.check()?;
        let monitor = OperationMonitor::new();
        for name in OPERATIONS {
            monitor.set_threshold(*name, config.slow_operation_threshold());
        }
        Ok(Self {
            transactions: TransactionManager::new(factory, config.connection_config()),
            catalog: SchemaCatalog::new(),
            dialect: SqliteDialect,
            monitor,
            stats: AtomicBatchStats::default(),
            clock: Arc::new(SystemClock),
            config,
        })
    }

    /// Replace the clock used for snapshot naming and retention
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Operation monitor
    pub fn monitor(&self) -> &OperationMonitor {
        &self.monitor
    }

    /// Cumulative batch statistics
    pub fn batch_stats(&self) -> BatchStats {
        self.stats.snapshot()
    }

    /// Schema cache
    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    fn conclude<T: Outcome>(
        &self,
        id: OperationId,
        started: Instant,
        outcome: Result<T>,
    ) -> OperationResult<T> {
        let result = match outcome {
            Ok(value) => {
                let errors = value.errors();
                OperationResult {
                    success: errors.is_empty(),
                    rows_affected: value.rows_affected(),
                    errors,
                    duration: started.elapsed(),
                    value: Some(value),
                }
            }
            Err(e) => {
                error!(error = %e, category = %e.category(), "operation failed");
                if let Err(me) = self.monitor.record_error(id, &e) {
                    debug!(error = %me, "monitor lost operation");
                }
                OperationResult {
                    success: false,
                    rows_affected: 0,
                    errors: vec![ErrorReport::from(&e)],
                    duration: started.elapsed(),
                    value: None,
                }
            }
        };
        if let Err(me) = self.monitor.finish(id, result.success, result.rows_affected) {
            debug!(error = %me, "monitor lost operation");
        }
        result
    }

    async fn schema(&mut self, table: &str) -> Result<Arc<TableSchema>> {
        if let Some(schema) = self.catalog.cached(table) {
            return Ok(schema);
        }
        let ctx = self.transactions.context().await?;
        let provider = StoreSchemaProvider::new(ctx.connection()?, &self.dialect);
        self.catalog.get(&provider, table).await
    }

    /// Names of all user tables, snapshot tables included
    pub async fn list_tables(&mut self) -> OperationResult<Vec<String>> {
        let started = Instant::now();
        let id = self.monitor.start("list_tables", None);
        let outcome = async {
            let stmt = Statement::new(self.dialect.list_tables_sql());
            let mut ctx = self.transactions.context().await?;
            let rows = ctx.query(&stmt).await?;
            Ok::<_, Error>(
                rows.iter()
                    .filter_map(|r| r.get_by_name("name").and_then(Value::as_str).map(String::from))
                    .collect::<Vec<_>>(),
            )
        };
        let outcome = outcome.await;
        self.conclude(id, started, outcome)
    }

    /// Schema, record count, keys and foreign keys of a table
    pub async fn get_table_info(&mut self, table: &str) -> OperationResult<TableInfo> {
        let started = Instant::now();
        let id = self.monitor.start("get_table_info", Some(table));
        let outcome = self.table_info(table).await;
        self.conclude(id, started, outcome)
    }

    async fn table_info(&mut self, table: &str) -> Result<TableInfo> {
        let schema = self.schema(table).await?;
        let stmt = QueryBuilder::new(&self.dialect).count(&schema.name, None, "record_count")?;
        let mut ctx = self.transactions.context().await?;
        let record_count = ctx.count(&stmt).await?;
        Ok(TableInfo {
            keys: schema.unique_keys(),
            foreign_keys: schema.foreign_keys.clone(),
            record_count,
            schema: (*schema).clone(),
        })
    }

    /// Rows whose date column falls inside `filter`, read in pages of
    /// `batch_size` with `(fetched, total)` progress after each page
    pub async fn read_filtered<P>(
        &mut self,
        table: &str,
        filter: DateFilter,
        batch_size: usize,
        progress: P,
    ) -> OperationResult<Vec<Row>>
    where
        P: FnMut(u64, u64) + Send,
    {
        let started = Instant::now();
        let id = self.monitor.start("read_filtered", Some(table));
        let outcome = self.read_pages(table, filter, batch_size, progress).await;
        if let Ok(rows) = &outcome {
            info!(table, filter = %filter, rows = rows.len(), "read finished");
        }
        self.conclude(id, started, outcome)
    }

    async fn read_pages<P>(
        &mut self,
        table: &str,
        filter: DateFilter,
        batch_size: usize,
        mut progress: P,
    ) -> Result<Vec<Row>>
    where
        P: FnMut(u64, u64) + Send,
    {
        if batch_size == 0 {
            return Err(Error::config("batch_size must be greater than 0"));
        }
        let schema = self.schema(table).await?;
        let column = self.config.date_column.clone();
        if !schema.has_column(&column) {
            return Err(Error::ColumnNotFound {
                table: schema.name.clone(),
                column,
            });
        }
        let predicate = filter.predicate(&column);
        let context = ErrorContext::table(schema.name.as_str())
            .with_predicate(format!("{} in {}", column, filter));
        let builder = QueryBuilder::new(&self.dialect).with_schema(&schema);

        let mut order: Vec<OrderBy> = schema.key_columns().into_iter().map(OrderBy::asc).collect();
        if order.is_empty() {
            order.push(OrderBy::asc(self.dialect.row_identity()));
        }
        let total_stmt = builder.count(&schema.name, Some(&predicate), "matched")?;

        let mut ctx = self.transactions.context().await?;
        ctx.begin().await?;
        let read = async {
            let total = ctx.count(&total_stmt).await?;
            let mut rows = Vec::with_capacity(total as usize);
            let mut offset = 0u64;
            loop {
                let mut select = Select::from(schema.name.as_str())
                    .filter(predicate.clone())
                    .limit(batch_size as u64)
                    .offset(offset);
                for o in &order {
                    select = select.order_by(o.clone());
                }
                let page = ctx.query(&builder.select(&select)?).await?;
                let fetched = page.len();
                rows.extend(page.into_iter().map(|row| typed(&schema, row)));
                offset += fetched as u64;
                progress(rows.len() as u64, total);
                debug!(table = %schema.name, page_rows = fetched, offset, "page read");
                if fetched < batch_size {
                    break;
                }
            }
            Ok::<_, Error>(rows)
        };
        let rows = match read.await {
            Ok(rows) => rows,
            Err(e) => return Err(ctx.abort(e).await.with_context(context)),
        };
        ctx.commit().await?;
        Ok(rows)
    }

    /// Delete rows whose date column falls inside `filter`, keeping a snapshot
    pub async fn delete_by_date(&mut self, table: &str, filter: DateFilter) -> OperationResult<DeleteResult> {
        self.delete_by_date_with(table, filter, &DeleteOptions::default())
            .await
    }

    /// [`delete_by_date`](Self::delete_by_date) with explicit options
    pub async fn delete_by_date_with(
        &mut self,
        table: &str,
        filter: DateFilter,
        options: &DeleteOptions,
    ) -> OperationResult<DeleteResult> {
        let started = Instant::now();
        let id = self.monitor.start("delete_by_date", Some(table));
        let outcome = match self.schema(table).await {
            Ok(schema) => {
                let column = self.config.date_column.clone();
                let mut recovery =
                    RecoveryManager::new(&mut self.transactions, &self.dialect, self.clock.as_ref());
                recovery.delete(&schema, filter, &column, options).await
            }
            Err(e) => Err(e),
        };
        if let Ok(result) = &outcome {
            self.monitor.record_rows(result.deleted, 0);
        }
        self.conclude(id, started, outcome)
    }

    /// Write `rows` into `table` in chunks of `batch_size`
    pub async fn insert_batch<P>(
        &mut self,
        table: &str,
        rows: &[Row],
        batch_size: usize,
        mode: WriteMode,
        progress: P,
    ) -> OperationResult<BatchResult>
    where
        P: FnMut(u64, u64) + Send,
    {
        let options = BatchOptions::new(batch_size)
            .with_mode(mode)
            .strict(self.config.strict_validation);
        self.insert_batch_with(table, rows, options, progress).await
    }

    /// [`insert_batch`](Self::insert_batch) with full options
    pub async fn insert_batch_with<P>(
        &mut self,
        table: &str,
        rows: &[Row],
        options: BatchOptions,
        progress: P,
    ) -> OperationResult<BatchResult>
    where
        P: FnMut(u64, u64) + Send,
    {
        let started = Instant::now();
        let id = self.monitor.start("insert_batch", Some(table));
        let outcome = self.write_rows(table, rows, options, progress).await;
        if let Ok(result) = &outcome {
            self.stats.record(result);
            self.monitor
                .record_rows(result.committed_count, result.failed_count());
        }
        self.conclude(id, started, outcome)
    }

    async fn write_rows<P>(
        &mut self,
        table: &str,
        rows: &[Row],
        mut options: BatchOptions,
        progress: P,
    ) -> Result<BatchResult>
    where
        P: FnMut(u64, u64) + Send,
    {
        options.validate()?;
        let schema = self.schema(table).await?;
        let rules = std::mem::take(&mut options.rules);
        let prefetch_keys = options.mode == WriteMode::Insert && options.prefetch_existing_keys;
        options.rules = self.prefetch(&schema, rules, prefetch_keys).await?;
        BatchExecutor::new(&mut self.transactions, &self.dialect, &schema, &options)
            .run(rows, progress)
            .await
    }

    /// Fill foreign-key value sets and, for insert runs, the existing-key set
    async fn prefetch(
        &mut self,
        schema: &TableSchema,
        mut rules: ValidationRules,
        prefetch_keys: bool,
    ) -> Result<ValidationRules> {
        for fk in &schema.foreign_keys {
            if rules.foreign_keys.contains_key(&fk.column.to_lowercase()) {
                continue;
            }
            let parent = self.schema(&fk.referenced_table).await?;
            let column = if fk.referenced_column.is_empty() {
                match parent.key_columns().into_iter().next() {
                    Some(c) => c,
                    None => continue,
                }
            } else {
                fk.referenced_column.clone()
            };
            let stmt = QueryBuilder::new(&self.dialect)
                .with_schema(&parent)
                .select(&Select::from(parent.name.as_str()).columns([column.as_str()]))?;
            let mut ctx = self.transactions.context().await?;
            let values = ctx
                .query(&stmt)
                .await?
                .into_iter()
                .filter_map(|row| row.get(0).cloned())
                .filter(|v| !v.is_null());
            rules = rules.foreign_key_values(fk.column.as_str(), values);
            debug!(
                table = %schema.name,
                column = %fk.column,
                parent = %parent.name,
                "prefetched foreign key values"
            );
        }

        let keys = schema.key_columns();
        if prefetch_keys && rules.existing_keys.is_none() && !keys.is_empty() {
            let stmt = QueryBuilder::new(&self.dialect)
                .with_schema(schema)
                .select(&Select::from(schema.name.as_str()).columns(keys.iter().cloned()))?;
            let mut ctx = self.transactions.context().await?;
            let existing: HashSet<String> = ctx
                .query(&stmt)
                .await?
                .iter()
                .filter_map(|row| composite_key(row, schema, &keys))
                .collect();
            debug!(table = %schema.name, keys = existing.len(), "prefetched existing keys");
            rules = rules.existing_keys(existing);
        }
        Ok(rules)
    }

    /// Drop snapshot tables older than `retention_days`
    pub async fn cleanup_snapshots(&mut self, retention_days: u32) -> OperationResult<CleanupResult> {
        let started = Instant::now();
        let id = self.monitor.start("cleanup_snapshots", None);
        let outcome = RecoveryManager::new(&mut self.transactions, &self.dialect, self.clock.as_ref())
            .cleanup(retention_days)
            .await;
        if let Ok(result) = &outcome {
            for name in &result.dropped {
                self.catalog.invalidate(name);
            }
        }
        self.conclude(id, started, outcome)
    }

    /// Drop snapshot tables older than the configured `snapshot_retention_days`
    pub async fn cleanup_expired_snapshots(&mut self) -> OperationResult<CleanupResult> {
        let retention_days = self.config.snapshot_retention_days;
        self.cleanup_snapshots(retention_days).await
    }

    /// Snapshot tables with their source table, date and age
    pub async fn list_snapshots(&mut self) -> OperationResult<Vec<SnapshotInfo>> {
        let started = Instant::now();
        let id = self.monitor.start("list_snapshots", None);
        let outcome = RecoveryManager::new(&mut self.transactions, &self.dialect, self.clock.as_ref())
            .list_snapshots()
            .await;
        self.conclude(id, started, outcome)
    }

    /// Forget cached schemas: one table, or all when `table` is `None`
    pub fn refresh_schema(&self, table: Option<&str>) {
        match table {
            Some(t) => {
                self.catalog.invalidate(t);
            }
            None => self.catalog.invalidate_all(),
        }
    }

    /// Close the store connection
    pub async fn close(&mut self) -> Result<()> {
        self.transactions.teardown().await
    }
}

fn typed(schema: &TableSchema, row: Row) -> Row {
    let map: Vec<(String, Value)> = row
        .columns()
        .iter()
        .cloned()
        .zip(row.values().iter().cloned())
        .map(|(name, value)| {
            let value = match schema.column(&name) {
                Some(c) => from_store(value, c.column_type),
                None => value,
            };
            (name, value)
        })
        .collect();
    Row::from_pairs(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnMetadata;

    #[test]
    fn test_typed_row_conversion() {
        let schema = TableSchema::new("Sales")
            .with_column(ColumnMetadata::new("Time", "DATE"))
            .with_column(ColumnMetadata::new("Paid", "BOOLEAN"));
        let row = Row::from_pairs([
            ("Time", Value::from("2025-03-04")),
            ("Paid", Value::Int64(1)),
            ("Extra", Value::from("x")),
        ]);
        let out = typed(&schema, row);
        assert_eq!(
            out.get_by_name("Time"),
            Some(&Value::Date(chrono::NaiveDate::from_ymd_opt(2025, 3, 4).unwrap()))
        );
        assert_eq!(out.get_by_name("Paid"), Some(&Value::Bool(true)));
        assert_eq!(out.get_by_name("Extra"), Some(&Value::from("x")));
    }

    #[test]
    fn test_batch_outcome_reports_every_failed_row() {
        use crate::batch::FailedRow;
        use crate::validation::{ValidationError, ValidationErrorKind};

        let mut result = BatchResult::default();
        result.total_count = 3;
        result.committed_count = 1;
        result.failed_rows.push(FailedRow {
            index: 1,
            row: Row::from_pairs([("Code", "TOOLONG")]),
            validation: vec![ValidationError {
                row_index: 1,
                column: "Code".into(),
                kind: ValidationErrorKind::TooLong,
                message: "length 7 exceeds maximum 5".into(),
            }],
            error: None,
        });
        result.failed_rows.push(FailedRow {
            index: 2,
            row: Row::from_pairs([("ID", 1)]),
            validation: Vec::new(),
            error: Some(ErrorReport::from(Error::integrity("UNIQUE (Sales.ID)", "duplicate"))),
        });

        let errors = result.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].category, ErrorCategory::Validation);
        assert_eq!(errors[0].context.row_index, Some(1));
        assert_eq!(errors[1].category, ErrorCategory::Integrity);
        assert_eq!(result.rows_affected(), 1);
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        assert!(DataSyncEngine::new(EngineConfig::default()).is_err());
        assert!(DataSyncEngine::new(EngineConfig::new("x.db").with_batch_size(0)).is_err());
    }
}
