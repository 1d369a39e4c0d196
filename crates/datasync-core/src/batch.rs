//! Batch executor for datasync-core
//!
//! Provides:
//! - WriteMode: insert, upsert and update
//! - BatchOptions: chunk size, strict validation, cancellation
//! - BatchExecutor: validated, chunked writes with bisection retry
//! - AtomicBatchStats: cumulative counters across runs
//!
//! Every chunk runs in its own transaction context. A chunk that fails is
//! split in half and retried until the failure is pinned to single rows,
//! which are recorded and skipped. Rows committed plus rows failed plus rows
//! skipped (cancellation, fatal connection loss) always equals the input.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dialect::SqlDialect;
use crate::error::{Error, ErrorCategory, ErrorContext, ErrorReport, Result};
use crate::query::{key_predicate, Predicate, QueryBuilder, Select};
use crate::transaction::{TransactionContext, TransactionManager};
use crate::types::{Row, TableSchema};
use crate::validation::{
    composite_key, validate_rows, ValidationError, ValidationResult, ValidationRules,
};

/// Rows per existence lookup when resolving upserts
const LOOKUP_CHUNK: usize = 250;

/// Write mode for batch operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Insert only (fails on duplicate keys)
    #[default]
    Insert,
    /// Update when the key exists, insert otherwise
    Upsert,
    /// Update only (fails if row doesn't exist)
    Update,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Upsert => write!(f, "upsert"),
            Self::Update => write!(f, "update"),
        }
    }
}

impl FromStr for WriteMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(Self::Insert),
            "upsert" => Ok(Self::Upsert),
            "update" => Ok(Self::Update),
            other => Err(Error::config(format!("unknown write mode: {}", other))),
        }
    }
}

/// Options for one batch run
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Rows per chunk transaction (must be > 0)
    pub batch_size: usize,
    /// Write mode
    pub mode: WriteMode,
    /// Abort before writing anything when any row fails validation
    pub strict: bool,
    /// Validation rules
    pub rules: ValidationRules,
    /// Checked between chunks
    pub cancel: Option<CancellationToken>,
    /// Load the table's existing keys before an insert run so duplicates
    /// are reported per row instead of surfacing at the store
    pub prefetch_existing_keys: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            mode: WriteMode::Insert,
            strict: false,
            rules: ValidationRules::default(),
            cancel: None,
            prefetch_existing_keys: false,
        }
    }
}

impl BatchOptions {
    /// Options with the given chunk size
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    /// Set the write mode
    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enable or disable strict validation
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set validation rules
    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.rules = rules;
        self
    }

    /// Set a cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Enable or disable the existing-key prefetch
    pub fn prefetch_existing_keys(mut self, enabled: bool) -> Self {
        self.prefetch_existing_keys = enabled;
        self
    }

    /// Reject unusable options
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be greater than 0"));
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// A row that was not written
#[derive(Debug, Clone)]
pub struct FailedRow {
    /// Position in the input
    pub index: usize,
    /// The input row
    pub row: Row,
    /// Column-level validation errors, empty when the store rejected the row
    pub validation: Vec<ValidationError>,
    /// Store-side error, when the row passed validation
    pub error: Option<ErrorReport>,
}

/// Result of a batch run
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// Input rows
    pub total_count: u64,
    /// Rows committed
    pub committed_count: u64,
    /// Rows permanently rejected, in input order
    pub failed_rows: Vec<FailedRow>,
    /// Rows never attempted because the run stopped early
    pub skipped_count: u64,
    /// Error that stopped the run early
    pub error: Option<ErrorReport>,
    /// Full validation report
    pub validation: ValidationResult,
    /// Chunk transactions committed, including bisected halves
    pub chunks_committed: u64,
    /// Chunk transactions rolled back
    pub chunks_failed: u64,
    /// Wall time
    pub duration: Duration,
}

impl BatchResult {
    fn new(total: usize) -> Self {
        Self {
            total_count: total as u64,
            ..Self::default()
        }
    }

    /// Every row committed
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed_rows.is_empty() && self.skipped_count == 0
    }

    /// Number of rows permanently rejected
    pub fn failed_count(&self) -> u64 {
        self.failed_rows.len() as u64
    }

    /// Whether the run was stopped by cancellation
    pub fn is_cancelled(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|e| e.category == ErrorCategory::Cancelled)
    }
}

/// Batch statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    /// Total rows committed
    pub rows_committed: u64,
    /// Total rows failed
    pub rows_failed: u64,
    /// Total chunk transactions committed
    pub chunks_committed: u64,
    /// Total chunk transactions rolled back
    pub chunks_failed: u64,
    /// Total write duration (milliseconds)
    pub total_write_time_ms: u64,
    /// Average rows per second
    pub rows_per_second: f64,
}

/// Atomic batch statistics
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicBatchStats {
    pub rows_committed: AtomicU64,
    pub rows_failed: AtomicU64,
    pub chunks_committed: AtomicU64,
    pub chunks_failed: AtomicU64,
    pub total_write_time_ms: AtomicU64,
}

impl AtomicBatchStats {
    /// Fold a finished run into the totals
    pub fn record(&self, result: &BatchResult) {
        self.rows_committed
            .fetch_add(result.committed_count, Ordering::Relaxed);
        self.rows_failed
            .fetch_add(result.failed_count(), Ordering::Relaxed);
        self.chunks_committed
            .fetch_add(result.chunks_committed, Ordering::Relaxed);
        self.chunks_failed
            .fetch_add(result.chunks_failed, Ordering::Relaxed);
        self.total_write_time_ms
            .fetch_add(result.duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> BatchStats {
        let rows = self.rows_committed.load(Ordering::Relaxed);
        let time_ms = self.total_write_time_ms.load(Ordering::Relaxed);
        let rps = if time_ms > 0 {
            (rows as f64 * 1000.0) / time_ms as f64
        } else {
            0.0
        };

        BatchStats {
            rows_committed: rows,
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            chunks_committed: self.chunks_committed.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            total_write_time_ms: time_ms,
            rows_per_second: rps,
        }
    }
}

/// Drives validated rows into one table, chunk by chunk
pub struct BatchExecutor<'a> {
    manager: &'a mut TransactionManager,
    builder: QueryBuilder<'a>,
    schema: &'a TableSchema,
    options: &'a BatchOptions,
    key_columns: Vec<String>,
}

impl fmt::Debug for BatchExecutor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("table", &self.schema.name)
            .field("mode", &self.options.mode)
            .field("batch_size", &self.options.batch_size)
            .finish()
    }
}

impl<'a> BatchExecutor<'a> {
    /// Create an executor writing into `schema`'s table
    pub fn new(
        manager: &'a mut TransactionManager,
        dialect: &'a dyn SqlDialect,
        schema: &'a TableSchema,
        options: &'a BatchOptions,
    ) -> Self {
        Self {
            manager,
            builder: QueryBuilder::new(dialect).with_schema(schema),
            schema,
            options,
            key_columns: schema.key_columns(),
        }
    }

    /// Validate and write `rows`, reporting `(processed, total)` after each chunk.
    ///
    /// Returns `Err` only when nothing was written: invalid options, an
    /// unknown column, or a mode that needs key columns the table lacks.
    pub async fn run<P>(mut self, rows: &[Row], mut progress: P) -> Result<BatchResult>
    where
        P: FnMut(u64, u64) + Send,
    {
        let started = Instant::now();
        let table = self.schema.name.clone();
        self.options.validate()?;
        if self.options.mode != WriteMode::Insert && self.key_columns.is_empty() {
            return Err(Error::schema(format!(
                "{} mode needs a primary key or unique index on {}",
                self.options.mode, table
            )));
        }

        let validated = validate_rows(rows, self.schema, &self.options.rules)
            .map_err(|e| e.with_context(ErrorContext::table(table.as_str())))?;
        let mut result = BatchResult::new(rows.len());
        result.validation = validated.result;
        let total = result.total_count;

        info!(
            table = %table,
            rows = rows.len(),
            batch_size = self.options.batch_size,
            mode = %self.options.mode,
            "batch started"
        );

        if !result.validation.is_valid() && self.options.strict {
            let failed = result.validation.failed_rows();
            let violations = result.validation.errors.len();
            for (index, outcome) in validated.outcomes.into_iter().enumerate() {
                if failed.contains(&index) {
                    result.failed_rows.push(FailedRow {
                        index,
                        row: rows[index].clone(),
                        validation: outcome.errors,
                        error: None,
                    });
                }
            }
            result.skipped_count = total - result.failed_count();
            let err = Error::Validation {
                rows: failed.len(),
                violations,
            }
            .with_context(ErrorContext::table(table.as_str()));
            warn!(table = %table, rows = failed.len(), violations, "strict validation rejected batch");
            result.error = Some(ErrorReport::from(&err));
            result.duration = started.elapsed();
            return Ok(result);
        }

        let mut outcomes = validated.outcomes;
        let mut start = 0;
        while start < rows.len() {
            if self.options.is_cancelled() {
                let err = Error::Cancelled {
                    processed: start as u64,
                    total,
                };
                warn!(table = %table, processed = start, total, "batch cancelled at chunk boundary");
                result.skipped_count = total - start as u64;
                result.error = Some(ErrorReport::from(&err));
                break;
            }

            let end = (start + self.options.batch_size).min(rows.len());
            let mut writable = Vec::with_capacity(end - start);
            for index in start..end {
                let outcome = &mut outcomes[index];
                if outcome.errors.is_empty() {
                    writable.push((index, std::mem::take(&mut outcome.row)));
                } else {
                    result.failed_rows.push(FailedRow {
                        index,
                        row: rows[index].clone(),
                        validation: std::mem::take(&mut outcome.errors),
                        error: None,
                    });
                }
            }

            if let Err(fatal) = self.write_chunk(&writable, rows, &mut result).await {
                error_stop(&mut result, &table, fatal, total, start as u64);
                break;
            }

            debug!(table = %table, processed = end, total, "chunk finished");
            progress(end as u64, total);
            start = end;
        }

        result.failed_rows.sort_by_key(|f| f.index);
        result.duration = started.elapsed();
        info!(
            table = %table,
            committed = result.committed_count,
            failed = result.failed_count(),
            skipped = result.skipped_count,
            duration_ms = result.duration.as_millis() as u64,
            "batch finished"
        );
        Ok(result)
    }

    /// Write one chunk, bisecting on failure. `Err` means the run must stop;
    /// rows of this chunk not yet committed or failed are then left for the
    /// caller to count as skipped.
    async fn write_chunk(
        &mut self,
        writable: &[(usize, Row)],
        inputs: &[Row],
        result: &mut BatchResult,
    ) -> std::result::Result<(), Error> {
        let mut pending: Vec<Range<usize>> = vec![0..writable.len()];
        while let Some(range) = pending.pop() {
            if range.is_empty() {
                continue;
            }
            let slice = &writable[range.clone()];
            match self.attempt(slice).await {
                Ok(()) => {
                    result.committed_count += slice.len() as u64;
                    result.chunks_committed += 1;
                }
                Err(e) if e.category().stops_run() => {
                    result.chunks_failed += 1;
                    return Err(e);
                }
                Err(e) if slice.len() == 1 => {
                    result.chunks_failed += 1;
                    let (index, row) = &slice[0];
                    warn!(
                        table = %self.schema.name,
                        row_index = index,
                        error = %e,
                        "row rejected by store"
                    );
                    let err = e.with_context(
                        ErrorContext::table(self.schema.name.as_str())
                            .with_row(*index, row.describe()),
                    );
                    result.failed_rows.push(FailedRow {
                        index: *index,
                        row: inputs[*index].clone(),
                        validation: Vec::new(),
                        error: Some(ErrorReport::from(&err)),
                    });
                }
                Err(e) => {
                    result.chunks_failed += 1;
                    let mid = range.start + range.len() / 2;
                    debug!(
                        rows = range.len(),
                        error = %e,
                        "chunk failed, retrying as two halves"
                    );
                    pending.push(mid..range.end);
                    pending.push(range.start..mid);
                }
            }
        }
        Ok(())
    }

    /// One transaction over `rows`
    async fn attempt(&mut self, rows: &[(usize, Row)]) -> Result<()> {
        let builder = self.builder;
        let schema = self.schema;
        let mode = self.options.mode;
        let keys = &self.key_columns;

        let mut ctx = self.manager.context().await?;
        ctx.begin().await?;
        let existing = if mode == WriteMode::Upsert {
            match existing_keys(&mut ctx, builder, schema, keys, rows).await {
                Ok(found) => found,
                Err(e) => return Err(ctx.abort(e).await),
            }
        } else {
            HashSet::new()
        };

        for (_, row) in rows {
            let written = match mode {
                WriteMode::Insert => insert_row(&mut ctx, builder, schema, row).await,
                WriteMode::Update => update_row(&mut ctx, builder, schema, keys, row).await,
                WriteMode::Upsert => match composite_key(row, schema, keys) {
                    Some(key) if existing.contains(&key) => {
                        update_row(&mut ctx, builder, schema, keys, row).await
                    }
                    _ => insert_row(&mut ctx, builder, schema, row).await,
                },
            };
            if let Err(e) = written {
                return Err(ctx.abort(e).await);
            }
        }
        ctx.commit().await
    }
}

fn error_stop(result: &mut BatchResult, table: &str, fatal: Error, total: u64, chunk_start: u64) {
    let settled = result.committed_count + result.failed_count();
    result.skipped_count = total - settled;
    tracing::error!(
        table,
        error = %fatal,
        chunk_start,
        committed = result.committed_count,
        "batch stopped by unrecoverable error"
    );
    let err = fatal.with_context(ErrorContext::table(table));
    result.error = Some(ErrorReport::from(&err));
}

/// Keys among `rows` that already exist in the table
async fn existing_keys(
    ctx: &mut TransactionContext<'_>,
    builder: QueryBuilder<'_>,
    schema: &TableSchema,
    keys: &[String],
    rows: &[(usize, Row)],
) -> Result<HashSet<String>> {
    let mut found = HashSet::new();
    let candidates: Vec<Predicate> = rows
        .iter()
        .filter(|(_, row)| composite_key(row, schema, keys).is_some())
        .filter_map(|(_, row)| key_predicate(row, keys).ok())
        .collect();
    for group in candidates.chunks(LOOKUP_CHUNK) {
        let select = Select::from(schema.name.as_str())
            .columns(keys.iter().cloned())
            .filter(Predicate::Or(group.to_vec()));
        let stmt = builder.select(&select)?;
        for row in ctx.query(&stmt).await? {
            if let Some(key) = composite_key(&row, schema, keys) {
                found.insert(key);
            }
        }
    }
    Ok(found)
}

/// Drop NULL store-generated key columns so the store assigns them
fn insertable(schema: &TableSchema, row: &Row) -> Row {
    Row::from_pairs(
        row.iter()
            .filter(|(name, value)| {
                !(value.is_null() && schema.is_auto_generated(name))
            })
            .map(|(name, value)| (name.to_string(), value.clone())),
    )
}

async fn insert_row(
    ctx: &mut TransactionContext<'_>,
    builder: QueryBuilder<'_>,
    schema: &TableSchema,
    row: &Row,
) -> Result<()> {
    let stmt = builder.insert(&schema.name, &insertable(schema, row))?;
    ctx.execute(&stmt).await?;
    Ok(())
}

async fn update_row(
    ctx: &mut TransactionContext<'_>,
    builder: QueryBuilder<'_>,
    schema: &TableSchema,
    keys: &[String],
    row: &Row,
) -> Result<()> {
    let only_keys = row
        .columns()
        .iter()
        .all(|c| keys.iter().any(|k| k.eq_ignore_ascii_case(c)));
    let affected = if only_keys {
        let filter = key_predicate(row, keys)?;
        let stmt = builder.count(&schema.name, Some(&filter), "matches")?;
        ctx.count(&stmt).await?
    } else {
        let stmt = builder.update(&schema.name, row, keys)?;
        ctx.execute(&stmt).await?
    };
    if affected == 0 {
        let key = key_predicate(row, keys)?;
        return Err(Error::integrity(
            "row_not_found",
            format!("no row in {} matches {}", schema.name, key),
        ));
    }
    Ok(())
}
