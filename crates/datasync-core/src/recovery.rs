//! Delete with snapshot recovery for datasync-core
//!
//! A date-scoped delete never removes a row that does not already have a
//! committed copy in a snapshot table:
//!
//! ```text
//! REQUESTED --copy + commit--> SNAPSHOT_CREATED --count check--> VERIFIED
//!     |                              |                              |
//!     +------------------------------+-------------> ROLLED_BACK <--+
//!                                                                   |
//!                                        delete + post-count check  v
//!                                                                DELETED
//! ```
//!
//! Snapshot tables are named `{table}_{M}.{D}.{YYYY}_temp_table` after the
//! day of the delete, and a cleanup sweep drops them once they are older
//! than the retention period.

use chrono::{Datelike, Local, NaiveDate};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::date_filter::DateFilter;
use crate::dialect::SqlDialect;
use crate::error::{Error, ErrorContext, ErrorReport, Result};
use crate::query::{QueryBuilder, Statement};
use crate::transaction::{TransactionContext, TransactionManager};
use crate::types::{TableSchema, Value};

/// Suffix marking snapshot tables
pub const SNAPSHOT_SUFFIX: &str = "_temp_table";

/// Default days a snapshot is kept
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Parsed snapshot table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SnapshotName {
    /// Source table
    pub table: String,
    /// Day of the delete
    pub date: NaiveDate,
}

impl SnapshotName {
    /// Snapshot of `table` taken on `date`
    pub fn new(table: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            table: table.into(),
            date,
        }
    }

    /// Parse a table name; `None` for anything that is not a snapshot.
    ///
    /// The date is read from the end so source tables whose names contain
    /// underscores or dots still parse.
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(SNAPSHOT_SUFFIX)?;
        let (table, date) = stem.rsplit_once('_')?;
        if table.is_empty() {
            return None;
        }
        let mut parts = date.split('.');
        let month = parts.next()?.parse().ok()?;
        let day = parts.next()?.parse().ok()?;
        let year = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        Some(Self::new(table, date))
    }

    /// Whole days between the snapshot date and `today`
    pub fn age_days(&self, today: NaiveDate) -> i64 {
        (today - self.date).num_days()
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}.{}.{}{}",
            self.table,
            self.date.month(),
            self.date.day(),
            self.date.year(),
            SNAPSHOT_SUFFIX
        )
    }
}

/// Source of "today" for snapshot naming and retention
pub trait Clock: Send + Sync {
    /// Current local calendar day
    fn today(&self) -> NaiveDate;
}

/// Local wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Clock pinned to one day
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// Delete lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteState {
    /// Accepted, nothing written
    Requested,
    /// Snapshot table created and filled, copy committed
    SnapshotCreated,
    /// Snapshot row count matches the source pre-count
    Verified,
    /// Source rows deleted and post-count is zero (terminal)
    Deleted,
    /// Aborted; source untouched (terminal)
    RolledBack,
}

impl DeleteState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted | Self::RolledBack)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: DeleteState) -> bool {
        match (self, next) {
            (Self::Requested, Self::SnapshotCreated)
            | (Self::SnapshotCreated, Self::Verified)
            | (Self::Verified, Self::Deleted) => true,
            (from, Self::RolledBack) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for DeleteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "REQUESTED"),
            Self::SnapshotCreated => write!(f, "SNAPSHOT_CREATED"),
            Self::Verified => write!(f, "VERIFIED"),
            Self::Deleted => write!(f, "DELETED"),
            Self::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// Options for a date-scoped delete
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Add the removed rows to a snapshot already taken for this table today.
    /// The rows it holds are kept; without this the delete is refused.
    pub append_to_snapshot: bool,
}

impl DeleteOptions {
    /// Confirm appending to an existing snapshot
    pub fn append_to_snapshot(mut self, append: bool) -> Self {
        self.append_to_snapshot = append;
        self
    }
}

/// Outcome of a date-scoped delete
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    /// Source table
    pub table: String,
    /// Filter applied
    pub filter: DateFilter,
    /// Final state
    pub state: DeleteState,
    /// States passed through, in order
    pub history: Vec<DeleteState>,
    /// Snapshot table holding the copies, when one was committed
    pub snapshot: Option<String>,
    /// Source rows matching before the delete
    pub matched: u64,
    /// Rows copied into the snapshot
    pub copied: u64,
    /// Rows deleted from the source
    pub deleted: u64,
    /// Error that rolled the delete back
    pub error: Option<ErrorReport>,
    /// Wall time
    #[serde(skip)]
    pub duration: Duration,
}

impl DeleteResult {
    fn new(table: &str, filter: DateFilter) -> Self {
        Self {
            table: table.to_string(),
            filter,
            state: DeleteState::Requested,
            history: vec![DeleteState::Requested],
            snapshot: None,
            matched: 0,
            copied: 0,
            deleted: 0,
            error: None,
            duration: Duration::ZERO,
        }
    }

    /// Whether the delete completed
    pub fn is_success(&self) -> bool {
        self.state == DeleteState::Deleted
    }

    fn advance(&mut self, next: DeleteState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::internal(format!(
                "illegal delete transition {} -> {}",
                self.state, next
            )));
        }
        debug!(table = %self.table, from = %self.state, to = %next, "delete state change");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    fn fail(&mut self, err: Error) {
        warn!(
            table = %self.table,
            state = %self.state,
            snapshot = self.snapshot.as_deref().unwrap_or("-"),
            error = %err,
            "delete rolled back; source rows untouched"
        );
        if !self.state.is_terminal() {
            self.state = DeleteState::RolledBack;
            self.history.push(DeleteState::RolledBack);
        }
        self.error = Some(ErrorReport::from(&err));
    }
}

/// A snapshot table found in the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotInfo {
    /// Table name as stored
    pub name: String,
    /// Parsed source table and date
    pub snapshot: SnapshotName,
    /// Whole days since the snapshot was taken
    pub age_days: i64,
}

/// Outcome of a cleanup sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupResult {
    /// Snapshot tables dropped
    pub dropped: Vec<String>,
    /// Snapshot tables kept because they are within retention
    pub retained: Vec<String>,
    /// Snapshot tables that could not be dropped
    pub failed: Vec<(String, ErrorReport)>,
}

/// Runs date-scoped deletes and snapshot maintenance
pub struct RecoveryManager<'a> {
    manager: &'a mut TransactionManager,
    dialect: &'a dyn SqlDialect,
    clock: &'a dyn Clock,
}

impl fmt::Debug for RecoveryManager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("dialect", &self.dialect.name())
            .field("today", &self.clock.today())
            .finish()
    }
}

impl<'a> RecoveryManager<'a> {
    /// Create a recovery manager
    pub fn new(
        manager: &'a mut TransactionManager,
        dialect: &'a dyn SqlDialect,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            manager,
            dialect,
            clock,
        }
    }

    async fn table_names(&mut self) -> Result<Vec<String>> {
        let stmt = Statement::new(self.dialect.list_tables_sql());
        let mut ctx = self.manager.context().await?;
        let rows = ctx.query(&stmt).await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get_by_name("name").and_then(Value::as_str).map(String::from))
            .collect())
    }

    /// Delete the rows of `schema`'s table whose `column` falls inside `filter`.
    ///
    /// Returns `Err` only when the request is rejected before anything is
    /// written: an unknown column, an unconfirmed snapshot collision, or a
    /// store that cannot be reached. Once copying starts the outcome is
    /// always a [`DeleteResult`] in `DELETED` or `ROLLED_BACK`.
    pub async fn delete(
        &mut self,
        schema: &TableSchema,
        filter: DateFilter,
        column: &str,
        options: &DeleteOptions,
    ) -> Result<DeleteResult> {
        let started = Instant::now();
        let table = schema.name.as_str();
        let predicate = filter.predicate(column);
        let context = || {
            ErrorContext::table(table).with_predicate(format!("{} in {}", column, filter))
        };
        let builder = QueryBuilder::new(self.dialect).with_schema(schema);
        let count_source = builder
            .count(table, Some(&predicate), "matched")
            .map_err(|e| e.with_context(context()))?;

        let mut result = DeleteResult::new(table, filter);
        let matched = {
            let mut ctx = self.manager.context().await?;
            ctx.count(&count_source)
                .await
                .map_err(|e| e.with_context(context()))?
        };
        result.matched = matched;
        if matched == 0 {
            info!(table, filter = %filter, "no rows match, nothing to delete");
            result.state = DeleteState::Deleted;
            result.history.push(DeleteState::Deleted);
            result.duration = started.elapsed();
            return Ok(result);
        }

        let snapshot = SnapshotName::new(table, self.clock.today()).to_string();
        let exists = self
            .table_names()
            .await?
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&snapshot));
        if exists && !options.append_to_snapshot {
            return Err(Error::SnapshotExists { name: snapshot }.with_context(context()));
        }

        info!(table, filter = %filter, matched, snapshot = %snapshot, "delete started");

        // Copy
        let copy = async {
            let create = builder.create_table_like(&snapshot, schema)?;
            let fill = builder.insert_select(&snapshot, table, &predicate)?;
            let count_snapshot = builder.count(&snapshot, None, "copied")?;
            let mut ctx = self.manager.context().await?;
            ctx.begin().await?;
            let copied =
                copy_rows(&mut ctx, exists, &snapshot, &create, &fill, &count_snapshot).await;
            let (base, copied) = match copied {
                Ok(counts) => counts,
                Err(e) => return Err(ctx.abort(e).await),
            };
            if copied != matched {
                let err = Error::recovery("snapshot copy", matched, copied);
                return Err(ctx.abort(err).await);
            }
            ctx.commit().await?;
            Ok::<(u64, u64), Error>((base, copied))
        };
        let base = match copy.await {
            Ok((base, copied)) => {
                result.copied = copied;
                result.snapshot = Some(snapshot.clone());
                result.advance(DeleteState::SnapshotCreated)?;
                base
            }
            Err(e) => {
                result.fail(e.with_context(context()));
                result.duration = started.elapsed();
                return Ok(result);
            }
        };

        // Verify the committed snapshot independently of the copy transaction
        let recount = async {
            let stmt = builder.count(&snapshot, None, "copied")?;
            let mut ctx = self.manager.context().await?;
            ctx.count(&stmt).await
        };
        match recount.await {
            Ok(n) if n == base + matched => result.advance(DeleteState::Verified)?,
            Ok(n) => {
                let err = Error::recovery("snapshot verification", base + matched, n);
                result.fail(err.with_context(context()));
                result.duration = started.elapsed();
                return Ok(result);
            }
            Err(e) => {
                result.fail(e.with_context(context()));
                result.duration = started.elapsed();
                return Ok(result);
            }
        }

        // Delete
        let delete = async {
            let remove = builder.delete(table, &predicate)?;
            let mut ctx = self.manager.context().await?;
            ctx.begin().await?;
            let deleted = match ctx.execute(&remove).await {
                Ok(n) => n,
                Err(e) => return Err(ctx.abort(e).await),
            };
            if deleted != matched {
                let err = Error::recovery("delete", matched, deleted);
                return Err(ctx.abort(err).await);
            }
            let remaining = match ctx.count(&count_source).await {
                Ok(n) => n,
                Err(e) => return Err(ctx.abort(e).await),
            };
            if remaining != 0 {
                let err = Error::recovery("post-delete verification", 0, remaining);
                return Err(ctx.abort(err).await);
            }
            ctx.commit().await?;
            Ok::<u64, Error>(deleted)
        };
        match delete.await {
            Ok(deleted) => {
                result.deleted = deleted;
                result.advance(DeleteState::Deleted)?;
            }
            Err(e) => result.fail(e.with_context(context())),
        }

        result.duration = started.elapsed();
        info!(
            table,
            state = %result.state,
            deleted = result.deleted,
            snapshot = %snapshot,
            duration_ms = result.duration.as_millis() as u64,
            "delete finished"
        );
        Ok(result)
    }

    /// Every snapshot table in the store, oldest first
    pub async fn list_snapshots(&mut self) -> Result<Vec<SnapshotInfo>> {
        let today = self.clock.today();
        let mut snapshots: Vec<SnapshotInfo> = self
            .table_names()
            .await?
            .into_iter()
            .filter_map(|name| {
                let snapshot = SnapshotName::parse(&name)?;
                Some(SnapshotInfo {
                    age_days: snapshot.age_days(today),
                    snapshot,
                    name,
                })
            })
            .collect();
        snapshots.sort_by(|a, b| {
            (a.snapshot.date, &a.snapshot.table).cmp(&(b.snapshot.date, &b.snapshot.table))
        });
        Ok(snapshots)
    }

    /// Drop snapshots older than `retention_days` whole days
    pub async fn cleanup(&mut self, retention_days: u32) -> Result<CleanupResult> {
        let mut result = CleanupResult::default();
        for info in self.list_snapshots().await? {
            if info.age_days <= i64::from(retention_days) {
                result.retained.push(info.name);
                continue;
            }
            let stmt = QueryBuilder::new(self.dialect).drop_table(&info.name);
            let dropped = async {
                let mut ctx = self.manager.context().await?;
                ctx.execute(&stmt).await
            };
            match dropped.await {
                Ok(_) => {
                    info!(snapshot = %info.name, age_days = info.age_days, "dropped expired snapshot");
                    result.dropped.push(info.name);
                }
                Err(e) if e.is_connection_fatal() => return Err(e),
                Err(e) => {
                    warn!(snapshot = %info.name, error = %e, "failed to drop expired snapshot");
                    let err = e.with_context(ErrorContext::table(info.name.as_str()));
                    result.failed.push((info.name, ErrorReport::from(&err)));
                }
            }
        }
        Ok(result)
    }
}

/// Copy matching rows into the snapshot, returning the rows it held before
/// and the rows added
async fn copy_rows(
    ctx: &mut TransactionContext<'_>,
    append: bool,
    snapshot: &str,
    create: &Statement,
    fill: &Statement,
    count: &Statement,
) -> Result<(u64, u64)> {
    let base = if append {
        let held = ctx.count(count).await?;
        warn!(snapshot, held, "appending to existing snapshot table");
        held
    } else {
        ctx.execute(create).await?;
        0
    };
    ctx.execute(fill).await?;
    let after = ctx.count(count).await?;
    Ok((base, after.saturating_sub(base)))
}
