//! Integration tests for chunked batch writes against a store file

mod common;

use common::{count_rows, create_store, engine, recording_manager, sale, sales_store, Fault};
use datasync_core::batch::BatchExecutor;
use datasync_core::prelude::*;
use tokio_util::sync::CancellationToken;

fn sales(ids: std::ops::RangeInclusive<i64>) -> Vec<Row> {
    ids.map(|id| sale(id, "2025-03-04", "$1,234.50", "North"))
        .collect()
}

fn conserved(result: &BatchResult) -> bool {
    result.committed_count + result.failed_count() + result.skipped_count == result.total_count
}

#[tokio::test]
async fn test_large_batch_isolates_invalid_rows() {
    let (_dir, path) = sales_store();
    let mut engine = engine(&path);

    let mut rows = sales(1..=10_000);
    // Three bad rows, all inside the seventh chunk
    rows[6001].set("Amount", "not a number");
    rows[6500].set("Region", "SouthSouthWest");
    rows[6999].set("Time", "");

    let mut reports = Vec::new();
    let outcome = engine
        .insert_batch("Sales", &rows, 1000, WriteMode::Insert, |done, total| {
            reports.push((done, total))
        })
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.rows_affected, 9_997);
    assert_eq!(outcome.errors.len(), 3);

    let result = outcome.value().unwrap();
    assert_eq!(result.total_count, 10_000);
    assert_eq!(result.committed_count, 9_997);
    assert_eq!(result.skipped_count, 0);
    let failed: Vec<usize> = result.failed_rows.iter().map(|f| f.index).collect();
    assert_eq!(failed, vec![6001, 6500, 6999]);
    assert!(result.failed_rows.iter().all(|f| !f.validation.is_empty()));
    assert_eq!(result.chunks_committed, 10);
    assert!(conserved(result));

    assert_eq!(reports.len(), 10);
    assert_eq!(reports.last(), Some(&(10_000, 10_000)));
    assert_eq!(count_rows(&path, "Sales"), 9_997);

    let stats = engine.batch_stats();
    assert_eq!(stats.rows_committed, 9_997);
    assert_eq!(stats.rows_failed, 3);
}

#[tokio::test]
async fn test_store_rejection_is_bisected_to_one_row() {
    let (_dir, path) = sales_store();
    create_store(
        &path,
        "INSERT INTO [Sales] ([ID], [Time]) VALUES (5, '2024-01-01');",
    );
    let mut engine = engine(&path);

    let outcome = engine
        .insert_batch("Sales", &sales(1..=10), 10, WriteMode::Insert, |_, _| {})
        .await;
    let result = outcome.value().unwrap();

    assert_eq!(result.committed_count, 9);
    assert_eq!(result.failed_rows.len(), 1);
    let failed = &result.failed_rows[0];
    assert_eq!(failed.index, 4);
    assert!(failed.validation.is_empty());
    let report = failed.error.as_ref().unwrap();
    assert_eq!(report.category, ErrorCategory::Integrity);
    assert_eq!(report.context.row_index, Some(4));
    assert!(result.chunks_failed >= 1);
    assert!(conserved(result));
    assert_eq!(count_rows(&path, "Sales"), 10);
}

#[tokio::test]
async fn test_prefetched_keys_fail_duplicates_before_writing() {
    let (_dir, path) = sales_store();
    create_store(
        &path,
        "INSERT INTO [Sales] ([ID], [Time]) VALUES (5, '2024-01-01');",
    );
    let mut engine = engine(&path);

    let options = BatchOptions::new(10).prefetch_existing_keys(true);
    let outcome = engine
        .insert_batch_with("Sales", &sales(1..=10), options, |_, _| {})
        .await;
    let result = outcome.value().unwrap();

    assert_eq!(result.committed_count, 9);
    assert_eq!(result.failed_rows.len(), 1);
    assert_eq!(result.failed_rows[0].index, 4);
    assert!(result.failed_rows[0].error.is_none());
    assert_eq!(
        result.failed_rows[0].validation[0].kind,
        ValidationErrorKind::DuplicateKey
    );
    // Nothing had to be retried
    assert_eq!(result.chunks_failed, 0);
}

#[tokio::test]
async fn test_upsert_is_idempotent() {
    let (_dir, path) = sales_store();
    let mut engine = engine(&path);
    let rows = sales(1..=100);

    let first = engine
        .insert_batch("Sales", &rows, 25, WriteMode::Upsert, |_, _| {})
        .await;
    assert!(first.success);
    assert_eq!(first.rows_affected, 100);

    let mut changed = rows.clone();
    changed[0].set("Region", "South");
    let second = engine
        .insert_batch("Sales", &changed, 25, WriteMode::Upsert, |_, _| {})
        .await;
    assert!(second.success);
    assert_eq!(second.rows_affected, 100);
    assert_eq!(count_rows(&path, "Sales"), 100);

    let conn = rusqlite::Connection::open(&path).unwrap();
    let region: String = conn
        .query_row("SELECT [Region] FROM [Sales] WHERE [ID] = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(region, "South");
}

#[tokio::test]
async fn test_update_of_missing_row_fails_that_row() {
    let (_dir, path) = sales_store();
    let mut engine = engine(&path);
    engine
        .insert_batch("Sales", &sales(1..=3), 3, WriteMode::Insert, |_, _| {})
        .await;

    let rows = vec![
        sale(2, "2025-05-05", "10", "East"),
        sale(42, "2025-05-05", "10", "East"),
    ];
    let outcome = engine
        .insert_batch("Sales", &rows, 2, WriteMode::Update, |_, _| {})
        .await;
    let result = outcome.value().unwrap();
    assert_eq!(result.committed_count, 1);
    assert_eq!(result.failed_rows.len(), 1);
    assert_eq!(result.failed_rows[0].index, 1);
    assert_eq!(
        result.failed_rows[0].error.as_ref().map(|e| e.category),
        Some(ErrorCategory::Integrity)
    );
    assert_eq!(count_rows(&path, "Sales"), 3);
}

#[tokio::test]
async fn test_strict_validation_writes_nothing() {
    let (_dir, path) = sales_store();
    let mut engine = engine(&path);

    let mut rows = sales(1..=20);
    rows[3].set("Amount", "twelve");
    let options = BatchOptions::new(5).strict(true);
    let outcome = engine
        .insert_batch_with("Sales", &rows, options, |_, _| {})
        .await;

    assert!(!outcome.success);
    let result = outcome.value().unwrap();
    assert_eq!(result.committed_count, 0);
    assert_eq!(result.failed_count(), 1);
    assert_eq!(result.skipped_count, 19);
    assert_eq!(
        result.error.as_ref().map(|e| e.category),
        Some(ErrorCategory::Validation)
    );
    assert!(conserved(result));
    assert_eq!(count_rows(&path, "Sales"), 0);
}

#[tokio::test]
async fn test_cancelled_batch_skips_remaining_rows() {
    let (_dir, path) = sales_store();
    let mut engine = engine(&path);

    let token = CancellationToken::new();
    token.cancel();
    let options = BatchOptions::new(10).with_cancellation(token);
    let outcome = engine
        .insert_batch_with("Sales", &sales(1..=30), options, |_, _| {})
        .await;
    let result = outcome.value().unwrap();

    assert!(result.is_cancelled());
    assert_eq!(result.committed_count, 0);
    assert_eq!(result.skipped_count, 30);
    assert!(conserved(result));
}

#[tokio::test]
async fn test_unknown_table_is_reported() {
    let (_dir, path) = sales_store();
    let mut engine = engine(&path);

    let outcome = engine
        .insert_batch("Nope", &sales(1..=2), 1, WriteMode::Insert, |_, _| {})
        .await;
    assert!(!outcome.success);
    assert!(outcome.value().is_none());
    assert_eq!(outcome.errors[0].category, ErrorCategory::Schema);
}

#[tokio::test]
async fn test_unknown_column_rejects_batch() {
    let (_dir, path) = sales_store();
    let mut engine = engine(&path);

    let mut rows = sales(1..=2);
    rows[1].set("Colour", "red");
    let outcome = engine
        .insert_batch("Sales", &rows, 1, WriteMode::Insert, |_, _| {})
        .await;
    assert!(!outcome.success);
    assert_eq!(outcome.errors[0].category, ErrorCategory::Schema);
    assert_eq!(count_rows(&path, "Sales"), 0);
}

#[tokio::test]
async fn test_foreign_keys_are_checked_against_parent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.db");
    create_store(
        &path,
        "CREATE TABLE [Regions] ([Code] TEXT PRIMARY KEY);
         INSERT INTO [Regions] VALUES ('N'), ('S');
         CREATE TABLE [Orders] (
             [ID] INTEGER PRIMARY KEY,
             [Region] TEXT REFERENCES [Regions]([Code])
         );",
    );
    let mut engine = engine(&path);

    let rows = vec![
        Row::from_pairs([("ID", Value::Int64(1)), ("Region", Value::from("N"))]),
        Row::from_pairs([("ID", Value::Int64(2)), ("Region", Value::from("X"))]),
        Row::from_pairs([("ID", Value::Int64(3)), ("Region", Value::from("S"))]),
    ];
    let outcome = engine
        .insert_batch("Orders", &rows, 3, WriteMode::Insert, |_, _| {})
        .await;
    let result = outcome.value().unwrap();

    assert_eq!(result.committed_count, 2);
    assert_eq!(result.failed_rows.len(), 1);
    assert_eq!(result.failed_rows[0].index, 1);
    assert_eq!(
        result.failed_rows[0].validation[0].kind,
        ValidationErrorKind::ForeignKeyMissing
    );
    assert_eq!(count_rows(&path, "Orders"), 2);
}

#[tokio::test]
async fn test_generated_keys_are_assigned_by_store() {
    let (_dir, path) = sales_store();
    let mut engine = engine(&path);

    let rows: Vec<Row> = (0..5)
        .map(|_| {
            Row::from_pairs([
                ("Time", Value::from("2025-01-02")),
                ("Amount", Value::from("12.5%")),
            ])
        })
        .collect();
    let outcome = engine
        .insert_batch("Sales", &rows, 5, WriteMode::Insert, |_, _| {})
        .await;
    assert!(outcome.success);
    assert_eq!(count_rows(&path, "Sales"), 5);
}

#[tokio::test]
async fn test_run_stopping_errors_are_not_bisected() {
    let schema = TableSchema::new("T")
        .with_column(ColumnMetadata::new("ID", "INTEGER").primary_key(1))
        .with_column(ColumnMetadata::new("Name", "TEXT"));
    let rows: Vec<Row> = (1..=8)
        .map(|id| Row::from_pairs([("ID", Value::Int64(id)), ("Name", Value::from("n"))]))
        .collect();
    let options = BatchOptions::new(8);

    for (fault, category) in [
        (Fault::Syntax, ErrorCategory::Syntax),
        (Fault::Timeout, ErrorCategory::Timeout),
    ] {
        let (mut manager, script) = recording_manager();
        script.fail_on("INSERT INTO", fault);

        let result = BatchExecutor::new(&mut manager, &SqliteDialect, &schema, &options)
            .run(&rows, |_, _| {})
            .await
            .unwrap();

        assert_eq!(result.error.as_ref().map(|e| e.category), Some(category));
        assert_eq!(result.committed_count, 0);
        assert!(result.failed_rows.is_empty());
        assert_eq!(result.skipped_count, 8);
        assert!(conserved(&result));

        let inserts = script
            .log()
            .iter()
            .filter(|sql| sql.starts_with("INSERT INTO"))
            .count();
        assert_eq!(inserts, 1, "{:?} was split into smaller chunks", category);
        assert_eq!(script.count("COMMIT"), 0);
    }
}
