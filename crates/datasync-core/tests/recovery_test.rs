//! Integration tests for snapshot-protected deletes and snapshot retention

mod common;

use chrono::NaiveDate;
use common::{count_rows, create_store, engine, sales_store, table_exists};
use datasync_core::prelude::*;
use datasync_core::recovery::FixedClock;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Ten rows, four of them dated in 2025
fn seed_ten(path: &Path) {
    create_store(
        path,
        "INSERT INTO [Sales] ([ID], [Time], [Amount], [Region]) VALUES
            (1, '2024-02-01', 10, 'North'),
            (2, '2024-06-15', 20, 'South'),
            (3, '2024-12-31', 30, 'East'),
            (4, '2025-01-01', 40, 'West'),
            (5, '2025-03-04', 50, 'North'),
            (6, '2025-07-20', 60, 'South'),
            (7, '2025-12-31', 70, 'East'),
            (8, '2026-01-01', 80, 'West'),
            (9, '2026-02-02', 90, 'North'),
            (10, '2026-03-03', 100, 'South');",
    );
}

fn pinned(path: &Path, today: NaiveDate) -> DataSyncEngine {
    engine(path).with_clock(Arc::new(FixedClock(today)))
}

#[tokio::test]
async fn test_year_delete_keeps_snapshot() {
    let (_dir, path) = sales_store();
    seed_ten(&path);
    let mut engine = pinned(&path, day(2026, 10, 17));

    let outcome = engine
        .delete_by_date("Sales", DateFilter::parse("2025").unwrap())
        .await;
    assert!(outcome.success);
    assert_eq!(outcome.rows_affected, 4);

    let result = outcome.value().unwrap();
    assert_eq!(result.state, DeleteState::Deleted);
    assert_eq!(
        result.history,
        vec![
            DeleteState::Requested,
            DeleteState::SnapshotCreated,
            DeleteState::Verified,
            DeleteState::Deleted,
        ]
    );
    assert_eq!(result.matched, 4);
    assert_eq!(result.copied, 4);
    assert_eq!(result.deleted, 4);

    let snapshot = result.snapshot.as_deref().unwrap();
    assert_eq!(snapshot, "Sales_10.17.2026_temp_table");
    assert_eq!(count_rows(&path, snapshot), 4);
    assert_eq!(count_rows(&path, "Sales"), 6);

    // Nothing left to match
    let again = engine
        .delete_by_date("Sales", DateFilter::parse("2025").unwrap())
        .await;
    assert!(again.success);
    assert_eq!(again.rows_affected, 0);
    let again = again.value().unwrap();
    assert_eq!(again.state, DeleteState::Deleted);
    assert!(again.snapshot.is_none());
    assert_eq!(count_rows(&path, "Sales"), 6);
}

#[tokio::test]
async fn test_exact_date_delete() {
    let (_dir, path) = sales_store();
    seed_ten(&path);
    let mut engine = pinned(&path, day(2026, 10, 17));

    let outcome = engine
        .delete_by_date("Sales", DateFilter::parse("03/04/2025").unwrap())
        .await;
    assert!(outcome.success);
    assert_eq!(outcome.rows_affected, 1);
    assert_eq!(count_rows(&path, "Sales"), 9);
}

#[tokio::test]
async fn test_existing_snapshot_needs_confirmation() {
    let (_dir, path) = sales_store();
    seed_ten(&path);
    let mut engine = pinned(&path, day(2026, 10, 17));

    let first = engine
        .delete_by_date("Sales", DateFilter::year(2025).unwrap())
        .await;
    assert!(first.success);

    create_store(
        &path,
        "INSERT INTO [Sales] ([ID], [Time]) VALUES (11, '2025-05-05'), (12, '2025-06-06');",
    );

    let refused = engine
        .delete_by_date("Sales", DateFilter::year(2025).unwrap())
        .await;
    assert!(!refused.success);
    assert!(refused.value().is_none());
    assert_eq!(refused.errors[0].category, ErrorCategory::Recovery);
    // Refused before anything was written
    assert_eq!(count_rows(&path, "Sales"), 8);
    assert_eq!(count_rows(&path, "Sales_10.17.2026_temp_table"), 4);

    let appended = engine
        .delete_by_date_with(
            "Sales",
            DateFilter::year(2025).unwrap(),
            &DeleteOptions::default().append_to_snapshot(true),
        )
        .await;
    assert!(appended.success);
    assert_eq!(appended.rows_affected, 2);
    let result = appended.value().unwrap();
    assert_eq!(result.copied, 2);
    // The first delete's copies are still there
    assert_eq!(count_rows(&path, "Sales_10.17.2026_temp_table"), 6);
    assert_eq!(count_rows(&path, "Sales"), 6);
}

#[tokio::test]
async fn test_second_same_day_delete_keeps_first_snapshot() {
    let (_dir, path) = sales_store();
    seed_ten(&path);
    let mut engine = pinned(&path, day(2026, 10, 17));
    let snapshot = "Sales_10.17.2026_temp_table";

    let first = engine
        .delete_by_date("Sales", DateFilter::year(2024).unwrap())
        .await;
    assert!(first.success);
    assert_eq!(first.rows_affected, 3);
    assert_eq!(count_rows(&path, snapshot), 3);

    let refused = engine
        .delete_by_date("Sales", DateFilter::year(2025).unwrap())
        .await;
    assert!(!refused.success);
    assert_eq!(count_rows(&path, "Sales"), 7);
    assert_eq!(count_rows(&path, snapshot), 3);

    let second = engine
        .delete_by_date_with(
            "Sales",
            DateFilter::year(2025).unwrap(),
            &DeleteOptions::default().append_to_snapshot(true),
        )
        .await;
    assert!(second.success);
    assert_eq!(second.rows_affected, 4);
    assert_eq!(count_rows(&path, "Sales"), 3);
    assert_eq!(count_rows(&path, snapshot), 7);

    // Both years remain recoverable from the one snapshot
    let conn = rusqlite::Connection::open(&path).unwrap();
    let ids: Vec<i64> = conn
        .prepare("SELECT [ID] FROM [Sales_10.17.2026_temp_table] ORDER BY [ID]")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<std::result::Result<_, _>>()
        .unwrap();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
}

#[tokio::test]
async fn test_missing_date_column_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.db");
    create_store(
        &path,
        "CREATE TABLE [Plain] ([ID] INTEGER PRIMARY KEY, [Name] TEXT);
         INSERT INTO [Plain] VALUES (1, 'a');",
    );
    let mut engine = engine(&path);

    let outcome = engine
        .delete_by_date("Plain", DateFilter::year(2025).unwrap())
        .await;
    assert!(!outcome.success);
    assert_eq!(outcome.errors[0].category, ErrorCategory::Schema);
    assert_eq!(count_rows(&path, "Plain"), 1);
}

#[tokio::test]
async fn test_cleanup_drops_only_expired_snapshots() {
    let (_dir, path) = sales_store();
    seed_ten(&path);
    create_store(
        &path,
        "CREATE TABLE [Sales_9.1.2026_temp_table] ([ID] INTEGER);
         CREATE TABLE [Sales_10.10.2026_temp_table] ([ID] INTEGER);
         CREATE TABLE [Archive_2024] ([ID] INTEGER);",
    );
    let mut engine = pinned(&path, day(2026, 10, 17));

    engine
        .delete_by_date("Sales", DateFilter::year(2025).unwrap())
        .await;

    let listed = engine.list_snapshots().await.into_value().unwrap();
    let names: Vec<&str> = listed.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Sales_9.1.2026_temp_table",
            "Sales_10.10.2026_temp_table",
            "Sales_10.17.2026_temp_table",
        ]
    );
    assert_eq!(listed[0].age_days, 46);
    assert_eq!(listed[1].age_days, 7);

    let tables = engine.list_tables().await.into_value().unwrap();
    assert!(tables.iter().any(|t| t == "Sales_10.17.2026_temp_table"));

    let outcome = engine.cleanup_snapshots(7).await;
    assert!(outcome.success);
    let cleanup = outcome.value().unwrap();
    assert_eq!(cleanup.dropped, vec!["Sales_9.1.2026_temp_table"]);
    assert_eq!(
        cleanup.retained,
        vec!["Sales_10.10.2026_temp_table", "Sales_10.17.2026_temp_table"]
    );

    assert!(!table_exists(&path, "Sales_9.1.2026_temp_table"));
    assert!(table_exists(&path, "Sales_10.10.2026_temp_table"));
    assert!(table_exists(&path, "Archive_2024"));
}

#[tokio::test]
async fn test_cleanup_after_retention_period() {
    let (_dir, path) = sales_store();
    seed_ten(&path);

    let mut today = pinned(&path, day(2026, 10, 17));
    today
        .delete_by_date("Sales", DateFilter::year(2024).unwrap())
        .await;
    today.close().await.unwrap();

    let mut later = pinned(&path, day(2026, 10, 25));
    let outcome = later.cleanup_snapshots(7).await;
    assert_eq!(outcome.rows_affected, 1);
    assert!(!table_exists(&path, "Sales_10.17.2026_temp_table"));
    // The deleted rows are gone with it; the live table is untouched
    assert_eq!(count_rows(&path, "Sales"), 7);
}

#[tokio::test]
async fn test_cleanup_uses_configured_retention() {
    let (_dir, path) = sales_store();
    seed_ten(&path);

    let mut today = pinned(&path, day(2026, 10, 17));
    today
        .delete_by_date("Sales", DateFilter::year(2024).unwrap())
        .await;
    today.close().await.unwrap();

    let configured = |on: NaiveDate| {
        let config = EngineConfig::new(&path)
            .with_retries(0, Duration::from_millis(1))
            .with_retention_days(3);
        DataSyncEngine::new(config)
            .unwrap()
            .with_clock(Arc::new(FixedClock(on)))
    };

    let mut within = configured(day(2026, 10, 20));
    let outcome = within.cleanup_expired_snapshots().await;
    assert!(outcome.success);
    assert_eq!(outcome.rows_affected, 0);
    assert!(table_exists(&path, "Sales_10.17.2026_temp_table"));
    within.close().await.unwrap();

    // Four days old: past three days of retention, inside the default seven
    let mut past = configured(day(2026, 10, 21));
    let outcome = past.cleanup_expired_snapshots().await;
    assert_eq!(outcome.rows_affected, 1);
    assert_eq!(
        outcome.value().unwrap().dropped,
        vec!["Sales_10.17.2026_temp_table"]
    );
    assert!(!table_exists(&path, "Sales_10.17.2026_temp_table"));
}

#[tokio::test]
async fn test_failed_delete_rolls_back_and_keeps_rows() {
    let (_dir, path) = sales_store();
    seed_ten(&path);
    create_store(
        &path,
        "CREATE TRIGGER [sales_locked] BEFORE DELETE ON [Sales]
         BEGIN SELECT RAISE(ABORT, 'sales are locked'); END;",
    );
    let mut engine = pinned(&path, day(2026, 10, 17));

    let outcome = engine
        .delete_by_date("Sales", DateFilter::year(2025).unwrap())
        .await;
    assert!(!outcome.success);
    assert_eq!(outcome.rows_affected, 0);

    let result = outcome.value().unwrap();
    assert_eq!(result.state, DeleteState::RolledBack);
    assert_eq!(
        result.history,
        vec![
            DeleteState::Requested,
            DeleteState::SnapshotCreated,
            DeleteState::Verified,
            DeleteState::RolledBack,
        ]
    );
    let report = result.error.as_ref().unwrap();
    assert_eq!(report.category, ErrorCategory::Integrity);
    assert_eq!(report.context.table.as_deref(), Some("Sales"));

    // Source untouched, snapshot still holds the copies
    assert_eq!(count_rows(&path, "Sales"), 10);
    assert_eq!(count_rows(&path, "Sales_10.17.2026_temp_table"), 4);
}
