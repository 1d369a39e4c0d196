//! Shared fixtures for datasync-core integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use datasync_core::prelude::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

/// Failure injected when a statement contains a marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Query,
    Integrity,
    Connection,
    Syntax,
    Timeout,
}

impl Fault {
    fn error(self, sql: &str) -> Error {
        match self {
            Self::Query => Error::query_with_sql("scripted failure", sql),
            Self::Integrity => Error::integrity("UNIQUE (T.ID)", "scripted duplicate"),
            Self::Connection => Error::connection("scripted disconnect"),
            Self::Syntax => Error::syntax("unrecognized token", sql),
            Self::Timeout => Error::timeout("scripted statement timeout"),
        }
    }
}

/// State shared by every connection a [`RecordingFactory`] opens
#[derive(Debug, Default)]
pub struct Script {
    log: Mutex<Vec<String>>,
    faults: Mutex<Vec<(String, Fault)>>,
    responses: Mutex<VecDeque<Vec<Row>>>,
    connects: AtomicUsize,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every statement containing `marker`
    pub fn fail_on(&self, marker: &str, fault: Fault) {
        self.faults.lock().push((marker.to_string(), fault));
    }

    /// Queue rows for the next query
    pub fn respond(&self, rows: Vec<Row>) {
        self.responses.lock().push_back(rows);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.log.lock().iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn record(&self, sql: &str) -> Result<()> {
        self.log.lock().push(sql.to_string());
        let fault = self
            .faults
            .lock()
            .iter()
            .find(|(marker, _)| sql.contains(marker.as_str()))
            .map(|(_, fault)| *fault);
        match fault {
            Some(fault) => Err(fault.error(sql)),
            None => Ok(()),
        }
    }
}

/// Connection recording every statement and control call
#[derive(Debug)]
pub struct RecordingConnection {
    script: Arc<Script>,
}

#[async_trait]
impl Connection for RecordingConnection {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        self.script.record(sql)?;
        Ok(self.script.responses.lock().pop_front().unwrap_or_default())
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.script.record(sql)?;
        Ok(1)
    }

    async fn begin(&self) -> Result<()> {
        self.script.record("BEGIN")
    }

    async fn commit(&self) -> Result<()> {
        self.script.record("COMMIT")
    }

    async fn rollback(&self) -> Result<()> {
        self.script.record("ROLLBACK")
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        self.script.record("CLOSE")
    }
}

/// Factory handing out [`RecordingConnection`]s over one script
#[derive(Debug, Clone)]
pub struct RecordingFactory {
    pub script: Arc<Script>,
}

#[async_trait]
impl ConnectionFactory for RecordingFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingConnection {
            script: Arc::clone(&self.script),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "recording"
    }
}

/// Transaction manager over a fresh script
pub fn recording_manager() -> (TransactionManager, Arc<Script>) {
    let script = Script::new();
    let factory = RecordingFactory {
        script: Arc::clone(&script),
    };
    let manager = TransactionManager::new(Arc::new(factory), ConnectionConfig::new("mock.db"));
    (manager, script)
}

/// Create a store file at `path` and run `ddl` against it
pub fn create_store(path: &Path, ddl: &str) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(ddl).unwrap();
}

/// Row count of `table` read directly from the file
pub fn count_rows(path: &Path, table: &str) -> i64 {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM [{}]", table), [], |r| r.get(0))
        .unwrap()
}

/// Whether a table exists in the file
pub fn table_exists(path: &Path, table: &str) -> bool {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |r| r.get::<_, i64>(0),
    )
    .unwrap()
        > 0
}

pub const SALES_DDL: &str = "CREATE TABLE [Sales] (
    [ID] INTEGER PRIMARY KEY,
    [Time] DATE NOT NULL,
    [Amount] CURRENCY,
    [Region] VARCHAR(10)
);";

/// Temporary store holding an empty `Sales` table
pub fn sales_store() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sales.db");
    create_store(&path, SALES_DDL);
    (dir, path)
}

/// Engine over `path` without retries
pub fn engine(path: &Path) -> DataSyncEngine {
    init_test_logging();
    let config = EngineConfig::new(path).with_retries(0, Duration::from_millis(1));
    DataSyncEngine::new(config).unwrap()
}

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("datasync_core=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// A `Sales` row
pub fn sale(id: i64, time: &str, amount: &str, region: &str) -> Row {
    Row::from_pairs([
        ("ID", Value::Int64(id)),
        ("Time", Value::from(time)),
        ("Amount", Value::from(amount)),
        ("Region", Value::from(region)),
    ])
}
