//! Operation monitoring for datasync-core
//!
//! Provides:
//! - OperationMonitor: timing, success and row counts per tracked operation
//! - Performance thresholds and timeouts per operation name
//! - Aggregation by operation name or category
//! - JSON export/import of the monitor state
//!
//! Counters and histograms go through the `metrics` facade; no recorder is
//! installed here.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const ROWS_COMMITTED: &str = "datasync_rows_committed_total";
const ROWS_FAILED: &str = "datasync_rows_failed_total";
const OPERATION_DURATION: &str = "datasync_operation_duration_seconds";
const ROLLBACKS: &str = "datasync_rollbacks_total";

/// Completed operations kept for aggregation before the oldest are evicted
pub const DEFAULT_HISTORY: usize = 1024;

/// Count one native rollback
pub fn record_rollback() {
    metrics::counter!(ROLLBACKS).increment(1);
}

/// Facade handles shared by every tracked operation
#[derive(Clone)]
pub struct EngineMetrics {
    /// Rows committed to the store
    pub rows_committed: metrics::Counter,
    /// Rows permanently rejected
    pub rows_failed: metrics::Counter,
}

impl EngineMetrics {
    /// Register the engine counters
    pub fn new() -> Self {
        Self {
            rows_committed: metrics::counter!(ROWS_COMMITTED),
            rows_failed: metrics::counter!(ROWS_FAILED),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}

/// Handle returned by [`OperationMonitor::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Metrics for a single tracked operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    /// Operation id
    pub id: OperationId,
    /// Operation name (`insert_batch`, `delete_by_date`, ...)
    pub name: String,
    /// Optional grouping, usually the table
    pub category: Option<String>,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Elapsed milliseconds, `None` while in flight
    pub duration_ms: Option<u64>,
    /// Outcome, `None` while in flight
    pub success: Option<bool>,
    /// Rows affected
    pub rows: u64,
    /// Errors recorded against this operation
    pub error_count: u32,
    /// Most recent error message
    pub last_error: Option<String>,
    /// Duration went over the configured threshold
    pub exceeded_threshold: bool,
    /// Threshold in force when the operation finished
    pub threshold_ms: Option<u64>,
    /// Duration went over the configured timeout
    pub timed_out: bool,
    /// Timeout in force when the operation finished
    pub timeout_ms: Option<u64>,
}

impl OperationMetrics {
    /// Whether the operation has not finished yet
    pub fn is_in_flight(&self) -> bool {
        self.duration_ms.is_none()
    }

    /// Elapsed time of a finished operation
    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }
}

/// Aggregate over a set of finished operations
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedMetrics {
    /// Category the aggregate was filtered by
    pub category: Option<String>,
    /// Finished operations
    pub operation_count: u64,
    /// Finished operations that failed
    pub failure_count: u64,
    /// Errors recorded across all operations
    pub error_count: u64,
    /// Rows affected across all operations
    pub rows: u64,
    /// Sum of durations
    pub total_duration_ms: u64,
    /// Mean duration
    pub average_duration_ms: f64,
    /// Shortest duration
    pub min_duration_ms: u64,
    /// Longest duration
    pub max_duration_ms: u64,
    /// Operations that exceeded their threshold
    pub slow_count: u64,
}

impl AggregatedMetrics {
    fn collect<'a>(ops: impl Iterator<Item = &'a OperationMetrics>, category: Option<String>) -> Self {
        let mut agg = Self {
            category,
            ..Self::default()
        };
        for op in ops {
            agg.error_count += u64::from(op.error_count);
            let Some(ms) = op.duration_ms else {
                continue;
            };
            if agg.operation_count == 0 || ms < agg.min_duration_ms {
                agg.min_duration_ms = ms;
            }
            agg.max_duration_ms = agg.max_duration_ms.max(ms);
            agg.operation_count += 1;
            agg.total_duration_ms += ms;
            agg.rows += op.rows;
            if op.success == Some(false) {
                agg.failure_count += 1;
            }
            if op.exceeded_threshold {
                agg.slow_count += 1;
            }
        }
        if agg.operation_count > 0 {
            agg.average_duration_ms = agg.total_duration_ms as f64 / agg.operation_count as f64;
        }
        agg
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MonitorState {
    next_id: u64,
    operations: BTreeMap<OperationId, OperationMetrics>,
    thresholds_ms: HashMap<String, u64>,
    timeouts_ms: HashMap<String, u64>,
    #[serde(skip)]
    clocks: HashMap<OperationId, Instant>,
}

/// Tracks operations and publishes their metrics
#[derive(Debug)]
pub struct OperationMonitor {
    state: Mutex<MonitorState>,
    history: usize,
    metrics: EngineMetrics,
}

impl Default for OperationMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationMonitor {
    /// Create a monitor keeping [`DEFAULT_HISTORY`] finished operations
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Create a monitor keeping at most `history` finished operations
    pub fn with_history(history: usize) -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            history: history.max(1),
            metrics: EngineMetrics::new(),
        }
    }

    /// Flag operations named `name` that take longer than `threshold`
    pub fn set_threshold(&self, name: impl Into<String>, threshold: Duration) {
        self.state
            .lock()
            .thresholds_ms
            .insert(name.into(), threshold.as_millis() as u64);
    }

    /// Flag operations named `name` that take longer than `timeout`
    pub fn set_timeout(&self, name: impl Into<String>, timeout: Duration) {
        self.state
            .lock()
            .timeouts_ms
            .insert(name.into(), timeout.as_millis() as u64);
    }

    /// Start tracking an operation
    pub fn start(&self, name: &str, category: Option<&str>) -> OperationId {
        let mut state = self.state.lock();
        let id = OperationId(state.next_id);
        state.next_id += 1;
        state.operations.insert(
            id,
            OperationMetrics {
                id,
                name: name.to_string(),
                category: category.map(String::from),
                started_at: Utc::now(),
                duration_ms: None,
                success: None,
                rows: 0,
                error_count: 0,
                last_error: None,
                exceeded_threshold: false,
                threshold_ms: None,
                timed_out: false,
                timeout_ms: None,
            },
        );
        state.clocks.insert(id, Instant::now());
        debug!(operation = name, %id, "operation started");
        id
    }

    /// Record an error against an in-flight or finished operation
    pub fn record_error(&self, id: OperationId, error: &Error) -> Result<()> {
        let mut state = self.state.lock();
        let op = state
            .operations
            .get_mut(&id)
            .ok_or_else(|| Error::internal(format!("unknown operation id: {}", id)))?;
        op.error_count += 1;
        op.last_error = Some(error.to_string());
        Ok(())
    }

    /// Finish an operation, measuring elapsed time since [`start`](Self::start)
    pub fn finish(&self, id: OperationId, success: bool, rows: u64) -> Result<OperationMetrics> {
        let elapsed = self
            .state
            .lock()
            .clocks
            .get(&id)
            .map(Instant::elapsed)
            .ok_or_else(|| Error::internal(format!("operation {} is not in flight", id)))?;
        self.close(id, elapsed, success, rows)
    }

    fn close(
        &self,
        id: OperationId,
        elapsed: Duration,
        success: bool,
        rows: u64,
    ) -> Result<OperationMetrics> {
        let mut state = self.state.lock();
        let MonitorState {
            operations,
            thresholds_ms,
            timeouts_ms,
            clocks,
            ..
        } = &mut *state;
        clocks.remove(&id);
        let op = operations
            .get_mut(&id)
            .ok_or_else(|| Error::internal(format!("unknown operation id: {}", id)))?;
        if !op.is_in_flight() {
            return Err(Error::internal(format!("operation {} already finished", id)));
        }

        let ms = elapsed.as_millis() as u64;
        op.duration_ms = Some(ms);
        op.success = Some(success);
        op.rows = rows;
        if let Some(&limit) = thresholds_ms.get(&op.name) {
            op.threshold_ms = Some(limit);
            op.exceeded_threshold = ms > limit;
        }
        if let Some(&limit) = timeouts_ms.get(&op.name) {
            op.timeout_ms = Some(limit);
            op.timed_out = ms > limit;
        }
        let finished = op.clone();

        metrics::histogram!(OPERATION_DURATION, "operation" => finished.name.clone())
            .record(elapsed.as_secs_f64());
        if finished.timed_out {
            warn!(
                operation = %finished.name,
                duration_ms = ms,
                timeout_ms = finished.timeout_ms,
                "operation exceeded its timeout"
            );
        } else if finished.exceeded_threshold {
            warn!(
                operation = %finished.name,
                duration_ms = ms,
                threshold_ms = finished.threshold_ms,
                "slow operation"
            );
        }

        self.evict(&mut state);
        Ok(finished)
    }

    fn evict(&self, state: &mut MonitorState) {
        let finished = state
            .operations
            .values()
            .filter(|op| !op.is_in_flight())
            .count();
        if finished <= self.history {
            return;
        }
        let excess = finished - self.history;
        let stale: Vec<OperationId> = state
            .operations
            .values()
            .filter(|op| !op.is_in_flight())
            .take(excess)
            .map(|op| op.id)
            .collect();
        for id in stale {
            state.operations.remove(&id);
        }
    }

    /// Count rows committed and rows permanently rejected
    pub fn record_rows(&self, committed: u64, failed: u64) {
        if committed > 0 {
            self.metrics.rows_committed.increment(committed);
        }
        if failed > 0 {
            self.metrics.rows_failed.increment(failed);
        }
    }

    /// Metrics of one operation
    pub fn operation(&self, id: OperationId) -> Option<OperationMetrics> {
        self.state.lock().operations.get(&id).cloned()
    }

    /// Number of operations started but not finished
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().clocks.len()
    }

    /// Aggregate over finished operations named `name`
    pub fn aggregated(&self, name: &str) -> AggregatedMetrics {
        let state = self.state.lock();
        AggregatedMetrics::collect(state.operations.values().filter(|op| op.name == name), None)
    }

    /// Aggregate over finished operations in `category`
    pub fn category_metrics(&self, category: &str) -> AggregatedMetrics {
        let state = self.state.lock();
        AggregatedMetrics::collect(
            state
                .operations
                .values()
                .filter(|op| op.category.as_deref() == Some(category)),
            Some(category.to_string()),
        )
    }

    /// Serialise operations, thresholds and timeouts as JSON
    pub fn export_json(&self) -> Result<String> {
        let state = self.state.lock();
        serde_json::to_string_pretty(&*state)
            .map_err(|e| Error::internal(format!("failed to serialise metrics: {}", e)))
    }

    /// Replace the monitor state with a previous [`export_json`](Self::export_json)
    pub fn import_json(&self, json: &str) -> Result<()> {
        let restored: MonitorState = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid metrics document: {}", e)))?;
        *self.state.lock() = restored;
        Ok(())
    }

    /// Write [`export_json`](Self::export_json) to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.export_json()?;
        std::fs::write(path, json).map_err(|e| {
            Error::internal(format!("failed to write metrics to {}: {}", path.display(), e))
        })
    }

    /// Load a saved state from `path`; a missing file leaves the monitor untouched
    pub fn load(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::internal(format!("failed to read metrics from {}: {}", path.display(), e))
        })?;
        self.import_json(&json)
    }

    /// Drop finished operations; thresholds and in-flight operations stay
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.operations.retain(|_, op| op.is_in_flight());
    }

    /// Drop everything, including thresholds and timeouts
    pub fn reset(&self) {
        *self.state.lock() = MonitorState::default();
    }
}
