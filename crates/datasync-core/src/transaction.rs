//! Transaction management for datasync-core
//!
//! The store supports one native transaction per connection. A
//! [`TransactionContext`] therefore models logical nesting with a depth
//! counter over a single native transaction:
//!
//! ```text
//! IDLE --begin--> ACTIVE --commit (outermost)--> COMMITTED
//!                   |
//!                   +----rollback (any depth)--> ROLLED_BACK
//! ```
//!
//! - Nested `begin` only increments the depth; only the outermost `commit`
//!   issues a native commit.
//! - Any failure at any depth marks the whole context rollback-only. A
//!   rollback-only context never commits: `commit` rolls back instead and
//!   reports a transaction error.
//! - The first rollback request issues the native rollback; later requests
//!   are logged and ignored.
//! - The connection outlives contexts. It is closed only by
//!   [`TransactionManager::teardown`] or after a connection-category failure,
//!   and reopened lazily by the next context.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::connection::{query_count, Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};
use crate::monitoring::record_rollback;
use crate::query::Statement;
use crate::types::Row;

/// Lifecycle state of a [`TransactionContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No native transaction started
    Idle,
    /// Native transaction open
    Active,
    /// Outermost commit succeeded (terminal)
    Committed,
    /// Native transaction rolled back (terminal)
    RolledBack,
}

impl TransactionState {
    /// Whether no further statements may run
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Committed => write!(f, "COMMITTED"),
            Self::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// Owner of the store connection
pub struct TransactionManager {
    factory: Arc<dyn ConnectionFactory>,
    config: ConnectionConfig,
    conn: Option<Box<dyn Connection>>,
    rollback_pending: bool,
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("backend", &self.factory.backend_name())
            .field("config", &self.config)
            .field("connected", &self.conn.is_some())
            .field("rollback_pending", &self.rollback_pending)
            .finish()
    }
}

impl TransactionManager {
    /// Create a manager; the connection is opened on first use
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: ConnectionConfig) -> Self {
        Self {
            factory,
            config,
            conn: None,
            rollback_pending: false,
        }
    }

    /// Connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Whether a connection is currently open
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Whether a dropped context left a rollback for the next context
    pub fn is_rollback_pending(&self) -> bool {
        self.rollback_pending
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.conn.is_none() {
            debug!(path = %self.config.path.display(), "opening connection");
            self.conn = Some(self.factory.connect(&self.config).await?);
        }
        Ok(())
    }

    fn drop_connection(&mut self, reason: &Error) {
        if self.conn.take().is_some() {
            warn!(error = %reason, "discarding connection after unrecoverable failure");
        }
    }

    /// Start a context for one top-level operation.
    ///
    /// Opens the connection if needed and settles a rollback left pending by
    /// a context that was dropped while active.
    pub async fn context(&mut self) -> Result<TransactionContext<'_>> {
        self.ensure_connected().await?;
        if self.rollback_pending {
            self.rollback_pending = false;
            if let Some(conn) = self.conn.as_deref() {
                warn!("rolling back transaction abandoned by a previous context");
                match conn.rollback().await {
                    Ok(()) => record_rollback(),
                    Err(e) if e.is_connection_fatal() => self.drop_connection(&e),
                    Err(e) => return Err(e),
                }
            }
            self.ensure_connected().await?;
        }
        Ok(TransactionContext {
            manager: self,
            state: TransactionState::Idle,
            depth: 0,
            rollback_only: false,
            rollback_issued: false,
        })
    }

    /// Close the connection
    pub async fn teardown(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            if self.rollback_pending {
                self.rollback_pending = false;
                if let Err(e) = conn.rollback().await {
                    warn!(error = %e, "rollback during teardown failed");
                }
            }
            conn.close().await?;
            debug!("connection closed");
        }
        Ok(())
    }
}

/// Transaction scope for one top-level operation
pub struct TransactionContext<'m> {
    manager: &'m mut TransactionManager,
    state: TransactionState,
    depth: u32,
    rollback_only: bool,
    rollback_issued: bool,
}

impl fmt::Debug for TransactionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("state", &self.state)
            .field("depth", &self.depth)
            .field("rollback_only", &self.rollback_only)
            .finish()
    }
}

impl TransactionContext<'_> {
    /// Current state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Current nesting depth (0 when idle)
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Whether a failure has doomed the transaction
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// The open connection, for read-only catalog queries
    pub fn connection(&self) -> Result<&dyn Connection> {
        self.manager
            .conn
            .as_deref()
            .ok_or_else(|| Error::connection("connection is not open"))
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::transaction(format!(
                "transaction context is already {}",
                self.state
            )));
        }
        Ok(())
    }

    /// Mark the context rollback-only without issuing anything
    pub fn mark_rollback(&mut self) {
        if self.state == TransactionState::Active && !self.rollback_only {
            debug!(depth = self.depth, "transaction marked rollback-only");
            self.rollback_only = true;
        }
    }

    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.mark_rollback();
            if e.is_connection_fatal() {
                self.manager.drop_connection(e);
            }
        }
        result
    }

    /// Begin a transaction, or one more nesting level of the open one
    pub async fn begin(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.state == TransactionState::Active {
            self.depth += 1;
            debug!(depth = self.depth, "nested begin");
            return Ok(());
        }

        self.manager.ensure_connected().await?;
        let result = self.connection()?.begin().await;
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                self.manager.drop_connection(e);
            }
        }
        result?;
        self.state = TransactionState::Active;
        self.depth = 1;
        debug!("transaction started");
        Ok(())
    }

    /// Execute a statement, returning affected rows
    pub async fn execute(&mut self, stmt: &Statement) -> Result<u64> {
        self.ensure_usable()?;
        if self.state == TransactionState::Idle {
            self.manager.ensure_connected().await?;
        }
        let result = self.connection()?.execute(&stmt.sql, &stmt.params).await;
        self.observe(result)
    }

    /// Run a query
    pub async fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>> {
        self.ensure_usable()?;
        if self.state == TransactionState::Idle {
            self.manager.ensure_connected().await?;
        }
        let result = self.connection()?.query(&stmt.sql, &stmt.params).await;
        self.observe(result)
    }

    /// Run a COUNT-style query and read the first column of the first row
    pub async fn count(&mut self, stmt: &Statement) -> Result<u64> {
        self.ensure_usable()?;
        if self.state == TransactionState::Idle {
            self.manager.ensure_connected().await?;
        }
        let result = query_count(self.connection()?, &stmt.sql, &stmt.params).await;
        self.observe(result)
    }

    /// Commit one nesting level.
    ///
    /// Inner levels only decrement the depth. At the outermost level a
    /// rollback-only context is rolled back and an error is returned; the
    /// native commit is never issued.
    pub async fn commit(&mut self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(Error::transaction(format!(
                "commit requested while {}",
                self.state
            )));
        }

        if self.depth > 1 {
            self.depth -= 1;
            if self.rollback_only {
                return Err(Error::transaction(
                    "nested commit refused: transaction was marked for rollback",
                ));
            }
            debug!(depth = self.depth, "nested commit deferred to outermost level");
            return Ok(());
        }

        if self.rollback_only {
            self.rollback().await?;
            return Err(Error::transaction(
                "commit refused: transaction was marked for rollback",
            ));
        }

        let result = self.connection()?.commit().await;
        match result {
            Ok(()) => {
                self.state = TransactionState::Committed;
                self.depth = 0;
                debug!("transaction committed");
                Ok(())
            }
            Err(e) => {
                self.mark_rollback();
                if e.is_connection_fatal() {
                    self.manager.drop_connection(&e);
                }
                if let Err(rb) = self.rollback().await {
                    warn!(error = %rb, "rollback after failed commit also failed");
                }
                Err(e)
            }
        }
    }

    /// Roll back the whole transaction regardless of depth.
    ///
    /// Only the first request reaches the store; repeats are no-ops.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.rollback_issued {
            warn!(depth = self.depth, "rollback already issued, ignoring repeated request");
            return Ok(());
        }
        match self.state {
            TransactionState::Committed => {
                return Err(Error::transaction("rollback requested after commit"));
            }
            TransactionState::RolledBack => return Ok(()),
            TransactionState::Idle => {
                self.state = TransactionState::RolledBack;
                return Ok(());
            }
            TransactionState::Active => {}
        }

        self.rollback_issued = true;
        self.rollback_only = true;
        self.state = TransactionState::RolledBack;
        self.depth = 0;

        // Without a connection the store has already discarded the work
        let Some(conn) = self.manager.conn.as_deref() else {
            record_rollback();
            return Ok(());
        };
        let result = conn.rollback().await;
        record_rollback();
        match result {
            Ok(()) => {
                warn!("transaction rolled back");
                Ok(())
            }
            Err(e) => {
                if e.is_connection_fatal() {
                    self.manager.drop_connection(&e);
                }
                Err(e)
            }
        }
    }

    /// Roll back and hand back the error that caused it
    pub async fn abort(&mut self, cause: Error) -> Error {
        self.mark_rollback();
        if let Err(e) = self.rollback().await {
            warn!(error = %e, cause = %cause, "rollback failed while aborting");
        }
        cause
    }
}

impl Drop for TransactionContext<'_> {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            warn!(
                depth = self.depth,
                "transaction context dropped while active; rollback deferred to next context"
            );
            self.manager.rollback_pending = true;
        }
    }
}
