//! Driver-facing traits
//!
//! The pool does not speak any wire protocol itself; it drives raw
//! connections produced by a [`ConnectionFactory`] through the narrow
//! [`RawConnection`] surface below. Capability probes (`ping`, network
//! timeout, query timeout) may return [`Error::Unsupported`] and the pool
//! degrades gracefully.

use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::executor::TimeoutExecutorHandle;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Read uncommitted - dirty reads possible
    ReadUncommitted,
    /// Read committed - no dirty reads
    ReadCommitted,
    /// Repeatable read - no non-repeatable reads
    RepeatableRead,
    /// Serializable - full isolation
    Serializable,
}

impl IsolationLevel {
    /// Convert to SQL string for SET TRANSACTION statements
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

/// A live driver-level connection owned by one pool entry.
///
/// Methods take `&mut self`: the pool guarantees exclusive access through
/// the entry state machine and serializes calls behind the entry's mutex.
/// Implementations report link-level failures with
/// [`Error::Connection`](crate::Error::Connection) so the pool can abandon
/// the entry, and statement-level failures with
/// [`Error::Query`](crate::Error::Query).
pub trait RawConnection: Send {
    /// Execute a statement, returning the affected row count
    fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Native liveness check.
    ///
    /// Returns `Ok(true)` when the connection is alive, `Ok(false)` when it
    /// is dead, and `Err(Unsupported)` when the driver has no native check
    /// (the pool falls back to probing with [`PoolConfig::test_sql`]).
    ///
    /// [`PoolConfig::test_sql`]: crate::PoolConfig::test_sql
    fn ping(&mut self, timeout: Duration) -> Result<bool>;

    /// Roll back any open work
    fn rollback(&mut self) -> Result<()>;

    /// Set the auto-commit flag
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()>;

    /// Set the read-only flag
    fn set_read_only(&mut self, read_only: bool) -> Result<()>;

    /// Set the current catalog
    fn set_catalog(&mut self, catalog: &str) -> Result<()>;

    /// Set the current schema
    fn set_schema(&mut self, schema: &str) -> Result<()>;

    /// Get the current transaction isolation level
    fn isolation(&mut self) -> Result<IsolationLevel>;

    /// Set the transaction isolation level
    fn set_isolation(&mut self, isolation: IsolationLevel) -> Result<()>;

    /// Get the driver network timeout; `Err(Unsupported)` or a zero value
    /// disables network-timeout handling for the pool
    fn network_timeout(&mut self) -> Result<Duration>;

    /// Set the driver network timeout. The executor handle runs the
    /// driver-side abort when the timeout fires.
    fn set_network_timeout(
        &mut self,
        executor: TimeoutExecutorHandle,
        timeout: Duration,
    ) -> Result<()>;

    /// Set a per-statement query timeout for subsequent statements
    fn set_query_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Close the connection, releasing driver resources
    fn close(&mut self) -> Result<()>;
}

/// Factory for raw connections
pub trait ConnectionFactory: Send + Sync {
    /// Open a new raw connection
    fn create(&self, config: &ConnectionConfig) -> Result<Box<dyn RawConnection>>;
}
