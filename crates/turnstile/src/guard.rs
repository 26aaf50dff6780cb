//! Borrowed-connection guard
//!
//! The object handed to callers. It forwards driver calls to the
//! underlying entry, tracks which per-connection defaults the caller
//! dirtied so the pool can restore them, and returns the entry on `close`
//! or drop. A call that fails at the link level marks the guard broken and
//! the entry is abandoned instead of recycled.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::connection::IsolationLevel;
use crate::error::{Error, ErrorKind, Result};
use crate::pool::Pool;
use crate::pooled::{PooledConn, CONN_CLOSED};

pub(crate) const DIRTY_AUTO_COMMIT: u8 = 1 << 0;
pub(crate) const DIRTY_READ_ONLY: u8 = 1 << 1;
pub(crate) const DIRTY_CATALOG: u8 = 1 << 2;
pub(crate) const DIRTY_SCHEMA: u8 = 1 << 3;
pub(crate) const DIRTY_ISOLATION: u8 = 1 << 4;

/// A connection borrowed from a [`Pool`].
///
/// Returned to the pool when dropped; [`close`](Self::close) returns it
/// eagerly. At most one guard references a pooled entry at any instant.
pub struct PooledConnection {
    entry: Option<Arc<PooledConn>>,
    pool: Weak<Pool>,
    dirty: u8,
    broken: bool,
}

impl PooledConnection {
    pub(crate) fn new(entry: Arc<PooledConn>, pool: Weak<Pool>) -> Self {
        Self {
            entry: Some(entry),
            pool,
            dirty: 0,
            broken: false,
        }
    }

    /// Identity of the underlying pooled entry; stable for the entry's
    /// lifetime and useful for diagnostics.
    pub fn entry_id(&self) -> u64 {
        self.entry().id()
    }

    /// Execute a statement, returning the affected row count.
    pub fn execute(&mut self, sql: &str) -> Result<u64> {
        self.forward(|raw| raw.execute(sql))
    }

    /// Roll back open work on this connection.
    pub fn rollback(&mut self) -> Result<()> {
        self.forward(|raw| raw.rollback())
    }

    /// Change the auto-commit flag; restored to the pool default on return.
    pub fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.forward(|raw| raw.set_auto_commit(auto_commit))?;
        self.dirty |= DIRTY_AUTO_COMMIT;
        Ok(())
    }

    /// Change the read-only flag; restored to the pool default on return.
    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.forward(|raw| raw.set_read_only(read_only))?;
        self.dirty |= DIRTY_READ_ONLY;
        Ok(())
    }

    /// Change the catalog; restored to the pool default on return.
    pub fn set_catalog(&mut self, catalog: &str) -> Result<()> {
        self.forward(|raw| raw.set_catalog(catalog))?;
        self.dirty |= DIRTY_CATALOG;
        Ok(())
    }

    /// Change the schema; restored to the pool default on return.
    pub fn set_schema(&mut self, schema: &str) -> Result<()> {
        self.forward(|raw| raw.set_schema(schema))?;
        self.dirty |= DIRTY_SCHEMA;
        Ok(())
    }

    /// Change the isolation level; restored to the pool default on return.
    pub fn set_isolation(&mut self, isolation: IsolationLevel) -> Result<()> {
        self.forward(|raw| raw.set_isolation(isolation))?;
        self.dirty |= DIRTY_ISOLATION;
        Ok(())
    }

    /// Set a per-statement query timeout for subsequent statements.
    pub fn set_query_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.forward(|raw| raw.set_query_timeout(timeout))
    }

    /// Return the connection to the pool eagerly.
    pub fn close(mut self) {
        self.release();
    }

    /// Whether a forwarded call detected a broken link.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn entry(&self) -> &Arc<PooledConn> {
        self.entry.as_ref().expect("connection already returned")
    }

    fn forward<T>(
        &mut self,
        op: impl FnOnce(&mut dyn crate::connection::RawConnection) -> Result<T>,
    ) -> Result<T> {
        let entry = self.entry().clone();
        if entry.state() == CONN_CLOSED {
            // Revoked by the idle scan or a forced clear while borrowed.
            self.broken = true;
            return Err(Error::connection("connection has been revoked by the pool"));
        }
        let result = {
            let mut raw = entry.raw();
            op(raw.as_mut())
        };
        match result {
            Ok(value) => {
                if let Some(pool) = self.pool.upgrade() {
                    entry.touch(pool.now_ms());
                }
                Ok(value)
            }
            Err(e) => {
                if e.kind() == ErrorKind::Connection {
                    self.broken = true;
                }
                Err(e)
            }
        }
    }

    fn release(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.return_from_guard(entry, self.dirty, self.broken);
            } else {
                // Pool is gone; its close path already released the raw
                // handle.
                entry.set_guard_open(false);
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("entry", &self.entry.as_ref().map(|e| e.id()))
            .field("dirty", &self.dirty)
            .field("broken", &self.broken)
            .finish()
    }
}
