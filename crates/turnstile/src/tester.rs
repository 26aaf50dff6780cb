//! Liveness testing
//!
//! Chosen once, at the first successful connection creation, by probing the
//! driver: a native `ping` when the driver supports it, otherwise a short
//! probe statement. `is_alive` never propagates driver faults; it logs and
//! reports the connection as dead, and the pool removes it.

use std::time::Duration;

use tracing::warn;

use crate::pooled::PooledConn;

#[derive(Debug, Clone)]
pub(crate) enum Tester {
    /// Native driver liveness call
    Ping,
    /// Probe statement on drivers without a native check
    Query {
        sql: String,
        /// Pool-wide default; the probe temporarily disables auto-commit so
        /// it can roll the probe statement back
        default_auto_commit: bool,
        /// Detected at probe time; when false, per-query timeouts are not
        /// attempted
        supports_query_timeout: bool,
    },
}

impl Tester {
    /// Liveness check. Touches `last_access` on success so the skip window
    /// restarts; reports `false` on any driver fault.
    pub(crate) fn is_alive(
        &self,
        pool_name: &str,
        conn: &PooledConn,
        timeout: Duration,
        now_ms: u64,
    ) -> bool {
        let alive = match self {
            Tester::Ping => self.ping(pool_name, conn, timeout),
            Tester::Query {
                sql,
                default_auto_commit,
                supports_query_timeout,
            } => self.probe(
                pool_name,
                conn,
                sql,
                *default_auto_commit,
                *supports_query_timeout,
                timeout,
            ),
        };
        if alive {
            conn.touch(now_ms);
        }
        alive
    }

    fn ping(&self, pool_name: &str, conn: &PooledConn, timeout: Duration) -> bool {
        match conn.raw().ping(timeout) {
            Ok(alive) => alive,
            Err(e) => {
                warn!(pool = pool_name, conn = conn.id(), error = %e, "liveness ping failed");
                false
            }
        }
    }

    fn probe(
        &self,
        pool_name: &str,
        conn: &PooledConn,
        sql: &str,
        default_auto_commit: bool,
        supports_query_timeout: bool,
        timeout: Duration,
    ) -> bool {
        let mut raw = conn.raw();

        // The probe may invoke a stored procedure, so it runs inside a
        // transaction that is always rolled back.
        let mut auto_commit_changed = false;
        if default_auto_commit {
            match raw.set_auto_commit(false) {
                Ok(()) => auto_commit_changed = true,
                Err(e) => {
                    warn!(pool = pool_name, conn = conn.id(), error = %e, "probe setup failed");
                    return false;
                }
            }
        }

        if supports_query_timeout {
            if let Err(e) = raw.set_query_timeout(timeout) {
                warn!(pool = pool_name, conn = conn.id(), error = %e, "failed to set probe timeout");
            }
        }

        let alive = match raw.execute(sql).and_then(|_| raw.rollback()) {
            Ok(()) => true,
            Err(e) => {
                warn!(pool = pool_name, conn = conn.id(), error = %e, "probe statement failed");
                false
            }
        };

        if auto_commit_changed {
            if let Err(e) = raw.set_auto_commit(true) {
                warn!(pool = pool_name, conn = conn.id(), error = %e, "failed to restore auto-commit after probe");
                return false;
            }
        }
        alive
    }
}
