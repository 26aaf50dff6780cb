//! Pooled connection entry
//!
//! One entry owns one raw driver connection plus the atomic state word the
//! whole transfer engine pivots on. Every `Idle -> Using` transition is a
//! CAS, so at most one borrower can win an entry; transitions to `Closed`
//! are terminal and the entry is unlinked from the snapshot array at the
//! next scan.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;

use crate::connection::{IsolationLevel, RawConnection};

/// Entry state: free for borrowing
pub(crate) const CONN_IDLE: u32 = 0;
/// Entry state: issued to a borrower (or reserved by the servant)
pub(crate) const CONN_USING: u32 = 1;
/// Entry state: terminal; raw handle released, entry awaiting unlink
pub(crate) const CONN_CLOSED: u32 = 2;

/// Per-connection default settings cloned onto every new raw connection
/// and restored when a borrower dirtied them.
#[derive(Debug, Clone)]
pub(crate) struct ConnDefaults {
    pub auto_commit: bool,
    pub read_only: bool,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    /// Resolved at probe time: configured value, or the driver default
    pub isolation: Option<IsolationLevel>,
}

/// A pool-owned wrapper around one live raw connection.
pub(crate) struct PooledConn {
    id: u64,
    raw: Mutex<Box<dyn RawConnection>>,
    state: AtomicU32,
    /// Millis since the pool epoch; updated on every successful use
    last_access_ms: AtomicU64,
    created_at: Instant,
    /// True while a caller-facing guard is bound to this entry
    guard_open: AtomicBool,
    /// Raw close must run at most once across remove paths
    raw_closed: AtomicBool,
    defaults: ConnDefaults,
}

impl PooledConn {
    pub(crate) fn new(
        id: u64,
        raw: Box<dyn RawConnection>,
        state: u32,
        now_ms: u64,
        defaults: ConnDefaults,
    ) -> Self {
        Self {
            id,
            raw: Mutex::new(raw),
            state: AtomicU32::new(state),
            last_access_ms: AtomicU64::new(now_ms),
            created_at: Instant::now(),
            guard_open: AtomicBool::new(false),
            raw_closed: AtomicBool::new(false),
            defaults,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// CAS the state word; the `Idle -> Using` edge is the single-issue
    /// point of the whole engine.
    #[inline]
    pub(crate) fn cas_state(&self, from: u32, to: u32) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditional store; only used on paths that already own the entry
    /// (remove, fair-mode release).
    #[inline]
    pub(crate) fn force_state(&self, state: u32) {
        self.state.store(state, Ordering::Release);
    }

    #[inline]
    pub(crate) fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn touch(&self, now_ms: u64) {
        self.last_access_ms.store(now_ms, Ordering::Release);
    }

    #[inline]
    pub(crate) fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    #[inline]
    pub(crate) fn guard_open(&self) -> bool {
        self.guard_open.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_guard_open(&self, open: bool) {
        self.guard_open.store(open, Ordering::Release);
    }

    #[inline]
    pub(crate) fn defaults(&self) -> &ConnDefaults {
        &self.defaults
    }

    /// Exclusive access to the raw handle. Callers hold the entry in
    /// `Using` (or are the remove path), so the lock is uncontended.
    #[inline]
    pub(crate) fn raw(&self) -> parking_lot::MutexGuard<'_, Box<dyn RawConnection>> {
        self.raw.lock()
    }

    /// Close the raw handle once; close errors are swallowed and logged.
    pub(crate) fn close_raw(&self, pool_name: &str) {
        if self
            .raw_closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Err(e) = self.raw().close() {
            warn!(pool = pool_name, conn = self.id, error = %e, "failed to close raw connection");
        }
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state() {
            CONN_IDLE => "idle",
            CONN_USING => "using",
            _ => "closed",
        };
        f.debug_struct("PooledConn")
            .field("id", &self.id)
            .field("state", &state)
            .field("last_access_ms", &self.last_access_ms())
            .field("guard_open", &self.guard_open())
            .finish()
    }
}
