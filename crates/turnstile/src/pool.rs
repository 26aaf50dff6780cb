//! Pool core
//!
//! Orchestrates the borrow/return transfer engine:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Pool                                   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ caller ──► thread-local hint ──► admission semaphore ──► scan    │
//! │                 │                                         │      │
//! │                 │ miss                              miss  ▼      │
//! │                 │                ┌──────────────── wait queue    │
//! │                 ▼                ▼                        ▲      │
//! │          Idle -> Using CAS   hand-off slot (CAS)          │      │
//! │                                  ▲                        │      │
//! │ return ──► transfer policy ──────┘          servant ──────┘      │
//! │                                             idle-scan ──► evict  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Suspension happens in exactly two places: the admission semaphore and
//! `park_timeout` on the caller's own borrower slot. Background workers
//! park on their own state words. No lock is held across another lock or
//! across a park; the creation mutex is only held across the driver
//! `create()` call.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::Thread;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::borrower::{
    Borrower, Handoff, Payload, Taken, TransferSlot, SLOT_NORMAL, SLOT_TIMEOUT, SLOT_WAITING,
};
use crate::config::PoolConfig;
use crate::connection::{ConnectionFactory, RawConnection};
use crate::error::{Error, Result};
use crate::executor::TimeoutExecutor;
use crate::guard::{
    PooledConnection, DIRTY_AUTO_COMMIT, DIRTY_CATALOG, DIRTY_ISOLATION, DIRTY_READ_ONLY,
    DIRTY_SCHEMA,
};
use crate::monitor::{self, PoolSnapshot};
use crate::pooled::{ConnDefaults, PooledConn, CONN_CLOSED, CONN_IDLE, CONN_USING};
use crate::queue::WaitQueue;
use crate::semaphore::{AcquireError, Semaphore};
use crate::shutdown;
use crate::tester::Tester;
use crate::transfer::TransferPolicy;

// ============================================================================
// States
// ============================================================================

const POOL_UNINIT: u32 = 0;
const POOL_NORMAL: u32 = 1;
const POOL_CLEARING: u32 = 2;
const POOL_CLOSED: u32 = 3;

const WORKER_WORKING: u32 = 0;
const WORKER_WAITING: u32 = 1;
const WORKER_EXIT: u32 = 2;

/// Remaining wait below this spins instead of parking; a park/unpark pair
/// costs more than the residual budget.
const SPIN_THRESHOLD: Duration = Duration::from_micros(1);

static POOL_ID_SEQ: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Per-thread borrower cache, keyed by pool id. Dropped with the
    /// thread; the wait queue only ever holds clones that go stale.
    static BORROWERS: RefCell<HashMap<u64, Arc<Borrower>>> = RefCell::new(HashMap::new());
}

/// Driver capabilities and per-connection defaults, captured once at the
/// first successful creation.
struct Probe {
    tester: Tester,
    defaults: ConnDefaults,
    /// Driver-reported network timeout; `None` when unsupported
    network_timeout: Option<Duration>,
}

// ============================================================================
// Pool
// ============================================================================

/// A high-throughput database connection pool.
///
/// Borrowers take the thread-local fast path, then admission, then a
/// scan-or-create pass, and finally park on their own hand-off slot until a
/// returning connection (or a failure) is published to them. See the
/// crate-level docs for the full protocol.
pub struct Pool {
    id: u64,
    name: String,
    config: PoolConfig,
    factory: Box<dyn ConnectionFactory>,
    state: AtomicU32,
    epoch: Instant,

    /// Copy-on-write snapshot of all pooled connections. Readers clone the
    /// `Arc` and iterate a frozen snapshot; writers rebuild under
    /// `create_lock` and swap.
    conns: RwLock<Arc<Vec<Arc<PooledConn>>>>,
    /// Serializes creation/removal; held across the driver `create()` call
    /// but never across a park.
    create_lock: Mutex<()>,
    conn_id_seq: AtomicU64,

    semaphore: Semaphore,
    wait_queue: WaitQueue,
    policy: TransferPolicy,
    probe: OnceCell<Probe>,
    timeout_executor: TimeoutExecutor,

    servant_state: AtomicU32,
    servant_try_count: AtomicU32,
    servant_thread: OnceCell<Thread>,
    idle_scan_state: AtomicU32,
    idle_scan_thread: OnceCell<Thread>,
}

/// Releases the admission permit on every exit path of `get`.
struct PermitGuard<'a>(&'a Semaphore);

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl Pool {
    /// Initialize a pool: validate the configuration, seed `initial_size`
    /// connections, start the background workers, and register the
    /// monitoring and exit hooks.
    pub fn new(config: PoolConfig, factory: impl ConnectionFactory + 'static) -> Result<Arc<Self>> {
        config.validate()?;

        let id = POOL_ID_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = if config.pool_name.is_empty() {
            format!("TurnstilePool-{id}")
        } else {
            config.pool_name.clone()
        };
        info!(pool = %name, "starting connection pool");

        let timeout_executor = TimeoutExecutor::start(&name)?;
        let semaphore = Semaphore::new(config.borrow_semaphore_size, config.fair_mode);
        let policy = TransferPolicy::from_fair_mode(config.fair_mode);

        let pool = Arc::new(Self {
            id,
            name,
            factory: Box::new(factory),
            state: AtomicU32::new(POOL_UNINIT),
            epoch: Instant::now(),
            conns: RwLock::new(Arc::new(Vec::new())),
            create_lock: Mutex::new(()),
            conn_id_seq: AtomicU64::new(1),
            semaphore,
            wait_queue: WaitQueue::new(),
            policy,
            probe: OnceCell::new(),
            timeout_executor,
            servant_state: AtomicU32::new(WORKER_WORKING),
            servant_try_count: AtomicU32::new(0),
            servant_thread: OnceCell::new(),
            idle_scan_state: AtomicU32::new(WORKER_WORKING),
            idle_scan_thread: OnceCell::new(),
            config,
        });

        if let Err(e) = pool.create_init_connections() {
            pool.close();
            return Err(e);
        }
        if let Err(e) = pool.spawn_workers() {
            pool.close();
            return Err(e);
        }

        if pool.config.enable_monitoring {
            monitor::register(&pool);
        }
        if pool.config.register_exit_hook {
            shutdown::register(&pool);
        }

        pool.state.store(POOL_NORMAL, Ordering::Release);
        info!(
            pool = %pool.name,
            mode = if pool.config.fair_mode { "fair" } else { "compete" },
            initial_size = pool.total_size(),
            max_size = pool.config.max_size,
            semaphore_size = pool.config.borrow_semaphore_size,
            max_wait_ms = pool.config.max_wait.as_millis() as u64,
            "connection pool started"
        );
        Ok(pool)
    }

    /// Pool name (configured or auto-generated).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // ========================================================================
    // Acquire path
    // ========================================================================

    /// Borrow a connection.
    ///
    /// Fails with [`Error::PoolClosed`] when the pool is not accepting
    /// borrowers, [`Error::RequestTimeout`] when `max_wait` elapses, and
    /// [`Error::RequestInterrupt`] when the pool cancels the wait.
    pub fn get(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.state.load(Ordering::Acquire) != POOL_NORMAL {
            return Err(Error::PoolClosed);
        }

        let borrower = self.thread_borrower();

        // Thread-local fast path: retry the entry this thread used last.
        if let Some(conn) = borrower.hint() {
            if conn.cas_state(CONN_IDLE, CONN_USING) && self.test_on_borrow(&conn) {
                return Ok(self.bind_guard(conn, &borrower));
            }
            borrower.clear_hint();
        }

        let deadline = Instant::now() + self.config.max_wait;
        match self.semaphore.acquire_timeout(self.config.max_wait) {
            Ok(()) => {}
            Err(AcquireError::Timeout) => {
                return Err(Error::request_timeout(self.config.max_wait.as_millis() as u64))
            }
            Err(AcquireError::Interrupted) => return Err(Error::RequestInterrupt),
        }
        let _permit = PermitGuard(&self.semaphore);

        if let Some(conn) = self.scan_or_create(true)? {
            return Ok(self.bind_guard(conn, &borrower));
        }

        let conn = self.wait_for_handoff(&borrower, deadline)?;
        Ok(self.bind_guard(conn, &borrower))
    }

    /// Enlist on the wait queue and wait for a hand-off.
    fn wait_for_handoff(&self, borrower: &Arc<Borrower>, deadline: Instant) -> Result<Arc<PooledConn>> {
        borrower.slot().store_tag(SLOT_NORMAL);
        self.wait_queue.offer(borrower.clone());
        let mut latched: Option<Error> = None;

        loop {
            let word = borrower.slot().load();

            if TransferSlot::is_payload(word) {
                match borrower.slot().take() {
                    Taken::Payload(handoff) => match handoff.0 {
                        Payload::Conn(conn) => {
                            if self.policy.try_catch(&conn) && self.test_on_borrow(&conn) {
                                return Ok(conn);
                            }
                            // Missed the catch (raced in compete mode, or
                            // the entry died); go back to waiting.
                            borrower.slot().store_tag(SLOT_NORMAL);
                            self.wait_queue.offer(borrower.clone());
                            std::thread::yield_now();
                        }
                        Payload::Fault(e) => return Err(e),
                    },
                    Taken::Tag(_) => {}
                }
                continue;
            }

            if let Some(e) = latched.take() {
                if borrower.slot().cas_tag(word, SLOT_TIMEOUT) {
                    return Err(e);
                }
                // A hand-off won the race against the deadline; honor it on
                // the next pass.
                latched = Some(e);
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                latched = Some(Error::request_timeout(
                    self.config.max_wait.as_millis() as u64,
                ));
                continue;
            }

            if remaining > SPIN_THRESHOLD {
                // A return that raced our enlistment may have found the
                // queue empty and freed its entry; catch it before parking.
                if let Some(conn) = self.rescue_scan(borrower) {
                    return Ok(conn);
                }
                if borrower.slot().cas_tag(SLOT_NORMAL, SLOT_WAITING) {
                    self.nudge_servant();
                    std::thread::park_timeout(remaining);
                    borrower.slot().cas_tag(SLOT_WAITING, SLOT_NORMAL);
                }
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Last look at the snapshot before parking. On a catch the borrower
    /// un-enlists its slot first; anything concurrently published into it
    /// is pushed onward so no hand-off is lost.
    fn rescue_scan(&self, borrower: &Arc<Borrower>) -> Option<Arc<PooledConn>> {
        let snapshot = self.snapshot();
        for conn in snapshot.iter() {
            if conn.cas_state(CONN_IDLE, CONN_USING) {
                if !self.test_on_borrow(conn) {
                    continue;
                }
                match borrower.slot().take() {
                    Taken::Tag(_) => {}
                    Taken::Payload(handoff) => match handoff.0 {
                        Payload::Conn(other) => self.recycle(other),
                        Payload::Fault(e) => {
                            let _ = self.transfer_exception(e);
                        }
                    },
                }
                return Some(conn.clone());
            }
        }
        None
    }

    /// Walk the snapshot catching an idle entry, or grow the pool.
    pub(crate) fn scan_or_create(&self, test: bool) -> Result<Option<Arc<PooledConn>>> {
        let snapshot = self.snapshot();
        for conn in snapshot.iter() {
            if conn.cas_state(CONN_IDLE, CONN_USING) && (!test || self.test_on_borrow(conn)) {
                return Ok(Some(conn.clone()));
            }
        }
        if snapshot.len() < self.config.max_size {
            return self.create_pooled_conn(CONN_USING);
        }
        Ok(None)
    }

    /// Liveness gate on the borrow path. Skips the probe inside the test
    /// interval; a dead entry is removed and the servant poked.
    pub(crate) fn test_on_borrow(&self, conn: &Arc<PooledConn>) -> bool {
        let now = self.now_ms();
        let interval = self.config.test_interval.as_millis() as u64;
        if now.saturating_sub(conn.last_access_ms()) < interval {
            return true;
        }
        let alive = match self.probe.get() {
            Some(probe) => probe
                .tester
                .is_alive(&self.name, conn, self.config.test_timeout, now),
            None => true,
        };
        if alive {
            return true;
        }
        self.remove_pooled_conn(conn, "bad");
        self.wake_servant();
        false
    }

    fn bind_guard(self: &Arc<Self>, conn: Arc<PooledConn>, borrower: &Borrower) -> PooledConnection {
        conn.set_guard_open(true);
        borrower.set_hint(&conn);
        PooledConnection::new(conn, Arc::downgrade(self))
    }

    fn thread_borrower(&self) -> Arc<Borrower> {
        BORROWERS.with(|cache| {
            cache
                .borrow_mut()
                .entry(self.id)
                .or_insert_with(|| Arc::new(Borrower::new()))
                .clone()
        })
    }

    // ========================================================================
    // Return path
    // ========================================================================

    /// Hand a returning entry to the first eligible waiter, or free it.
    pub(crate) fn recycle(&self, conn: Arc<PooledConn>) {
        self.policy.before_transfer(&conn);
        let check = self.policy.check_state_code();
        let mut payload = Some(Box::new(Handoff(Payload::Conn(conn.clone()))));

        while let Some(waiter) = self.wait_queue.try_pop() {
            loop {
                if conn.state() != check {
                    // Another path reclaimed the entry mid-walk; the popped
                    // waiter is still pending, so it goes back.
                    self.wait_queue.offer(waiter);
                    return;
                }
                let word = waiter.slot().load();
                if word != SLOT_NORMAL && word != SLOT_WAITING {
                    // Stale entry of a departed borrower; skip it.
                    break;
                }
                match waiter.slot().publish(word, payload.take().expect("payload still owned")) {
                    Ok(()) => {
                        if word == SLOT_WAITING {
                            waiter.unpark();
                        }
                        return;
                    }
                    Err(returned) => payload = Some(returned),
                }
            }
        }

        self.policy.on_failed_transfer(&conn);
        self.wake_servant();
    }

    /// Publish a failure into the first eligible waiter.
    pub(crate) fn transfer_exception(&self, error: Error) -> bool {
        let mut payload = Some(Box::new(Handoff(Payload::Fault(error))));

        while let Some(waiter) = self.wait_queue.try_pop() {
            loop {
                let word = waiter.slot().load();
                if word != SLOT_NORMAL && word != SLOT_WAITING {
                    break;
                }
                match waiter.slot().publish(word, payload.take().expect("payload still owned")) {
                    Ok(()) => {
                        if word == SLOT_WAITING {
                            waiter.unpark();
                        }
                        return true;
                    }
                    Err(returned) => payload = Some(returned),
                }
            }
        }
        false
    }

    /// Guard return path.
    pub(crate) fn return_from_guard(&self, conn: Arc<PooledConn>, dirty: u8, broken: bool) {
        conn.set_guard_open(false);
        if broken {
            self.abandon_on_return(conn);
            return;
        }
        if conn.state() == CONN_CLOSED {
            // Revoked (hold timeout or forced clear) while borrowed.
            return;
        }
        if dirty != 0 && !self.reset_defaults(&conn, dirty) {
            self.abandon_on_return(conn);
            return;
        }
        if self.state.load(Ordering::Acquire) == POOL_CLOSED {
            // Returned after close finished sweeping; release directly.
            if conn.cas_state(CONN_USING, CONN_CLOSED) {
                self.remove_pooled_conn(&conn, "destroy");
            }
            return;
        }
        conn.touch(self.now_ms());
        self.recycle(conn);
    }

    /// Drop a broken entry reported by the guard and ask the servant to
    /// replace it.
    pub(crate) fn abandon_on_return(&self, conn: Arc<PooledConn>) {
        self.remove_pooled_conn(&conn, "bad");
        self.wake_servant();
    }

    /// Restore defaults a borrower dirtied; false means the entry must be
    /// abandoned.
    fn reset_defaults(&self, conn: &Arc<PooledConn>, dirty: u8) -> bool {
        let defaults = conn.defaults().clone();
        let result = {
            let mut raw = conn.raw();
            restore_defaults(raw.as_mut(), &defaults, dirty)
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(pool = %self.name, conn = conn.id(), error = %e, "failed to restore defaults on return");
                false
            }
        }
    }

    // ========================================================================
    // Creation / removal
    // ========================================================================

    fn create_init_connections(&self) -> Result<()> {
        for _ in 0..self.config.initial_size {
            if self.create_pooled_conn(CONN_IDLE)?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Create one entry carrying `state`, bounded by `max_size`.
    /// Serialized by `create_lock`; the first success runs the driver
    /// capability probe.
    pub(crate) fn create_pooled_conn(&self, state: u32) -> Result<Option<Arc<PooledConn>>> {
        let _serial = self.create_lock.lock();
        if self.snapshot().len() >= self.config.max_size {
            return Ok(None);
        }

        let mut raw = self.factory.create(&self.config.connection).map_err(|e| match e {
            e @ Error::CreateFailed { .. } => e,
            other => Error::create_failed("connection factory failed", other),
        })?;

        let probe = self
            .probe
            .get_or_init(|| self.run_probe(raw.as_mut()));
        self.apply_defaults(raw.as_mut(), probe);

        let conn = Arc::new(PooledConn::new(
            self.conn_id_seq.fetch_add(1, Ordering::Relaxed),
            raw,
            state,
            self.now_ms(),
            probe.defaults.clone(),
        ));

        {
            let mut conns = self.conns.write();
            let mut next = Vec::with_capacity(conns.len() + 1);
            next.extend(conns.iter().cloned());
            next.push(conn.clone());
            *conns = Arc::new(next);
        }
        debug!(pool = %self.name, conn = conn.id(), total = self.total_size(), "connection created");
        Ok(Some(conn))
    }

    /// Unlink an entry and release its raw handle. Safe to call twice; the
    /// raw close runs at most once and the rebuild skips missing entries.
    pub(crate) fn remove_pooled_conn(&self, conn: &Arc<PooledConn>, reason: &str) {
        conn.force_state(CONN_CLOSED);
        conn.set_guard_open(false);
        conn.close_raw(&self.name);

        let _serial = self.create_lock.lock();
        {
            let mut conns = self.conns.write();
            let next: Vec<_> = conns
                .iter()
                .filter(|c| !Arc::ptr_eq(c, conn))
                .cloned()
                .collect();
            *conns = Arc::new(next);
        }
        debug!(pool = %self.name, conn = conn.id(), reason, "connection removed");
    }

    /// Probe the driver once: tester selection, query-timeout support,
    /// network-timeout support, and the per-connection defaults template.
    fn run_probe(&self, raw: &mut dyn RawConnection) -> Probe {
        let isolation = match self.config.default_isolation {
            Some(level) => Some(level),
            None => match raw.isolation() {
                Ok(level) => Some(level),
                Err(e) => {
                    warn!(pool = %self.name, error = %e, "driver default isolation not readable");
                    None
                }
            },
        };

        let network_timeout = match raw.network_timeout() {
            Ok(timeout) if !timeout.is_zero() => Some(timeout),
            Ok(_) => {
                warn!(pool = %self.name, "driver does not support network timeout");
                None
            }
            Err(e) => {
                warn!(pool = %self.name, error = %e, "driver does not support network timeout");
                None
            }
        };

        let tester = match raw.ping(self.config.test_timeout) {
            Ok(true) => Tester::Ping,
            Ok(false) | Err(_) => {
                warn!(pool = %self.name, "driver does not support native liveness check, probing with test sql");
                let supports_query_timeout = match raw.set_query_timeout(self.config.test_timeout) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(pool = %self.name, error = %e, "driver does not support query timeout");
                        false
                    }
                };
                Tester::Query {
                    sql: self.config.test_sql.clone(),
                    default_auto_commit: self.config.default_auto_commit,
                    supports_query_timeout,
                }
            }
        };

        Probe {
            tester,
            defaults: ConnDefaults {
                auto_commit: self.config.default_auto_commit,
                read_only: self.config.default_read_only,
                catalog: self.config.default_catalog.clone(),
                schema: self.config.default_schema.clone(),
                isolation,
            },
            network_timeout,
        }
    }

    /// Clone the defaults template onto a fresh raw connection. Individual
    /// failures degrade with a warning, matching driver quirks instead of
    /// failing creation outright.
    fn apply_defaults(&self, raw: &mut dyn RawConnection, probe: &Probe) {
        let defaults = &probe.defaults;
        if let Err(e) = raw.set_auto_commit(defaults.auto_commit) {
            warn!(pool = %self.name, error = %e, "failed to set default auto-commit");
        }
        if let Err(e) = raw.set_read_only(defaults.read_only) {
            warn!(pool = %self.name, error = %e, "failed to set default read-only");
        }
        if let Some(isolation) = defaults.isolation {
            if let Err(e) = raw.set_isolation(isolation) {
                warn!(pool = %self.name, error = %e, "failed to set default isolation");
            }
        }
        if let Some(catalog) = &defaults.catalog {
            if let Err(e) = raw.set_catalog(catalog) {
                warn!(pool = %self.name, error = %e, "failed to set default catalog");
            }
        }
        if let Some(schema) = &defaults.schema {
            if let Err(e) = raw.set_schema(schema) {
                warn!(pool = %self.name, error = %e, "failed to set default schema");
            }
        }
        if let Some(timeout) = probe.network_timeout {
            if let Some(handle) = self.timeout_executor.handle() {
                if let Err(e) = raw.set_network_timeout(handle, timeout) {
                    warn!(pool = %self.name, error = %e, "failed to set network timeout");
                }
            }
        }
    }

    // ========================================================================
    // Background workers
    // ========================================================================

    fn spawn_workers(self: &Arc<Self>) -> Result<()> {
        let servant = std::thread::Builder::new()
            .name(format!("{}-servant", self.name))
            .spawn({
                let pool = Arc::downgrade(self);
                move || servant_loop(pool)
            })
            .map_err(|e| Error::internal(format!("failed to spawn servant: {e}")))?;
        let _ = self.servant_thread.set(servant.thread().clone());

        let idle_scan = std::thread::Builder::new()
            .name(format!("{}-idle-scan", self.name))
            .spawn({
                let pool = Arc::downgrade(self);
                move || idle_scan_loop(pool)
            })
            .map_err(|e| Error::internal(format!("failed to spawn idle scan: {e}")))?;
        let _ = self.idle_scan_thread.set(idle_scan.thread().clone());
        Ok(())
    }

    /// Poke the servant: one more pass, bounded by `max_size` pending
    /// passes to cap wake amplification.
    pub(crate) fn wake_servant(&self) {
        let cap = self.config.max_size as u32;
        let mut count = self.servant_try_count.load(Ordering::Acquire);
        loop {
            if count >= cap {
                break;
            }
            match self.servant_try_count.compare_exchange(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => count = current,
            }
        }
        self.nudge_servant();
    }

    /// Wake the servant without adding demand.
    fn nudge_servant(&self) {
        if self.servant_try_count.load(Ordering::Acquire) > 0
            && self
                .servant_state
                .compare_exchange(
                    WORKER_WAITING,
                    WORKER_WORKING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            if let Some(thread) = self.servant_thread.get() {
                thread.unpark();
            }
        }
    }

    fn take_servant_pass(&self) -> bool {
        let mut count = self.servant_try_count.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return false;
            }
            match self.servant_try_count.compare_exchange(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => count = current,
            }
        }
    }

    /// One idle-scan tick: evict idle-timeout, lifetime-expired, hung, and
    /// closed entries.
    fn scan_idle(&self) {
        let now = self.now_ms();
        let idle_ms = self.config.idle_timeout.as_millis() as u64;
        let hold_ms = self.config.hold_timeout.as_millis() as u64;
        let max_lifetime = self.config.max_lifetime;

        for conn in self.snapshot().iter() {
            match conn.state() {
                CONN_IDLE => {
                    if self.exist_borrower() {
                        continue;
                    }
                    let idle_expired = now.saturating_sub(conn.last_access_ms()) >= idle_ms;
                    let lifetime_expired = !max_lifetime.is_zero() && conn.age() >= max_lifetime;
                    if (idle_expired || lifetime_expired)
                        && conn.cas_state(CONN_IDLE, CONN_CLOSED)
                    {
                        let reason = if idle_expired { "idle" } else { "lifetime" };
                        self.remove_pooled_conn(conn, reason);
                        self.wake_servant();
                    }
                }
                CONN_USING => {
                    if now.saturating_sub(conn.last_access_ms()) >= hold_ms
                        && conn.cas_state(CONN_USING, CONN_CLOSED)
                    {
                        if conn.guard_open() {
                            warn!(pool = %self.name, conn = conn.id(), "revoking connection held past hold timeout");
                        }
                        self.remove_pooled_conn(conn, "hold_timeout");
                        self.wake_servant();
                    }
                }
                CONN_CLOSED => {
                    self.remove_pooled_conn(conn, "closed");
                    self.wake_servant();
                }
                _ => {}
            }
        }

        debug!(
            pool = %self.name,
            total = self.total_size(),
            idle = self.idle_size(),
            using = self.using_size(),
            semaphore_waiting = self.semaphore_waiting_size(),
            transfer_waiting = self.transfer_waiting_size(),
            "idle scan"
        );
    }

    fn exist_borrower(&self) -> bool {
        self.semaphore.acquired() > 0 || self.semaphore.queued() > 0
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Remove every pooled connection, then return the pool to `Normal`.
    /// With `force`, borrowed connections are revoked immediately;
    /// otherwise the sweep waits for returns or the hold timeout.
    pub fn clear(&self, force: bool) {
        if self
            .state
            .compare_exchange(
                POOL_NORMAL,
                POOL_CLEARING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(pool = %self.name, force, "clearing pool");
            self.remove_all(force, "clear");
            self.state.store(POOL_NORMAL, Ordering::Release);
            info!(pool = %self.name, "pool cleared");
        }
    }

    /// Close the pool permanently. Idempotent; pending waiters observe
    /// [`Error::PoolClosed`], workers exit, the timeout executor stops and
    /// the monitoring/exit hooks are deregistered.
    pub fn close(&self) {
        loop {
            match self.state.load(Ordering::Acquire) {
                POOL_CLOSED => return,
                POOL_CLEARING => {
                    // Let the in-flight clear finish, then take the state.
                    std::thread::sleep(self.config.delay_for_next_clear);
                }
                current => {
                    if self
                        .state
                        .compare_exchange(
                            current,
                            POOL_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    info!(pool = %self.name, "closing pool");

                    self.servant_state.store(WORKER_EXIT, Ordering::Release);
                    if let Some(thread) = self.servant_thread.get() {
                        thread.unpark();
                    }
                    self.idle_scan_state.store(WORKER_EXIT, Ordering::Release);
                    if let Some(thread) = self.idle_scan_thread.get() {
                        thread.unpark();
                    }

                    self.remove_all(self.config.force_close_using_on_clear, "destroy");
                    self.timeout_executor.shutdown();

                    if self.config.enable_monitoring {
                        monitor::unregister(&self.name);
                    }
                    if self.config.register_exit_hook {
                        shutdown::unregister(&self.name);
                    }
                    info!(pool = %self.name, "pool closed");
                    return;
                }
            }
        }
    }

    /// Whether `close` has completed a state transition to `Closed`.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == POOL_CLOSED
    }

    fn remove_all(&self, force: bool, reason: &str) {
        // Unblock admission first, then drain the hand-off queue. Keep
        // flushing while any borrow attempt still holds a permit: it is
        // either about to enlist or about to release.
        self.semaphore.interrupt_waiters();
        while self.semaphore.acquired() > 0 || !self.wait_queue.is_empty() {
            if !self.transfer_exception(Error::PoolClosed) {
                self.semaphore.interrupt_waiters();
                std::thread::yield_now();
            }
        }

        let hold_ms = self.config.hold_timeout.as_millis() as u64;
        loop {
            let snapshot = self.snapshot();
            if snapshot.is_empty() {
                break;
            }
            for conn in snapshot.iter() {
                match conn.state() {
                    CONN_IDLE => {
                        if conn.cas_state(CONN_IDLE, CONN_CLOSED) {
                            self.remove_pooled_conn(conn, reason);
                        }
                    }
                    CONN_CLOSED => self.remove_pooled_conn(conn, reason),
                    CONN_USING => {
                        let hold_elapsed =
                            self.now_ms().saturating_sub(conn.last_access_ms()) >= hold_ms;
                        if (force || hold_elapsed || !conn.guard_open())
                            && conn.cas_state(CONN_USING, CONN_CLOSED)
                        {
                            self.remove_pooled_conn(conn, reason);
                        }
                    }
                    _ => {}
                }
            }
            if !self.snapshot().is_empty() {
                // Let in-flight returns drain before the next pass.
                std::thread::sleep(self.config.delay_for_next_clear);
            }
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    #[inline]
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn snapshot(&self) -> Arc<Vec<Arc<PooledConn>>> {
        self.conns.read().clone()
    }

    /// Total pooled connections.
    pub fn total_size(&self) -> usize {
        self.snapshot().len()
    }

    /// Connections currently idle.
    pub fn idle_size(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|c| c.state() == CONN_IDLE)
            .count()
    }

    /// Connections currently issued.
    pub fn using_size(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|c| c.state() == CONN_USING)
            .count()
    }

    /// Admission permits currently held by in-flight borrow attempts.
    pub fn semaphore_acquired_size(&self) -> usize {
        self.semaphore.acquired()
    }

    /// Callers parked on the admission semaphore.
    pub fn semaphore_waiting_size(&self) -> usize {
        self.semaphore.queued()
    }

    /// Callers enlisted for a hand-off (approximate).
    pub fn transfer_waiting_size(&self) -> usize {
        self.wait_queue.len()
    }

    /// Human-readable pool state.
    pub fn state_name(&self) -> &'static str {
        match self.state.load(Ordering::Acquire) {
            POOL_UNINIT => "uninit",
            POOL_NORMAL => "normal",
            POOL_CLEARING => "clearing",
            _ => "closed",
        }
    }

    /// Point-in-time monitoring snapshot.
    pub fn snapshot_stats(&self) -> PoolSnapshot {
        PoolSnapshot {
            name: self.name.clone(),
            state: self.state_name().to_string(),
            total: self.total_size(),
            idle: self.idle_size(),
            using: self.using_size(),
            semaphore_size: self.semaphore.size(),
            semaphore_acquired: self.semaphore_acquired_size(),
            semaphore_waiting: self.semaphore_waiting_size(),
            transfer_waiting: self.transfer_waiting_size(),
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("state", &self.state_name())
            .field("total", &self.total_size())
            .field("idle", &self.idle_size())
            .finish()
    }
}

// ============================================================================
// Worker loops
// ============================================================================

/// Servant: asynchronously searches/creates on demand and hands off to
/// waiters. Parks on its own state word when demand drains.
fn servant_loop(pool: Weak<Pool>) {
    loop {
        let should_park = {
            let Some(pool) = pool.upgrade() else { return };
            loop {
                if pool.servant_state.load(Ordering::Acquire) != WORKER_WORKING {
                    break;
                }
                if !pool.take_servant_pass() {
                    break;
                }
                if pool.wait_queue.is_empty() {
                    continue;
                }
                match pool.scan_or_create(false) {
                    Ok(Some(conn)) => pool.recycle(conn),
                    Ok(None) => {}
                    Err(e) => {
                        // Re-publish the creation failure into one waiter.
                        let _ = pool.transfer_exception(e);
                    }
                }
            }
            match pool.servant_state.load(Ordering::Acquire) {
                WORKER_EXIT => return,
                // Spurious wake; the state is already parked-shaped.
                WORKER_WAITING => true,
                // Park only after winning the transition; a poke that
                // lands in between flips the state back and the park falls
                // through on its unpark token.
                _ => {
                    pool.servant_try_count.load(Ordering::Acquire) == 0
                        && pool
                            .servant_state
                            .compare_exchange(
                                WORKER_WORKING,
                                WORKER_WAITING,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                }
            }
        };
        if should_park {
            std::thread::park();
        }
    }
}

fn restore_defaults(
    raw: &mut dyn RawConnection,
    defaults: &ConnDefaults,
    dirty: u8,
) -> Result<()> {
    if dirty & DIRTY_AUTO_COMMIT != 0 {
        // Open work from a disabled auto-commit must not leak into the
        // next borrower.
        raw.rollback()?;
        raw.set_auto_commit(defaults.auto_commit)?;
    }
    if dirty & DIRTY_READ_ONLY != 0 {
        raw.set_read_only(defaults.read_only)?;
    }
    if dirty & DIRTY_CATALOG != 0 {
        if let Some(catalog) = &defaults.catalog {
            raw.set_catalog(catalog)?;
        }
    }
    if dirty & DIRTY_SCHEMA != 0 {
        if let Some(schema) = &defaults.schema {
            raw.set_schema(schema)?;
        }
    }
    if dirty & DIRTY_ISOLATION != 0 {
        if let Some(isolation) = defaults.isolation {
            raw.set_isolation(isolation)?;
        }
    }
    Ok(())
}

/// Idle scan: periodically prunes the snapshot. Worker panics are caught
/// and logged; the ticker continues.
fn idle_scan_loop(pool: Weak<Pool>) {
    loop {
        let interval = {
            let Some(pool) = pool.upgrade() else { return };
            if pool.idle_scan_state.load(Ordering::Acquire) == WORKER_EXIT {
                return;
            }
            pool.config.idle_check_interval
        };

        std::thread::park_timeout(interval);

        let Some(pool) = pool.upgrade() else { return };
        if pool.idle_scan_state.load(Ordering::Acquire) == WORKER_EXIT {
            return;
        }
        if pool.state.load(Ordering::Acquire) == POOL_NORMAL {
            if catch_unwind(AssertUnwindSafe(|| pool.scan_idle())).is_err() {
                error!(pool = %pool.name, "idle scan panicked");
            }
        }
    }
}
