//! Borrow-path tests: fast path, scan-or-create, boundaries, and the
//! single-issue invariant under concurrent load.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{test_config, MockFactory};
use turnstile::{ErrorKind, Pool};

// ==================== Basic borrow/return ====================

#[test]
fn test_initial_size_zero_creates_on_demand() {
    let factory = MockFactory::new();
    let state = factory.state.clone();
    let pool = Pool::new(test_config(4, 0), factory).unwrap();

    assert_eq!(pool.total_size(), 0);
    let conn = pool.get().unwrap();
    assert_eq!(state.created(), 1);
    assert_eq!(pool.using_size(), 1);
    drop(conn);
    assert_eq!(pool.idle_size(), 1);

    pool.close();
}

#[test]
fn test_initial_seeding() {
    let factory = MockFactory::new();
    let state = factory.state.clone();
    let pool = Pool::new(test_config(4, 3), factory).unwrap();

    assert_eq!(pool.total_size(), 3);
    assert_eq!(pool.idle_size(), 3);
    assert_eq!(state.created(), 3);

    pool.close();
    assert_eq!(state.closed(), 3);
}

#[test]
fn test_execute_roundtrip() {
    let pool = Pool::new(test_config(2, 0), MockFactory::new()).unwrap();

    let mut conn = pool.get().unwrap();
    assert_eq!(conn.execute("SELECT 1").unwrap(), 1);
    assert!(!conn.is_broken());
    conn.close();

    pool.close();
}

// ==================== Thread-local fast path ====================

#[test]
fn test_fast_path_returns_same_entry() {
    let factory = MockFactory::new();
    let state = factory.state.clone();
    let pool = Pool::new(test_config(4, 1), factory).unwrap();

    let mut seen = HashSet::new();
    for _ in 0..20 {
        let conn = pool.get().unwrap();
        seen.insert(conn.entry_id());
        drop(conn);
    }

    assert_eq!(seen.len(), 1, "fast path must reuse the same entry");
    assert_eq!(state.created(), 1, "no extra connections created");

    pool.close();
}

// ==================== Boundaries ====================

#[test]
fn test_exhausted_pool_times_out() {
    let config = test_config(2, 0).with_max_wait(Duration::from_millis(50));
    let pool = Pool::new(config, MockFactory::new()).unwrap();

    let _a = pool.get().unwrap();
    let _b = pool.get().unwrap();
    assert_eq!(pool.using_size(), 2);

    // Pool is at max and nothing is idle: the third borrower parks and
    // times out.
    let err = pool.get().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    pool.close();
}

#[test]
fn test_zero_max_wait_never_parks() {
    let config = test_config(1, 0).with_max_wait(Duration::ZERO);
    let pool = Pool::new(config, MockFactory::new()).unwrap();

    // Immediate success while capacity remains.
    let held = pool.get().unwrap();

    // Immediate failure once exhausted; no parking.
    let started = Instant::now();
    let err = pool.get().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(
        started.elapsed() < Duration::from_millis(50),
        "zero max_wait must not park"
    );

    drop(held);
    pool.close();
}

#[test]
fn test_pool_never_exceeds_max_size() {
    let factory = MockFactory::new();
    let pool = Pool::new(test_config(3, 0), factory).unwrap();

    let mut guards = Vec::new();
    for _ in 0..3 {
        guards.push(pool.get().unwrap());
    }
    assert_eq!(pool.total_size(), 3);

    let err = pool
        .get()
        .expect_err("borrow beyond max_size must not create");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(pool.total_size(), 3);

    drop(guards);
    pool.close();
}

// ==================== Invariants under load ====================

/// Every `Idle -> Using` transition is observed by exactly one borrower:
/// a checked-out entry id can never be checked out twice concurrently.
#[test]
fn test_no_double_issue_under_load() {
    let config = test_config(4, 2).with_max_wait(Duration::from_secs(5));
    let pool = Pool::new(config, MockFactory::new()).unwrap();
    let checked_out: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut handles = vec![];
    for _ in 0..8 {
        let pool = pool.clone();
        let checked_out = checked_out.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..200 {
                let conn = pool.get().unwrap();
                let id = conn.entry_id();
                assert!(
                    checked_out.lock().unwrap().insert(id),
                    "entry {id} issued twice"
                );
                std::hint::spin_loop();
                checked_out.lock().unwrap().remove(&id);
                drop(conn);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(pool.total_size() <= 4);
    assert_eq!(pool.using_size(), 0);
    pool.close();
}

/// After quiescence every admission permit is back.
#[test]
fn test_permits_released_on_every_path() {
    let config = test_config(2, 0)
        .with_borrow_semaphore_size(2)
        .with_max_wait(Duration::from_millis(40));
    let pool = Pool::new(config, MockFactory::new()).unwrap();

    // Success path.
    let conn = pool.get().unwrap();
    drop(conn);

    // Timeout path.
    let a = pool.get().unwrap();
    let b = pool.get().unwrap();
    let _ = pool.get().unwrap_err();
    drop(a);
    drop(b);

    assert_eq!(pool.semaphore_acquired_size(), 0);
    assert_eq!(pool.semaphore_waiting_size(), 0);
    pool.close();
}

// ==================== Liveness testing ====================

#[test]
fn test_dead_connection_replaced_on_borrow() {
    let factory = MockFactory::new();
    let state = factory.state.clone();
    // A zero test interval probes on every borrow.
    let config = test_config(2, 1).with_test_interval(Duration::ZERO);
    let pool = Pool::new(config, factory).unwrap();

    // Kill the seeded connection behind the pool's back; the next borrow
    // probe detects it, removes the entry, and the scan creates a
    // replacement.
    state.kill_existing();
    let conn = pool.get().unwrap();
    assert_eq!(state.created(), 2, "dead entry must be replaced");
    assert_eq!(pool.total_size(), 1);

    drop(conn);
    pool.close();
}

#[test]
fn test_query_tester_fallback_without_ping() {
    // Driver without a native liveness check falls back to the probe
    // statement; borrowing still works.
    let config = test_config(2, 1).with_test_interval(Duration::ZERO);
    let pool = Pool::new(config, MockFactory::without_ping()).unwrap();

    let mut conn = pool.get().unwrap();
    assert_eq!(conn.execute("SELECT 1").unwrap(), 1);
    drop(conn);

    pool.close();
}

#[test]
fn test_broken_guard_call_abandons_entry() {
    let factory = MockFactory::new();
    let state = factory.state.clone();
    let pool = Pool::new(test_config(2, 1), factory).unwrap();

    let mut conn = pool.get().unwrap();
    state.break_connections(true);
    let err = conn.execute("SELECT 1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(conn.is_broken());
    drop(conn);

    // The broken entry was removed rather than recycled.
    assert_eq!(pool.total_size(), 0);
    assert_eq!(state.closed(), 1);

    state.break_connections(false);
    pool.close();
}

// ==================== Config surface ====================

#[test]
fn test_invalid_config_rejected() {
    let config = test_config(0, 0);
    let err = Pool::new(config, MockFactory::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_seeding_failure_fails_init() {
    let factory = MockFactory::new();
    factory.state.fail_creates(true);
    let err = Pool::new(test_config(2, 1), factory).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CreateFailed);
}
