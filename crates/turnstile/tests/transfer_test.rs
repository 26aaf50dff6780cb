//! Hand-off tests: direct transfer to waiters, fair-mode ordering, and
//! failure re-publication through the servant.

mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{test_config, MockFactory};
use turnstile::{ErrorKind, Pool};

/// A returning connection is handed directly to the parked waiter, which
/// resumes with the same underlying entry well inside its deadline.
#[test]
fn test_return_hands_off_to_waiter() {
    let config = test_config(1, 1).with_max_wait(Duration::from_millis(500));
    let pool = Pool::new(config, MockFactory::new()).unwrap();

    let conn = pool.get().unwrap();
    let held_id = conn.entry_id();

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let conn = pool.get().unwrap();
            (conn.entry_id(), started.elapsed())
        })
    };

    // Let the waiter enlist and park, then return the connection.
    thread::sleep(Duration::from_millis(50));
    drop(conn);

    let (id, waited) = waiter.join().unwrap();
    assert_eq!(id, held_id, "waiter must receive the returned entry");
    assert!(
        waited < Duration::from_millis(500),
        "hand-off took {waited:?}, longer than the deadline"
    );

    pool.close();
}

/// Fair mode: three staggered waiters on a single entry are served in
/// arrival order.
#[test]
fn test_fair_mode_serves_longest_waiting_first() {
    let config = test_config(1, 1)
        .with_fair_mode(true)
        .with_borrow_semaphore_size(3)
        .with_max_wait(Duration::from_secs(5));
    let pool = Pool::new(config, MockFactory::new()).unwrap();

    let held = pool.get().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = vec![];
    for i in 0..3u32 {
        let pool = pool.clone();
        let order = order.clone();
        handles.push(thread::spawn(move || {
            // Stagger enlistment so arrival order is deterministic.
            thread::sleep(Duration::from_millis(40 * (u64::from(i) + 1)));
            let conn = pool.get().unwrap();
            order.lock().unwrap().push(i);
            // Hold briefly so the next hand-off is a real park/unpark.
            thread::sleep(Duration::from_millis(20));
            drop(conn);
        }));
    }

    // All three must be parked before the first release.
    thread::sleep(Duration::from_millis(250));
    drop(held);

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

    pool.close();
}

/// Compete mode under churn: many borrowers on one entry; every borrow is
/// served by hand-off or rescan, nobody starves past the deadline.
#[test]
fn test_compete_mode_serves_all_waiters() {
    let config = test_config(1, 1).with_max_wait(Duration::from_secs(5));
    let pool = Pool::new(config, MockFactory::new()).unwrap();

    let mut handles = vec![];
    for _ in 0..6 {
        let pool = pool.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                let conn = pool.get().unwrap();
                drop(conn);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.total_size(), 1, "single entry must satisfy everyone");
    pool.close();
}

/// A creation failure while the servant works for a waiter is re-published
/// into that waiter, carrying the underlying cause; other borrowers are
/// unaffected.
#[test]
fn test_servant_failure_reaches_waiter() {
    let factory = MockFactory::new();
    let state = factory.state.clone();
    let config = test_config(2, 0).with_max_wait(Duration::from_secs(3));
    let pool = Pool::new(config, factory).unwrap();

    // Fill the pool and make further creations fail.
    let broken = pool.get().unwrap();
    let healthy = pool.get().unwrap();
    state.fail_creates(true);

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.get())
    };
    // Let the waiter park.
    thread::sleep(Duration::from_millis(100));

    // Break the first connection so its return abandons the entry and
    // pokes the servant, which then fails to create a replacement.
    state.break_connections(true);
    let mut broken = broken;
    let _ = broken.execute("SELECT 1").unwrap_err();
    state.break_connections(false);
    drop(broken);

    let err = waiter.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CreateFailed);
    assert!(
        std::error::Error::source(&err).is_some(),
        "creation failure must carry its cause"
    );

    // The surviving borrower is unaffected.
    let mut healthy = healthy;
    healthy.execute("SELECT 1").unwrap();
    drop(healthy);

    state.fail_creates(false);
    pool.close();
}

/// The thread-local fast path must never cross pools: two pools borrowed
/// from the same thread keep distinct entries.
#[test]
fn test_fast_path_is_per_pool() {
    let pool_a = Pool::new(test_config(2, 1), MockFactory::new()).unwrap();
    let pool_b = Pool::new(test_config(2, 1), MockFactory::new()).unwrap();

    for _ in 0..5 {
        let conn_a = pool_a.get().unwrap();
        let conn_b = pool_b.get().unwrap();
        drop(conn_a);
        drop(conn_b);
    }
    assert_eq!(pool_a.total_size(), 1);
    assert_eq!(pool_b.total_size(), 1);

    pool_a.close();
    pool_b.close();
}
