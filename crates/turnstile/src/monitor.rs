//! Pool monitoring registry
//!
//! Process-global registry of live pools, keyed by pool name. Management
//! surfaces read serializable [`PoolSnapshot`]s and can trigger a
//! [`clear`](crate::Pool::clear) by name. Pools register at init when
//! monitoring is enabled and unregister on close; entries whose pool has
//! been dropped are pruned lazily.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;

use crate::pool::Pool;

static REGISTRY: Lazy<Mutex<HashMap<String, Weak<Pool>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Point-in-time view of one pool's gauges.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    /// Pool name
    pub name: String,
    /// Pool state (`uninit`, `normal`, `clearing`, `closed`)
    pub state: String,
    /// Total pooled connections
    pub total: usize,
    /// Idle connections
    pub idle: usize,
    /// Issued connections
    pub using: usize,
    /// Admission semaphore size
    pub semaphore_size: usize,
    /// Permits held by in-flight borrow attempts
    pub semaphore_acquired: usize,
    /// Callers parked on the admission semaphore
    pub semaphore_waiting: usize,
    /// Callers enlisted for a hand-off
    pub transfer_waiting: usize,
}

pub(crate) fn register(pool: &Arc<Pool>) {
    REGISTRY
        .lock()
        .insert(pool.name().to_string(), Arc::downgrade(pool));
}

pub(crate) fn unregister(name: &str) {
    REGISTRY.lock().remove(name);
}

/// Snapshot one registered pool by name.
pub fn snapshot(name: &str) -> Option<PoolSnapshot> {
    let pool = REGISTRY.lock().get(name)?.upgrade()?;
    Some(pool.snapshot_stats())
}

/// Snapshot every live registered pool.
pub fn snapshots() -> Vec<PoolSnapshot> {
    let mut registry = REGISTRY.lock();
    registry.retain(|_, pool| pool.strong_count() > 0);
    registry
        .values()
        .filter_map(|weak| weak.upgrade())
        .map(|pool| pool.snapshot_stats())
        .collect()
}

/// Clear a registered pool by name; returns false when the pool is not
/// registered or already dropped.
pub fn clear(name: &str, force: bool) -> bool {
    let pool = match REGISTRY.lock().get(name).and_then(Weak::upgrade) {
        Some(pool) => pool,
        None => return false,
    };
    pool.clear(force);
    true
}
