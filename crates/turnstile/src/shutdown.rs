//! Process exit hook
//!
//! Pools that opt in are enrolled in a process-global registry backed by a
//! signal handler installed once per process. On termination the handler
//! closes every live enrolled pool so raw connections are released before
//! the process exits; a pool that closes normally deregisters itself
//! first.

use std::collections::HashMap;
use std::sync::{Arc, Once, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::pool::Pool;

static HOOKED_POOLS: Lazy<Mutex<HashMap<String, Weak<Pool>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static INSTALL: Once = Once::new();

pub(crate) fn register(pool: &Arc<Pool>) {
    HOOKED_POOLS
        .lock()
        .insert(pool.name().to_string(), Arc::downgrade(pool));

    INSTALL.call_once(|| {
        // The host application may own the signal handler already; in that
        // case the exit hook degrades to a no-op with a warning.
        let result = ctrlc::set_handler(|| {
            close_all();
            std::process::exit(130);
        });
        if let Err(e) = result {
            warn!(error = %e, "exit hook not installed; close pools explicitly");
        }
    });
}

pub(crate) fn unregister(name: &str) {
    HOOKED_POOLS.lock().remove(name);
}

fn close_all() {
    let pools: Vec<Arc<Pool>> = HOOKED_POOLS
        .lock()
        .drain()
        .filter_map(|(_, weak)| weak.upgrade())
        .collect();
    for pool in pools {
        info!(pool = %pool.name(), "exit hook closing pool");
        pool.close();
    }
}
