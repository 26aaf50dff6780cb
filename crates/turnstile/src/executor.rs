//! Network-timeout executor
//!
//! A single worker thread that runs driver-side abort jobs when a network
//! timeout fires. Drivers receive a cloneable [`TimeoutExecutorHandle`]
//! through [`RawConnection::set_network_timeout`] and submit the abort as a
//! closure; the pool owns the worker and shuts it down on close.
//!
//! [`RawConnection::set_network_timeout`]: crate::connection::RawConnection::set_network_timeout

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable submission handle passed to drivers
#[derive(Clone)]
pub struct TimeoutExecutorHandle {
    tx: Sender<Job>,
}

impl TimeoutExecutorHandle {
    /// Submit a job; returns false when the executor has shut down
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(job)).is_ok()
    }
}

impl std::fmt::Debug for TimeoutExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutExecutorHandle").finish()
    }
}

/// Single-thread executor backing driver network-timeout cancellations
pub(crate) struct TimeoutExecutor {
    tx: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutExecutor {
    pub(crate) fn start(pool_name: &str) -> crate::error::Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let name = format!("{pool_name}-net-timeout");
        let worker = std::thread::Builder::new()
            .name(name)
            .spawn(move || run_jobs(rx))
            .map_err(|e| {
                crate::error::Error::internal(format!(
                    "failed to spawn network-timeout executor: {e}"
                ))
            })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Handle for drivers; `None` once shut down
    pub(crate) fn handle(&self) -> Option<TimeoutExecutorHandle> {
        self.tx
            .lock()
            .as_ref()
            .map(|tx| TimeoutExecutorHandle { tx: tx.clone() })
    }

    /// Drop the channel so the worker drains and exits, then join it.
    pub(crate) fn shutdown(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn run_jobs(rx: Receiver<Job>) {
    for job in rx {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("network-timeout job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_executor_runs_jobs() {
        let executor = TimeoutExecutor::start("test").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = executor.handle().unwrap();
        for _ in 0..4 {
            let c = counter.clone();
            assert!(handle.execute(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }

        executor.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_executor_survives_panicking_job() {
        let executor = TimeoutExecutor::start("test").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = executor.handle().unwrap();
        handle.execute(|| panic!("driver abort blew up"));
        let c = counter.clone();
        handle.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        executor.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_execute_after_shutdown_is_rejected() {
        let executor = TimeoutExecutor::start("test").unwrap();
        let handle = executor.handle().unwrap();
        executor.shutdown();

        assert!(!handle.execute(|| {}));
        assert!(executor.handle().is_none());

        // Shutdown is idempotent.
        executor.shutdown();
        std::thread::sleep(Duration::from_millis(1));
    }
}
