//! Admission semaphore
//!
//! Bounded permit set capping concurrent borrow attempts, decoupled from
//! the pool size. Two disciplines, matching the transfer policy:
//!
//! - **fair**: released permits are handed directly to the longest-waiting
//!   acquirer (FIFO admission);
//! - **unfair**: released permits are banked and waiters are woken to
//!   compete; new arrivals may barge in front of parked waiters.
//!
//! Waiters park on their own thread with an absolute deadline; the pool
//! interrupts all of them during clear/close.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::Thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const SEM_WAITING: u32 = 0;
const SEM_GRANTED: u32 = 1;
const SEM_INTERRUPTED: u32 = 2;

/// Why a timed acquire failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquireError {
    Timeout,
    Interrupted,
}

struct SemWaiter {
    thread: Thread,
    /// Transitions happen under the semaphore lock; reads may be lock-free
    state: AtomicU32,
}

struct Inner {
    permits: usize,
    waiters: VecDeque<Arc<SemWaiter>>,
}

pub(crate) struct Semaphore {
    size: usize,
    fair: bool,
    inner: Mutex<Inner>,
}

impl Semaphore {
    pub(crate) fn new(size: usize, fair: bool) -> Self {
        Self {
            size,
            fair,
            inner: Mutex::new(Inner {
                permits: size,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Take a permit without waiting.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.permits > 0 && (!self.fair || inner.waiters.is_empty()) {
            inner.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Take a permit, waiting up to `timeout`. A zero timeout never parks:
    /// it either succeeds immediately or reports `Timeout`.
    pub(crate) fn acquire_timeout(&self, timeout: Duration) -> Result<(), AcquireError> {
        let deadline = Instant::now() + timeout;
        let waiter = {
            let mut inner = self.inner.lock();
            if inner.permits > 0 && (!self.fair || inner.waiters.is_empty()) {
                inner.permits -= 1;
                return Ok(());
            }
            if timeout.is_zero() {
                return Err(AcquireError::Timeout);
            }
            let waiter = Arc::new(SemWaiter {
                thread: std::thread::current(),
                state: AtomicU32::new(SEM_WAITING),
            });
            inner.waiters.push_back(waiter.clone());
            waiter
        };

        loop {
            match waiter.state.load(Ordering::Acquire) {
                SEM_GRANTED => return Ok(()),
                SEM_INTERRUPTED => return Err(AcquireError::Interrupted),
                _ => {}
            }

            // Unfair mode banks permits on release; woken waiters compete
            // with bargers for them.
            if !self.fair {
                let mut inner = self.inner.lock();
                if waiter.state.load(Ordering::Acquire) == SEM_INTERRUPTED {
                    return Err(AcquireError::Interrupted);
                }
                if inner.permits > 0 {
                    inner.permits -= 1;
                    Self::remove_waiter(&mut inner, &waiter);
                    return Ok(());
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let mut inner = self.inner.lock();
                // State transitions happen under the lock, so this check is
                // final: a grant that raced the deadline is kept.
                return match waiter.state.load(Ordering::Acquire) {
                    SEM_GRANTED => Ok(()),
                    SEM_INTERRUPTED => Err(AcquireError::Interrupted),
                    _ => {
                        Self::remove_waiter(&mut inner, &waiter);
                        Err(AcquireError::Timeout)
                    }
                };
            }
            std::thread::park_timeout(remaining);
        }
    }

    /// Return one permit.
    pub(crate) fn release(&self) {
        let mut inner = self.inner.lock();
        if self.fair {
            // Direct hand-off to the longest-waiting live acquirer.
            while let Some(waiter) = inner.waiters.pop_front() {
                if waiter.state.load(Ordering::Acquire) == SEM_WAITING {
                    waiter.state.store(SEM_GRANTED, Ordering::Release);
                    waiter.thread.unpark();
                    return;
                }
            }
            inner.permits = (inner.permits + 1).min(self.size);
        } else {
            inner.permits = (inner.permits + 1).min(self.size);
            if let Some(waiter) = inner
                .waiters
                .iter()
                .find(|w| w.state.load(Ordering::Acquire) == SEM_WAITING)
            {
                waiter.thread.unpark();
            }
        }
    }

    /// Wake every queued acquirer with an interrupt.
    pub(crate) fn interrupt_waiters(&self) {
        let mut inner = self.inner.lock();
        for waiter in inner.waiters.drain(..) {
            if waiter.state.load(Ordering::Acquire) == SEM_WAITING {
                waiter.state.store(SEM_INTERRUPTED, Ordering::Release);
                waiter.thread.unpark();
            }
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.inner.lock().permits
    }

    /// Permits currently held by in-flight borrow attempts.
    pub(crate) fn acquired(&self) -> usize {
        self.size - self.available()
    }

    /// Acquirers parked on the semaphore.
    pub(crate) fn queued(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    fn remove_waiter(inner: &mut Inner, waiter: &Arc<SemWaiter>) {
        inner.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
    }
}
