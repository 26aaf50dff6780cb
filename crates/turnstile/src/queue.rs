//! Wait queue of pending borrowers
//!
//! MPMC FIFO built on an unbounded crossbeam channel. Publishers (returning
//! borrowers, the servant, the close path) pop candidates and publish into
//! their slots; entries whose slot is no longer publishable are stale and
//! simply dropped. A borrower that misses a hand-off re-enlists itself at
//! the tail. Ordering is FIFO per pop, which yields longest-waiting-first
//! hand-off in fair mode; compete mode never guaranteed ordering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::borrower::Borrower;

pub(crate) struct WaitQueue {
    tx: Sender<Arc<Borrower>>,
    rx: Receiver<Arc<Borrower>>,
    /// Approximate population, including not-yet-drained stale entries
    len: AtomicUsize,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            len: AtomicUsize::new(0),
        }
    }

    /// Enlist a borrower at the tail.
    pub(crate) fn offer(&self, borrower: Arc<Borrower>) {
        // Send on an unbounded channel only fails when all receivers are
        // gone, and we hold one for the pool's lifetime.
        if self.tx.send(borrower).is_ok() {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pop the longest-enqueued entry, stale or not.
    pub(crate) fn try_pop(&self) -> Option<Arc<Borrower>> {
        match self.rx.try_recv() {
            Ok(b) => {
                self.len.fetch_sub(1, Ordering::Relaxed);
                Some(b)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Approximate number of enqueued entries.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = WaitQueue::new();
        let a = Arc::new(Borrower::new());
        let b = Arc::new(Borrower::new());

        queue.offer(a.clone());
        queue.offer(b.clone());

        assert!(Arc::ptr_eq(&queue.try_pop().unwrap(), &a));
        assert!(Arc::ptr_eq(&queue.try_pop().unwrap(), &b));
        assert!(queue.try_pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_offer_pop() {
        let queue = Arc::new(WaitQueue::new());
        let mut producers = vec![];
        for _ in 0..4 {
            let q = queue.clone();
            producers.push(thread::spawn(move || {
                for _ in 0..100 {
                    q.offer(Arc::new(Borrower::new()));
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        assert_eq!(queue.len(), 400);
        let mut popped = 0;
        while queue.try_pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, 400);
    }
}
