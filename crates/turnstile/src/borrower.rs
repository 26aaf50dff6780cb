//! Borrower hand-off slot
//!
//! Each borrowing thread owns one `Borrower`, cached in a thread-local and
//! enlisted on the wait queue when the scan misses. Its `TransferSlot` is a
//! single `AtomicUsize` that holds either a small-integer sentinel tag or a
//! tagged `Box` pointer carrying the hand-off payload (a connection or an
//! error). All transitions are single-word CAS:
//!
//! - publishers CAS `Normal`/`Waiting` -> payload pointer and own the box
//!   until the CAS succeeds;
//! - the owning thread consumes with `swap(Done)`, taking box ownership;
//! - terminal tags (`Timeout`, `Done`) are never publishable, so stale
//!   wait-queue entries are skipped without coordination.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::Thread;

use crate::error::Error;
use crate::pooled::PooledConn;

/// Slot tag: enlisted, spinning or about to park
pub(crate) const SLOT_NORMAL: usize = 0;
/// Slot tag: parked; a publisher must unpark after a successful CAS
pub(crate) const SLOT_WAITING: usize = 1;
/// Slot tag: borrower latched a deadline failure; terminal for this acquire
pub(crate) const SLOT_TIMEOUT: usize = 2;
/// Slot tag: borrower consumed a payload or left the wait loop; terminal
pub(crate) const SLOT_DONE: usize = 3;

const MAX_TAG: usize = SLOT_DONE;

/// Hand-off payload published into a waiting borrower's slot.
///
/// Boxed behind an alignment guarantee so the pointer can never collide
/// with the sentinel tags above.
#[repr(align(8))]
pub(crate) struct Handoff(pub(crate) Payload);

pub(crate) enum Payload {
    /// A connection offered by `recycle` or the servant
    Conn(Arc<PooledConn>),
    /// A failure re-published to exactly one waiter
    Fault(Error),
}

/// Result of consuming the slot word
pub(crate) enum Taken {
    Tag(usize),
    Payload(Box<Handoff>),
}

/// Single-word CAS slot; see module docs for the ownership protocol.
pub(crate) struct TransferSlot(AtomicUsize);

impl TransferSlot {
    pub(crate) fn new() -> Self {
        Self(AtomicUsize::new(SLOT_DONE))
    }

    /// Current raw word. Payload pointers compare `> MAX_TAG`.
    #[inline]
    pub(crate) fn load(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_payload(word: usize) -> bool {
        word > MAX_TAG
    }

    /// Reset to a publishable/terminal tag. Only the owning thread may call
    /// this, and only while the slot holds a tag (never over a payload).
    #[inline]
    pub(crate) fn store_tag(&self, tag: usize) {
        debug_assert!(tag <= MAX_TAG);
        self.0.store(tag, Ordering::Release);
    }

    /// CAS tag -> tag (enlist, park, latch-failure transitions).
    #[inline]
    pub(crate) fn cas_tag(&self, expect: usize, to: usize) -> bool {
        debug_assert!(to <= MAX_TAG);
        self.0
            .compare_exchange(expect, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publish a payload over an observed publishable tag.
    ///
    /// On success the box now belongs to the consuming borrower; on failure
    /// it is handed back to the publisher.
    pub(crate) fn publish(
        &self,
        observed_tag: usize,
        payload: Box<Handoff>,
    ) -> Result<(), Box<Handoff>> {
        debug_assert!(observed_tag == SLOT_NORMAL || observed_tag == SLOT_WAITING);
        let ptr = Box::into_raw(payload) as usize;
        match self
            .0
            .compare_exchange(observed_tag, ptr, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            // SAFETY: the CAS failed, so the pointer was never published
            // and we still hold the only reference to the box.
            Err(_) => Err(unsafe { Box::from_raw(ptr as *mut Handoff) }),
        }
    }

    /// Swap the word for `Done`, taking ownership of any payload.
    ///
    /// Only the owning thread consumes; publishers never read payloads back
    /// out, so a pointer obtained here is uniquely owned.
    pub(crate) fn take(&self) -> Taken {
        let word = self.0.swap(SLOT_DONE, Ordering::AcqRel);
        if Self::is_payload(word) {
            // SAFETY: a payload word is always a pointer produced by
            // `Box::into_raw` in `publish`, and the swap above removed it
            // from the slot, transferring ownership to us.
            Taken::Payload(unsafe { Box::from_raw(word as *mut Handoff) })
        } else {
            Taken::Tag(word)
        }
    }
}

impl Drop for TransferSlot {
    fn drop(&mut self) {
        // Reclaim a payload stranded by a thread that died between publish
        // and consume.
        if let Taken::Payload(p) = self.take() {
            drop(p);
        }
    }
}

/// Per-caller hand-off state.
pub(crate) struct Borrower {
    thread: Thread,
    slot: TransferSlot,
    /// Last successfully borrowed entry; a hint for the fast path, not
    /// ownership. Weak so an evicted entry's memory is not pinned.
    last_used: UnsafeCell<Weak<PooledConn>>,
}

// SAFETY: `thread` and `slot` are Sync. `last_used` is only ever accessed
// by the thread that owns this borrower (it lives in that thread's
// thread-local cache); other threads touch nothing but `slot` and
// `thread`.
unsafe impl Send for Borrower {}
unsafe impl Sync for Borrower {}

impl Borrower {
    pub(crate) fn new() -> Self {
        Self {
            thread: std::thread::current(),
            slot: TransferSlot::new(),
            last_used: UnsafeCell::new(Weak::new()),
        }
    }

    #[inline]
    pub(crate) fn slot(&self) -> &TransferSlot {
        &self.slot
    }

    #[inline]
    pub(crate) fn unpark(&self) {
        self.thread.unpark();
    }

    /// Fast-path hint. Only callable from the owning thread.
    #[inline]
    pub(crate) fn hint(&self) -> Option<Arc<PooledConn>> {
        // SAFETY: per the struct contract, `last_used` is only dereferenced
        // by the owning thread.
        unsafe { (*self.last_used.get()).upgrade() }
    }

    /// Record the entry just handed to this borrower. Owning thread only.
    #[inline]
    pub(crate) fn set_hint(&self, conn: &Arc<PooledConn>) {
        // SAFETY: see `hint`.
        unsafe { *self.last_used.get() = Arc::downgrade(conn) }
    }

    /// Drop the hint after a failed borrow test. Owning thread only.
    #[inline]
    pub(crate) fn clear_hint(&self) {
        // SAFETY: see `hint`.
        unsafe { *self.last_used.get() = Weak::new() }
    }
}
