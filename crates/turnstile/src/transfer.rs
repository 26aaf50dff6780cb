//! Transfer policy
//!
//! The hand-off discipline for returning connections, expressed as sealed
//! variants rather than a trait hierarchy:
//!
//! - **Compete** maximizes throughput: the entry is freed to `Idle` before
//!   the hand-off, so any thread (the notified waiter or a new arrival)
//!   may win the `Idle -> Using` CAS. The notified waiter can lose.
//! - **Fair** maximizes starvation resistance: the entry stays `Using`
//!   through the hand-off, so only the chosen waiter may accept it; if the
//!   hand-off finds no waiter, the policy frees the entry.

use crate::pooled::{PooledConn, CONN_IDLE, CONN_USING};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferPolicy {
    Compete,
    Fair,
}

impl TransferPolicy {
    pub(crate) fn from_fair_mode(fair: bool) -> Self {
        if fair {
            Self::Fair
        } else {
            Self::Compete
        }
    }

    /// State an entry must still hold for a hand-off to proceed; the
    /// publisher aborts its queue walk when the entry leaves this state.
    #[inline]
    pub(crate) fn check_state_code(&self) -> u32 {
        match self {
            Self::Compete => CONN_IDLE,
            Self::Fair => CONN_USING,
        }
    }

    /// Prepare an entry for hand-off.
    #[inline]
    pub(crate) fn before_transfer(&self, conn: &PooledConn) {
        match self {
            Self::Compete => conn.force_state(CONN_IDLE),
            Self::Fair => {}
        }
    }

    /// Waiter-side acceptance of a published entry.
    #[inline]
    pub(crate) fn try_catch(&self, conn: &PooledConn) -> bool {
        match self {
            Self::Compete => conn.cas_state(CONN_IDLE, CONN_USING),
            Self::Fair => conn.state() == CONN_USING,
        }
    }

    /// No waiter accepted the entry.
    #[inline]
    pub(crate) fn on_failed_transfer(&self, conn: &PooledConn) {
        match self {
            Self::Compete => {}
            Self::Fair => conn.force_state(CONN_IDLE),
        }
    }
}
