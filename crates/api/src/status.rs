//! Live counters shared between background workers and the health endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Latest figures reported by the background workers.
#[derive(Debug, Default)]
pub struct StatusBoard {
    outbox_pending: AtomicUsize,
    stuck_messages: AtomicUsize,
    drifted_products: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    pub outbox_pending: usize,
    pub stuck_messages: usize,
    pub drifted_products: usize,
}

impl StatusBoard {
    pub fn set_outbox_pending(&self, pending: usize) {
        self.outbox_pending.store(pending, Ordering::Relaxed);
    }

    pub fn set_stuck_messages(&self, stuck: usize) {
        self.stuck_messages.store(stuck, Ordering::Relaxed);
    }

    pub fn set_drifted_products(&self, drifted: usize) {
        self.drifted_products.store(drifted, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            outbox_pending: self.outbox_pending.load(Ordering::Relaxed),
            stuck_messages: self.stuck_messages.load(Ordering::Relaxed),
            drifted_products: self.drifted_products.load(Ordering::Relaxed),
        }
    }
}
