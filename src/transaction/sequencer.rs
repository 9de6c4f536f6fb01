use crate::core::GlobalTransactionId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out cluster-wide commit order on the active server.
#[derive(Debug)]
pub struct GlobalTransactionIdSequencer {
    next: AtomicU64,
}

impl GlobalTransactionIdSequencer {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    pub fn next_id(&self) -> GlobalTransactionId {
        GlobalTransactionId(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// The id the next call to `next_id` would return.
    pub fn peek(&self) -> GlobalTransactionId {
        GlobalTransactionId(self.next.load(Ordering::SeqCst))
    }

    /// Resume after `seen` when a passive takes over, so ids stay monotonic
    /// across failover.
    pub fn advance_past(&self, seen: GlobalTransactionId) {
        self.next
            .fetch_max(seen.as_u64().saturating_add(1), Ordering::SeqCst);
    }
}

impl Default for GlobalTransactionIdSequencer {
    fn default() -> Self {
        Self::new()
    }
}
