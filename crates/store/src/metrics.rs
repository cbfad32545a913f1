//! Store-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by every table of a factory, for the outer
/// process to scrape or log.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// History branches repaired at table open. Non-zero means the unique
    /// `previous` index was violated at some point and data was dropped.
    pub repaired_branches: AtomicU64,
}

impl StoreMetrics {
    pub fn repaired_branches(&self) -> u64 {
        self.repaired_branches.load(Ordering::Relaxed)
    }
}
