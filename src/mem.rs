//! Allocation accounting
//!
//! The tracker is an injected capability on the database handle: the pager,
//! the blob store, and the cursor machinery report every buffer they hand out
//! and take back. Tests use it to prove that a full open/operate/close cycle
//! is leak-free, and an optional limit turns exhaustion into `OutOfMemory`
//! instead of unbounded growth.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::error::{Error, ErrorCode, Result};

#[derive(Debug)]
pub struct MemTracker {
    live: AtomicI64,
    peak: AtomicI64,
    total: AtomicU64,
    /// 0 means unlimited
    limit: AtomicI64,
}

impl MemTracker {
    pub fn new() -> Self {
        MemTracker {
            live: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            total: AtomicU64::new(0),
            limit: AtomicI64::new(0),
        }
    }

    /// Tracker that fails allocations once `live()` would exceed `bytes`.
    pub fn with_limit(bytes: usize) -> Self {
        let tracker = MemTracker::new();
        tracker.limit.store(bytes as i64, Ordering::Relaxed);
        tracker
    }

    /// Account for an allocation of `bytes`, or fail with `OutOfMemory`.
    pub fn allocate(&self, bytes: usize) -> Result<()> {
        let bytes = bytes as i64;
        let limit = self.limit.load(Ordering::Relaxed);
        let live = self.live.load(Ordering::Relaxed);
        if limit > 0 && live + bytes > limit {
            return Err(Error::with_message(
                ErrorCode::OutOfMemory,
                format!("{} live + {} requested exceeds limit {}", live, bytes, limit),
            ));
        }
        let now = self.live.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(now, Ordering::Relaxed);
        self.total.fetch_add(bytes as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Account for releasing `bytes` previously passed to `allocate`.
    pub fn release(&self, bytes: usize) {
        self.live.fetch_sub(bytes as i64, Ordering::Relaxed);
    }

    /// Bytes currently accounted as live
    pub fn live(&self) -> i64 {
        self.live.load(Ordering::Relaxed)
    }

    /// High-water mark of live bytes
    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Sum of all bytes ever allocated
    pub fn total_allocated(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Default for MemTracker {
    fn default() -> Self {
        MemTracker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_live_and_peak() {
        let t = MemTracker::new();
        t.allocate(100).unwrap();
        t.allocate(50).unwrap();
        assert_eq!(t.live(), 150);
        t.release(100);
        assert_eq!(t.live(), 50);
        assert_eq!(t.peak(), 150);
        assert_eq!(t.total_allocated(), 150);
    }

    #[test]
    fn limit_turns_into_out_of_memory() {
        let t = MemTracker::with_limit(128);
        t.allocate(100).unwrap();
        let err = t.allocate(100).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfMemory);
        t.release(100);
        t.allocate(100).unwrap();
    }
}
