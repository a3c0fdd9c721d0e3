//! # Synchronization Primitives
//!
//! Per-context seqno timeline.
//!
//! Every request on a context is stamped with the next seqno of the
//! context's timeline. The engine writes two breadcrumbs: the seqno of the
//! last request it *started* and the seqno of the last request it
//! *completed*. Both only move forward.

use core::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// TIMELINE
// =============================================================================

/// Monotonic seqno timeline for one context
///
/// Lock-free: the engine side advances breadcrumbs while the driver side
/// polls them.
#[derive(Debug)]
pub struct Timeline {
    /// Next seqno to hand out
    next: AtomicU64,
    /// Highest seqno the engine has started
    started: AtomicU64,
    /// Highest seqno the engine has completed
    completed: AtomicU64,
}

impl Timeline {
    /// Create a new timeline (first seqno is 1)
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Allocate the next seqno
    pub fn advance(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Last seqno handed out (0 if none)
    pub fn last_issued(&self) -> u64 {
        self.next.load(Ordering::Acquire) - 1
    }

    /// Record that the engine started `seqno`
    pub fn mark_started(&self, seqno: u64) {
        self.started.fetch_max(seqno, Ordering::AcqRel);
    }

    /// Record that the engine completed `seqno` (implies started)
    pub fn signal(&self, seqno: u64) {
        self.mark_started(seqno);
        self.completed.fetch_max(seqno, Ordering::AcqRel);
    }

    /// Highest started seqno
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Acquire)
    }

    /// Highest completed seqno
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Check if `seqno` has started executing
    pub fn is_started(&self, seqno: u64) -> bool {
        seqno <= self.started()
    }

    /// Check if `seqno` has completed
    pub fn is_completed(&self, seqno: u64) -> bool {
        seqno <= self.completed()
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breadcrumbs_only_move_forward() {
        let tl = Timeline::new();
        let a = tl.advance();
        let b = tl.advance();
        assert_eq!((a, b), (1, 2));
        assert_eq!(tl.last_issued(), 2);

        tl.signal(b);
        tl.signal(a);
        assert_eq!(tl.completed(), 2);
        assert!(tl.is_completed(a));
        assert!(tl.is_started(b));
    }

    #[test]
    fn test_started_is_not_completed() {
        let tl = Timeline::new();
        let seqno = tl.advance();
        tl.mark_started(seqno);
        assert!(tl.is_started(seqno));
        assert!(!tl.is_completed(seqno));
    }
}
