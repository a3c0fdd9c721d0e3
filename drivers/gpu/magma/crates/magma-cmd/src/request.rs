//! # Requests
//!
//! One submittable unit of work on a context.
//!
//! A request is stamped with the next seqno of its context's timeline at
//! creation. It is complete once the engine's completed breadcrumb passes
//! that seqno, or once it has been skipped or cancelled.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use magma_core::{ContextId, Priority, RequestId, Timeline};

bitflags::bitflags! {
    /// Request lifecycle flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        /// Holds no slot reference; the drain task must pin for it
        const NOT_PINNED = 1 << 0;
        /// Created but not yet submitted
        const NOT_READY = 1 << 1;
        /// Waiting on the context's submit fence
        const PARKED = 1 << 2;
        /// In an engine queue or stashed by a stalled drain
        const QUEUED = 1 << 3;
        /// On the context's active list
        const ACTIVE = 1 << 4;
        /// Handed to the firmware
        const SUBMITTED = 1 << 5;
        /// Failed
        const ERROR = 1 << 6;
        /// Will never run
        const SKIPPED = 1 << 7;
        /// Cancelled by ban, destroy or an unrecoverable engine
        const CANCELLED = 1 << 8;
        /// Removed from the active list
        const RETIRED = 1 << 9;
    }
}

// =============================================================================
// REQUEST
// =============================================================================

/// A request
#[derive(Debug)]
pub struct Request {
    /// Request id
    id: RequestId,
    /// Owning context
    context: ContextId,
    /// Scheduling priority
    priority: Priority,
    /// Seqno on the context timeline
    seqno: u64,
    /// Ring tail once this request's commands are written
    tail: u32,
    /// Engine queue arrival stamp (0 until first queued)
    arrival: AtomicU64,
    /// Lifecycle flags
    flags: AtomicU32,
    /// Context timeline
    timeline: Arc<Timeline>,
}

impl Request {
    /// Create a request
    pub fn new(
        id: RequestId,
        context: ContextId,
        priority: Priority,
        tail: u32,
        timeline: Arc<Timeline>,
    ) -> Self {
        let seqno = timeline.advance();
        Self {
            id,
            context,
            priority,
            seqno,
            tail,
            arrival: AtomicU64::new(0),
            flags: AtomicU32::new(RequestFlags::NOT_READY.bits()),
            timeline,
        }
    }

    /// Request id
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Owning context
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Seqno on the context timeline
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Ring tail
    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Timeline the request completes on
    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    /// Arrival stamp, 0 if never queued
    pub fn arrival(&self) -> u64 {
        self.arrival.load(Ordering::Acquire)
    }

    pub(crate) fn stamp_arrival(&self, arrival: u64) {
        let _ = self
            .arrival
            .compare_exchange(0, arrival, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Current flags
    pub fn flags(&self) -> RequestFlags {
        RequestFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Check if every flag in `flags` is set
    pub fn test(&self, flags: RequestFlags) -> bool {
        self.flags().contains(flags)
    }

    pub(crate) fn set(&self, flags: RequestFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear(&self, flags: RequestFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Check if the request holds a slot reference
    pub fn is_pinned(&self) -> bool {
        !self.test(RequestFlags::NOT_PINNED)
    }

    /// Check if the engine started executing the request
    pub fn is_started(&self) -> bool {
        self.timeline.is_started(self.seqno)
    }

    /// Check if the engine finished the request
    pub fn is_completed(&self) -> bool {
        self.timeline.is_completed(self.seqno)
    }

    /// Check if the request needs no further processing
    pub fn is_done(&self) -> bool {
        self.flags()
            .intersects(RequestFlags::CANCELLED | RequestFlags::SKIPPED)
            || self.is_completed()
    }

    /// Check if the request failed
    pub fn is_error(&self) -> bool {
        self.test(RequestFlags::ERROR)
    }

    /// Check if the request was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.test(RequestFlags::CANCELLED)
    }

    pub(crate) fn cancel(&self) {
        self.set(RequestFlags::CANCELLED | RequestFlags::ERROR);
        self.clear(RequestFlags::QUEUED | RequestFlags::PARKED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(timeline: &Arc<Timeline>) -> Request {
        Request::new(
            RequestId::new(1),
            ContextId::new(1),
            Priority::NORMAL,
            64,
            Arc::clone(timeline),
        )
    }

    #[test]
    fn test_seqno_and_completion() {
        let timeline = Arc::new(Timeline::new());
        let first = request(&timeline);
        let second = request(&timeline);
        assert_eq!(second.seqno(), first.seqno() + 1);

        timeline.mark_started(first.seqno());
        assert!(first.is_started());
        assert!(!first.is_done());
        timeline.signal(first.seqno());
        assert!(first.is_done());
        assert!(!second.is_done());
    }

    #[test]
    fn test_arrival_stamped_once() {
        let timeline = Arc::new(Timeline::new());
        let req = request(&timeline);
        req.stamp_arrival(7);
        req.stamp_arrival(9);
        assert_eq!(req.arrival(), 7);
    }

    #[test]
    fn test_cancel_marks_done() {
        let timeline = Arc::new(Timeline::new());
        let req = request(&timeline);
        req.set(RequestFlags::QUEUED);
        req.cancel();
        assert!(req.is_done());
        assert!(req.is_error());
        assert!(!req.test(RequestFlags::QUEUED));
    }
}
