//! # Submission Engine
//!
//! Per-class priority queue and drain stall state.
//!
//! ## Stall state machine
//!
//! ```text
//!   None ── pin fails ──▶ FreeSlots(Background) ── retire ──▶ FreeSlots(Drain)
//!    │                                                              │
//!    │                      None ◀──────────── pin succeeds ────────┘
//!    ├── steal enabled ──▶ ScheduleDisable ── disable done ──▶ Register
//!    ├── register Busy ──▶ Register
//!    └── submit Busy ────▶ AddRequest
//! ```
//!
//! The drain keeps at most one stalled request. While blocked it does not
//! run at all; the retire worker or a completion handler unblocks it. A
//! request whose slot is still being deregistered by its previous owner
//! does not stall the engine: it waits on its context's submit fence.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Reverse;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use magma_core::{ContextId, Priority, SlotId};
use spin::Mutex;

use crate::context::Context;
use crate::request::{Request, RequestFlags};

// =============================================================================
// SUBMIT CLASS
// =============================================================================

/// Submission engine class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmitClass {
    /// Single contexts
    Single = 0,
    /// Parent contexts and their children
    Multi  = 1,
}

impl SubmitClass {
    /// Number of classes
    pub const COUNT: usize = 2;

    /// All classes
    pub const ALL: [Self; Self::COUNT] = [Self::Single, Self::Multi];

    /// Class index
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Class name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
        }
    }
}

// =============================================================================
// STALL REASON
// =============================================================================

/// Who is expected to free slots for a stalled drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWaiter {
    /// The retire worker has not run yet
    Background,
    /// The retire worker ran; the drain retries the pin itself
    Drain,
}

/// Why the drain stopped
///
/// There is no deregister stall: a context waiting for its old slot owner
/// to deregister parks its submissions on its own fence. Publishing the
/// ring tail cannot fail, so there is no tail update stall either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StallReason {
    /// Not stalled
    #[default]
    None,
    /// No slot available
    FreeSlots(SlotWaiter),
    /// A slot was stolen from an enabled context; its disable is pending
    ScheduleDisable,
    /// Registration must be (re)tried
    Register,
    /// Submit action must be (re)sent
    AddRequest,
}

impl StallReason {
    /// Check if the drain is stalled
    pub fn is_stalled(&self) -> bool {
        !matches!(self, Self::None)
    }
}

bitflags::bitflags! {
    /// Engine-wide flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EngineFlags: u32 {
        /// Drain must not run until unblocked
        const DRAIN_BLOCKED = 1 << 0;
        /// Fast-path pinning failed; everything goes through the drain
        const SLOTS_EXHAUSTED = 1 << 1;
        /// Engine is unrecoverable
        const DISABLED = 1 << 2;
    }
}

/// Engine statistics
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Requests put on the queue
    pub queued: u64,
    /// Requests submitted without queueing
    pub bypassed: u64,
    /// Requests submitted by the drain
    pub drained: u64,
    /// Stalls entered
    pub stalls: u64,
    /// `Busy` answers from the firmware channel
    pub busy: u64,
    /// Requests put back on the queue by a reset
    pub replayed: u64,
    /// Requests cancelled
    pub cancelled: u64,
}

// =============================================================================
// ENGINE STATE
// =============================================================================

/// Queue ordering: priority first, then arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    priority: Reverse<Priority>,
    arrival: u64,
}

/// State guarded by the engine lock
#[derive(Debug, Default)]
pub(crate) struct EngineState {
    /// Ready requests
    pub queue: BTreeMap<QueueKey, Arc<Request>>,
    /// Current stall
    pub stall: StallReason,
    /// Request the drain stopped on
    pub stalled_request: Option<Arc<Request>>,
    /// Victim whose schedule-disable the drain waits for, and its old slot
    pub stalled_context: Option<(Arc<Context>, SlotId)>,
    /// Queued requests holding no slot reference
    pub total_unpinned: u32,
    /// Next arrival stamp
    next_arrival: u64,
    /// Statistics
    pub stats: EngineStats,
}

impl EngineState {
    /// Give `req` an arrival stamp if it has none
    pub fn stamp(&mut self, req: &Request) {
        if req.arrival() == 0 {
            self.next_arrival += 1;
            req.stamp_arrival(self.next_arrival);
        }
    }

    /// Queue a request by priority, then arrival
    ///
    /// A request never overtakes an earlier one of its own context: its
    /// effective priority is capped by the lowest priority already queued
    /// for that context.
    pub fn enqueue(&mut self, req: Arc<Request>) {
        self.stamp(&req);
        let floor = self
            .queue
            .iter()
            .filter(|(_, r)| r.context() == req.context())
            .map(|(k, _)| k.priority.0)
            .min();
        let priority = floor.map_or(req.priority(), |f| f.min(req.priority()));
        req.set(RequestFlags::QUEUED);
        self.queue.insert(
            QueueKey {
                priority: Reverse(priority),
                arrival: req.arrival(),
            },
            req,
        );
        self.stats.queued += 1;
    }

    /// Pop the next request
    pub fn dequeue(&mut self) -> Option<Arc<Request>> {
        let (_, req) = self.queue.pop_first()?;
        req.clear(RequestFlags::QUEUED);
        Some(req)
    }

    /// Queued requests of a context, in queue order
    pub fn queued_for(&self, id: ContextId) -> Vec<Arc<Request>> {
        self.queue
            .values()
            .filter(|r| r.context() == id)
            .cloned()
            .collect()
    }

    /// Remove every queued request of a context
    pub fn remove_context(&mut self, id: ContextId) -> Vec<Arc<Request>> {
        let mut removed = Vec::new();
        self.queue.retain(|_, r| {
            if r.context() == id {
                removed.push(Arc::clone(r));
                false
            } else {
                true
            }
        });
        removed
    }

    /// Stash the request the drain stopped on
    pub fn stall_on(&mut self, reason: StallReason, req: Arc<Request>) {
        if self.stall != reason {
            self.stats.stalls += 1;
        }
        self.stall = reason;
        self.stalled_request = Some(req);
    }

    /// Leave the stall state
    pub fn clear_stall(&mut self) {
        self.stall = StallReason::None;
        self.stalled_request = None;
        self.stalled_context = None;
    }
}

// =============================================================================
// SUBMISSION ENGINE
// =============================================================================

/// One submission engine
#[derive(Debug)]
pub struct SubmissionEngine {
    /// Class served
    class: SubmitClass,
    /// Queue and stall state
    pub(crate) state: Mutex<EngineState>,
    /// Engine-wide flags
    flags: AtomicU32,
    /// Drain requested
    drain_kick: AtomicBool,
    /// Retire worker requested
    retire_kick: AtomicBool,
    /// Time the drain was blocked
    blocked_since: AtomicU64,
    /// Slots held by contexts with not-ready requests
    not_ready_slots: AtomicU32,
}

impl SubmissionEngine {
    /// Create an idle engine
    pub fn new(class: SubmitClass) -> Self {
        Self {
            class,
            state: Mutex::new(EngineState::default()),
            flags: AtomicU32::new(0),
            drain_kick: AtomicBool::new(false),
            retire_kick: AtomicBool::new(false),
            blocked_since: AtomicU64::new(0),
            not_ready_slots: AtomicU32::new(0),
        }
    }

    /// Class served
    pub fn class(&self) -> SubmitClass {
        self.class
    }

    /// Engine flags
    pub fn flags(&self) -> EngineFlags {
        EngineFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: EngineFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: EngineFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Check if the fast path must defer to the drain
    pub fn is_exhausted(&self) -> bool {
        self.flags().contains(EngineFlags::SLOTS_EXHAUSTED)
    }

    /// Check if the engine is permanently disabled
    pub fn is_disabled(&self) -> bool {
        self.flags().contains(EngineFlags::DISABLED)
    }

    /// Check if the drain is blocked
    pub fn is_blocked(&self) -> bool {
        self.flags().contains(EngineFlags::DRAIN_BLOCKED)
    }

    /// Block the drain
    pub(crate) fn block(&self, now_ns: u64) {
        let prev = self
            .flags
            .fetch_or(EngineFlags::DRAIN_BLOCKED.bits(), Ordering::AcqRel);
        if prev & EngineFlags::DRAIN_BLOCKED.bits() == 0 {
            self.blocked_since.store(now_ns, Ordering::Release);
        }
    }

    /// Unblock the drain
    pub(crate) fn unblock(&self) {
        self.clear_flags(EngineFlags::DRAIN_BLOCKED);
    }

    /// Time the drain has been blocked
    pub fn blocked_for(&self, now_ns: u64) -> Option<u64> {
        if self.is_blocked() {
            Some(now_ns.saturating_sub(self.blocked_since.load(Ordering::Acquire)))
        } else {
            None
        }
    }

    /// Request a drain pass
    pub(crate) fn kick_drain(&self) {
        self.drain_kick.store(true, Ordering::Release);
    }

    /// Request a retire worker pass
    pub(crate) fn kick_retire(&self) {
        self.retire_kick.store(true, Ordering::Release);
    }

    pub(crate) fn take_drain_kick(&self) -> bool {
        self.drain_kick.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn take_retire_kick(&self) -> bool {
        self.retire_kick.swap(false, Ordering::AcqRel)
    }

    /// Slots held by contexts with not-ready requests
    pub fn not_ready_slots(&self) -> u32 {
        self.not_ready_slots.load(Ordering::Acquire)
    }

    pub(crate) fn add_not_ready(&self, slots: u32) {
        self.not_ready_slots.fetch_add(slots, Ordering::AcqRel);
    }

    pub(crate) fn sub_not_ready(&self, slots: u32) {
        let _ = self
            .not_ready_slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(slots))
            });
    }

    /// Current stall
    pub fn stall(&self) -> StallReason {
        self.state.lock().stall
    }

    /// Number of queued requests
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> EngineStats {
        self.state.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magma_core::{RequestId, Timeline};

    fn request(ctx: u32, prio: i32, timeline: &Arc<Timeline>) -> Arc<Request> {
        Arc::new(Request::new(
            RequestId::new(0),
            ContextId::new(ctx),
            Priority::new(prio),
            0,
            Arc::clone(timeline),
        ))
    }

    #[test]
    fn test_priority_then_arrival() {
        let ta = Arc::new(Timeline::new());
        let tb = Arc::new(Timeline::new());
        let mut state = EngineState::default();
        let low = request(1, -10, &ta);
        let high = request(2, 100, &tb);
        let high2 = request(2, 100, &tb);
        state.enqueue(Arc::clone(&low));
        state.enqueue(Arc::clone(&high));
        state.enqueue(Arc::clone(&high2));

        assert!(Arc::ptr_eq(&state.dequeue().unwrap(), &high));
        assert!(Arc::ptr_eq(&state.dequeue().unwrap(), &high2));
        assert!(Arc::ptr_eq(&state.dequeue().unwrap(), &low));
        assert!(state.dequeue().is_none());
    }

    #[test]
    fn test_same_context_never_overtakes() {
        let t = Arc::new(Timeline::new());
        let mut state = EngineState::default();
        let first = request(1, 0, &t);
        let boosted = request(1, 500, &t);
        state.enqueue(Arc::clone(&first));
        state.enqueue(Arc::clone(&boosted));
        assert!(Arc::ptr_eq(&state.dequeue().unwrap(), &first));
        assert!(Arc::ptr_eq(&state.dequeue().unwrap(), &boosted));
    }

    #[test]
    fn test_requeue_keeps_arrival() {
        let t = Arc::new(Timeline::new());
        let mut state = EngineState::default();
        let a = request(1, 0, &t);
        let b = request(2, 0, &t);
        state.enqueue(Arc::clone(&a));
        state.enqueue(Arc::clone(&b));
        let first = state.dequeue().unwrap();
        state.enqueue(first);
        assert!(Arc::ptr_eq(&state.dequeue().unwrap(), &a));
    }

    #[test]
    fn test_block_records_time_once() {
        let engine = SubmissionEngine::new(SubmitClass::Single);
        engine.block(100);
        engine.block(500);
        assert_eq!(engine.blocked_for(700), Some(600));
        engine.unblock();
        assert_eq!(engine.blocked_for(700), None);
    }
}
