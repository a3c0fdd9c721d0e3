//! # Contexts
//!
//! Logical execution streams multiplexed onto firmware slots.
//!
//! Scheduling state is split in two tiers:
//!
//! - [`SchedFlags`]: lock-free, updated with atomic read-modify-write by the
//!   drain task and completion handlers
//! - [`LockedFlags`]: guarded by the context's state lock together with the
//!   active list, the submit fence and the priority buckets

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayVec;
use magma_core::{ContextId, EngineClass, Error, GpuAddr, PriorityBucket, Result, SlotId, Timeline};
use magma_rpc::action::MAX_CHILDREN;
use spin::Mutex;

use crate::engine::SubmitClass;
use crate::request::Request;

/// Maximum siblings of a virtual context
pub const MAX_SIBLINGS: usize = 8;

/// Largest slot block order a parent context may need
pub const MAX_ORDER: u32 = 3;

// =============================================================================
// FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Lock-free scheduling flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SchedFlags: u32 {
        /// Firmware is scheduling the context
        const ENABLED = 1 << 0;
        /// Schedule-enable sent, completion not yet received
        const PENDING_ENABLE = 1 << 1;
        /// Descriptor registered at the context's current slot
        const REGISTERED = 1 << 2;
        /// Registration failed with `Busy` and must be retried
        const NEEDS_REGISTER = 1 << 3;
        /// Slot taken while scheduling was enabled; disable outstanding
        const SLOT_STOLEN = 1 << 4;
        /// Drain task is blocked on this context's schedule-disable
        const BLOCK_DRAIN = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Scheduling flags guarded by the context state lock
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LockedFlags: u32 {
        /// Waiting for the previous owner of our slot to deregister
        const WAIT_FOR_DEREGISTER = 1 << 0;
        /// Context destroyed; slot released on deregister completion
        const DESTROYED = 1 << 1;
        /// Schedule-disable sent, completion not yet received
        const PENDING_DISABLE = 1 << 2;
        /// Context banned; requests are cancelled
        const BANNED = 1 << 3;
        /// Move to the unpinned steal list once disabled
        const UNPIN_PENDING = 1 << 4;
    }
}

// =============================================================================
// CONTEXT KIND
// =============================================================================

/// Context variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextKind {
    /// Bound to one engine instance
    Physical {
        /// Engine instance
        instance: u8,
    },
    /// Load-balanced over sibling instances; sibling 0 is the primary
    Virtual {
        /// Engine instances
        siblings: ArrayVec<u8, MAX_SIBLINGS>,
    },
    /// Parent of a parallel submission; owns a block of slots
    Parent {
        /// Engine instance
        instance: u8,
        /// Ring context addresses of the children
        children: ArrayVec<GpuAddr, MAX_CHILDREN>,
    },
}

impl ContextKind {
    /// Primary engine instance
    pub fn primary_instance(&self) -> u8 {
        match self {
            Self::Physical { instance } | Self::Parent { instance, .. } => *instance,
            Self::Virtual { siblings } => siblings.first().copied().unwrap_or(0),
        }
    }

    /// Engine instance mask written into the descriptor
    pub fn submit_mask(&self) -> u32 {
        match self {
            Self::Physical { instance } | Self::Parent { instance, .. } => 1u32 << u32::from(*instance),
            Self::Virtual { siblings } => siblings
                .iter()
                .fold(0u32, |mask, &s| mask | (1u32 << u32::from(s))),
        }
    }

    /// Number of child contexts
    pub fn children(&self) -> usize {
        match self {
            Self::Parent { children, .. } => children.len(),
            _ => 0,
        }
    }

    /// Check if this is a parent context
    pub fn is_parent(&self) -> bool {
        matches!(self, Self::Parent { .. })
    }

    fn validate(&self) -> Result<()> {
        let in_range = |i: u8| u32::from(i) < EngineClass::MAX_INSTANCES;
        let ok = match self {
            Self::Physical { instance } => in_range(*instance),
            Self::Virtual { siblings } => !siblings.is_empty() && siblings.iter().all(|&s| in_range(s)),
            Self::Parent { instance, children } => in_range(*instance) && !children.is_empty(),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidParameter)
        }
    }
}

/// Context creation parameters
#[derive(Debug, Clone)]
pub struct ContextDesc {
    /// Context variant
    pub kind: ContextKind,
    /// Engine class
    pub class: EngineClass,
    /// Ring context address
    pub lrca: GpuAddr,
}

impl ContextDesc {
    /// Physical context on `instance` of `class`
    pub fn physical(class: EngineClass, instance: u8, lrca: GpuAddr) -> Self {
        Self {
            kind: ContextKind::Physical { instance },
            class,
            lrca,
        }
    }
}

// =============================================================================
// CONTEXT STATE
// =============================================================================

/// State guarded by the context lock
#[derive(Debug)]
pub(crate) struct ContextState {
    /// Locked scheduling flags
    pub flags: LockedFlags,
    /// Block nesting depth
    pub blocked: u32,
    /// Priority currently programmed in firmware
    pub fw_priority: PriorityBucket,
    /// Active requests per priority bucket
    pub prio_count: [u32; PriorityBucket::COUNT],
    /// Active requests, in seqno order
    pub requests: VecDeque<Arc<Request>>,
    /// Submissions held until registration or disable completes
    pub fence: VecDeque<Arc<Request>>,
    /// Queued requests holding no slot reference
    pub num_unpinned: u32,
    /// Ring tail last published
    pub ring_tail: u32,
    /// Ring tail of the last completed request at reset
    pub ring_head: u32,
}

impl ContextState {
    fn new() -> Self {
        Self {
            flags: LockedFlags::empty(),
            blocked: 0,
            fw_priority: PriorityBucket::KmdNormal,
            prio_count: [0; PriorityBucket::COUNT],
            requests: VecDeque::new(),
            fence: VecDeque::new(),
            num_unpinned: 0,
            ring_tail: 0,
            ring_head: 0,
        }
    }

    /// Highest-priority non-empty bucket
    pub fn effective_priority(&self) -> Option<PriorityBucket> {
        PriorityBucket::ALL
            .iter()
            .copied()
            .find(|b| self.prio_count[b.index()] > 0)
    }

    /// Check if any active request still has to run
    pub fn has_pending_work(&self) -> bool {
        self.requests.iter().any(|r| !r.is_done())
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// A logical execution context
#[derive(Debug)]
pub struct Context {
    /// Stable id
    id: ContextId,
    /// Variant
    kind: ContextKind,
    /// Engine class
    class: EngineClass,
    /// Ring context address
    lrca: GpuAddr,
    /// Base slot, or `SlotId::INVALID`
    slot: AtomicU32,
    /// References on the slot held by in-flight requests
    slot_refs: AtomicU32,
    /// Lock-free scheduling flags
    sched: AtomicU32,
    /// Requests created but not yet submitted
    num_not_ready: AtomicU32,
    /// Seqno timeline
    timeline: Arc<Timeline>,
    /// Locked state
    pub(crate) state: Mutex<ContextState>,
}

impl Context {
    /// Create a context from its description
    pub fn new(id: ContextId, desc: ContextDesc) -> Result<Self> {
        desc.kind.validate()?;
        Ok(Self {
            id,
            kind: desc.kind,
            class: desc.class,
            lrca: desc.lrca,
            slot: AtomicU32::new(SlotId::INVALID.raw()),
            slot_refs: AtomicU32::new(0),
            sched: AtomicU32::new(0),
            num_not_ready: AtomicU32::new(0),
            timeline: Arc::new(Timeline::new()),
            state: Mutex::new(ContextState::new()),
        })
    }

    /// Context id
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Variant
    pub fn kind(&self) -> &ContextKind {
        &self.kind
    }

    /// Engine class
    pub fn class(&self) -> EngineClass {
        self.class
    }

    /// Ring context address
    pub fn lrca(&self) -> GpuAddr {
        self.lrca
    }

    /// Seqno timeline
    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    /// Submission engine serving this context
    pub fn submit_class(&self) -> SubmitClass {
        if self.kind.is_parent() {
            SubmitClass::Multi
        } else {
            SubmitClass::Single
        }
    }

    /// Log2 of the slot block size
    pub fn order(&self) -> u32 {
        let width = self.kind.children() as u32 + 1;
        width.next_power_of_two().trailing_zeros()
    }

    /// Number of slots the context occupies
    pub fn slot_width(&self) -> u32 {
        1 << self.order()
    }

    // -------------------------------------------------------------------------
    // Slot
    // -------------------------------------------------------------------------

    /// Base slot
    pub fn slot(&self) -> SlotId {
        SlotId::new(self.slot.load(Ordering::Acquire))
    }

    pub(crate) fn set_slot(&self, slot: SlotId) {
        self.slot.store(slot.raw(), Ordering::Release);
    }

    /// Slot references held
    pub fn slot_refs(&self) -> u32 {
        self.slot_refs.load(Ordering::Acquire)
    }

    /// Take a slot reference if at least one is already held
    pub(crate) fn try_get_ref(&self) -> bool {
        self.slot_refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                if r == 0 { None } else { Some(r + 1) }
            })
            .is_ok()
    }

    pub(crate) fn add_refs(&self, n: u32) {
        self.slot_refs.fetch_add(n, Ordering::AcqRel);
    }

    /// Drop a slot reference; true when it was the last one
    pub(crate) fn put_ref(&self) -> bool {
        match self
            .slot_refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
        {
            Ok(prev) => prev == 1,
            Err(_) => {
                log::warn!("Context {}: slot reference underflow", self.id);
                false
            },
        }
    }

    // -------------------------------------------------------------------------
    // Scheduling flags
    // -------------------------------------------------------------------------

    /// Lock-free scheduling flags
    pub fn sched_flags(&self) -> SchedFlags {
        SchedFlags::from_bits_truncate(self.sched.load(Ordering::Acquire))
    }

    pub(crate) fn set_sched(&self, flags: SchedFlags) {
        self.sched.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_sched(&self, flags: SchedFlags) {
        self.sched.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Clear `flags`, returning whether any of them was set
    pub(crate) fn take_sched(&self, flags: SchedFlags) -> bool {
        let prev = self.sched.fetch_and(!flags.bits(), Ordering::AcqRel);
        prev & flags.bits() != 0
    }

    /// Check if the descriptor is registered at the current slot
    pub fn is_registered(&self) -> bool {
        self.sched_flags().contains(SchedFlags::REGISTERED)
    }

    /// Check if firmware is scheduling the context
    pub fn is_enabled(&self) -> bool {
        self.sched_flags().contains(SchedFlags::ENABLED)
    }

    /// Check if registration must be retried
    pub fn needs_register(&self) -> bool {
        self.sched_flags().contains(SchedFlags::NEEDS_REGISTER)
    }

    // -------------------------------------------------------------------------
    // Locked state views
    // -------------------------------------------------------------------------

    /// Locked scheduling flags
    pub fn locked_flags(&self) -> LockedFlags {
        self.state.lock().flags
    }

    /// Check if the context is banned
    pub fn is_banned(&self) -> bool {
        self.locked_flags().contains(LockedFlags::BANNED)
    }

    /// Check if the context is destroyed
    pub fn is_destroyed(&self) -> bool {
        self.locked_flags().contains(LockedFlags::DESTROYED)
    }

    /// Priority programmed in firmware
    pub fn fw_priority(&self) -> PriorityBucket {
        self.state.lock().fw_priority
    }

    /// Queued requests waiting for a slot reference
    pub fn unpinned_requests(&self) -> u32 {
        self.state.lock().num_unpinned
    }

    /// Active request count per bucket
    pub fn prio_counts(&self) -> [u32; PriorityBucket::COUNT] {
        self.state.lock().prio_count
    }

    /// Active requests
    pub fn active_requests(&self) -> Vec<Arc<Request>> {
        self.state.lock().requests.iter().cloned().collect()
    }

    /// Requests parked on the submit fence
    pub fn parked_requests(&self) -> Vec<Arc<Request>> {
        self.state.lock().fence.iter().cloned().collect()
    }

    /// Block nesting depth
    pub fn blocked_depth(&self) -> u32 {
        self.state.lock().blocked
    }

    /// Ring tail last published
    pub fn ring_tail(&self) -> u32 {
        self.state.lock().ring_tail
    }

    /// Replay point recorded by the last reset
    pub fn ring_head(&self) -> u32 {
        self.state.lock().ring_head
    }

    // -------------------------------------------------------------------------
    // Not-ready accounting
    // -------------------------------------------------------------------------

    /// Count a created request; true on the first one
    pub(crate) fn inc_not_ready(&self) -> bool {
        self.num_not_ready.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Uncount a submitted request; true on the last one
    pub(crate) fn dec_not_ready(&self) -> bool {
        self.num_not_ready
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev == 1)
            .unwrap_or(false)
    }
}

// =============================================================================
// CONTEXT ARENA
// =============================================================================

/// Live contexts keyed by id
#[derive(Debug, Default)]
pub struct ContextArena {
    contexts: BTreeMap<ContextId, Arc<Context>>,
}

impl ContextArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a context
    pub fn insert(&mut self, ctx: Arc<Context>) {
        self.contexts.insert(ctx.id(), ctx);
    }

    /// Look up a context
    pub fn get(&self, id: ContextId) -> Option<Arc<Context>> {
        self.contexts.get(&id).cloned()
    }

    /// Remove a context
    pub fn remove(&mut self, id: ContextId) -> Option<Arc<Context>> {
        self.contexts.remove(&id)
    }

    /// Snapshot of every context, in id order
    pub fn all(&self) -> Vec<Arc<Context>> {
        self.contexts.values().cloned().collect()
    }

    /// Number of live contexts
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Check if the arena is empty
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Drop every context
    pub fn clear(&mut self) {
        self.contexts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent(children: usize) -> Context {
        let mut kids = ArrayVec::new();
        for i in 0..children {
            kids.push(GpuAddr::new(0x10_0000 + i as u64 * 0x1000));
        }
        Context::new(
            ContextId::new(9),
            ContextDesc {
                kind: ContextKind::Parent {
                    instance: 0,
                    children: kids,
                },
                class: EngineClass::Render,
                lrca: GpuAddr::new(0x8000),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_parent_order() {
        assert_eq!(parent(1).order(), 1);
        assert_eq!(parent(2).order(), 2);
        assert_eq!(parent(3).order(), 2);
        assert_eq!(parent(4).slot_width(), 8);
        assert_eq!(parent(1).submit_class(), SubmitClass::Multi);
    }

    #[test]
    fn test_virtual_mask() {
        let mut siblings = ArrayVec::new();
        siblings.push(2);
        siblings.push(0);
        let kind = ContextKind::Virtual { siblings };
        assert_eq!(kind.submit_mask(), 0b101);
        assert_eq!(kind.primary_instance(), 2);
    }

    #[test]
    fn test_invalid_kinds_rejected() {
        let desc = ContextDesc::physical(EngineClass::Copy, 9, GpuAddr::new(0x1000));
        assert_eq!(
            Context::new(ContextId::new(1), desc).err(),
            Some(Error::InvalidParameter)
        );
        let desc = ContextDesc {
            kind: ContextKind::Virtual {
                siblings: ArrayVec::new(),
            },
            class: EngineClass::Video,
            lrca: GpuAddr::new(0x1000),
        };
        assert!(Context::new(ContextId::new(2), desc).is_err());
    }

    #[test]
    fn test_slot_refs() {
        let ctx = Context::new(
            ContextId::new(1),
            ContextDesc::physical(EngineClass::Render, 0, GpuAddr::new(0x1000)),
        )
        .unwrap();
        assert!(!ctx.try_get_ref());
        ctx.add_refs(1);
        assert!(ctx.try_get_ref());
        assert!(!ctx.put_ref());
        assert!(ctx.put_ref());
        assert!(!ctx.put_ref());
        assert_eq!(ctx.slot_refs(), 0);
    }

    #[test]
    fn test_not_ready_edges() {
        let ctx = parent(1);
        assert!(ctx.inc_not_ready());
        assert!(!ctx.inc_not_ready());
        assert!(!ctx.dec_not_ready());
        assert!(ctx.dec_not_ready());
        assert!(!ctx.dec_not_ready());
    }
}
