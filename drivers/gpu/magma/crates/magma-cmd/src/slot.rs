//! # Slot Allocator
//!
//! Hands out firmware slots to contexts and steals them back from idle
//! contexts once the pool runs dry.
//!
//! ## Partitions
//!
//! ```text
//!  0                multi_reserved                          num_slots
//!  ├──────────────────────┼───────────────────────────────────────┤
//!  │ parent blocks (2^k)  │ single slots                          │
//!  └──────────────────────┴───────────────────────────────────────┘
//! ```
//!
//! ## Steal candidates
//!
//! A context whose last slot reference is dropped is linked on one of two
//! lists, per class and block order:
//!
//! - `unpinned`: scheduling disabled; stealing only needs a deregister
//! - `no_ref`: still enabled in firmware; stealing needs a schedule-disable
//!   round trip first, so only the drain task may do it
//!
//! Everything here runs under the device's allocator lock.

use alloc::collections::{BTreeSet, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use magma_core::{ContextId, Error, Result, SlotId};

use crate::context::{Context, LockedFlags, SchedFlags, MAX_ORDER};
use crate::descriptor::DescriptorTable;
use crate::engine::SubmitClass;

// =============================================================================
// PIN OUTCOME
// =============================================================================

/// Result of pinning a context's slot
#[derive(Debug, Clone)]
pub enum PinOutcome {
    /// The context kept the slot it had
    SameId,
    /// A new slot; the context must be registered and enabled
    NewId,
    /// A slot stolen from a context still enabled in firmware
    ///
    /// The victim must be schedule-disabled at `slot` before the new owner
    /// can take over the descriptor.
    NewIdStolenEnabled {
        /// Previous owner
        victim: Arc<Context>,
        /// The stolen slot
        slot: SlotId,
    },
}

impl PinOutcome {
    /// Check if the context got a slot it did not hold before
    pub fn is_new(&self) -> bool {
        !matches!(self, Self::SameId)
    }
}

/// Allocator statistics
#[derive(Debug, Clone, Default)]
pub struct AllocatorStats {
    /// Slots allocated from the free pool
    pub allocated: u64,
    /// Slots returned to the free pool
    pub released: u64,
    /// Slots stolen from disabled contexts
    pub steals_unpinned: u64,
    /// Slots stolen from enabled contexts
    pub steals_enabled: u64,
    /// Pin attempts that found nothing
    pub exhausted: u64,
    /// Deregister hand-offs started
    pub takeovers: u64,
}

// =============================================================================
// STEAL LISTS
// =============================================================================

#[derive(Debug)]
struct StealLists {
    unpinned: Vec<VecDeque<Arc<Context>>>,
    no_ref: Vec<VecDeque<Arc<Context>>>,
}

impl StealLists {
    fn new(orders: usize) -> Self {
        Self {
            unpinned: (0..orders).map(|_| VecDeque::new()).collect(),
            no_ref: (0..orders).map(|_| VecDeque::new()).collect(),
        }
    }

    fn unlink(&mut self, id: ContextId) {
        for list in self.unpinned.iter_mut().chain(self.no_ref.iter_mut()) {
            list.retain(|c| c.id() != id);
        }
    }

    fn contains(&self, id: ContextId) -> bool {
        self.unpinned
            .iter()
            .chain(self.no_ref.iter())
            .any(|list| list.iter().any(|c| c.id() == id))
    }

    fn is_empty(&self) -> bool {
        self.unpinned
            .iter()
            .chain(self.no_ref.iter())
            .all(VecDeque::is_empty)
    }

    fn clear(&mut self) {
        for list in self.unpinned.iter_mut().chain(self.no_ref.iter_mut()) {
            list.clear();
        }
    }
}

// =============================================================================
// SLOT ALLOCATOR
// =============================================================================

/// Firmware slot allocator
#[derive(Debug)]
pub struct SlotAllocator {
    /// Total slots
    num_slots: u32,
    /// Slots reserved for parent blocks
    multi_reserved: u32,
    /// Free single slots; lowest id is handed out first
    free: BTreeSet<u32>,
    /// Parent-region occupancy
    multi_used: Vec<bool>,
    /// Owner of every slot
    owners: Vec<Option<ContextId>>,
    /// Descriptor table and slot → context lookup
    pub(crate) table: DescriptorTable,
    /// Contexts waiting for a slot's previous owner to deregister
    takeover: HashMap<u32, Arc<Context>>,
    /// Steal candidates per class
    lists: [StealLists; SubmitClass::COUNT],
    /// Statistics
    stats: AllocatorStats,
}

impl SlotAllocator {
    /// Create an allocator
    pub fn new(num_slots: u32, multi_reserved: u32) -> Self {
        let multi_reserved = multi_reserved.min(num_slots);
        Self {
            num_slots,
            multi_reserved,
            free: (multi_reserved..num_slots).collect(),
            multi_used: alloc::vec![false; multi_reserved as usize],
            owners: alloc::vec![None; num_slots as usize],
            table: DescriptorTable::new(num_slots),
            takeover: HashMap::new(),
            lists: [StealLists::new(1), StealLists::new(MAX_ORDER as usize + 1)],
            stats: AllocatorStats::default(),
        }
    }

    /// Slots in a class's partition
    pub fn capacity(&self, class: SubmitClass) -> u32 {
        match class {
            SubmitClass::Single => self.num_slots - self.multi_reserved,
            SubmitClass::Multi => self.multi_reserved,
        }
    }

    /// Free slots in a class's partition
    pub fn free_slots(&self, class: SubmitClass) -> u32 {
        match class {
            SubmitClass::Single => self.free.len() as u32,
            SubmitClass::Multi => self.multi_used.iter().filter(|u| !**u).count() as u32,
        }
    }

    /// Check if a pin for `class` could find something right now
    pub fn has_candidates(&self, class: SubmitClass) -> bool {
        self.free_slots(class) > 0 || !self.lists[class.index()].is_empty()
    }

    /// Owner of `slot`
    pub fn owner(&self, slot: SlotId) -> Option<ContextId> {
        self.owners.get(slot.index()).copied().flatten()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> AllocatorStats {
        self.stats.clone()
    }

    /// Check if `id` is linked on a steal list
    pub fn is_steal_candidate(&self, id: ContextId) -> bool {
        self.lists.iter().any(|l| l.contains(id))
    }

    // -------------------------------------------------------------------------
    // Pin / unpin / release
    // -------------------------------------------------------------------------

    /// Pin the context's slot, taking `refs` references
    ///
    /// Assigns a slot when the context has none. Only the drain task may
    /// steal from enabled contexts (`from_drain`).
    pub fn pin(&mut self, ctx: &Arc<Context>, from_drain: bool, refs: u32) -> Result<PinOutcome> {
        let outcome = if ctx.slot().is_valid() {
            PinOutcome::SameId
        } else {
            self.assign(ctx, from_drain)?
        };
        self.lists[ctx.submit_class().index()].unlink(ctx.id());
        ctx.add_refs(refs);
        Ok(outcome)
    }

    /// Link an idle context on a steal list
    ///
    /// Only contexts holding a slot with no references and not destroyed
    /// become candidates.
    pub fn unpin(&mut self, ctx: &Arc<Context>) {
        if !ctx.slot().is_valid() || ctx.slot_refs() != 0 {
            return;
        }
        if ctx.locked_flags().contains(LockedFlags::DESTROYED) {
            return;
        }
        let lists = &mut self.lists[ctx.submit_class().index()];
        lists.unlink(ctx.id());
        let order = ctx.order() as usize;
        if ctx.sched_flags().contains(SchedFlags::ENABLED) {
            lists.no_ref[order].push_back(Arc::clone(ctx));
        } else {
            lists.unpinned[order].push_back(Arc::clone(ctx));
        }
    }

    /// Return the context's slot to the pool
    ///
    /// A no-op on a context without a slot.
    pub fn release(&mut self, ctx: &Arc<Context>) {
        let slot = ctx.slot();
        if !slot.is_valid() {
            return;
        }
        let class = ctx.submit_class();
        self.lists[class.index()].unlink(ctx.id());
        self.takeover.retain(|_, waiter| waiter.id() != ctx.id());
        if self.table.is_owned_by(slot, ctx.id()) {
            self.table.unregister(slot);
        }
        self.free_region(class, slot, ctx.order());
        ctx.set_slot(SlotId::INVALID);
        ctx.clear_sched(SchedFlags::REGISTERED | SchedFlags::ENABLED | SchedFlags::PENDING_ENABLE);
        self.stats.released += 1;
        log::debug!("SlotAllocator: released slot {} from context {}", slot, ctx.id());
    }

    /// Unlink a context from every steal list
    pub fn unlink(&mut self, ctx: &Context) {
        self.lists[ctx.submit_class().index()].unlink(ctx.id());
    }

    // -------------------------------------------------------------------------
    // Takeover
    // -------------------------------------------------------------------------

    /// Record that `ctx` waits for `slot`'s previous owner to deregister
    pub fn set_takeover(&mut self, slot: SlotId, ctx: &Arc<Context>) {
        self.takeover.insert(slot.raw(), Arc::clone(ctx));
        self.stats.takeovers += 1;
    }

    /// Context waiting to take over `slot`
    pub fn takeover_waiter(&self, slot: SlotId) -> Option<&Arc<Context>> {
        self.takeover.get(&slot.raw())
    }

    /// Stop waiting for `slot`
    pub fn take_takeover(&mut self, slot: SlotId) -> Option<Arc<Context>> {
        self.takeover.remove(&slot.raw())
    }

    /// Drop every takeover, returning the waiters
    pub fn clear_takeovers(&mut self) -> Vec<Arc<Context>> {
        self.takeover.drain().map(|(_, c)| c).collect()
    }

    /// Forget every steal candidate
    pub fn clear_candidates(&mut self) {
        self.lists.iter_mut().for_each(StealLists::clear);
    }

    // -------------------------------------------------------------------------
    // Assignment
    // -------------------------------------------------------------------------

    fn assign(&mut self, ctx: &Arc<Context>, from_drain: bool) -> Result<PinOutcome> {
        let class = ctx.submit_class();
        let order = ctx.order();

        if let Some(base) = self.alloc_region(class, order) {
            self.claim(ctx, base);
            self.stats.allocated += 1;
            return Ok(PinOutcome::NewId);
        }

        if let Some((victim, base)) = self.steal(ctx, true) {
            victim.set_slot(SlotId::INVALID);
            victim.clear_sched(SchedFlags::REGISTERED | SchedFlags::ENABLED);
            self.stats.steals_unpinned += 1;
            log::debug!(
                "SlotAllocator: context {} stole slot {} from idle context {}",
                ctx.id(),
                base,
                victim.id()
            );
            return Ok(PinOutcome::NewId);
        }

        if from_drain {
            if let Some((victim, base)) = self.steal(ctx, false) {
                victim.set_slot(SlotId::INVALID);
                victim.clear_sched(SchedFlags::REGISTERED | SchedFlags::ENABLED);
                victim.set_sched(SchedFlags::SLOT_STOLEN);
                self.stats.steals_enabled += 1;
                log::debug!(
                    "SlotAllocator: context {} stole slot {} from enabled context {}",
                    ctx.id(),
                    base,
                    victim.id()
                );
                return Ok(PinOutcome::NewIdStolenEnabled { victim, slot: base });
            }
        }

        self.stats.exhausted += 1;
        Err(Error::ResourceExhausted)
    }

    /// Take a victim's block, smallest sufficient order first
    fn steal(&mut self, ctx: &Arc<Context>, unpinned: bool) -> Option<(Arc<Context>, SlotId)> {
        let class = ctx.submit_class();
        let order = ctx.order() as usize;
        let lists = &mut self.lists[class.index()];
        let orders = lists.unpinned.len();

        let (victim, victim_order) = (order..orders).find_map(|o| {
            let list = if unpinned {
                &mut lists.unpinned[o]
            } else {
                &mut lists.no_ref[o]
            };
            list.pop_front().map(|v| (v, o as u32))
        })?;

        let base = victim.slot();
        self.free_region(class, base, victim_order);
        self.claim_at(class, base, ctx.order());
        self.claim(ctx, base);
        Some((victim, base))
    }

    fn claim(&mut self, ctx: &Arc<Context>, base: SlotId) {
        let width = ctx.slot_width();
        for i in 0..width {
            if let Some(owner) = self.owners.get_mut(base.offset(i).index()) {
                *owner = Some(ctx.id());
            }
        }
        ctx.set_slot(base);
    }

    fn alloc_region(&mut self, class: SubmitClass, order: u32) -> Option<SlotId> {
        match class {
            SubmitClass::Single => self.free.pop_first().map(SlotId::new),
            SubmitClass::Multi => {
                let width = 1usize << order;
                let base = (0..self.multi_used.len())
                    .step_by(width)
                    .find(|&b| b + width <= self.multi_used.len() && self.multi_used[b..b + width].iter().all(|u| !u))?;
                self.multi_used[base..base + width].iter_mut().for_each(|u| *u = true);
                Some(SlotId::new(base as u32))
            },
        }
    }

    fn claim_at(&mut self, class: SubmitClass, base: SlotId, order: u32) {
        match class {
            SubmitClass::Single => {
                self.free.remove(&base.raw());
            },
            SubmitClass::Multi => {
                let start = base.index();
                let end = (start + (1usize << order)).min(self.multi_used.len());
                self.multi_used[start..end].iter_mut().for_each(|u| *u = true);
            },
        }
    }

    fn free_region(&mut self, class: SubmitClass, base: SlotId, order: u32) {
        let width = 1u32 << order;
        for i in 0..width {
            if let Some(owner) = self.owners.get_mut(base.offset(i).index()) {
                *owner = None;
            }
        }
        match class {
            SubmitClass::Single => {
                self.free.insert(base.raw());
            },
            SubmitClass::Multi => {
                let start = base.index();
                let end = (start + width as usize).min(self.multi_used.len());
                self.multi_used[start..end].iter_mut().for_each(|u| *u = false);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextDesc, ContextKind};
    use arrayvec::ArrayVec;
    use magma_core::{EngineClass, GpuAddr};

    fn single(id: u32) -> Arc<Context> {
        Arc::new(
            Context::new(
                ContextId::new(id),
                ContextDesc::physical(EngineClass::Render, 0, GpuAddr::new(0x1000 * id as u64)),
            )
            .unwrap(),
        )
    }

    fn parent(id: u32, children: usize) -> Arc<Context> {
        let mut kids = ArrayVec::new();
        for i in 0..children {
            kids.push(GpuAddr::new(0x9000 + i as u64));
        }
        Arc::new(
            Context::new(
                ContextId::new(id),
                ContextDesc {
                    kind: ContextKind::Parent {
                        instance: 0,
                        children: kids,
                    },
                    class: EngineClass::Render,
                    lrca: GpuAddr::new(0x8000),
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_lowest_id_first_and_exhaustion() {
        let mut alloc = SlotAllocator::new(6, 4);
        let a = single(1);
        let b = single(2);
        let c = single(3);
        assert!(alloc.pin(&a, false, 1).unwrap().is_new());
        assert_eq!(a.slot(), SlotId::new(4));
        alloc.pin(&b, false, 1).unwrap();
        assert_eq!(b.slot(), SlotId::new(5));
        assert_eq!(alloc.pin(&c, true, 1).err(), Some(Error::ResourceExhausted));
        assert_eq!(alloc.stats().exhausted, 1);
        assert!(matches!(alloc.pin(&a, false, 1), Ok(PinOutcome::SameId)));
        assert_eq!(a.slot_refs(), 2);
    }

    #[test]
    fn test_steal_from_unpinned() {
        let mut alloc = SlotAllocator::new(1, 0);
        let a = single(1);
        let b = single(2);
        alloc.pin(&a, false, 1).unwrap();
        a.set_sched(SchedFlags::REGISTERED);
        assert!(a.put_ref());
        alloc.unpin(&a);
        assert!(alloc.is_steal_candidate(a.id()));

        assert!(matches!(alloc.pin(&b, false, 1), Ok(PinOutcome::NewId)));
        assert_eq!(b.slot(), SlotId::new(0));
        assert!(!a.slot().is_valid());
        assert!(!a.is_registered());
        assert_eq!(alloc.owner(SlotId::new(0)), Some(b.id()));
        assert_eq!(alloc.stats().steals_unpinned, 1);
    }

    #[test]
    fn test_enabled_victims_only_for_drain() {
        let mut alloc = SlotAllocator::new(1, 0);
        let a = single(1);
        let b = single(2);
        alloc.pin(&a, false, 1).unwrap();
        a.set_sched(SchedFlags::REGISTERED | SchedFlags::ENABLED);
        a.put_ref();
        alloc.unpin(&a);

        assert_eq!(alloc.pin(&b, false, 1).err(), Some(Error::ResourceExhausted));
        match alloc.pin(&b, true, 1).unwrap() {
            PinOutcome::NewIdStolenEnabled { victim, slot } => {
                assert_eq!(victim.id(), a.id());
                assert_eq!(slot, SlotId::new(0));
            },
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(a.sched_flags().contains(SchedFlags::SLOT_STOLEN));
        assert!(!a.is_enabled());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut alloc = SlotAllocator::new(2, 0);
        let a = single(1);
        let b = single(2);
        alloc.pin(&b, false, 1).unwrap();
        b.put_ref();
        alloc.unpin(&b);

        alloc.release(&a);
        alloc.release(&a);
        assert!(alloc.is_steal_candidate(b.id()));
        assert_eq!(alloc.free_slots(SubmitClass::Single), 1);
        assert_eq!(alloc.stats().released, 0);

        alloc.release(&b);
        alloc.release(&b);
        assert_eq!(alloc.free_slots(SubmitClass::Single), 2);
        assert!(!alloc.is_steal_candidate(b.id()));
    }

    #[test]
    fn test_parent_blocks_are_aligned() {
        let mut alloc = SlotAllocator::new(16, 8);
        let p = parent(1, 1);
        let q = parent(2, 3);
        alloc.pin(&p, false, 1).unwrap();
        alloc.pin(&q, false, 1).unwrap();
        assert_eq!(p.slot(), SlotId::new(0));
        assert_eq!(q.slot(), SlotId::new(4));
        assert_eq!(alloc.owner(SlotId::new(7)), Some(q.id()));
        assert_eq!(alloc.free_slots(SubmitClass::Multi), 2);
    }

    #[test]
    fn test_parent_steals_larger_block() {
        let mut alloc = SlotAllocator::new(8, 4);
        let big = parent(1, 3);
        let small = parent(2, 1);
        alloc.pin(&big, false, 1).unwrap();
        big.put_ref();
        alloc.unpin(&big);

        assert!(alloc.pin(&small, false, 1).unwrap().is_new());
        assert_eq!(small.slot(), SlotId::new(0));
        assert_eq!(alloc.owner(SlotId::new(1)), Some(small.id()));
        assert_eq!(alloc.owner(SlotId::new(2)), None);
        assert_eq!(alloc.free_slots(SubmitClass::Multi), 2);
    }
}
