//! # Submission Device
//!
//! Device-scoped handle owning the slot allocator, the context arena and
//! both submission engines. Every operation goes through it; its lifetime
//! is bounded by [`Device::attach`] and [`Device::detach`].
//!
//! ## Lock order
//!
//! engine → allocator → context state. The arena lock is only held long
//! enough to clone an `Arc`. Firmware sends never call back into the
//! device, so they may be issued under any of these locks.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use magma_core::{ContextId, EngineClass, Error, PriorityBucket, RequestId, Result, SlotId};
use magma_hal::{InterruptSource, IrqManager, Platform};
use magma_rpc::{Action, FirmwareChannel, OutstandingCounter, ScheduleMode};
use spin::{Mutex, RwLock};

use crate::config::SubmissionConfig;
use crate::context::{Context, ContextArena, ContextDesc, ContextState, LockedFlags, SchedFlags};
use crate::engine::{EngineStats, SlotWaiter, StallReason, SubmissionEngine, SubmitClass};
use crate::request::Request;
use crate::slot::{AllocatorStats, SlotAllocator};

/// Send attempts of a blocking send before giving up with `Busy`
const BLOCKING_SEND_TRIES: u32 = 8;

/// Passes of [`Device::run_pending`] before it yields
const MAX_PUMP_PASSES: usize = 64;

// =============================================================================
// ENGINE FAILURE RECORD
// =============================================================================

/// An engine failure reported by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineFailure {
    /// Engine class
    pub class: EngineClass,
    /// Engine instance
    pub instance: u32,
    /// Firmware reason code
    pub reason: u32,
}

// =============================================================================
// DEVICE
// =============================================================================

/// Submission device
pub struct Device {
    /// Configuration
    pub(crate) config: SubmissionConfig,
    /// Firmware channel
    pub(crate) fw: Arc<dyn FirmwareChannel>,
    /// Clock and sleep
    pub(crate) platform: Arc<dyn Platform>,
    /// Inbound notification gate
    pub(crate) irq: Mutex<Box<dyn IrqManager>>,
    /// Notifications still owed by the firmware
    pub(crate) outstanding: OutstandingCounter,
    /// Slot allocator and descriptor table
    pub(crate) slots: Mutex<SlotAllocator>,
    /// Live contexts
    pub(crate) contexts: RwLock<ContextArena>,
    /// Submission engines, by class
    pub(crate) engines: [SubmissionEngine; SubmitClass::COUNT],
    /// No firmware traffic allowed (reset in progress or engine dead)
    pub(crate) submission_disabled: AtomicBool,
    /// `PipeBroken` seen under a context lock, declared by the retire worker
    pub(crate) broken_pending: AtomicBool,
    /// Destroyed contexts whose deregister has not been sent yet
    pub(crate) pending_destroy: Mutex<Vec<Arc<Context>>>,
    /// Engine failures reported by firmware
    pub(crate) failures: Mutex<Vec<EngineFailure>>,
    /// Next request id
    next_request: AtomicU64,
    /// Next context id
    next_context: AtomicU32,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("platform", &self.platform.name())
            .field("outstanding", &self.outstanding.get())
            .field("submission_disabled", &self.is_submission_disabled())
            .field("engines", &self.engines)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Bring up a submission device
    pub fn attach(
        config: SubmissionConfig,
        fw: Arc<dyn FirmwareChannel>,
        platform: Arc<dyn Platform>,
        irq: Box<dyn IrqManager>,
    ) -> Result<Self> {
        config.validate()?;
        let slots = SlotAllocator::new(config.num_slots, config.multi_reserved);
        log::info!(
            "Device: attached on {} with {} slots ({} reserved for parents)",
            platform.name(),
            config.num_slots,
            config.multi_reserved
        );
        Ok(Self {
            config,
            fw,
            platform,
            irq: Mutex::new(irq),
            outstanding: OutstandingCounter::new(),
            slots: Mutex::new(slots),
            contexts: RwLock::new(ContextArena::new()),
            engines: [
                SubmissionEngine::new(SubmitClass::Single),
                SubmissionEngine::new(SubmitClass::Multi),
            ],
            submission_disabled: AtomicBool::new(false),
            broken_pending: AtomicBool::new(false),
            pending_destroy: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            next_request: AtomicU64::new(1),
            next_context: AtomicU32::new(1),
        })
    }

    /// Tear the device down, failing every outstanding request
    pub fn detach(&self) {
        self.disable_submission();
        self.cancel_requests();
        let contexts = self.contexts.write().all();
        {
            let mut slots = self.slots.lock();
            for ctx in &contexts {
                slots.release(ctx);
            }
            slots.clear_takeovers();
            slots.clear_candidates();
        }
        self.contexts.write().clear();
        self.pending_destroy.lock().clear();
        self.outstanding.reset();
        log::info!("Device: detached, {} contexts dropped", contexts.len());
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Configuration
    pub fn config(&self) -> &SubmissionConfig {
        &self.config
    }

    /// Look up a live context
    pub fn context(&self, id: ContextId) -> Option<Arc<Context>> {
        self.contexts.read().get(id)
    }

    pub(crate) fn lookup(&self, id: ContextId) -> Result<Arc<Context>> {
        self.context(id).ok_or(Error::NotFound)
    }

    /// Engine serving a class
    pub fn engine(&self, class: SubmitClass) -> &SubmissionEngine {
        &self.engines[class.index()]
    }

    pub(crate) fn engine_for(&self, ctx: &Context) -> &SubmissionEngine {
        self.engine(ctx.submit_class())
    }

    /// Context registered at `slot`
    pub fn slot_owner(&self, slot: SlotId) -> Option<ContextId> {
        self.slots.lock().table.lookup(slot).map(|c| c.id())
    }

    /// Context holding `slot` in the allocator
    pub fn slot_holder(&self, slot: SlotId) -> Option<ContextId> {
        self.slots.lock().owner(slot)
    }

    /// Check if a context is a steal candidate
    pub fn is_steal_candidate(&self, id: ContextId) -> bool {
        self.slots.lock().is_steal_candidate(id)
    }

    /// Number of registered descriptors
    pub fn registered_descriptors(&self) -> usize {
        self.slots.lock().table.registered()
    }

    /// Notifications still owed by the firmware
    pub fn outstanding(&self) -> u32 {
        self.outstanding.get()
    }

    /// Current stall of an engine
    pub fn stall(&self, class: SubmitClass) -> StallReason {
        self.engine(class).stall()
    }

    /// Number of queued requests of an engine
    pub fn queued(&self, class: SubmitClass) -> usize {
        self.engine(class).queued()
    }

    /// Engine statistics
    pub fn engine_stats(&self, class: SubmitClass) -> EngineStats {
        self.engine(class).stats()
    }

    /// Allocator statistics
    pub fn allocator_stats(&self) -> AllocatorStats {
        self.slots.lock().stats()
    }

    /// Engine failures reported so far
    pub fn engine_failures(&self) -> Vec<EngineFailure> {
        self.failures.lock().clone()
    }

    /// Check if firmware traffic is suspended
    pub fn is_submission_disabled(&self) -> bool {
        self.submission_disabled.load(Ordering::Acquire)
    }

    pub(crate) fn disable_submission(&self) {
        if !self.submission_disabled.swap(true, Ordering::AcqRel) {
            log::debug!("Device: submission disabled");
        }
    }

    pub(crate) fn enable_submission(&self) {
        self.submission_disabled.store(false, Ordering::Release);
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId::new(self.next_request.fetch_add(1, Ordering::AcqRel))
    }

    pub(crate) fn now_ns(&self) -> u64 {
        self.platform.time_ns()
    }

    pub(crate) fn irq_enabled(&self) -> bool {
        self.irq.lock().is_enabled(InterruptSource::Firmware)
    }

    /// Check the slot ownership invariants
    ///
    /// Every live context with a slot must be the allocator's owner of that
    /// slot, and no two live contexts may hold the same slot.
    pub fn check_slot_ownership(&self) -> Result<()> {
        let contexts = self.contexts.read().all();
        let slots = self.slots.lock();
        let mut held = Vec::new();
        for ctx in &contexts {
            let slot = ctx.slot();
            if !slot.is_valid() {
                continue;
            }
            if slots.owner(slot) != Some(ctx.id()) || held.contains(&slot) {
                return Err(Error::InvalidState);
            }
            held.push(slot);
        }
        Ok(())
    }

    // =========================================================================
    // Firmware sends
    // =========================================================================

    /// Send an action, counting the notification it is owed
    pub(crate) fn send(&self, action: &Action) -> Result<()> {
        self.fw.send(action)?;
        if action.expects_reply() {
            self.outstanding.inc();
        }
        Ok(())
    }

    /// Send an action, sleeping between `Busy` answers
    ///
    /// Never used from the drain task.
    pub(crate) fn send_blocking(&self, action: &Action) -> Result<()> {
        let mut tries = 0;
        loop {
            match self.send(action) {
                Err(Error::Busy) if tries + 1 < BLOCKING_SEND_TRIES => {
                    tries += 1;
                    self.platform.sleep_ms(1);
                },
                other => return other,
            }
        }
    }

    // =========================================================================
    // Contexts
    // =========================================================================

    /// Create a context
    pub fn create_context(&self, desc: ContextDesc) -> Result<ContextId> {
        let id = ContextId::new(self.next_context.fetch_add(1, Ordering::AcqRel));
        let ctx = Context::new(id, desc)?;
        if ctx.kind().is_parent() && ctx.slot_width() > self.config.multi_reserved {
            return Err(Error::InvalidParameter);
        }
        self.contexts.write().insert(Arc::new(ctx));
        log::debug!("Device: created context {}", id);
        Ok(id)
    }

    /// Stop scheduling an idle context so its slot is cheap to steal
    ///
    /// Returns `Busy` while requests still hold slot references.
    pub fn unpin_context(&self, id: ContextId) -> Result<()> {
        let ctx = self.lookup(id)?;
        if ctx.slot_refs() != 0 {
            return Err(Error::Busy);
        }
        if !ctx.slot().is_valid() {
            return Ok(());
        }
        if !ctx.is_enabled() || self.is_submission_disabled() {
            self.slots.lock().unpin(&ctx);
            return Ok(());
        }

        {
            let mut st = ctx.state.lock();
            st.flags.insert(LockedFlags::UNPIN_PENDING);
            if st.flags.contains(LockedFlags::PENDING_DISABLE) {
                return Ok(());
            }
            st.flags.insert(LockedFlags::PENDING_DISABLE);
        }
        self.send_schedule_disable(&ctx, ctx.slot())
    }

    /// Ban a context; its requests are cancelled
    pub fn ban_context(&self, id: ContextId) -> Result<()> {
        let ctx = self.lookup(id)?;
        let cancel_now = {
            let mut st = ctx.state.lock();
            if st.flags.contains(LockedFlags::BANNED) {
                return Ok(());
            }
            st.flags.insert(LockedFlags::BANNED);
            if st.flags.contains(LockedFlags::PENDING_DISABLE) {
                return Ok(());
            }
            let cancel_now = self.is_submission_disabled() || !ctx.is_enabled();
            if !cancel_now {
                st.flags.insert(LockedFlags::PENDING_DISABLE);
            }
            cancel_now
        };
        log::warn!("Device: context {} banned", id);

        if cancel_now {
            self.cancel_context(&ctx);
            return Ok(());
        }
        let slot = ctx.slot();
        self.check_send(self.send_blocking(&Action::set_preemption_timeout(slot, 1)))?;
        self.send_schedule_disable(&ctx, slot)
    }

    /// Block scheduling of a context; nests
    pub fn block_context(&self, id: ContextId) -> Result<()> {
        let ctx = self.lookup(id)?;
        let disable = {
            let mut st = ctx.state.lock();
            st.blocked += 1;
            let disable = st.blocked == 1
                && ctx.is_enabled()
                && !st.flags.contains(LockedFlags::PENDING_DISABLE)
                && !self.is_submission_disabled();
            if disable {
                st.flags.insert(LockedFlags::PENDING_DISABLE);
            }
            disable
        };
        if disable {
            self.send_schedule_disable(&ctx, ctx.slot())?;
        }
        Ok(())
    }

    /// Undo one [`Device::block_context`]
    pub fn unblock_context(&self, id: ContextId) -> Result<()> {
        let ctx = self.lookup(id)?;
        let enable = {
            let mut st = ctx.state.lock();
            if st.blocked == 0 {
                return Err(Error::InvalidState);
            }
            st.blocked -= 1;
            st.blocked == 0 && self.wants_enable(&ctx, &st)
        };
        if enable {
            self.send_schedule_enable(&ctx)?;
        }
        Ok(())
    }

    /// Destroy a context
    ///
    /// Its requests are cancelled. A registered context is deregistered and
    /// its slot released on the deregister completion; otherwise the slot is
    /// released at once.
    pub fn destroy_context(&self, id: ContextId) -> Result<()> {
        let ctx = self.contexts.write().remove(id).ok_or(Error::NotFound)?;
        ctx.state.lock().flags.insert(LockedFlags::DESTROYED);
        self.cancel_context(&ctx);
        self.retire_context(&ctx);
        if self.deregister_destroyed(&ctx).is_err() {
            self.pending_destroy.lock().push(ctx);
        }
        log::debug!("Device: destroyed context {}", id);
        Ok(())
    }

    /// Retry deregistration of destroyed contexts
    ///
    /// With submission disabled the firmware is being reset, so their slots
    /// are released without a deregister.
    pub fn flush_destroyed(&self) -> usize {
        let pending = core::mem::take(&mut *self.pending_destroy.lock());
        let mut flushed = 0;
        for ctx in pending {
            if self.is_submission_disabled() {
                self.slots.lock().release(&ctx);
                flushed += 1;
            } else if self.deregister_destroyed(&ctx).is_ok() {
                flushed += 1;
            } else {
                self.pending_destroy.lock().push(ctx);
            }
        }
        flushed
    }

    // =========================================================================
    // Scheduling helpers
    // =========================================================================

    /// Check if a context should be re-enabled after a block or disable
    pub(crate) fn wants_enable(&self, ctx: &Context, st: &ContextState) -> bool {
        st.blocked == 0
            && !ctx.is_enabled()
            && ctx.is_registered()
            && !st.flags.intersects(
                LockedFlags::PENDING_DISABLE
                    | LockedFlags::BANNED
                    | LockedFlags::DESTROYED
                    | LockedFlags::UNPIN_PENDING,
            )
            && st.has_pending_work()
            && !self.is_submission_disabled()
    }

    pub(crate) fn send_schedule_enable(&self, ctx: &Context) -> Result<()> {
        self.check_send(self.send_blocking(&Action::schedule_mode(ctx.slot(), ScheduleMode::Enable)))?;
        ctx.set_sched(SchedFlags::ENABLED | SchedFlags::PENDING_ENABLE);
        Ok(())
    }

    /// Send a schedule-disable; `PENDING_DISABLE` must already be set
    pub(crate) fn send_schedule_disable(&self, ctx: &Context, slot: SlotId) -> Result<()> {
        let result = self.send_blocking(&Action::schedule_mode(slot, ScheduleMode::Disable));
        if result.is_err() {
            ctx.state.lock().flags.remove(LockedFlags::PENDING_DISABLE);
        }
        self.check_send(result)
    }

    /// Declare the channel broken on `PipeBroken`
    pub(crate) fn check_send(&self, result: Result<()>) -> Result<()> {
        if result == Err(Error::PipeBroken) {
            self.declare_broken();
        }
        result
    }

    /// Recompute the firmware priority from the inflight buckets
    ///
    /// `fw_priority` only moves once firmware took the change. A refused
    /// send leaves it stale and the retire worker sends it again.
    pub(crate) fn update_priority(&self, ctx: &Context, st: &mut ContextState) {
        let Some(bucket) = st.effective_priority() else {
            return;
        };
        if bucket == st.fw_priority {
            return;
        }
        if !ctx.is_registered() || self.is_submission_disabled() {
            // Carried by the next registration.
            st.fw_priority = bucket;
            return;
        }
        match self.send(&Action::set_priority(ctx.slot(), bucket)) {
            Ok(()) => st.fw_priority = bucket,
            Err(Error::PipeBroken) => {
                self.broken_pending.store(true, Ordering::Release);
                self.engine_for(ctx).kick_retire();
            },
            Err(err) => {
                log::debug!("Device: set priority on context {} deferred: {}", ctx.id(), err);
                self.engine_for(ctx).kick_retire();
            },
        }
    }

    /// Declare a `PipeBroken` recorded under a lock
    ///
    /// Returns true when the channel was declared broken.
    pub(crate) fn take_broken_pending(&self) -> bool {
        if self.broken_pending.swap(false, Ordering::AcqRel) {
            self.declare_broken();
            true
        } else {
            false
        }
    }

    /// Put a request on the active list
    pub(crate) fn activate(&self, ctx: &Context, st: &mut ContextState, req: &Arc<Request>) {
        use crate::request::RequestFlags;

        if req.test(RequestFlags::ACTIVE) {
            return;
        }
        req.set(RequestFlags::ACTIVE);
        let pos = st.requests.partition_point(|r| r.seqno() < req.seqno());
        st.requests.insert(pos, Arc::clone(req));
        st.prio_count[req.priority().bucket().index()] += 1;
        self.update_priority(ctx, st);
    }

    /// Take a request off the active list
    pub(crate) fn deactivate(&self, ctx: &Context, st: &mut ContextState, req: &Arc<Request>) {
        use crate::request::RequestFlags;

        if !req.test(RequestFlags::ACTIVE) {
            return;
        }
        req.clear(RequestFlags::ACTIVE);
        st.requests.retain(|r| !Arc::ptr_eq(r, req));
        let count = &mut st.prio_count[req.priority().bucket().index()];
        *count = count.saturating_sub(1);
        self.update_priority(ctx, st);
    }

    /// Drop a slot reference, linking the context as a steal candidate on
    /// the last one
    pub(crate) fn put_slot_ref(&self, ctx: &Arc<Context>) {
        if ctx.put_ref() {
            self.slots.lock().unpin(ctx);
        }
    }

    // =========================================================================
    // Task pump
    // =========================================================================

    /// Run every kicked task until nothing is left to do
    ///
    /// Retires finished requests, handles inbound notifications, then runs
    /// the retire worker and drain task of each engine that asked for it.
    pub fn run_pending(&self) -> usize {
        let mut work = self.retire_requests();
        if !self.pending_destroy.lock().is_empty() {
            work += self.flush_destroyed();
        }

        for _ in 0..MAX_PUMP_PASSES {
            let mut progress = self.process_events();
            for class in SubmitClass::ALL {
                let engine = self.engine(class);
                let starved = engine.stall() == StallReason::FreeSlots(SlotWaiter::Background);
                if (engine.take_retire_kick() || starved) && self.run_retire_worker(class) {
                    progress += 1;
                }
                if engine.take_drain_kick() {
                    progress += 1 + self.run_drain(class);
                }
            }
            if progress == 0 {
                break;
            }
            work += progress;
        }
        work
    }

    /// Disable submission if a drain has been blocked for too long
    ///
    /// Returns true when the hang timer fired.
    pub fn check_drain_hang(&self) -> bool {
        let now = self.now_ns();
        let hung = self.engines.iter().find(|e| {
            e.blocked_for(now)
                .is_some_and(|t| t > self.config.drain_hang_timeout_ns)
        });
        let Some(engine) = hung else {
            return false;
        };
        log::error!(
            "Drain[{}]: blocked on {:?} for too long, cancelling all work",
            engine.class().name(),
            engine.stall()
        );
        self.disable_submission();
        self.cancel_requests();
        true
    }

    /// Firmware priority bucket currently programmed for a context
    pub fn context_priority(&self, id: ContextId) -> Result<PriorityBucket> {
        Ok(self.lookup(id)?.fw_priority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Harness;
    use magma_rpc::opcode;

    #[test]
    fn test_attach_validates_config() {
        let mut config = SubmissionConfig::with_slots(4);
        config.multi_reserved = 4;
        assert!(Harness::try_with_config(config).is_err());
    }

    #[test]
    fn test_create_parent_needs_reserve() {
        let h = Harness::single_pool(4);
        assert_eq!(
            h.dev.create_context(Harness::parent_desc(1)),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn test_block_and_unblock() {
        let h = Harness::single_pool(2);
        let ctx = h.context();
        let req = h.submit(ctx);
        h.dev.run_pending();
        assert!(h.ctx(ctx).is_enabled());

        h.dev.block_context(ctx).unwrap();
        h.dev.block_context(ctx).unwrap();
        h.dev.run_pending();
        assert!(!h.ctx(ctx).is_enabled());
        assert_eq!(h.fw.count(opcode::SCHED_CONTEXT_MODE_SET), 2);

        h.dev.unblock_context(ctx).unwrap();
        assert!(!h.ctx(ctx).is_enabled());
        h.dev.unblock_context(ctx).unwrap();
        assert!(h.ctx(ctx).is_enabled());
        assert_eq!(h.dev.unblock_context(ctx), Err(Error::InvalidState));

        h.complete(&req);
    }

    #[test]
    fn test_destroy_unregistered_releases_at_once() {
        let h = Harness::single_pool(2);
        let ctx = h.context();
        h.dev.destroy_context(ctx).unwrap();
        assert!(h.dev.context(ctx).is_none());
        assert_eq!(h.dev.destroy_context(ctx), Err(Error::NotFound));
        assert_eq!(h.fw.count(opcode::DEREGISTER_CONTEXT), 0);
    }

    #[test]
    fn test_destroy_registered_waits_for_deregister() {
        let h = Harness::single_pool(2);
        let ctx = h.context();
        let req = h.submit(ctx);
        h.complete(&req);
        h.dev.run_pending();
        let slot = h.ctx(ctx).slot();

        h.fw.set_auto_ack(false);
        h.dev.destroy_context(ctx).unwrap();
        assert_eq!(h.fw.count(opcode::DEREGISTER_CONTEXT), 1);
        assert_eq!(h.dev.slot_holder(slot), Some(ctx));

        h.fw.release_replies();
        h.dev.run_pending();
        assert_eq!(h.dev.slot_holder(slot), None);
        assert_eq!(h.dev.slot_owner(slot), None);
        assert_eq!(h.dev.outstanding(), 0);
    }
}
