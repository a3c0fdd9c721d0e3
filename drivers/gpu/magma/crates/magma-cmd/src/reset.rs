//! # Reset and Cancellation
//!
//! Firmware reset runs in three steps:
//!
//! 1. [`Device::reset_prepare`]: stop submission and notifications, flush
//!    what the firmware already sent, forget every acknowledgement that
//!    will never arrive
//! 2. [`Device::reset`]: unwind unfinished requests back onto the queues
//!    and forget every registration
//! 3. [`Device::reset_finish`]: resume
//!
//! When the firmware cannot be recovered, [`Device::declare_broken`]
//! disables the engines and fails every request instead.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use magma_core::{Error, Result};
use magma_hal::InterruptSource;

use crate::context::{Context, LockedFlags, SchedFlags};
use crate::device::Device;
use crate::engine::EngineFlags;
use crate::request::{Request, RequestFlags};
use crate::slot::SlotAllocator;

/// Scheduling flags that do not survive a firmware reset
const RESET_SCHED: SchedFlags = SchedFlags::REGISTERED
    .union(SchedFlags::ENABLED)
    .union(SchedFlags::PENDING_ENABLE)
    .union(SchedFlags::SLOT_STOLEN)
    .union(SchedFlags::BLOCK_DRAIN);

impl Device {
    // =========================================================================
    // Reset
    // =========================================================================

    /// Quiesce before a firmware reset
    pub fn reset_prepare(&self) {
        log::info!("Reset: preparing");
        self.disable_submission();
        if let Err(err) = self.irq.lock().disable(InterruptSource::Firmware) {
            log::warn!("Reset: could not mask firmware notifications: {}", err);
        }

        for _ in 0..self.config.reset_flush_passes {
            self.dispatch_events();
            if self.outstanding.is_idle() {
                break;
            }
            self.platform.sleep_ms(u64::from(self.config.reset_wait_ms));
        }
        self.dispatch_events();

        self.flush_destroyed();
        self.scrub_pending();
    }

    /// Drop every pending acknowledgement
    fn scrub_pending(&self) {
        let contexts = self.contexts.read().all();
        for ctx in &contexts {
            if ctx.take_sched(SchedFlags::PENDING_ENABLE) {
                self.outstanding.dec();
            }

            let (disabling, banned, unpin, fence) = {
                let mut st = ctx.state.lock();
                let disabling = st.flags.contains(LockedFlags::PENDING_DISABLE);
                let banned = st.flags.contains(LockedFlags::BANNED);
                let unpin = st.flags.contains(LockedFlags::UNPIN_PENDING);
                st.flags.remove(LockedFlags::PENDING_DISABLE | LockedFlags::UNPIN_PENDING);
                let fence = if disabling && !banned {
                    core::mem::take(&mut st.fence)
                } else {
                    VecDeque::new()
                };
                (disabling, banned, unpin, fence)
            };
            if !disabling {
                continue;
            }
            self.outstanding.dec();
            ctx.clear_sched(SchedFlags::ENABLED | SchedFlags::SLOT_STOLEN | SchedFlags::BLOCK_DRAIN);
            if banned {
                self.cancel_context(ctx);
            } else {
                self.release_fence(ctx, fence);
                if unpin {
                    self.slots.lock().unpin(ctx);
                }
            }
        }

        let waiters = {
            let mut slots = self.slots.lock();
            let dropped = self.forget_deregisters(&mut slots);
            if dropped > 0 {
                log::debug!("Reset: dropped {} pending deregisters", dropped);
            }
            slots.clear_takeovers()
        };
        for waiter in waiters {
            waiter.set_sched(SchedFlags::NEEDS_REGISTER);
            let fence = {
                let mut st = waiter.state.lock();
                st.flags.remove(LockedFlags::WAIT_FOR_DEREGISTER);
                core::mem::take(&mut st.fence)
            };
            self.release_fence(&waiter, fence);
        }
    }

    /// Unregister every slot with a deregister outstanding
    fn forget_deregisters(&self, slots: &mut SlotAllocator) -> usize {
        let pending = slots.table.deregistering();
        for &slot in &pending {
            self.outstanding.dec();
            if let Some(old) = slots.table.unregister(slot) {
                if old.is_destroyed() && old.slot() == slot {
                    slots.release(&old);
                }
            }
        }
        pending.len()
    }

    /// Forget every registration, relinking idle contexts as disabled
    fn forget_registrations(&self, contexts: &[Arc<Context>]) {
        let mut slots = self.slots.lock();
        self.forget_deregisters(&mut slots);
        let dropped = slots.table.clear();
        slots.clear_takeovers();
        slots.clear_candidates();
        for ctx in contexts {
            ctx.clear_sched(RESET_SCHED);
            slots.unpin(ctx);
        }
        log::debug!("Reset: forgot {} registrations", dropped);
    }

    /// Unwind every context after a firmware reset
    ///
    /// With `stalled` the first unfinished request that already started is
    /// blamed and skipped; everything after it is replayed.
    pub fn reset(&self, stalled: bool) {
        let contexts = self.contexts.read().all();
        let replayed: usize = contexts
            .iter()
            .map(|ctx| self.reset_context(ctx, stalled))
            .sum();

        // Unpinned counts are rebuilt from what is still queued.
        for ctx in &contexts {
            ctx.state.lock().num_unpinned = 0;
        }

        for engine in &self.engines {
            {
                let mut es = engine.state.lock();
                if let Some(req) = es.stalled_request.take() {
                    es.enqueue(req);
                }
                es.clear_stall();
                let unpinned: Vec<_> = es.queue.values().filter(|r| !r.is_pinned()).cloned().collect();
                es.total_unpinned = unpinned.len() as u32;
                for req in &unpinned {
                    if let Some(ctx) = self.context(req.context()) {
                        ctx.state.lock().num_unpinned += 1;
                    }
                }
            }
            engine.unblock();
        }

        self.forget_registrations(&contexts);
        log::info!("Reset: {} requests queued for replay", replayed);
    }

    /// Put a context's unfinished requests back on its engine queue
    pub(crate) fn reset_context(&self, ctx: &Arc<Context>, stalled: bool) -> usize {
        ctx.clear_sched(SchedFlags::ENABLED);

        let replay: Vec<Arc<Request>> = {
            let mut st = ctx.state.lock();
            let requests: Vec<_> = st.requests.iter().cloned().collect();
            let mut replay = Vec::new();
            let mut head = st.ring_head;
            let mut blamed = false;

            for req in requests {
                if req.is_done() {
                    if req.is_completed() {
                        head = req.tail();
                    }
                    continue;
                }
                if !blamed {
                    blamed = true;
                    if stalled && req.is_started() {
                        log::warn!("Reset: request {} of context {} is guilty", req.id(), ctx.id());
                        req.set(RequestFlags::ERROR | RequestFlags::SKIPPED);
                        continue;
                    }
                }
                self.deactivate(ctx, &mut st, &req);
                req.clear(RequestFlags::SUBMITTED);
                replay.push(req);
            }
            st.ring_head = head;
            st.ring_tail = head;
            replay
        };

        let count = replay.len();
        if count > 0 {
            let engine = self.engine_for(ctx);
            let mut es = engine.state.lock();
            for req in replay {
                es.enqueue(req);
                es.stats.replayed += 1;
            }
            engine.kick_drain();
        }
        count
    }

    /// Resume after a firmware reset
    pub fn reset_finish(&self) {
        self.outstanding.reset();
        if self.engines.iter().any(|e| e.is_disabled()) {
            log::error!("Reset: engine disabled, submission stays off");
        } else {
            self.enable_submission();
        }
        if let Err(err) = self.irq.lock().enable(InterruptSource::Firmware) {
            log::warn!("Reset: could not unmask firmware notifications: {}", err);
        }

        for engine in &self.engines {
            {
                let mut es = engine.state.lock();
                if let Some(req) = es.stalled_request.take() {
                    es.enqueue(req);
                }
                es.clear_stall();
            }
            engine.unblock();
            engine.kick_drain();
        }
        log::info!("Reset: done");
    }

    /// Wait for every acknowledgement owed by the firmware
    ///
    /// Past the timeout the channel is declared broken.
    pub fn wait_for_idle(&self, timeout_ms: u64) -> Result<()> {
        let deadline = self
            .now_ns()
            .saturating_add(timeout_ms.saturating_mul(1_000_000));
        loop {
            self.run_pending();
            if self.outstanding.is_idle() {
                return Ok(());
            }
            if self.now_ns() >= deadline {
                log::error!(
                    "Reset: {} acknowledgements still outstanding after {} ms",
                    self.outstanding.get(),
                    timeout_ms
                );
                self.declare_broken();
                return Err(Error::Timeout);
            }
            self.platform.sleep_ms(1);
        }
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Give up on the firmware: disable the engines and fail every request
    pub fn declare_broken(&self) {
        log::error!("Reset: firmware channel broken, disabling submission");
        for engine in &self.engines {
            engine.set_flags(EngineFlags::DISABLED);
        }
        self.disable_submission();
        self.cancel_requests();
    }

    /// Fail every queued and in-flight request
    pub fn cancel_requests(&self) {
        let contexts = self.contexts.read().all();
        self.forget_registrations(&contexts);

        let mut cancelled = 0;
        for engine in &self.engines {
            let removed: Vec<Arc<Request>> = {
                let mut es = engine.state.lock();
                let mut removed: Vec<_> = core::mem::take(&mut es.queue).into_values().collect();
                removed.extend(es.stalled_request.take());
                es.clear_stall();
                es.total_unpinned = 0;
                es.stats.cancelled += removed.len() as u64;
                removed
            };
            engine.unblock();
            engine.clear_flags(EngineFlags::SLOTS_EXHAUSTED);

            for req in removed {
                req.cancel();
                cancelled += 1;
                if req.is_pinned() {
                    if let Some(ctx) = self.context(req.context()) {
                        self.put_slot_ref(&ctx);
                    }
                }
            }
        }

        for ctx in &contexts {
            let fence = {
                let mut st = ctx.state.lock();
                st.flags.remove(
                    LockedFlags::PENDING_DISABLE
                        | LockedFlags::UNPIN_PENDING
                        | LockedFlags::WAIT_FOR_DEREGISTER,
                );
                st.num_unpinned = 0;
                for req in st.requests.iter().filter(|r| !r.is_done()) {
                    req.cancel();
                    cancelled += 1;
                }
                core::mem::take(&mut st.fence)
            };
            cancelled += self.cancel_fence(ctx, fence);
        }

        self.outstanding.reset();
        self.retire_requests();
        self.flush_destroyed();
        log::warn!("Reset: cancelled {} requests", cancelled);
    }

    /// Cancel every request of one context
    pub(crate) fn cancel_context(&self, ctx: &Arc<Context>) -> usize {
        let engine = self.engine_for(ctx);
        let removed = {
            let mut es = engine.state.lock();
            let mut removed = es.remove_context(ctx.id());
            if es
                .stalled_request
                .as_ref()
                .is_some_and(|r| r.context() == ctx.id())
            {
                removed.extend(es.stalled_request.take());
                es.clear_stall();
                engine.unblock();
                engine.kick_drain();
            }
            let unpinned = removed.iter().filter(|r| !r.is_pinned()).count() as u32;
            es.total_unpinned = es.total_unpinned.saturating_sub(unpinned);
            if es.total_unpinned == 0 {
                engine.clear_flags(EngineFlags::SLOTS_EXHAUSTED);
            }
            es.stats.cancelled += removed.len() as u64;
            removed
        };

        let mut cancelled = removed.len();
        for req in &removed {
            req.cancel();
            if req.is_pinned() {
                self.put_slot_ref(ctx);
            }
        }

        let fence = {
            let mut st = ctx.state.lock();
            st.num_unpinned = 0;
            for req in st.requests.iter().filter(|r| !r.is_done()) {
                req.cancel();
                cancelled += 1;
            }
            core::mem::take(&mut st.fence)
        };
        cancelled += self.cancel_fence(ctx, fence);
        self.retire_context(ctx);

        if cancelled > 0 {
            log::debug!("Reset: cancelled {} requests of context {}", cancelled, ctx.id());
        }
        cancelled
    }

    fn cancel_fence(&self, ctx: &Arc<Context>, fence: VecDeque<Arc<Request>>) -> usize {
        let count = fence.len();
        for req in fence {
            req.cancel();
            if req.is_pinned() {
                self.put_slot_ref(ctx);
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::Harness;
    use crate::{RequestFlags, StallReason, SubmitClass};
    use magma_core::Error;
    use magma_rpc::opcode;

    #[test]
    fn test_reset_replays_after_last_completed() {
        let h = Harness::single_pool(2);
        let ctx = h.context();
        let done = h.submit(ctx);
        let pending = h.submit(ctx);
        h.dev.run_pending();
        h.complete(&done);

        h.dev.reset_prepare();
        h.dev.reset(false);
        assert!(!done.test(RequestFlags::QUEUED));
        assert!(pending.test(RequestFlags::QUEUED));
        assert!(!h.ctx(ctx).is_registered());
        assert_eq!(h.ctx(ctx).ring_head(), done.tail());
        assert_eq!(h.dev.engine_stats(SubmitClass::Single).replayed, 1);

        h.fw.clear_sent();
        h.dev.reset_finish();
        h.dev.run_pending();
        assert!(pending.test(RequestFlags::SUBMITTED));
        assert!(done.test(RequestFlags::RETIRED));
        assert_eq!(
            h.fw.sent_opcodes(),
            vec![opcode::REGISTER_CONTEXT, opcode::SCHED_CONTEXT_MODE_SET]
        );
        assert_eq!(h.ctx(ctx).ring_tail(), pending.tail());
    }

    #[test]
    fn test_reset_recounts_unpinned_requests() {
        let h = Harness::single_pool(1);
        let a = h.context();
        let hog = h.submit(a);
        h.dev.run_pending();

        let b = h.context();
        let first = h.submit(b);
        let second = h.submit(b);
        assert!(!first.is_pinned() && !second.is_pinned());
        assert_eq!(h.ctx(b).unpinned_requests(), 2);
        h.complete(&hog);
        h.dev.retire_requests();

        h.dev.reset_prepare();
        h.dev.reset(false);
        assert_eq!(h.ctx(b).unpinned_requests(), 2);
        assert_eq!(h.ctx(a).unpinned_requests(), 0);
        h.dev.reset_finish();
        h.dev.run_pending();

        assert!(first.test(RequestFlags::SUBMITTED));
        assert!(second.test(RequestFlags::SUBMITTED));
        assert_eq!(h.ctx(b).unpinned_requests(), 0);
        assert_eq!(h.ctx(b).slot_refs(), 2);

        h.complete(&second);
        h.dev.run_pending();
        assert_eq!(h.ctx(b).slot_refs(), 0);
        h.dev.check_slot_ownership().unwrap();
    }

    #[test]
    fn test_stalled_reset_skips_guilty() {
        let h = Harness::single_pool(2);
        let ctx = h.context();
        let hung = h.submit(ctx);
        let next = h.submit(ctx);
        h.dev.run_pending();
        h.ctx(ctx).timeline().mark_started(hung.seqno());

        h.dev.reset_prepare();
        h.dev.reset(true);
        assert!(hung.is_error());
        assert!(hung.test(RequestFlags::SKIPPED));
        assert!(next.test(RequestFlags::QUEUED));
        assert!(!next.is_error());
        h.dev.reset_finish();
        h.dev.run_pending();
        assert!(hung.test(RequestFlags::RETIRED));
        assert!(next.test(RequestFlags::SUBMITTED));
    }

    #[test]
    fn test_prepare_scrubs_lost_acknowledgements() {
        let h = Harness::single_pool(2);
        h.fw.set_auto_ack(false);
        let ctx = h.context();
        let req = h.submit(ctx);
        h.dev.block_context(ctx).unwrap();
        assert_eq!(h.dev.outstanding(), 2);

        // Firmware dies without answering.
        h.fw.discard_replies();
        h.dev.reset_prepare();
        assert_eq!(h.dev.outstanding(), 0);
        assert!(!h.ctx(ctx).is_enabled());
        assert!(h.ctx(ctx).locked_flags().is_empty());

        h.dev.reset(false);
        h.dev.reset_finish();
        h.dev.unblock_context(ctx).unwrap();
        h.dev.run_pending();
        assert!(req.test(RequestFlags::SUBMITTED));
    }

    #[test]
    fn test_wait_for_idle_times_out() {
        let h = Harness::single_pool(2);
        h.fw.set_auto_ack(false);
        let ctx = h.context();
        let req = h.submit(ctx);
        assert_eq!(h.dev.wait_for_idle(5), Err(Error::Timeout));
        assert!(h.dev.engine(SubmitClass::Single).is_disabled());
        assert!(req.is_cancelled());
        assert_eq!(h.dev.outstanding(), 0);

        // A dead engine refuses new work.
        let late = h.create(ctx);
        assert_eq!(h.dev.submit_request(&late), Err(Error::PipeBroken));
        assert!(late.is_cancelled());
    }

    #[test]
    fn test_pipe_broken_cancels_everything() {
        let h = Harness::single_pool(2);
        let a = h.context();
        let first = h.submit(a);
        h.dev.run_pending();
        h.fw.set_broken(true);
        let second = h.create(a);
        assert_eq!(h.dev.submit_request(&second), Err(Error::PipeBroken));

        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(h.dev.is_submission_disabled());
        assert_eq!(h.dev.stall(SubmitClass::Single), StallReason::None);
        assert_eq!(h.ctx(a).slot_refs(), 0);

        h.dev.reset_prepare();
        h.dev.reset(false);
        h.dev.reset_finish();
        assert!(h.dev.is_submission_disabled());
    }
}
