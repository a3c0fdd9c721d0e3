//! # Retire Worker
//!
//! Retires finished requests and resumes a drain that stopped for slots.
//!
//! The drain hands over here in two cases: the slot pool is exhausted, or
//! a slot was stolen from a context firmware is still scheduling. In the
//! second case the worker sends the victim's schedule-disable, which the
//! drain itself may not wait for.

use alloc::sync::Arc;
use alloc::vec::Vec;

use magma_rpc::{Action, ScheduleMode};

use crate::context::{Context, LockedFlags, SchedFlags};
use crate::device::Device;
use crate::engine::{SlotWaiter, StallReason, SubmissionEngine, SubmitClass};
use crate::request::RequestFlags;

impl Device {
    /// Retire finished requests on every context
    pub fn retire_requests(&self) -> usize {
        let contexts = self.contexts.read().all();
        contexts.iter().map(|ctx| self.retire_context(ctx)).sum()
    }

    /// Retire the finished prefix of a context's active list
    pub(crate) fn retire_context(&self, ctx: &Arc<Context>) -> usize {
        let retired: Vec<_> = {
            let mut st = ctx.state.lock();
            let mut retired = Vec::new();
            while st.requests.front().is_some_and(|r| r.is_done()) {
                if let Some(req) = st.requests.pop_front() {
                    req.clear(RequestFlags::ACTIVE);
                    let count = &mut st.prio_count[req.priority().bucket().index()];
                    *count = count.saturating_sub(1);
                    retired.push(req);
                }
            }
            // Also resends a priority change firmware refused.
            self.update_priority(ctx, &mut st);
            retired
        };

        for req in &retired {
            req.set(RequestFlags::RETIRED);
            if req.is_pinned() {
                self.put_slot_ref(ctx);
            }
        }
        retired.len()
    }

    /// Run one pass of the retire worker for a class
    ///
    /// Returns true when it made progress.
    pub fn run_retire_worker(&self, class: SubmitClass) -> bool {
        let engine = self.engine(class);
        if self.take_broken_pending() {
            return true;
        }
        let mut progress = false;

        if engine.stall() == StallReason::ScheduleDisable {
            progress |= self.retire_sched_disable(engine);
        }
        let retired = self.retire_requests();
        progress |= retired > 0;

        let mut es = engine.state.lock();
        if es.stall == StallReason::FreeSlots(SlotWaiter::Background)
            && (retired > 0 || self.slots.lock().has_candidates(class))
        {
            log::debug!("Drain[{}]: slots may be free, resuming", class.name());
            es.stall = StallReason::FreeSlots(SlotWaiter::Drain);
            drop(es);
            engine.unblock();
            engine.kick_drain();
            progress = true;
        }
        progress
    }

    /// Disable the context whose enabled slot the drain stole
    fn retire_sched_disable(&self, engine: &SubmissionEngine) -> bool {
        let stalled = engine.state.lock().stalled_context.clone();
        let Some((victim, slot)) = stalled else {
            let mut es = engine.state.lock();
            if es.stall == StallReason::ScheduleDisable {
                es.stall = StallReason::Register;
            }
            drop(es);
            engine.unblock();
            engine.kick_drain();
            return true;
        };
        if victim.sched_flags().contains(SchedFlags::BLOCK_DRAIN) {
            return false;
        }

        let in_flight = {
            let mut st = victim.state.lock();
            let in_flight = st.flags.contains(LockedFlags::PENDING_DISABLE);
            st.flags.insert(LockedFlags::PENDING_DISABLE);
            in_flight
        };
        victim.set_sched(SchedFlags::BLOCK_DRAIN);
        if in_flight {
            return true;
        }

        let result = self.send_blocking(&Action::schedule_mode(slot, ScheduleMode::Disable));
        if let Err(err) = result {
            victim.clear_sched(SchedFlags::BLOCK_DRAIN);
            victim.state.lock().flags.remove(LockedFlags::PENDING_DISABLE);
            log::warn!(
                "Drain[{}]: disable of context {} failed: {}",
                engine.class().name(),
                victim.id(),
                err
            );
            if self.check_send(Err(err)).is_err() && !engine.is_disabled() {
                engine.kick_retire();
            }
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::Harness;
    use crate::{RequestFlags, SlotWaiter, StallReason, SubmitClass};
    use magma_core::{Priority, PriorityBucket};
    use magma_rpc::opcode;

    #[test]
    fn test_retire_in_seqno_order() {
        let h = Harness::single_pool(2);
        let ctx = h.context();
        let a = h.submit(ctx);
        let b = h.submit(ctx);
        let c = h.submit(ctx);
        h.dev.run_pending();
        assert_eq!(h.ctx(ctx).slot_refs(), 3);

        h.complete(&a);
        assert_eq!(h.dev.retire_requests(), 1);
        assert!(a.test(RequestFlags::RETIRED));
        assert!(!b.test(RequestFlags::RETIRED));
        assert_eq!(h.ctx(ctx).slot_refs(), 2);
        assert!(!h.dev.is_steal_candidate(ctx));

        h.complete(&c);
        assert_eq!(h.dev.retire_requests(), 2);
        assert_eq!(h.ctx(ctx).slot_refs(), 0);
        assert!(h.dev.is_steal_candidate(ctx));
    }

    #[test]
    fn test_priority_tracks_inflight_buckets() {
        let h = Harness::single_pool(2);
        let ctx = h.context();
        let normal = h.submit_prio(ctx, Priority::NORMAL);
        assert_eq!(h.dev.context_priority(ctx), Ok(PriorityBucket::KmdNormal));
        let high = h.submit_prio(ctx, Priority::DISPLAY);
        assert_eq!(h.dev.context_priority(ctx), Ok(PriorityBucket::KmdHigh));
        assert_eq!(h.fw.count(magma_rpc::opcode::SET_CONTEXT_PRIORITY), 1);

        h.complete(&normal);
        h.dev.retire_requests();
        assert_eq!(h.dev.context_priority(ctx), Ok(PriorityBucket::KmdHigh));
        h.complete(&high);
        h.dev.retire_requests();
        assert_eq!(h.ctx(ctx).prio_counts(), [0; PriorityBucket::COUNT]);
        assert_eq!(h.dev.context_priority(ctx), Ok(PriorityBucket::KmdHigh));
    }

    #[test]
    fn test_refused_priority_change_is_resent() {
        let h = Harness::single_pool(2);
        let ctx = h.context();
        let high = h.submit_prio(ctx, Priority::DISPLAY);
        let _normal = h.submit_prio(ctx, Priority::NORMAL);
        assert_eq!(h.dev.context_priority(ctx), Ok(PriorityBucket::KmdHigh));
        let programmed = |h: &Harness| {
            h.fw.sent()
                .iter()
                .filter(|a| a.opcode() == opcode::SET_CONTEXT_PRIORITY)
                .map(|a| a.words()[2])
                .last()
        };

        h.complete(&high);
        h.fw.inject_busy(1);
        h.dev.retire_requests();
        assert_eq!(h.fw.busy_hits(), 1);
        assert_eq!(h.dev.context_priority(ctx), Ok(PriorityBucket::KmdHigh));
        assert_eq!(programmed(&h), Some(PriorityBucket::KmdHigh.to_firmware()));

        h.dev.run_pending();
        assert_eq!(h.dev.context_priority(ctx), Ok(PriorityBucket::KmdNormal));
        assert_eq!(programmed(&h), Some(PriorityBucket::KmdNormal.to_firmware()));
        assert_eq!(h.fw.count(opcode::SET_CONTEXT_PRIORITY), 2);
    }

    #[test]
    fn test_broken_priority_change_disables_engine() {
        let h = Harness::single_pool(2);
        let ctx = h.context();
        let high = h.submit_prio(ctx, Priority::DISPLAY);
        let normal = h.submit_prio(ctx, Priority::NORMAL);

        h.complete(&high);
        h.fw.set_broken(true);
        h.dev.run_pending();
        assert!(h.dev.engine(SubmitClass::Single).is_disabled());
        assert!(h.dev.is_submission_disabled());
        assert!(normal.is_cancelled());
        assert_eq!(h.ctx(ctx).slot_refs(), 0);
    }

    #[test]
    fn test_worker_waits_for_candidates() {
        let h = Harness::single_pool(1);
        let a = h.context();
        let b = h.context();
        let hog = h.submit(a);
        let waiting = h.submit(b);
        h.dev.run_pending();
        let background = StallReason::FreeSlots(SlotWaiter::Background);
        assert_eq!(h.dev.stall(SubmitClass::Single), background);

        assert!(!h.dev.run_retire_worker(SubmitClass::Single));
        assert_eq!(h.dev.stall(SubmitClass::Single), background);
        assert!(h.dev.engine(SubmitClass::Single).is_blocked());

        h.complete(&hog);
        assert!(h.dev.run_retire_worker(SubmitClass::Single));
        assert_eq!(
            h.dev.stall(SubmitClass::Single),
            StallReason::FreeSlots(SlotWaiter::Drain)
        );
        assert!(!h.dev.engine(SubmitClass::Single).is_blocked());
        h.dev.run_pending();
        assert!(waiting.is_pinned());
    }
}
