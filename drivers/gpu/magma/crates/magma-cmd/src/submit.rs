//! # Submission and Drain
//!
//! Request creation, the queue bypass and the drain task.
//!
//! A request whose context is pinned, registered and idle on an unstalled
//! engine is submitted directly. Everything else goes through the engine
//! queue, which the drain task empties one request at a time:
//!
//! ```text
//!   dequeue ─▶ pin slot ─▶ register ─▶ tail update ─▶ submit ─▶ next
//!                 │            │                          │
//!                 │            ├─ Busy ──▶ reschedule     └─ Busy ──▶ reschedule
//!                 │            └─ InProgress ──▶ park on context fence
//!                 ├─ exhausted ───────▶ block, kick retire worker
//!                 └─ stole enabled ───▶ block, kick retire worker
//! ```
//!
//! The drain never sleeps. Anything that needs a firmware round trip
//! stashes the request and hands over to the retire worker or to a
//! completion handler.

use alloc::sync::Arc;
use alloc::vec::Vec;

use magma_core::{ContextId, Error, Priority, Result};
use magma_rpc::{Action, ScheduleMode};

use crate::context::{Context, LockedFlags, SchedFlags};
use crate::device::Device;
use crate::engine::{EngineFlags, EngineState, SlotWaiter, StallReason, SubmissionEngine, SubmitClass};
use crate::request::{Request, RequestFlags};
use crate::slot::PinOutcome;

/// Outcome of one drain step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainStep {
    /// A request left the queue
    Progress,
    /// Queue empty
    Idle,
    /// Channel busy; run again later
    Reschedule,
    /// Waiting for the retire worker or a completion
    Blocked,
}

impl Device {
    // =========================================================================
    // Request creation
    // =========================================================================

    /// Create a request on a context
    ///
    /// Pins the context's slot when possible. Under slot pressure the
    /// request is created unpinned and the drain pins it later.
    pub fn create_request(&self, id: ContextId, priority: Priority, tail: u32) -> Result<Arc<Request>> {
        let ctx = self.lookup(id)?;
        let flags = ctx.locked_flags();
        if flags.contains(LockedFlags::DESTROYED) {
            return Err(Error::InvalidState);
        }
        if flags.contains(LockedFlags::BANNED) {
            return Err(Error::Banned);
        }

        let engine = self.engine_for(&ctx);
        let req = Arc::new(Request::new(
            self.next_request_id(),
            id,
            priority,
            tail,
            Arc::clone(ctx.timeline()),
        ));
        if !self.pin_for_request(&ctx, engine)? {
            req.set(RequestFlags::NOT_PINNED);
        }
        if ctx.inc_not_ready() {
            engine.add_not_ready(ctx.slot_width());
        }
        Ok(req)
    }

    /// Take a slot reference for a new request; false defers to the drain
    fn pin_for_request(&self, ctx: &Arc<Context>, engine: &SubmissionEngine) -> Result<bool> {
        let outcome = if ctx.try_get_ref() {
            PinOutcome::SameId
        } else {
            if engine.is_exhausted() {
                return Ok(false);
            }
            let capacity = self.slots.lock().capacity(ctx.submit_class());
            if self
                .config
                .unready_threshold
                .exceeded(engine.not_ready_slots(), capacity)
            {
                log::debug!(
                    "Drain[{}]: too many unready requests, deferring pins",
                    engine.class().name()
                );
                engine.set_flags(EngineFlags::SLOTS_EXHAUSTED);
                return Ok(false);
            }
            match self.pin_slot_blocking(ctx) {
                Ok(outcome) => outcome,
                Err(Error::ResourceExhausted) => {
                    engine.set_flags(EngineFlags::SLOTS_EXHAUSTED);
                    return Ok(false);
                },
                Err(err) => return Err(err),
            }
        };

        if outcome.is_new() || !ctx.is_registered() || ctx.needs_register() {
            match self.pin_descriptor(ctx) {
                Ok(()) | Err(Error::InProgress) => {},
                Err(Error::Busy) => ctx.set_sched(SchedFlags::NEEDS_REGISTER),
                Err(err) => {
                    self.put_slot_ref(ctx);
                    if err == Error::PipeBroken {
                        self.declare_broken();
                    }
                    return Err(err);
                },
            }
        }
        Ok(true)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a request created by [`Device::create_request`]
    pub fn submit_request(&self, req: &Arc<Request>) -> Result<()> {
        if !req.test(RequestFlags::NOT_READY) {
            return Err(Error::InvalidState);
        }
        let Some(ctx) = self.context(req.context()) else {
            req.clear(RequestFlags::NOT_READY);
            req.cancel();
            return Err(Error::NotFound);
        };
        req.clear(RequestFlags::NOT_READY);
        let engine = self.engine_for(&ctx);
        if ctx.dec_not_ready() {
            engine.sub_not_ready(ctx.slot_width());
        }

        {
            let mut st = ctx.state.lock();
            if st
                .flags
                .intersects(LockedFlags::WAIT_FOR_DEREGISTER | LockedFlags::PENDING_DISABLE)
            {
                req.set(RequestFlags::PARKED);
                st.fence.push_back(Arc::clone(req));
                return Ok(());
            }
        }
        self.queue_or_bypass(&ctx, req)
    }

    /// Submit directly if nothing is in the way, else queue for the drain
    pub(crate) fn queue_or_bypass(&self, ctx: &Arc<Context>, req: &Arc<Request>) -> Result<()> {
        let engine = self.engine_for(ctx);
        if engine.is_disabled() {
            req.cancel();
            if req.is_pinned() {
                self.put_slot_ref(ctx);
            }
            return Err(Error::PipeBroken);
        }

        let mut es = engine.state.lock();
        if !req.is_pinned() {
            es.total_unpinned += 1;
            ctx.state.lock().num_unpinned += 1;
        }

        let need_drain = engine.is_exhausted()
            || self.is_submission_disabled()
            || es.stall.is_stalled()
            || !es.queue.is_empty()
            || !req.is_pinned()
            || !ctx.is_registered()
            || ctx.needs_register();
        if need_drain {
            es.enqueue(Arc::clone(req));
            engine.kick_drain();
            return Ok(());
        }

        es.stamp(req);
        match self.add_request(ctx, req) {
            Ok(()) => {
                es.stats.bypassed += 1;
                Ok(())
            },
            Err(Error::Busy) => {
                es.stats.busy += 1;
                es.stall_on(StallReason::AddRequest, Arc::clone(req));
                engine.kick_drain();
                Ok(())
            },
            Err(Error::PipeBroken) => {
                es.stall_on(StallReason::AddRequest, Arc::clone(req));
                drop(es);
                self.declare_broken();
                Err(Error::PipeBroken)
            },
            Err(err) => Err(err),
        }
    }

    /// Publish the tail and tell firmware about a request
    ///
    /// Called with the engine lock held. Nothing is sent for a blocked
    /// context or one with a disable in flight; it is re-enabled once
    /// unblocked.
    pub(crate) fn add_request(&self, ctx: &Arc<Context>, req: &Arc<Request>) -> Result<()> {
        let mut st = ctx.state.lock();
        if st.flags.contains(LockedFlags::BANNED) {
            req.set(RequestFlags::ERROR | RequestFlags::SKIPPED);
            self.activate(ctx, &mut st, req);
            return Ok(());
        }

        let slot = ctx.slot();
        if st.blocked == 0 && !st.flags.contains(LockedFlags::PENDING_DISABLE) {
            if ctx.is_enabled() {
                self.send(&Action::schedule_context(slot))?;
            } else {
                self.send(&Action::schedule_mode(slot, ScheduleMode::Enable))?;
                ctx.set_sched(SchedFlags::ENABLED | SchedFlags::PENDING_ENABLE);
            }
        }

        st.ring_tail = req.tail();
        self.activate(ctx, &mut st, req);
        req.set(RequestFlags::SUBMITTED);
        Ok(())
    }

    // =========================================================================
    // Drain task
    // =========================================================================

    /// Run the drain task of a class until the queue empties or it stalls
    ///
    /// Returns the number of requests that left the queue.
    pub fn run_drain(&self, class: SubmitClass) -> usize {
        let engine = self.engine(class);
        let mut drained = 0;

        loop {
            if engine.is_disabled() || engine.is_blocked() || self.is_submission_disabled() {
                break;
            }
            let mut es = engine.state.lock();
            match self.dequeue_one(engine, &mut es) {
                Ok(DrainStep::Progress) => drained += 1,
                Ok(DrainStep::Idle) | Ok(DrainStep::Blocked) => break,
                Ok(DrainStep::Reschedule) => {
                    engine.kick_drain();
                    break;
                },
                Err(Error::PipeBroken) => {
                    drop(es);
                    self.declare_broken();
                    break;
                },
                Err(err) => {
                    log::warn!("Drain[{}]: stopped: {}", class.name(), err);
                    engine.kick_drain();
                    break;
                },
            }
        }
        drained
    }

    fn dequeue_one(&self, engine: &SubmissionEngine, es: &mut EngineState) -> Result<DrainStep> {
        let req = match es.stalled_request.take() {
            Some(req) => req,
            None => match es.dequeue() {
                Some(req) => req,
                None => return Ok(DrainStep::Idle),
            },
        };
        let Some(ctx) = self.context(req.context()) else {
            req.cancel();
            es.clear_stall();
            return Ok(DrainStep::Progress);
        };
        let class = engine.class().name();

        // Pin
        if !req.is_pinned() {
            let mut batch: Vec<Arc<Request>> = es
                .queued_for(ctx.id())
                .into_iter()
                .filter(|r| !r.is_pinned())
                .collect();
            batch.push(Arc::clone(&req));
            let refs = ctx.state.lock().num_unpinned;
            debug_assert_eq!(refs as usize, batch.len());

            let pinned = self.slots.lock().pin(&ctx, true, refs);
            match pinned {
                Ok(outcome) => {
                    for r in &batch {
                        r.clear(RequestFlags::NOT_PINNED);
                    }
                    es.total_unpinned = es.total_unpinned.saturating_sub(refs);
                    ctx.state.lock().num_unpinned = 0;
                    if es.total_unpinned == 0 {
                        engine.clear_flags(EngineFlags::SLOTS_EXHAUSTED);
                    }
                    if let PinOutcome::NewIdStolenEnabled { victim, slot } = outcome {
                        log::debug!(
                            "Drain[{}]: context {} waits for context {} to stop on slot {}",
                            class,
                            ctx.id(),
                            victim.id(),
                            slot
                        );
                        es.stall_on(StallReason::ScheduleDisable, req);
                        es.stalled_context = Some((victim, slot));
                        engine.block(self.now_ns());
                        engine.kick_retire();
                        return Ok(DrainStep::Blocked);
                    }
                },
                Err(Error::ResourceExhausted) => {
                    log::debug!("Drain[{}]: out of slots, waiting for retire", class);
                    es.stall_on(StallReason::FreeSlots(SlotWaiter::Background), req);
                    engine.set_flags(EngineFlags::SLOTS_EXHAUSTED);
                    engine.block(self.now_ns());
                    engine.kick_retire();
                    return Ok(DrainStep::Blocked);
                },
                Err(err) => {
                    es.stall_on(StallReason::FreeSlots(SlotWaiter::Drain), req);
                    return Err(err);
                },
            }
        }

        // Register
        if !ctx.is_registered() || ctx.needs_register() {
            match self.pin_descriptor(&ctx) {
                Ok(()) => {},
                Err(Error::Busy) => {
                    ctx.set_sched(SchedFlags::NEEDS_REGISTER);
                    es.stats.busy += 1;
                    es.stall_on(StallReason::Register, req);
                    return Ok(DrainStep::Reschedule);
                },
                Err(Error::InProgress) => {
                    es.clear_stall();
                    let mut st = ctx.state.lock();
                    if st.flags.contains(LockedFlags::WAIT_FOR_DEREGISTER) {
                        req.set(RequestFlags::PARKED);
                        st.fence.push_back(req);
                    } else {
                        drop(st);
                        es.enqueue(req);
                    }
                    return Ok(DrainStep::Progress);
                },
                Err(err) => {
                    es.stall_on(StallReason::Register, req);
                    return Err(err);
                },
            }
        }

        // Tail update and submit
        match self.add_request(&ctx, &req) {
            Ok(()) => {
                es.clear_stall();
                es.stats.drained += 1;
                Ok(DrainStep::Progress)
            },
            Err(Error::Busy) => {
                es.stats.busy += 1;
                es.stall_on(StallReason::AddRequest, req);
                Ok(DrainStep::Reschedule)
            },
            Err(err) => {
                es.stall_on(StallReason::AddRequest, req);
                Err(err)
            },
        }
    }
}
