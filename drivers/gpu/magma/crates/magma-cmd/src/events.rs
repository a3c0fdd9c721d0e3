//! # Firmware Notifications
//!
//! Completion handlers for inbound firmware messages. Each handler checks
//! that the addressed context actually expects the notification before
//! touching any state; unexpected messages are logged and dropped.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use magma_core::{EngineClass, Error, ProtocolError, Result, SlotId};
use magma_rpc::Event;

use crate::context::{Context, LockedFlags, SchedFlags};
use crate::device::{Device, EngineFailure};
use crate::engine::StallReason;
use crate::request::{Request, RequestFlags};

impl Device {
    /// Pull and handle inbound messages while notifications are enabled
    pub fn process_events(&self) -> usize {
        if !self.irq_enabled() {
            return 0;
        }
        self.dispatch_events()
    }

    /// Pull and handle every queued inbound message
    pub(crate) fn dispatch_events(&self) -> usize {
        let mut handled = 0;
        while let Some(msg) = self.fw.receive() {
            if let Err(err) = Event::parse(&msg).and_then(|event| self.handle_event(event)) {
                log::warn!("Events: dropped message {:x?}: {}", msg.as_slice(), err);
            }
            handled += 1;
        }
        handled
    }

    /// Handle one parsed notification
    pub fn handle_event(&self, event: Event) -> Result<()> {
        match event {
            Event::DeregisterDone { slot } => self.deregister_done(slot),
            Event::ScheduleDone { slot } => self.schedule_done(slot),
            Event::ContextReset { slot } => self.context_reset(slot),
            Event::EngineFailure {
                class,
                instance,
                reason,
            } => self.engine_failure(class, instance, reason),
        }
    }

    // =========================================================================
    // Deregister done
    // =========================================================================

    /// The descriptor at `slot` is gone from firmware
    ///
    /// Hands the slot to the context waiting to take it over, or releases a
    /// destroyed owner.
    pub fn deregister_done(&self, slot: SlotId) -> Result<()> {
        let mut slots = self.slots.lock();
        if !slots.table.is_registered(slot) {
            return Err(ProtocolError::NoContext(slot.raw()).into());
        }
        if !slots.table.is_deregistering(slot) {
            return Err(ProtocolError::UnexpectedState(slot.raw()).into());
        }
        let old = slots.table.unregister(slot);
        self.outstanding.dec();

        if let Some(waiter) = slots.take_takeover(slot) {
            let mut result = Ok(());
            if waiter.slot() == slot {
                if self.is_submission_disabled() {
                    waiter.set_sched(SchedFlags::NEEDS_REGISTER);
                } else {
                    result = self.register_locked(&mut slots, &waiter);
                    if result == Err(Error::Busy) {
                        waiter.set_sched(SchedFlags::NEEDS_REGISTER);
                    }
                }
            }
            let fence = {
                let mut st = waiter.state.lock();
                st.flags.remove(LockedFlags::WAIT_FOR_DEREGISTER);
                core::mem::take(&mut st.fence)
            };
            drop(slots);

            log::debug!(
                "Registration: slot {} handed over to context {}",
                slot,
                waiter.id()
            );
            if result == Err(Error::PipeBroken) {
                self.declare_broken();
            }
            self.release_fence(&waiter, fence);
        } else if let Some(old) = old {
            if old.is_destroyed() && old.slot() == slot {
                slots.release(&old);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Schedule done
    // =========================================================================

    /// A schedule enable or disable on `slot` took effect
    pub fn schedule_done(&self, slot: SlotId) -> Result<()> {
        let ctx = self
            .slots
            .lock()
            .table
            .lookup(slot)
            .ok_or(ProtocolError::NoContext(slot.raw()))?;

        // Replies arrive in order, so an outstanding enable is answered first.
        if ctx.take_sched(SchedFlags::PENDING_ENABLE) {
            self.outstanding.dec();
            return Ok(());
        }

        let (banned, unpin, fence) = {
            let mut st = ctx.state.lock();
            if !st.flags.contains(LockedFlags::PENDING_DISABLE) {
                return Err(ProtocolError::UnexpectedState(slot.raw()).into());
            }
            st.flags.remove(LockedFlags::PENDING_DISABLE);
            let banned = st.flags.contains(LockedFlags::BANNED);
            let unpin = st.flags.contains(LockedFlags::UNPIN_PENDING);
            st.flags.remove(LockedFlags::UNPIN_PENDING);
            let fence = if banned {
                VecDeque::new()
            } else {
                core::mem::take(&mut st.fence)
            };
            (banned, unpin, fence)
        };
        ctx.clear_sched(SchedFlags::SLOT_STOLEN);
        if ctx.slot() == slot {
            ctx.clear_sched(SchedFlags::ENABLED);
        }
        self.outstanding.dec();

        if ctx.take_sched(SchedFlags::BLOCK_DRAIN) {
            let engine = self.engine_for(&ctx);
            {
                let mut es = engine.state.lock();
                if es.stall == StallReason::ScheduleDisable {
                    es.stall = StallReason::Register;
                    es.stalled_context = None;
                }
            }
            engine.unblock();
            engine.kick_drain();
        }

        if banned {
            self.cancel_context(&ctx);
            return Ok(());
        }
        self.release_fence(&ctx, fence);
        if unpin {
            self.slots.lock().unpin(&ctx);
            return Ok(());
        }

        let enable = {
            let st = ctx.state.lock();
            self.wants_enable(&ctx, &st)
        };
        if enable {
            self.send_schedule_enable(&ctx)?;
        }
        Ok(())
    }

    // =========================================================================
    // Context reset and engine failure
    // =========================================================================

    /// Firmware reset the context at `slot`
    pub fn context_reset(&self, slot: SlotId) -> Result<()> {
        let ctx = self
            .slots
            .lock()
            .table
            .lookup(slot)
            .ok_or(ProtocolError::NoContext(slot.raw()))?;
        if ctx.slot() != slot {
            return Err(ProtocolError::UnexpectedState(slot.raw()).into());
        }
        log::warn!("Events: context {} reset by firmware", ctx.id());
        let replayed = self.reset_context(&ctx, true);
        log::debug!("Events: context {} replays {} requests", ctx.id(), replayed);
        self.engine_for(&ctx).kick_drain();
        Ok(())
    }

    /// An engine failed and firmware could not recover it
    ///
    /// Only recorded. The caller reads [`Device::engine_failures`] and decides
    /// whether to reset.
    pub fn engine_failure(&self, class: u32, instance: u32, reason: u32) -> Result<()> {
        let engine_class = EngineClass::from_firmware(class)
            .filter(|_| instance < EngineClass::MAX_INSTANCES)
            .ok_or(ProtocolError::BadEngine { class, instance })?;
        log::error!(
            "Events: engine {}{} failed, reason {:#x}",
            engine_class.name(),
            instance,
            reason
        );
        self.failures.lock().push(EngineFailure {
            class: engine_class,
            instance,
            reason,
        });
        Ok(())
    }

    // =========================================================================
    // Fence
    // =========================================================================

    /// Resubmit requests that waited on a context's fence, in order
    pub(crate) fn release_fence(&self, ctx: &Arc<Context>, fence: VecDeque<Arc<Request>>) {
        for req in fence {
            req.clear(RequestFlags::PARKED);
            if let Err(err) = self.queue_or_bypass(ctx, &req) {
                log::warn!(
                    "Events: request {} of context {} not resubmitted: {}",
                    req.id(),
                    ctx.id(),
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::Harness;
    use magma_core::{Error, ProtocolError, SlotId};
    use magma_rpc::Event;

    #[test]
    fn test_unexpected_notifications_are_rejected() {
        let h = Harness::single_pool(2);
        assert_eq!(
            h.dev.deregister_done(SlotId::new(0)),
            Err(Error::Protocol(ProtocolError::NoContext(0)))
        );

        let ctx = h.context();
        let _req = h.submit(ctx);
        h.dev.run_pending();
        let slot = h.ctx(ctx).slot();
        assert_eq!(
            h.dev.deregister_done(slot),
            Err(Error::Protocol(ProtocolError::UnexpectedState(slot.raw())))
        );
        assert_eq!(
            h.dev.schedule_done(slot),
            Err(Error::Protocol(ProtocolError::UnexpectedState(slot.raw())))
        );
        assert!(h.ctx(ctx).is_registered());
        assert!(h.ctx(ctx).is_enabled());
    }

    #[test]
    fn test_malformed_messages_are_dropped() {
        let h = Harness::single_pool(2);
        let mut raw = magma_rpc::RawMessage::new();
        raw.push(0xdead);
        h.fw.post_raw(raw).unwrap();
        h.fw.post(Event::ScheduleDone { slot: SlotId::new(1) }).unwrap();
        assert_eq!(h.dev.process_events(), 2);
        assert_eq!(h.dev.outstanding(), 0);
    }

    #[test]
    fn test_engine_failure_validated() {
        let h = Harness::single_pool(2);
        assert_eq!(
            h.dev.engine_failure(99, 0, 1),
            Err(Error::Protocol(ProtocolError::BadEngine { class: 99, instance: 0 }))
        );
        assert_eq!(
            h.dev.engine_failure(0, 8, 1),
            Err(Error::Protocol(ProtocolError::BadEngine { class: 0, instance: 8 }))
        );
        h.dev.engine_failure(0, 1, 7).unwrap();
        let failures = h.dev.engine_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].instance, 1);
        assert_eq!(failures[0].reason, 7);
    }

    #[test]
    fn test_events_gated_by_irq() {
        let h = Harness::single_pool(2);
        let ctx = h.context();
        let _req = h.submit(ctx);
        assert_eq!(h.dev.outstanding(), 1);

        h.dev.reset_prepare();
        assert_eq!(h.dev.outstanding(), 0);
        h.fw.post(Event::ContextReset { slot: SlotId::new(0) }).unwrap();
        assert_eq!(h.dev.process_events(), 0);

        h.dev.reset_finish();
        assert!(!h.dev.is_submission_disabled());
        assert_eq!(h.dev.process_events(), 1);
    }
}
