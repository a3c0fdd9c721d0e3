//! # Registration Protocol
//!
//! Pins slots outside the drain task and keeps the descriptor table in step
//! with firmware.
//!
//! ```text
//!   Unregistered ──register──▶ Registered ──steal──▶ WaitForDeregister
//!        ▲                                                 │
//!        └──────────── release ◀── deregister done ────────┘
//!                                  (new owner registered)
//! ```
//!
//! Registering needs no acknowledgement. Taking over a slot whose previous
//! owner is still registered sends a deregister and answers `InProgress`;
//! the new owner's submissions wait on its submit fence until the
//! deregister completes.

use alloc::sync::Arc;
use alloc::vec::Vec;

use magma_core::{Error, GpuAddr, Result};
use magma_rpc::Action;

use crate::context::{Context, ContextKind, LockedFlags, SchedFlags};
use crate::descriptor::{DescriptorFlags, HwDescriptor};
use crate::device::Device;
use crate::slot::{PinOutcome, SlotAllocator};

impl Device {
    // =========================================================================
    // Fast-path pinning
    // =========================================================================

    /// Pin a slot for a request outside the drain task
    ///
    /// On exhaustion finished requests are retired and the pin retried,
    /// sleeping with exponential backoff from the second retry on. Refuses
    /// at once while the engine is marked exhausted.
    pub(crate) fn pin_slot_blocking(&self, ctx: &Arc<Context>) -> Result<PinOutcome> {
        let engine = self.engine_for(ctx);
        let tries = self.config.pin_tries;

        for attempt in 1..=tries {
            if engine.is_exhausted() {
                return Err(Error::ResourceExhausted);
            }
            match self.slots.lock().pin(ctx, false, 1) {
                Err(Error::ResourceExhausted) if attempt < tries => {},
                other => return other,
            }

            if attempt > 1 {
                let ms = self
                    .config
                    .timeslice_ms
                    .checked_shl(attempt - 2)
                    .unwrap_or(u32::MAX)
                    .min(self.config.backoff_max_ms)
                    .max(1);
                log::debug!(
                    "SlotAllocator: context {} exhausted, backing off {} ms",
                    ctx.id(),
                    ms
                );
                self.platform.sleep_ms(u64::from(ms));
            }
            self.retire_requests();
        }
        Err(Error::ResourceExhausted)
    }

    // =========================================================================
    // Descriptor registration
    // =========================================================================

    /// Make sure the context's descriptor is registered at its slot
    ///
    /// Returns `InProgress` while the slot's previous owner is being
    /// deregistered; the context is then registered by the completion.
    /// With submission disabled nothing is sent and the answer is `Busy`.
    pub(crate) fn pin_descriptor(&self, ctx: &Arc<Context>) -> Result<()> {
        let slot = ctx.slot();
        if !slot.is_valid() {
            return Err(Error::InvalidState);
        }
        if self.is_submission_disabled() {
            return Err(Error::Busy);
        }
        let mut slots = self.slots.lock();

        match slots.table.lookup(slot) {
            Some(owner) if owner.id() != ctx.id() => {
                if slots.takeover_waiter(slot).is_some_and(|w| w.id() == ctx.id()) {
                    return Err(Error::InProgress);
                }
                slots.set_takeover(slot, ctx);
                ctx.state.lock().flags.insert(LockedFlags::WAIT_FOR_DEREGISTER);

                if !slots.table.is_deregistering(slot) {
                    if let Err(err) = self.send(&Action::deregister_context(slot)) {
                        slots.take_takeover(slot);
                        ctx.state.lock().flags.remove(LockedFlags::WAIT_FOR_DEREGISTER);
                        return Err(err);
                    }
                    slots.table.mark_deregistering(slot, true);
                }
                log::debug!(
                    "Registration: context {} waits for context {} to leave slot {}",
                    ctx.id(),
                    owner.id(),
                    slot
                );
                Err(Error::InProgress)
            },
            Some(_) => {
                ctx.set_sched(SchedFlags::REGISTERED);
                ctx.clear_sched(SchedFlags::NEEDS_REGISTER);
                Ok(())
            },
            None => self.register_locked(&mut slots, ctx),
        }
    }

    /// Register the context at its slot; the slot must be free in the table
    pub(crate) fn register_locked(&self, slots: &mut SlotAllocator, ctx: &Arc<Context>) -> Result<()> {
        let slot = ctx.slot();
        let desc = self.build_descriptor(ctx);
        slots.table.register(slot, desc, Arc::clone(ctx))?;

        let action = match ctx.kind() {
            ContextKind::Parent { children, .. } => {
                let mut lrcas: Vec<GpuAddr> = Vec::with_capacity(children.len() + 1);
                lrcas.push(ctx.lrca());
                lrcas.extend(children.iter().copied());
                Action::register_multi(slot, &lrcas)
            },
            _ => Action::register_context(slot, ctx.lrca()),
        };
        if let Err(err) = self.send(&action) {
            slots.table.unregister(slot);
            return Err(err);
        }

        ctx.set_sched(SchedFlags::REGISTERED);
        ctx.clear_sched(SchedFlags::NEEDS_REGISTER);
        log::debug!("Registration: context {} registered at slot {}", ctx.id(), slot);
        Ok(())
    }

    fn build_descriptor(&self, ctx: &Context) -> HwDescriptor {
        let mut flags = DescriptorFlags::KMD;
        if ctx.kind().is_parent() {
            flags |= DescriptorFlags::PARENT;
        }
        HwDescriptor {
            engine_class: ctx.class().to_firmware(),
            submit_mask: ctx.kind().submit_mask(),
            lrca: ctx.lrca(),
            priority: ctx.state.lock().fw_priority,
            flags,
            exec_quantum_us: self.config.timeslice_ms.saturating_mul(1000),
            preempt_timeout_us: self.config.preempt_timeout_ms.saturating_mul(1000),
            children: ctx.kind().children() as u8,
        }
    }

    // =========================================================================
    // Deregistration
    // =========================================================================

    /// Deregister a destroyed context, or release it when it holds no
    /// registration
    ///
    /// `Busy` leaves the context for [`Device::flush_destroyed`].
    pub(crate) fn deregister_destroyed(&self, ctx: &Arc<Context>) -> Result<()> {
        let slot = ctx.slot();
        {
            let mut slots = self.slots.lock();
            slots.unlink(ctx);
            if !slot.is_valid()
                || !slots.table.is_owned_by(slot, ctx.id())
                || self.is_submission_disabled()
            {
                slots.release(ctx);
                return Ok(());
            }
            if slots.table.is_deregistering(slot) {
                return Ok(());
            }
            slots.table.mark_deregistering(slot, true);
        }

        match self.send_blocking(&Action::deregister_context(slot)) {
            Ok(()) => Ok(()),
            Err(Error::PipeBroken) => {
                self.declare_broken();
                self.slots.lock().release(ctx);
                Ok(())
            },
            Err(err) => {
                self.slots.lock().table.mark_deregistering(slot, false);
                log::debug!("Registration: deregister of context {} deferred: {}", ctx.id(), err);
                Err(err)
            },
        }
    }
}
