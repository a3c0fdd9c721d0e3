//! # Hardware Context Descriptors
//!
//! Firmware-visible per-slot records and the slot → context lookup.
//!
//! Each table entry carries both the descriptor and the owning context, so
//! "descriptor registered" and "lookup maps the slot to a context" cannot
//! disagree. An entry stays in place from the moment the register action is
//! sent until the matching deregister completes.

use alloc::sync::Arc;
use alloc::vec::Vec;

use magma_core::{ContextId, Error, GpuAddr, PriorityBucket, Result, SlotId};

use crate::context::Context;

bitflags::bitflags! {
    /// Descriptor policy flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u32 {
        /// Submitted by the kernel driver
        const KMD = 1 << 0;
        /// Parent of a parallel submission
        const PARENT = 1 << 1;
    }
}

// =============================================================================
// DESCRIPTOR
// =============================================================================

/// Hardware context descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwDescriptor {
    /// Firmware engine class
    pub engine_class: u32,
    /// Engine instance mask
    pub submit_mask: u32,
    /// Ring context address
    pub lrca: GpuAddr,
    /// Scheduling priority
    pub priority: PriorityBucket,
    /// Policy flags
    pub flags: DescriptorFlags,
    /// Execution quantum
    pub exec_quantum_us: u32,
    /// Preemption timeout
    pub preempt_timeout_us: u32,
    /// Number of child contexts
    pub children: u8,
}

// =============================================================================
// DESCRIPTOR TABLE
// =============================================================================

#[derive(Debug)]
struct Registration {
    desc: HwDescriptor,
    owner: Arc<Context>,
    deregistering: bool,
}

/// Descriptor table indexed by slot
#[derive(Debug)]
pub struct DescriptorTable {
    entries: Vec<Option<Registration>>,
}

impl DescriptorTable {
    /// Create a table of `capacity` slots
    pub fn new(capacity: u32) -> Self {
        let mut entries = Vec::with_capacity(capacity as usize);
        entries.resize_with(capacity as usize, || None);
        Self { entries }
    }

    /// Number of slots
    pub fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    fn entry(&self, slot: SlotId) -> Option<&Registration> {
        self.entries.get(slot.index()).and_then(Option::as_ref)
    }

    /// Register `owner` at `slot`
    pub fn register(&mut self, slot: SlotId, desc: HwDescriptor, owner: Arc<Context>) -> Result<()> {
        let entry = self
            .entries
            .get_mut(slot.index())
            .ok_or(Error::InvalidParameter)?;
        if entry.is_some() {
            return Err(Error::InvalidState);
        }
        *entry = Some(Registration {
            desc,
            owner,
            deregistering: false,
        });
        Ok(())
    }

    /// Remove the entry at `slot`, returning its owner
    pub fn unregister(&mut self, slot: SlotId) -> Option<Arc<Context>> {
        self.entries
            .get_mut(slot.index())
            .and_then(Option::take)
            .map(|r| r.owner)
    }

    /// Check if a descriptor is registered at `slot`
    pub fn is_registered(&self, slot: SlotId) -> bool {
        self.entry(slot).is_some()
    }

    /// Context registered at `slot`
    pub fn lookup(&self, slot: SlotId) -> Option<Arc<Context>> {
        self.entry(slot).map(|r| Arc::clone(&r.owner))
    }

    /// Check if `id` is registered at `slot`
    pub fn is_owned_by(&self, slot: SlotId, id: ContextId) -> bool {
        self.entry(slot).is_some_and(|r| r.owner.id() == id)
    }

    /// Descriptor at `slot`
    pub fn descriptor(&self, slot: SlotId) -> Option<&HwDescriptor> {
        self.entry(slot).map(|r| &r.desc)
    }

    /// Record that a deregister was sent for `slot`
    pub fn mark_deregistering(&mut self, slot: SlotId, on: bool) {
        if let Some(Some(r)) = self.entries.get_mut(slot.index()) {
            r.deregistering = on;
        }
    }

    /// Check if a deregister is outstanding for `slot`
    pub fn is_deregistering(&self, slot: SlotId) -> bool {
        self.entry(slot).is_some_and(|r| r.deregistering)
    }

    /// Slots with a deregister outstanding
    pub fn deregistering(&self) -> Vec<SlotId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.as_ref().is_some_and(|r| r.deregistering))
            .map(|(i, _)| SlotId::new(i as u32))
            .collect()
    }

    /// Number of registered descriptors
    pub fn registered(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Drop every entry, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.registered();
        self.entries.iter_mut().for_each(|e| *e = None);
        count
    }
}
