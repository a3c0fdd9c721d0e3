//! # Outbound Actions
//!
//! Host-to-firmware action encoding. An action is a short array of 32-bit
//! words: the opcode followed by its arguments, almost always led by the
//! slot id the action addresses.

use arrayvec::ArrayVec;
use magma_core::{GpuAddr, PriorityBucket, SlotId};
use static_assertions::const_assert;

// =============================================================================
// OPCODES
// =============================================================================

/// Firmware action codes
pub mod opcode {
    //! Action and notification codes

    /// Submit work on an enabled context
    pub const SCHED_CONTEXT: u32 = 0x1000;
    /// Enable or disable scheduling of a context
    pub const SCHED_CONTEXT_MODE_SET: u32 = 0x1002;
    /// Notification: schedule mode change complete
    pub const SCHED_CONTEXT_MODE_DONE: u32 = 0x1003;
    /// Set context priority
    pub const SET_CONTEXT_PRIORITY: u32 = 0x1005;
    /// Set context preemption timeout
    pub const SET_CONTEXT_PREEMPTION_TIMEOUT: u32 = 0x1007;
    /// Notification: context was reset by the firmware
    pub const CONTEXT_RESET_NOTIFICATION: u32 = 0x1008;
    /// Notification: engine failed to reset
    pub const ENGINE_FAILURE_NOTIFICATION: u32 = 0x1009;
    /// Register a context descriptor
    pub const REGISTER_CONTEXT: u32 = 0x4502;
    /// Deregister a context descriptor
    pub const DEREGISTER_CONTEXT: u32 = 0x4503;
    /// Notification: deregistration complete
    pub const DEREGISTER_CONTEXT_DONE: u32 = 0x4600;
    /// Register a parent context and its children
    pub const REGISTER_CONTEXT_MULTI: u32 = 0x4601;
}

/// Maximum children of a multi-context registration
pub const MAX_CHILDREN: usize = 7;

/// Maximum action length in words
pub const MAX_ACTION_LEN: usize = 12;

const_assert!(MAX_ACTION_LEN >= 4 + MAX_CHILDREN);

// =============================================================================
// SCHEDULE MODE
// =============================================================================

/// Scheduling mode carried by `SCHED_CONTEXT_MODE_SET`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ScheduleMode {
    /// Stop scheduling the context
    Disable = 0,
    /// Start scheduling the context
    Enable  = 1,
}

impl ScheduleMode {
    /// Decode from a word
    pub const fn from_word(word: u32) -> Option<Self> {
        match word {
            0 => Some(Self::Disable),
            1 => Some(Self::Enable),
            _ => None,
        }
    }
}

// =============================================================================
// ACTION
// =============================================================================

/// An encoded host-to-firmware action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Encoded words, opcode first
    words: ArrayVec<u32, MAX_ACTION_LEN>,
    /// Firmware owes a notification for this action
    expects_reply: bool,
}

impl Action {
    fn build(words: &[u32], expects_reply: bool) -> Self {
        let mut buf = ArrayVec::new();
        buf.extend(words.iter().copied().take(MAX_ACTION_LEN));
        Self {
            words: buf,
            expects_reply,
        }
    }

    /// Register a single context descriptor
    pub fn register_context(slot: SlotId, lrca: GpuAddr) -> Self {
        Self::build(
            &[opcode::REGISTER_CONTEXT, slot.raw(), lrca.lower(), lrca.upper()],
            false,
        )
    }

    /// Register a parent context followed by its children
    ///
    /// `lrcas[0]` is the parent; at most [`MAX_CHILDREN`] children follow.
    pub fn register_multi(slot: SlotId, lrcas: &[GpuAddr]) -> Self {
        let count = lrcas.len().min(MAX_CHILDREN + 1);
        let mut action = Self::build(
            &[opcode::REGISTER_CONTEXT_MULTI, slot.raw(), count as u32],
            false,
        );
        action
            .words
            .extend(lrcas.iter().take(count).map(|addr| addr.lower()));
        action
    }

    /// Deregister the descriptor at `slot`
    pub fn deregister_context(slot: SlotId) -> Self {
        Self::build(&[opcode::DEREGISTER_CONTEXT, slot.raw()], true)
    }

    /// Change the scheduling mode of `slot`
    pub fn schedule_mode(slot: SlotId, mode: ScheduleMode) -> Self {
        Self::build(
            &[opcode::SCHED_CONTEXT_MODE_SET, slot.raw(), mode as u32],
            true,
        )
    }

    /// Submit work on the already-enabled context at `slot`
    pub fn schedule_context(slot: SlotId) -> Self {
        Self::build(&[opcode::SCHED_CONTEXT, slot.raw()], false)
    }

    /// Set the firmware priority of `slot`
    pub fn set_priority(slot: SlotId, bucket: PriorityBucket) -> Self {
        Self::build(
            &[opcode::SET_CONTEXT_PRIORITY, slot.raw(), bucket.to_firmware()],
            false,
        )
    }

    /// Set the preemption timeout of `slot`
    pub fn set_preemption_timeout(slot: SlotId, timeout_us: u32) -> Self {
        Self::build(
            &[opcode::SET_CONTEXT_PREEMPTION_TIMEOUT, slot.raw(), timeout_us],
            false,
        )
    }

    /// Encoded words
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Action code
    pub fn opcode(&self) -> u32 {
        self.words.first().copied().unwrap_or(0)
    }

    /// Slot the action addresses
    pub fn slot(&self) -> SlotId {
        self.words
            .get(1)
            .map(|&raw| SlotId::new(raw))
            .unwrap_or(SlotId::INVALID)
    }

    /// Scheduling mode, for `SCHED_CONTEXT_MODE_SET`
    pub fn schedule_mode_arg(&self) -> Option<ScheduleMode> {
        if self.opcode() != opcode::SCHED_CONTEXT_MODE_SET {
            return None;
        }
        self.words.get(2).and_then(|&w| ScheduleMode::from_word(w))
    }

    /// Check if firmware owes a notification for this action
    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_expectations() {
        let slot = SlotId::new(3);
        assert!(Action::deregister_context(slot).expects_reply());
        assert!(Action::schedule_mode(slot, ScheduleMode::Enable).expects_reply());
        assert!(!Action::register_context(slot, GpuAddr::new(0x1000)).expects_reply());
        assert!(!Action::schedule_context(slot).expects_reply());
        assert!(!Action::set_priority(slot, PriorityBucket::High).expects_reply());
    }

    #[test]
    fn test_multi_registration_truncates_children() {
        let lrcas = [GpuAddr::new(0x1000); 12];
        let action = Action::register_multi(SlotId::new(8), &lrcas);
        assert_eq!(action.words()[2], (MAX_CHILDREN + 1) as u32);
        assert_eq!(action.words().len(), 3 + MAX_CHILDREN + 1);
        assert_eq!(action.slot(), SlotId::new(8));
    }

    #[test]
    fn test_schedule_mode_argument() {
        let action = Action::schedule_mode(SlotId::new(1), ScheduleMode::Disable);
        assert_eq!(action.schedule_mode_arg(), Some(ScheduleMode::Disable));
        assert_eq!(Action::schedule_context(SlotId::new(1)).schedule_mode_arg(), None);
    }
}
