//! # Inbound Events
//!
//! Firmware-to-host notifications. Parsing only checks message shape;
//! whether the addressed context expects the notification is decided by
//! the consumer.

use arrayvec::ArrayVec;
use magma_core::{ProtocolError, Result, SlotId};

use crate::action::opcode;

/// Maximum inbound message length in words
pub const MAX_EVENT_LEN: usize = 8;

/// Raw inbound message, opcode first
pub type RawMessage = ArrayVec<u32, MAX_EVENT_LEN>;

// =============================================================================
// EVENT
// =============================================================================

/// Parsed firmware notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The descriptor at `slot` is no longer registered
    DeregisterDone {
        /// Slot that was deregistered
        slot: SlotId,
    },
    /// A schedule enable/disable on `slot` has taken effect
    ScheduleDone {
        /// Slot whose mode changed
        slot: SlotId,
    },
    /// Firmware reset the context at `slot`
    ContextReset {
        /// Slot of the reset context
        slot: SlotId,
    },
    /// An engine failed and could not be recovered by firmware
    EngineFailure {
        /// Firmware engine class
        class: u32,
        /// Engine instance
        instance: u32,
        /// Firmware reason code
        reason: u32,
    },
}

impl Event {
    /// Parse a raw message
    pub fn parse(msg: &[u32]) -> Result<Self> {
        let (&action, payload) = msg.split_first().ok_or(ProtocolError::ShortMessage)?;
        let need = |n: usize| -> Result<()> {
            if payload.len() < n {
                Err(ProtocolError::ShortMessage.into())
            } else {
                Ok(())
            }
        };

        match action {
            opcode::DEREGISTER_CONTEXT_DONE => {
                need(1)?;
                Ok(Self::DeregisterDone {
                    slot: SlotId::new(payload[0]),
                })
            },
            opcode::SCHED_CONTEXT_MODE_DONE => {
                need(1)?;
                Ok(Self::ScheduleDone {
                    slot: SlotId::new(payload[0]),
                })
            },
            opcode::CONTEXT_RESET_NOTIFICATION => {
                need(1)?;
                Ok(Self::ContextReset {
                    slot: SlotId::new(payload[0]),
                })
            },
            opcode::ENGINE_FAILURE_NOTIFICATION => {
                need(3)?;
                Ok(Self::EngineFailure {
                    class: payload[0],
                    instance: payload[1],
                    reason: payload[2],
                })
            },
            other => Err(ProtocolError::UnknownAction(other).into()),
        }
    }

    /// Encode into a raw message
    pub fn encode(&self) -> RawMessage {
        let mut msg = RawMessage::new();
        match *self {
            Self::DeregisterDone { slot } => {
                msg.push(opcode::DEREGISTER_CONTEXT_DONE);
                msg.push(slot.raw());
            },
            Self::ScheduleDone { slot } => {
                msg.push(opcode::SCHED_CONTEXT_MODE_DONE);
                msg.push(slot.raw());
            },
            Self::ContextReset { slot } => {
                msg.push(opcode::CONTEXT_RESET_NOTIFICATION);
                msg.push(slot.raw());
            },
            Self::EngineFailure {
                class,
                instance,
                reason,
            } => {
                msg.push(opcode::ENGINE_FAILURE_NOTIFICATION);
                msg.push(class);
                msg.push(instance);
                msg.push(reason);
            },
        }
        msg
    }

    /// Slot the event addresses, if any
    pub fn slot(&self) -> Option<SlotId> {
        match *self {
            Self::DeregisterDone { slot }
            | Self::ScheduleDone { slot }
            | Self::ContextReset { slot } => Some(slot),
            Self::EngineFailure { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magma_core::Error;

    #[test]
    fn test_parse_rejects_empty_and_short() {
        assert_eq!(
            Event::parse(&[]),
            Err(Error::Protocol(ProtocolError::ShortMessage))
        );
        assert_eq!(
            Event::parse(&[opcode::ENGINE_FAILURE_NOTIFICATION, 0, 1]),
            Err(Error::Protocol(ProtocolError::ShortMessage))
        );
    }

    #[test]
    fn test_parse_rejects_unknown_action() {
        assert_eq!(
            Event::parse(&[0xdead, 1]),
            Err(Error::Protocol(ProtocolError::UnknownAction(0xdead)))
        );
    }

    #[test]
    fn test_parse_engine_failure() {
        let event = Event::parse(&[opcode::ENGINE_FAILURE_NOTIFICATION, 3, 1, 0x42]).unwrap();
        assert_eq!(
            event,
            Event::EngineFailure {
                class: 3,
                instance: 1,
                reason: 0x42
            }
        );
        assert_eq!(event.slot(), None);
    }
}
