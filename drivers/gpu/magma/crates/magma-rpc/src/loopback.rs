//! # Loopback Firmware
//!
//! In-memory [`FirmwareChannel`] that records every action and answers the
//! ones that expect a reply. Replies can be held back and released one at
//! a time, the channel can be made to answer `Busy` a number of times, and
//! it can be broken for good.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use magma_core::{Error, Result};
use spin::Mutex;

use crate::action::{opcode, Action};
use crate::channel::FirmwareChannel;
use crate::event::{Event, RawMessage};
use crate::queue::{channel, Receiver, Sender};

/// Default inbound queue depth
pub const DEFAULT_DEPTH: usize = 256;

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Default)]
struct LoopbackState {
    /// Every accepted action, in send order
    sent: Vec<Action>,
    /// Replies not yet delivered
    held: VecDeque<Event>,
    /// Deliver replies as soon as the action is accepted
    auto_ack: bool,
    /// Sends still to be refused with `Busy`
    busy_budget: u32,
    /// Sends refused with `Busy` so far
    busy_hits: u32,
    /// Channel is gone
    broken: bool,
}

// =============================================================================
// LOOPBACK FIRMWARE
// =============================================================================

/// Software firmware endpoint
#[derive(Debug)]
pub struct LoopbackFirmware {
    state: Mutex<LoopbackState>,
    inbound_tx: Sender<RawMessage>,
    inbound_rx: Receiver<RawMessage>,
}

impl LoopbackFirmware {
    /// Create an endpoint that acknowledges immediately
    pub fn new() -> Self {
        Self::with_depth(DEFAULT_DEPTH)
    }

    /// Create an endpoint with an inbound queue of `depth` messages
    pub fn with_depth(depth: usize) -> Self {
        let (inbound_tx, inbound_rx) = channel(depth);
        Self {
            state: Mutex::new(LoopbackState {
                auto_ack: true,
                ..LoopbackState::default()
            }),
            inbound_tx,
            inbound_rx,
        }
    }

    /// Choose whether replies are delivered immediately or held
    pub fn set_auto_ack(&self, on: bool) {
        self.state.lock().auto_ack = on;
    }

    /// Refuse the next `count` sends with `Busy`
    pub fn inject_busy(&self, count: u32) {
        self.state.lock().busy_budget = count;
    }

    /// Number of sends refused with `Busy`
    pub fn busy_hits(&self) -> u32 {
        self.state.lock().busy_hits
    }

    /// Break or repair the channel
    pub fn set_broken(&self, broken: bool) {
        self.state.lock().broken = broken;
    }

    /// Inject an unsolicited notification
    pub fn post(&self, event: Event) -> Result<()> {
        self.inbound_tx.send(event.encode())
    }

    /// Inject a raw message, well-formed or not
    pub fn post_raw(&self, msg: RawMessage) -> Result<()> {
        self.inbound_tx.send(msg)
    }

    /// Number of replies being held back
    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Deliver the oldest held reply
    pub fn release_one(&self) -> bool {
        let event = self.state.lock().held.pop_front();
        match event {
            Some(event) => {
                if let Err(err) = self.post(event) {
                    log::warn!("LoopbackFirmware: dropped held reply: {}", err);
                }
                true
            },
            None => false,
        }
    }

    /// Deliver every held reply
    pub fn release_replies(&self) -> usize {
        let mut released = 0;
        while self.release_one() {
            released += 1;
        }
        released
    }

    /// Drop every held reply without delivering it
    pub fn discard_replies(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.held.len();
        state.held.clear();
        count
    }

    /// Accepted actions, in send order
    pub fn sent(&self) -> Vec<Action> {
        self.state.lock().sent.clone()
    }

    /// Opcodes of accepted actions, in send order
    pub fn sent_opcodes(&self) -> Vec<u32> {
        self.state.lock().sent.iter().map(Action::opcode).collect()
    }

    /// Number of accepted actions carrying `code`
    pub fn count(&self, code: u32) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|a| a.opcode() == code)
            .count()
    }

    /// Forget recorded actions
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    fn reply_for(action: &Action) -> Option<Event> {
        match action.opcode() {
            opcode::DEREGISTER_CONTEXT => Some(Event::DeregisterDone {
                slot: action.slot(),
            }),
            opcode::SCHED_CONTEXT_MODE_SET => Some(Event::ScheduleDone {
                slot: action.slot(),
            }),
            _ => None,
        }
    }
}

impl Default for LoopbackFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareChannel for LoopbackFirmware {
    fn send(&self, action: &Action) -> Result<()> {
        let mut state = self.state.lock();
        if state.broken {
            return Err(Error::PipeBroken);
        }
        if state.busy_budget > 0 {
            state.busy_budget -= 1;
            state.busy_hits += 1;
            return Err(Error::Busy);
        }

        state.sent.push(action.clone());
        if let Some(reply) = Self::reply_for(action) {
            if state.auto_ack {
                if self.inbound_tx.send(reply.encode()).is_err() {
                    state.held.push_back(reply);
                }
            } else {
                state.held.push_back(reply);
            }
        }
        Ok(())
    }

    fn receive(&self) -> Option<RawMessage> {
        self.inbound_rx.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ScheduleMode;
    use magma_core::SlotId;

    #[test]
    fn test_auto_ack_replies() {
        let fw = LoopbackFirmware::new();
        fw.send(&Action::deregister_context(SlotId::new(4))).unwrap();
        fw.send(&Action::schedule_context(SlotId::new(4))).unwrap();
        let msg = fw.receive().unwrap();
        assert_eq!(
            Event::parse(&msg).unwrap(),
            Event::DeregisterDone {
                slot: SlotId::new(4)
            }
        );
        assert!(fw.receive().is_none());
    }

    #[test]
    fn test_held_replies_release_in_order() {
        let fw = LoopbackFirmware::new();
        fw.set_auto_ack(false);
        fw.send(&Action::schedule_mode(SlotId::new(1), ScheduleMode::Enable))
            .unwrap();
        fw.send(&Action::deregister_context(SlotId::new(2))).unwrap();
        assert!(fw.receive().is_none());
        assert_eq!(fw.held(), 2);

        assert!(fw.release_one());
        let first = Event::parse(&fw.receive().unwrap()).unwrap();
        assert_eq!(first.slot(), Some(SlotId::new(1)));
        assert_eq!(fw.release_replies(), 1);
        assert!(fw.receive().is_some());
    }

    #[test]
    fn test_busy_budget_and_broken() {
        let fw = LoopbackFirmware::new();
        fw.inject_busy(2);
        let action = Action::schedule_context(SlotId::new(0));
        assert_eq!(fw.send(&action), Err(Error::Busy));
        assert_eq!(fw.send(&action), Err(Error::Busy));
        assert!(fw.send(&action).is_ok());
        assert_eq!(fw.busy_hits(), 2);
        assert_eq!(fw.count(opcode::SCHED_CONTEXT), 1);

        fw.set_broken(true);
        assert_eq!(fw.send(&action), Err(Error::PipeBroken));
    }
}
