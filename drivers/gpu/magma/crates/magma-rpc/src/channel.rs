//! # Firmware Channel
//!
//! The transport seam between the submission core and the firmware, plus
//! bookkeeping of notifications the firmware still owes the host.

use core::sync::atomic::{AtomicU32, Ordering};

use magma_core::Result;

use crate::action::Action;
use crate::event::RawMessage;

// =============================================================================
// FIRMWARE CHANNEL TRAIT
// =============================================================================

/// Host ⇄ firmware message transport
///
/// Implementations never call back into the caller from `send`; inbound
/// messages are only delivered through `receive`.
pub trait FirmwareChannel: Send + Sync {
    /// Queue an action without blocking
    ///
    /// Returns `Error::Busy` if the outbound queue (or the space reserved
    /// for the reply) is exhausted and `Error::PipeBroken` if the channel
    /// is gone for good.
    fn send(&self, action: &Action) -> Result<()>;

    /// Pop the next inbound message, if any
    fn receive(&self) -> Option<RawMessage>;
}

// =============================================================================
// OUTSTANDING COUNTER
// =============================================================================

/// Number of actions still owed a firmware notification
#[derive(Debug, Default)]
pub struct OutstandingCounter {
    count: AtomicU32,
}

impl OutstandingCounter {
    /// Create a counter at zero
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// One more notification owed
    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// One notification received (or written off)
    ///
    /// Saturates at zero; an unbalanced decrement is logged.
    pub fn dec(&self) {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        if prev.is_err() {
            log::warn!("OutstandingCounter: decrement below zero ignored");
        }
    }

    /// Current count
    pub fn get(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Check if nothing is owed
    pub fn is_idle(&self) -> bool {
        self.get() == 0
    }

    /// Forget everything owed (firmware was reset)
    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_saturates_at_zero() {
        let counter = OutstandingCounter::new();
        counter.inc();
        counter.dec();
        counter.dec();
        assert_eq!(counter.get(), 0);
        assert!(counter.is_idle());
    }

    #[test]
    fn test_counter_reset() {
        let counter = OutstandingCounter::new();
        counter.inc();
        counter.inc();
        counter.reset();
        assert!(counter.is_idle());
    }
}
