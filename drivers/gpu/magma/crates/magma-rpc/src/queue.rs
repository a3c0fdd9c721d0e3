//! # Message Queue
//!
//! Bounded MPSC queue carrying firmware notifications to the host.
//!
//! Sending never blocks: a full queue answers `Busy` and a closed one
//! `PipeBroken`, which is exactly the contract [`FirmwareChannel`] exposes.
//!
//! [`FirmwareChannel`]: crate::FirmwareChannel

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use magma_core::{Error, Result};
use spin::Mutex;

// =============================================================================
// RING
// =============================================================================

/// Fixed-capacity ring storage
struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, item: T) -> core::result::Result<(), T> {
        if self.len >= self.capacity() {
            return Err(item);
        }
        let tail = (self.head + self.len) % self.capacity();
        self.slots[tail] = Some(item);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        item
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct Shared<T> {
    ring: Mutex<Ring<T>>,
    closed: AtomicBool,
    sent: AtomicUsize,
    received: AtomicUsize,
}

/// Create a queue holding at most `capacity` messages
///
/// A zero capacity is rounded up to one.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        ring: Mutex::new(Ring::new(capacity.max(1))),
        closed: AtomicBool::new(false),
        sent: AtomicUsize::new(0),
        received: AtomicUsize::new(0),
    });
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

// =============================================================================
// SENDER
// =============================================================================

/// Producing half of a queue
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T> Sender<T> {
    /// Push a message without blocking
    pub fn send(&self, item: T) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::PipeBroken);
        }
        match self.shared.ring.lock().push(item) {
            Ok(()) => {
                self.shared.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Err(_) => Err(Error::Busy),
        }
    }

    /// Check if the receiver closed the queue
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

// =============================================================================
// RECEIVER
// =============================================================================

/// Consuming half of a queue
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("len", &self.len())
            .field("counters", &self.counters())
            .finish()
    }
}

impl<T> Receiver<T> {
    /// Pop the oldest message, if any
    pub fn try_recv(&self) -> Option<T> {
        let item = self.shared.ring.lock().pop();
        if item.is_some() {
            self.shared.received.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.shared.ring.lock().len
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further messages; queued ones stay readable
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    /// Reopen a closed queue
    pub fn reopen(&self) {
        self.shared.closed.store(false, Ordering::Release);
    }

    /// Messages accepted and delivered so far
    pub fn counters(&self) -> (usize, usize) {
        (
            self.shared.sent.load(Ordering::Relaxed),
            self.shared.received.load(Ordering::Relaxed),
        )
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_wraparound() {
        let (tx, rx) = channel(2);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(tx.send(3), Err(Error::Busy));
        assert_eq!(rx.try_recv(), Some(1));
        tx.send(3).unwrap();
        assert_eq!(rx.try_recv(), Some(2));
        assert_eq!(rx.try_recv(), Some(3));
        assert_eq!(rx.try_recv(), None);
        assert_eq!(rx.counters(), (3, 3));
    }

    #[test]
    fn test_closed_queue_rejects_sends() {
        let (tx, rx) = channel(4);
        tx.send(7).unwrap();
        rx.close();
        assert_eq!(tx.send(8), Err(Error::PipeBroken));
        assert_eq!(rx.try_recv(), Some(7));
        rx.reopen();
        assert!(tx.send(9).is_ok());
    }

    #[test]
    fn test_dropped_receiver_breaks_pipe() {
        let (tx, rx) = channel::<u32>(1);
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.send(1), Err(Error::PipeBroken));
    }
}
