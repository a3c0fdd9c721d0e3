//! # Platform Abstraction
//!
//! Timing services the submission core needs from the host platform.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

// =============================================================================
// PLATFORM TRAIT
// =============================================================================

/// Platform abstraction trait
///
/// Each target platform (Helix, Linux, FreeBSD) implements this trait to
/// provide a clock and a way to sleep. Sleeping is only ever requested from
/// blocking paths, never from the drain task.
pub trait Platform: Send + Sync {
    /// Get platform name
    fn name(&self) -> &'static str;

    /// Sleep for microseconds (busy-wait in no_std)
    fn sleep_us(&self, us: u64);

    /// Get current time in nanoseconds
    fn time_ns(&self) -> u64;

    /// Sleep for milliseconds
    fn sleep_ms(&self, ms: u64) {
        self.sleep_us(ms.saturating_mul(1_000));
    }
}

// =============================================================================
// SOFTWARE PLATFORM
// =============================================================================

/// Software platform with a virtual clock
///
/// Sleeping advances the clock instead of blocking, and every sleep is
/// recorded so backoff schedules can be inspected.
#[derive(Debug, Default)]
pub struct SoftPlatform {
    /// Current time in nanoseconds
    now_ns: AtomicU64,
    /// Every sleep requested, in microseconds
    sleeps: Mutex<Vec<u64>>,
}

impl SoftPlatform {
    /// Create a platform with the clock at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward
    pub fn advance_ns(&self, ns: u64) {
        self.now_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Sleeps recorded so far, in microseconds
    pub fn sleeps(&self) -> Vec<u64> {
        self.sleeps.lock().clone()
    }

    /// Total time spent sleeping, in microseconds
    pub fn total_slept_us(&self) -> u64 {
        self.sleeps.lock().iter().sum()
    }
}

impl Platform for SoftPlatform {
    fn name(&self) -> &'static str {
        "soft"
    }

    fn sleep_us(&self, us: u64) {
        self.sleeps.lock().push(us);
        self.advance_ns(us.saturating_mul(1_000));
    }

    fn time_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }
}
