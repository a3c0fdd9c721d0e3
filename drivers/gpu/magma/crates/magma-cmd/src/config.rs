//! # Submission Configuration
//!
//! Tunables of the submission engine.

use magma_core::{Error, Result};

// =============================================================================
// UNREADY THRESHOLD
// =============================================================================

/// When to stop pinning slots at request creation
///
/// Counts slots consumed by contexts that have created requests which are
/// not yet ready to submit. Past the threshold every new request defers
/// slot pinning to the drain task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadyThreshold {
    /// More than half of the class's slots
    HalfAvailable,
    /// More than `numerator / denominator` of the class's slots
    Fraction {
        /// Numerator
        numerator:   u32,
        /// Denominator (zero disables the check)
        denominator: u32,
    },
    /// Never defer
    Disabled,
}

impl UnreadyThreshold {
    /// Check if `consumed` slots out of `available` crosses the threshold
    pub fn exceeded(&self, consumed: u32, available: u32) -> bool {
        match *self {
            Self::HalfAvailable => consumed > available / 2,
            Self::Fraction {
                numerator,
                denominator,
            } => {
                denominator != 0
                    && u64::from(consumed) * u64::from(denominator)
                        > u64::from(available) * u64::from(numerator)
            },
            Self::Disabled => false,
        }
    }
}

impl Default for UnreadyThreshold {
    fn default() -> Self {
        Self::HalfAvailable
    }
}

// =============================================================================
// SUBMISSION CONFIG
// =============================================================================

/// Submission engine configuration
#[derive(Debug, Clone)]
pub struct SubmissionConfig {
    /// Total firmware slots
    pub num_slots: u32,
    /// Slots `[0, multi_reserved)` reserved for parent contexts
    pub multi_reserved: u32,
    /// Scheduling timeslice, also the base of the pin backoff
    pub timeslice_ms: u32,
    /// Preemption timeout written into descriptors
    pub preempt_timeout_ms: u32,
    /// Fast-path pin attempts before deferring to the drain task
    pub pin_tries: u32,
    /// Ceiling of a single pin backoff sleep
    pub backoff_max_ms: u32,
    /// Blocked drain older than this is declared hung
    pub drain_hang_timeout_ns: u64,
    /// Inbound flush passes during reset preparation
    pub reset_flush_passes: u32,
    /// Sleep between reset flush passes
    pub reset_wait_ms: u32,
    /// Deferred-pinning heuristic
    pub unready_threshold: UnreadyThreshold,
}

impl SubmissionConfig {
    /// Configuration for a pool of `num_slots`
    pub fn with_slots(num_slots: u32) -> Self {
        Self {
            num_slots,
            multi_reserved: Self::default_multi_reserved(num_slots),
            ..Self::default()
        }
    }

    /// Default parent reserve for a pool size
    pub fn default_multi_reserved(num_slots: u32) -> u32 {
        (num_slots / 16).max(32).min(num_slots / 2)
    }

    /// Slots available to single contexts
    pub fn single_slots(&self) -> u32 {
        self.num_slots.saturating_sub(self.multi_reserved)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_slots == 0 || self.multi_reserved >= self.num_slots {
            return Err(Error::InvalidParameter);
        }
        if self.pin_tries == 0 || self.timeslice_ms == 0 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            num_slots: 1024,
            multi_reserved: Self::default_multi_reserved(1024),
            timeslice_ms: 1,
            preempt_timeout_ms: 640,
            pin_tries: 4,
            backoff_max_ms: 100,
            drain_hang_timeout_ns: 2_000_000_000,
            reset_flush_passes: 4,
            reset_wait_ms: 50,
            unready_threshold: UnreadyThreshold::HalfAvailable,
        }
    }
}
