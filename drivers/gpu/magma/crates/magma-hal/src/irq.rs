//! # Interrupt Handling
//!
//! Gating of interrupt sources. The submission core only needs to silence
//! inbound firmware notifications while it scrubs state during a reset.

use magma_core::{Error, Result};

// =============================================================================
// INTERRUPT TYPES
// =============================================================================

/// GPU interrupt sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InterruptSource {
    /// Firmware-to-host message notification
    Firmware = 0,
    /// Engine user interrupt (breadcrumb written)
    Engine   = 1,
    /// Fault interrupt (MMU, etc.)
    Fault    = 2,
}

impl InterruptSource {
    /// Mask bit for this source
    pub const fn mask(self) -> InterruptMask {
        match self {
            Self::Firmware => InterruptMask::FIRMWARE,
            Self::Engine => InterruptMask::ENGINE,
            Self::Fault => InterruptMask::FAULT,
        }
    }
}

bitflags::bitflags! {
    /// Set of enabled interrupt sources
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptMask: u32 {
        /// Firmware notifications
        const FIRMWARE = 1 << 0;
        /// Engine breadcrumbs
        const ENGINE = 1 << 1;
        /// Faults
        const FAULT = 1 << 2;
    }
}

// =============================================================================
// IRQ MANAGER TRAIT
// =============================================================================

/// Trait for interrupt management
pub trait IrqManager: Send {
    /// Enable interrupts for a source
    fn enable(&mut self, source: InterruptSource) -> Result<()>;

    /// Disable interrupts for a source
    fn disable(&mut self, source: InterruptSource) -> Result<()>;

    /// Check if a source is enabled
    fn is_enabled(&self, source: InterruptSource) -> bool;
}

// =============================================================================
// SOFTWARE IRQ MANAGER
// =============================================================================

/// Software interrupt gate
#[derive(Debug, Clone)]
pub struct SoftIrq {
    /// Enabled sources
    enabled: InterruptMask,
    /// Number of enable/disable transitions
    transitions: u32,
    /// Sources that refuse to be toggled
    stuck: InterruptMask,
}

impl SoftIrq {
    /// Create a gate with every source enabled
    pub fn new() -> Self {
        Self {
            enabled: InterruptMask::all(),
            transitions: 0,
            stuck: InterruptMask::empty(),
        }
    }

    /// Make a source refuse state changes
    pub fn set_stuck(&mut self, source: InterruptSource) {
        self.stuck |= source.mask();
    }

    /// Enabled sources
    pub fn enabled(&self) -> InterruptMask {
        self.enabled
    }

    /// Number of state changes performed
    pub fn transitions(&self) -> u32 {
        self.transitions
    }

    fn toggle(&mut self, source: InterruptSource, on: bool) -> Result<()> {
        let bit = source.mask();
        if self.stuck.contains(bit) {
            log::warn!("SoftIrq: {:?} is stuck", source);
            return Err(Error::InvalidState);
        }
        if self.enabled.contains(bit) != on {
            self.enabled.set(bit, on);
            self.transitions += 1;
        }
        Ok(())
    }
}

impl Default for SoftIrq {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqManager for SoftIrq {
    fn enable(&mut self, source: InterruptSource) -> Result<()> {
        self.toggle(source, true)
    }

    fn disable(&mut self, source: InterruptSource) -> Result<()> {
        self.toggle(source, false)
    }

    fn is_enabled(&self, source: InterruptSource) -> bool {
        self.enabled.contains(source.mask())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_counts_transitions() {
        let mut irq = SoftIrq::new();
        irq.disable(InterruptSource::Firmware).unwrap();
        irq.disable(InterruptSource::Firmware).unwrap();
        assert!(!irq.is_enabled(InterruptSource::Firmware));
        assert!(irq.is_enabled(InterruptSource::Engine));
        irq.enable(InterruptSource::Firmware).unwrap();
        assert_eq!(irq.transitions(), 2);
    }

    #[test]
    fn test_stuck_source_rejects_changes() {
        let mut irq = SoftIrq::new();
        irq.set_stuck(InterruptSource::Fault);
        assert_eq!(irq.disable(InterruptSource::Fault), Err(Error::InvalidState));
        assert!(irq.is_enabled(InterruptSource::Fault));
    }
}
