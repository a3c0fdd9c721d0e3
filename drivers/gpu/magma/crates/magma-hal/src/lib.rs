//! # MAGMA Hardware Abstraction Layer
//!
//! The narrow slice of the platform the submission core depends on:
//!
//! - [`Platform`](platform::Platform): monotonic clock and sleeping
//! - [`IrqManager`](irq::IrqManager): gating of inbound firmware notifications
//!
//! Both come with software implementations ([`SoftPlatform`](platform::SoftPlatform),
//! [`SoftIrq`](irq::SoftIrq)) used for host-side simulation.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod irq;
pub mod platform;

// Re-exports
pub use irq::{InterruptMask, InterruptSource, IrqManager, SoftIrq};
pub use platform::{Platform, SoftPlatform};
