//! # MAGMA Submission
//!
//! Firmware-scheduled context submission: slot allocation, descriptor
//! registration, the drain and retire workers, and reset.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                       Submission Pipeline                         │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │   Request    │    │    Slot      │    │   Descriptor     │     │
//! │  │  (create /   │───▶│  Allocator   │───▶│   Registration   │     │
//! │  │   submit)    │    │  (pin/steal) │    │                  │     │
//! │  └──────┬───────┘    └──────────────┘    └────────┬─────────┘     │
//! │         │ busy / exhausted                        │               │
//! │  ┌──────▼───────┐    ┌──────────────┐    ┌────────▼─────────┐     │
//! │  │    Engine    │◀──▶│    Retire    │    │    Firmware      │     │
//! │  │    Drain     │    │    Worker    │    │    Channel       │     │
//! │  └──────────────┘    └──────────────┘    └────────┬─────────┘     │
//! │                                                   │ notifications │
//! │                                          ┌────────▼─────────┐     │
//! │                                          │  Event Handlers  │     │
//! │                                          └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submission Flow
//!
//! 1. `create_request` pins a slot for the context, retiring and backing
//!    off when the pool is exhausted
//! 2. `submit_request` publishes the ring tail directly when the engine is
//!    idle, otherwise queues the request for the drain
//! 3. The drain pins, registers and schedules queued requests in priority
//!    order, handing over to the retire worker when it runs out of slots
//! 4. Firmware notifications complete deregistration and schedule changes
//! 5. Reset scrubs lost acknowledgements and replays unfinished requests
//!
//! Background work is driven by [`Device::run_pending`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod engine;
pub mod request;
pub mod slot;

mod events;
mod registration;
mod reset;
mod retire;
mod submit;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod testutil;

// Re-exports
pub use config::{SubmissionConfig, UnreadyThreshold};
pub use context::{Context, ContextDesc, ContextKind, LockedFlags, SchedFlags};
pub use descriptor::{DescriptorFlags, DescriptorTable, HwDescriptor};
pub use device::{Device, EngineFailure};
pub use engine::{EngineFlags, EngineStats, SlotWaiter, StallReason, SubmitClass};
pub use request::{Request, RequestFlags};
pub use slot::{AllocatorStats, PinOutcome};
