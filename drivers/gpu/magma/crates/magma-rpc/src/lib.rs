//! # MAGMA Firmware Message Protocol
//!
//! Host ⇄ firmware messaging for context submission.
//!
//! ## Architecture
//!
//! The scheduling firmware owns the hardware context slots. The host driver
//! talks to it through a pair of message queues: host-to-firmware actions
//! (register a context, enable scheduling, submit work) and
//! firmware-to-host notifications (deregistration done, schedule mode
//! changed, context reset, engine failure).
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                                                              │
//! │  ┌────────────────┐      Action       ┌─────────────────┐    │
//! │  │   Host Driver  │ ───────────────▶  │    Scheduling   │    │
//! │  │   (magma-cmd)  │                   │    Firmware     │    │
//! │  │                │ ◀───────────────  │                 │    │
//! │  └────────────────┘       Event       └─────────────────┘    │
//! │          │                                                   │
//! │  ┌───────┴────────────┐                                      │
//! │  │ OutstandingCounter │  actions still owed a reply          │
//! │  └────────────────────┘                                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Message Flow
//!
//! 1. Host encodes an [`Action`] and sends it with [`FirmwareChannel::send`]
//! 2. A saturated channel answers `Busy`; a torn-down one `PipeBroken`
//! 3. Actions that expect a reply bump the [`OutstandingCounter`]
//! 4. Host pulls raw replies with [`FirmwareChannel::receive`] and parses
//!    them into [`Event`]s

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod action;
pub mod channel;
pub mod event;
pub mod loopback;
pub mod queue;

// Re-exports
pub use action::{opcode, Action, ScheduleMode};
pub use channel::{FirmwareChannel, OutstandingCounter};
pub use event::{Event, RawMessage};
pub use loopback::LoopbackFirmware;
pub use queue::{channel, Receiver, Sender};
