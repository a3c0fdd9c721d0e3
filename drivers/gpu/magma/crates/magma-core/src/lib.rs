//! # MAGMA Core
//!
//! Foundational types shared by every layer of the MAGMA submission stack.
//!
//! This crate has no knowledge of firmware wire formats or scheduling
//! policy. It only defines the vocabulary the other crates speak:
//!
//! - [`Error`] / [`Result`]: the unified error taxonomy
//! - [`SlotId`], [`ContextId`], [`RequestId`]: strongly typed identifiers
//! - [`Priority`] and [`PriorityBucket`]: request priority and the
//!   firmware-visible bucket it maps to
//! - [`Timeline`]: per-context seqno breadcrumbs written by the engine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      magma-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │    Error    │  │   Types     │  │      Timeline       │  │
//! │  │  (taxonomy, │  │ (SlotId,    │  │  (started/completed │  │
//! │  │  protocol)  │  │  Priority)  │  │   seqno)            │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use error::{Error, ProtocolError, Result};
pub use sync::Timeline;
pub use types::*;
