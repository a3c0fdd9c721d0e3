//! # MAGMA Error Handling
//!
//! Error types for the firmware submission stack.
//!
//! Error handling in MAGMA follows these principles:
//! - Errors are typed and categorized
//! - No panics in production code paths
//! - Transient conditions (`Busy`, `InProgress`) are distinct from fatal
//!   ones (`PipeBroken`) so callers can pick retry, stall or teardown
//! - Errors are `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// MAGMA Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// MAGMA unified error type
///
/// Errors are categorized by subsystem for easier debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Object is in the wrong state for the operation
    InvalidState,
    /// Operation timed out
    Timeout,

    // =========================================================================
    // Slot Errors
    // =========================================================================
    /// No hardware context slot is available
    ResourceExhausted,

    // =========================================================================
    // Firmware Channel Errors
    // =========================================================================
    /// Channel saturated, retry later
    Busy,
    /// Asynchronous deregistration is still pending
    InProgress,
    /// Channel torn down, unrecoverable
    PipeBroken,
    /// Malformed or unexpected inbound message
    Protocol(ProtocolError),

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Request was cancelled before completion
    Cancelled,
    /// Context has been banned
    Banned,
}

impl Error {
    /// Check if the operation may succeed when retried later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::InProgress | Self::ResourceExhausted)
    }

    /// Check if the error leaves the submission path unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PipeBroken)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::Timeout => write!(f, "operation timed out"),

            // Slots
            Self::ResourceExhausted => write!(f, "no hardware context slot available"),

            // Firmware channel
            Self::Busy => write!(f, "firmware channel busy"),
            Self::InProgress => write!(f, "deregistration in progress"),
            Self::PipeBroken => write!(f, "firmware channel broken"),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),

            // Requests
            Self::Cancelled => write!(f, "request cancelled"),
            Self::Banned => write!(f, "context banned"),
        }
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Inbound message validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Message shorter than its action requires
    ShortMessage,
    /// Unknown inbound action code
    UnknownAction(u32),
    /// Slot index beyond the slot pool
    SlotOutOfRange(u32),
    /// No registered context behind the slot
    NoContext(u32),
    /// Context is not waiting for this notification
    UnexpectedState(u32),
    /// Engine class or instance not present
    BadEngine {
        /// Firmware engine class
        class: u32,
        /// Engine instance
        instance: u32,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortMessage => write!(f, "message too short"),
            Self::UnknownAction(a) => write!(f, "unknown action 0x{:04x}", a),
            Self::SlotOutOfRange(s) => write!(f, "slot {} out of range", s),
            Self::NoContext(s) => write!(f, "no context registered at slot {}", s),
            Self::UnexpectedState(s) => write!(f, "unexpected notification for slot {}", s),
            Self::BadEngine { class, instance } => {
                write!(f, "invalid engine class {} instance {}", class, instance)
            },
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Busy.is_transient());
        assert!(Error::InProgress.is_transient());
        assert!(Error::ResourceExhausted.is_transient());
        assert!(!Error::PipeBroken.is_transient());
        assert!(Error::PipeBroken.is_fatal());
    }

    #[test]
    fn test_protocol_conversion() {
        let err: Error = ProtocolError::NoContext(7).into();
        assert_eq!(err, Error::Protocol(ProtocolError::NoContext(7)));
        assert_eq!(
            format!("{}", err),
            "protocol error: no context registered at slot 7"
        );
    }
}
