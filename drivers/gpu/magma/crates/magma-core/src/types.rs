//! # MAGMA Core Types
//!
//! Fundamental type definitions used across the submission stack.
//!
//! These types provide:
//! - Strong typing for GPU addresses and identifiers
//! - The slot id space shared with firmware
//! - Request priority and its firmware bucket mapping

use core::fmt;

use static_assertions::assert_eq_size;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// This is an address in the GPU's virtual address space.
/// It is NOT a CPU pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Low 32 bits
    #[inline]
    pub const fn lower(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits
    #[inline]
    pub const fn upper(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SLOT ID
// =============================================================================

/// Hardware context slot identifier
///
/// Index into the firmware's fixed table of context slots. A context holds
/// either one valid slot (or a contiguous block for multi-context
/// submission) or [`SlotId::INVALID`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SlotId(u32);

assert_eq_size!(SlotId, u32);

impl SlotId {
    /// No slot assigned
    pub const INVALID: Self = Self(u32::MAX);

    /// Create a slot id
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Table index
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Check if a slot is assigned
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    /// Offset by `n` slots (child slots of a multi-context block)
    #[inline]
    pub const fn offset(self, n: u32) -> Self {
        Self(self.0 + n)
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "SlotId({})", self.0)
        } else {
            write!(f, "SlotId(INVALID)")
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

// =============================================================================
// CONTEXT / REQUEST IDS
// =============================================================================

/// Stable context identifier (arena key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ContextId(u32);

impl ContextId {
    /// Create a context id
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Request identifier, monotonically increasing per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Create a request id
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rq{}", self.0)
    }
}

// =============================================================================
// ENGINE CLASS
// =============================================================================

/// Hardware engine class a context executes on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EngineClass {
    /// Graphics (3D) engine
    Render       = 0,
    /// Video decode/encode
    Video        = 1,
    /// Video enhancement
    VideoEnhance = 2,
    /// Copy engine (DMA)
    Copy         = 3,
    /// Compute engine
    Compute      = 4,
}

impl EngineClass {
    /// Number of engine classes
    pub const COUNT: usize = 5;

    /// Maximum instances per class
    pub const MAX_INSTANCES: u32 = 8;

    /// Firmware class encoding
    pub const fn to_firmware(self) -> u32 {
        match self {
            Self::Render => 0,
            Self::Video => 1,
            Self::VideoEnhance => 2,
            Self::Copy => 3,
            Self::Compute => 4,
        }
    }

    /// Decode firmware class
    pub const fn from_firmware(class: u32) -> Option<Self> {
        match class {
            0 => Some(Self::Render),
            1 => Some(Self::Video),
            2 => Some(Self::VideoEnhance),
            3 => Some(Self::Copy),
            4 => Some(Self::Compute),
            _ => None,
        }
    }

    /// Check if this is a graphics class
    pub fn is_graphics(&self) -> bool {
        matches!(self, EngineClass::Render)
    }

    /// Check if this is a compute class
    pub fn is_compute(&self) -> bool {
        matches!(self, EngineClass::Compute)
    }

    /// Short name for logging
    pub const fn name(self) -> &'static str {
        match self {
            Self::Render => "rcs",
            Self::Video => "vcs",
            Self::VideoEnhance => "vecs",
            Self::Copy => "bcs",
            Self::Compute => "ccs",
        }
    }
}

// =============================================================================
// PRIORITY
// =============================================================================

/// Request priority
///
/// Larger values run first. The default priority is [`Priority::NORMAL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Priority(i32);

impl Priority {
    /// Lowest user priority
    pub const MIN: Self = Self(-1023);
    /// Default priority
    pub const NORMAL: Self = Self(0);
    /// Highest user priority
    pub const MAX: Self = Self(1023);
    /// Display-boosted priority (above any user priority)
    pub const DISPLAY: Self = Self(1024);

    /// Create a priority
    #[inline]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Firmware bucket this priority maps to
    pub const fn bucket(self) -> PriorityBucket {
        if self.0 == Self::NORMAL.0 {
            PriorityBucket::KmdNormal
        } else if self.0 < Self::NORMAL.0 {
            PriorityBucket::Normal
        } else if self.0 < Self::DISPLAY.0 {
            PriorityBucket::High
        } else {
            PriorityBucket::KmdHigh
        }
    }
}

/// Firmware scheduling priority bucket
///
/// Lower index is higher priority. A context's firmware priority tracks the
/// lowest-index bucket that has requests in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PriorityBucket {
    /// Kernel high priority
    KmdHigh   = 0,
    /// User high priority
    High      = 1,
    /// Kernel normal priority
    KmdNormal = 2,
    /// User normal priority
    Normal    = 3,
}

impl PriorityBucket {
    /// Number of buckets
    pub const COUNT: usize = 4;

    /// All buckets, highest priority first
    pub const ALL: [Self; Self::COUNT] = [Self::KmdHigh, Self::High, Self::KmdNormal, Self::Normal];

    /// Bucket index
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Firmware encoding
    #[inline]
    pub const fn to_firmware(self) -> u32 {
        self as u32
    }
}
