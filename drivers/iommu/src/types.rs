//! # Address Types
//!
//! Strongly typed addresses for the two sides of the translation.
//!
//! An [`Iova`] is what a DMA master puts on the bus; a [`PhysAddr`] is what
//! the IOMMU emits after translation. Neither is a CPU pointer.

use core::fmt;
use core::ops::{Add, Sub};

// =============================================================================
// I/O VIRTUAL ADDRESS
// =============================================================================

/// Device-visible (I/O virtual) address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Iova(u64);

impl Iova {
    /// Create a new IOVA
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Offset by bytes, failing on overflow
    #[inline]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl Add<u64> for Iova {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<Iova> for Iova {
    type Output = u64;

    fn sub(self, rhs: Iova) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for Iova {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iova(0x{:010x})", self.0)
    }
}

impl fmt::Display for Iova {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:010x}", self.0)
    }
}

// =============================================================================
// PHYSICAL ADDRESS
// =============================================================================

/// Physical memory address (translation output)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr(0x{:010x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:010x}", self.0)
    }
}

// =============================================================================
// IOVA RANGE
// =============================================================================

/// Half-open IOVA range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovaRange {
    /// Start address
    pub start: Iova,
    /// End address (exclusive)
    pub end: Iova,
}

impl IovaRange {
    /// Create a range from a start and a length
    pub const fn new(start: Iova, size: u64) -> Self {
        Self {
            start,
            end: Iova(start.0.saturating_add(size)),
        }
    }

    /// Range length in bytes
    pub const fn size(&self) -> u64 {
        self.end.0.saturating_sub(self.start.0)
    }

    /// Check if the range is empty
    pub const fn is_empty(&self) -> bool {
        self.end.0 <= self.start.0
    }

    /// Check if address is in range
    pub fn contains(&self, addr: Iova) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if `other` lies entirely inside this range
    pub fn covers(&self, other: &IovaRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }
}
