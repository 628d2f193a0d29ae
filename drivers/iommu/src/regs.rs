//! # IOMMU Registers
//!
//! Register map of the translation unit and the 32-bit access facility used
//! to drive it.
//!
//! All register traffic goes through [`RegisterIo`]. The production
//! implementation is [`MmioRegion`]; tests substitute a software model.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::error::{Error, Result};

// =============================================================================
// REGISTER OFFSETS
// =============================================================================

/// Register offsets in bytes from the unit's MMIO base
pub mod offsets {
    //! Register block offsets

    /// Control and status
    pub const CTRL: u32 = 0x00;
    /// Top-level table page number (biased by the aperture base)
    pub const PT_PA_BASE: u32 = 0x04;
    /// Translation cache hit counter
    pub const HIT: u32 = 0x08;
    /// Translation cache miss counter
    pub const MISS: u32 = 0x0C;
    /// Stall cycle counter
    pub const STALL: u32 = 0x10;
    /// Highest translated address, in 256 MiB units
    pub const ADDR_CAP: u32 = 0x14;
    /// Ranged invalidation command
    pub const SHOOT_DOWN: u32 = 0x18;
    /// Start of the bypass bracket
    pub const BYPASS_START: u32 = 0x1C;
    /// End of the bypass bracket
    pub const BYPASS_END: u32 = 0x20;
    /// Miscellaneous mode bits
    pub const MISC: u32 = 0x24;
    /// Page returned for illegal accesses
    pub const ILLEGAL_ADR: u32 = 0x30;
    /// Capability readout
    pub const DEBUG_INFO: u32 = 0x38;
}

// =============================================================================
// REGISTER FIELDS
// =============================================================================

bitflags! {
    /// CTRL register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Ctrl: u32 {
        /// Sticky: access above the address cap
        const CAP_EXCEEDED = 1 << 27;
        /// Abort the transaction on cap exceeded
        const CAP_EXCEEDED_ABORT_EN = 1 << 26;
        /// Interrupt on cap exceeded
        const CAP_EXCEEDED_INT_EN = 1 << 25;
        /// Raise exception on cap exceeded
        const CAP_EXCEEDED_EXCEPTION_EN = 1 << 24;
        /// Sticky: walk hit an invalid entry
        const PT_INVALID = 1 << 20;
        /// Abort the transaction on invalid entry
        const PT_INVALID_ABORT_EN = 1 << 19;
        /// Raise exception on invalid entry
        const PT_INVALID_EXCEPTION_EN = 1 << 18;
        /// Interrupt on invalid entry
        const PT_INVALID_EN = 1 << 17;
        /// Sticky: write through a read-only entry
        const WRITE_VIOLATION = 1 << 12;
        /// Abort the transaction on write violation
        const WRITE_VIOLATION_ABORT_EN = 1 << 11;
        /// Interrupt on write violation
        const WRITE_VIOLATION_INT_EN = 1 << 10;
        /// Raise exception on write violation
        const WRITE_VIOLATION_EXCEPTION_EN = 1 << 9;
        /// Global bypass
        const BYPASS = 1 << 8;
        /// Status: translation cache clear in progress
        const TLB_CLEARING = 1 << 7;
        /// Reset the statistics counters
        const STATS_CLEAR = 1 << 3;
        /// Start a full translation cache clear
        const TLB_CLEAR = 1 << 2;
        /// Enable the statistics counters
        const STATS_ENABLE = 1 << 1;
        /// Enable translation
        const ENABLE = 1 << 0;
    }
}

impl Ctrl {
    /// Sticky fault flags
    pub const FAULTS: Self = Self::CAP_EXCEEDED
        .union(Self::PT_INVALID)
        .union(Self::WRITE_VIOLATION);

    /// Fault routing: every fault class aborts the transaction and interrupts
    pub const FAULT_REPORTING: Self = Self::CAP_EXCEEDED_ABORT_EN
        .union(Self::CAP_EXCEEDED_INT_EN)
        .union(Self::PT_INVALID_ABORT_EN)
        .union(Self::PT_INVALID_EN)
        .union(Self::WRITE_VIOLATION_ABORT_EN)
        .union(Self::WRITE_VIOLATION_INT_EN);

    /// Value written to run translation
    pub const RUNNING: Self = Self::FAULT_REPORTING
        .union(Self::STATS_ENABLE)
        .union(Self::ENABLE);

    /// Value written to stop translation, clear sticky state and flush
    pub const RESET: Self = Self::FAULTS
        .union(Self::STATS_CLEAR)
        .union(Self::TLB_CLEAR);
}

/// ADDR_CAP: enable bit
pub const ADDR_CAP_ENABLE: u32 = 1 << 31;

/// SHOOT_DOWN: command still in flight
pub const SHOOT_DOWN_SHOOTING: u32 = 1 << 31;
/// SHOOT_DOWN: issue command for the page number in the low bits
pub const SHOOT_DOWN_SHOOT: u32 = 1 << 30;

/// BYPASS_START: enable bit
pub const BYPASS_START_ENABLE: u32 = 1 << 31;
/// BYPASS_START: pass through addresses outside, not inside, the bracket
pub const BYPASS_START_INVERT: u32 = 1 << 30;
/// BYPASS_END: enable bit
pub const BYPASS_END_ENABLE: u32 = 1 << 31;

/// MISC: single-level table mode
pub const MISC_SINGLE_TABLE: u32 = 1 << 31;

/// ILLEGAL_ADR: enable bit
pub const ILLEGAL_ADR_ENABLE: u32 = 1 << 31;

const_assert_eq!(SHOOT_DOWN_SHOOT & SHOOT_DOWN_SHOOTING, 0);
const_assert_eq!(Ctrl::RUNNING.bits() & Ctrl::TLB_CLEAR.bits(), 0);

// =============================================================================
// REGISTER ACCESS
// =============================================================================

/// 32-bit register access facility for one translation unit
pub trait RegisterIo {
    /// Read the register at `offset`
    fn read32(&self, offset: u32) -> u32;

    /// Write `value` to the register at `offset`
    fn write32(&mut self, offset: u32, value: u32);

    /// Read-modify-write under `mask`
    fn modify32(&mut self, offset: u32, value: u32, mask: u32) {
        let current = self.read32(offset);
        self.write32(offset, (current & !mask) | (value & mask));
    }
}

/// Poll until `(reg & mask) == expected`, at most `limit` reads
///
/// The processor is yielded between reads. Returns the number of reads
/// that observed the condition unmet.
pub fn poll32<R: RegisterIo + ?Sized>(
    regs: &R,
    offset: u32,
    mask: u32,
    expected: u32,
    limit: u32,
) -> Result<u32> {
    for attempt in 0..limit {
        if regs.read32(offset) & mask == expected {
            return Ok(attempt);
        }
        core::hint::spin_loop();
    }

    Err(Error::HardwareTimeout)
}

// =============================================================================
// MMIO REGION
// =============================================================================

/// Memory-mapped register window of one translation unit
#[derive(Debug)]
pub struct MmioRegion {
    /// Kernel virtual address of the window
    base: usize,
    /// Window size in bytes
    size: usize,
}

impl MmioRegion {
    /// Create from a mapped register window
    ///
    /// # Safety
    /// - `base` must be a valid, device-memory mapping of `size` bytes
    /// - The mapping must outlive the region and not be aliased by another
    ///   writer
    pub unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Window size in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

impl RegisterIo for MmioRegion {
    fn read32(&self, offset: u32) -> u32 {
        let offset = offset as usize;
        assert!(offset % 4 == 0 && offset + 4 <= self.size);
        let ptr = (self.base + offset) as *const u32;
        // SAFETY: Bounds and alignment checked above, mapping validity is the
        // constructor's contract
        unsafe { core::ptr::read_volatile(ptr) }
    }

    fn write32(&mut self, offset: u32, value: u32) {
        let offset = offset as usize;
        assert!(offset % 4 == 0 && offset + 4 <= self.size);
        let ptr = (self.base + offset) as *mut u32;
        // SAFETY: Bounds and alignment checked above, mapping validity is the
        // constructor's contract
        unsafe { core::ptr::write_volatile(ptr, value) }
    }
}
