//! # Page Table Entry Format
//!
//! One 32-bit word describes one native 4 KiB page:
//!
//! ```text
//!  31  30 29  28 27                                  0
//! ┌──────┬───┬───┬────────────────────────────────────┐
//! │ size │ W │ V │       physical page number         │
//! └──────┴───┴───┴────────────────────────────────────┘
//! ```
//!
//! An all-zero word is invalid; freshly zeroed and unmapped entries rely on
//! this. Top-level (directory) entries use the same layout with only the
//! valid bit and the page number of a leaf table page.

use core::fmt;

use static_assertions::{assert_eq_size, const_assert_eq};

// =============================================================================
// Entry Constants
// =============================================================================

/// Page size class field (bits 31:30)
pub const PTE_PAGESIZE_SHIFT: u32 = 30;
/// Page size class mask
pub const PTE_PAGESIZE_MASK: u32 = 0x3 << PTE_PAGESIZE_SHIFT;

/// Entry may be written through
pub const PTE_WRITEABLE: u32 = 1 << 29;

/// Entry is valid
pub const PTE_VALID: u32 = 1 << 28;

/// Physical page number (bits 27:0)
pub const PTE_PPN_MASK: u32 = 0x0FFF_FFFF;

const_assert_eq!(PTE_PAGESIZE_MASK & (PTE_WRITEABLE | PTE_VALID | PTE_PPN_MASK), 0);
const_assert_eq!(PTE_PAGESIZE_MASK | PTE_WRITEABLE | PTE_VALID | PTE_PPN_MASK, u32::MAX);

// =============================================================================
// Page Size Class
// =============================================================================

/// Page size class hint stored in a leaf entry
///
/// The table always holds one entry per native page; the class tells the
/// walker how many neighbouring entries it may fold into one cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageSize {
    /// Native 4 KiB page
    Base = 0,
    /// Hardware "big" page (typically 64 KiB)
    Big = 1,
    /// Hardware "super" page (typically 1 MiB)
    Super = 2,
    /// 4 MiB, the span of one leaf table page
    Huge = 3,
}

impl PageSize {
    /// Convert to entry bits
    pub const fn to_bits(self) -> u32 {
        (self as u32) << PTE_PAGESIZE_SHIFT
    }

    /// Create from entry bits
    pub const fn from_bits(bits: u32) -> Self {
        match (bits & PTE_PAGESIZE_MASK) >> PTE_PAGESIZE_SHIFT {
            0 => Self::Base,
            1 => Self::Big,
            2 => Self::Super,
            _ => Self::Huge,
        }
    }
}

// =============================================================================
// Page Table Entry
// =============================================================================

/// A single table word
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

assert_eq_size!(PageTableEntry, u32);

impl PageTableEntry {
    /// The invalid entry
    pub const INVALID: Self = Self(0);

    /// Pack a valid leaf entry
    ///
    /// # Panics
    ///
    /// Panics if `ppn` does not fit the 28-bit page number field.
    pub const fn encode(ppn: u32, writable: bool, size: PageSize) -> Self {
        assert!(ppn <= PTE_PPN_MASK);
        let mut word = PTE_VALID | size.to_bits() | ppn;
        if writable {
            word |= PTE_WRITEABLE;
        }
        Self(word)
    }

    /// Pack a top-level entry pointing at a leaf table page
    pub const fn directory(ppn: u32) -> Self {
        assert!(ppn <= PTE_PPN_MASK);
        Self(PTE_VALID | ppn)
    }

    /// Interpret a raw table word
    #[inline]
    pub const fn decode(word: u32) -> Self {
        Self(word)
    }

    /// Raw table word
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check the valid bit
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & PTE_VALID != 0
    }

    /// Check the writable bit
    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & PTE_WRITEABLE != 0
    }

    /// Page size class
    #[inline]
    pub const fn page_size(self) -> PageSize {
        PageSize::from_bits(self.0)
    }

    /// Physical page number
    #[inline]
    pub const fn ppn(self) -> u32 {
        self.0 & PTE_PPN_MASK
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "PageTableEntry(invalid, 0x{:08x})", self.0);
        }
        f.debug_struct("PageTableEntry")
            .field("ppn", &format_args!("0x{:07x}", self.ppn()))
            .field("writable", &self.is_writable())
            .field("size", &self.page_size())
            .finish()
    }
}
