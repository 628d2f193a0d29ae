//! # Geometry Planner
//!
//! Derives the fixed table layout from the capability readout and the
//! driver configuration. Computed once at probe; immutable afterwards.
//!
//! ## Table Layout
//!
//! ```text
//! word 0                  translated_pages      + leaf_pages
//! ┌───────────────────────┬─────────────────────┬──────────┬──────────────┐
//! │   leaf entries        │  top-level entries  │ (pad to  │ catch page   │
//! │ 1 per native page     │  1 per leaf page    │ host pg) │ (all zero)   │
//! └───────────────────────┴─────────────────────┴──────────┴──────────────┘
//! ```

use crate::config::{IommuConfig, ShootdownGranule};
use crate::error::{ConfigError, Result};
use crate::pte::PageSize;

// =============================================================================
// Fixed Hardware Constants
// =============================================================================

/// Native page shift (4 KiB)
pub const NATIVE_PAGE_SHIFT: u32 = 12;
/// Native page size
pub const NATIVE_PAGE_SIZE: u64 = 1 << NATIVE_PAGE_SHIFT;
/// Bytes per table word
pub const PTE_BYTES: u64 = 4;
/// log2 of table words per native page
pub const PAGEWORDS_SHIFT: u32 = NATIVE_PAGE_SHIFT - 2;
/// Huge page shift: the span of one leaf table page (4 MiB)
pub const HUGE_PAGE_SHIFT: u32 = NATIVE_PAGE_SHIFT + PAGEWORDS_SHIFT;
/// Huge page size
pub const HUGE_PAGE_SIZE: u64 = 1 << HUGE_PAGE_SHIFT;
/// Span of one top-level table page (4 GiB)
pub const L1_CHUNK_SHIFT: u32 = NATIVE_PAGE_SHIFT + 2 * PAGEWORDS_SHIFT;
/// Address cap granule (256 MiB)
pub const ADDR_CAP_SHIFT: u32 = 28;

/// Shootdown commands carry a 30-bit page number
pub const MAX_APERTURE_TOP: u64 = 1 << (30 + NATIVE_PAGE_SHIFT);

/// Oldest table format with two-level tables
pub const MIN_VERSION: u8 = 4;
/// Smallest usable VA/PA width field
pub const MIN_ADDR_WIDTH: u8 = 6;

/// Ranges of at least `aperture / FULL_CLEAR_DIVISOR` use a full clear
pub const FULL_CLEAR_DIVISOR: u64 = 8;

/// Page sizes advertised to the IOMMU framework
pub const PAGE_SIZE_BITMAP: u64 =
    (4 << 20) | (2 << 20) | (1 << 20) | (64 << 10) | (16 << 10) | (4 << 10);

// =============================================================================
// Capability Readout
// =============================================================================

/// Decoded DEBUG_INFO register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Table format version
    pub version: u8,
    /// Virtual address width field
    pub va_width: u8,
    /// Physical address width field
    pub pa_width: u8,
    /// log2 of native pages per big page (0: no big pages)
    pub bigpage_width: u8,
    /// log2 of native pages per super page (0: no super pages)
    pub superpage_width: u8,
    /// Bypass registers count in 4 MiB rather than 256 MiB units
    pub bypass_4m: bool,
    /// Bypass bracket supported
    pub bypass: bool,
}

impl Capabilities {
    const VERSION_MASK: u32 = 0x0000_000F;
    const VA_WIDTH_MASK: u32 = 0x0000_00F0;
    const PA_WIDTH_MASK: u32 = 0x0000_0F00;
    const BIGPAGE_WIDTH_MASK: u32 = 0x000F_F000;
    const SUPERPAGE_WIDTH_MASK: u32 = 0x0FF0_0000;
    const BYPASS_4M: u32 = 1 << 28;
    const BYPASS: u32 = 1 << 29;

    /// Decode a raw DEBUG_INFO value
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            version: field(raw, Self::VERSION_MASK),
            va_width: field(raw, Self::VA_WIDTH_MASK),
            pa_width: field(raw, Self::PA_WIDTH_MASK),
            bigpage_width: field(raw, Self::BIGPAGE_WIDTH_MASK),
            superpage_width: field(raw, Self::SUPERPAGE_WIDTH_MASK),
            bypass_4m: raw & Self::BYPASS_4M != 0,
            bypass: raw & Self::BYPASS != 0,
        }
    }

    /// Reject hardware the two-level design cannot drive
    pub fn validate(&self) -> core::result::Result<(), ConfigError> {
        if self.version < MIN_VERSION {
            return Err(ConfigError::VersionTooOld(self.version));
        }
        if self.va_width < MIN_ADDR_WIDTH {
            return Err(ConfigError::VaWidthTooSmall(self.va_width));
        }
        if self.pa_width < MIN_ADDR_WIDTH {
            return Err(ConfigError::PaWidthTooSmall(self.pa_width));
        }
        if !self.bypass {
            return Err(ConfigError::NoBypass);
        }
        Ok(())
    }
}

/// Extract a masked field
const fn field(raw: u32, mask: u32) -> u8 {
    ((raw & mask) >> mask.trailing_zeros()) as u8
}

/// Alignment mask covering `width` page-number bits above the native page
const fn class_mask(width: u8) -> u64 {
    if width == 0 || width as u32 >= 32 {
        return 0;
    }
    ((1u64 << width) - 1) << NATIVE_PAGE_SHIFT
}

// =============================================================================
// Geometry
// =============================================================================

/// Immutable layout constants for one translation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    caps: Capabilities,
    aperture_base: u64,
    aperture_size: u64,
    dma_iova_offset: u64,
    host_page_shift: u32,
    bigpage_mask: u64,
    superpage_mask: u64,
    bypass_shift: u32,
    shootdown_granule: ShootdownGranule,
    poll_limit: u32,
}

impl Geometry {
    /// Plan the layout from a raw capability word and configuration
    pub fn plan(debug_info: u32, config: &IommuConfig) -> Result<Self> {
        let caps = Capabilities::from_raw(debug_info);
        caps.validate()?;

        let base = config.aperture_base;
        let size = config.aperture_size;
        let top = base.checked_add(size).ok_or(ConfigError::InvalidAperture)?;
        if size == 0
            || size > (1 << L1_CHUNK_SHIFT)
            || size % (1 << ADDR_CAP_SHIFT) != 0
            || base % (1 << L1_CHUNK_SHIFT) != 0
            || top > MAX_APERTURE_TOP
            || config.dma_iova_offset.checked_add(top).is_none()
        {
            return Err(ConfigError::InvalidAperture.into());
        }

        let host_shift = config.host_page_shift;
        if host_shift < NATIVE_PAGE_SHIFT || host_shift > HUGE_PAGE_SHIFT {
            return Err(ConfigError::InvalidHostPage.into());
        }
        let leaf_pages = (size >> NATIVE_PAGE_SHIFT) >> PAGEWORDS_SHIFT;
        if leaf_pages % (1 << (host_shift - NATIVE_PAGE_SHIFT)) != 0 {
            return Err(ConfigError::InvalidHostPage.into());
        }

        let bypass_shift = if caps.bypass_4m {
            HUGE_PAGE_SHIFT
        } else {
            ADDR_CAP_SHIFT
        };

        Ok(Self {
            caps,
            aperture_base: base,
            aperture_size: size,
            dma_iova_offset: config.dma_iova_offset,
            host_page_shift: host_shift,
            bigpage_mask: class_mask(caps.bigpage_width),
            superpage_mask: class_mask(caps.superpage_width),
            bypass_shift,
            shootdown_granule: config.shootdown_granule,
            poll_limit: config.poll_limit,
        })
    }

    /// Decoded capabilities
    pub const fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// First translated address, in the unit's own address space
    pub const fn aperture_base(&self) -> u64 {
        self.aperture_base
    }

    /// Translated window size
    pub const fn aperture_size(&self) -> u64 {
        self.aperture_size
    }

    /// One past the last translated address
    pub const fn aperture_top(&self) -> u64 {
        self.aperture_base + self.aperture_size
    }

    /// Bus offset added to every IOVA
    pub const fn dma_iova_offset(&self) -> u64 {
        self.dma_iova_offset
    }

    /// Number of native pages in the aperture (= leaf entries)
    pub const fn translated_pages(&self) -> usize {
        (self.aperture_size >> NATIVE_PAGE_SHIFT) as usize
    }

    /// Number of leaf table pages (= top-level entries)
    pub const fn leaf_pages(&self) -> usize {
        self.translated_pages() >> PAGEWORDS_SHIFT
    }

    /// Host page size used by the table allocator
    pub const fn host_page_size(&self) -> u64 {
        1 << self.host_page_shift
    }

    /// Native pages per host page
    pub const fn native_pages_per_host_page(&self) -> usize {
        1 << (self.host_page_shift - NATIVE_PAGE_SHIFT)
    }

    /// Bytes of table memory: leaf pages plus top-level and catch host pages
    pub const fn table_alloc_size(&self) -> usize {
        (self.leaf_pages() as u64 * NATIVE_PAGE_SIZE + 2 * self.host_page_size()) as usize
    }

    /// Host pages of table memory
    pub const fn table_host_pages(&self) -> usize {
        self.table_alloc_size() >> self.host_page_shift
    }

    /// Words of table memory
    pub const fn table_words(&self) -> usize {
        self.table_alloc_size() / PTE_BYTES as usize
    }

    /// Word index of the first top-level entry
    pub const fn directory_offset(&self) -> usize {
        self.translated_pages()
    }

    /// Word index of the catch page
    pub const fn catch_page_offset(&self) -> usize {
        (self.leaf_pages() as u64 * NATIVE_PAGE_SIZE + self.host_page_size()) as usize
            / PTE_BYTES as usize
    }

    /// Big page alignment mask (0 when unsupported)
    pub const fn bigpage_mask(&self) -> u64 {
        self.bigpage_mask
    }

    /// Super page alignment mask (0 when unsupported)
    pub const fn superpage_mask(&self) -> u64 {
        self.superpage_mask
    }

    /// Granule shift of the bypass registers
    pub const fn bypass_shift(&self) -> u32 {
        self.bypass_shift
    }

    /// Ranged invalidation granule
    pub const fn shootdown_granule(&self) -> ShootdownGranule {
        self.shootdown_granule
    }

    /// Acknowledgement poll bound
    pub const fn poll_limit(&self) -> u32 {
        self.poll_limit
    }

    /// Range length from which a full clear beats ranged shootdown
    pub const fn full_clear_threshold(&self) -> u64 {
        self.aperture_size / FULL_CLEAR_DIVISOR
    }

    /// Largest size class whose alignment divides `alignment`
    ///
    /// `alignment` is `iova | phys | bytes`. Greedy per request, not per page.
    pub const fn page_size_for(&self, alignment: u64) -> PageSize {
        if alignment & (HUGE_PAGE_SIZE - 1) == 0 {
            PageSize::Huge
        } else if self.superpage_mask != 0 && alignment & self.superpage_mask == 0 {
            PageSize::Super
        } else if self.bigpage_mask != 0 && alignment & self.bigpage_mask == 0 {
            PageSize::Big
        } else {
            PageSize::Base
        }
    }

    /// Page sizes advertised to the framework
    pub const fn page_size_bitmap(&self) -> u64 {
        PAGE_SIZE_BITMAP
    }
}
