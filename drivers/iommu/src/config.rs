//! # IOMMU Configuration
//!
//! Driver-side policy for one translation unit. Everything here is checked
//! against the hardware capabilities by the geometry planner before use.

/// Default aperture base: translated window starts at 40 GiB
pub const DEFAULT_APERTURE_BASE: u64 = 40 << 30;
/// Default aperture size: 2 GiB of translated IOVA
pub const DEFAULT_APERTURE_SIZE: u64 = 2 << 30;
/// Default host page shift (4 KiB)
pub const DEFAULT_HOST_PAGE_SHIFT: u32 = 12;
/// Default bound on hardware acknowledgement polls
pub const DEFAULT_POLL_LIMIT: u32 = 1024;

/// Granule of one ranged-shootdown command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShootdownGranule {
    /// One native page per command
    Page,
    /// One cache line (four leaf entries) per command
    Line,
}

impl ShootdownGranule {
    /// log2 of native pages invalidated per command
    pub const fn pages_shift(self) -> u32 {
        match self {
            Self::Page => 0,
            Self::Line => 2,
        }
    }
}

/// Translation unit configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IommuConfig {
    /// First translated IOVA (before the DMA offset is applied)
    pub aperture_base: u64,
    /// Size of the translated window in bytes
    pub aperture_size: u64,
    /// Offset the bus adds to every IOVA seen by this unit
    pub dma_iova_offset: u64,
    /// log2 of the host page size the table allocator hands out
    pub host_page_shift: u32,
    /// Ranged invalidation granule
    pub shootdown_granule: ShootdownGranule,
    /// Maximum register reads while waiting for an acknowledgement
    pub poll_limit: u32,
}

impl IommuConfig {
    /// Configuration matching the reference hardware layout
    pub const fn new() -> Self {
        Self {
            aperture_base: DEFAULT_APERTURE_BASE,
            aperture_size: DEFAULT_APERTURE_SIZE,
            dma_iova_offset: 0,
            host_page_shift: DEFAULT_HOST_PAGE_SHIFT,
            shootdown_granule: ShootdownGranule::Line,
            poll_limit: DEFAULT_POLL_LIMIT,
        }
    }

    /// Set the translated window
    pub const fn with_aperture(mut self, base: u64, size: u64) -> Self {
        self.aperture_base = base;
        self.aperture_size = size;
        self
    }

    /// Set the bus DMA offset
    pub const fn with_dma_iova_offset(mut self, offset: u64) -> Self {
        self.dma_iova_offset = offset;
        self
    }

    /// Set the host page shift
    pub const fn with_host_page_shift(mut self, shift: u32) -> Self {
        self.host_page_shift = shift;
        self
    }

    /// Set the shootdown granule
    pub const fn with_shootdown_granule(mut self, granule: ShootdownGranule) -> Self {
        self.shootdown_granule = granule;
        self
    }

    /// Set the acknowledgement poll bound
    pub const fn with_poll_limit(mut self, limit: u32) -> Self {
        self.poll_limit = limit;
        self
    }
}

impl Default for IommuConfig {
    fn default() -> Self {
        Self::new()
    }
}
