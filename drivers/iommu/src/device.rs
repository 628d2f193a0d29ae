//! # IOMMU Device Handle
//!
//! Owned handle to one translation unit: its registers and, when the unit
//! sits behind one, the shared second-level translation cache.
//!
//! The handle is moved into a domain on attach and handed back through the
//! instance's [`UnitSlot`] when the domain goes away; nothing else touches
//! the registers in between.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::domain::DomainId;
use crate::regs::{offsets, Ctrl, RegisterIo};

// =============================================================================
// SHARED CACHE
// =============================================================================

/// Second-level translation cache shared by several units
pub trait SharedTlbCache: Send + Sync {
    /// Drop every cached translation
    fn flush(&self);
}

// =============================================================================
// HARDWARE STATISTICS
// =============================================================================

/// Translation cache counters maintained by the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwStats {
    /// Cache hits
    pub hits: u32,
    /// Cache misses
    pub misses: u32,
    /// Stall cycles waiting on table walks
    pub stalls: u32,
}

// =============================================================================
// DEVICE
// =============================================================================

/// Owned translation unit
pub struct IommuDevice<R: RegisterIo> {
    /// Unit name, used to match DMA masters
    name: &'static str,
    /// Register window
    regs: R,
    /// Optional shared cache in front of the unit
    cache: Option<Arc<dyn SharedTlbCache>>,
}

impl<R: RegisterIo> IommuDevice<R> {
    /// Wrap a register window
    pub fn new(name: &'static str, regs: R, cache: Option<Arc<dyn SharedTlbCache>>) -> Self {
        Self { name, regs, cache }
    }

    /// Unit name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register access
    pub fn regs(&self) -> &R {
        &self.regs
    }

    /// Mutable register access
    pub fn regs_mut(&mut self) -> &mut R {
        &mut self.regs
    }

    /// Whether a shared cache sits in front of the unit
    pub fn has_shared_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Raw capability readout
    pub fn debug_info(&self) -> u32 {
        self.regs.read32(offsets::DEBUG_INFO)
    }

    /// Flush the shared cache, if any
    pub fn flush_shared_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.flush();
        }
    }

    /// Read the hardware translation counters
    pub fn hw_stats(&self) -> HwStats {
        HwStats {
            hits: self.regs.read32(offsets::HIT),
            misses: self.regs.read32(offsets::MISS),
            stalls: self.regs.read32(offsets::STALL),
        }
    }

    /// Sticky fault flags currently latched
    pub fn fault_status(&self) -> Ctrl {
        Ctrl::from_bits_truncate(self.regs.read32(offsets::CTRL)).intersection(Ctrl::FAULTS)
    }

    /// Stop translating
    pub fn disable(&mut self) {
        self.regs.write32(offsets::CTRL, 0);
    }
}

impl<R: RegisterIo> fmt::Debug for IommuDevice<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IommuDevice")
            .field("name", &self.name)
            .field("shared_cache", &self.cache.is_some())
            .finish()
    }
}

// =============================================================================
// UNIT SLOT
// =============================================================================

/// Resources an instance owns while no domain holds them
///
/// Shared between an instance and every domain it allocated. A domain that
/// goes away parks its hardware handle and table memory here; the instance
/// picks the memory up and returns it to its allocator.
pub(crate) struct UnitSlot<M, R: RegisterIo> {
    /// Hardware handle while no domain holds it
    pub(crate) device: Option<IommuDevice<R>>,
    /// Domain holding the hardware
    pub(crate) attached: Option<DomainId>,
    /// Table memory of dropped domains, not yet released
    pub(crate) returned: Vec<M>,
}

/// Slot handle shared by an instance and its domains
pub(crate) type SharedSlot<M, R> = Arc<Mutex<UnitSlot<M, R>>>;

impl<M, R: RegisterIo> UnitSlot<M, R> {
    pub(crate) fn shared(device: Option<IommuDevice<R>>) -> SharedSlot<M, R> {
        Arc::new(Mutex::new(Self {
            device,
            attached: None,
            returned: Vec::new(),
        }))
    }
}
