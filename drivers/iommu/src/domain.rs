//! # Translation Domain
//!
//! One address space: a page table, the aperture it covers, the dirty flag,
//! the populated-entry count and, while attached, the hardware handle.
//!
//! ## Locking
//!
//! All of the mutable state sits behind one `spin::Mutex`. Map, unmap,
//! sync and the table read of a translation query take it; invalidation
//! counters are atomics and readable without it.
//!
//! ## Address spaces
//!
//! Callers use framework IOVAs. The unit sees them minus the bus DMA
//! offset, and table indices are relative to the aperture base.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::Range;

use spin::Mutex;

use crate::aperture;
use crate::coherency::{self, CoherencyState, Invalidation, InvalidationCounts, InvalidationStats};
use crate::device::{HwStats, IommuDevice, SharedSlot};
use crate::error::{Error, Result};
use crate::gather::IotlbGather;
use crate::geometry::{Geometry, NATIVE_PAGE_SHIFT, NATIVE_PAGE_SIZE};
use crate::memory::TableMemory;
use crate::pte::{PageTableEntry, PTE_PPN_MASK};
use crate::regs::{Ctrl, RegisterIo};
use crate::table::PageTable;
use crate::types::{Iova, IovaRange, PhysAddr};

// =============================================================================
// Domain Identity
// =============================================================================

/// Domain identifier, unique per translation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub(crate) u32);

impl DomainId {
    /// Raw identifier
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain{}", self.0)
    }
}

/// Kind of domain requested by the framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainType {
    /// Driver-managed address space
    Unmanaged,
    /// Address space managed by the DMA API
    Dma,
    /// Untranslated one-to-one mapping
    Identity,
    /// All DMA blocked
    Blocked,
}

impl DomainType {
    /// Whether this hardware can back the domain type
    pub const fn is_supported(self) -> bool {
        matches!(self, Self::Unmanaged | Self::Dma)
    }
}

/// Translated IOVA window as reported to the framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainGeometry {
    /// First translated IOVA
    pub aperture_start: Iova,
    /// Last translated IOVA (inclusive)
    pub aperture_end: Iova,
    /// Addresses outside the aperture must not be mapped
    pub force_aperture: bool,
}

// =============================================================================
// Domain State
// =============================================================================

/// State guarded by the domain lock
struct DomainState<M: TableMemory, R: RegisterIo> {
    /// Page table, moved out only on drop
    table: ManuallyDrop<PageTable<M>>,
    /// Hardware handle while attached
    device: Option<IommuDevice<R>>,
    /// CPU/device ownership of the table
    coherency: CoherencyState,
    /// Valid leaf entries
    populated: usize,
}

// =============================================================================
// Translation Domain
// =============================================================================

/// Translation domain backed by one two-level page table
///
/// Created by [`crate::Iommu::alloc_domain`], attached to the unit with
/// [`crate::Iommu::attach`] and handed back with
/// [`crate::Iommu::free_domain`].
///
/// Dropping a domain publishes its table, disables translation and parks
/// the hardware and table memory with the instance that allocated it, so a
/// domain lost on an error path never leaves the unit walking freed memory.
pub struct TranslationDomain<M: TableMemory, R: RegisterIo> {
    /// Identifier
    id: DomainId,
    /// Requested type
    kind: DomainType,
    /// Layout of the unit this domain was planned for
    geometry: Geometry,
    /// Table, hardware handle and bookkeeping
    state: Mutex<DomainState<M, R>>,
    /// Invalidation counters
    stats: InvalidationStats,
    /// Owning instance's slot
    slot: SharedSlot<M, R>,
}

impl<M: TableMemory, R: RegisterIo> TranslationDomain<M, R> {
    pub(crate) fn new(
        id: DomainId,
        kind: DomainType,
        geometry: Geometry,
        table: PageTable<M>,
        slot: SharedSlot<M, R>,
    ) -> Self {
        Self {
            id,
            kind,
            geometry,
            state: Mutex::new(DomainState {
                table: ManuallyDrop::new(table),
                device: None,
                coherency: CoherencyState::Clean,
                populated: 0,
            }),
            stats: InvalidationStats::default(),
            slot,
        }
    }

    // =========================================================================
    // Attach / Detach
    // =========================================================================

    /// Take ownership of the unit and program it to walk this table
    ///
    /// The device is handed back alongside the error when configuration
    /// fails, so the caller never loses the hardware.
    pub(crate) fn attach_device(
        &self,
        mut device: IommuDevice<R>,
    ) -> core::result::Result<(), (Error, IommuDevice<R>)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.device.is_some() {
            return Err((Error::AlreadyAttached, device));
        }
        if let Err(e) = aperture::configure(&mut device, &mut *state.table, &self.geometry) {
            return Err((e, device));
        }

        state.populated = 0;
        state.coherency = CoherencyState::Clean;
        log::info!("{}: {} attached", device.name(), self.id);
        state.device = Some(device);
        Ok(())
    }

    /// Publish outstanding writes, stop translation and give the unit back
    pub(crate) fn detach_device(&self) -> Option<IommuDevice<R>> {
        self.sync_all();

        let mut device = self.state.lock().device.take()?;
        device.disable();
        log::info!("{}: {} detached", device.name(), self.id);
        Some(device)
    }

    /// Whether this domain was allocated through `slot`
    pub(crate) fn belongs_to(&self, slot: &SharedSlot<M, R>) -> bool {
        alloc::sync::Arc::ptr_eq(&self.slot, slot)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Domain identifier
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// Domain type
    pub fn kind(&self) -> DomainType {
        self.kind
    }

    /// Translated window in framework IOVAs
    pub fn geometry(&self) -> DomainGeometry {
        let offset = self.geometry.dma_iova_offset();
        DomainGeometry {
            aperture_start: Iova::new(offset + self.geometry.aperture_base()),
            aperture_end: Iova::new(offset + self.geometry.aperture_top() - 1),
            force_aperture: true,
        }
    }

    /// Whether a translation unit is attached
    pub fn is_attached(&self) -> bool {
        self.state.lock().device.is_some()
    }

    /// Valid leaf entries
    pub fn populated_pages(&self) -> usize {
        self.state.lock().populated
    }

    /// Whether the table has writes the walker cannot see yet
    pub fn is_dirty(&self) -> bool {
        self.state.lock().coherency.is_dirty()
    }

    /// Invalidation counters
    pub fn invalidation_stats(&self) -> InvalidationCounts {
        self.stats.snapshot()
    }

    /// Sticky fault flags of the attached unit
    pub fn fault_status(&self) -> Option<Ctrl> {
        self.state.lock().device.as_ref().map(|d| d.fault_status())
    }

    /// Translation cache counters of the attached unit
    pub fn hw_stats(&self) -> Option<HwStats> {
        self.state.lock().device.as_ref().map(|d| d.hw_stats())
    }

    // =========================================================================
    // Mapping
    // =========================================================================

    /// Leaf indices covering `[iova, iova + bytes)`
    ///
    /// Fails with [`Error::OutOfRange`] unless the whole range lies inside
    /// the aperture, and with [`Error::Misaligned`] unless it starts and
    /// ends on native page boundaries.
    fn leaf_range(&self, iova: Iova, bytes: u64) -> Result<Range<usize>> {
        let offset = self.geometry.dma_iova_offset();
        let base = offset + self.geometry.aperture_base();
        let top = offset + self.geometry.aperture_top();

        let end = iova.checked_add(bytes).ok_or(Error::OutOfRange)?;
        if iova.raw() < base || end.raw() > top {
            return Err(Error::OutOfRange);
        }
        if !iova.is_aligned(NATIVE_PAGE_SIZE) || bytes % NATIVE_PAGE_SIZE != 0 {
            return Err(Error::Misaligned);
        }

        let first = ((iova.raw() - base) >> NATIVE_PAGE_SHIFT) as usize;
        let last = ((end.raw() - base) >> NATIVE_PAGE_SHIFT) as usize;
        Ok(first..last)
    }

    /// Map `[iova, iova + bytes)` to `[phys, phys + bytes)`
    ///
    /// Every native page gets its own entry with consecutive page numbers;
    /// all of them carry the size class chosen from `iova | phys | bytes`.
    /// The range is validated before any entry is written. Returns the
    /// number of bytes mapped.
    pub fn map(&self, iova: Iova, phys: PhysAddr, bytes: u64, writable: bool) -> Result<u64> {
        if bytes == 0 {
            return Ok(0);
        }

        let leaves = match self.leaf_range(iova, bytes) {
            Ok(leaves) => leaves,
            Err(e) => {
                log::warn!("map iova={} phys={} bytes={:#x}: {}", iova, phys, bytes, e);
                return Err(e);
            }
        };
        if !phys.is_aligned(NATIVE_PAGE_SIZE) {
            log::warn!("map iova={} phys={} bytes={:#x}: {}", iova, phys, bytes, Error::Misaligned);
            return Err(Error::Misaligned);
        }
        let first_ppn = phys.raw() >> NATIVE_PAGE_SHIFT;
        if first_ppn + leaves.len() as u64 > PTE_PPN_MASK as u64 + 1 {
            log::warn!("map phys={} bytes={:#x}: beyond addressable memory", phys, bytes);
            return Err(Error::OutOfRange);
        }

        let size = self.geometry.page_size_for(iova.raw() | phys.raw() | bytes);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.device.is_none() {
            return Err(Error::NotAttached);
        }

        state.coherency.mark_dirty(&mut *state.table);
        let words = state
            .table
            .leaf_words_mut(leaves)
            .ok_or(Error::OutOfRange)?;

        let mut populated = 0;
        for (i, word) in words.iter_mut().enumerate() {
            if !PageTableEntry::decode(*word).is_valid() {
                populated += 1;
            }
            *word = PageTableEntry::encode(first_ppn as u32 + i as u32, writable, size).raw();
        }
        state.populated += populated;

        log::trace!("{}: mapped {} -> {} ({:#x}, {:?})", self.id, iova, phys, bytes, size);
        Ok(bytes)
    }

    /// Unmap `[iova, iova + bytes)`
    ///
    /// Cleared entries read as invalid, so later device accesses fault.
    /// The range is added to `gather` for a later [`Self::iotlb_sync`].
    /// Returns the number of bytes unmapped.
    pub fn unmap(&self, iova: Iova, bytes: u64, gather: &mut IotlbGather) -> Result<u64> {
        if bytes == 0 {
            return Ok(0);
        }

        let leaves = match self.leaf_range(iova, bytes) {
            Ok(leaves) => leaves,
            Err(e) => {
                log::warn!("unmap iova={} bytes={:#x}: {}", iova, bytes, e);
                return Err(e);
            }
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.device.is_none() {
            return Err(Error::NotAttached);
        }

        gather.add_range(iova, bytes);
        state.coherency.mark_dirty(&mut *state.table);
        let words = state
            .table
            .leaf_words_mut(leaves)
            .ok_or(Error::OutOfRange)?;

        let mut cleared = 0;
        for word in words.iter_mut() {
            if PageTableEntry::decode(*word).is_valid() {
                cleared += 1;
            }
            *word = PageTableEntry::INVALID.raw();
        }
        state.populated -= cleared;

        log::trace!("{}: unmapped {} ({:#x})", self.id, iova, bytes);
        Ok(bytes)
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Publish the table and invalidate translations for `range`
    ///
    /// Does nothing unless the table is dirty. The range is clamped to the
    /// aperture. Returns the invalidation that was performed.
    pub fn sync(&self, range: IovaRange) -> Invalidation {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(device) = state.device.as_mut() else {
            return Invalidation::Skipped;
        };
        if !state.coherency.is_dirty() {
            self.stats.record_clean_skip();
            return Invalidation::Skipped;
        }

        state.coherency.publish(&mut *state.table);
        device.flush_shared_cache();

        let offset = self.geometry.dma_iova_offset();
        let start = range
            .start
            .raw()
            .saturating_sub(offset)
            .max(self.geometry.aperture_base());
        let end = range
            .end
            .raw()
            .saturating_sub(offset)
            .min(self.geometry.aperture_top());

        let invalidation = coherency::plan(&self.geometry, state.populated, start, end);
        match invalidation {
            Invalidation::FullClear => {
                log::debug!("{}: full clear for [{:#x}, {:#x})", self.id, start, end);
                coherency::full_clear(device.regs_mut(), &self.geometry, &self.stats);
            }
            Invalidation::Shootdown(commands) => {
                log::debug!("{}: {} shootdowns for [{:#x}, {:#x})", self.id, commands, start, end);
                coherency::shootdown(device.regs_mut(), &self.geometry, &self.stats, start, end);
            }
            Invalidation::Skipped => {}
        }
        invalidation
    }

    /// Sync the span gathered by [`Self::unmap`]
    pub fn iotlb_sync(&self, gather: &IotlbGather) -> Invalidation {
        match gather.range() {
            Some(range) => self.sync(range),
            None => Invalidation::Skipped,
        }
    }

    /// Sync after mapping `[iova, iova + size)`
    pub fn iotlb_sync_map(&self, iova: Iova, size: u64) -> Invalidation {
        self.sync(IovaRange::new(iova, size))
    }

    /// Sync the whole aperture
    pub fn sync_all(&self) -> Invalidation {
        let geometry = self.geometry();
        self.sync(IovaRange::new(
            geometry.aperture_start,
            self.geometry.aperture_size(),
        ))
    }

    /// Framework flush hook: [`Self::sync_all`]
    pub fn flush_iotlb_all(&self) -> Invalidation {
        self.sync_all()
    }

    // =========================================================================
    // Translation Query
    // =========================================================================

    /// Leaf entry for `iova`
    pub fn lookup(&self, iova: Iova) -> Result<PageTableEntry> {
        let addr = iova
            .raw()
            .checked_sub(self.geometry.dma_iova_offset())
            .ok_or(Error::OutOfRange)?;
        if addr < self.geometry.aperture_base() || addr >= self.geometry.aperture_top() {
            return Err(Error::OutOfRange);
        }
        let index = ((addr - self.geometry.aperture_base()) >> NATIVE_PAGE_SHIFT) as usize;

        let state = self.state.lock();
        if state.device.is_none() {
            return Err(Error::NotAttached);
        }
        state.table.leaf(index).ok_or(Error::OutOfRange)
    }

    /// Translate `iova` as the unit would
    ///
    /// Addresses below the aperture bypass translation and come back
    /// unchanged apart from the DMA offset. Reads the CPU view of the
    /// table, so unpublished writes are visible here.
    pub fn iova_to_phys(&self, iova: Iova) -> Result<PhysAddr> {
        let addr = iova
            .raw()
            .checked_sub(self.geometry.dma_iova_offset())
            .ok_or(Error::OutOfRange)?;
        if addr < self.geometry.aperture_base() {
            return Ok(PhysAddr::new(addr));
        }

        let entry = self.lookup(iova)?;
        if !entry.is_valid() {
            return Err(Error::NotMapped);
        }
        let page = (entry.ppn() as u64) << NATIVE_PAGE_SHIFT;
        Ok(PhysAddr::new(page + (addr & (NATIVE_PAGE_SIZE - 1))))
    }

    /// Dump valid leaf entries through the log
    #[cfg(feature = "debug")]
    pub fn dump(&self) {
        log::debug!("{} ({:?}):", self.id, self.kind);
        self.state.lock().table.dump();
    }
}

impl<M: TableMemory, R: RegisterIo> Drop for TranslationDomain<M, R> {
    fn drop(&mut self) {
        let device = self.detach_device();

        // SAFETY: `table` is never touched again once the domain is dropping.
        let table = unsafe { ManuallyDrop::take(&mut self.state.get_mut().table) };

        let mut slot = self.slot.lock();
        if let Some(device) = device {
            slot.device = Some(device);
            slot.attached = None;
        }
        slot.returned.push(table.into_memory());
        log::debug!("{}: released", self.id);
    }
}

impl<M: TableMemory, R: RegisterIo> fmt::Debug for TranslationDomain<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationDomain")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("geometry", &self.geometry())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IommuConfig;
    use crate::device::UnitSlot;
    use crate::memory::TableAllocator;
    use crate::pte::PageSize;
    use crate::regs::offsets;
    use crate::testing::{FakeAllocator, FakeCache, FakeRegisters, FakeTableMemory, REFERENCE_DEBUG_INFO};
    use alloc::sync::Arc;

    type TestDomain = TranslationDomain<FakeTableMemory, FakeRegisters>;

    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;

    fn detached(config: IommuConfig) -> TestDomain {
        detached_in(config, UnitSlot::shared(None))
    }

    fn detached_in(config: IommuConfig, slot: SharedSlot<FakeTableMemory, FakeRegisters>) -> TestDomain {
        let geo = Geometry::plan(REFERENCE_DEBUG_INFO, &config).unwrap();
        let memory = FakeAllocator::new(0x1_0000_0000)
            .allocate(geo.table_alloc_size(), geo.host_page_size())
            .unwrap();
        let table = PageTable::new(memory, &geo).unwrap();
        TranslationDomain::new(DomainId(1), DomainType::Dma, geo, table, slot)
    }

    fn attached(config: IommuConfig) -> (TestDomain, FakeRegisters) {
        let domain = detached(config);
        let regs = FakeRegisters::new(REFERENCE_DEBUG_INFO);
        domain
            .attach_device(IommuDevice::new("mmu0", regs.clone(), None))
            .unwrap();
        (domain, regs)
    }

    /// Aperture at zero, 2 GiB
    fn low_aperture() -> (TestDomain, FakeRegisters) {
        attached(IommuConfig::new().with_aperture(0, 2 * GIB))
    }

    #[test]
    fn test_map_translate_unmap() {
        let (domain, _regs) = low_aperture();

        let mapped = domain
            .map(Iova::new(0x1000), PhysAddr::new(0x9000_0000), 0x1000, true)
            .unwrap();
        assert_eq!(mapped, 0x1000);
        assert_eq!(domain.iova_to_phys(Iova::new(0x1000)), Ok(PhysAddr::new(0x9000_0000)));
        assert_eq!(domain.populated_pages(), 1);

        let mut gather = IotlbGather::new();
        assert_eq!(domain.unmap(Iova::new(0x1000), 0x1000, &mut gather), Ok(0x1000));
        assert_eq!(domain.iova_to_phys(Iova::new(0x1000)), Err(Error::NotMapped));
        assert_eq!(domain.populated_pages(), 0);
    }

    #[test]
    fn test_unmap_restores_invalid_entries() {
        let (domain, _regs) = low_aperture();
        let base = Iova::new(3 * MIB);

        domain.map(base, PhysAddr::new(0x4000_0000), 40 * KIB, false).unwrap();
        assert_eq!(domain.populated_pages(), 10);

        let mut gather = IotlbGather::new();
        domain.unmap(base, 40 * KIB, &mut gather).unwrap();
        for page in 0..10 {
            let entry = domain.lookup(base + page * 4 * KIB).unwrap();
            assert_eq!(entry, PageTableEntry::INVALID);
        }
        assert_eq!(domain.populated_pages(), 0);
    }

    #[test]
    fn test_partial_unmap_keeps_surrounding_entries() {
        let (domain, _regs) = low_aperture();
        let outer = Iova::new(8 * MIB);
        domain.map(outer, PhysAddr::new(0x2000_0000), 64 * KIB, true).unwrap();
        let before: alloc::vec::Vec<_> = (0..16)
            .map(|p| domain.lookup(outer + p * 4 * KIB).unwrap())
            .collect();

        let mut gather = IotlbGather::new();
        domain.unmap(outer + 16 * KIB, 8 * KIB, &mut gather).unwrap();

        for (p, entry) in before.iter().enumerate() {
            let now = domain.lookup(outer + p as u64 * 4 * KIB).unwrap();
            if (4..6).contains(&p) {
                assert!(!now.is_valid());
            } else {
                assert_eq!(now, *entry);
            }
        }
        assert_eq!(domain.populated_pages(), 14);
    }

    #[test]
    fn test_translation_keeps_page_offset() {
        let (domain, _regs) = low_aperture();
        let iova = Iova::new(0x20_0000);
        let phys = PhysAddr::new(0x7654_3000);
        domain.map(iova, phys, 8 * KIB, true).unwrap();

        for k in [0u64, 1, 0x7ff, 0xfff, 0x1000, 0x1abc, 0x1fff] {
            assert_eq!(domain.iova_to_phys(iova + k), Ok(phys + k));
        }
    }

    #[test]
    fn test_out_of_range_map_changes_nothing() {
        let (domain, _regs) = attached(IommuConfig::new());
        let base = 40 * GIB;
        let top = base + 2 * GIB;
        let phys = PhysAddr::new(0x1000_0000);

        domain.map(Iova::new(base), phys, 0x1000, true).unwrap();
        domain.sync_all();

        let rejects = [
            (base - 0x1000, 0x2000),
            (top - 0x1000, 0x2000),
            (top, 0x1000),
            (u64::MAX - 0xfff, 0x1000),
        ];
        for &(iova, bytes) in rejects.iter() {
            assert_eq!(domain.map(Iova::new(iova), phys, bytes, true), Err(Error::OutOfRange));
            let mut gather = IotlbGather::new();
            assert_eq!(domain.unmap(Iova::new(iova), bytes, &mut gather), Err(Error::OutOfRange));
            assert!(gather.is_empty());
        }
        assert_eq!(domain.populated_pages(), 1);
        assert!(!domain.is_dirty());
    }

    #[test]
    fn test_misaligned_requests() {
        let (domain, _regs) = low_aperture();
        let phys = PhysAddr::new(0x1000_0000);
        assert_eq!(domain.map(Iova::new(0x1800), phys, 0x1000, true), Err(Error::Misaligned));
        assert_eq!(domain.map(Iova::new(0x1000), phys + 0x10, 0x1000, true), Err(Error::Misaligned));
        assert_eq!(domain.map(Iova::new(0x1000), phys, 0x1200, true), Err(Error::Misaligned));
        assert_eq!(domain.populated_pages(), 0);
    }

    #[test]
    fn test_phys_beyond_page_number_range() {
        let (domain, _regs) = low_aperture();
        let last_page = PhysAddr::new((PTE_PPN_MASK as u64) << NATIVE_PAGE_SHIFT);
        assert!(domain.map(Iova::new(0), last_page, 0x1000, true).is_ok());
        assert_eq!(
            domain.map(Iova::new(0x1000), last_page, 0x2000, true),
            Err(Error::OutOfRange)
        );
    }

    #[test]
    fn test_zero_length_is_noop() {
        let (domain, _regs) = low_aperture();
        let mut gather = IotlbGather::new();
        assert_eq!(domain.map(Iova::new(0x1000), PhysAddr::new(0), 0, true), Ok(0));
        assert_eq!(domain.unmap(Iova::new(0x1000), 0, &mut gather), Ok(0));
        assert!(!domain.is_dirty());
        assert!(gather.is_empty());
    }

    #[test]
    fn test_requires_attach() {
        let domain = detached(IommuConfig::new().with_aperture(0, 2 * GIB));
        let mut gather = IotlbGather::new();
        assert_eq!(
            domain.map(Iova::new(0x1000), PhysAddr::new(0x1000), 0x1000, true),
            Err(Error::NotAttached)
        );
        assert_eq!(domain.unmap(Iova::new(0x1000), 0x1000, &mut gather), Err(Error::NotAttached));
        assert_eq!(domain.iova_to_phys(Iova::new(0x1000)), Err(Error::NotAttached));
        assert_eq!(domain.sync_all(), Invalidation::Skipped);
    }

    #[test]
    fn test_big_page_selection() {
        let (domain, _regs) = low_aperture();
        let phys = PhysAddr::new(0x3001_0000);

        domain.map(Iova::new(0x10_0000 + 64 * KIB), phys, 64 * KIB, true).unwrap();
        domain
            .map(Iova::new(0x10_0000 + 128 * KIB), phys + 64 * KIB, 64 * KIB, true)
            .unwrap();

        for page in 0..32 {
            let entry = domain.lookup(Iova::new(0x10_0000 + 64 * KIB + page * 4 * KIB)).unwrap();
            assert_eq!(entry.page_size(), PageSize::Big);
            assert_eq!(entry.ppn(), 0x30010 + page as u32);
            assert!(entry.is_writable());
        }
    }

    #[test]
    fn test_size_classes_by_alignment() {
        let (domain, _regs) = low_aperture();
        let cases = [
            (0x40_0000, 0x1_0040_0000, 4 * MIB, PageSize::Huge),
            (0x90_0000, 0x1_0010_0000, MIB, PageSize::Super),
            (0xA0_1000, 0x1_0000_1000, 4 * KIB, PageSize::Base),
        ];
        for &(iova, phys, bytes, class) in cases.iter() {
            domain.map(Iova::new(iova), PhysAddr::new(phys), bytes, false).unwrap();
            assert_eq!(domain.lookup(Iova::new(iova)).unwrap().page_size(), class);
        }
    }

    #[test]
    fn test_remap_is_idempotent() {
        let (domain, _regs) = low_aperture();
        let iova = Iova::new(0x5000);
        let mut gather = IotlbGather::new();

        domain.map(iova, PhysAddr::new(0x1000_0000), 0x2000, true).unwrap();
        domain.map(iova, PhysAddr::new(0x2000_0000), 0x2000, false).unwrap();
        assert_eq!(domain.populated_pages(), 2);

        domain.unmap(iova, 0x2000, &mut gather).unwrap();
        domain.map(iova, PhysAddr::new(0x2000_0000), 0x2000, false).unwrap();
        assert_eq!(domain.populated_pages(), 2);
        assert_eq!(domain.iova_to_phys(iova + 0x1000), Ok(PhysAddr::new(0x2000_1000)));
        assert!(!domain.lookup(iova).unwrap().is_writable());
    }

    #[test]
    fn test_dirty_tracking() {
        let (domain, _regs) = low_aperture();
        assert!(!domain.is_dirty());

        domain.map(Iova::new(0x1000), PhysAddr::new(0x1000_0000), 0x1000, true).unwrap();
        assert!(domain.is_dirty());
        // Queries read the CPU view and leave the table dirty
        assert!(domain.iova_to_phys(Iova::new(0x1000)).is_ok());
        assert!(domain.is_dirty());

        assert_ne!(domain.iotlb_sync_map(Iova::new(0x1000), 0x1000), Invalidation::Skipped);
        assert!(!domain.is_dirty());
        assert_eq!(domain.iotlb_sync_map(Iova::new(0x1000), 0x1000), Invalidation::Skipped);
        assert_eq!(domain.invalidation_stats().clean_skips, 1);
    }

    #[test]
    fn test_large_unmap_uses_full_clear() {
        let (domain, regs) = low_aperture();
        let size = 512 * MIB;
        domain.map(Iova::new(0), PhysAddr::new(0x4000_0000), size, true).unwrap();
        domain.map(Iova::new(GIB), PhysAddr::new(0x1000), 0x1000, true).unwrap();
        domain.sync_all();
        let clears = regs.full_clears();

        let mut gather = IotlbGather::new();
        domain.unmap(Iova::new(0), size, &mut gather).unwrap();
        assert_eq!(domain.iotlb_sync(&gather), Invalidation::FullClear);
        assert_eq!(regs.full_clears(), clears + 1);
        assert!(regs.shootdowns().is_empty());
    }

    #[test]
    fn test_single_page_unmap_uses_shootdown() {
        let (domain, regs) = low_aperture();
        domain.map(Iova::new(0x8000), PhysAddr::new(0x1000_0000), 0x2000, true).unwrap();
        assert_eq!(domain.flush_iotlb_all(), Invalidation::FullClear);

        let mut gather = IotlbGather::new();
        domain.unmap(Iova::new(0x8000), 0x1000, &mut gather).unwrap();
        assert_eq!(domain.iotlb_sync(&gather), Invalidation::Shootdown(1));
        assert_eq!(regs.shootdowns(), [0x8]);
        assert_eq!(domain.invalidation_stats().shootdowns, 1);
    }

    #[test]
    fn test_last_unmap_uses_full_clear() {
        let (domain, _regs) = low_aperture();
        domain.map(Iova::new(0x8000), PhysAddr::new(0x1000_0000), 0x1000, true).unwrap();
        domain.sync_all();

        let mut gather = IotlbGather::new();
        domain.unmap(Iova::new(0x8000), 0x1000, &mut gather).unwrap();
        assert_eq!(domain.iotlb_sync(&gather), Invalidation::FullClear);
    }

    #[test]
    fn test_sync_clamps_to_aperture() {
        let (domain, regs) = attached(IommuConfig::new());
        let base = 40 * GIB;
        domain.map(Iova::new(base), PhysAddr::new(0x1000_0000), 0x2000, true).unwrap();

        // Starts in the bypass region; only the first aperture line is shot
        let range = IovaRange::new(Iova::new(base - 0x10_0000), 0x10_1000);
        assert_eq!(domain.sync(range), Invalidation::Shootdown(1));
        assert_eq!(regs.shootdowns(), [(base >> 12) as u32]);
    }

    #[test]
    fn test_sync_outside_aperture_clears_everything() {
        let (domain, regs) = attached(IommuConfig::new());
        let base = Iova::new(40 * GIB);
        domain.map(base, PhysAddr::new(0x1000_0000), 0x2000, true).unwrap();
        domain.sync_all();
        let clears = regs.full_clears();

        let mut gather = IotlbGather::new();
        domain.unmap(base, 0x1000, &mut gather).unwrap();

        // Range lies in the bypass region, yet the unmap above gets published
        let bypass = IovaRange::new(Iova::new(0x1000), 0x1000);
        assert_eq!(domain.sync(bypass), Invalidation::FullClear);
        assert_eq!(regs.full_clears(), clears + 1);
        assert!(regs.shootdowns().is_empty());
        assert_eq!(domain.iotlb_sync(&gather), Invalidation::Skipped);
    }

    #[test]
    fn test_drop_parks_hardware_and_memory() {
        let slot = UnitSlot::shared(None);
        let domain = detached_in(IommuConfig::new().with_aperture(0, 2 * GIB), slot.clone());
        let regs = FakeRegisters::new(REFERENCE_DEBUG_INFO);
        domain
            .attach_device(IommuDevice::new("mmu0", regs.clone(), None))
            .unwrap();
        slot.lock().attached = Some(domain.id());

        domain.map(Iova::new(0), PhysAddr::new(0x1000), 0x1000, true).unwrap();
        let clears = regs.full_clears();
        drop(domain);

        assert_eq!(regs.full_clears(), clears + 1);
        assert_eq!(regs.reg(offsets::CTRL), 0);
        let parked = slot.lock();
        assert_eq!(parked.device.as_ref().map(|d| d.name()), Some("mmu0"));
        assert_eq!(parked.attached, None);
        assert_eq!(parked.returned.len(), 1);
    }

    #[test]
    fn test_dma_offset_and_bypass() {
        let offset = 0x10_0000_0000;
        let (domain, _regs) = attached(IommuConfig::new().with_dma_iova_offset(offset));
        let base = 40 * GIB;

        let geometry = domain.geometry();
        assert_eq!(geometry.aperture_start, Iova::new(offset + base));
        assert_eq!(geometry.aperture_end, Iova::new(offset + base + 2 * GIB - 1));
        assert!(geometry.force_aperture);

        assert_eq!(domain.iova_to_phys(Iova::new(offset + 0x1234)), Ok(PhysAddr::new(0x1234)));
        assert_eq!(domain.iova_to_phys(Iova::new(offset + base + 2 * GIB)), Err(Error::OutOfRange));
        assert_eq!(domain.iova_to_phys(Iova::new(0x1000)), Err(Error::OutOfRange));

        assert_eq!(
            domain.map(Iova::new(base), PhysAddr::new(0x1000), 0x1000, true),
            Err(Error::OutOfRange)
        );
        domain
            .map(Iova::new(offset + base), PhysAddr::new(0x5000_0000), 0x1000, true)
            .unwrap();
        assert_eq!(
            domain.iova_to_phys(Iova::new(offset + base + 0x10)),
            Ok(PhysAddr::new(0x5000_0010))
        );
    }

    #[test]
    fn test_shared_cache_flushed_on_sync() {
        let domain = detached(IommuConfig::new().with_aperture(0, 2 * GIB));
        let cache = Arc::new(FakeCache::default());
        let regs = FakeRegisters::new(REFERENCE_DEBUG_INFO);
        domain
            .attach_device(IommuDevice::new("mmu0", regs, Some(cache.clone())))
            .unwrap();
        assert_eq!(cache.flushes(), 1);

        domain.map(Iova::new(0), PhysAddr::new(0x1000), 0x1000, true).unwrap();
        domain.sync_all();
        domain.sync_all();
        assert_eq!(cache.flushes(), 2);
    }

    #[test]
    fn test_faults_and_counters_reported() {
        let (domain, regs) = low_aperture();
        assert_eq!(domain.fault_status(), Some(Ctrl::empty()));

        regs.raise_fault(Ctrl::PT_INVALID);
        regs.set_counters(10, 2, 7);
        assert_eq!(domain.fault_status(), Some(Ctrl::PT_INVALID));
        assert_eq!(
            domain.hw_stats(),
            Some(HwStats {
                hits: 10,
                misses: 2,
                stalls: 7
            })
        );
    }

    #[test]
    fn test_detach_publishes_and_disables() {
        let (domain, regs) = low_aperture();
        domain.map(Iova::new(0), PhysAddr::new(0x1000), 0x1000, true).unwrap();

        let device = domain.detach_device().unwrap();
        assert_eq!(device.name(), "mmu0");
        assert!(!domain.is_dirty());
        assert!(!domain.is_attached());
        assert_eq!(regs.reg(offsets::CTRL), 0);
        assert!(domain.detach_device().is_none());
    }

    #[test]
    fn test_second_attach_rejected() {
        let (domain, _regs) = low_aperture();
        let other = IommuDevice::new("mmu1", FakeRegisters::new(REFERENCE_DEBUG_INFO), None);
        let (err, device) = domain.attach_device(other).unwrap_err();
        assert_eq!(err, Error::AlreadyAttached);
        assert_eq!(device.name(), "mmu1");
    }
}
