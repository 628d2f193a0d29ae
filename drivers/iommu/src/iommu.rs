//! # IOMMU Instance
//!
//! Entry points a generic IOMMU framework calls into: probe the unit,
//! allocate and free domains, attach DMA masters.
//!
//! The instance owns the hardware handle while no domain is attached. On
//! attach the handle moves into the domain; freeing or dropping the domain
//! moves it back, together with the table memory.

use alloc::sync::Arc;
use core::fmt;

use crate::config::IommuConfig;
use crate::device::{IommuDevice, SharedSlot, SharedTlbCache, UnitSlot};
use crate::domain::{DomainId, DomainType, TranslationDomain};
use crate::error::{Error, Result};
use crate::geometry::{Geometry, NATIVE_PAGE_SIZE};
use crate::memory::TableAllocator;
use crate::regs::RegisterIo;
use crate::table::{self, PageTable};

/// Domain type produced by an [`Iommu`]
pub type Domain<R, A> = TranslationDomain<<A as TableAllocator>::Memory, R>;

// =============================================================================
// DMA Master
// =============================================================================

/// Device issuing DMA through a translation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaMaster {
    /// Device name
    name: &'static str,
    /// Name of the translation unit it sits behind
    iommu: &'static str,
}

impl DmaMaster {
    /// Describe a master behind the unit named `iommu`
    pub const fn new(name: &'static str, iommu: &'static str) -> Self {
        Self { name, iommu }
    }

    /// Device name
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Translation unit name
    pub const fn iommu(&self) -> &'static str {
        self.iommu
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Optional IOMMU features a framework may query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuCap {
    /// Table walks snoop CPU caches
    CacheCoherency,
    /// Interrupt remapping
    InterruptRemap,
    /// Execute permission in entries
    NoExec,
    /// Hardware dirty bit tracking
    DirtyTracking,
}

// =============================================================================
// IOMMU
// =============================================================================

/// One probed translation unit
pub struct Iommu<R: RegisterIo, A: TableAllocator> {
    /// Unit name
    name: &'static str,
    /// Planned layout
    geometry: Geometry,
    /// Hardware, attachment and returned table memory
    slot: SharedSlot<A::Memory, R>,
    /// Table memory source
    allocator: A,
    /// Next domain identifier
    next_id: u32,
}

impl<R: RegisterIo, A: TableAllocator> Iommu<R, A> {
    /// Read the capabilities of the unit behind `regs` and plan its layout
    ///
    /// Hardware that cannot run the two-level table fails with
    /// [`Error::Configuration`]. Translation stays off until a domain is
    /// attached.
    pub fn probe(
        name: &'static str,
        regs: R,
        cache: Option<Arc<dyn SharedTlbCache>>,
        config: &IommuConfig,
        allocator: A,
    ) -> Result<Self> {
        let device = IommuDevice::new(name, regs, cache);
        let debug_info = device.debug_info();
        let geometry = match Geometry::plan(debug_info, config) {
            Ok(geometry) => geometry,
            Err(e) => {
                log::error!("{}: DEBUG_INFO {:#010x}: {}", name, debug_info, e);
                return Err(e);
            }
        };

        log::info!(
            "{}: DEBUG_INFO {:#010x}, big page {:#x}, super page {:#x}, aperture [{:#x}, {:#x}) offset {:#x}{}",
            name,
            debug_info,
            class_size(geometry.bigpage_mask()),
            class_size(geometry.superpage_mask()),
            geometry.aperture_base(),
            geometry.aperture_top(),
            geometry.dma_iova_offset(),
            if device.has_shared_cache() { ", shared cache" } else { "" }
        );

        Ok(Self {
            name,
            geometry,
            slot: UnitSlot::shared(Some(device)),
            allocator,
            next_id: 1,
        })
    }

    /// Unit name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Planned layout
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Optional features: none are provided
    pub fn capable(&self, _cap: IommuCap) -> bool {
        false
    }

    /// Page sizes advertised to the framework
    pub fn page_size_bitmap(&self) -> u64 {
        self.geometry.page_size_bitmap()
    }

    /// Domain currently holding the hardware
    pub fn attached_domain(&self) -> Option<DomainId> {
        self.slot.lock().attached
    }

    /// Hand table memory of dropped domains back to the allocator
    fn reclaim(&mut self) {
        let returned = core::mem::take(&mut self.slot.lock().returned);
        for memory in returned {
            self.allocator.release(memory);
        }
    }

    /// Allocate a domain and its table memory
    ///
    /// Only [`DomainType::Unmanaged`] and [`DomainType::Dma`] are
    /// supported. Table memory the allocator hands back in an unusable
    /// layout is returned to it before failing.
    pub fn alloc_domain(&mut self, kind: DomainType) -> Result<Domain<R, A>> {
        if !kind.is_supported() {
            log::warn!("{}: {:?} domains not supported", self.name, kind);
            return Err(Error::UnsupportedDomain);
        }
        self.reclaim();

        let memory = self
            .allocator
            .allocate(self.geometry.table_alloc_size(), self.geometry.host_page_size())?;
        if let Err(e) = table::check_backing(&memory, &self.geometry) {
            log::warn!("{}: table memory rejected: {}", self.name, e);
            self.allocator.release(memory);
            return Err(e);
        }
        let table = PageTable::new(memory, &self.geometry)?;

        let id = DomainId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        log::debug!("{}: allocated {} ({:?})", self.name, id, kind);
        Ok(TranslationDomain::new(id, kind, self.geometry, table, self.slot.clone()))
    }

    /// Route `master` through `domain`
    ///
    /// The first attach programs the hardware for the domain. Further
    /// masters may join the attached domain; any other domain fails with
    /// [`Error::AlreadyAttached`] until the attached one is freed. Domains
    /// allocated by another instance fail with [`Error::ForeignDomain`].
    pub fn attach(&mut self, domain: &Domain<R, A>, master: &DmaMaster) -> Result<()> {
        if master.iommu() != self.name {
            log::warn!("{}: {} sits behind {}", self.name, master.name(), master.iommu());
            return Err(Error::InvalidDevice);
        }
        if !domain.belongs_to(&self.slot) {
            log::warn!("{}: {} was allocated elsewhere", self.name, domain.id());
            return Err(Error::ForeignDomain);
        }

        let device = {
            let mut slot = self.slot.lock();
            if slot.attached == Some(domain.id()) {
                log::info!("{}: {} joined {}", self.name, master.name(), domain.id());
                return Ok(());
            }
            slot.device.take().ok_or(Error::AlreadyAttached)?
        };

        match domain.attach_device(device) {
            Ok(()) => {
                self.slot.lock().attached = Some(domain.id());
                log::info!("{}: {} attached to {}", self.name, master.name(), domain.id());
                Ok(())
            }
            Err((e, device)) => {
                self.slot.lock().device = Some(device);
                Err(e)
            }
        }
    }

    /// Tear down `domain` and return its table memory
    ///
    /// An attached domain is synchronized first; translation is then
    /// disabled and the hardware comes back to this instance. A domain
    /// allocated by another instance is still torn down, its hardware and
    /// memory going back to that instance, and [`Error::ForeignDomain`] is
    /// returned.
    pub fn free_domain(&mut self, domain: Domain<R, A>) -> Result<()> {
        if !domain.belongs_to(&self.slot) {
            log::warn!("{}: freeing {} allocated elsewhere", self.name, domain.id());
            return Err(Error::ForeignDomain);
        }

        #[cfg(feature = "stats")]
        {
            let counts = domain.invalidation_stats();
            log::info!(
                "{}: {} freed: {} full clears ({} timed out), {} shootdowns ({} timed out), {} clean syncs",
                self.name,
                domain.id(),
                counts.full_clears,
                counts.clear_timeouts,
                counts.shootdowns,
                counts.shootdown_timeouts,
                counts.clean_skips
            );
        }

        drop(domain);
        self.reclaim();
        Ok(())
    }

    /// Disable the unit and give back the allocator
    ///
    /// A domain still attached keeps the hardware until it is freed or
    /// dropped, which disables it.
    pub fn remove(mut self) -> A {
        self.reclaim();
        {
            let mut slot = self.slot.lock();
            let attached = slot.attached;
            match slot.device.as_mut() {
                Some(device) => device.disable(),
                None => log::warn!("{}: removed while {:?} is attached", self.name, attached),
            }
        }
        log::info!("{}: removed", self.name);
        self.allocator
    }
}

/// Bytes covered by a size-class alignment mask, 0 when the class is absent
const fn class_size(mask: u64) -> u64 {
    if mask == 0 {
        0
    } else {
        mask + NATIVE_PAGE_SIZE
    }
}

impl<R: RegisterIo, A: TableAllocator> fmt::Debug for Iommu<R, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iommu")
            .field("name", &self.name)
            .field("geometry", &self.geometry)
            .field("attached", &self.attached_domain())
            .finish()
    }
}
