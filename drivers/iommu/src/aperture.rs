//! # Aperture & Bypass Configuration
//!
//! Programs the translated window, the bypass bracket, the top-level table
//! base and the catch page, then enables translation with fault reporting.
//!
//! Register addresses are in the unit's own address space: the bus DMA
//! offset has already been removed by the time a request reaches it.

use crate::device::IommuDevice;
use crate::error::{Error, Result};
use crate::geometry::{Geometry, ADDR_CAP_SHIFT, L1_CHUNK_SHIFT};
use crate::memory::TableMemory;
use crate::regs::{self, offsets, Ctrl, RegisterIo};
use crate::table::PageTable;

// =============================================================================
// Register Values
// =============================================================================

/// ADDR_CAP: highest translated 256 MiB unit
pub fn addr_cap_value(geometry: &Geometry) -> u32 {
    regs::ADDR_CAP_ENABLE + ((geometry.aperture_top() >> ADDR_CAP_SHIFT) as u32 - 1)
}

/// BYPASS_START / BYPASS_END pair
///
/// Addresses below the aperture pass through untranslated. With the
/// aperture at zero there is nothing below it and the bracket is disabled.
pub fn bypass_values(geometry: &Geometry) -> (u32, u32) {
    if geometry.aperture_base() == 0 {
        return (0, 0);
    }
    let shift = geometry.bypass_shift();
    let start = regs::BYPASS_START_ENABLE
        + regs::BYPASS_START_INVERT
        + ((geometry.aperture_base() >> shift) as u32 - 1);
    let end = regs::BYPASS_END_ENABLE + (geometry.aperture_top() >> shift) as u32;
    (start, end)
}

/// PT_PA_BASE: top-level page number, biased so the hardware can index it
/// with the absolute address
pub fn table_base_value(top_level_ppn: u32, geometry: &Geometry) -> u32 {
    top_level_ppn.wrapping_sub((geometry.aperture_base() >> L1_CHUNK_SHIFT) as u32)
}

// =============================================================================
// Configuration Sequence
// =============================================================================

/// Initialize `table` and program `device` to walk it
///
/// On return the table holds only top-level entries, is published to the
/// device and translation is enabled. An enable that is never acknowledged
/// fails with [`Error::HardwareTimeout`]; translation is left disabled.
pub fn configure<R: RegisterIo, M: TableMemory>(
    device: &mut IommuDevice<R>,
    table: &mut PageTable<M>,
    geometry: &Geometry,
) -> Result<()> {
    let limit = geometry.poll_limit();

    // Disable, clear sticky flags and statistics, flush the translation cache
    device.regs_mut().write32(offsets::CTRL, Ctrl::RESET.bits());

    // Two-level mode, address cap and bypass bracket
    device
        .regs_mut()
        .modify32(offsets::MISC, 0, regs::MISC_SINGLE_TABLE);
    device
        .regs_mut()
        .write32(offsets::ADDR_CAP, addr_cap_value(geometry));
    let (bypass_start, bypass_end) = bypass_values(geometry);
    device.regs_mut().write32(offsets::BYPASS_START, bypass_start);
    device.regs_mut().write32(offsets::BYPASS_END, bypass_end);

    // Zeroed tables mark every page invalid
    table.sync_for_cpu();
    table.zero_all();
    let (top_level_ppn, catch_ppn) = table.populate_directory()?;

    device
        .regs_mut()
        .write32(offsets::PT_PA_BASE, table_base_value(top_level_ppn, geometry));
    device
        .regs_mut()
        .write32(offsets::ILLEGAL_ADR, regs::ILLEGAL_ADR_ENABLE + catch_ppn);
    table.sync_for_device();

    device.flush_shared_cache();
    device.regs_mut().write32(offsets::CTRL, Ctrl::RUNNING.bits());

    let mask = (Ctrl::ENABLE | Ctrl::TLB_CLEARING).bits();
    if let Err(e) = regs::poll32(device.regs(), offsets::CTRL, mask, Ctrl::ENABLE.bits(), limit) {
        log::error!("{}: translation enable not acknowledged", device.name());
        device.disable();
        return Err(e);
    }

    log::info!(
        "{}: translating [{:#x}, {:#x}), table page {:#x}, catch page {:#x}",
        device.name(),
        geometry.aperture_base(),
        geometry.aperture_top(),
        top_level_ppn,
        catch_ppn
    );
    Ok(())
}
