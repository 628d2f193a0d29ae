//! # Coherency & Invalidation
//!
//! Keeps the CPU-written table, the device-visible copy and the hardware
//! translation cache consistent.
//!
//! ```text
//!            map / unmap                    sync
//!   Clean ───────────────────▶ Dirty ───────────────────▶ Clean
//!         (sync_for_cpu once)        (sync_for_device, then
//!                                     full clear or shootdown)
//! ```
//!
//! Invalidation picks between a full translation cache clear, whose cost is
//! fixed, and one shootdown command per cache-line-sized chunk. Acknowledge
//! polls are bounded; a poll that runs out is counted and treated as done.

use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::geometry::{Geometry, NATIVE_PAGE_SHIFT, NATIVE_PAGE_SIZE};
use crate::memory::TableMemory;
use crate::regs::{self, offsets, Ctrl, RegisterIo};
use crate::table::PageTable;

// =============================================================================
// Coherency State
// =============================================================================

/// Ownership of table memory between CPU and table walker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherencyState {
    /// Device view matches the CPU view
    Clean,
    /// CPU has written entries the walker cannot see yet
    Dirty,
}

impl CoherencyState {
    /// Take CPU ownership of the table before the first write
    pub fn mark_dirty<M: TableMemory>(&mut self, table: &mut PageTable<M>) {
        if *self == Self::Clean {
            table.sync_for_cpu();
            *self = Self::Dirty;
        }
    }

    /// Publish the table to the walker
    pub fn publish<M: TableMemory>(&mut self, table: &mut PageTable<M>) {
        table.sync_for_device();
        *self = Self::Clean;
    }

    /// Check for unpublished writes
    pub fn is_dirty(self) -> bool {
        self == Self::Dirty
    }
}

// =============================================================================
// Invalidation Strategy
// =============================================================================

/// What a sync did to the translation cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// Table was clean; nothing published or invalidated
    Skipped,
    /// Whole translation cache cleared
    FullClear,
    /// Ranged shootdown with this many commands
    Shootdown(u64),
}

/// Choose between a full clear and ranged shootdown for `[start, end)`
///
/// Addresses are in the unit's address space and already clamped to the
/// aperture. A range that clamped to nothing still follows a publish of
/// the table, so it clears everything.
pub fn plan(geometry: &Geometry, populated: usize, start: u64, end: u64) -> Invalidation {
    if populated == 0 || end <= start || end - start >= geometry.full_clear_threshold() {
        return Invalidation::FullClear;
    }
    let chunks = chunk_span(geometry, start, end);
    Invalidation::Shootdown(chunks.end - chunks.start)
}

/// Shootdown chunk numbers overlapping `[start, end)`
fn chunk_span(geometry: &Geometry, start: u64, end: u64) -> Range<u64> {
    if end <= start {
        return 0..0;
    }
    let shift = NATIVE_PAGE_SHIFT + geometry.shootdown_granule().pages_shift();
    (start >> shift)..((end + (1 << shift) - NATIVE_PAGE_SIZE) >> shift)
}

// =============================================================================
// Statistics
// =============================================================================

/// Invalidation counters, updated without the domain lock
#[derive(Debug, Default)]
pub struct InvalidationStats {
    full_clears: AtomicU64,
    shootdowns: AtomicU64,
    clear_timeouts: AtomicU64,
    shootdown_timeouts: AtomicU64,
    clean_skips: AtomicU64,
}

/// Snapshot of [`InvalidationStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvalidationCounts {
    /// Full translation cache clears issued
    pub full_clears: u64,
    /// Shootdown commands issued
    pub shootdowns: u64,
    /// Full clears whose completion was never observed
    pub clear_timeouts: u64,
    /// Shootdowns whose completion was never observed
    pub shootdown_timeouts: u64,
    /// Syncs that found the table clean
    pub clean_skips: u64,
}

impl InvalidationStats {
    /// Take a snapshot
    pub fn snapshot(&self) -> InvalidationCounts {
        InvalidationCounts {
            full_clears: self.full_clears.load(Ordering::Relaxed),
            shootdowns: self.shootdowns.load(Ordering::Relaxed),
            clear_timeouts: self.clear_timeouts.load(Ordering::Relaxed),
            shootdown_timeouts: self.shootdown_timeouts.load(Ordering::Relaxed),
            clean_skips: self.clean_skips.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_clean_skip(&self) {
        self.clean_skips.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Hardware Commands
// =============================================================================

/// Clear the whole translation cache
///
/// Translation stays enabled. A clear that is never acknowledged within
/// the poll bound is logged, counted and otherwise ignored.
pub fn full_clear<R: RegisterIo>(
    io: &mut R,
    geometry: &Geometry,
    stats: &InvalidationStats,
) {
    io.write32(offsets::CTRL, (Ctrl::RUNNING | Ctrl::TLB_CLEAR).bits());
    stats.full_clears.fetch_add(1, Ordering::Relaxed);

    let mask = Ctrl::TLB_CLEARING.bits();
    if regs::poll32(&*io, offsets::CTRL, mask, 0, geometry.poll_limit()).is_err() {
        stats.clear_timeouts.fetch_add(1, Ordering::Relaxed);
        log::warn!("translation cache clear not acknowledged, proceeding");
    }
}

/// Shoot down every chunk overlapping `[start, end)`
///
/// Each command is acknowledged before the next is issued. Returns the
/// number of commands written.
pub fn shootdown<R: RegisterIo>(
    io: &mut R,
    geometry: &Geometry,
    stats: &InvalidationStats,
    start: u64,
    end: u64,
) -> u64 {
    let granule = geometry.shootdown_granule().pages_shift();
    let chunks = chunk_span(geometry, start, end);
    let commands = chunks.end - chunks.start;

    for chunk in chunks {
        io.write32(
            offsets::SHOOT_DOWN,
            regs::SHOOT_DOWN_SHOOT + ((chunk << granule) as u32),
        );
        let poll = regs::poll32(
            &*io,
            offsets::SHOOT_DOWN,
            regs::SHOOT_DOWN_SHOOTING,
            0,
            geometry.poll_limit(),
        );
        if poll.is_err() {
            stats.shootdown_timeouts.fetch_add(1, Ordering::Relaxed);
            log::warn!("shootdown of page {:#x} not acknowledged", chunk << granule);
        }
    }

    stats.shootdowns.fetch_add(commands, Ordering::Relaxed);
    commands
}
