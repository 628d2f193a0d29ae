//! Software stand-ins for the hardware and the table allocator.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::device::SharedTlbCache;
use crate::error::{Error, Result};
use crate::memory::{TableAllocator, TableMemory};
use crate::regs::{self, offsets, Ctrl, RegisterIo};
use crate::types::PhysAddr;

/// Version 4, VA/PA width 6, 64 KiB big pages, 1 MiB super pages, bypass
pub const REFERENCE_DEBUG_INFO: u32 = 0x2080_4664;

/// Busy-read count that never completes
pub const FOREVER: u32 = u32::MAX;

// =============================================================================
// Register Model
// =============================================================================

#[derive(Debug, Default)]
struct RegisterFile {
    regs: [u32; 16],
    enable_stuck: bool,
    clear_busy_reads: u32,
    clearing: u32,
    shoot_busy_reads: u32,
    shooting: u32,
    shootdowns: Vec<u32>,
    full_clears: usize,
}

/// Shared handle to a modelled register block
///
/// Clones observe the same registers, so a test can keep one while the
/// device owns another.
#[derive(Debug, Clone)]
pub struct FakeRegisters {
    state: Arc<Mutex<RegisterFile>>,
}

/// Count down a busy period, `FOREVER` never ends
fn tick(remaining: &mut u32) -> bool {
    match *remaining {
        0 => false,
        FOREVER => true,
        _ => {
            *remaining -= 1;
            true
        }
    }
}

impl FakeRegisters {
    pub fn new(debug_info: u32) -> Self {
        let mut file = RegisterFile::default();
        file.regs[(offsets::DEBUG_INFO / 4) as usize] = debug_info;
        Self {
            state: Arc::new(Mutex::new(file)),
        }
    }

    /// Stored register value, without read side effects
    pub fn reg(&self, offset: u32) -> u32 {
        self.state.lock().regs[(offset / 4) as usize]
    }

    /// ENABLE never reads back as set
    pub fn set_enable_stuck(&self, stuck: bool) {
        self.state.lock().enable_stuck = stuck;
    }

    /// TLB_CLEARING stays set for this many CTRL reads after a clear
    pub fn set_clear_busy_reads(&self, reads: u32) {
        self.state.lock().clear_busy_reads = reads;
    }

    /// SHOOTING stays set for this many reads after a shootdown
    pub fn set_shoot_busy_reads(&self, reads: u32) {
        self.state.lock().shoot_busy_reads = reads;
    }

    /// Latch sticky fault flags
    pub fn raise_fault(&self, fault: Ctrl) {
        let mut file = self.state.lock();
        file.regs[(offsets::CTRL / 4) as usize] |= fault.intersection(Ctrl::FAULTS).bits();
    }

    /// Load the hit, miss and stall counters
    pub fn set_counters(&self, hits: u32, misses: u32, stalls: u32) {
        let mut file = self.state.lock();
        file.regs[(offsets::HIT / 4) as usize] = hits;
        file.regs[(offsets::MISS / 4) as usize] = misses;
        file.regs[(offsets::STALL / 4) as usize] = stalls;
    }

    /// Page numbers of every shootdown command, in issue order
    pub fn shootdowns(&self) -> Vec<u32> {
        self.state.lock().shootdowns.clone()
    }

    /// Translation cache clears issued while translation was enabled
    pub fn full_clears(&self) -> usize {
        self.state.lock().full_clears
    }
}

impl RegisterIo for FakeRegisters {
    fn read32(&self, offset: u32) -> u32 {
        let mut file = self.state.lock();
        let stored = file.regs[(offset / 4) as usize];
        match offset {
            offsets::CTRL => {
                let mut value = stored;
                if tick(&mut file.clearing) {
                    value |= Ctrl::TLB_CLEARING.bits();
                }
                if file.enable_stuck {
                    value &= !Ctrl::ENABLE.bits();
                }
                value
            }
            offsets::SHOOT_DOWN => {
                if tick(&mut file.shooting) {
                    stored | regs::SHOOT_DOWN_SHOOTING
                } else {
                    stored & !regs::SHOOT_DOWN_SHOOTING
                }
            }
            _ => stored,
        }
    }

    fn write32(&mut self, offset: u32, value: u32) {
        let mut file = self.state.lock();
        let index = (offset / 4) as usize;
        match offset {
            offsets::CTRL => {
                let written = Ctrl::from_bits_retain(value);
                // Sticky flags are write-one-to-clear
                let sticky = file.regs[index] & Ctrl::FAULTS.bits() & !value;
                let commands = Ctrl::FAULTS | Ctrl::TLB_CLEAR | Ctrl::STATS_CLEAR | Ctrl::TLB_CLEARING;
                file.regs[index] = (value & !commands.bits()) | sticky;

                if written.contains(Ctrl::TLB_CLEAR) {
                    file.clearing = file.clear_busy_reads;
                    if written.contains(Ctrl::ENABLE) {
                        file.full_clears += 1;
                    }
                }
                if written.contains(Ctrl::STATS_CLEAR) {
                    for counter in [offsets::HIT, offsets::MISS, offsets::STALL] {
                        file.regs[(counter / 4) as usize] = 0;
                    }
                }
            }
            offsets::SHOOT_DOWN => {
                file.regs[index] = value;
                if value & regs::SHOOT_DOWN_SHOOT != 0 {
                    let page = value & !(regs::SHOOT_DOWN_SHOOT | regs::SHOOT_DOWN_SHOOTING);
                    file.shootdowns.push(page);
                    file.shooting = file.shoot_busy_reads;
                }
            }
            offsets::DEBUG_INFO => {}
            _ => file.regs[index] = value,
        }
    }
}

// =============================================================================
// Table Memory
// =============================================================================

/// Heap-backed table memory with fabricated bus addresses
#[derive(Debug)]
pub struct FakeTableMemory {
    words: Vec<u32>,
    pages: Vec<PhysAddr>,
    cpu_syncs: usize,
    device_syncs: usize,
}

impl FakeTableMemory {
    /// Number of hand-overs to the CPU
    pub fn cpu_syncs(&self) -> usize {
        self.cpu_syncs
    }

    /// Number of publications to the device
    pub fn device_syncs(&self) -> usize {
        self.device_syncs
    }
}

impl TableMemory for FakeTableMemory {
    fn words(&self) -> &[u32] {
        &self.words
    }

    fn words_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }

    fn page_addrs(&self) -> &[PhysAddr] {
        &self.pages
    }

    fn sync_for_cpu(&mut self) {
        self.cpu_syncs += 1;
    }

    fn sync_for_device(&mut self) {
        self.device_syncs += 1;
    }
}

// =============================================================================
// Allocator
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Contiguous,
    Scattered,
    Descending,
    Exhausted,
}

/// Bump allocator over a fabricated bus address range
#[derive(Debug, Clone)]
pub struct FakeAllocator {
    next: u64,
    layout: Layout,
    allocated: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl FakeAllocator {
    /// Hand out physically contiguous regions starting at `base`
    pub fn new(base: u64) -> Self {
        Self {
            next: base,
            layout: Layout::Contiguous,
            allocated: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Skip one host page after every page handed out
    pub fn scattered(mut self) -> Self {
        self.layout = Layout::Scattered;
        self
    }

    /// Report page addresses in descending order
    pub fn descending(mut self) -> Self {
        self.layout = Layout::Descending;
        self
    }

    /// Fail every allocation
    pub fn exhausted(mut self) -> Self {
        self.layout = Layout::Exhausted;
        self
    }

    /// Regions currently outstanding
    pub fn outstanding(&self) -> usize {
        self.allocated.load(Ordering::Relaxed) - self.released.load(Ordering::Relaxed)
    }

    /// Regions returned so far
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }
}

impl TableAllocator for FakeAllocator {
    type Memory = FakeTableMemory;

    fn allocate(&mut self, bytes: usize, page_size: u64) -> Result<FakeTableMemory> {
        if self.layout == Layout::Exhausted {
            return Err(Error::OutOfMemory);
        }

        let count = (bytes as u64).div_ceil(page_size);
        let stride = match self.layout {
            Layout::Scattered => 2 * page_size,
            _ => page_size,
        };
        let mut pages: Vec<PhysAddr> = (0..count)
            .map(|i| PhysAddr::new(self.next + i * stride))
            .collect();
        if self.layout == Layout::Descending {
            pages.reverse();
        }
        self.next += count * stride;
        self.allocated.fetch_add(1, Ordering::Relaxed);

        Ok(FakeTableMemory {
            // Stale contents; the engine must zero before use
            words: vec![0xFFFF_FFFF; bytes / 4],
            pages,
            cpu_syncs: 0,
            device_syncs: 0,
        })
    }

    fn release(&mut self, _memory: FakeTableMemory) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Shared Cache
// =============================================================================

/// Counts flushes of the second-level cache
#[derive(Debug, Default)]
pub struct FakeCache {
    flushes: AtomicUsize,
}

impl FakeCache {
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl SharedTlbCache for FakeCache {
    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}
