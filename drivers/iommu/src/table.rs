//! # Page Table Store
//!
//! Owns the table memory and is the only code that indexes into it.
//!
//! The flat word array is addressed through three regions (leaves,
//! top-level entries, catch page); every accessor is bounds-checked against
//! the planned geometry.

use alloc::vec::Vec;
use core::ops::Range;

use crate::error::{ConfigError, Result};
use crate::geometry::{Geometry, NATIVE_PAGE_SHIFT};
use crate::memory::TableMemory;
use crate::pte::{PageTableEntry, PTE_PPN_MASK};
use crate::types::PhysAddr;

// =============================================================================
// Backing Check
// =============================================================================

/// Check that `memory` can hold the table planned by `geometry`
///
/// The region must have the planned size, and its host pages must be
/// aligned, ascending and addressable by a 28-bit page number.
pub fn check_backing<M: TableMemory>(memory: &M, geometry: &Geometry) -> Result<()> {
    if memory.words().len() != geometry.table_words()
        || memory.page_addrs().len() != geometry.table_host_pages()
    {
        return Err(ConfigError::InvalidBacking.into());
    }

    let host_page = geometry.host_page_size();
    let mut previous: Option<PhysAddr> = None;
    for &addr in memory.page_addrs() {
        let end = addr.raw().checked_add(host_page).ok_or(ConfigError::InvalidBacking)?;
        if !addr.is_aligned(host_page)
            || (end >> NATIVE_PAGE_SHIFT) > PTE_PPN_MASK as u64 + 1
            || previous.is_some_and(|p| p >= addr)
        {
            return Err(ConfigError::InvalidBacking.into());
        }
        previous = Some(addr);
    }
    Ok(())
}

// =============================================================================
// Page Table
// =============================================================================

/// Flat two-level page table over external table memory
#[derive(Debug)]
pub struct PageTable<M: TableMemory> {
    /// Backing memory
    memory: M,
    /// Leaf entries (one per native page of the aperture)
    leaves: Range<usize>,
    /// Top-level entries (one per leaf table page)
    directory: Range<usize>,
    /// Catch page words
    catch: Range<usize>,
    /// Native pages per host page
    pages_per_host: usize,
}

impl<M: TableMemory> PageTable<M> {
    /// Wrap `memory` after checking it matches the planned layout
    pub fn new(memory: M, geometry: &Geometry) -> Result<Self> {
        check_backing(&memory, geometry)?;

        let directory_start = geometry.directory_offset();
        let catch_start = geometry.catch_page_offset();
        Ok(Self {
            memory,
            leaves: 0..geometry.translated_pages(),
            directory: directory_start..directory_start + geometry.leaf_pages(),
            catch: catch_start..geometry.table_words(),
            pages_per_host: geometry.native_pages_per_host_page(),
        })
    }

    /// Number of leaf entries
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Read leaf entry `index`
    pub fn leaf(&self, index: usize) -> Option<PageTableEntry> {
        if index >= self.leaves.len() {
            return None;
        }
        self.memory
            .words()
            .get(self.leaves.start + index)
            .map(|&w| PageTableEntry::decode(w))
    }

    /// Replace leaf entry `index`, returning the previous entry
    pub fn set_leaf(&mut self, index: usize, entry: PageTableEntry) -> Option<PageTableEntry> {
        let words = self.leaf_words_mut(index..index + 1)?;
        let previous = PageTableEntry::decode(words[0]);
        words[0] = entry.raw();
        Some(previous)
    }

    /// Mutable words of a run of leaf entries
    pub(crate) fn leaf_words_mut(&mut self, range: Range<usize>) -> Option<&mut [u32]> {
        if range.start > range.end || range.end > self.leaves.len() {
            return None;
        }
        let start = self.leaves.start;
        self.memory
            .words_mut()
            .get_mut(start + range.start..start + range.end)
    }

    /// Read top-level entry `index`
    pub fn directory(&self, index: usize) -> Option<PageTableEntry> {
        if index >= self.directory.len() {
            return None;
        }
        self.memory
            .words()
            .get(self.directory.start + index)
            .map(|&w| PageTableEntry::decode(w))
    }

    /// Check that the catch page holds only invalid entries
    pub fn catch_page_is_clear(&self) -> bool {
        self.memory
            .words()
            .get(self.catch.clone())
            .is_some_and(|words| words.iter().all(|&w| w == 0))
    }

    /// Invalidate every entry, including top-level entries and the catch page
    pub fn zero_all(&mut self) {
        self.memory.words_mut().fill(0);
    }

    /// Point each top-level entry at its leaf table page
    ///
    /// Consumes the backing page list in order: the leaf pages, then the
    /// top-level page, then the catch page. Returns the page numbers of the
    /// last two.
    pub fn populate_directory(&mut self) -> Result<(u32, u32)> {
        let pages_per_host = self.pages_per_host;
        let leaf_pages = self.directory.len();
        let directory_start = self.directory.start;

        let mut addrs = self.memory.page_addrs().iter().map(|a| a.raw() >> NATIVE_PAGE_SHIFT);
        let mut ppns = [0u32; 2];
        let mut entries = Vec::with_capacity(leaf_pages);

        let mut ppn = 0u64;
        for i in 0..leaf_pages {
            if i % pages_per_host == 0 {
                ppn = addrs.next().ok_or(ConfigError::InvalidBacking)?;
            } else {
                ppn += 1;
            }
            entries.push(PageTableEntry::directory(ppn as u32).raw());
        }
        for slot in ppns.iter_mut() {
            *slot = addrs.next().ok_or(ConfigError::InvalidBacking)? as u32;
        }

        let words = self
            .memory
            .words_mut()
            .get_mut(directory_start..directory_start + leaf_pages)
            .ok_or(ConfigError::InvalidBacking)?;
        words.copy_from_slice(&entries);

        Ok((ppns[0], ppns[1]))
    }

    /// Count valid leaf entries by scanning the table
    pub fn count_valid(&self) -> usize {
        self.memory
            .words()
            .get(self.leaves.clone())
            .map_or(0, |words| {
                words
                    .iter()
                    .filter(|&&w| PageTableEntry::decode(w).is_valid())
                    .count()
            })
    }

    /// Hand table memory to the CPU
    pub fn sync_for_cpu(&mut self) {
        self.memory.sync_for_cpu();
    }

    /// Publish table memory to the device
    pub fn sync_for_device(&mut self) {
        self.memory.sync_for_device();
    }

    /// Dump valid leaf entries through the log
    #[cfg(feature = "debug")]
    pub fn dump(&self) {
        log::debug!("Page table dump ({} leaves)", self.leaves.len());
        for index in 0..self.leaves.len() {
            if let Some(entry) = self.leaf(index).filter(|e| e.is_valid()) {
                log::debug!("  [{:6}] {:?}", index, entry);
            }
        }
    }

    /// Release the backing memory
    pub fn into_memory(self) -> M {
        self.memory
    }
}
