//! # Table Memory
//!
//! The table lives in DMA-able memory owned by an external page allocator.
//! This module defines the seam: what the engine needs from that memory and
//! from the allocator that hands it out.

use crate::error::Result;
use crate::types::PhysAddr;

/// Physically backed, page-granular region holding one flat page table
///
/// The CPU view is one contiguous word array; the device view is a list of
/// host pages that need not be physically contiguous.
pub trait TableMemory {
    /// CPU view of the region as table words
    fn words(&self) -> &[u32];

    /// Mutable CPU view of the region as table words
    fn words_mut(&mut self) -> &mut [u32];

    /// Bus address of every host page of the region, in ascending CPU order
    fn page_addrs(&self) -> &[PhysAddr];

    /// Hand the region to the CPU before it is written
    fn sync_for_cpu(&mut self);

    /// Make CPU writes visible to the hardware table walker
    fn sync_for_device(&mut self);
}

/// External allocator of table memory
pub trait TableAllocator {
    /// Region type handed out
    type Memory: TableMemory;

    /// Allocate `bytes` of table memory in pages of `page_size` bytes
    ///
    /// Fails with [`crate::Error::OutOfMemory`] when the region cannot be
    /// provided.
    fn allocate(&mut self, bytes: usize, page_size: u64) -> Result<Self::Memory>;

    /// Return a region to the allocator
    fn release(&mut self, memory: Self::Memory);
}
