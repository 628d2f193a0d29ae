//! # Helix IOMMU
//!
//! Address-translation engine for the I/O MMU in front of an accelerator's
//! DMA masters.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         IOMMU Instance                          │
//! │        probe · alloc_domain · attach · free_domain · remove     │
//! │                              │                                  │
//! │  ┌───────────────────────────┴───────────────────────────────┐  │
//! │  │                   Translation Domain                      │  │
//! │  │   map · unmap · sync · sync_all · iova_to_phys (locked)   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │         │                     │                      │          │
//! │  ┌──────┴───────┐   ┌─────────┴────────┐   ┌─────────┴───────┐  │
//! │  │  Page Table  │   │   Coherency &    │   │   Aperture &    │  │
//! │  │    Store     │   │   Invalidation   │   │     Bypass      │  │
//! │  └──────┬───────┘   └─────────┬────────┘   └─────────┬───────┘  │
//! │         │                     │                      │          │
//! │  ┌──────┴───────┐   ┌─────────┴──────────────────────┴───────┐  │
//! │  │ Table Memory │   │      Registers (MMIO) + Geometry       │  │
//! │  └──────────────┘   └────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Table Layout
//!
//! One flat array of 32-bit entries: a leaf entry per 4 KiB page of the
//! aperture, then one top-level page pointing at the leaf pages, then an
//! all-invalid catch page for illegal accesses. Addresses below the
//! aperture bypass translation; addresses above it are rejected.
//!
//! ## Invalidation
//!
//! Writes go to a CPU-owned copy and are published by a sync, which either
//! clears the whole translation cache or shoots down the touched lines,
//! whichever is cheaper for the range.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod aperture;
pub mod coherency;
pub mod config;
pub mod device;
pub mod domain;
pub mod error;
pub mod gather;
pub mod geometry;
pub mod iommu;
pub mod memory;
pub mod pte;
pub mod regs;
pub mod table;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports
pub use coherency::{Invalidation, InvalidationCounts};
pub use config::{IommuConfig, ShootdownGranule};
pub use device::{HwStats, SharedTlbCache};
pub use domain::{DomainGeometry, DomainId, DomainType, TranslationDomain};
pub use error::{ConfigError, Error, Result};
pub use gather::IotlbGather;
pub use geometry::{Capabilities, Geometry};
pub use iommu::{DmaMaster, Domain, Iommu, IommuCap};
pub use memory::{TableAllocator, TableMemory};
pub use pte::{PageSize, PageTableEntry};
pub use regs::{MmioRegion, RegisterIo};
pub use types::{Iova, IovaRange, PhysAddr};
