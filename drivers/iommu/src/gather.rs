//! # Invalidation Gather
//!
//! Unmap records only the lowest and highest address it touched. Several
//! unmaps can share one gather; the span is invalidated once by
//! [`crate::TranslationDomain::iotlb_sync`].

use crate::types::{Iova, IovaRange};

/// Coarse bounds of unmapped ranges awaiting invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IotlbGather {
    /// Lowest gathered address
    start: u64,
    /// Highest gathered address (inclusive)
    end: u64,
    /// Bytes gathered, overlaps counted twice
    pending: u64,
}

impl IotlbGather {
    /// Empty gather
    pub const fn new() -> Self {
        Self {
            start: u64::MAX,
            end: 0,
            pending: 0,
        }
    }

    /// Widen the bounds to include `[iova, iova + size)`
    pub fn add_range(&mut self, iova: Iova, size: u64) {
        if size == 0 {
            return;
        }
        let last = iova.raw().saturating_add(size - 1);
        self.start = self.start.min(iova.raw());
        self.end = self.end.max(last);
        self.pending = self.pending.saturating_add(size);
    }

    /// Gathered span, if anything was gathered
    pub fn range(&self) -> Option<IovaRange> {
        if self.is_empty() {
            return None;
        }
        Some(IovaRange {
            start: Iova::new(self.start),
            end: Iova::new(self.end.saturating_add(1)),
        })
    }

    /// Bytes gathered since the last reset
    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// Check whether nothing was gathered
    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Forget everything gathered
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for IotlbGather {
    fn default() -> Self {
        Self::new()
    }
}
