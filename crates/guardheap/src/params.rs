//! Runtime parameters of the block heap manager.
//!
//! The whole set is swapped atomically by `BlockHeapManager::set_parameters`;
//! individual fields are never mutated in place.

use serde::{Deserialize, Serialize};

/// Default aggregate quarantine cap.
pub const DEFAULT_QUARANTINE_SIZE: usize = 4 * 1024 * 1024; // 4 MiB

/// Default cap on a single quarantined object.
pub const DEFAULT_QUARANTINE_BLOCK_SIZE: usize = 1024 * 1024; // 1 MiB

/// Default threshold above which the large-block heap services a request.
pub const DEFAULT_LARGE_ALLOCATION_THRESHOLD: usize = 64 * 1024; // 64 KiB

/// Default zebra arena size, fixed at first enable.
pub const DEFAULT_ZEBRA_BLOCK_HEAP_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

/// Process-wide, hot-swappable parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Aggregate quarantine cap in bytes. 0 disables quarantining.
    pub quarantine_size: usize,
    /// Maximum size of a single object admitted to quarantine, in bytes.
    pub quarantine_block_size: usize,
    /// Extra padding appended between body and trailer, in bytes.
    pub trailer_padding_size: usize,
    /// Probability in [0.0, 1.0] that an allocation receives guard
    /// instrumentation. The remainder bypasses straight to the raw backend.
    pub allocation_guard_rate: f64,
    /// Enables the large-block heap backend.
    pub enable_large_block_heap: bool,
    /// Requests at or above this size are eligible for the large-block heap.
    pub large_allocation_threshold: usize,
    /// Enables the page-guarded (zebra) heap backend.
    pub enable_zebra_block_heap: bool,
    /// Zebra arena size in bytes. Read once, at first enable.
    pub zebra_block_heap_size: usize,
    /// Fraction of the zebra arena reserved for quarantined slabs.
    pub zebra_block_heap_quarantine_ratio: f64,
    /// Gates the thread-local "always guard this call site" override flag.
    pub enable_allocation_filter: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            quarantine_size: DEFAULT_QUARANTINE_SIZE,
            quarantine_block_size: DEFAULT_QUARANTINE_BLOCK_SIZE,
            trailer_padding_size: 0,
            allocation_guard_rate: 1.0,
            enable_large_block_heap: true,
            large_allocation_threshold: DEFAULT_LARGE_ALLOCATION_THRESHOLD,
            enable_zebra_block_heap: false,
            zebra_block_heap_size: DEFAULT_ZEBRA_BLOCK_HEAP_SIZE,
            zebra_block_heap_quarantine_ratio: 0.25,
            enable_allocation_filter: false,
        }
    }
}

impl Parameters {
    /// Clamp rates/ratios into their valid ranges.
    pub fn sanitized(mut self) -> Self {
        self.allocation_guard_rate = self.allocation_guard_rate.clamp(0.0, 1.0);
        self.zebra_block_heap_quarantine_ratio =
            self.zebra_block_heap_quarantine_ratio.clamp(0.0, 1.0);
        self
    }
}
