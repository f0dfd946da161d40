//! Guarded block heap manager for memory-safety instrumentation runtimes.
//!
//! Allocations are wrapped in *blocks*: redzoned, checksummed envelopes
//! whose lifecycle (allocated, quarantined, freed) is tracked outside the
//! caller's reach. Freed blocks pass through a bounded quarantine so stale
//! pointers keep pointing at poisoned, optionally page-protected memory
//! long enough for use-after-free to be caught. Double-frees and redzone
//! corruption are detected at free time, reported through a pluggable sink,
//! and recovered from without leaking the block.
//!
//! [`BlockHeapManager`] is the entry point. It routes each allocation to
//! one of several backends (the caller's own heap, a guard-paged large
//! block heap, a striped page-guard "zebra" heap for small objects) and
//! integrates with host-provided shadow memory and stack capture through
//! the traits in [`services`].
//!
//! ```
//! use std::sync::Arc;
//! use guardheap::{BlockHeapManager, Parameters};
//! use guardheap::error::LoggingSink;
//! use guardheap::services::{BacktraceRegistry, ShadowMap};
//!
//! let manager = BlockHeapManager::new(
//!     Arc::new(ShadowMap::new()),
//!     Arc::new(BacktraceRegistry::new()),
//!     Arc::new(LoggingSink),
//!     Parameters::default(),
//! );
//! let heap = manager.create_heap();
//! let ptr = manager.allocate(heap, 64);
//! assert!(!ptr.is_null());
//! assert_eq!(manager.allocation_size(heap, ptr), Some(64));
//! assert!(manager.free(heap, ptr));
//! ```

pub mod block;
pub mod error;
pub mod heaps;
pub mod manager;
pub mod params;
pub mod platform;
pub mod quarantine;
pub mod services;
pub mod util;

pub use error::{ErrorSink, HeapError, HeapErrorKind, LoggingSink};
pub use manager::{BlockHeapManager, HeapManagerStats};
pub use params::Parameters;

/// Opaque handle to a registered heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u64);

impl HeapId {
    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        HeapId(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}
