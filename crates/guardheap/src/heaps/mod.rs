//! Heap backends.
//!
//! Two capability levels. A [`RawHeap`] hands out unguarded memory and
//! answers ownership queries. A [`BlockHeap`] additionally services whole
//! guarded blocks planned by [`crate::block::plan_layout`], and may apply
//! page protection to quarantined blocks. The manager only ever talks to
//! `dyn BlockHeap`; which backend serviced a block is recorded in the block
//! trailer, not inferred from the handle the caller passes back.

pub mod internal;
pub mod large;
pub mod system;
pub mod wrapper;
pub mod zebra;

pub use internal::InternalHeap;
pub use large::LargeBlockHeap;
pub use system::SystemHeap;
pub use wrapper::BlockHeapWrapper;
pub use zebra::ZebraBlockHeap;

use core::ops::BitOr;
use core::time::Duration;

use crate::block::{BlockInfo, BlockLayout};

/// Per-heap reentrant lock. Reentrancy matters: an error sink or stack
/// capture running under `free` may allocate, re-entering the same heap on
/// the same thread.
pub type HeapLock = parking_lot::lock_api::RawReentrantMutex<
    parking_lot::RawMutex,
    parking_lot::RawThreadId,
>;

/// RAII guard over a [`HeapLock`].
pub struct HeapLockGuard<'a> {
    lock: &'a HeapLock,
}

impl<'a> HeapLockGuard<'a> {
    pub fn acquire(lock: &'a HeapLock) -> Self {
        lock.lock();
        HeapLockGuard { lock }
    }

    pub fn try_acquire_for(lock: &'a HeapLock, timeout: Duration) -> Option<Self> {
        if lock.try_lock_for(timeout) {
            Some(HeapLockGuard { lock })
        } else {
            None
        }
    }
}

impl Drop for HeapLockGuard<'_> {
    fn drop(&mut self) {
        // Guard existence proves this thread holds the lock.
        unsafe { self.lock.unlock() };
    }
}

/// Capability flags a backend advertises. The manager consults these
/// instead of downcasting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapFeatures(u32);

impl HeapFeatures {
    pub const NONE: HeapFeatures = HeapFeatures(0);
    /// `size_raw` answers for live raw allocations.
    pub const SUPPORTS_SIZE: HeapFeatures = HeapFeatures(1 << 0);
    /// `is_allocated` answers ownership queries.
    pub const SUPPORTS_IS_ALLOCATED: HeapFeatures = HeapFeatures(1 << 1);
    /// Freed block memory stays reserved by the backend; the shadow must
    /// mark it reserved rather than accessible after release.
    pub const REPORTS_RESERVATIONS: HeapFeatures = HeapFeatures(1 << 2);
    /// `protect_block` / `unprotect_block` actually change page protection.
    pub const SUPPORTS_PROTECTION: HeapFeatures = HeapFeatures(1 << 3);

    #[inline]
    pub const fn contains(self, other: HeapFeatures) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HeapFeatures {
    type Output = HeapFeatures;

    fn bitor(self, rhs: HeapFeatures) -> HeapFeatures {
        HeapFeatures(self.0 | rhs.0)
    }
}

/// Unguarded allocation surface.
pub trait RawHeap: Send + Sync {
    /// Allocate `size` bytes, aligned to at least [`crate::util::MIN_ALIGN`].
    /// Null on failure or when the backend does not serve raw requests.
    fn allocate_raw(&self, size: usize) -> *mut u8;

    /// Free a raw allocation. `false` when the pointer is not owned here.
    fn free_raw(&self, ptr: *mut u8) -> bool;

    /// Usable size of a live raw allocation, when `SUPPORTS_SIZE`.
    fn size_raw(&self, ptr: *mut u8) -> Option<usize>;

    /// Whether `addr` lies inside memory this backend currently owns on
    /// behalf of a live or quarantined block. Meaningful only when
    /// `SUPPORTS_IS_ALLOCATED`; `false` otherwise.
    fn is_allocated(&self, addr: usize) -> bool;

    fn features(&self) -> HeapFeatures;

    fn lock(&self) -> &HeapLock;
}

/// Guarded-block surface layered on [`RawHeap`].
pub trait BlockHeap: RawHeap {
    /// Plan a layout this backend can service for the given body, or `None`
    /// when the request does not fit the backend's geometry.
    fn plan_block(
        &self,
        body_size: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Option<BlockLayout>;

    /// Allocate backing memory for a planned block.
    fn allocate_block(&self, layout: &BlockLayout) -> Option<BlockInfo>;

    /// Return a block's memory to the backend. `false` if unowned.
    fn free_block(&self, info: &BlockInfo) -> bool;

    /// Harden a quarantined block, when `SUPPORTS_PROTECTION`. Default: no-op.
    fn protect_block(&self, _info: &BlockInfo) {}

    /// Protect the redzone pages that lie wholly outside the body of a live
    /// block, where the geometry allows it. Default: no-op.
    fn protect_block_redzones(&self, _info: &BlockInfo) {}

    /// Make a block's metadata readable again. Default: no-op.
    fn unprotect_block(&self, _info: &BlockInfo) {}
}
