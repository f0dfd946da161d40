//! Adapter that gives any raw backend the guarded-block surface.

use crate::block::{plan_layout, BlockInfo, BlockLayout};
use crate::util::{is_aligned, MIN_ALIGN};

use super::{BlockHeap, HeapFeatures, HeapLock, RawHeap};

/// Layers [`BlockHeap`] on top of a [`RawHeap`]: blocks are ordinary raw
/// allocations sized for the whole layout, with `MIN_ALIGN` granularity and
/// no page protection. Backs the caller heaps and the process-default heap.
pub struct BlockHeapWrapper<R> {
    raw: R,
}

impl<R: RawHeap> BlockHeapWrapper<R> {
    pub fn new(raw: R) -> Self {
        BlockHeapWrapper { raw }
    }
}

impl<R: RawHeap> RawHeap for BlockHeapWrapper<R> {
    fn allocate_raw(&self, size: usize) -> *mut u8 {
        self.raw.allocate_raw(size)
    }

    fn free_raw(&self, ptr: *mut u8) -> bool {
        self.raw.free_raw(ptr)
    }

    fn size_raw(&self, ptr: *mut u8) -> Option<usize> {
        self.raw.size_raw(ptr)
    }

    fn is_allocated(&self, addr: usize) -> bool {
        self.raw.is_allocated(addr)
    }

    fn features(&self) -> HeapFeatures {
        self.raw.features()
    }

    fn lock(&self) -> &HeapLock {
        self.raw.lock()
    }
}

impl<R: RawHeap> BlockHeap for BlockHeapWrapper<R> {
    fn plan_block(
        &self,
        body_size: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Option<BlockLayout> {
        plan_layout(
            MIN_ALIGN,
            MIN_ALIGN,
            body_size,
            min_left_redzone,
            min_right_redzone,
        )
    }

    fn allocate_block(&self, layout: &BlockLayout) -> Option<BlockInfo> {
        let ptr = self.raw.allocate_raw(layout.block_size);
        if ptr.is_null() {
            return None;
        }
        if !is_aligned(ptr as usize, layout.block_alignment) {
            self.raw.free_raw(ptr);
            return None;
        }
        Some(BlockInfo::new(ptr as usize, *layout))
    }

    fn free_block(&self, info: &BlockInfo) -> bool {
        self.raw.free_raw(info.base as *mut u8)
    }
}
