//! Striped page-guard backend for small allocations.
//!
//! A fixed arena carved into two-page slabs. The even page of each slab
//! holds exactly one block; the odd page is made inaccessible at startup
//! and never unprotected, so any overflow off the end of a block faults.
//! Layout planning pins the block to exactly one page, which puts the
//! trailer's last byte flush against the guard page.
//!
//! The heap doubles as the quarantine for its own blocks: a quarantined
//! slab stays out of the free list, bounded by a configurable fraction of
//! the arena so quarantine can never starve allocation.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::block::{plan_layout, BlockInfo, BlockLayout};
use crate::platform;
use crate::quarantine::BlockQuarantine;
use crate::util::MIN_ALIGN;

use super::{BlockHeap, HeapFeatures, HeapLock, RawHeap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabState {
    Free,
    Allocated,
    Quarantined,
}

struct ZebraState {
    slabs: Vec<SlabState>,
    free: Vec<usize>,
    quarantined: VecDeque<BlockInfo>,
}

pub struct ZebraBlockHeap {
    arena_base: usize,
    arena_size: usize,
    page_size: usize,
    slab_count: usize,
    state: Mutex<ZebraState>,
    /// Maximum quarantined slab count, derived from the quarantine ratio.
    quarantine_cap: AtomicUsize,
    lock: HeapLock,
}

impl ZebraBlockHeap {
    /// Map the arena and guard every odd page. `None` if the arena cannot
    /// be mapped or is too small for a single slab.
    pub fn new(arena_size: usize, quarantine_ratio: f64) -> Option<Self> {
        let page = platform::page_size();
        let slab_size = page * 2;
        let slab_count = arena_size / slab_size;
        if slab_count == 0 {
            return None;
        }
        let arena_size = slab_count * slab_size;

        let arena = unsafe { platform::map_anonymous(arena_size) };
        if arena.is_null() {
            return None;
        }
        let arena_base = arena as usize;
        for i in 0..slab_count {
            unsafe {
                platform::protect_none((arena_base + i * slab_size + page) as *mut u8, page);
            }
        }

        let heap = ZebraBlockHeap {
            arena_base,
            arena_size,
            page_size: page,
            slab_count,
            state: Mutex::new(ZebraState {
                slabs: vec![SlabState::Free; slab_count],
                free: (0..slab_count).rev().collect(),
                quarantined: VecDeque::new(),
            }),
            quarantine_cap: AtomicUsize::new(0),
            lock: HeapLock::INIT,
        };
        heap.set_quarantine_ratio(quarantine_ratio);
        Some(heap)
    }

    pub fn slab_count(&self) -> usize {
        self.slab_count
    }

    pub fn quarantine_capacity(&self) -> usize {
        self.quarantine_cap.load(Ordering::Relaxed)
    }

    /// Recompute the quarantined-slab cap as a fraction of the arena.
    /// Shrinking below current occupancy takes effect at the next trim.
    pub fn set_quarantine_ratio(&self, ratio: f64) {
        let ratio = ratio.clamp(0.0, 1.0);
        let cap = (self.slab_count as f64 * ratio) as usize;
        self.quarantine_cap.store(cap, Ordering::Relaxed);
    }

    #[inline]
    fn slab_base(&self, index: usize) -> usize {
        self.arena_base + index * self.page_size * 2
    }

    /// Slab index of `addr`, if it falls inside the arena.
    fn slab_index(&self, addr: usize) -> Option<usize> {
        if addr < self.arena_base || addr >= self.arena_base + self.arena_size {
            return None;
        }
        Some((addr - self.arena_base) / (self.page_size * 2))
    }
}

impl Drop for ZebraBlockHeap {
    fn drop(&mut self) {
        unsafe { platform::unmap(self.arena_base as *mut u8, self.arena_size) };
    }
}

impl RawHeap for ZebraBlockHeap {
    fn allocate_raw(&self, _size: usize) -> *mut u8 {
        core::ptr::null_mut()
    }

    fn free_raw(&self, _ptr: *mut u8) -> bool {
        false
    }

    fn size_raw(&self, _ptr: *mut u8) -> Option<usize> {
        None
    }

    fn is_allocated(&self, addr: usize) -> bool {
        match self.slab_index(addr) {
            Some(i) => self.state.lock().slabs[i] != SlabState::Free,
            None => false,
        }
    }

    fn features(&self) -> HeapFeatures {
        HeapFeatures::SUPPORTS_IS_ALLOCATED
            | HeapFeatures::REPORTS_RESERVATIONS
            | HeapFeatures::SUPPORTS_PROTECTION
    }

    fn lock(&self) -> &HeapLock {
        &self.lock
    }
}

impl BlockHeap for ZebraBlockHeap {
    fn plan_block(
        &self,
        body_size: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Option<BlockLayout> {
        let layout = plan_layout(
            MIN_ALIGN,
            self.page_size,
            body_size,
            min_left_redzone,
            min_right_redzone,
        )?;
        // One page exactly; anything larger belongs to another backend.
        if layout.block_size != self.page_size {
            return None;
        }
        Some(layout)
    }

    fn allocate_block(&self, layout: &BlockLayout) -> Option<BlockInfo> {
        debug_assert_eq!(layout.block_size, self.page_size);
        let mut state = self.state.lock();
        let index = state.free.pop()?;
        state.slabs[index] = SlabState::Allocated;
        Some(BlockInfo::new(self.slab_base(index), *layout))
    }

    fn free_block(&self, info: &BlockInfo) -> bool {
        let index = match self.slab_index(info.base) {
            Some(i) if self.slab_base(i) == info.base => i,
            _ => return false,
        };
        let mut state = self.state.lock();
        if state.slabs[index] == SlabState::Free {
            return false;
        }
        state.slabs[index] = SlabState::Free;
        state.free.push(index);
        unsafe {
            platform::protect_read_write(info.base as *mut u8, self.page_size);
            platform::advise_free(info.base as *mut u8, self.page_size);
        }
        true
    }

    fn protect_block(&self, info: &BlockInfo) {
        unsafe { platform::protect_none(info.base as *mut u8, self.page_size) };
    }

    fn unprotect_block(&self, info: &BlockInfo) {
        unsafe { platform::protect_read_write(info.base as *mut u8, self.page_size) };
    }
}

impl BlockQuarantine for ZebraBlockHeap {
    fn push(&self, block: BlockInfo) -> bool {
        let index = match self.slab_index(block.base) {
            Some(i) if self.slab_base(i) == block.base => i,
            _ => return false,
        };
        let cap = self.quarantine_cap.load(Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.quarantined.len() >= cap {
            return false;
        }
        if state.slabs[index] != SlabState::Allocated {
            return false;
        }
        state.slabs[index] = SlabState::Quarantined;
        state.quarantined.push_back(block);
        true
    }

    fn pop(&self) -> Option<BlockInfo> {
        // Slab state stays Quarantined until free_block returns it.
        self.state.lock().quarantined.pop_front()
    }

    fn drain(&self) -> Vec<BlockInfo> {
        self.state.lock().quarantined.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.state.lock().quarantined.len()
    }

    fn bytes(&self) -> usize {
        self.len() * self.page_size
    }

    fn max_bytes(&self) -> usize {
        self.quarantine_cap.load(Ordering::Relaxed) * self.page_size
    }

    fn set_max_bytes(&self, _max: usize) {
        // Capacity follows the arena ratio, not the global byte cap.
    }

    fn set_max_block_size(&self, _max: usize) {
        // Fixed one-page geometry.
    }

    fn trim(&self) -> Vec<BlockInfo> {
        let cap = self.quarantine_cap.load(Ordering::Relaxed);
        let mut state = self.state.lock();
        let mut out = Vec::new();
        while state.quarantined.len() > cap {
            match state.quarantined.pop_front() {
                Some(block) => out.push(block),
                None => break,
            }
        }
        out
    }
}
