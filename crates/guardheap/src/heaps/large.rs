//! Page-granular backend for large allocations.
//!
//! Each block gets its own anonymous mapping bracketed by two permanently
//! inaccessible guard pages, so linear overflow in either direction faults
//! immediately. While a block sits in quarantine the whole mapping is made
//! inaccessible, turning use-after-free into a fault as well.

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::block::{plan_layout, BlockInfo, BlockLayout};
use crate::platform;
use crate::util::{align_down, align_up, MIN_ALIGN};

use super::{BlockHeap, HeapFeatures, HeapLock, RawHeap};

struct Reservation {
    map_base: usize,
    map_size: usize,
    block_end: usize,
}

pub struct LargeBlockHeap {
    /// Live and quarantined reservations, keyed by block base.
    reservations: Mutex<HashMap<usize, Reservation>>,
    lock: HeapLock,
}

impl Default for LargeBlockHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl LargeBlockHeap {
    pub fn new() -> Self {
        LargeBlockHeap {
            reservations: Mutex::new(HashMap::new()),
            lock: HeapLock::INIT,
        }
    }

    /// Number of outstanding reservations. Test/diagnostic aid.
    pub fn reservation_count(&self) -> usize {
        self.reservations.lock().len()
    }
}

impl Drop for LargeBlockHeap {
    fn drop(&mut self) {
        for r in self.reservations.lock().values() {
            unsafe { platform::unmap(r.map_base as *mut u8, r.map_size) };
        }
    }
}

impl RawHeap for LargeBlockHeap {
    fn allocate_raw(&self, _size: usize) -> *mut u8 {
        // Only whole guarded blocks; raw requests belong elsewhere.
        core::ptr::null_mut()
    }

    fn free_raw(&self, _ptr: *mut u8) -> bool {
        false
    }

    fn size_raw(&self, _ptr: *mut u8) -> Option<usize> {
        None
    }

    fn is_allocated(&self, addr: usize) -> bool {
        self.reservations
            .lock()
            .values()
            .any(|r| addr >= r.map_base && addr < r.block_end)
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

impl BlockHeap for LargeBlockHeap {
    fn plan_block(
        &self,
        body_size: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Option<BlockLayout> {
        plan_layout(
            MIN_ALIGN,
            platform::page_size(),
            body_size,
            min_left_redzone,
            min_right_redzone,
        )
    }

    fn allocate_block(&self, layout: &BlockLayout) -> Option<BlockInfo> {
        let page = platform::page_size();
        debug_assert_eq!(layout.block_size % page, 0);

        let map_size = layout.block_size.checked_add(page.checked_mul(2)?)?;
        let map = unsafe { platform::map_anonymous(map_size) };
        if map.is_null() {
            return None;
        }
        let map_base = map as usize;
        let base = map_base + page;
        unsafe {
            platform::protect_none(map, page);
            platform::protect_none((base + layout.block_size) as *mut u8, page);
        }

        self.reservations.lock().insert(
            base,
            Reservation {
                map_base,
                map_size,
                block_end: base + layout.block_size,
            },
        );
        Some(BlockInfo::new(base, *layout))
    }

    fn free_block(&self, info: &BlockInfo) -> bool {
        let reservation = match self.reservations.lock().remove(&info.base) {
            Some(r) => r,
            None => return false,
        };
        unsafe { platform::unmap(reservation.map_base as *mut u8, reservation.map_size) };
        true
    }

    fn protect_block(&self, info: &BlockInfo) {
        // Whole-block lockdown while quarantined. Metadata becomes
        // unreadable too; callers unprotect before touching it.
        unsafe { platform::protect_none(info.base as *mut u8, info.layout.block_size) };
    }

    fn unprotect_block(&self, info: &BlockInfo) {
        unsafe { platform::protect_read_write(info.base as *mut u8, info.layout.block_size) };
    }

    fn protect_block_redzones(&self, info: &BlockInfo) {
        // Redzones here are page-rounded, so any overflow that crosses the
        // body boundary faults without waiting for checksum validation.
        let page = platform::page_size();
        let left_end = align_down(info.body(), page);
        if left_end > info.base {
            unsafe { platform::protect_none(info.base as *mut u8, left_end - info.base) };
        }
        let right_start = align_up(info.body() + info.layout.body_size, page);
        let block_end = info.base + info.layout.block_size;
        if right_start < block_end {
            unsafe { platform::protect_none(right_start as *mut u8, block_end - right_start) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_roundtrip_with_guard_pages() {
        let heap = LargeBlockHeap::new();
        let layout = heap.plan_block(100 * 1024, 0, 0).unwrap();
        assert_eq!(layout.block_size % platform::page_size(), 0);

        let info = heap.allocate_block(&layout).unwrap();
        assert!(heap.is_allocated(info.body()));
        assert_eq!(heap.reservation_count(), 1);

        // Body is writable across its whole span.
        unsafe {
            core::ptr::write_bytes(info.body() as *mut u8, 0xAB, layout.body_size);
        }

        assert!(heap.free_block(&info));
        assert!(!heap.is_allocated(info.body()));
        assert_eq!(heap.reservation_count(), 0);
    }

    #[test]
    fn protect_then_unprotect_restores_access() {
        let heap = LargeBlockHeap::new();
        let layout = heap.plan_block(4096, 0, 0).unwrap();
        let info = heap.allocate_block(&layout).unwrap();

        heap.protect_block(&info);
        heap.unprotect_block(&info);
        unsafe {
            (info.body() as *mut u8).write(1);
            assert_eq!((info.body() as *const u8).read(), 1);
        }
        assert!(heap.free_block(&info));
    }

    #[test]
    fn redzone_protection_leaves_body_writable() {
        let heap = LargeBlockHeap::new();
        let layout = heap.plan_block(3 * platform::page_size(), 0, 0).unwrap();
        let info = heap.allocate_block(&layout).unwrap();

        heap.protect_block_redzones(&info);
        unsafe {
            core::ptr::write_bytes(info.body() as *mut u8, 0x5A, layout.body_size);
        }
        heap.unprotect_block(&info);
        // Metadata region readable again.
        unsafe {
            let _ = (info.base as *const u8).read();
        }
        assert!(heap.free_block(&info));
    }

    #[test]
    fn unknown_block_is_not_freed() {
        let heap = LargeBlockHeap::new();
        let layout = heap.plan_block(4096, 0, 0).unwrap();
        let bogus = BlockInfo::new(0x10000, layout);
        assert!(!heap.free_block(&bogus));
    }
}
