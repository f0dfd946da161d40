//! Internal chunked heap backing the process-default heap.
//!
//! A pool of bump-allocated chunks carved from the C heap. Individual frees
//! only decrement a per-chunk live count; chunk memory is recycled when the
//! count hits zero. In exchange the heap can answer `is_allocated` with a
//! containment check, which the default caller heap needs so `free` can tell
//! its own pointers apart from foreign ones.

use hashbrown::HashSet;
use parking_lot::Mutex;

use crate::util::{align_up, is_aligned, MIN_ALIGN};

use super::{HeapFeatures, HeapLock, RawHeap};

const CHUNK_SIZE: usize = 64 * 1024;

struct Chunk {
    base: usize,
    size: usize,
    /// Bump offset; bytes past it were never handed out.
    cursor: usize,
    /// Outstanding allocations served from this chunk.
    live: usize,
    /// Oversized single-allocation chunk, released on free.
    dedicated: bool,
}

impl Chunk {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    fn contains_handed_out(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.cursor
    }
}

struct InternalState {
    chunks: Vec<Chunk>,
    /// Base addresses currently handed out. A repeated or stray free must
    /// not decrement a chunk's live count under a live allocation.
    live: HashSet<usize>,
}

pub struct InternalHeap {
    state: Mutex<InternalState>,
    lock: HeapLock,
}

impl Default for InternalHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl InternalHeap {
    pub fn new() -> Self {
        InternalHeap {
            state: Mutex::new(InternalState {
                chunks: Vec::new(),
                live: HashSet::new(),
            }),
            lock: HeapLock::INIT,
        }
    }

    fn new_chunk(size: usize, dedicated: bool) -> Option<Chunk> {
        let base = unsafe { libc::malloc(size) as usize };
        if base == 0 {
            return None;
        }
        debug_assert!(is_aligned(base, MIN_ALIGN));
        Some(Chunk {
            base,
            size,
            cursor: 0,
            live: 0,
            dedicated,
        })
    }
}

impl Drop for InternalHeap {
    fn drop(&mut self) {
        for chunk in self.state.lock().chunks.drain(..) {
            unsafe { libc::free(chunk.base as *mut libc::c_void) };
        }
    }
}

impl RawHeap for InternalHeap {
    fn allocate_raw(&self, size: usize) -> *mut u8 {
        let needed = align_up(size.max(1), MIN_ALIGN);
        let state = &mut *self.state.lock();

        if needed > CHUNK_SIZE {
            let mut chunk = match Self::new_chunk(needed, true) {
                Some(c) => c,
                None => return core::ptr::null_mut(),
            };
            chunk.cursor = needed;
            chunk.live = 1;
            let ptr = chunk.base as *mut u8;
            state.live.insert(chunk.base);
            state.chunks.push(chunk);
            return ptr;
        }

        if let Some(chunk) = state
            .chunks
            .iter_mut()
            .find(|c| !c.dedicated && c.size - c.cursor >= needed)
        {
            let ptr = (chunk.base + chunk.cursor) as *mut u8;
            chunk.cursor += needed;
            chunk.live += 1;
            state.live.insert(ptr as usize);
            return ptr;
        }

        let mut chunk = match Self::new_chunk(CHUNK_SIZE, false) {
            Some(c) => c,
            None => return core::ptr::null_mut(),
        };
        chunk.cursor = needed;
        chunk.live = 1;
        let ptr = chunk.base as *mut u8;
        state.live.insert(chunk.base);
        state.chunks.push(chunk);
        ptr
    }

    fn free_raw(&self, ptr: *mut u8) -> bool {
        let addr = ptr as usize;
        let state = &mut *self.state.lock();
        if !state.live.remove(&addr) {
            return false;
        }
        let idx = match state.chunks.iter().position(|c| c.contains(addr)) {
            Some(i) => i,
            None => return false,
        };
        let chunk = &mut state.chunks[idx];
        debug_assert!(chunk.live > 0);
        chunk.live = chunk.live.saturating_sub(1);
        if chunk.live == 0 {
            if chunk.dedicated {
                let base = chunk.base;
                state.chunks.swap_remove(idx);
                unsafe { libc::free(base as *mut libc::c_void) };
            } else {
                chunk.cursor = 0;
            }
        }
        true
    }

    fn size_raw(&self, _ptr: *mut u8) -> Option<usize> {
        None
    }

    fn is_allocated(&self, addr: usize) -> bool {
        self.state
            .lock()
            .chunks
            .iter()
            .any(|c| c.contains_handed_out(addr))
    }

    fn features(&self) -> HeapFeatures {
        HeapFeatures::SUPPORTS_IS_ALLOCATED
    }

    fn lock(&self) -> &HeapLock {
        &self.lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_contained() {
        let heap = InternalHeap::new();
        let ptr = heap.allocate_raw(48);
        assert!(!ptr.is_null());
        assert!(is_aligned(ptr as usize, MIN_ALIGN));
        assert!(heap.is_allocated(ptr as usize));
        assert!(heap.is_allocated(ptr as usize + 47));
        assert!(!heap.is_allocated(0x10));
        assert!(heap.free_raw(ptr));
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let heap = InternalHeap::new();
        let mut local = 0u8;
        assert!(!heap.free_raw(&mut local));
    }

    #[test]
    fn repeated_free_cannot_recycle_a_live_chunk() {
        let heap = InternalHeap::new();
        let a = heap.allocate_raw(64);
        let b = heap.allocate_raw(64);
        assert!(heap.free_raw(a));
        assert!(!heap.free_raw(a), "second free of the same pointer");
        // b is still live in the same chunk; the cursor must not have been
        // reset underneath it.
        assert!(heap.is_allocated(b as usize));
        let c = heap.allocate_raw(64);
        assert_ne!(c, b);
        assert!(heap.free_raw(b));
        assert!(heap.free_raw(c));
    }

    #[test]
    fn oversized_request_gets_dedicated_chunk() {
        let heap = InternalHeap::new();
        let ptr = heap.allocate_raw(CHUNK_SIZE * 2);
        assert!(!ptr.is_null());
        assert!(heap.is_allocated(ptr as usize + CHUNK_SIZE));
        assert!(heap.free_raw(ptr));
        assert!(!heap.is_allocated(ptr as usize));
    }

    #[test]
    fn chunk_is_recycled_when_drained() {
        let heap = InternalHeap::new();
        let a = heap.allocate_raw(64);
        let b = heap.allocate_raw(64);
        assert!(heap.free_raw(a));
        assert!(heap.free_raw(b));
        // Cursor reset: the next allocation reuses the same chunk base.
        let c = heap.allocate_raw(64);
        assert_eq!(c, a);
        heap.free_raw(c);
    }
}
