//! The process C heap as a raw backend.

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{HeapFeatures, HeapLock, RawHeap};

/// Wrapper over `malloc`/`free` that remembers what it handed out, so a
/// foreign pointer is rejected instead of corrupting the C heap. Backs
/// user-created heaps behind a [`super::BlockHeapWrapper`]; `malloc`
/// guarantees `MIN_ALIGN` for the sizes this crate requests.
pub struct SystemHeap {
    /// Live allocations, base address to usable size.
    live: Mutex<HashMap<usize, usize>>,
    lock: HeapLock,
}

impl Default for SystemHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemHeap {
    pub fn new() -> Self {
        SystemHeap {
            live: Mutex::new(HashMap::new()),
            lock: HeapLock::INIT,
        }
    }
}

impl Drop for SystemHeap {
    fn drop(&mut self) {
        for (&base, _) in self.live.lock().iter() {
            unsafe { libc::free(base as *mut libc::c_void) };
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn usable_size(ptr: *mut u8) -> usize {
    libc::malloc_usable_size(ptr as *mut libc::c_void)
}

#[cfg(target_os = "macos")]
unsafe fn usable_size(ptr: *mut u8) -> usize {
    libc::malloc_size(ptr as *const libc::c_void)
}

impl RawHeap for SystemHeap {
    fn allocate_raw(&self, size: usize) -> *mut u8 {
        // malloc(0) may return null on some libcs; normalize to 1 byte so a
        // successful zero-size allocation still yields a distinct pointer.
        let size = size.max(1);
        let ptr = unsafe { libc::malloc(size) as *mut u8 };
        if !ptr.is_null() {
            let usable = unsafe { usable_size(ptr) };
            self.live.lock().insert(ptr as usize, usable.max(size));
        }
        ptr
    }

    fn free_raw(&self, ptr: *mut u8) -> bool {
        if self.live.lock().remove(&(ptr as usize)).is_none() {
            return false;
        }
        unsafe { libc::free(ptr as *mut libc::c_void) };
        true
    }

    fn size_raw(&self, ptr: *mut u8) -> Option<usize> {
        self.live.lock().get(&(ptr as usize)).copied()
    }

    fn is_allocated(&self, addr: usize) -> bool {
        self.live
            .lock()
            .iter()
            .any(|(&base, &size)| addr >= base && addr < base + size)
    }

    fn features(&self) -> HeapFeatures {
        HeapFeatures::SUPPORTS_SIZE | HeapFeatures::SUPPORTS_IS_ALLOCATED
    }

    fn lock(&self) -> &HeapLock {
        &self.lock
    }
}
