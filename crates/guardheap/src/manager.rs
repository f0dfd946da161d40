//! The block heap manager: routing, instrumentation, quarantine, and error
//! detection over a registry of heap backends.
//!
//! Every guarded block records the backend that serviced it in its trailer;
//! `free` therefore works no matter which heap handle the caller passes, and
//! quarantine membership follows the servicing backend, not the handle.
//!
//! Locking: the all-heaps lock is outermost and taken only by
//! `best_effort_lock_all` and `destroy_heap`. Per-heap locks may nest around
//! registry *reads* but never around the registry write lock; quarantine
//! shards and backend state are innermost and never held across calls out.

use core::cell::Cell;
use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::block::{self, BlockInfo, BlockState, BlockTrailer};
use crate::error::{ErrorSink, HeapError, HeapErrorKind};
use crate::heaps::{
    BlockHeap, BlockHeapWrapper, HeapFeatures, HeapLock, HeapLockGuard, InternalHeap,
    LargeBlockHeap, RawHeap, SystemHeap, ZebraBlockHeap,
};
use crate::params::Parameters;
use crate::platform;
use crate::quarantine::{BlockQuarantine, ShardedQuarantine};
use crate::services::{ShadowMarker, ShadowMemory, StackCapture, StackId};
use crate::util::POISON_BYTE;
use crate::HeapId;

/// How long `best_effort_lock_all` waits per heap before skipping it.
const LOCK_ALL_TIMEOUT: Duration = Duration::from_millis(50);

thread_local! {
    static GUARD_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

struct HeapEntry {
    heap: Arc<dyn BlockHeap>,
    quarantine: Arc<dyn BlockQuarantine>,
    builtin: bool,
}

#[derive(Default)]
struct StatsCells {
    allocations_guarded: AtomicU64,
    allocations_passed_through: AtomicU64,
    allocations_failed: AtomicU64,
    frees: AtomicU64,
    corrupt_blocks: AtomicU64,
    double_frees: AtomicU64,
    quarantine_evictions: AtomicU64,
}

/// Point-in-time counters, taken without stopping the world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapManagerStats {
    pub allocations_guarded: u64,
    pub allocations_passed_through: u64,
    pub allocations_failed: u64,
    pub frees: u64,
    pub corrupt_blocks: u64,
    pub double_frees: u64,
    pub quarantine_evictions: u64,
}

pub struct BlockHeapManager {
    shadow: Arc<dyn ShadowMemory>,
    stacks: Arc<dyn StackCapture>,
    errors: Arc<dyn ErrorSink>,
    params: Mutex<Parameters>,
    registry: RwLock<HashMap<HeapId, HeapEntry>>,
    shared_quarantine: Arc<ShardedQuarantine>,
    process_heap: HeapId,
    large_heap: Mutex<Option<HeapId>>,
    zebra_heap: Mutex<Option<(HeapId, Arc<ZebraBlockHeap>)>>,
    all_heaps_lock: HeapLock,
    locked_heaps: Mutex<Vec<Arc<dyn BlockHeap>>>,
    rng: AtomicU64,
    next_heap_id: AtomicU64,
    stats: StatsCells,
}

impl BlockHeapManager {
    pub fn new(
        shadow: Arc<dyn ShadowMemory>,
        stacks: Arc<dyn StackCapture>,
        errors: Arc<dyn ErrorSink>,
        params: Parameters,
    ) -> Self {
        let params = params.sanitized();
        let shared_quarantine = Arc::new(ShardedQuarantine::new(
            params.quarantine_size,
            params.quarantine_block_size,
        ));

        let mut manager = BlockHeapManager {
            shadow,
            stacks,
            errors,
            params: Mutex::new(params.clone()),
            registry: RwLock::new(HashMap::new()),
            shared_quarantine,
            process_heap: HeapId::from_u64(0), // replaced below
            large_heap: Mutex::new(None),
            zebra_heap: Mutex::new(None),
            all_heaps_lock: HeapLock::INIT,
            locked_heaps: Mutex::new(Vec::new()),
            rng: AtomicU64::new(platform::fast_random_u64() | 1),
            next_heap_id: AtomicU64::new(1),
            stats: StatsCells::default(),
        };

        let process_heap = manager.register_heap(
            Arc::new(BlockHeapWrapper::new(InternalHeap::new())),
            manager.shared_quarantine.clone(),
            true,
        );
        manager.process_heap = process_heap;
        manager.ensure_auxiliary_heaps(&params);
        manager
    }

    /// The always-present default heap. Never destroyable.
    pub fn process_heap(&self) -> HeapId {
        self.process_heap
    }

    pub fn parameters(&self) -> Parameters {
        self.params.lock().clone()
    }

    pub fn stats(&self) -> HeapManagerStats {
        HeapManagerStats {
            allocations_guarded: self.stats.allocations_guarded.load(Ordering::Relaxed),
            allocations_passed_through: self
                .stats
                .allocations_passed_through
                .load(Ordering::Relaxed),
            allocations_failed: self.stats.allocations_failed.load(Ordering::Relaxed),
            frees: self.stats.frees.load(Ordering::Relaxed),
            corrupt_blocks: self.stats.corrupt_blocks.load(Ordering::Relaxed),
            double_frees: self.stats.double_frees.load(Ordering::Relaxed),
            quarantine_evictions: self.stats.quarantine_evictions.load(Ordering::Relaxed),
        }
    }

    /// Per-thread override consulted when the allocation filter is enabled:
    /// only threads that opt in receive guard instrumentation.
    pub fn set_allocation_filter_flag(&self, enabled: bool) {
        GUARD_THIS_THREAD.with(|flag| flag.set(enabled));
    }

    pub fn allocation_filter_flag(&self) -> bool {
        GUARD_THIS_THREAD.with(|flag| flag.get())
    }

    /// Create a caller heap backed by the C allocator. All caller heaps
    /// share the process-wide quarantine.
    pub fn create_heap(&self) -> HeapId {
        let id = self.register_heap(
            Arc::new(BlockHeapWrapper::new(SystemHeap::new())),
            self.shared_quarantine.clone(),
            false,
        );
        log::debug!("created heap {:?}", id);
        id
    }

    /// Tear down a caller heap. Returns `false` for unknown handles and for
    /// the built-in heaps, which live as long as the manager.
    ///
    /// The heap's quarantine is drained: blocks owned by the dying heap are
    /// reclaimed on the spot, blocks owned by other heaps (the quarantine is
    /// shared) are re-admitted to their owner's quarantine.
    pub fn destroy_heap(&self, heap_id: HeapId) -> bool {
        let _all = HeapLockGuard::acquire(&self.all_heaps_lock);
        let entry = {
            let mut registry = self.registry.write();
            let entry = match registry.remove(&heap_id) {
                Some(entry) => entry,
                None => return false,
            };
            if entry.builtin {
                registry.insert(heap_id, entry);
                return false;
            }
            entry
        };

        for info in entry.quarantine.drain() {
            let (_, backend) = self.resolve_backend(&info, Some((heap_id, entry.heap.clone())));
            backend.unprotect_block(&info);
            if !unsafe { block::verify(&info) } {
                self.report_corrupt_block(&info);
                self.release_block(&backend, &info, false);
                continue;
            }
            let owner = HeapId::from_u64(unsafe { info.trailer().heap_id });
            if owner != heap_id {
                if let Some(other) = self.registry.read().get(&owner) {
                    if other.quarantine.push(info) {
                        backend.protect_block(&info);
                        continue;
                    }
                }
                // Re-admission declined. The dying heap's backend never
                // owned this memory; release through the trailer owner's.
                let (_, owner_backend) = self.resolve_backend(&info, None);
                self.release_block(&owner_backend, &info, true);
                continue;
            }
            self.release_block(&backend, &info, true);
        }
        log::debug!("destroyed heap {:?}", heap_id);
        true
    }

    /// Allocate `body_size` bytes from `heap_id`. Returns the body pointer,
    /// or null on failure or an unknown handle.
    ///
    /// Instrumentation is subsampled by `allocation_guard_rate`; requests
    /// that lose the draw go straight to the raw backend. Guarded requests
    /// are offered to the zebra heap first, then the large-block heap, then
    /// the caller's own backend.
    pub fn allocate(&self, heap_id: HeapId, body_size: usize) -> *mut u8 {
        let entry_heap = match self.registry.read().get(&heap_id) {
            Some(entry) => entry.heap.clone(),
            None => return core::ptr::null_mut(),
        };
        let params = self.params.lock().clone();
        let _heap_guard = HeapLockGuard::acquire(entry_heap.lock());

        let filtered_out = params.enable_allocation_filter && !self.allocation_filter_flag();
        if filtered_out || !self.should_guard(params.allocation_guard_rate) {
            let ptr = entry_heap.allocate_raw(body_size);
            if ptr.is_null() {
                self.stats.allocations_failed.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats
                    .allocations_passed_through
                    .fetch_add(1, Ordering::Relaxed);
            }
            return ptr;
        }

        let mut candidates: Vec<(HeapId, Arc<dyn BlockHeap>)> = vec![(heap_id, entry_heap.clone())];
        if params.enable_large_block_heap && body_size >= params.large_allocation_threshold {
            if let Some(id) = *self.large_heap.lock() {
                if let Some(entry) = self.registry.read().get(&id) {
                    candidates.push((id, entry.heap.clone()));
                }
            }
        }
        if params.enable_zebra_block_heap {
            if let Some((id, zebra)) = self.zebra_heap.lock().clone() {
                candidates.push((id, zebra));
            }
        }

        let min_right = params.trailer_padding_size + size_of::<BlockTrailer>();
        for (owner_id, backend) in candidates.iter().rev() {
            let layout = match backend.plan_block(body_size, 0, min_right) {
                Some(layout) => layout,
                None => continue,
            };
            let info = match backend.allocate_block(&layout) {
                Some(info) => info,
                None => continue,
            };
            let alloc_stack = self.stacks.save_stack_trace();
            unsafe {
                block::initialize(&info, alloc_stack, *owner_id, platform::thread_id());
            }
            self.shadow.poison_allocated_block(&info);
            backend.protect_block_redzones(&info);
            self.stats
                .allocations_guarded
                .fetch_add(1, Ordering::Relaxed);
            return info.body() as *mut u8;
        }

        // No backend could take the block; fall back to an unguarded
        // allocation rather than failing the caller.
        let ptr = entry_heap.allocate_raw(body_size);
        if ptr.is_null() {
            self.stats.allocations_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats
                .allocations_passed_through
                .fetch_add(1, Ordering::Relaxed);
        }
        ptr
    }

    /// Free `ptr` against `heap_id`.
    ///
    /// Returns `true` when the memory was accepted (including admission to
    /// quarantine). Returns `false` for foreign pointers on non-default
    /// heaps and for detected errors; errors are additionally reported
    /// through the sink, exactly once, and the block is still reclaimed on
    /// corruption so nothing leaks.
    pub fn free(&self, heap_id: HeapId, ptr: *mut u8) -> bool {
        if ptr.is_null() {
            return true;
        }
        let entry_heap = match self.registry.read().get(&heap_id) {
            Some(entry) => entry.heap.clone(),
            None => return false,
        };
        let _heap_guard = HeapLockGuard::acquire(entry_heap.lock());

        let addr = ptr as usize;
        if !self.shadow.is_beginning_of_block_body(addr) {
            return self.free_raw_fallback(heap_id, &entry_heap, ptr);
        }
        let info = match self.shadow.block_info_from_shadow(addr) {
            Some(info) => info,
            None => return false,
        };

        // No caller hint: the trailer, not the handle, names the owner, so a
        // block freed through any heap's handle still routes correctly.
        let (_, backend) = self.resolve_backend(&info, None);
        backend.unprotect_block(&info);

        if !unsafe { block::verify(&info) } {
            self.report_corrupt_block(&info);
            self.release_block(&backend, &info, false);
            return false;
        }

        match unsafe { info.state() } {
            Some(BlockState::Allocated) => {}
            _ => {
                // Quarantined or already freed: a second free. The block is
                // left exactly as it was.
                self.stats.double_frees.fetch_add(1, Ordering::Relaxed);
                let (alloc_stack, free_stack) = unsafe {
                    let header = info.header();
                    (header.alloc_stack, header.free_stack)
                };
                self.report(HeapErrorKind::DoubleFree, addr, alloc_stack, free_stack);
                backend.protect_block(&info);
                return false;
            }
        }

        let owner = HeapId::from_u64(unsafe { info.trailer().heap_id });
        let free_stack = self.stacks.save_stack_trace();
        unsafe {
            info.header().free_stack = free_stack;
            let trailer = info.trailer();
            trailer.free_tid = platform::thread_id() as u64;
            trailer.free_ticks = platform::ticks();
            block::set_state(&info, BlockState::Quarantined);
            core::ptr::write_bytes(info.body() as *mut u8, POISON_BYTE, info.layout.body_size);
        }
        self.shadow.mark_as_freed(info.base, info.layout.block_size);

        let quarantine = self
            .registry
            .read()
            .get(&owner)
            .map(|entry| entry.quarantine.clone())
            .unwrap_or_else(|| self.shared_quarantine.clone());

        if quarantine.push(info) {
            backend.protect_block(&info);
        } else {
            self.release_block(&backend, &info, true);
        }
        self.stats.frees.fetch_add(1, Ordering::Relaxed);

        for evicted in quarantine.trim() {
            self.stats
                .quarantine_evictions
                .fetch_add(1, Ordering::Relaxed);
            self.free_potentially_corrupt_block(evicted);
        }
        true
    }

    /// Body size of a guarded block, or the backend's usable size for raw
    /// allocations. Answered from the shadow, so it works even while the
    /// block's own pages are protected.
    pub fn allocation_size(&self, heap_id: HeapId, ptr: *mut u8) -> Option<usize> {
        if ptr.is_null() {
            return None;
        }
        if let Some(info) = self.shadow.block_info_from_shadow(ptr as usize) {
            return Some(info.layout.body_size);
        }
        let registry = self.registry.read();
        registry.get(&heap_id)?.heap.size_raw(ptr)
    }

    /// Acquire `heap_id`'s reentrant lock. `false` for unknown handles.
    pub fn lock(&self, heap_id: HeapId) -> bool {
        let heap = match self.registry.read().get(&heap_id) {
            Some(entry) => entry.heap.clone(),
            None => return false,
        };
        heap.lock().lock();
        true
    }

    /// Release `heap_id`'s lock.
    ///
    /// # Safety
    /// The calling thread must hold the lock via a prior [`Self::lock`].
    pub unsafe fn unlock(&self, heap_id: HeapId) -> bool {
        let heap = match self.registry.read().get(&heap_id) {
            Some(entry) => entry.heap.clone(),
            None => return false,
        };
        heap.lock().unlock();
        true
    }

    /// Lock as many heaps as possible, skipping any that cannot be acquired
    /// within a short timeout. Pre-fork style: the caller must invoke
    /// [`Self::unlock_all`] from the same thread.
    pub fn best_effort_lock_all(&self) {
        self.all_heaps_lock.lock();
        let heaps: Vec<Arc<dyn BlockHeap>> = self
            .registry
            .read()
            .values()
            .map(|entry| entry.heap.clone())
            .collect();
        let mut locked = self.locked_heaps.lock();
        for heap in heaps {
            if heap.lock().try_lock_for(LOCK_ALL_TIMEOUT) {
                locked.push(heap);
            }
        }
    }

    /// Undo [`Self::best_effort_lock_all`].
    ///
    /// # Safety
    /// Must be called on the thread that called `best_effort_lock_all`,
    /// with no intervening `unlock_all`.
    pub unsafe fn unlock_all(&self) {
        for heap in self.locked_heaps.lock().drain(..) {
            heap.lock().unlock();
        }
        self.all_heaps_lock.unlock();
    }

    /// Swap the parameter set. Quarantine caps and the zebra ratio take
    /// effect immediately, including eviction down to the new caps; newly
    /// enabled backends are created on the spot. Backends are never torn
    /// down by disabling them, they just stop receiving new allocations.
    pub fn set_parameters(&self, params: Parameters) {
        let params = params.sanitized();
        *self.params.lock() = params.clone();
        log::debug!("parameters updated: {:?}", params);

        self.shared_quarantine.set_max_bytes(params.quarantine_size);
        self.shared_quarantine
            .set_max_block_size(params.quarantine_block_size);
        self.ensure_auxiliary_heaps(&params);

        for evicted in self.shared_quarantine.trim() {
            self.stats
                .quarantine_evictions
                .fetch_add(1, Ordering::Relaxed);
            self.free_potentially_corrupt_block(evicted);
        }
        let zebra = self.zebra_heap.lock().clone();
        if let Some((_, zebra)) = zebra {
            for evicted in zebra.trim() {
                self.stats
                    .quarantine_evictions
                    .fetch_add(1, Ordering::Relaxed);
                self.free_potentially_corrupt_block(evicted);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn register_heap(
        &self,
        heap: Arc<dyn BlockHeap>,
        quarantine: Arc<dyn BlockQuarantine>,
        builtin: bool,
    ) -> HeapId {
        let id = HeapId::from_u64(self.next_heap_id.fetch_add(1, Ordering::Relaxed));
        self.registry.write().insert(
            id,
            HeapEntry {
                heap,
                quarantine,
                builtin,
            },
        );
        id
    }

    fn ensure_auxiliary_heaps(&self, params: &Parameters) {
        if params.enable_large_block_heap {
            let mut slot = self.large_heap.lock();
            if slot.is_none() {
                let id = self.register_heap(
                    Arc::new(LargeBlockHeap::new()),
                    self.shared_quarantine.clone(),
                    true,
                );
                *slot = Some(id);
            }
        }
        if params.enable_zebra_block_heap {
            let mut slot = self.zebra_heap.lock();
            match &*slot {
                Some((_, zebra)) => {
                    zebra.set_quarantine_ratio(params.zebra_block_heap_quarantine_ratio)
                }
                None => {
                    if let Some(zebra) = ZebraBlockHeap::new(
                        params.zebra_block_heap_size,
                        params.zebra_block_heap_quarantine_ratio,
                    ) {
                        let zebra = Arc::new(zebra);
                        let id = self.register_heap(zebra.clone(), zebra.clone(), true);
                        *slot = Some((id, zebra));
                    }
                }
            }
        }
    }

    /// Find the backend that owns `info`'s memory. The page-granular
    /// backends answer ownership directly; otherwise the caller's heap (if
    /// given) is trusted, then the trailer, then the default heap.
    fn resolve_backend(
        &self,
        info: &BlockInfo,
        caller: Option<(HeapId, Arc<dyn BlockHeap>)>,
    ) -> (HeapId, Arc<dyn BlockHeap>) {
        let zebra = self.zebra_heap.lock().clone();
        if let Some((id, zebra)) = zebra {
            if zebra.is_allocated(info.base) {
                return (id, zebra);
            }
        }
        let large = *self.large_heap.lock();
        if let Some(id) = large {
            if let Some(entry) = self.registry.read().get(&id) {
                if entry.heap.is_allocated(info.base) {
                    return (id, entry.heap.clone());
                }
            }
        }
        if let Some(caller) = caller {
            return caller;
        }
        // Non-protecting backends leave metadata readable; the trailer names
        // the owner even without a caller hint.
        let owner = HeapId::from_u64(unsafe { info.trailer().heap_id });
        let registry = self.registry.read();
        if let Some(entry) = registry.get(&owner) {
            return (owner, entry.heap.clone());
        }
        // The trailer named no live heap (likely corrupted); any backend
        // that can answer containment gets a chance to claim the memory.
        for (id, entry) in registry.iter() {
            if entry
                .heap
                .features()
                .contains(HeapFeatures::SUPPORTS_IS_ALLOCATED)
                && entry.heap.is_allocated(info.base)
            {
                return (*id, entry.heap.clone());
            }
        }
        let process = registry
            .get(&self.process_heap)
            .map(|entry| entry.heap.clone());
        drop(registry);
        match process {
            Some(heap) => (self.process_heap, heap),
            None => unreachable!("process heap is never deregistered"),
        }
    }

    fn free_raw_fallback(
        &self,
        heap_id: HeapId,
        heap: &Arc<dyn BlockHeap>,
        ptr: *mut u8,
    ) -> bool {
        if heap.free_raw(ptr) {
            self.stats.frees.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if heap_id == self.process_heap {
            // The default heap accepts pointers that predate interception.
            unsafe { libc::free(ptr as *mut libc::c_void) };
            self.stats.frees.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Reclaim a block coming out of quarantine (eviction, cap shrink, heap
    /// teardown). The checksum is verified first; corruption is reported
    /// exactly once, and the memory is released either way.
    fn free_potentially_corrupt_block(&self, info: BlockInfo) {
        let (_, backend) = self.resolve_backend(&info, None);
        backend.unprotect_block(&info);
        if unsafe { block::verify(&info) } {
            self.release_block(&backend, &info, true);
        } else {
            self.report_corrupt_block(&info);
            self.release_block(&backend, &info, false);
        }
    }

    /// Final release of a block's memory and bookkeeping. When the metadata
    /// is trusted, the stack references are returned and the terminal state
    /// recorded; otherwise the memory is dropped without touching it again.
    fn release_block(&self, backend: &Arc<dyn BlockHeap>, info: &BlockInfo, trusted: bool) {
        if trusted {
            unsafe {
                let header = info.header();
                self.stacks.release_stack_trace(header.alloc_stack);
                self.stacks.release_stack_trace(header.free_stack);
                block::set_state(info, BlockState::Freed);
            }
        }
        if backend
            .features()
            .contains(HeapFeatures::REPORTS_RESERVATIONS)
        {
            self.shadow
                .poison(info.base, info.layout.block_size, ShadowMarker::Reserved);
        } else {
            self.shadow.unpoison(info.base, info.layout.block_size);
        }
        if !backend.free_block(info) {
            log::warn!("backend did not reclaim block at {:#x}", info.base);
        }
    }

    fn report_corrupt_block(&self, info: &BlockInfo) {
        self.stats.corrupt_blocks.fetch_add(1, Ordering::Relaxed);
        let (alloc_stack, free_stack) = unsafe {
            let header = info.header();
            (header.alloc_stack, header.free_stack)
        };
        self.report(HeapErrorKind::CorruptBlock, info.body(), alloc_stack, free_stack);
        // The recovered ids may be garbage; the capture service tolerates
        // unknown ids on release.
        self.stacks.release_stack_trace(alloc_stack);
        self.stacks.release_stack_trace(free_stack);
    }

    fn report(&self, kind: HeapErrorKind, address: usize, alloc_stack: StackId, free_stack: StackId) {
        let crash_stack = self.stacks.save_stack_trace();
        self.errors.on_heap_error(&HeapError {
            kind,
            address,
            crash_stack,
            alloc_stack,
            free_stack,
            thread_id: platform::thread_id(),
        });
        self.stacks.release_stack_trace(crash_stack);
    }

    fn should_guard(&self, rate: f64) -> bool {
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        let mut x = self.rng.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng.store(x, Ordering::Relaxed);
        ((x >> 11) as f64) * (1.0 / (1u64 << 53) as f64) < rate
    }
}

impl Drop for BlockHeapManager {
    fn drop(&mut self) {
        // Return everything still in quarantine so backends tear down clean.
        for info in self.shared_quarantine.drain() {
            self.free_potentially_corrupt_block(info);
        }
        let zebra = self.zebra_heap.lock().clone();
        if let Some((_, zebra)) = zebra {
            for info in zebra.drain() {
                self.free_potentially_corrupt_block(info);
            }
        }
    }
}
