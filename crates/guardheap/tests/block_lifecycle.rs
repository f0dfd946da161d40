//! End-to-end lifecycle tests for the block heap manager.
//!
//! These drive the public API the way an instrumentation runtime would:
//! allocate, corrupt, double-free, retune parameters, and tear down heaps,
//! checking the shadow map and the error sink after each step.

use std::sync::{Arc, Mutex};

use guardheap::error::{ErrorSink, HeapError, HeapErrorKind};
use guardheap::services::{BacktraceRegistry, NullStackCapture, ShadowMap, ShadowMemory};
use guardheap::{BlockHeapManager, Parameters};

// ---------------------------------------------------------------------------
// Harness: a manager wired to observable collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<HeapError>>,
}

impl CollectingSink {
    fn events(&self) -> Vec<HeapError> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, kind: HeapErrorKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl ErrorSink for CollectingSink {
    fn on_heap_error(&self, error: &HeapError) {
        self.events.lock().unwrap().push(*error);
    }
}

struct Harness {
    manager: BlockHeapManager,
    shadow: Arc<ShadowMap>,
    stacks: Arc<BacktraceRegistry>,
    sink: Arc<CollectingSink>,
}

fn harness(params: Parameters) -> Harness {
    let shadow = Arc::new(ShadowMap::new());
    let stacks = Arc::new(BacktraceRegistry::new());
    let sink = Arc::new(CollectingSink::default());
    let manager = BlockHeapManager::new(
        shadow.clone(),
        stacks.clone(),
        sink.clone(),
        params,
    );
    Harness {
        manager,
        shadow,
        stacks,
        sink,
    }
}

// ---------------------------------------------------------------------------
// Allocation basics
// ---------------------------------------------------------------------------

#[test]
fn guarded_roundtrip_poisons_redzones() {
    let h = harness(Parameters::default());
    let heap = h.manager.process_heap();

    let ptr = h.manager.allocate(heap, 64);
    assert!(!ptr.is_null());
    assert_eq!(h.manager.allocation_size(heap, ptr), Some(64));

    let addr = ptr as usize;
    assert!(!h.shadow.is_accessible(addr - 1), "left redzone open");
    assert!(h.shadow.is_accessible(addr));
    assert!(h.shadow.is_accessible(addr + 63));
    assert!(!h.shadow.is_accessible(addr + 64), "right redzone open");

    // The whole body is writable.
    unsafe { core::ptr::write_bytes(ptr, 0xAB, 64) };

    assert!(h.manager.free(heap, ptr));
    assert!(h.sink.events().is_empty());
}

#[test]
fn zero_size_allocations_are_distinct() {
    let h = harness(Parameters::default());
    let heap = h.manager.process_heap();

    let a = h.manager.allocate(heap, 0);
    let b = h.manager.allocate(heap, 0);
    assert!(!a.is_null() && !b.is_null());
    assert_ne!(a, b);
    assert_eq!(h.manager.allocation_size(heap, a), Some(0));

    assert!(h.manager.free(heap, a));
    assert!(h.manager.free(heap, b));
}

#[test]
fn null_free_is_accepted() {
    let h = harness(Parameters::default());
    assert!(h.manager.free(h.manager.process_heap(), core::ptr::null_mut()));
}

#[test]
fn foreign_pointer_is_rejected_on_caller_heaps() {
    let h = harness(Parameters::default());
    let heap = h.manager.create_heap();
    let mut local = 0u8;
    assert!(!h.manager.free(heap, &mut local));
}

// ---------------------------------------------------------------------------
// Free, poisoning, quarantine
// ---------------------------------------------------------------------------

#[test]
fn freed_body_is_poisoned_and_quarantined() {
    let h = harness(Parameters::default());
    let heap = h.manager.process_heap();

    let ptr = h.manager.allocate(heap, 32);
    unsafe { core::ptr::write_bytes(ptr, 0x11, 32) };
    assert!(h.manager.free(heap, ptr));

    let addr = ptr as usize;
    assert!(!h.shadow.is_accessible(addr), "freed body must be poisoned");
    // Quarantined, so still recognizable as a block and still filled with
    // the poison pattern (the default backend applies no page protection).
    assert!(h.shadow.is_beginning_of_block_body(addr));
    let body = unsafe { core::slice::from_raw_parts(ptr, 32) };
    assert!(body.iter().all(|&b| b == 0xFE));
}

#[test]
fn quarantine_occupancy_stays_under_cap() {
    let params = Parameters {
        quarantine_size: 4096,
        quarantine_block_size: 4096,
        ..Parameters::default()
    };
    let h = harness(params);
    let heap = h.manager.process_heap();

    let mut bodies = Vec::new();
    for _ in 0..32 {
        let ptr = h.manager.allocate(heap, 256);
        assert!(!ptr.is_null());
        bodies.push(ptr as usize);
        assert!(h.manager.free(heap, ptr));

        // Everything still identifiable as a quarantined block fits the cap.
        let retained: usize = bodies
            .iter()
            .filter_map(|&addr| h.shadow.block_info_from_shadow(addr))
            .map(|info| info.layout.block_size)
            .sum();
        assert!(retained <= 4096, "quarantine over cap: {} bytes", retained);
    }
    assert!(h.manager.stats().quarantine_evictions > 0, "cap never enforced");
    assert!(h.sink.events().is_empty());
}

#[test]
fn shrinking_the_cap_evicts_down() {
    let h = harness(Parameters::default());
    let heap = h.manager.process_heap();

    let mut bodies = Vec::new();
    for _ in 0..8 {
        let ptr = h.manager.allocate(heap, 128);
        bodies.push(ptr as usize);
        assert!(h.manager.free(heap, ptr));
    }
    for &addr in &bodies {
        assert!(h.shadow.is_beginning_of_block_body(addr));
    }

    h.manager.set_parameters(Parameters {
        quarantine_size: 0,
        ..Parameters::default()
    });

    for &addr in &bodies {
        assert!(
            !h.shadow.is_beginning_of_block_body(addr),
            "block survived a zero cap"
        );
    }
    assert!(h.manager.stats().quarantine_evictions >= 8);
    assert_eq!(h.stacks.live_captures(), 0, "stack refs leaked");
    assert!(h.sink.events().is_empty());
}

#[test]
fn quarantine_is_shared_across_caller_heaps() {
    // Cap sized for roughly one small block, so the second heap's free
    // forces an eviction of a block freed through the first heap.
    let params = Parameters {
        quarantine_size: 512,
        quarantine_block_size: 512,
        ..Parameters::default()
    };
    let h = harness(params);
    let heap_a = h.manager.create_heap();
    let heap_b = h.manager.create_heap();

    let a = h.manager.allocate(heap_a, 256);
    let b = h.manager.allocate(heap_b, 256);
    assert!(h.manager.free(heap_a, a));
    assert!(h.manager.free(heap_b, b));

    let alive = [a, b]
        .iter()
        .filter(|&&p| h.shadow.is_beginning_of_block_body(p as usize))
        .count();
    assert_eq!(alive, 1, "exactly one block should have been evicted");
    assert!(h.sink.events().is_empty());
}

// ---------------------------------------------------------------------------
// Error detection
// ---------------------------------------------------------------------------

#[test]
fn double_free_is_reported_once_and_rejected() {
    let h = harness(Parameters::default());
    let heap = h.manager.process_heap();

    let ptr = h.manager.allocate(heap, 48);
    assert!(h.manager.free(heap, ptr));
    assert!(!h.manager.free(heap, ptr), "second free must fail");

    assert_eq!(h.sink.count(HeapErrorKind::DoubleFree), 1);
    assert_eq!(h.manager.stats().double_frees, 1);
    // The block stays quarantined, untouched by the failed free.
    assert!(h.shadow.is_beginning_of_block_body(ptr as usize));
}

#[test]
fn double_free_report_carries_both_stacks() {
    let h = harness(Parameters::default());
    let heap = h.manager.process_heap();

    let ptr = h.manager.allocate(heap, 48);
    assert!(h.manager.free(heap, ptr));
    assert!(!h.manager.free(heap, ptr));

    let events = h.sink.events();
    let report = events
        .iter()
        .find(|e| e.kind == HeapErrorKind::DoubleFree)
        .expect("missing double-free report");
    assert_eq!(report.address, ptr as usize);
    assert_ne!(report.alloc_stack, 0);
    assert_ne!(report.free_stack, 0);
}

#[test]
fn corrupt_block_is_reported_once_and_reclaimed() {
    let h = harness(Parameters::default());
    let heap = h.manager.process_heap();

    let ptr = h.manager.allocate(heap, 40);
    // Overflow off the end of the body, straight into the right redzone.
    unsafe { core::ptr::write_bytes(ptr.add(40), 0xFF, 40) };

    assert!(!h.manager.free(heap, ptr));
    assert_eq!(h.sink.count(HeapErrorKind::CorruptBlock), 1);
    assert_eq!(h.manager.stats().corrupt_blocks, 1);

    // The block is gone, not leaked: the shadow forgot it and every stack
    // reference was returned to the registry.
    assert!(!h.shadow.is_beginning_of_block_body(ptr as usize));
    assert_eq!(h.stacks.live_captures(), 0);
}

#[test]
fn corruption_found_at_eviction_is_reported() {
    let h = harness(Parameters::default());
    let heap = h.manager.process_heap();

    let ptr = h.manager.allocate(heap, 64);
    assert!(h.manager.free(heap, ptr));
    // Scribble over the quarantined block's trailer while it sits in
    // quarantine (the default backend leaves pages writable).
    let info = {
        // Freed blocks keep their identity in the shadow.
        assert!(h.shadow.is_beginning_of_block_body(ptr as usize));
        h.shadow.block_info_from_shadow(ptr as usize).unwrap()
    };
    unsafe {
        core::ptr::write_bytes(info.trailer_addr() as *mut u8, 0xAA, 8);
    }

    // Force eviction of everything.
    h.manager.set_parameters(Parameters {
        quarantine_size: 0,
        ..Parameters::default()
    });

    assert_eq!(h.sink.count(HeapErrorKind::CorruptBlock), 1);
    assert!(!h.shadow.is_beginning_of_block_body(ptr as usize));
}

// ---------------------------------------------------------------------------
// Heap lifecycle
// ---------------------------------------------------------------------------

#[test]
fn destroy_reclaims_owned_quarantined_blocks() {
    let h = harness(Parameters::default());
    let heap = h.manager.create_heap();

    let ptr = h.manager.allocate(heap, 64);
    assert!(h.manager.free(heap, ptr));
    assert!(h.shadow.is_beginning_of_block_body(ptr as usize));

    assert!(h.manager.destroy_heap(heap));
    assert!(!h.shadow.is_beginning_of_block_body(ptr as usize));
    assert!(h.manager.allocate(heap, 16).is_null(), "stale handle usable");
    assert_eq!(h.stacks.live_captures(), 0);
}

#[test]
fn corruption_survives_heap_destruction() {
    let h = harness(Parameters::default());
    let heap = h.manager.create_heap();

    let ptr = h.manager.allocate(heap, 64);
    assert!(h.manager.free(heap, ptr));
    let info = h.shadow.block_info_from_shadow(ptr as usize).unwrap();
    unsafe { (info.base as *mut u8).write(0x00) };

    assert!(h.manager.destroy_heap(heap));
    assert_eq!(h.sink.count(HeapErrorKind::CorruptBlock), 1);
    // Released despite the corruption: nothing left in the shadow, no
    // stack references held.
    assert!(!h.shadow.is_beginning_of_block_body(ptr as usize));
    assert_eq!(h.stacks.live_captures(), 0);
}

#[test]
fn destroy_readmits_other_heaps_blocks() {
    let h = harness(Parameters::default());
    let survivor = h.manager.create_heap();
    let doomed = h.manager.create_heap();

    let kept = h.manager.allocate(survivor, 64);
    assert!(h.manager.free(survivor, kept));

    assert!(h.manager.destroy_heap(doomed));
    // The shared quarantine was drained, but the survivor's block belongs
    // to the survivor and must still be there.
    assert!(h.shadow.is_beginning_of_block_body(kept as usize));
}

#[test]
fn destroy_releases_declined_co_tenant_blocks_to_their_owner() {
    let h = harness(Parameters::default());
    let victim = h.manager.process_heap();
    let doomed = h.manager.create_heap();

    let ptr = h.manager.allocate(victim, 2000);
    assert!(!ptr.is_null());
    assert!(h.manager.free(victim, ptr));

    // Make the quarantined block inadmissible on re-admission. The byte cap
    // is untouched, so the block stays held for now.
    h.manager.set_parameters(Parameters {
        quarantine_block_size: 64,
        ..Parameters::default()
    });
    assert!(h.shadow.is_beginning_of_block_body(ptr as usize));

    assert!(h.manager.destroy_heap(doomed));
    // Re-admission was declined, so the block was released through its
    // owner's backend: nothing leaked, and the chunk slot is reusable.
    assert!(!h.shadow.is_beginning_of_block_body(ptr as usize));
    assert_eq!(h.stacks.live_captures(), 0);
    let again = h.manager.allocate(victim, 2000);
    assert_eq!(again, ptr, "owner backend never got the block back");
    assert!(h.manager.free(victim, again));
    assert!(h.sink.events().is_empty());
}

#[test]
fn free_through_another_handle_routes_to_the_owner() {
    let h = harness(Parameters::default());
    let heap_a = h.manager.create_heap();
    let heap_b = h.manager.create_heap();

    let ptr = h.manager.allocate(heap_a, 96);
    assert!(!ptr.is_null());
    // The trailer, not the handle, names the owner.
    assert!(h.manager.free(heap_b, ptr));
    assert!(h.shadow.is_beginning_of_block_body(ptr as usize));

    // Quarantined under A's ownership: B's destruction re-admits it, A's
    // destruction reclaims it.
    assert!(h.manager.destroy_heap(heap_b));
    assert!(h.shadow.is_beginning_of_block_body(ptr as usize));
    assert!(h.manager.destroy_heap(heap_a));
    assert!(!h.shadow.is_beginning_of_block_body(ptr as usize));
    assert!(h.sink.events().is_empty());
    assert_eq!(h.stacks.live_captures(), 0);
}

#[test]
fn builtin_heaps_refuse_destruction() {
    let h = harness(Parameters::default());
    assert!(!h.manager.destroy_heap(h.manager.process_heap()));
    assert!(!h.manager.destroy_heap(guardheap::HeapId::from_u64(0xDEAD)));
}

#[test]
fn locks_are_reentrant_and_composable() {
    let h = harness(Parameters::default());
    let heap = h.manager.create_heap();

    assert!(h.manager.lock(heap));
    // Allocation takes the same per-heap lock; reentrancy keeps this from
    // deadlocking.
    let ptr = h.manager.allocate(heap, 32);
    assert!(!ptr.is_null());
    assert!(h.manager.free(heap, ptr));
    unsafe { assert!(h.manager.unlock(heap)) };

    h.manager.best_effort_lock_all();
    unsafe { h.manager.unlock_all() };
    let ptr = h.manager.allocate(heap, 32);
    assert!(!ptr.is_null());
    assert!(h.manager.free(heap, ptr));
}

// ---------------------------------------------------------------------------
// Backend routing
// ---------------------------------------------------------------------------

#[test]
fn large_allocations_use_the_guard_paged_backend() {
    let h = harness(Parameters::default());
    let heap = h.manager.create_heap();

    let size = 128 * 1024;
    let ptr = h.manager.allocate(heap, size);
    assert!(!ptr.is_null());
    assert_eq!(h.manager.allocation_size(heap, ptr), Some(size));
    unsafe { core::ptr::write_bytes(ptr, 0x5A, size) };

    assert!(h.manager.free(heap, ptr));
    assert!(!h.shadow.is_accessible(ptr as usize));

    // Evict; the backend reports reservations, so the address space stays
    // poisoned rather than reverting to accessible.
    h.manager.set_parameters(Parameters {
        quarantine_size: 0,
        ..Parameters::default()
    });
    assert!(!h.shadow.is_accessible(ptr as usize));
    assert!(!h.shadow.is_beginning_of_block_body(ptr as usize));
}

#[test]
fn zebra_backend_services_small_allocations_when_enabled() {
    let page = guardheap::platform::page_size();
    let params = Parameters {
        enable_zebra_block_heap: true,
        zebra_block_heap_size: 64 * 2 * page,
        ..Parameters::default()
    };
    let h = harness(params);
    let heap = h.manager.create_heap();

    let ptr = h.manager.allocate(heap, 32);
    assert!(!ptr.is_null());
    let info = h.shadow.block_info_from_shadow(ptr as usize).unwrap();
    // One page exactly: the trailer ends flush against the guard page.
    assert_eq!(info.layout.block_size, page);

    assert!(h.manager.free(heap, ptr));
    assert!(!h.manager.free(heap, ptr));
    assert_eq!(h.sink.count(HeapErrorKind::DoubleFree), 1);
}

// ---------------------------------------------------------------------------
// Sampling and filtering
// ---------------------------------------------------------------------------

#[test]
fn guard_rate_subsamples_instrumentation() {
    let params = Parameters {
        allocation_guard_rate: 0.5,
        ..Parameters::default()
    };
    let shadow = Arc::new(ShadowMap::new());
    let sink = Arc::new(CollectingSink::default());
    let manager = BlockHeapManager::new(
        shadow,
        Arc::new(NullStackCapture),
        sink.clone(),
        params,
    );
    let heap = manager.create_heap();

    let total = 10_000u64;
    let mut ptrs = Vec::with_capacity(total as usize);
    for _ in 0..total {
        let ptr = manager.allocate(heap, 16);
        assert!(!ptr.is_null());
        ptrs.push(ptr);
    }
    let stats = manager.stats();
    assert_eq!(stats.allocations_guarded + stats.allocations_passed_through, total);
    let guarded = stats.allocations_guarded as f64 / total as f64;
    assert!(
        (0.4..=0.6).contains(&guarded),
        "guard fraction {} far from 0.5",
        guarded
    );

    for ptr in ptrs {
        assert!(manager.free(heap, ptr));
    }
    assert!(sink.events().is_empty());
}

// ---------------------------------------------------------------------------
// Structural-event logging
// ---------------------------------------------------------------------------

static LOG_LINES: Mutex<Vec<String>> = Mutex::new(Vec::new());

struct CapturingLogger;

impl log::Log for CapturingLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        LOG_LINES.lock().unwrap().push(record.args().to_string());
    }

    fn flush(&self) {}
}

static CAPTURING_LOGGER: CapturingLogger = CapturingLogger;

#[test]
fn structural_events_are_logged() {
    // Other tests in this binary may log too; only presence is asserted.
    let _ = log::set_logger(&CAPTURING_LOGGER);
    log::set_max_level(log::LevelFilter::Debug);

    let h = harness(Parameters::default());
    let heap = h.manager.create_heap();
    h.manager.set_parameters(Parameters::default());
    assert!(h.manager.destroy_heap(heap));

    let lines = LOG_LINES.lock().unwrap().join("\n");
    assert!(lines.contains("created heap"), "missing create event");
    assert!(lines.contains("parameters updated"), "missing parameter event");
    assert!(lines.contains("destroyed heap"), "missing destroy event");
}

#[test]
fn allocation_filter_gates_guarding_per_thread() {
    let params = Parameters {
        enable_allocation_filter: true,
        ..Parameters::default()
    };
    let h = harness(params);
    let heap = h.manager.create_heap();

    // Flag off: raw passthrough, no block in the shadow.
    let raw = h.manager.allocate(heap, 24);
    assert!(!raw.is_null());
    assert!(!h.shadow.is_beginning_of_block_body(raw as usize));
    assert!(h.manager.free(heap, raw));

    // Flag on: guarded.
    h.manager.set_allocation_filter_flag(true);
    let guarded = h.manager.allocate(heap, 24);
    assert!(h.shadow.is_beginning_of_block_body(guarded as usize));
    assert!(h.manager.free(heap, guarded));
    h.manager.set_allocation_filter_flag(false);
}
