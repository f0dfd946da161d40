//! Shadow-memory service interface.
//!
//! The shadow service tracks per-byte accessibility of the managed address
//! space and can answer "is this address the start of a guarded block
//! body?" without touching the (possibly protected) block memory itself.

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::block::BlockInfo;

/// Why a byte is inaccessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowMarker {
    /// Part of a block's left redzone (header + padding).
    LeftRedzone,
    /// Part of a block's right redzone (trailer padding + trailer).
    RightRedzone,
    /// Freed memory held in quarantine.
    Freed,
    /// Memory reserved by a backend but not handed to any caller.
    Reserved,
}

/// The shadow-memory capability consumed by the block heap manager.
///
/// Implementations must be callable from any thread; the manager may hold
/// per-heap locks while calling in.
pub trait ShadowMemory: Send + Sync {
    /// Mark `[addr, addr + size)` inaccessible with the given marker.
    fn poison(&self, addr: usize, size: usize, marker: ShadowMarker);

    /// Mark `[addr, addr + size)` accessible.
    fn unpoison(&self, addr: usize, size: usize);

    /// Mark `[addr, addr + size)` as freed-and-quarantined.
    fn mark_as_freed(&self, addr: usize, size: usize);

    /// Whether the byte at `addr` is accessible.
    fn is_accessible(&self, addr: usize) -> bool;

    /// Record a freshly initialized block: body accessible, redzones
    /// poisoned, body address answerable by the two queries below.
    fn poison_allocated_block(&self, info: &BlockInfo);

    /// Recover the block whose body starts at `addr`, if any.
    fn block_info_from_shadow(&self, addr: usize) -> Option<BlockInfo>;

    /// Whether `addr` is the first byte of a guarded block body.
    fn is_beginning_of_block_body(&self, addr: usize) -> bool;
}

struct ShadowState {
    /// Inaccessible bytes, keyed by address. A missing key means accessible.
    poisoned: HashMap<usize, ShadowMarker>,
    /// Known blocks, keyed by body address. Entries persist across
    /// `mark_as_freed` (quarantined blocks are still blocks) and are
    /// dropped when the block range is re-poisoned or unpoisoned wholesale.
    blocks: HashMap<usize, BlockInfo>,
}

/// Reference implementation of [`ShadowMemory`]: a byte-granular marker map.
///
/// A production deployment replaces this with its real shadow bitmap; this
/// map exists so the crate is usable standalone and so the test suite can
/// observe poisoning decisions exactly. It trades memory for fidelity and
/// is not meant for multi-gigabyte workloads.
pub struct ShadowMap {
    state: RwLock<ShadowState>,
}

impl Default for ShadowMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowMap {
    pub fn new() -> Self {
        ShadowMap {
            state: RwLock::new(ShadowState {
                poisoned: HashMap::new(),
                blocks: HashMap::new(),
            }),
        }
    }

    /// Count of currently poisoned bytes. Test/diagnostic aid.
    pub fn poisoned_bytes(&self) -> usize {
        self.state.read().poisoned.len()
    }

    fn forget_blocks_in_range(state: &mut ShadowState, addr: usize, size: usize) {
        let end = addr.saturating_add(size);
        let stale: Vec<usize> = state
            .blocks
            .iter()
            .filter(|(_, info)| info.base >= addr && info.base < end)
            .map(|(body, _)| *body)
            .collect();
        for body in stale {
            state.blocks.remove(&body);
        }
    }
}

impl ShadowMemory for ShadowMap {
    fn poison(&self, addr: usize, size: usize, marker: ShadowMarker) {
        let mut state = self.state.write();
        Self::forget_blocks_in_range(&mut state, addr, size);
        for byte in addr..addr.saturating_add(size) {
            state.poisoned.insert(byte, marker);
        }
    }

    fn unpoison(&self, addr: usize, size: usize) {
        let mut state = self.state.write();
        Self::forget_blocks_in_range(&mut state, addr, size);
        for byte in addr..addr.saturating_add(size) {
            state.poisoned.remove(&byte);
        }
    }

    fn mark_as_freed(&self, addr: usize, size: usize) {
        let mut state = self.state.write();
        // Block identity survives: a quarantined block must still answer
        // `is_beginning_of_block_body` so a second free is diagnosable.
        for byte in addr..addr.saturating_add(size) {
            state.poisoned.insert(byte, ShadowMarker::Freed);
        }
    }

    fn is_accessible(&self, addr: usize) -> bool {
        !self.state.read().poisoned.contains_key(&addr)
    }

    fn poison_allocated_block(&self, info: &BlockInfo) {
        let mut state = self.state.write();
        Self::forget_blocks_in_range(&mut state, info.base, info.layout.block_size);

        let body = info.body();
        for byte in info.base..body {
            state.poisoned.insert(byte, ShadowMarker::LeftRedzone);
        }
        for byte in body..info.body_end() {
            state.poisoned.remove(&byte);
        }
        for byte in info.body_end()..info.block_end() {
            state.poisoned.insert(byte, ShadowMarker::RightRedzone);
        }

        state.blocks.insert(body, *info);
    }

    fn block_info_from_shadow(&self, addr: usize) -> Option<BlockInfo> {
        self.state.read().blocks.get(&addr).copied()
    }

    fn is_beginning_of_block_body(&self, addr: usize) -> bool {
        self.state.read().blocks.contains_key(&addr)
    }
}
