//! Quarantine: a bounded holding area for freed-but-not-yet-reclaimed
//! blocks, delaying address reuse so use-after-free is observable.
//!
//! The quarantine holds plain [`BlockInfo`] values — enough to rebuild the
//! exact layout during eviction without trusting the (possibly corrupted)
//! header contents.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::block::BlockInfo;

/// The quarantine capability shared by heaps. Both limits are soft and
/// live-tunable; lowering either below current occupancy forces eviction at
/// the next [`BlockQuarantine::trim`].
pub trait BlockQuarantine: Send + Sync {
    /// Attempt admission. Returns `false` when quarantining is disabled or
    /// the object exceeds the per-object cap; the caller must then reclaim
    /// the block immediately.
    fn push(&self, block: BlockInfo) -> bool;

    /// Remove the oldest admitted block from some shard.
    fn pop(&self) -> Option<BlockInfo>;

    /// Remove every held block.
    fn drain(&self) -> Vec<BlockInfo>;

    /// Number of held blocks.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate occupancy in bytes.
    fn bytes(&self) -> usize;

    fn max_bytes(&self) -> usize;

    fn set_max_bytes(&self, max: usize);

    fn set_max_block_size(&self, max: usize);

    /// Evict until occupancy is at or under the byte cap; a cap of zero
    /// evicts everything. Returns the evicted blocks for the caller to
    /// reclaim — the quarantine itself never frees memory.
    fn trim(&self) -> Vec<BlockInfo>;
}

/// Shard count. A power of two so the address hash reduces with a mask.
const NUM_SHARDS: usize = 16;

/// splitmix64 finalizer, for distributing block addresses across shards.
#[inline]
fn hash_addr(addr: usize) -> usize {
    let mut x = addr as u64;
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x as usize
}

/// Sharded FIFO quarantine.
///
/// Blocks are distributed across independently locked shards keyed by a
/// hash of the block address, so concurrent frees on different addresses
/// rarely contend. FIFO (oldest-admitted-first) eviction is guaranteed
/// *within* a shard only; global ordering across shards is intentionally
/// unspecified.
pub struct ShardedQuarantine {
    shards: [Mutex<VecDeque<BlockInfo>>; NUM_SHARDS],
    total_bytes: AtomicUsize,
    max_bytes: AtomicUsize,
    max_block_size: AtomicUsize,
    /// Rotates the shard where `pop` starts scanning, so eviction pressure
    /// spreads instead of draining shard 0 first.
    next_pop: AtomicUsize,
}

impl ShardedQuarantine {
    pub fn new(max_bytes: usize, max_block_size: usize) -> Self {
        ShardedQuarantine {
            shards: [const { Mutex::new(VecDeque::new()) }; NUM_SHARDS],
            total_bytes: AtomicUsize::new(0),
            max_bytes: AtomicUsize::new(max_bytes),
            max_block_size: AtomicUsize::new(max_block_size),
            next_pop: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn shard_for(&self, block: &BlockInfo) -> &Mutex<VecDeque<BlockInfo>> {
        &self.shards[hash_addr(block.base) & (NUM_SHARDS - 1)]
    }
}

impl BlockQuarantine for ShardedQuarantine {
    fn push(&self, block: BlockInfo) -> bool {
        let size = block.layout.block_size;
        if self.max_bytes.load(Ordering::Relaxed) == 0 {
            return false;
        }
        if size > self.max_block_size.load(Ordering::Relaxed) {
            return false;
        }
        self.shard_for(&block).lock().push_back(block);
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        true
    }

    fn pop(&self) -> Option<BlockInfo> {
        let start = self.next_pop.fetch_add(1, Ordering::Relaxed);
        for i in 0..NUM_SHARDS {
            let shard = &self.shards[(start + i) & (NUM_SHARDS - 1)];
            if let Some(block) = shard.lock().pop_front() {
                self.total_bytes
                    .fetch_sub(block.layout.block_size, Ordering::Relaxed);
                return Some(block);
            }
        }
        None
    }

    fn drain(&self) -> Vec<BlockInfo> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut queue = shard.lock();
            for block in queue.drain(..) {
                self.total_bytes
                    .fetch_sub(block.layout.block_size, Ordering::Relaxed);
                out.push(block);
            }
        }
        out
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    fn bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    fn max_bytes(&self) -> usize {
        self.max_bytes.load(Ordering::Relaxed)
    }

    fn set_max_bytes(&self, max: usize) {
        self.max_bytes.store(max, Ordering::Relaxed);
    }

    fn set_max_block_size(&self, max: usize) {
        self.max_block_size.store(max, Ordering::Relaxed);
    }

    fn trim(&self) -> Vec<BlockInfo> {
        let cap = self.max_bytes.load(Ordering::Relaxed);
        if cap == 0 {
            return self.drain();
        }
        let mut out = Vec::new();
        while self.bytes() > cap {
            match self.pop() {
                Some(block) => out.push(block),
                None => break,
            }
        }
        out
    }
}
