//! Guarded block layout and metadata.
//!
//! Every guarded allocation is a *block*: a header, an optional run of
//! header padding, the caller-visible body, trailer padding, and a trailer.
//! Header plus header padding form the left redzone; trailer padding plus
//! trailer form the right redzone. The layout is planned once, up front, by
//! the pure [`plan_layout`] function; all later metadata access goes through
//! [`BlockInfo`] accessors instead of ad hoc pointer casts.
//!
//! The header carries a magic value and a checksum over all metadata words.
//! The checksum is recomputed on every entry into quarantine and validated
//! on every exit, so corruption of either redzone's metadata is caught at
//! the next state transition.

use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::services::StackId;
use crate::util::{align_up, is_aligned};
use crate::HeapId;

/// Magic value stored in the first header word of every live block.
pub const BLOCK_HEADER_MAGIC: u32 = 0xCA80_B10C;

/// Lifecycle state of a block. `CORRUPT` is a transitional determination
/// made whenever a checksum fails, never a stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockState {
    /// Entered at allocation.
    Allocated = 0,
    /// Entered at free, when quarantine admission succeeds.
    Quarantined = 1,
    /// Terminal. Entered directly from `Allocated` when quarantine declines,
    /// or from `Quarantined` on eviction.
    Freed = 2,
}

impl BlockState {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(BlockState::Allocated),
            1 => Some(BlockState::Quarantined),
            2 => Some(BlockState::Freed),
            _ => None,
        }
    }
}

/// Block header, placed at the very start of the block. 32 bytes.
#[repr(C)]
pub struct BlockHeader {
    pub magic: u32,
    pub state: u32,
    /// Allocation-time stack reference. 0 = none.
    pub alloc_stack: StackId,
    /// Free-time stack reference. 0 = none.
    pub free_stack: StackId,
    /// Originally requested body size, unpadded.
    pub body_size: usize,
    /// Checksum over every other metadata word of header and trailer.
    pub checksum: u64,
}

/// Block trailer, placed at the very end of the block. 32 bytes.
#[repr(C)]
pub struct BlockTrailer {
    /// The heap that actually serviced the allocation. This, not the handle
    /// passed to `free`, decides which quarantine the block belongs to.
    pub heap_id: u64,
    pub alloc_tid: u64,
    pub free_tid: u64,
    pub free_ticks: u64,
}

/// Byte layout of one guarded block.
///
/// ```text
/// | header | header padding | body | trailer padding | trailer |
/// |<---- left redzone ---->|      |<----- right redzone ----->|
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    /// Alignment of the block base (and therefore of the body).
    pub block_alignment: usize,
    /// Total size of the block, padding included.
    pub block_size: usize,
    pub header_size: usize,
    pub header_padding_size: usize,
    pub body_size: usize,
    pub trailer_padding_size: usize,
    pub trailer_size: usize,
}

impl BlockLayout {
    /// Offset of the body from the block base.
    #[inline]
    pub fn body_offset(&self) -> usize {
        self.header_size + self.header_padding_size
    }

    /// Size of the left redzone (header + padding).
    #[inline]
    pub fn left_redzone_size(&self) -> usize {
        self.body_offset()
    }

    /// Size of the right redzone (trailer padding + trailer).
    #[inline]
    pub fn right_redzone_size(&self) -> usize {
        self.trailer_padding_size + self.trailer_size
    }
}

/// Plan the layout of a guarded block.
///
/// The body starts aligned to `body_alignment`; the total block size is a
/// multiple of `redzone_alignment`; the left redzone is at least
/// `min_left_redzone` bytes and the right at least `min_right_redzone`.
/// Returns `None` when the constraints cannot be met (including arithmetic
/// overflow). This is a capacity check, not an error to recover from: the
/// page-guarded backend uses it to decline requests that do not fit a page.
///
/// Pure and allocation-free; safe to call from any context.
pub fn plan_layout(
    body_alignment: usize,
    redzone_alignment: usize,
    body_size: usize,
    min_left_redzone: usize,
    min_right_redzone: usize,
) -> Option<BlockLayout> {
    if !body_alignment.is_power_of_two() || !redzone_alignment.is_power_of_two() {
        return None;
    }
    if body_alignment < core::mem::align_of::<BlockHeader>() {
        return None;
    }

    let header_size = size_of::<BlockHeader>();
    let trailer_size = size_of::<BlockTrailer>();

    // Left redzone: header, padded so the body lands on its alignment and
    // the redzone minimum is met.
    let left = align_up(header_size.max(min_left_redzone), body_alignment);
    let header_padding_size = left - header_size;

    // Right redzone: trailer plus padding covering the minimum, then the
    // whole block rounded up to the redzone alignment.
    let min_right = min_right_redzone.max(trailer_size);
    let unpadded = left
        .checked_add(body_size)?
        .checked_add(min_right)?;
    let block_size = unpadded.checked_add(redzone_alignment - 1)? & !(redzone_alignment - 1);
    let trailer_padding_size = block_size - left - body_size - trailer_size;

    Some(BlockLayout {
        block_alignment: body_alignment,
        block_size,
        header_size,
        header_padding_size,
        body_size,
        trailer_padding_size,
        trailer_size,
    })
}

/// A located block: base address plus its layout. Addresses are carried as
/// `usize` so the value is plain data (`Send`/`Sync`); dereferencing is the
/// unsafe part and is confined to the accessor methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub base: usize,
    pub layout: BlockLayout,
}

impl BlockInfo {
    pub fn new(base: usize, layout: BlockLayout) -> Self {
        debug_assert!(is_aligned(base, layout.block_alignment));
        BlockInfo { base, layout }
    }

    /// Address of the caller-visible body.
    #[inline]
    pub fn body(&self) -> usize {
        self.base + self.layout.body_offset()
    }

    /// One-past-the-end address of the body.
    #[inline]
    pub fn body_end(&self) -> usize {
        self.body() + self.layout.body_size
    }

    /// Address of the trailer.
    #[inline]
    pub fn trailer_addr(&self) -> usize {
        self.block_end() - self.layout.trailer_size
    }

    /// One-past-the-end address of the whole block.
    #[inline]
    pub fn block_end(&self) -> usize {
        self.base + self.layout.block_size
    }

    /// View the header.
    ///
    /// # Safety
    /// The block memory must be mapped, unprotected, and laid out as
    /// described by `self.layout`.
    #[inline]
    pub unsafe fn header<'a>(&self) -> &'a mut BlockHeader {
        &mut *(self.base as *mut BlockHeader)
    }

    /// View the trailer.
    ///
    /// # Safety
    /// Same requirements as [`BlockInfo::header`].
    #[inline]
    pub unsafe fn trailer<'a>(&self) -> &'a mut BlockTrailer {
        &mut *(self.trailer_addr() as *mut BlockTrailer)
    }

    /// Read the stored state, if it decodes to a known variant.
    ///
    /// # Safety
    /// Same requirements as [`BlockInfo::header`].
    #[inline]
    pub unsafe fn state(&self) -> Option<BlockState> {
        BlockState::from_raw(self.header().state)
    }
}

/// Process-wide checksum secret, drawn lazily. A forged checksum requires
/// knowing this value, which never leaves the metadata words.
fn checksum_secret() -> u64 {
    static SECRET: AtomicU64 = AtomicU64::new(0);
    let current = SECRET.load(Ordering::Relaxed);
    if current != 0 {
        return current;
    }
    let fresh = crate::platform::fast_random_u64() | 1;
    match SECRET.compare_exchange(0, fresh, Ordering::Relaxed, Ordering::Relaxed) {
        Ok(_) => fresh,
        Err(existing) => existing,
    }
}

#[inline]
fn mix(state: u64, word: u64) -> u64 {
    // Single-round multiplicative hash per word; good bit distribution for
    // accidental-corruption detection at a few cycles per word.
    let h = (state ^ word).wrapping_mul(0xbf58476d1ce4e5b9);
    h ^ (h >> 31)
}

/// Compute the checksum of a block's metadata (all header and trailer words
/// except the checksum itself, keyed by the block address and the secret).
///
/// # Safety
/// The block memory must be mapped, unprotected, and laid out as described
/// by `info.layout`.
pub unsafe fn compute_checksum(info: &BlockInfo) -> u64 {
    let header = info.header();
    let trailer = info.trailer();
    let mut h = checksum_secret() ^ (info.base as u64);
    h = mix(h, header.magic as u64);
    h = mix(h, header.state as u64);
    h = mix(h, header.body_size as u64);
    h = mix(h, ((header.alloc_stack as u64) << 32) | header.free_stack as u64);
    h = mix(h, trailer.heap_id);
    h = mix(h, trailer.alloc_tid);
    h = mix(h, trailer.free_tid);
    h = mix(h, trailer.free_ticks);
    h
}

/// Recompute and store the checksum.
///
/// # Safety
/// Same requirements as [`compute_checksum`].
pub unsafe fn seal(info: &BlockInfo) {
    let checksum = compute_checksum(info);
    info.header().checksum = checksum;
}

/// Validate magic and checksum. A `false` result is a `CORRUPT_BLOCK`
/// determination at whichever transition point called this.
///
/// # Safety
/// Same requirements as [`compute_checksum`].
pub unsafe fn verify(info: &BlockInfo) -> bool {
    let header = info.header();
    header.magic == BLOCK_HEADER_MAGIC && header.checksum == compute_checksum(info)
}

/// Initialize a freshly allocated block: write header and trailer, set
/// state `Allocated`, and seal the checksum.
///
/// # Safety
/// The block memory must be mapped, writable, and at least
/// `info.layout.block_size` bytes.
pub unsafe fn initialize(info: &BlockInfo, alloc_stack: StackId, heap_id: HeapId, tid: usize) {
    let header = info.header();
    header.magic = BLOCK_HEADER_MAGIC;
    header.state = BlockState::Allocated as u32;
    header.alloc_stack = alloc_stack;
    header.free_stack = 0;
    header.body_size = info.layout.body_size;

    let trailer = info.trailer();
    trailer.heap_id = heap_id.as_u64();
    trailer.alloc_tid = tid as u64;
    trailer.free_tid = 0;
    trailer.free_ticks = 0;

    seal(info);
}

/// Set the block state and re-seal.
///
/// # Safety
/// Same requirements as [`compute_checksum`].
pub unsafe fn set_state(info: &BlockInfo, state: BlockState) {
    info.header().state = state as u32;
    seal(info);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::MIN_ALIGN;

    #[test]
    fn layout_respects_minimum_redzones() {
        let layout = plan_layout(MIN_ALIGN, MIN_ALIGN, 100, 48, 80).unwrap();
        assert!(layout.left_redzone_size() >= 48);
        assert!(layout.right_redzone_size() >= 80);
        assert_eq!(layout.body_size, 100);
        assert_eq!(layout.block_size % MIN_ALIGN, 0);
        assert_eq!(layout.body_offset() % MIN_ALIGN, 0);
    }

    #[test]
    fn layout_accounts_for_every_byte() {
        for &size in &[0usize, 1, 15, 16, 17, 100, 4096] {
            let layout = plan_layout(MIN_ALIGN, MIN_ALIGN, size, 0, 0).unwrap();
            assert_eq!(
                layout.header_size
                    + layout.header_padding_size
                    + layout.body_size
                    + layout.trailer_padding_size
                    + layout.trailer_size,
                layout.block_size,
                "layout must be exhaustive for body size {}",
                size
            );
        }
    }

    #[test]
    fn layout_zero_body_is_valid() {
        let layout = plan_layout(MIN_ALIGN, MIN_ALIGN, 0, 0, 0).unwrap();
        assert_eq!(layout.body_size, 0);
        assert!(layout.block_size >= layout.header_size + layout.trailer_size);
    }

    #[test]
    fn layout_rejects_bad_alignment() {
        assert!(plan_layout(3, MIN_ALIGN, 16, 0, 0).is_none());
        assert!(plan_layout(MIN_ALIGN, 0, 16, 0, 0).is_none());
        // Alignment below the header's own requirement cannot hold a header.
        assert!(plan_layout(1, 1, 16, 0, 0).is_none());
    }

    #[test]
    fn layout_rejects_overflow() {
        assert!(plan_layout(MIN_ALIGN, MIN_ALIGN, usize::MAX - 8, 0, 0).is_none());
    }

    #[test]
    fn page_aligned_layout_is_page_granular() {
        let page = 4096;
        let layout = plan_layout(MIN_ALIGN, page, 128, 0, 0).unwrap();
        assert_eq!(layout.block_size % page, 0);
        assert_eq!(layout.block_size, page);
    }

    // An aligned scratch buffer standing in for backend memory.
    #[repr(align(16))]
    struct Scratch([u8; 512]);

    fn scratch_block(body_size: usize) -> (Box<Scratch>, BlockInfo) {
        let layout = plan_layout(MIN_ALIGN, MIN_ALIGN, body_size, 0, 0).unwrap();
        let buf = Box::new(Scratch([0u8; 512]));
        assert!(layout.block_size <= 512);
        let info = BlockInfo::new(buf.0.as_ptr() as usize, layout);
        (buf, info)
    }

    #[test]
    fn initialize_seal_verify_roundtrip() {
        let (_buf, info) = scratch_block(64);
        unsafe {
            initialize(&info, 7, HeapId::from_u64(42), 1234);
            assert!(verify(&info));
            assert_eq!(info.state(), Some(BlockState::Allocated));
            assert_eq!(info.header().body_size, 64);
            assert_eq!(info.trailer().heap_id, 42);
        }
    }

    #[test]
    fn state_transition_reseals_checksum() {
        let (_buf, info) = scratch_block(32);
        unsafe {
            initialize(&info, 0, HeapId::from_u64(1), 1);
            set_state(&info, BlockState::Quarantined);
            assert!(verify(&info));
            assert_eq!(info.state(), Some(BlockState::Quarantined));
        }
    }

    #[test]
    fn tampered_header_fails_verification() {
        let (_buf, info) = scratch_block(32);
        unsafe {
            initialize(&info, 0, HeapId::from_u64(1), 1);
            info.header().body_size = 9999;
            assert!(!verify(&info));
        }
    }

    #[test]
    fn tampered_trailer_fails_verification() {
        let (_buf, info) = scratch_block(32);
        unsafe {
            initialize(&info, 0, HeapId::from_u64(1), 1);
            info.trailer().heap_id = 777;
            assert!(!verify(&info));
        }
    }
}
