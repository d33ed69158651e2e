//! The arena itself (spec §3 "Arena", §4.2).
//!
//! An arena owns one fixed-capacity buffer carved bottom-up into blocks
//! (the "tail" grows as allocations consume virgin capacity) with an
//! optional top-down scratch region at the far end (spec §3 "Scratch
//! region"). Freed blocks are indexed by [`FreeTree`] and reused by
//! best-fit before the tail is touched.

use parking_lot::Mutex;
use std::sync::Arc;

use super::block::{BlockRef, HEADER_SIZE, NO_PREV};
use super::tree::FreeTree;

/// Platform word size, the allocator's baseline granularity.
pub const WORD_SIZE: u32 = std::mem::size_of::<usize>() as u32;

/// Default data alignment new arenas use unless told otherwise.
pub const DEFAULT_ALIGNMENT: u32 = 16;

/// Largest alignment an arena can satisfy: `256 * WORD_SIZE`.
pub const MAX_ALIGNMENT: u32 = 256 * WORD_SIZE;

/// Poison byte the arena tier writes over freed payloads. Deliberately
/// distinct from the canary tier's `0xDE` (see `original_source`'s
/// `easy_memory.h` default vs. `lunet_mem.h`'s): the two tiers are freed
/// through different code paths and a stray pointer crossing tiers should
/// show a different fingerprint in a hex dump.
pub const ARENA_POISON_BYTE: u8 = 0xDD;

const XOR_MAGIC: u64 = 0xDEAD_BEEF_DEAD_BEEF;

/// Running counters for one arena, reported at shutdown (spec ambient
/// diagnostics, grounded on `lunet_easy_memory.c`'s `lunet_em_summary`).
#[derive(Debug, Default, Clone, Copy)]
pub struct ArenaStats {
    pub alloc_count: u64,
    pub free_count: u64,
    pub alloc_bytes: u64,
    pub free_bytes: u64,
    pub current_bytes: i64,
    pub peak_bytes: i64,
    pub wasted_bytes: u64,
}

/// A memory arena: one contiguous backing buffer plus its block index.
pub struct Arena {
    buffer: Vec<u8>,
    capacity: u32,
    base_align: u32,
    tail_cursor: u32,
    scratch_floor: u32,
    scratch_block: Option<BlockRef>,
    free: FreeTree,
    poisoning: bool,
    stats: ArenaStats,
    /// Offset of the most recently tail-carved block, i.e. the physically
    /// last block in the arena regardless of its current free/occupied
    /// state. Used to stamp new tail blocks' `prev` field so backward
    /// coalescing on free can find them; `None` before the first block.
    last_tail_block: Option<u32>,
}

fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

impl Arena {
    /// Create a new arena of `size` bytes with the default alignment.
    pub fn new(size: u32) -> Self {
        Self::with_alignment(size, DEFAULT_ALIGNMENT)
    }

    /// Create a new arena with an explicit baseline alignment.
    ///
    /// `alignment` must be a power of two in `[WORD_SIZE, MAX_ALIGNMENT]`.
    pub fn with_alignment(size: u32, alignment: u32) -> Self {
        assert!(alignment.is_power_of_two());
        assert!(alignment >= WORD_SIZE && alignment <= MAX_ALIGNMENT);
        let capacity = size.max(HEADER_SIZE as u32 + alignment);
        Arena {
            buffer: vec![0u8; capacity as usize],
            capacity,
            base_align: alignment,
            tail_cursor: 0,
            scratch_floor: capacity,
            scratch_block: None,
            free: FreeTree::new(),
            poisoning: true,
            stats: ArenaStats::default(),
            last_tail_block: None,
        }
    }

    /// Disable poison-on-free, e.g. for hot paths in a release profile.
    pub fn set_poisoning(&mut self, enabled: bool) {
        self.poisoning = enabled;
    }

    pub fn stats(&self) -> ArenaStats {
        self.stats
    }

    fn record_alloc(&mut self, size: u32) {
        self.stats.alloc_count += 1;
        self.stats.alloc_bytes += size as u64;
        self.stats.current_bytes += size as i64;
        if self.stats.current_bytes > self.stats.peak_bytes {
            self.stats.peak_bytes = self.stats.current_bytes;
        }
    }

    fn record_free(&mut self, size: u32) {
        self.stats.free_count += 1;
        self.stats.free_bytes += size as u64;
        self.stats.current_bytes -= size as i64;
    }

    /// Allocate `size` bytes at the arena's baseline alignment.
    pub fn alloc(&mut self, size: u32) -> Option<BlockRef> {
        self.alloc_aligned(size, self.base_align)
    }

    /// Allocate `size` bytes at an explicit alignment.
    ///
    /// Reuse from the free list only ever happens at the baseline
    /// alignment (every carved block's data pointer already satisfies it,
    /// so no padding is ever needed there); requests above the baseline
    /// always carve fresh from the tail, matching spec §4.2's tail
    /// sub-cases. This trades reuse of freed over-aligned blocks for a
    /// much simpler, branch-free common path; documented in `DESIGN.md`.
    pub fn alloc_aligned(&mut self, size: u32, align: u32) -> Option<BlockRef> {
        assert!(align.is_power_of_two());
        if align <= self.base_align {
            if let Some(block) = self.free.find_best_fit(size, self.base_align, &self.buffer) {
                self.free.remove(block, &self.buffer);
                block.set_is_free(&mut self.buffer, false);
                self.finish_occupied(block, size);
                return Some(block);
            }
        }
        self.tail_alloc(size, align)
    }

    fn finish_occupied(&mut self, block: BlockRef, size: u32) {
        let old_size = block.size(&self.buffer);
        block.set_size(&mut self.buffer, size);
        let data = block.data_offset() as u64;
        block.set_magic(&mut self.buffer, XOR_MAGIC ^ data);
        block.set_black(&mut self.buffer, false);
        self.record_alloc(size);
        // any leftover from a larger free block is simply absorbed; a
        // future improvement could split it back out, see DESIGN.md.
        let _ = old_size;
    }

    fn tail_alloc(&mut self, size: u32, align: u32) -> Option<BlockRef> {
        let required_align = align.max(self.base_align);
        let naive_header = self.tail_cursor;
        let naive_data = naive_header + HEADER_SIZE as u32;
        let aligned_data = align_up(naive_data, required_align);
        let header_start = aligned_data - HEADER_SIZE as u32;
        let gap = header_start - naive_header;

        let end = header_start
            .checked_add(HEADER_SIZE as u32)?
            .checked_add(size)?;
        if end > self.scratch_floor {
            return None;
        }

        if gap > 0 {
            self.stats.wasted_bytes += gap as u64;
        }

        // A gap (inserted only to satisfy an over-baseline alignment
        // request) breaks physical contiguity with whatever came before,
        // so such a block gets no `prev` and is never considered for
        // backward coalescing.
        let prev = if gap == 0 {
            self.last_tail_block.map(u64::from).unwrap_or(NO_PREV)
        } else {
            NO_PREV
        };

        let block = BlockRef(header_start);
        block.set_prev(&mut self.buffer, prev);
        block.set_is_free(&mut self.buffer, false);
        block.set_black(&mut self.buffer, false);
        block.set_size(&mut self.buffer, size);
        let data = block.data_offset() as u64;
        block.set_magic(&mut self.buffer, XOR_MAGIC ^ data);

        self.tail_cursor = end;
        self.last_tail_block = Some(header_start);
        self.record_alloc(size);
        Some(block)
    }

    /// Free a block previously returned by [`Arena::alloc`] or
    /// [`Arena::alloc_aligned`].
    pub fn free(&mut self, block: BlockRef) {
        let data = block.data_offset() as u64;
        let expected = XOR_MAGIC ^ data;
        if block.magic(&self.buffer) != expected {
            tracing::error!("arena free: magic mismatch, corruption or double free");
            return;
        }
        let size = block.size(&self.buffer);
        self.record_free(size);
        if self.poisoning {
            let start = block.data_offset() as usize;
            for byte in &mut self.buffer[start..start + size as usize] {
                *byte = ARENA_POISON_BYTE;
            }
        }
        block.set_is_free(&mut self.buffer, true);
        block.set_magic(&mut self.buffer, 0);
        self.coalesce_and_index(block);
    }

    fn coalesce_and_index(&mut self, mut block: BlockRef) {
        // merge with physically-next free block
        let next_offset = block.next_offset(&self.buffer);
        if next_offset < self.tail_cursor {
            let next = BlockRef(next_offset);
            if next.is_free(&self.buffer) {
                self.free.remove(next, &self.buffer);
                let merged = block.size(&self.buffer) + HEADER_SIZE as u32 + next.size(&self.buffer);
                block.set_size(&mut self.buffer, merged);
            }
        } else if next_offset == self.tail_cursor {
            // this block now abuts virgin tail capacity: shrink the tail
            // instead of indexing it as a free block, and restore
            // last_tail_block to whatever physically preceded it so the
            // next tail allocation chains its `prev` correctly.
            self.tail_cursor = block.0;
            let prev_off = block.prev(&self.buffer);
            self.last_tail_block = if prev_off == NO_PREV {
                None
            } else {
                Some(prev_off as u32)
            };
            return;
        }

        // merge with physically-previous free block, if tracked
        let prev_off = block.prev(&self.buffer);
        if prev_off != NO_PREV {
            let prev = BlockRef(prev_off as u32);
            if prev.is_free(&self.buffer) && prev.next_offset(&self.buffer) == block.0 {
                self.free.remove(prev, &self.buffer);
                let merged = prev.size(&self.buffer) + HEADER_SIZE as u32 + block.size(&self.buffer);
                prev.set_size(&mut self.buffer, merged);
                block = prev;
            }
        }

        self.free.insert(block, &self.buffer);
    }

    /// Place `size` bytes at the top of the arena, bypassing the free list
    /// and the tail. At most one scratch allocation may be outstanding.
    pub fn alloc_scratch(&mut self, size: u32) -> Option<BlockRef> {
        self.alloc_scratch_aligned(size, self.base_align)
    }

    pub fn alloc_scratch_aligned(&mut self, size: u32, align: u32) -> Option<BlockRef> {
        if self.scratch_block.is_some() {
            return None;
        }
        let required_align = align.max(self.base_align);
        let data_end = self.scratch_floor;
        let data_start_unaligned = data_end.checked_sub(size)?;
        let data_start = data_start_unaligned & !(required_align - 1);
        let header_start = data_start.checked_sub(HEADER_SIZE as u32)?;
        if header_start < self.tail_cursor {
            return None;
        }
        let block = BlockRef(header_start);
        block.set_prev(&mut self.buffer, NO_PREV);
        block.set_is_free(&mut self.buffer, false);
        block.set_black(&mut self.buffer, true); // occupied + black == scratch
        block.set_size(&mut self.buffer, size);
        let data = block.data_offset() as u64;
        block.set_magic(&mut self.buffer, XOR_MAGIC ^ data);

        self.scratch_floor = header_start;
        self.scratch_block = Some(block);
        self.record_alloc(size);
        Some(block)
    }

    /// Destroy the single outstanding scratch allocation, returning the
    /// region to unused top-of-arena capacity.
    pub fn free_scratch(&mut self, block: BlockRef) {
        if self.scratch_block != Some(block) {
            tracing::error!("arena free_scratch: not the outstanding scratch block");
            return;
        }
        let size = block.size(&self.buffer);
        self.record_free(size);
        self.scratch_floor = block.0 + HEADER_SIZE as u32 + size;
        self.scratch_block = None;
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_free_list_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Borrow the backing buffer, used by the canary tier to read/write
    /// user payloads directly by offset.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

/// A nested arena: backing memory carved from a parent arena's own block
/// index, returned to the parent on [`NestedArena::destroy`].
///
/// The original resolves a nested arena's parent by walking physical
/// `prev` pointers at destroy time. This port stores the parent handle and
/// the carved block directly instead (spec §9's "mark pointers as
/// borrowed/owning" guidance) since lunet already threads an explicit
/// `Arc` handle rather than raw pointers throughout.
pub struct NestedArena {
    pub arena: Arena,
    parent: Arc<Mutex<Arena>>,
    parent_block: BlockRef,
}

impl NestedArena {
    pub fn create(parent: &Arc<Mutex<Arena>>, size: u32) -> Option<Self> {
        Self::create_aligned(parent, size, DEFAULT_ALIGNMENT)
    }

    pub fn create_aligned(parent: &Arc<Mutex<Arena>>, size: u32, align: u32) -> Option<Self> {
        let mut guard = parent.lock();
        let parent_block = guard.alloc_aligned(size, align)?;
        let carved_size = parent_block.size(guard.buffer());
        drop(guard);
        // A fully zero-copy nested arena would alias the parent's backing
        // buffer directly; that needs unsafe slice-splitting this port
        // deliberately avoids (see DESIGN.md). Instead the nested arena
        // gets its own buffer sized identically to the carved block, and
        // destroy() still returns that block to the parent, preserving
        // the externally observable capacity accounting.
        let arena = Arena::with_alignment(carved_size, align);
        Some(NestedArena {
            arena,
            parent: Arc::clone(parent),
            parent_block,
        })
    }

    /// Return the carved block to the parent arena.
    pub fn destroy(self) {
        self.parent.lock().free(self.parent_block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_then_alloc_reuses_block() {
        let mut arena = Arena::new(4096);
        let a = arena.alloc(512).unwrap();
        arena.free(a);
        let b = arena.alloc(200).unwrap();
        assert_eq!(a, b, "freed block should be reused by best fit");
    }

    #[test]
    fn best_fit_example_from_spec() {
        // A=512, B=256, C=512; free B; alloc D=200 -> D lands in B's slot.
        let mut arena = Arena::new(4096);
        let _a = arena.alloc(512).unwrap();
        let b = arena.alloc(256).unwrap();
        let _c = arena.alloc(512).unwrap();
        arena.free(b);
        let d = arena.alloc(200).unwrap();
        assert_eq!(d, b);
        assert_eq!(d.size(arena.buffer()), 200);
    }

    #[test]
    fn adjacent_free_blocks_coalesce() {
        let mut arena = Arena::new(4096);
        let a = arena.alloc(64).unwrap();
        let b = arena.alloc(64).unwrap();
        arena.free(a);
        arena.free(b);
        // both blocks abutted virgin tail capacity in turn, so the tail
        // cursor should have rewound all the way back to zero.
        let c = arena.alloc(4096 - HEADER_SIZE as u32 - 64).unwrap();
        assert_eq!(c.0, 0);
    }

    #[test]
    fn backward_coalesce_merges_with_free_predecessor() {
        let mut arena = Arena::new(4096);
        let a = arena.alloc(64).unwrap();
        let b = arena.alloc(64).unwrap();
        let _c = arena.alloc(64).unwrap(); // keeps b's successor occupied
        arena.free(a);
        arena.free(b);
        // a and b should now be one coalesced free block spanning both,
        // large enough to satisfy a request that neither alone could.
        let merged_payload = 64 + HEADER_SIZE as u32 + 64;
        let reused = arena.alloc(merged_payload).unwrap();
        assert_eq!(reused, a);
    }

    #[test]
    fn magic_detects_double_free() {
        let mut arena = Arena::new(1024);
        let a = arena.alloc(32).unwrap();
        arena.free(a);
        let before = arena.stats().free_count;
        arena.free(a); // double free: magic was zeroed, must be rejected
        assert_eq!(arena.stats().free_count, before);
    }

    #[test]
    fn scratch_allocation_sits_above_tail_and_is_exclusive() {
        let mut arena = Arena::new(4096);
        let _tail = arena.alloc(64).unwrap();
        let s1 = arena.alloc_scratch(128).unwrap();
        assert!(s1.0 > arena.tail_cursor);
        assert!(arena.alloc_scratch(64).is_none(), "only one scratch at a time");
        arena.free_scratch(s1);
        assert!(arena.alloc_scratch(64).is_some());
    }

    #[test]
    fn scratch_block_is_occupied_and_black() {
        let mut arena = Arena::new(4096);
        let s = arena.alloc_scratch(64).unwrap();
        assert!(s.is_scratch(arena.buffer()));
    }

    #[test]
    fn nested_arena_returns_memory_to_parent_on_destroy() {
        let parent = Arc::new(Mutex::new(Arena::new(8192)));
        let nested = NestedArena::create(&parent, 1024).unwrap();
        assert!(parent.lock().is_free_list_empty());
        nested.destroy();
        // after destroy, the parent's tail should have rewound since the
        // nested block abutted the tail.
        let reused = parent.lock().alloc(1024 - HEADER_SIZE as u32).unwrap();
        assert_eq!(reused.0, 0);
    }

    #[test]
    fn out_of_capacity_returns_none() {
        let mut arena = Arena::new(128);
        assert!(arena.alloc(1024).is_none());
    }

    #[test]
    fn elevated_alignment_is_honoured() {
        let mut arena = Arena::new(8192);
        let _ = arena.alloc(3).unwrap(); // misalign the tail cursor
        let block = arena.alloc_aligned(64, 128).unwrap();
        assert_eq!(block.data_offset() % 128, 0);
    }
}
