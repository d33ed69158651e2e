//! Bump allocator carved from an arena block (spec §3 "Bump", §4.2).

use super::arena::Arena;
use super::block::BlockRef;

/// A bump allocator: O(1) allocation by advancing an offset within a block
/// carved from a parent [`Arena`]. Individual frees are no-ops; the whole
/// region is reclaimed on [`Bump::reset`] or by freeing the backing block.
pub struct Bump {
    block: BlockRef,
    capacity: u32,
    offset: u32,
}

impl Bump {
    /// Carve a `size`-byte block from `arena` and turn it into a bump
    /// allocator.
    pub fn create(arena: &mut Arena, size: u32) -> Option<Self> {
        let block = arena.alloc(size)?;
        Some(Bump {
            block,
            capacity: size,
            offset: 0,
        })
    }

    /// Allocate `size` bytes at the arena's baseline alignment from this
    /// bump region.
    pub fn alloc(&mut self, size: u32) -> Option<u32> {
        self.alloc_aligned(size, 1)
    }

    /// Allocate `size` bytes aligned to `align` (relative to the bump's own
    /// start, which already carries the arena's baseline alignment).
    pub fn alloc_aligned(&mut self, size: u32, align: u32) -> Option<u32> {
        let align = align.max(1);
        let aligned = (self.offset + align - 1) & !(align - 1);
        let end = aligned.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.offset = end;
        Some(self.block.data_offset() + aligned)
    }

    /// Rewind the bump pointer to the start, reclaiming all prior
    /// allocations at once.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Bytes allocated so far.
    pub fn used(&self) -> u32 {
        self.offset
    }

    /// Return the unused suffix of the bump's block to the parent arena by
    /// shrinking the block's recorded size. The freed suffix becomes
    /// reusable by the arena the next time something is freed adjacent to
    /// it; until then it is simply unaddressed slack.
    pub fn trim(&mut self, arena: &mut Arena) {
        let buf = arena.buffer_mut();
        let new_size = self.offset;
        self.block.set_size(buf, new_size);
        self.capacity = new_size;
    }

    /// Destroy the bump, freeing its backing block back to `arena`.
    pub fn destroy(self, arena: &mut Arena) {
        arena.free(self.block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_allocations_advance_offset() {
        let mut arena = Arena::new(4096);
        let mut bump = Bump::create(&mut arena, 256).unwrap();
        let a = bump.alloc(32).unwrap();
        let b = bump.alloc(32).unwrap();
        assert_eq!(b, a + 32);
        assert_eq!(bump.used(), 64);
    }

    #[test]
    fn overflow_returns_none() {
        let mut arena = Arena::new(4096);
        let mut bump = Bump::create(&mut arena, 64).unwrap();
        assert!(bump.alloc(32).is_some());
        assert!(bump.alloc(64).is_none());
    }

    #[test]
    fn reset_allows_reuse_of_full_capacity() {
        let mut arena = Arena::new(4096);
        let mut bump = Bump::create(&mut arena, 64).unwrap();
        bump.alloc(64).unwrap();
        assert!(bump.alloc(1).is_none());
        bump.reset();
        assert!(bump.alloc(64).is_some());
    }

    #[test]
    fn alignment_within_bump_is_honoured() {
        let mut arena = Arena::new(4096);
        let mut bump = Bump::create(&mut arena, 256).unwrap();
        let _ = bump.alloc(3).unwrap();
        let aligned = bump.alloc_aligned(16, 16).unwrap();
        assert_eq!(aligned % 16, 0);
    }
}
