//! Canary-header allocator tier (spec §4.1).
//!
//! Every live allocation carries a leading header stamping a fixed magic
//! word and the requested payload size. `free` (and, for the arena backend,
//! every coalesce) re-checks the magic before touching the block, turning a
//! double-free or an off-by-one overflow into an immediate
//! [`LunetError::InvariantViolation`] instead of silent corruption. The tier
//! is backend-agnostic: it sits either directly on the system allocator or
//! on top of an [`Arena`], so callers can swap the backing store per
//! subsystem without touching call sites.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex as StdMutex};

use parking_lot::Mutex as ArenaMutex;

use lunet_sdk::LunetError;

use super::arena::Arena;

/// Magic word stamped into every canary header ("LUNE" in ASCII bytes,
/// little-endian).
pub const CANARY: u32 = 0x4C55_4E45;

/// Byte written over freed payloads when poisoning is enabled, distinct
/// from the arena tier's own [`super::arena::ARENA_POISON_BYTE`] so a
/// crash dump can tell which tier released the memory.
pub const POISON_BYTE: u8 = 0xDE;

const HEADER_SIZE: usize = 8;

/// Where a [`CanaryAllocator`] gets its raw memory from.
pub enum Backend {
    /// Delegate straight to the process system allocator.
    System,
    /// Carve allocations out of a shared arena.
    Arena(Arc<ArenaMutex<Arena>>),
}

/// A single allocation made through a [`CanaryAllocator`].
///
/// Holds everything needed to validate and eventually free itself; callers
/// do not work with raw pointers directly.
pub enum CanaryBlock {
    System {
        ptr: NonNull<u8>,
        layout: Layout,
        size: usize,
    },
    Arena {
        arena: Arc<ArenaMutex<Arena>>,
        block: super::arena::BlockRef,
        size: usize,
    },
}

// SAFETY: `CanaryBlock::System` owns its allocation exclusively and is never
// aliased; `Arena` already requires `Send + Sync` of its contents via the
// `Mutex`.
unsafe impl Send for CanaryBlock {}

impl CanaryBlock {
    /// Requested payload size in bytes (excludes the header).
    pub fn len(&self) -> usize {
        match self {
            CanaryBlock::System { size, .. } => *size,
            CanaryBlock::Arena { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_header(&self) -> (u32, u32) {
        match self {
            CanaryBlock::System { ptr, .. } => {
                // SAFETY: `ptr` points at `HEADER_SIZE + size` live bytes we
                // allocated ourselves.
                let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), HEADER_SIZE) };
                (
                    u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
                    u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
                )
            }
            CanaryBlock::Arena { arena, block, .. } => {
                let guard = arena.lock();
                let off = block.data_offset() as usize;
                let buf = guard.buffer();
                let bytes = &buf[off..off + HEADER_SIZE];
                (
                    u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
                    u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
                )
            }
        }
    }

    /// `true` if the leading magic word still reads [`CANARY`].
    pub fn canary_ok(&self) -> bool {
        self.read_header().0 == CANARY
    }

    /// Overwrite the header (magic word and size) with the poison byte,
    /// alongside the payload poisoning `free` already does — without this,
    /// a double-free's canary would just read stale live data instead of
    /// the poison pattern `free` is supposed to leave behind.
    fn poison_header(&mut self) {
        match self {
            CanaryBlock::System { ptr, .. } => {
                // SAFETY: `ptr` still points at the `HEADER_SIZE`-byte
                // header of our own allocation; this runs before `dealloc`.
                let header =
                    unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), HEADER_SIZE) };
                header.fill(POISON_BYTE);
            }
            CanaryBlock::Arena { arena, block, .. } => {
                let mut guard = arena.lock();
                let off = block.data_offset() as usize;
                guard.buffer_mut()[off..off + HEADER_SIZE].fill(POISON_BYTE);
            }
        }
    }

    /// Run `f` over the payload for reading.
    pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            CanaryBlock::System { ptr, size, .. } => {
                // SAFETY: payload starts `HEADER_SIZE` bytes into the
                // allocation and extends for `size` bytes, both within the
                // original `Layout`.
                let slice = unsafe {
                    std::slice::from_raw_parts(ptr.as_ptr().add(HEADER_SIZE), *size)
                };
                f(slice)
            }
            CanaryBlock::Arena { arena, block, size } => {
                let guard = arena.lock();
                let off = block.data_offset() as usize + HEADER_SIZE;
                f(&guard.buffer()[off..off + size])
            }
        }
    }

    /// Run `f` over the payload for writing.
    pub fn with_payload_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match self {
            CanaryBlock::System { ptr, size, .. } => {
                // SAFETY: see `with_payload`; unique access follows from
                // `&mut self`.
                let slice = unsafe {
                    std::slice::from_raw_parts_mut(ptr.as_ptr().add(HEADER_SIZE), *size)
                };
                f(slice)
            }
            CanaryBlock::Arena { arena, block, size } => {
                let mut guard = arena.lock();
                let off = block.data_offset() as usize + HEADER_SIZE;
                let sz = *size;
                f(&mut guard.buffer_mut()[off..off + sz])
            }
        }
    }
}

/// Running counters mirroring the original's coarse allocator telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocStats {
    pub alloc_count: u64,
    pub free_count: u64,
    pub live_bytes: u64,
    pub peak_bytes: u64,
}

/// Canary-header allocator sitting in front of either the system allocator
/// or an [`Arena`].
pub struct CanaryAllocator {
    backend: Backend,
    poisoning: bool,
    stats: StdMutex<AllocStats>,
}

impl CanaryAllocator {
    pub fn new(backend: Backend) -> Self {
        CanaryAllocator {
            backend,
            poisoning: true,
            stats: StdMutex::new(AllocStats::default()),
        }
    }

    pub fn set_poisoning(&mut self, enabled: bool) {
        self.poisoning = enabled;
    }

    pub fn stats(&self) -> AllocStats {
        *self.stats.lock().unwrap()
    }

    /// `Ok(())` only if every allocation made through this allocator has
    /// been freed (spec §8 "Allocator balance").
    pub fn assert_balanced(&self) -> Result<(), LunetError> {
        let stats = self.stats();
        if stats.alloc_count == stats.free_count {
            Ok(())
        } else {
            Err(LunetError::InvariantViolation(format!(
                "allocator imbalance: {} allocs vs {} frees",
                stats.alloc_count, stats.free_count
            )))
        }
    }

    fn write_header(&self, header_bytes: &mut [u8], size: u32) {
        header_bytes[0..4].copy_from_slice(&CANARY.to_le_bytes());
        header_bytes[4..8].copy_from_slice(&size.to_le_bytes());
    }

    pub fn alloc(&self, size: usize) -> Result<CanaryBlock, LunetError> {
        let size_u32 = u32::try_from(size)
            .map_err(|_| LunetError::ArgumentError("allocation size exceeds u32".into()))?;
        let total = HEADER_SIZE
            .checked_add(size)
            .ok_or_else(|| LunetError::ArgumentError("allocation size overflow".into()))?;

        let block = match &self.backend {
            Backend::System => {
                let layout = Layout::array::<u8>(total)
                    .map_err(|e| LunetError::ArgumentError(e.to_string()))?;
                // SAFETY: `layout` has non-zero size whenever `total > 0`;
                // for `total == 0` `alloc` is permitted to return any
                // non-null pointer, which `NonNull::new` still accepts.
                let raw = unsafe { alloc::alloc(layout) };
                let ptr = NonNull::new(raw)
                    .ok_or_else(|| LunetError::ResourceError("system allocator exhausted".into()))?;
                // SAFETY: `raw` is a fresh allocation of exactly `total`
                // bytes.
                let header = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), HEADER_SIZE) };
                self.write_header(header, size_u32);
                CanaryBlock::System { ptr, layout, size }
            }
            Backend::Arena(arena) => {
                let mut guard = arena.lock();
                let total_u32 = u32::try_from(total)
                    .map_err(|_| LunetError::ArgumentError("allocation size overflow".into()))?;
                let block = guard
                    .alloc(total_u32)
                    .ok_or_else(|| LunetError::ResourceError("arena exhausted".into()))?;
                let off = block.data_offset() as usize;
                let buf = guard.buffer_mut();
                self.write_header(&mut buf[off..off + HEADER_SIZE], size_u32);
                drop(guard);
                CanaryBlock::Arena {
                    arena: Arc::clone(arena),
                    block,
                    size,
                }
            }
        };

        let mut stats = self.stats.lock().unwrap();
        stats.alloc_count += 1;
        stats.live_bytes += size as u64;
        stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);
        Ok(block)
    }

    /// Zero-initialised allocation of `count * size` bytes, rejecting the
    /// multiplication overflow the spec requires (stricter than the literal
    /// original, which trusted the caller).
    pub fn calloc(&self, count: usize, size: usize) -> Result<CanaryBlock, LunetError> {
        let total = count
            .checked_mul(size)
            .ok_or_else(|| LunetError::ArgumentError("calloc(count, size) overflow".into()))?;
        let mut block = self.alloc(total)?;
        block.with_payload_mut(|bytes| bytes.fill(0));
        Ok(block)
    }

    /// Resize an allocation, preserving the leading `min(old, new)` bytes.
    pub fn realloc(&self, block: CanaryBlock, new_size: usize) -> Result<CanaryBlock, LunetError> {
        if !block.canary_ok() {
            return Err(LunetError::InvariantViolation(
                "canary corrupted before realloc".into(),
            ));
        }
        match block {
            CanaryBlock::System {
                ptr,
                layout,
                size: old_size,
            } => {
                let new_total = HEADER_SIZE
                    .checked_add(new_size)
                    .ok_or_else(|| LunetError::ArgumentError("realloc size overflow".into()))?;
                let new_layout = Layout::array::<u8>(new_total)
                    .map_err(|e| LunetError::ArgumentError(e.to_string()))?;
                // SAFETY: `ptr` was allocated with `layout` by this same
                // allocator and is not used again after this call.
                let raw = unsafe { alloc::realloc(ptr.as_ptr(), layout, new_layout.size()) };
                let new_ptr = NonNull::new(raw)
                    .ok_or_else(|| LunetError::ResourceError("system allocator exhausted".into()))?;
                let new_size_u32 = u32::try_from(new_size)
                    .map_err(|_| LunetError::ArgumentError("realloc size exceeds u32".into()))?;
                // SAFETY: `new_ptr` is `new_total` bytes, at least
                // `HEADER_SIZE`.
                let header =
                    unsafe { std::slice::from_raw_parts_mut(new_ptr.as_ptr(), HEADER_SIZE) };
                self.write_header(header, new_size_u32);

                let mut stats = self.stats.lock().unwrap();
                stats.live_bytes = stats.live_bytes.saturating_sub(old_size as u64);
                stats.live_bytes += new_size as u64;
                stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);
                drop(stats);

                Ok(CanaryBlock::System {
                    ptr: new_ptr,
                    layout: new_layout,
                    size: new_size,
                })
            }
            CanaryBlock::Arena {
                arena,
                block: old_block,
                size: old_size,
            } => {
                // The arena tier has no in-place grow; mirror
                // `lunet_easy_memory.c`'s fallback of alloc-new + copy +
                // free-old.
                let mut new_block = self.alloc(new_size)?;
                let copy_len = old_size.min(new_size);
                let old_bytes = {
                    let guard = arena.lock();
                    let off = old_block.data_offset() as usize + HEADER_SIZE;
                    guard.buffer()[off..off + copy_len].to_vec()
                };
                new_block.with_payload_mut(|dst| dst[..copy_len].copy_from_slice(&old_bytes));
                self.free(CanaryBlock::Arena {
                    arena,
                    block: old_block,
                    size: old_size,
                });
                Ok(new_block)
            }
        }
    }

    pub fn free(&self, mut block: CanaryBlock) {
        if !block.canary_ok() {
            let (magic, _) = block.read_header();
            let poison_word = u32::from_le_bytes([POISON_BYTE; 4]);
            if magic == poison_word {
                tracing::error!("double free: canary already shows the poison pattern left by an earlier free");
            } else {
                tracing::error!("use-after-free: canary corrupted by an out-of-bounds or stale write");
            }
            std::mem::forget(block);
            return;
        }
        let size = block.len();
        if self.poisoning {
            block.poison_header();
            block.with_payload_mut(|bytes| bytes.fill(POISON_BYTE));
        }
        match block {
            CanaryBlock::System { ptr, layout, .. } => {
                // SAFETY: `ptr`/`layout` describe the allocation made in
                // `alloc`/`realloc`, dropped here exactly once.
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            }
            CanaryBlock::Arena { arena, block, .. } => {
                arena.lock().free(block);
            }
        }
        let mut stats = self.stats.lock().unwrap();
        stats.free_count += 1;
        stats.live_bytes = stats.live_bytes.saturating_sub(size as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_backend_round_trips_payload() {
        let alloc = CanaryAllocator::new(Backend::System);
        let mut block = alloc.alloc(16).unwrap();
        block.with_payload_mut(|b| b.copy_from_slice(&[7u8; 16]));
        block.with_payload(|b| assert_eq!(b, &[7u8; 16]));
        assert!(block.canary_ok());
        alloc.free(block);
        assert!(alloc.assert_balanced().is_ok());
    }

    #[test]
    fn arena_backend_round_trips_payload() {
        let arena = Arc::new(ArenaMutex::new(Arena::new(4096)));
        let alloc = CanaryAllocator::new(Backend::Arena(arena));
        let mut block = alloc.alloc(32).unwrap();
        block.with_payload_mut(|b| b.fill(0xAB));
        block.with_payload(|b| assert!(b.iter().all(|&byte| byte == 0xAB)));
        alloc.free(block);
        assert!(alloc.assert_balanced().is_ok());
    }

    #[test]
    fn calloc_zeroes_and_rejects_overflow() {
        let alloc = CanaryAllocator::new(Backend::System);
        let block = alloc.calloc(4, 8).unwrap();
        block.with_payload(|b| assert!(b.iter().all(|&byte| byte == 0)));
        alloc.free(block);

        let overflow = alloc.calloc(usize::MAX, 2);
        assert!(overflow.is_err());
    }

    #[test]
    fn realloc_preserves_prefix_on_system_backend() {
        let alloc = CanaryAllocator::new(Backend::System);
        let mut block = alloc.alloc(4).unwrap();
        block.with_payload_mut(|b| b.copy_from_slice(&[1, 2, 3, 4]));
        let grown = alloc.realloc(block, 8).unwrap();
        grown.with_payload(|b| assert_eq!(&b[0..4], &[1, 2, 3, 4]));
        alloc.free(grown);
    }

    #[test]
    fn realloc_preserves_prefix_on_arena_backend() {
        let arena = Arc::new(ArenaMutex::new(Arena::new(4096)));
        let alloc = CanaryAllocator::new(Backend::Arena(arena));
        let mut block = alloc.alloc(4).unwrap();
        block.with_payload_mut(|b| b.copy_from_slice(&[9, 8, 7, 6]));
        let grown = alloc.realloc(block, 64).unwrap();
        grown.with_payload(|b| assert_eq!(&b[0..4], &[9, 8, 7, 6]));
        alloc.free(grown);
    }

    #[test]
    fn unbalanced_allocator_is_reported() {
        let alloc = CanaryAllocator::new(Backend::System);
        let _leaked = alloc.alloc(8).unwrap();
        assert!(alloc.assert_balanced().is_err());
    }

    #[test]
    fn double_free_is_detected_via_the_poison_pattern() {
        let arena = Arc::new(ArenaMutex::new(Arena::new(4096)));
        let alloc = CanaryAllocator::new(Backend::Arena(Arc::clone(&arena)));
        let block = alloc.alloc(16).unwrap();
        let (arena_ref, block_ref, size) = match &block {
            CanaryBlock::Arena { arena, block, size } => (Arc::clone(arena), *block, *size),
            _ => unreachable!(),
        };
        alloc.free(block);

        // Simulate a second, stale handle to the same (now freed and
        // poisoned) block rather than calling `free` twice on one owned
        // value, which the type system already forbids.
        let stale = CanaryBlock::Arena {
            arena: arena_ref,
            block: block_ref,
            size,
        };
        assert!(!stale.canary_ok());
        alloc.free(stale); // logs "double free", does not panic or corrupt further
    }

    #[test]
    fn corrupted_canary_that_is_not_poison_reads_as_use_after_free() {
        let arena = Arc::new(ArenaMutex::new(Arena::new(4096)));
        let alloc = CanaryAllocator::new(Backend::Arena(Arc::clone(&arena)));
        let block = alloc.alloc(16).unwrap();
        let (arena_ref, block_ref, size) = match &block {
            CanaryBlock::Arena { arena, block, size } => (Arc::clone(arena), *block, *size),
            _ => unreachable!(),
        };
        {
            let mut guard = arena_ref.lock();
            let off = block_ref.data_offset() as usize;
            guard.buffer_mut()[off..off + 4].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        }
        assert!(!block.canary_ok());
        alloc.free(block); // logs "use-after-free", distinct from the double-free path
    }

    #[test]
    fn poisoning_overwrites_payload_before_free() {
        let arena = Arc::new(ArenaMutex::new(Arena::new(4096)));
        let mut alloc = CanaryAllocator::new(Backend::Arena(Arc::clone(&arena)));
        alloc.set_poisoning(true);
        let block = alloc.alloc(16).unwrap();
        let (arena_ref, block_ref) = match &block {
            CanaryBlock::Arena { arena, block, .. } => (Arc::clone(arena), *block),
            _ => unreachable!(),
        };
        alloc.free(block);
        let guard = arena_ref.lock();
        let off = block_ref.data_offset() as usize + HEADER_SIZE;
        assert!(guard.buffer()[off..off + 16].iter().all(|&b| b == POISON_BYTE));
    }
}
