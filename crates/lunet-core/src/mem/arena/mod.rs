//! XOR-magic arena tier (spec §4.2).

mod block;
mod bump;
mod tree;

mod arena;

pub use arena::{
    Arena, ArenaStats, NestedArena, ARENA_POISON_BYTE, DEFAULT_ALIGNMENT, MAX_ALIGNMENT, WORD_SIZE,
};
pub use block::BlockRef;
pub use bump::Bump;
