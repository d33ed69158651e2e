//! Memory subsystem: the canary-header tier wrapping either the system
//! allocator or an arena, and the XOR-magic arena tier itself (spec §4.1,
//! §4.2).

pub mod arena;
pub mod canary;

pub use arena::{Arena, ArenaStats, Bump, NestedArena};
pub use canary::{AllocStats, Backend, CanaryAllocator};
