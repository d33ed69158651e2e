//! Memory allocation tiers and the PAXE packet decoder for the Lunet
//! runtime: the parts of the system that do not themselves depend on an
//! event loop (spec §4.1, §4.2, §4.8). See [`mem`] for the allocator tiers
//! and [`paxe`] for the packet codec.

#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]

pub mod mem;
pub mod paxe;

pub use mem::{AllocStats, Arena, ArenaStats, Backend, Bump, CanaryAllocator, NestedArena};
pub use paxe::{Keystore, PaxeDecoder, PaxeEncoder, PaxePacket};
