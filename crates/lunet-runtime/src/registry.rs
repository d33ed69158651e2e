//! Generic numeric handle table, grounded on `raya-stdlib-posix`'s
//! `HandleRegistry` pattern (the same one [`crate::coref::CorefRegistry`]
//! generalises). Every resource kind the event loop hands back to script
//! code (listeners, connections, UDP sockets, storage units, timers) goes
//! through one of these so the host only ever sees a plain `u64` id, never
//! a Rust type.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

/// Maps opaque `u64` ids to resource contexts of type `T`. Keyed by a
/// plain counter, so `FxHash` is a safe, faster trade for the default
/// SipHash (no untrusted input ever reaches these keys).
#[derive(Debug)]
pub struct HandleRegistry<T> {
    map: DashMap<u64, T, FxBuildHasher>,
    next_id: AtomicU64,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        HandleRegistry {
            map: DashMap::with_hasher(FxBuildHasher::default()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: Clone> HandleRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new resource, returning the id script code will use to
    /// refer to it from now on.
    pub fn insert(&self, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.map.insert(id, value);
        id
    }

    pub fn get(&self, id: u64) -> Option<T> {
        self.map.get(&id).map(|entry| entry.value().clone())
    }

    /// Drop a resource from the table (spec §4.4's "close removes the
    /// handle from every table that can reach it").
    pub fn remove(&self, id: u64) -> Option<T> {
        self.map.remove(&id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
