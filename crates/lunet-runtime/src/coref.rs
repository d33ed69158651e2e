//! Coref registry and the alive-set (spec §4.3, grounded on
//! `raya-stdlib-posix`'s `HandleRegistry` pattern, generalised from a
//! single numeric-handle map into the two tables spec §4.3 separates:
//! a coref registry for in-flight operations and an alive-set keeping
//! yielded coroutines reachable).

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use lunet_sdk::CoroutineId;
use rustc_hash::FxBuildHasher;

/// One outstanding "I submitted an operation and am waiting for its
/// completion" ticket. Exactly one coref exists between a primitive's
/// `yield` and its completion callback's `resume` (spec §8 "Coref
/// balance").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorefId(pub u64);

/// Maps outstanding corefs to the coroutine they will resume. Keyed by a
/// plain `u64` counter, so the faster `FxHash` (non-DoS-resistant) hasher
/// is a safe trade for the default SipHash here — there is no untrusted
/// input feeding these keys.
#[derive(Debug, Default)]
pub struct CorefRegistry {
    map: DashMap<u64, CoroutineId, FxBuildHasher>,
    next_id: AtomicU64,
}

impl CorefRegistry {
    pub fn new() -> Self {
        CorefRegistry {
            map: DashMap::with_hasher(FxBuildHasher::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Record that `coroutine` is waiting on a new coref, returning its id.
    pub fn create(&self, coroutine: CoroutineId) -> CorefId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.map.insert(id, coroutine);
        CorefId(id)
    }

    /// Resolve and remove a coref, as its completion callback does exactly
    /// once. Returns `None` if the coref was already released (a double
    /// release, which callers should treat as an invariant violation).
    pub fn release(&self, coref: CorefId) -> Option<CoroutineId> {
        self.map.remove(&coref.0).map(|(_, coroutine)| coroutine)
    }

    pub fn outstanding(&self) -> usize {
        self.map.len()
    }
}

/// Coroutines that have yielded and not yet completed, keeping them
/// reachable from the host's perspective independent of the host's own
/// garbage collector (spec §8 "Alive-set balance").
#[derive(Debug, Default)]
pub struct AliveSet {
    members: DashSet<CoroutineId, FxBuildHasher>,
}

impl AliveSet {
    pub fn new() -> Self {
        AliveSet {
            members: DashSet::with_hasher(FxBuildHasher::default()),
        }
    }

    pub fn mark_alive(&self, id: CoroutineId) {
        self.members.insert(id);
    }

    /// Remove a coroutine once it terminates. Returns `true` if it was
    /// present (a caller removing a coroutine that was never marked alive
    /// indicates a bug upstream).
    pub fn remove(&self, id: CoroutineId) -> bool {
        self.members.remove(&id).is_some()
    }

    pub fn is_alive(&self, id: CoroutineId) -> bool {
        self.members.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_release_round_trips_the_coroutine_id() {
        let registry = CorefRegistry::new();
        let coref = registry.create(CoroutineId(42));
        assert_eq!(registry.outstanding(), 1);
        let resolved = registry.release(coref).unwrap();
        assert_eq!(resolved, CoroutineId(42));
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn double_release_returns_none() {
        let registry = CorefRegistry::new();
        let coref = registry.create(CoroutineId(1));
        assert!(registry.release(coref).is_some());
        assert!(registry.release(coref).is_none());
    }

    #[test]
    fn distinct_corefs_get_distinct_ids() {
        let registry = CorefRegistry::new();
        let a = registry.create(CoroutineId(1));
        let b = registry.create(CoroutineId(1));
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn alive_set_tracks_membership() {
        let set = AliveSet::new();
        let id = CoroutineId(7);
        assert!(!set.is_alive(id));
        set.mark_alive(id);
        assert!(set.is_alive(id));
        assert!(set.remove(id));
        assert!(!set.is_alive(id));
    }

    #[test]
    fn removing_an_absent_coroutine_reports_false() {
        let set = AliveSet::new();
        assert!(!set.remove(CoroutineId(99)));
    }
}
