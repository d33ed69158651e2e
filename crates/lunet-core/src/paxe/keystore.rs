//! Fixed-slot PAXE keystore, ported from the original's linear-probed
//! array rather than a hash map: key ids are small and dense, so a flat
//! table with open addressing is both simpler and faster than a map here.

use std::sync::Mutex;

const SLOTS: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key_id: u32,
    occupied: bool,
    key: [u8; 32],
}

impl Entry {
    const EMPTY: Entry = Entry {
        key_id: 0,
        occupied: false,
        key: [0u8; 32],
    };
}

/// Maps a 32-bit key id to a 256-bit AES-GCM key.
pub struct Keystore {
    slots: Mutex<[Entry; SLOTS]>,
}

impl Default for Keystore {
    fn default() -> Self {
        Self::new()
    }
}

impl Keystore {
    pub fn new() -> Self {
        Keystore {
            slots: Mutex::new([Entry::EMPTY; SLOTS]),
        }
    }

    fn probe_start(key_id: u32) -> usize {
        key_id as usize % SLOTS
    }

    /// Insert or overwrite the key for `key_id`. Fails only if the table is
    /// completely full and `key_id` was not already present.
    pub fn insert(&self, key_id: u32, key: [u8; 32]) -> bool {
        let mut slots = self.slots.lock().unwrap();
        let start = Self::probe_start(key_id);
        for step in 0..SLOTS {
            let i = (start + step) % SLOTS;
            if !slots[i].occupied || slots[i].key_id == key_id {
                slots[i] = Entry {
                    key_id,
                    occupied: true,
                    key,
                };
                return true;
            }
        }
        false
    }

    /// Look up the key for `key_id`, probing linearly from its hashed slot.
    pub fn lookup(&self, key_id: u32) -> Option<[u8; 32]> {
        let slots = self.slots.lock().unwrap();
        let start = Self::probe_start(key_id);
        for step in 0..SLOTS {
            let i = (start + step) % SLOTS;
            if !slots[i].occupied {
                return None;
            }
            if slots[i].key_id == key_id {
                return Some(slots[i].key);
            }
        }
        None
    }

    pub fn remove(&self, key_id: u32) {
        let mut slots = self.slots.lock().unwrap();
        let start = Self::probe_start(key_id);
        for step in 0..SLOTS {
            let i = (start + step) % SLOTS;
            if !slots[i].occupied {
                return;
            }
            if slots[i].key_id == key_id {
                slots[i] = Entry::EMPTY;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_round_trips() {
        let ks = Keystore::new();
        assert!(ks.insert(7, [9u8; 32]));
        assert_eq!(ks.lookup(7), Some([9u8; 32]));
    }

    #[test]
    fn missing_key_is_none() {
        let ks = Keystore::new();
        assert_eq!(ks.lookup(42), None);
    }

    #[test]
    fn remove_clears_the_slot() {
        let ks = Keystore::new();
        ks.insert(3, [1u8; 32]);
        ks.remove(3);
        assert_eq!(ks.lookup(3), None);
    }

    #[test]
    fn colliding_key_ids_both_resolve() {
        let ks = Keystore::new();
        let a = 5u32;
        let b = a + 256; // same probe_start modulo SLOTS
        ks.insert(a, [1u8; 32]);
        ks.insert(b, [2u8; 32]);
        assert_eq!(ks.lookup(a), Some([1u8; 32]));
        assert_eq!(ks.lookup(b), Some([2u8; 32]));
    }
}
