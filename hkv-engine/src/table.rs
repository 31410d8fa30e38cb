//! # Item Table
//!
//! A hash-indexed mapping from key bytes to a live item's location (spec
//! §3/§4.3). Sharded the way the teacher's `MemoryEngine` shards its map —
//! one `parking_lot::RwLock<HashMap<...>>` per shard, picked by key hash —
//! so uncontended lookups only ever take a read lock on one shard.
//!
//! The table never stores the item itself, only an [`ItemLoc`] pointing
//! into the owning slab class's arena. This is the same arena-plus-indices
//! resolution the teacher applies to cyclic references, extended here to a
//! second independent structure (the slab class's own LRU chain) without
//! either one needing to know about the other's internals.

use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

/// Default shard multiplier, matching the teacher's `MemoryEngine`.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

/// Where a live item's memory lives: which slab class, and which slot in
/// that class's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemLoc {
    pub class_id: u8,
    pub slot: u32,
}

struct Shard {
    map: RwLock<HashMap<Arc<[u8]>, ItemLoc, RandomState>>,
}

/// Sharded key -> [`ItemLoc`] index.
pub struct ItemTable {
    shards: Vec<Shard>,
    shard_mask: usize,
    hash_state: RandomState,
}

impl ItemTable {
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER))
    }

    pub fn with_shard_count(shards: usize) -> Self {
        let shard_count = shards.max(1).next_power_of_two();
        let hash_state = RandomState::new();
        let mut shard_vec = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shard_vec.push(Shard {
                map: RwLock::new(HashMap::with_hasher(hash_state.clone())),
            });
        }
        ItemTable {
            shards: shard_vec,
            shard_mask: shard_count - 1,
            hash_state,
        }
    }

    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key);
        (hasher.finish() as usize) & self.shard_mask
    }

    /// The shard index owning `key`; exposed so the eviction engine can
    /// acquire the *same* shard's write lock when resolving a reclaim
    /// candidate (see [`crate::eviction`]'s lock-ordering note).
    pub fn shard_for_key(&self, key: &[u8]) -> usize {
        self.shard_index(key)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Looks up `key`, returning its current location if linked.
    pub fn lookup(&self, key: &[u8]) -> Option<ItemLoc> {
        let shard = &self.shards[self.shard_index(key)];
        shard.map.read().get(key).copied()
    }

    /// Inserts `key -> loc`. Returns the previous location, if any (callers
    /// decide whether that is a conflict to resolve, per spec §4.3's "fails
    /// if duplicate unless caller resolves").
    pub fn link(&self, key: Arc<[u8]>, loc: ItemLoc) -> Option<ItemLoc> {
        let shard = &self.shards[self.shard_index(&key)];
        shard.map.write().insert(key, loc)
    }

    /// Removes `key`, returning its prior location if it was linked.
    pub fn unlink(&self, key: &[u8]) -> Option<ItemLoc> {
        let shard = &self.shards[self.shard_index(key)];
        shard.map.write().remove(key)
    }

    /// Atomically swaps the location stored for `key` from `expected` to
    /// `new`, used by `APPEND`/`PREPEND`/`CAS` to repoint an existing key at
    /// a freshly allocated item without a visible unlinked gap.
    pub fn replace(&self, key: &[u8], new: ItemLoc) -> Option<ItemLoc> {
        let shard = &self.shards[self.shard_index(key)];
        let mut guard = shard.map.write();
        let prior = guard.get(key).copied()?;
        guard.insert(Arc::from(key), new);
        Some(prior)
    }

    /// Runs `f` with exclusive access to `key`'s owning shard map, holding
    /// the write lock for the whole closure. This is what makes `store`'s
    /// check-then-commit (existing location, CAS comparison, relink) atomic
    /// instead of racing two threads through a read-then-write window; see
    /// `DESIGN.md`'s note on CAS linearisability.
    pub fn with_locked<R>(
        &self,
        key: &[u8],
        f: impl FnOnce(&mut HashMap<Arc<[u8]>, ItemLoc, RandomState>) -> R,
    ) -> R {
        let shard = &self.shards[self.shard_index(key)];
        let mut guard = shard.map.write();
        f(&mut guard)
    }

    /// Attempts to remove `key` from its owning shard without blocking.
    /// Used exclusively by the eviction engine to resolve the lock-ordering
    /// inversion documented in `DESIGN.md`: `reclaim()` already holds the
    /// victim's class lock and must not then wait on a table lock.
    pub fn try_unlink(&self, key: &[u8]) -> Result<Option<ItemLoc>, ()> {
        let shard = &self.shards[self.shard_index(key)];
        match shard.map.try_write() {
            Some(mut guard) => Ok(guard.remove(key)),
            None => Err(()),
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ItemTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_then_lookup() {
        let table = ItemTable::with_shard_count(4);
        let key: Arc<[u8]> = Arc::from(b"foo".as_slice());
        table.link(Arc::clone(&key), ItemLoc { class_id: 0, slot: 3 });
        assert_eq!(table.lookup(&key), Some(ItemLoc { class_id: 0, slot: 3 }));
    }

    #[test]
    fn unlink_removes_entry() {
        let table = ItemTable::with_shard_count(4);
        let key: Arc<[u8]> = Arc::from(b"foo".as_slice());
        table.link(Arc::clone(&key), ItemLoc { class_id: 0, slot: 3 });
        assert_eq!(table.unlink(&key), Some(ItemLoc { class_id: 0, slot: 3 }));
        assert_eq!(table.lookup(&key), None);
    }

    #[test]
    fn replace_repoints_existing_key() {
        let table = ItemTable::with_shard_count(4);
        let key: Arc<[u8]> = Arc::from(b"foo".as_slice());
        table.link(Arc::clone(&key), ItemLoc { class_id: 0, slot: 1 });
        let prior = table.replace(&key, ItemLoc { class_id: 1, slot: 9 });
        assert_eq!(prior, Some(ItemLoc { class_id: 0, slot: 1 }));
        assert_eq!(table.lookup(&key), Some(ItemLoc { class_id: 1, slot: 9 }));
    }

    #[test]
    fn shard_count_is_power_of_two() {
        let table = ItemTable::with_shard_count(5);
        assert!(table.shard_count().is_power_of_two());
        assert!(table.shard_count() >= 5);
    }

    #[test]
    fn len_sums_across_shards() {
        let table = ItemTable::with_shard_count(4);
        for i in 0..10u8 {
            table.link(Arc::from(vec![i]), ItemLoc { class_id: 0, slot: i as u32 });
        }
        assert_eq!(table.len(), 10);
    }
}
