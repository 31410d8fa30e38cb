//! # Eviction & Expiration Engine
//!
//! Per-size-class LRU reclamation plus lazy expiration (spec §4.4). The
//! teacher's engine checks expiration only on access (`Node::is_expired`,
//! checked inline in `get`/`set`/`delete`); this module keeps that lazy
//! check at the call sites in [`crate::facade`] and adds the one piece the
//! teacher's single-tier design didn't need: an explicit `reclaim(class)`
//! that walks a size class's own LRU chain when the slab allocator cannot
//! satisfy an `acquire`.
//!
//! ## Lock ordering
//!
//! Spec §5 states the rule "item-table bucket -> class lock". `reclaim`
//! necessarily holds the class's LRU chain open (via
//! [`crate::slab::SlabClass::scan_reclaim_candidates`]) before it knows which
//! table shard(s) it needs, which would invert that order if it then
//! blocked on the table lock. This implementation never blocks there: it
//! uses [`crate::table::ItemTable::try_unlink`] and skips any candidate
//! whose shard is contended, so no thread ever waits on a table lock while
//! holding a class lock (`scan_reclaim_candidates` itself has already
//! released the class lock by the time `try_unlink` runs).

use std::sync::Arc;

use crate::slab::SlabAllocator;
use crate::stats::EngineStats;
use crate::table::ItemTable;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum EvictError {
    #[error("no eligible victim found within the scan depth")]
    NoVictim,
}

/// Drives reclamation for one engine instance. Stateless beyond the shared
/// allocator/table/stats handles; safe to call concurrently from many
/// threads, each working on a (possibly different) class.
pub struct Evictor {
    slabs: Arc<SlabAllocator>,
    table: Arc<ItemTable>,
    stats: Arc<EngineStats>,
}

impl Evictor {
    pub fn new(slabs: Arc<SlabAllocator>, table: Arc<ItemTable>, stats: Arc<EngineStats>) -> Self {
        Evictor { slabs, table, stats }
    }

    /// Attempts to make one chunk available in `class_id` at relative time
    /// `now`. Walks the class's LRU chain from its tail, reaping every
    /// expired eligible item passed over along the way, then evicts at most
    /// the single least-recently-used live item found after them (spec
    /// §4.4: a live item is only ever a victim when it is the LRU tail).
    pub fn reclaim(&self, class_id: u8, now: u32) -> Result<(), EvictError> {
        let class = self.slabs.class(class_id);
        let scan = class.scan_reclaim_candidates(now);

        let mut freed_any = false;
        for (slot, key, size) in scan.reaped {
            match self.table.try_unlink(&key) {
                Ok(Some(_loc)) => {
                    class.vacate(slot);
                    self.stats.record_expired_reap(size);
                    freed_any = true;
                }
                Ok(None) => {
                    // Already unlinked by a concurrent caller; still own the chunk.
                    class.vacate(slot);
                    freed_any = true;
                }
                Err(()) => {
                    tracing::debug!(class_id, slot, "expired candidate contended, skipping");
                }
            }
        }

        if let Some((slot, key, size)) = scan.victim {
            match self.table.try_unlink(&key) {
                Ok(Some(_loc)) => {
                    class.vacate(slot);
                    self.stats.record_eviction(size);
                    freed_any = true;
                }
                Ok(None) => {
                    class.vacate(slot);
                    freed_any = true;
                }
                Err(()) => {
                    tracing::debug!(class_id, slot, "eviction victim contended, skipping");
                }
            }
        }

        if freed_any {
            Ok(())
        } else {
            Err(EvictError::NoVictim)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;

    fn item(key: &[u8], refcount: u32, exptime: u32) -> Item {
        Item {
            key: Arc::from(key),
            value: Arc::from(b"v".as_slice()),
            flags: 0,
            exptime,
            cas: 1,
            refcount,
            iflag: crate::item::IFLAG_LINKED,
            class_id: 0,
            created_at: 0,
            last_bumped_at: 0,
        }
    }

    fn setup() -> (Arc<SlabAllocator>, Arc<ItemTable>, Arc<EngineStats>, Evictor) {
        let slabs = Arc::new(SlabAllocator::new(96, 1.25, 1024, 64 * 1024 * 1024));
        let table = Arc::new(ItemTable::with_shard_count(4));
        let stats = Arc::new(EngineStats::new());
        let evictor = Evictor::new(Arc::clone(&slabs), Arc::clone(&table), Arc::clone(&stats));
        (slabs, table, stats, evictor)
    }

    #[test]
    fn reclaim_fails_on_empty_class() {
        let (_slabs, _table, _stats, evictor) = setup();
        assert_eq!(evictor.reclaim(0, 0), Err(EvictError::NoVictim));
    }

    #[test]
    fn reclaim_evicts_lru_tail() {
        let (slabs, table, _stats, evictor) = setup();
        let a = slabs.acquire(0).unwrap();
        slabs.class(0).put(a, item(b"a", 0, 0));
        table.link(Arc::from(b"a".as_slice()), crate::table::ItemLoc { class_id: 0, slot: a });

        let b = slabs.acquire(0).unwrap();
        slabs.class(0).put(b, item(b"b", 0, 0));
        table.link(Arc::from(b"b".as_slice()), crate::table::ItemLoc { class_id: 0, slot: b });

        assert!(evictor.reclaim(0, 0).is_ok());
        assert_eq!(table.lookup(b"a"), None);
        assert_eq!(table.lookup(b"b").is_some(), true);
    }

    #[test]
    fn reclaim_skips_pinned_items() {
        let (slabs, table, _stats, evictor) = setup();
        let a = slabs.acquire(0).unwrap();
        slabs.class(0).put(a, item(b"a", 1, 0));
        table.link(Arc::from(b"a".as_slice()), crate::table::ItemLoc { class_id: 0, slot: a });

        assert_eq!(evictor.reclaim(0, 0), Err(EvictError::NoVictim));
        assert!(table.lookup(b"a").is_some());
    }

    #[test]
    fn reclaim_reaps_expired_item() {
        let (slabs, table, stats, evictor) = setup();
        let a = slabs.acquire(0).unwrap();
        slabs.class(0).put(a, item(b"a", 0, 10));
        table.link(Arc::from(b"a".as_slice()), crate::table::ItemLoc { class_id: 0, slot: a });

        assert!(evictor.reclaim(0, 100).is_ok());
        assert_eq!(table.lookup(b"a"), None);
        assert_eq!(stats.snapshot().expired_unfetched, 1);
    }
}
