//! # Slab Allocator
//!
//! Carve fixed-size chunks out of a bounded heap, organized into geometric
//! size classes (spec §3/§4.2). Generalizes the teacher's `ShardInner`
//! arena-by-index pattern (`memory.rs`) from "one arena per lock shard" to
//! "one arena per slab class", which is what a per-class LRU chain needs:
//! each [`SlabClass`] owns its own item arena, free list, and intrusive LRU
//! chain behind one `parking_lot::Mutex`.
//!
//! ## Design Principles
//!
//! 1. **Index-Based Arena**: slots are addressed by `u32` index, never by
//!    pointer, so the LRU chain and the item table can both reference a
//!    slot without shared ownership or back-pointers.
//! 2. **No Return To OS**: once a page is carved for a class it stays with
//!    that class for the process lifetime; fragmentation is bounded, not
//!    eliminated, the same trade-off real slab allocators make.
//! 3. **Per-Class Locking**: each class's free list and LRU chain share one
//!    lock, since every mutation touches both together.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::item::Item;

/// Slab page size: classes grow their arena in batches of this many bytes
/// worth of chunks at a time.
pub const SLAB_PAGE_SIZE: usize = 1024 * 1024;

/// Bounded scan depth for a single LRU walk (spec §4.4).
pub const EVICTION_SCAN_DEPTH: usize = 50;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ChunkError {
    #[error("no chunk available in this class within the memory budget")]
    NoChunk,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum TryAcquireError {
    #[error("no chunk available in this class within the memory budget")]
    NoChunk,
    #[error("class lock contended")]
    Contended,
}

/// One occupied or free arena slot. `None` in the arena vector means the
/// slot has never been carved; `Some` means it was carved at least once
/// (it may still be logically free, tracked by the class's free list).
struct Slot {
    item: Item,
    /// Intrusive pointer toward the MRU end of the class's LRU chain.
    newer: Option<u32>,
    /// Intrusive pointer toward the LRU end of the class's LRU chain.
    older: Option<u32>,
}

struct ClassInner {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Most-recently-used end of the chain.
    mru: Option<u32>,
    /// Least-recently-used end of the chain; eviction walks from here.
    lru: Option<u32>,
}

impl ClassInner {
    fn unlink_chain(&mut self, idx: u32) {
        let (newer, older) = {
            let slot = self.slots[idx as usize].as_ref().expect("slot occupied");
            (slot.newer, slot.older)
        };

        match newer {
            Some(n) => self.slots[n as usize].as_mut().expect("slot occupied").older = older,
            None => self.mru = older,
        }
        match older {
            Some(o) => self.slots[o as usize].as_mut().expect("slot occupied").newer = newer,
            None => self.lru = newer,
        }

        if let Some(slot) = self.slots[idx as usize].as_mut() {
            slot.newer = None;
            slot.older = None;
        }
    }

    fn push_mru(&mut self, idx: u32) {
        let old_mru = self.mru;
        if let Some(slot) = self.slots[idx as usize].as_mut() {
            slot.older = old_mru;
            slot.newer = None;
        }
        match old_mru {
            Some(m) => self.slots[m as usize].as_mut().expect("slot occupied").newer = Some(idx),
            None => self.lru = Some(idx),
        }
        self.mru = Some(idx);
    }

    /// Moves an already-linked slot to the MRU end.
    fn bump(&mut self, idx: u32) {
        if self.mru == Some(idx) {
            return;
        }
        self.unlink_chain(idx);
        self.push_mru(idx);
    }
}

/// One geometric size class: a fixed chunk size, its own item arena, free
/// list, and LRU chain.
pub struct SlabClass {
    pub class_id: u8,
    pub chunk_size: usize,
    slots_per_page: usize,
    inner: Mutex<ClassInner>,
}

/// Per-class occupancy, reported to `get_stats`' `slabs` sub-key.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClassUtilization {
    pub class_id: u8,
    pub chunk_size: usize,
    pub total_slots: usize,
    pub free_slots: usize,
    pub used_slots: usize,
}

impl SlabClass {
    fn new(class_id: u8, chunk_size: usize) -> Self {
        let slots_per_page = (SLAB_PAGE_SIZE / chunk_size).max(1);
        SlabClass {
            class_id,
            chunk_size,
            slots_per_page,
            inner: Mutex::new(ClassInner {
                slots: Vec::new(),
                free: Vec::new(),
                mru: None,
                lru: None,
            }),
        }
    }

    fn utilization(&self) -> ClassUtilization {
        let inner = self.inner.lock();
        ClassUtilization {
            class_id: self.class_id,
            chunk_size: self.chunk_size,
            total_slots: inner.slots.len(),
            free_slots: inner.free.len(),
            used_slots: inner.slots.len() - inner.free.len(),
        }
    }

    /// Installs an item into a free slot and links it at the MRU end.
    /// Caller must have already reserved the slot via
    /// [`SlabAllocator::acquire`].
    pub(crate) fn put(&self, slot: u32, item: Item) {
        let mut inner = self.inner.lock();
        inner.slots[slot as usize] = Some(Slot {
            item,
            newer: None,
            older: None,
        });
        inner.push_mru(slot);
    }

    pub(crate) fn get(&self, slot: u32) -> Item {
        self.inner.lock().slots[slot as usize]
            .as_ref()
            .expect("slot occupied")
            .item
            .clone()
    }

    pub(crate) fn with_item_mut<R>(&self, slot: u32, f: impl FnOnce(&mut Item) -> R) -> R {
        let mut inner = self.inner.lock();
        let item = &mut inner.slots[slot as usize].as_mut().expect("slot occupied").item;
        f(item)
    }

    /// Moves the slot to the MRU end unless it was bumped within
    /// `suppress_window` relative-time units of `now` (spec §4.4).
    pub(crate) fn bump(&self, slot: u32, now: u32, suppress_window: u32) {
        let mut inner = self.inner.lock();
        let last_bumped = inner.slots[slot as usize]
            .as_ref()
            .expect("slot occupied")
            .item
            .last_bumped_at;
        if now.saturating_sub(last_bumped) < suppress_window {
            return;
        }
        inner.slots[slot as usize]
            .as_mut()
            .expect("slot occupied")
            .item
            .last_bumped_at = now;
        inner.bump(slot);
    }

    /// Detaches the slot from the LRU chain and the arena, returning the
    /// chunk to this class's free list. Does not touch the item table; the
    /// caller is responsible for the matching `unlink` there.
    pub(crate) fn vacate(&self, slot: u32) {
        let mut inner = self.inner.lock();
        inner.unlink_chain(slot);
        inner.slots[slot as usize] = None;
        inner.free.push(slot);
    }

    /// Walks the chain from the LRU end, calling `f` on each occupied slot
    /// in order, up to `EVICTION_SCAN_DEPTH` slots. `f` returns `true` to
    /// stop the walk (victim chosen).
    pub(crate) fn scan_from_lru(&self, mut f: impl FnMut(u32, &Item) -> bool) {
        let inner = self.inner.lock();
        let mut cursor = inner.lru;
        let mut depth = 0;
        while let Some(idx) = cursor {
            if depth >= EVICTION_SCAN_DEPTH {
                break;
            }
            let slot = inner.slots[idx as usize].as_ref().expect("slot occupied");
            cursor = slot.newer;
            if f(idx, &slot.item) {
                break;
            }
            depth += 1;
        }
    }

    /// Walks from the LRU end collecting every `refcount == 0` expired
    /// candidate encountered along the way, then stops at the first
    /// `refcount == 0` *live* candidate and records it as the victim. Spec
    /// §4.4: only that one live candidate, the true LRU tail, is ever
    /// evicted per walk; expired items passed over on the way to it are
    /// opportunistically reaped in bulk. Used by
    /// [`crate::eviction::Evictor`] to avoid holding this class's lock
    /// across the table operations that follow (see `DESIGN.md`'s
    /// lock-ordering note).
    pub(crate) fn scan_reclaim_candidates(&self, now: u32) -> ReclaimScan {
        let mut reaped = Vec::new();
        let mut victim = None;
        self.scan_from_lru(|slot, candidate| {
            if candidate.refcount != 0 {
                return false;
            }
            if candidate.is_expired(now) {
                reaped.push((slot, std::sync::Arc::clone(&candidate.key), candidate.footprint() as u64));
                false
            } else {
                victim = Some((slot, std::sync::Arc::clone(&candidate.key), candidate.footprint() as u64));
                true
            }
        });
        ReclaimScan { reaped, victim }
    }
}

/// Result of one [`SlabClass::scan_reclaim_candidates`] walk: every expired
/// candidate passed over (slot, key, footprint), plus at most one live LRU
/// tail victim to actually evict.
pub(crate) struct ReclaimScan {
    pub(crate) reaped: Vec<(u32, std::sync::Arc<[u8]>, u64)>,
    pub(crate) victim: Option<(u32, std::sync::Arc<[u8]>, u64)>,
}

/// Owns every size class and the global page-reservation budget (spec §3/§5:
/// "the memory budget is a single global quantity shared across all
/// classes").
pub struct SlabAllocator {
    classes: Vec<SlabClass>,
    used_page_bytes: AtomicUsize,
    max_bytes: u64,
}

impl SlabAllocator {
    /// Precomputes geometric size classes from `(chunk_size=S_0,
    /// factor=growth, item_size_max)`, stopping once a class's chunk size
    /// covers `item_size_max` plus header overhead (spec §4.2).
    pub fn new(chunk_size: u32, factor: f64, item_size_max: u32, max_bytes: u64) -> Self {
        const HEADER_OVERHEAD: usize = 64;
        let mut classes = Vec::new();
        let mut size = chunk_size as f64;
        let ceiling = item_size_max as usize + HEADER_OVERHEAD;
        let mut class_id: u8 = 0;
        loop {
            let chunk = size.ceil() as usize;
            classes.push(SlabClass::new(class_id, chunk));
            if chunk >= ceiling || class_id == u8::MAX {
                break;
            }
            size *= factor;
            class_id += 1;
        }
        SlabAllocator {
            classes,
            used_page_bytes: AtomicUsize::new(0),
            max_bytes,
        }
    }

    pub fn classes(&self) -> &[SlabClass] {
        &self.classes
    }

    pub fn class(&self, class_id: u8) -> &SlabClass {
        &self.classes[class_id as usize]
    }

    /// Returns the smallest class whose chunk size can hold `total_size`
    /// bytes (key + value), implementing invariant I3.
    pub fn class_for(&self, total_size: usize) -> Option<u8> {
        self.classes
            .iter()
            .find(|class| class.chunk_size >= total_size)
            .map(|class| class.class_id)
    }

    /// Reserves a free chunk in `class_id`: pop the free list, else grow by
    /// one page if the global budget allows, else fail with
    /// [`ChunkError::NoChunk`]. Blocks if the class lock is contended.
    pub fn acquire(&self, class_id: u8) -> Result<u32, ChunkError> {
        let class = &self.classes[class_id as usize];
        let mut inner = class.inner.lock();
        self.acquire_locked(class, &mut inner)
    }

    /// Same contract as [`Self::acquire`], but never blocks: if the class
    /// lock is currently held elsewhere, returns
    /// [`TryAcquireError::Contended`] instead of waiting. This is what lets
    /// the façade implement the `EWOULDBLOCK` contract (spec §4.5/§5) — "a
    /// contended lock it refuses to wait on" — rather than ever stalling a
    /// caller's thread on a class lock.
    pub fn try_acquire(&self, class_id: u8) -> Result<u32, TryAcquireError> {
        let class = &self.classes[class_id as usize];
        let mut inner = match class.inner.try_lock() {
            Some(guard) => guard,
            None => return Err(TryAcquireError::Contended),
        };
        self.acquire_locked(class, &mut inner)
            .map_err(|_| TryAcquireError::NoChunk)
    }

    fn acquire_locked(&self, class: &SlabClass, inner: &mut ClassInner) -> Result<u32, ChunkError> {
        if let Some(slot) = inner.free.pop() {
            return Ok(slot);
        }

        let page_bytes = class.chunk_size * class.slots_per_page;
        loop {
            let used = self.used_page_bytes.load(Ordering::Relaxed);
            let projected = used as u64 + page_bytes as u64;
            if projected > self.max_bytes {
                return Err(ChunkError::NoChunk);
            }
            if self
                .used_page_bytes
                .compare_exchange_weak(
                    used,
                    used + page_bytes,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }

        let base = inner.slots.len() as u32;
        inner.slots.resize_with(inner.slots.len() + class.slots_per_page, || None);
        for offset in 1..class.slots_per_page as u32 {
            inner.free.push(base + offset);
        }
        Ok(base)
    }

    /// Returns a chunk to its class's free list without touching the item
    /// stored there (used when a `store` replaces an item in place of an
    /// already-reserved slot that turned out unneeded).
    pub fn release_unused(&self, class_id: u8, slot: u32) {
        self.classes[class_id as usize].inner.lock().free.push(slot);
    }

    pub fn utilization(&self) -> Vec<ClassUtilization> {
        self.classes.iter().map(SlabClass::utilization).collect()
    }

    pub fn used_page_bytes(&self) -> u64 {
        self.used_page_bytes.load(Ordering::Relaxed) as u64
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &[u8], value: &[u8]) -> Item {
        Item {
            key: std::sync::Arc::from(key),
            value: std::sync::Arc::from(value),
            flags: 0,
            exptime: 0,
            cas: 1,
            refcount: 1,
            iflag: 0,
            class_id: 0,
            created_at: 0,
            last_bumped_at: 0,
        }
    }

    #[test]
    fn classes_cover_item_size_max() {
        let allocator = SlabAllocator::new(96, 1.25, 1024, 64 * 1024 * 1024);
        let last = allocator.classes().last().unwrap();
        assert!(last.chunk_size as u32 >= 1024);
    }

    #[test]
    fn class_for_picks_smallest_fit() {
        let allocator = SlabAllocator::new(96, 1.25, 1024, 64 * 1024 * 1024);
        let class_id = allocator.class_for(50).unwrap();
        assert_eq!(allocator.class(class_id).chunk_size, 96);
    }

    #[test]
    fn acquire_reuses_freed_slots() {
        let allocator = SlabAllocator::new(96, 1.25, 1024, 64 * 1024 * 1024);
        let slot = allocator.acquire(0).unwrap();
        allocator.class(0).put(slot, item(b"k", b"v"));
        allocator.class(0).vacate(slot);
        let slot2 = allocator.acquire(0).unwrap();
        assert_eq!(slot, slot2);
    }

    #[test]
    fn acquire_fails_past_budget() {
        let allocator = SlabAllocator::new(96, 1.25, 1024, SLAB_PAGE_SIZE as u64);
        allocator.acquire(0).unwrap();
        // First page reserved all of the tiny budget; class 1's page cannot fit.
        assert!(allocator.acquire(allocator.classes().len() as u8 - 1).is_err());
    }

    #[test]
    fn lru_scan_orders_from_tail() {
        let allocator = SlabAllocator::new(96, 1.25, 1024, 64 * 1024 * 1024);
        let a = allocator.acquire(0).unwrap();
        allocator.class(0).put(a, item(b"a", b"1"));
        let b = allocator.acquire(0).unwrap();
        allocator.class(0).put(b, item(b"b", b"1"));

        let mut seen = Vec::new();
        allocator.class(0).scan_from_lru(|slot, _item| {
            seen.push(slot);
            false
        });
        assert_eq!(seen, vec![a, b]);
    }

    #[test]
    fn bump_moves_to_mru() {
        let allocator = SlabAllocator::new(96, 1.25, 1024, 64 * 1024 * 1024);
        let a = allocator.acquire(0).unwrap();
        allocator.class(0).put(a, item(b"a", b"1"));
        let b = allocator.acquire(0).unwrap();
        allocator.class(0).put(b, item(b"b", b"1"));

        allocator.class(0).bump(a, 1000, 60);

        let mut seen = Vec::new();
        allocator.class(0).scan_from_lru(|slot, _item| {
            seen.push(slot);
            false
        });
        assert_eq!(seen, vec![b, a]);
    }

    #[test]
    fn bump_suppressed_within_window() {
        let allocator = SlabAllocator::new(96, 1.25, 1024, 64 * 1024 * 1024);
        let a = allocator.acquire(0).unwrap();
        allocator.class(0).put(a, item(b"a", b"1"));
        let b = allocator.acquire(0).unwrap();
        allocator.class(0).put(b, item(b"b", b"1"));

        allocator.class(0).bump(a, 5, 60);

        let mut seen = Vec::new();
        allocator.class(0).scan_from_lru(|slot, _item| {
            seen.push(slot);
            false
        });
        assert_eq!(seen, vec![a, b]);
    }
}
