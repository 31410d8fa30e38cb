//! # Item Header
//!
//! The unit of storage (spec §3). Items live inside a [`crate::slab`] class
//! arena and are referenced from the [`crate::table::ItemTable`] and from
//! their class's LRU chain by index, never by pointer — the same
//! arena-plus-indices resolution the teacher applies to its `Node` type,
//! generalized here to also carry the CAS stamp, reference count, and
//! internal flag bits a full engine façade needs.

use std::sync::Arc;

/// Low bit of `iflag`: the item is currently linked into the table and its
/// class's LRU chain.
pub const IFLAG_LINKED: u16 = 0x01;
/// Second bit of `iflag`: the item has been unlinked but is still referenced
/// (`refcount > 0`); physical free is deferred to the last `release`.
pub const IFLAG_DELETE_PENDING: u16 = 0x02;

/// A single stored key/value pair plus its engine-private bookkeeping.
#[derive(Debug, Clone)]
pub struct Item {
    pub key: Arc<[u8]>,
    pub value: Arc<[u8]>,
    pub flags: u32,
    /// Relative-time expiration, 0 = never.
    pub exptime: u32,
    pub cas: u64,
    pub refcount: u32,
    pub iflag: u16,
    pub class_id: u8,
    /// Relative time this item was created or last fully replaced (`SET`),
    /// used to evaluate the flush horizon.
    pub created_at: u32,
    /// Relative time this item was last bumped to MRU, used to suppress
    /// redundant LRU-chain churn (spec §4.4).
    pub last_bumped_at: u32,
}

impl Item {
    pub fn is_linked(&self) -> bool {
        self.iflag & IFLAG_LINKED != 0
    }

    pub fn set_linked(&mut self, linked: bool) {
        if linked {
            self.iflag |= IFLAG_LINKED;
        } else {
            self.iflag &= !IFLAG_LINKED;
        }
    }

    pub fn is_delete_pending(&self) -> bool {
        self.iflag & IFLAG_DELETE_PENDING != 0
    }

    pub fn set_delete_pending(&mut self, pending: bool) {
        if pending {
            self.iflag |= IFLAG_DELETE_PENDING;
        } else {
            self.iflag &= !IFLAG_DELETE_PENDING;
        }
    }

    /// True if `exptime` has passed relative to `now`. `exptime == 0` means
    /// never expires.
    pub fn is_expired(&self, now: u32) -> bool {
        self.exptime != 0 && self.exptime <= now
    }

    /// True if this item was created before `flush_horizon` and is
    /// therefore treated as absent (spec §3 "Global flush horizon").
    pub fn is_flushed(&self, flush_horizon: u32) -> bool {
        flush_horizon != 0 && self.created_at < flush_horizon
    }

    /// Total footprint (key + value bytes) used for slab-class selection
    /// (invariant I3) and capacity accounting. Does not include the
    /// in-memory `Item` struct overhead itself, which is uniform across
    /// items and therefore does not affect class assignment.
    pub fn footprint(&self) -> usize {
        self.key.len() + self.value.len()
    }
}
