//! # Engine Façade
//!
//! The versioned operation surface a network front-end drives (spec §4.5):
//! `create_instance` negotiates a version and hands back a handle; every
//! operation after that goes through [`EngineHandle`]. Ordinals that cross
//! the wire stay the `#[repr(u8)]` enums in `hkv_common`, the same
//! ABI-stability posture the teacher gives `IoctlHeader`/`IoctlCommand`
//! (explicit discriminants, `as_u8`/`from_u8` round-trip) even though the
//! wire carrier itself is out of scope here. Spec §9 sanctions modeling the
//! vtable as a trait/interface with a version tag rather than a raw C
//! vtable; `Engine`'s inherent methods play that role.
//!
//! ## Asynchronous completion
//!
//! Spec §4.5/§9 describes `EWOULDBLOCK` as a future/promise: the engine
//! defers work to a completion thread and the front-end re-drives the same
//! request, which must be idempotent. This implementation makes the
//! re-drive idempotent by caching the deferred result against the cookie
//! (spec §9's suggested resolution) rather than trusting any client-side
//! replay state. `allocate` is the representative suspension point wired
//! end-to-end here: it is the one call whose reservation has no side
//! effects to roll back if retried, making it the cleanest place to
//! demonstrate the full contract; `store`/`arithmetic`/`get` reuse the same
//! `try_*` + bounded-blocking-retry pattern at their own lock-acquisition
//! points (see `commit_concat_locked`) but do not all get a second cookie cache,
//! noted as a scope decision in `DESIGN.md`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use ahash::RandomState;
use hashbrown::HashMap as ShardMap;
use parking_lot::{Mutex, RwLock};

use hkv_common::{EngineConfig, HkvError, HkvResult, Status, StoreOperation};

use crate::clock::{Clock, TickerHandle};
use crate::eviction::{EvictError, Evictor};
use crate::item::Item;
use crate::notify::{CompletionWorker, NotifyIoComplete, PendingJob};
use crate::slab::{ChunkError, SlabAllocator, TryAcquireError};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::table::{ItemLoc, ItemTable};

/// Highest operation-table version this build implements.
pub const SUPPORTED_VERSION: u32 = 1;

/// Suppresses redundant LRU bumps within this many relative-time seconds of
/// the previous bump on the same item (spec §4.4).
const BUMP_SUPPRESS_WINDOW: u32 = 60;

/// Bounded number of reclaim attempts before a capacity request surfaces
/// `ENOMEM` (spec §4.2 "after a bounded number of reclamation attempts").
const MAX_RECLAIM_ATTEMPTS: usize = 8;

/// Opaque front-end request identifier (spec §9: "model it as an
/// identifier... into a front-end-owned table"). The engine only stores and
/// returns it, never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(pub u64);

/// Front-end callback invoked once per emitted stat line.
pub type AddStat = Arc<dyn Fn(&[u8], &[u8]) + Send + Sync>;
/// Front-end callback invoked once per `unknown_command` response packet.
pub type AddResponse = Arc<dyn Fn(&AddResponseArgs) + Send + Sync>;

/// Shape of one `add_response` packet, mirroring the binary-protocol fields
/// named in spec §6.
#[derive(Debug, Clone)]
pub struct AddResponseArgs {
    pub key: Vec<u8>,
    pub ext: Vec<u8>,
    pub body: Vec<u8>,
    pub datatype: u8,
    pub status: Status,
    pub cas: u64,
}

/// Callbacks the front-end supplies once at `initialize()` time (spec §6).
/// The real per-call front-end that would otherwise pass `add_stat`/
/// `add_response` as call arguments is out of scope; registering them once
/// keeps the call signatures Rust-ergonomic without losing the contract.
#[derive(Clone)]
pub struct EngineCallbacks {
    pub notify_io_complete: NotifyIoComplete,
    pub add_stat: AddStat,
    pub add_response: AddResponse,
}

/// A reserved, detached item returned by [`Engine::allocate`]. The caller
/// fills [`AllocatedItem::value_mut`] and then passes it to
/// [`Engine::store`]. Dropping an `AllocatedItem` without storing it
/// releases its reserved chunk automatically.
pub struct AllocatedItem {
    pub key: Arc<[u8]>,
    value: Vec<u8>,
    pub flags: u32,
    pub exptime: u32,
    class_id: u8,
    slot: u32,
    slabs: Arc<SlabAllocator>,
    committed: bool,
}

impl AllocatedItem {
    pub fn value_mut(&mut self) -> &mut [u8] {
        &mut self.value
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

impl Drop for AllocatedItem {
    fn drop(&mut self) {
        if !self.committed {
            self.slabs.release_unused(self.class_id, self.slot);
        }
    }
}

/// A live item handle returned by [`Engine::get`]. Holds one reference
/// count until passed to [`Engine::release`].
pub struct RetrievedItem {
    pub key: Arc<[u8]>,
    pub value: Arc<[u8]>,
    pub flags: u32,
    pub cas: u64,
    class_id: u8,
    slot: u32,
}

/// Result of a successful `arithmetic` call.
#[derive(Debug, Clone, Copy)]
pub struct ArithmeticOutcome {
    pub value: u64,
    pub cas: u64,
}

struct EngineState {
    clock: Arc<Clock>,
    ticker: TickerHandle,
    slabs: Arc<SlabAllocator>,
    table: Arc<ItemTable>,
    evictor: Evictor,
    stats: Arc<EngineStats>,
    cas_counter: AtomicU64,
    flush_horizon: AtomicU32,
    config: EngineConfig,
    callbacks: EngineCallbacks,
    completion: CompletionWorker,
}

impl EngineState {
    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// The storage engine core. Constructed uninitialized by
/// [`create_instance`]; [`Engine::initialize`] brings it live.
pub struct Engine {
    state: RwLock<Option<EngineState>>,
    pending_allocations: Mutex<HashMap<u64, HkvResult<AllocatedItem>>>,
    self_ref: Weak<Engine>,
}

/// A negotiated handle to an [`Engine`]. `version` is the first field per
/// spec §4.5/§9 ("the caller obtains a handle whose first field is the
/// negotiated version").
pub struct EngineHandle {
    pub version: u32,
    inner: Arc<Engine>,
}

impl std::ops::Deref for EngineHandle {
    type Target = Engine;
    fn deref(&self) -> &Engine {
        &self.inner
    }
}

/// Negotiates `version = min(max_version, SUPPORTED_VERSION)` and returns an
/// uninitialized handle. `Engine::initialize` must be called exactly once
/// before any other operation.
pub fn create_instance(max_version: u32) -> HkvResult<EngineHandle> {
    let version = max_version.min(SUPPORTED_VERSION);
    let inner = Arc::new_cyclic(|weak| Engine {
        state: RwLock::new(None),
        pending_allocations: Mutex::new(HashMap::new()),
        self_ref: weak.clone(),
    });
    Ok(EngineHandle { version, inner })
}

impl Engine {
    fn with_state<R>(&self, f: impl FnOnce(&EngineState) -> HkvResult<R>) -> HkvResult<R> {
        let guard = self.state.read();
        match guard.as_ref() {
            Some(state) => f(state),
            None => Err(HkvError::Failed {
                reason: "engine not initialized".to_string(),
            }),
        }
    }

    /// Parses `config_str` (spec §6 grammar) and brings the engine live.
    /// Fails `EINVAL` on malformed config; must be called exactly once.
    pub fn initialize(&self, config_str: &str, callbacks: EngineCallbacks) -> HkvResult<()> {
        let mut guard = self.state.write();
        if guard.is_some() {
            return Err(HkvError::Failed {
                reason: "engine already initialized".to_string(),
            });
        }

        let config = EngineConfig::parse(config_str)?;
        let clock = Arc::new(Clock::new());
        let ticker = clock.start_ticker();
        let slabs = Arc::new(SlabAllocator::new(
            config.chunk_size,
            config.factor,
            config.item_size_max,
            config.cache_size,
        ));
        let table = Arc::new(ItemTable::new());
        let stats = Arc::new(EngineStats::new());
        let evictor = Evictor::new(Arc::clone(&slabs), Arc::clone(&table), Arc::clone(&stats));
        let completion = CompletionWorker::start(Arc::clone(&callbacks.notify_io_complete));

        *guard = Some(EngineState {
            clock,
            ticker,
            slabs,
            table,
            evictor,
            stats,
            cas_counter: AtomicU64::new(0),
            flush_horizon: AtomicU32::new(0),
            config,
            callbacks,
            completion,
        });
        Ok(())
    }

    /// Releases all memory and stops background ticking. No other
    /// operation is valid afterward.
    pub fn destroy(&self) -> HkvResult<()> {
        let mut guard = self.state.write();
        match guard.take() {
            Some(state) => {
                state.ticker.stop();
                state.completion.stop();
                Ok(())
            }
            None => Err(HkvError::Failed {
                reason: "engine not initialized".to_string(),
            }),
        }
    }

    /// Static, NUL-free identifier string.
    pub fn get_info(&self) -> &'static str {
        "hkv-engine storage core, interface version 1"
    }

    fn acquire_with_eviction(&self, state: &EngineState, class_id: u8, now: u32) -> HkvResult<u32> {
        for _ in 0..MAX_RECLAIM_ATTEMPTS {
            match state.slabs.acquire(class_id) {
                Ok(slot) => return Ok(slot),
                Err(ChunkError::NoChunk) => {
                    if !state.config.eviction {
                        return Err(HkvError::OutOfMemory);
                    }
                    match state.evictor.reclaim(class_id, now) {
                        Ok(()) => continue,
                        Err(EvictError::NoVictim) => return Err(HkvError::OutOfMemory),
                    }
                }
            }
        }
        Err(HkvError::OutOfMemory)
    }

    fn take_pending_allocate(&self, cookie: Cookie) -> Option<HkvResult<AllocatedItem>> {
        self.pending_allocations.lock().remove(&cookie.0)
    }

    /// Reserves a detached item large enough for `key` plus `nbytes` of
    /// value. Fails `E2BIG`/`EINVAL` synchronously on oversized input.
    /// May return `EWOULDBLOCK` if the owning class's lock is contended; the
    /// caller must re-invoke with the *same* cookie once notified, at which
    /// point the cached result is returned.
    pub fn allocate(
        &self,
        cookie: Cookie,
        key: &[u8],
        nbytes: usize,
        flags: u32,
        exptime_input: u32,
    ) -> HkvResult<AllocatedItem> {
        if let Some(outcome) = self.take_pending_allocate(cookie) {
            return outcome;
        }

        self.with_state(|state| {
            if key.is_empty() || key.len() > hkv_common::KEY_MAX {
                return Err(HkvError::KeyTooLong {
                    len: key.len(),
                    max: hkv_common::KEY_MAX,
                });
            }
            if nbytes > state.config.item_size_max as usize {
                return Err(HkvError::ValueTooLarge {
                    len: nbytes,
                    max: state.config.item_size_max as usize,
                });
            }
            let total = key.len() + nbytes;
            let class_id = state.slabs.class_for(total).ok_or(HkvError::ValueTooLarge {
                len: nbytes,
                max: state.config.item_size_max as usize,
            })?;
            let now = state.clock.now();
            let exptime = state.clock.realtime(exptime_input);
            let key_owned: Arc<[u8]> = Arc::from(key);

            match state.slabs.try_acquire(class_id) {
                Ok(slot) => Ok(AllocatedItem {
                    key: key_owned,
                    value: vec![0u8; nbytes],
                    flags,
                    exptime,
                    class_id,
                    slot,
                    slabs: Arc::clone(&state.slabs),
                    committed: false,
                }),
                Err(TryAcquireError::NoChunk) => {
                    let slot = self.acquire_with_eviction(state, class_id, now)?;
                    Ok(AllocatedItem {
                        key: key_owned,
                        value: vec![0u8; nbytes],
                        flags,
                        exptime,
                        class_id,
                        slot,
                        slabs: Arc::clone(&state.slabs),
                        committed: false,
                    })
                }
                Err(TryAcquireError::Contended) => {
                    self.defer_allocate(state, cookie, key_owned, nbytes, flags, exptime, class_id, now);
                    Err(HkvError::WouldBlock)
                }
            }
        })
    }

    fn defer_allocate(
        &self,
        state: &EngineState,
        cookie: Cookie,
        key: Arc<[u8]>,
        nbytes: usize,
        flags: u32,
        exptime: u32,
        class_id: u8,
        now: u32,
    ) {
        let engine = match self.self_ref.upgrade() {
            Some(engine) => engine,
            None => return,
        };
        let slabs = Arc::clone(&state.slabs);
        let evictor_slabs = Arc::clone(&state.slabs);
        let table = Arc::clone(&state.table);
        let stats = Arc::clone(&state.stats);
        let eviction_enabled = state.config.eviction;

        let retry = Box::new(move || {
            let evictor = Evictor::new(evictor_slabs, table, stats);
            let mut status = Status::Enomem;
            for _ in 0..MAX_RECLAIM_ATTEMPTS {
                match slabs.acquire(class_id) {
                    Ok(slot) => {
                        let allocated = AllocatedItem {
                            key: Arc::clone(&key),
                            value: vec![0u8; nbytes],
                            flags,
                            exptime,
                            class_id,
                            slot,
                            slabs: Arc::clone(&slabs),
                            committed: false,
                        };
                        engine
                            .pending_allocations
                            .lock()
                            .insert(cookie.0, Ok(allocated));
                        status = Status::Success;
                        break;
                    }
                    Err(ChunkError::NoChunk) => {
                        if !eviction_enabled || evictor.reclaim(class_id, now).is_err() {
                            engine
                                .pending_allocations
                                .lock()
                                .insert(cookie.0, Err(HkvError::OutOfMemory));
                            status = Status::Enomem;
                            break;
                        }
                    }
                }
            }
            status
        });

        state.completion.submit(PendingJob { cookie, retry });
    }

    /// Commits a reserved item under one of the six `StoreOperation`
    /// semantics (spec §4.5). On success the global CAS counter advances
    /// and the new version is returned.
    ///
    /// The entire existing-item check plus relink runs inside one
    /// [`crate::table::ItemTable::with_locked`] critical section on the
    /// key's shard. Without that, two threads racing `CAS`/`ADD` on the
    /// same key could both read the same "absent" or "cas matches" snapshot
    /// before either commits, and both would then succeed — violating
    /// ADD exclusivity and CAS linearisability. Holding the shard lock for
    /// the full check-then-act closes that window; it does not change the
    /// documented table-then-class lock order, since the class lock is
    /// still acquired only after (nested within) the shard lock.
    pub fn store(
        &self,
        _cookie: Cookie,
        mut allocated: AllocatedItem,
        cas_in: u64,
        operation: StoreOperation,
    ) -> HkvResult<u64> {
        let started = Instant::now();
        self.with_state(|state| {
            let now = state.clock.now();
            let flush_horizon = state.flush_horizon.load(Ordering::Acquire);
            let key = Arc::clone(&allocated.key);

            let result = state.table.with_locked(&key, |shard| {
                let existing_loc = shard.get(&key[..]).copied();
                let existing_live = existing_loc.map(|loc| {
                    let item = state.slabs.class(loc.class_id).get(loc.slot);
                    let live = !item.is_expired(now) && !item.is_flushed(flush_horizon);
                    (loc, item, live)
                });

                match operation {
                    StoreOperation::Add => {
                        if matches!(&existing_live, Some((_, _, true))) {
                            Err(HkvError::NotStored)
                        } else {
                            Ok(self.commit_replace_locked(state, shard, &mut allocated, existing_loc, now))
                        }
                    }
                    StoreOperation::Set => {
                        Ok(self.commit_replace_locked(state, shard, &mut allocated, existing_loc, now))
                    }
                    StoreOperation::Replace => {
                        if matches!(&existing_live, Some((_, _, true))) {
                            Ok(self.commit_replace_locked(state, shard, &mut allocated, existing_loc, now))
                        } else {
                            Err(HkvError::NotStored)
                        }
                    }
                    StoreOperation::Cas => match &existing_live {
                        None => {
                            state.stats.record_cas(false);
                            Err(HkvError::KeyNotFound)
                        }
                        Some((_, _, false)) => {
                            state.stats.record_cas(false);
                            Err(HkvError::KeyNotFound)
                        }
                        Some((_, item, true)) if item.cas != cas_in => {
                            state.stats.record_cas_badval();
                            Err(HkvError::CasMismatch)
                        }
                        Some(_) => {
                            let cas = self.commit_replace_locked(state, shard, &mut allocated, existing_loc, now);
                            state.stats.record_cas(true);
                            Ok(cas)
                        }
                    },
                    StoreOperation::Append | StoreOperation::Prepend => match existing_live {
                        Some((loc, item, true)) => {
                            self.commit_concat_locked(state, shard, &mut allocated, loc, item, operation, now)
                        }
                        _ => Err(HkvError::NotStored),
                    },
                }
            });

            if result.is_ok() {
                state.stats.record_store(started.elapsed());
            }
            result
        })
    }

    fn commit_replace_locked(
        &self,
        state: &EngineState,
        shard: &mut ShardMap<Arc<[u8]>, ItemLoc, RandomState>,
        allocated: &mut AllocatedItem,
        existing: Option<ItemLoc>,
        now: u32,
    ) -> u64 {
        let cas = state.next_cas();
        let value: Arc<[u8]> = Arc::from(allocated.value.as_slice());
        let item = Item {
            key: Arc::clone(&allocated.key),
            value,
            flags: allocated.flags,
            exptime: allocated.exptime,
            cas,
            refcount: 1,
            iflag: crate::item::IFLAG_LINKED,
            class_id: allocated.class_id,
            created_at: now,
            last_bumped_at: now,
        };
        let new_size = item.footprint() as u64;
        let new_loc = ItemLoc {
            class_id: allocated.class_id,
            slot: allocated.slot,
        };
        state.slabs.class(allocated.class_id).put(allocated.slot, item);
        shard.insert(Arc::clone(&allocated.key), new_loc);
        allocated.committed = true;

        if let Some(old_loc) = existing {
            if old_loc != new_loc {
                let old_class = state.slabs.class(old_loc.class_id);
                let old_size = old_class.get(old_loc.slot).footprint() as u64;
                old_class.vacate(old_loc.slot);
                state.stats.item_unlinked(old_size);
            }
        }
        state.stats.item_linked(new_size);
        cas
    }

    fn commit_concat_locked(
        &self,
        state: &EngineState,
        shard: &mut ShardMap<Arc<[u8]>, ItemLoc, RandomState>,
        allocated: &mut AllocatedItem,
        old_loc: ItemLoc,
        old_item: Item,
        operation: StoreOperation,
        now: u32,
    ) -> HkvResult<u64> {
        let combined: Vec<u8> = match operation {
            StoreOperation::Append => {
                let mut v = old_item.value.to_vec();
                v.extend_from_slice(&allocated.value);
                v
            }
            StoreOperation::Prepend => {
                let mut v = allocated.value.clone();
                v.extend_from_slice(&old_item.value);
                v
            }
            _ => unreachable!("commit_concat_locked only handles APPEND/PREPEND"),
        };

        // The fragment's own slot was sized for just the appended bytes,
        // not the concatenated total; give it back unused and carve a fresh
        // chunk of the class that actually fits (spec §4.5: "a fresh item
        // of the correct class").
        state.slabs.release_unused(allocated.class_id, allocated.slot);
        allocated.committed = true;

        let total = allocated.key.len() + combined.len();
        let class_id = state.slabs.class_for(total).ok_or(HkvError::ValueTooLarge {
            len: combined.len(),
            max: state.config.item_size_max as usize,
        })?;
        let slot = self.acquire_with_eviction(state, class_id, now)?;

        let cas = state.next_cas();
        let item = Item {
            key: Arc::clone(&allocated.key),
            value: Arc::from(combined.as_slice()),
            flags: old_item.flags,
            exptime: old_item.exptime,
            cas,
            refcount: 1,
            iflag: crate::item::IFLAG_LINKED,
            class_id,
            created_at: old_item.created_at,
            last_bumped_at: now,
        };
        let new_size = item.footprint() as u64;
        state.slabs.class(class_id).put(slot, item);
        shard.insert(Arc::clone(&allocated.key), ItemLoc { class_id, slot });

        let old_class = state.slabs.class(old_loc.class_id);
        let old_size = old_item.footprint() as u64;
        old_class.vacate(old_loc.slot);

        state.stats.item_unlinked(old_size);
        state.stats.item_linked(new_size);
        Ok(cas)
    }

    /// Looks up a live item, increments its refcount, and returns it.
    /// Lazily reaps the item if it is expired or flushed.
    pub fn get(&self, _cookie: Cookie, key: &[u8]) -> HkvResult<RetrievedItem> {
        self.with_state(|state| {
            let now = state.clock.now();
            let flush_horizon = state.flush_horizon.load(Ordering::Acquire);
            let loc = state.table.lookup(key).ok_or(HkvError::KeyNotFound)?;
            let class = state.slabs.class(loc.class_id);

            enum Outcome {
                Hit(RetrievedItem),
                Stale { expired: bool },
            }

            let outcome = {
                let mut outcome = None;
                class.with_item_mut(loc.slot, |item| {
                    if item.is_expired(now) || item.is_flushed(flush_horizon) {
                        outcome = Some(Outcome::Stale {
                            expired: item.is_expired(now),
                        });
                    } else {
                        item.refcount += 1;
                        outcome = Some(Outcome::Hit(RetrievedItem {
                            key: Arc::clone(&item.key),
                            value: Arc::clone(&item.value),
                            flags: item.flags,
                            cas: item.cas,
                            class_id: loc.class_id,
                            slot: loc.slot,
                        }));
                    }
                });
                outcome.expect("with_item_mut always sets outcome")
            };

            match outcome {
                Outcome::Hit(retrieved) => {
                    class.bump(loc.slot, now, BUMP_SUPPRESS_WINDOW);
                    state.stats.record_get(true);
                    Ok(retrieved)
                }
                Outcome::Stale { expired } => {
                    state.table.unlink(key);
                    let size = class.get(loc.slot).footprint() as u64;
                    class.vacate(loc.slot);
                    state.stats.record_get(false);
                    if expired {
                        state.stats.record_expired_reap(size);
                    } else {
                        state.stats.item_unlinked(size);
                    }
                    Err(HkvError::KeyNotFound)
                }
            }
        })
    }

    /// Decrements `refcount`; frees the chunk if it reaches zero on an
    /// already-unlinked item.
    pub fn release(&self, item: RetrievedItem) -> HkvResult<()> {
        self.with_state(|state| {
            let class = state.slabs.class(item.class_id);
            let mut should_vacate = false;
            class.with_item_mut(item.slot, |stored| {
                stored.refcount = stored.refcount.saturating_sub(1);
                if stored.refcount == 0 && stored.is_delete_pending() {
                    should_vacate = true;
                }
            });
            if should_vacate {
                class.vacate(item.slot);
            }
            Ok(())
        })
    }

    /// Unlinks `key`. Physical free is deferred until `refcount` drops to
    /// zero.
    pub fn remove(&self, _cookie: Cookie, key: &[u8]) -> HkvResult<()> {
        self.with_state(|state| {
            let loc = state.table.unlink(key).ok_or(HkvError::KeyNotFound)?;
            let class = state.slabs.class(loc.class_id);
            let mut free_now = false;
            let mut size = 0u64;
            class.with_item_mut(loc.slot, |item| {
                item.set_linked(false);
                size = item.footprint() as u64;
                if item.refcount == 0 {
                    free_now = true;
                } else {
                    item.set_delete_pending(true);
                }
            });
            if free_now {
                class.vacate(loc.slot);
            }
            state.stats.item_unlinked(size);
            Ok(())
        })
    }

    /// Atomically reads, parses, and rewrites a key's value as an
    /// ASCII-encoded unsigned 64-bit integer (spec §4.5). `create` controls
    /// whether an absent key is seeded with `initial`.
    #[allow(clippy::too_many_arguments)]
    pub fn arithmetic(
        &self,
        _cookie: Cookie,
        key: &[u8],
        increment: bool,
        create: bool,
        delta: u64,
        initial: u64,
        exptime_input: u32,
    ) -> HkvResult<ArithmeticOutcome> {
        self.with_state(|state| {
            let now = state.clock.now();
            let flush_horizon = state.flush_horizon.load(Ordering::Acquire);

            enum Existing {
                Settled(HkvResult<ArithmeticOutcome>),
                Stale { size: u64, expired: bool },
            }

            let existing = state.table.lookup(key).map(|loc| {
                let class = state.slabs.class(loc.class_id);
                let mut result: Option<Existing> = None;
                class.with_item_mut(loc.slot, |item| {
                    if item.is_expired(now) || item.is_flushed(flush_horizon) {
                        result = Some(Existing::Stale {
                            size: item.footprint() as u64,
                            expired: item.is_expired(now),
                        });
                        return;
                    }
                    let current = match std::str::from_utf8(&item.value)
                        .ok()
                        .and_then(|s| s.trim().parse::<u64>().ok())
                    {
                        Some(v) => v,
                        None => {
                            result = Some(Existing::Settled(Err(HkvError::NotANumber)));
                            return;
                        }
                    };
                    let new_value = if increment {
                        current.wrapping_add(delta)
                    } else {
                        current.saturating_sub(delta)
                    };
                    let rendered = new_value.to_string().into_bytes();
                    let old_size = item.footprint() as u64;
                    item.value = Arc::from(rendered.as_slice());
                    let cas = state.next_cas();
                    item.cas = cas;
                    state.stats.bytes_delta(old_size, item.footprint() as u64);
                    result = Some(Existing::Settled(Ok(ArithmeticOutcome { value: new_value, cas })));
                });
                (loc, result.expect("with_item_mut always sets outcome"))
            });

            match existing {
                Some((_, Existing::Settled(outcome))) => outcome,
                Some((loc, Existing::Stale { size, expired })) => {
                    state.table.unlink(key);
                    state.slabs.class(loc.class_id).vacate(loc.slot);
                    if expired {
                        state.stats.record_expired_reap(size);
                    } else {
                        state.stats.item_unlinked(size);
                    }
                    if create {
                        self.create_arithmetic_seed(state, key, initial, exptime_input, now)
                    } else {
                        Err(HkvError::KeyNotFound)
                    }
                }
                None => {
                    if !create {
                        return Err(HkvError::KeyNotFound);
                    }
                    self.create_arithmetic_seed(state, key, initial, exptime_input, now)
                }
            }
        })
    }

    /// Creates a fresh item seeded with `initial` for `arithmetic` when the
    /// key was absent, or was found but stale and has just been reaped
    /// (spec §4.5: an expired/flushed item is absent for this purpose, and
    /// memcached's `add_delta` reaps-then-creates in the same situation).
    fn create_arithmetic_seed(
        &self,
        state: &EngineState,
        key: &[u8],
        initial: u64,
        exptime_input: u32,
        now: u32,
    ) -> HkvResult<ArithmeticOutcome> {
        let rendered = initial.to_string().into_bytes();
        let total = key.len() + rendered.len();
        let class_id = state.slabs.class_for(total).ok_or(HkvError::ValueTooLarge {
            len: rendered.len(),
            max: state.config.item_size_max as usize,
        })?;
        let slot = self.acquire_with_eviction(state, class_id, now)?;
        let cas = state.next_cas();
        let exptime = state.clock.realtime(exptime_input);
        let key_owned: Arc<[u8]> = Arc::from(key);
        let item = Item {
            key: Arc::clone(&key_owned),
            value: Arc::from(rendered.as_slice()),
            flags: 0,
            exptime,
            cas,
            refcount: 0,
            iflag: crate::item::IFLAG_LINKED,
            class_id,
            created_at: now,
            last_bumped_at: now,
        };
        let size = item.footprint() as u64;
        state.slabs.class(class_id).put(slot, item);
        state.table.link(key_owned, ItemLoc { class_id, slot });
        state.stats.item_linked(size);
        Ok(ArithmeticOutcome { value: initial, cas })
    }

    /// Schedules a flush: immediate when `when == 0`, otherwise at relative
    /// time `when`. Existing items created before the horizon are treated
    /// as absent.
    pub fn flush(&self, _cookie: Cookie, when: u32) -> HkvResult<()> {
        self.with_state(|state| {
            let horizon = if when == 0 {
                state.clock.now()
            } else {
                state.clock.realtime(when)
            };
            state.flush_horizon.store(horizon, Ordering::Release);
            Ok(())
        })
    }

    /// Emits statistics via the registered `add_stat` callback. The empty
    /// key emits the general stat set; `slabs`/`items`/`sizes`/`reset` are
    /// recognized sub-keys (spec §4.5).
    pub fn get_stats(&self, _cookie: Cookie, stat_key: &[u8]) -> HkvResult<()> {
        self.with_state(|state| {
            let add_stat = &state.callbacks.add_stat;
            match stat_key {
                b"" => emit_general_stats(add_stat, &state.stats.snapshot(), state.clock.now()),
                b"slabs" => {
                    for util in state.slabs.utilization() {
                        let key = format!("class_{}", util.class_id);
                        let value = format!(
                            "chunk_size={} total={} free={} used={}",
                            util.chunk_size, util.total_slots, util.free_slots, util.used_slots
                        );
                        add_stat(key.as_bytes(), value.as_bytes());
                    }
                }
                b"items" => {
                    add_stat(b"curr_items", state.stats.curr_items().to_string().as_bytes());
                }
                b"sizes" => {
                    for util in state.slabs.utilization() {
                        add_stat(
                            util.chunk_size.to_string().as_bytes(),
                            util.used_slots.to_string().as_bytes(),
                        );
                    }
                }
                b"reset" => state.stats.reset(),
                _ => return Err(HkvError::Unsupported),
            }
            Ok(())
        })
    }

    /// Zeroes cumulative counters.
    pub fn reset_stats(&self) -> HkvResult<()> {
        self.with_state(|state| {
            state.stats.reset();
            Ok(())
        })
    }

    /// Engine-specific extension point (spec §4.5). This build recognizes
    /// no extensions, so every call is answered `ENOTSUP` through
    /// `add_response`.
    pub fn unknown_command(&self, _cookie: Cookie, _request_header: &[u8]) -> HkvResult<()> {
        self.with_state(|state| {
            (state.callbacks.add_response)(&AddResponseArgs {
                key: Vec::new(),
                ext: Vec::new(),
                body: Vec::new(),
                datatype: 0,
                status: Status::Enotsup,
                cas: 0,
            });
            Err(HkvError::Unsupported)
        })
    }
}

fn emit_general_stats(add_stat: &AddStat, snap: &EngineStatsSnapshot, uptime: u32) {
    add_stat(b"uptime", uptime.to_string().as_bytes());
    add_stat(b"cmd_get", snap.cmd_get.to_string().as_bytes());
    add_stat(b"cmd_set", snap.cmd_set.to_string().as_bytes());
    add_stat(b"get_hits", snap.get_hits.to_string().as_bytes());
    add_stat(b"get_misses", snap.get_misses.to_string().as_bytes());
    add_stat(b"curr_items", snap.curr_items.to_string().as_bytes());
    add_stat(b"total_items", snap.total_items.to_string().as_bytes());
    add_stat(b"evictions", snap.evictions.to_string().as_bytes());
    add_stat(b"expired_unfetched", snap.expired_unfetched.to_string().as_bytes());
    add_stat(b"reclaimed", snap.reclaimed.to_string().as_bytes());
    add_stat(b"cas_hits", snap.cas_hits.to_string().as_bytes());
    add_stat(b"cas_misses", snap.cas_misses.to_string().as_bytes());
    add_stat(b"cas_badval", snap.cas_badval.to_string().as_bytes());
    add_stat(b"bytes", snap.bytes.to_string().as_bytes());
    add_stat(b"store_latency_samples", snap.store_latency.samples.to_string().as_bytes());
    let mean_us = if snap.store_latency.samples > 0 {
        snap.store_latency.sum_us / snap.store_latency.samples
    } else {
        0
    };
    add_stat(b"store_latency_mean_us", mean_us.to_string().as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestAtomicU64;

    fn test_callbacks() -> (EngineCallbacks, Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_clone = Arc::clone(&captured);
        let callbacks = EngineCallbacks {
            notify_io_complete: Arc::new(|_cookie, _status| {}),
            add_stat: Arc::new(move |k, v| captured_clone.lock().push((k.to_vec(), v.to_vec()))),
            add_response: Arc::new(|_args| {}),
        };
        (callbacks, captured)
    }

    fn engine() -> EngineHandle {
        let handle = create_instance(1).unwrap();
        let (callbacks, _) = test_callbacks();
        handle.initialize("cache_size=8388608", callbacks).unwrap();
        handle
    }

    #[test]
    fn negotiates_supported_version() {
        let handle = create_instance(99).unwrap();
        assert_eq!(handle.version, SUPPORTED_VERSION);
    }

    #[test]
    fn set_then_get_round_trips() {
        let engine = engine();
        let mut allocated = engine.allocate(Cookie(1), b"foo", 3, 7, 0).unwrap();
        allocated.value_mut().copy_from_slice(b"bar");
        let cas = engine.store(Cookie(1), allocated, 0, StoreOperation::Set).unwrap();
        assert_ne!(cas, 0);

        let retrieved = engine.get(Cookie(1), b"foo").unwrap();
        assert_eq!(&*retrieved.value, b"bar");
        assert_eq!(retrieved.flags, 7);
        assert_eq!(retrieved.cas, cas);
        engine.release(retrieved).unwrap();
    }

    #[test]
    fn add_fails_when_key_already_present() {
        let engine = engine();
        let mut a = engine.allocate(Cookie(1), b"k", 1, 0, 0).unwrap();
        a.value_mut().copy_from_slice(b"1");
        engine.store(Cookie(1), a, 0, StoreOperation::Add).unwrap();

        let mut b = engine.allocate(Cookie(2), b"k", 1, 0, 0).unwrap();
        b.value_mut().copy_from_slice(b"2");
        let err = engine.store(Cookie(2), b, 0, StoreOperation::Add).unwrap_err();
        assert_eq!(err, HkvError::NotStored);
    }

    #[test]
    fn cas_mismatch_reports_key_exists_status() {
        let engine = engine();
        let mut a = engine.allocate(Cookie(1), b"k", 1, 0, 0).unwrap();
        a.value_mut().copy_from_slice(b"1");
        let cas = engine.store(Cookie(1), a, 0, StoreOperation::Set).unwrap();

        let mut b = engine.allocate(Cookie(2), b"k", 1, 0, 0).unwrap();
        b.value_mut().copy_from_slice(b"2");
        let err = engine
            .store(Cookie(2), b, cas.wrapping_add(1), StoreOperation::Cas)
            .unwrap_err();
        assert_eq!(err.status(), Status::KeyEexists);
    }

    #[test]
    fn append_concatenates_values() {
        let engine = engine();
        let mut a = engine.allocate(Cookie(1), b"k", 3, 0, 0).unwrap();
        a.value_mut().copy_from_slice(b"abc");
        engine.store(Cookie(1), a, 0, StoreOperation::Set).unwrap();

        let mut suffix = engine.allocate(Cookie(2), b"k", 2, 0, 0).unwrap();
        suffix.value_mut().copy_from_slice(b"de");
        engine.store(Cookie(2), suffix, 0, StoreOperation::Append).unwrap();

        let retrieved = engine.get(Cookie(3), b"k").unwrap();
        assert_eq!(&*retrieved.value, b"abcde");
        engine.release(retrieved).unwrap();
    }

    #[test]
    fn arithmetic_increments_existing_number() {
        let engine = engine();
        let mut a = engine.allocate(Cookie(1), b"n", 2, 0, 0).unwrap();
        a.value_mut().copy_from_slice(b"10");
        engine.store(Cookie(1), a, 0, StoreOperation::Set).unwrap();

        let outcome = engine.arithmetic(Cookie(2), b"n", true, false, 5, 0, 0).unwrap();
        assert_eq!(outcome.value, 15);
    }

    #[test]
    fn arithmetic_creates_when_absent() {
        let engine = engine();
        let outcome = engine.arithmetic(Cookie(1), b"missing", true, true, 5, 100, 0).unwrap();
        assert_eq!(outcome.value, 100);
    }

    #[test]
    fn expired_item_returns_key_enoent() {
        let engine = engine();
        let mut a = engine.allocate(Cookie(1), b"k", 1, 0, 1).unwrap();
        a.value_mut().copy_from_slice(b"v");
        engine.store(Cookie(1), a, 0, StoreOperation::Set).unwrap();

        // exptime=1 is interpreted as "1 second from now"; advance the
        // clock past it without a real sleep.
        engine.with_state(|state| {
            state.clock.tick();
            state.clock.tick();
            Ok(())
        }).unwrap();

        let err = engine.get(Cookie(2), b"k").unwrap_err();
        assert_eq!(err, HkvError::KeyNotFound);
    }

    #[test]
    fn flush_hides_prior_keys() {
        let engine = engine();
        let mut a = engine.allocate(Cookie(1), b"k", 1, 0, 0).unwrap();
        a.value_mut().copy_from_slice(b"v");
        engine.store(Cookie(1), a, 0, StoreOperation::Set).unwrap();

        engine.with_state(|state| { state.clock.tick(); Ok(()) }).unwrap();
        engine.flush(Cookie(2), 0).unwrap();

        let err = engine.get(Cookie(3), b"k").unwrap_err();
        assert_eq!(err, HkvError::KeyNotFound);
    }

    #[test]
    fn remove_then_get_reports_enoent() {
        let engine = engine();
        let mut a = engine.allocate(Cookie(1), b"k", 1, 0, 0).unwrap();
        a.value_mut().copy_from_slice(b"v");
        engine.store(Cookie(1), a, 0, StoreOperation::Set).unwrap();
        engine.remove(Cookie(2), b"k").unwrap();
        assert_eq!(engine.get(Cookie(3), b"k").unwrap_err(), HkvError::KeyNotFound);
    }

    #[test]
    fn get_stats_emits_general_set() {
        let handle = create_instance(1).unwrap();
        let (callbacks, captured) = test_callbacks();
        handle.initialize("cache_size=8388608", callbacks).unwrap();

        handle.get_stats(Cookie(1), b"").unwrap();
        let lines = captured.lock();
        assert!(lines.iter().any(|(k, _)| k == b"cmd_get"));
    }

    #[test]
    fn destroy_then_operation_fails() {
        let engine = engine();
        engine.destroy().unwrap();
        let err = engine.get_info_checked().unwrap_err();
        assert_eq!(err.status(), Status::Failed);
    }

    impl Engine {
        fn get_info_checked(&self) -> HkvResult<&'static str> {
            self.with_state(|_| Ok(self.get_info()))
        }
    }

    #[test]
    fn unused_allocation_releases_its_slot() {
        let engine = engine();
        let allocated = engine.allocate(Cookie(1), b"k", 4, 0, 0).unwrap();
        let before = engine.with_state(|s| Ok(s.slabs.utilization())).unwrap();
        drop(allocated);
        let after = engine.with_state(|s| Ok(s.slabs.utilization())).unwrap();
        assert_eq!(
            before.iter().map(|u| u.free_slots).sum::<usize>() + 1,
            after.iter().map(|u| u.free_slots).sum::<usize>()
        );
    }

    #[test]
    fn cookie_is_copy_and_comparable() {
        let a = Cookie(1);
        let b = a;
        assert_eq!(a, b);
        let _ = TestAtomicU64::new(0);
    }
}
