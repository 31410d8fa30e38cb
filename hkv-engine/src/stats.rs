//! # Engine Statistics
//!
//! Accumulate the general stat set (spec §4.5 `get_stats`) plus a latency
//! histogram for `store` operations. Generalizes the teacher's
//! `hkv-server::metrics::Metrics` accumulator pattern — atomic counters plus
//! a `snapshot()` method — from per-connection request/latency metrics to
//! per-engine cache metrics. The teacher's `LatencyHistogram` was left as a
//! `todo!()` stub (`new`/`record`/`snapshot` all unimplemented); this module
//! gives it a full implementation since nothing here is allowed to stay a
//! stub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default latency bucket boundaries, in microseconds, for the `store`
/// operation histogram.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 10] =
    [1, 2, 5, 10, 20, 50, 100, 200, 500, 1_000];

/// Point-in-time view of every engine counter, in the shape `get_stats`
/// emits via `add_stat` and the bench binary renders as JSON.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatsSnapshot {
    pub cmd_get: u64,
    pub cmd_set: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub curr_items: u64,
    pub total_items: u64,
    pub evictions: u64,
    pub expired_unfetched: u64,
    pub reclaimed: u64,
    pub cas_hits: u64,
    pub cas_misses: u64,
    pub cas_badval: u64,
    pub bytes: u64,
    pub store_latency: LatencySnapshot,
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LatencySnapshot {
    pub bounds_us: Vec<u64>,
    pub buckets: Vec<u64>,
    pub samples: u64,
    pub sum_us: u64,
}

/// Thread-safe engine-wide counters. `Ordering::Relaxed` throughout:
/// counters are independent and only need eventual consistency, the same
/// reasoning the teacher's `Metrics` applies.
pub struct EngineStats {
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    curr_items: AtomicU64,
    total_items: AtomicU64,
    evictions: AtomicU64,
    expired_unfetched: AtomicU64,
    reclaimed: AtomicU64,
    cas_hits: AtomicU64,
    cas_misses: AtomicU64,
    cas_badval: AtomicU64,
    bytes: AtomicU64,
    store_latency: LatencyHistogram,
}

impl EngineStats {
    pub fn new() -> Self {
        EngineStats {
            cmd_get: AtomicU64::new(0),
            cmd_set: AtomicU64::new(0),
            get_hits: AtomicU64::new(0),
            get_misses: AtomicU64::new(0),
            curr_items: AtomicU64::new(0),
            total_items: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_unfetched: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            cas_hits: AtomicU64::new(0),
            cas_misses: AtomicU64::new(0),
            cas_badval: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            store_latency: LatencyHistogram::new(DEFAULT_LATENCY_BUCKETS_US.to_vec()),
        }
    }

    pub fn record_get(&self, hit: bool) {
        self.cmd_get.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.get_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.get_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_store(&self, latency: Duration) {
        self.cmd_set.fetch_add(1, Ordering::Relaxed);
        self.total_items.fetch_add(1, Ordering::Relaxed);
        self.store_latency.record(latency);
    }

    pub fn record_cas(&self, hit: bool) {
        if hit {
            self.cas_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cas_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cas_badval(&self) {
        self.cas_badval.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, size: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.item_unlinked(size);
    }

    pub fn record_expired_reap(&self, size: u64) {
        self.expired_unfetched.fetch_add(1, Ordering::Relaxed);
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        self.item_unlinked(size);
    }

    pub fn item_linked(&self, size: u64) {
        self.curr_items.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub fn item_unlinked(&self, size: u64) {
        self.curr_items.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn bytes_delta(&self, old_size: u64, new_size: u64) {
        if new_size >= old_size {
            self.bytes.fetch_add(new_size - old_size, Ordering::Relaxed);
        } else {
            self.bytes.fetch_sub(old_size - new_size, Ordering::Relaxed);
        }
    }

    pub fn curr_items(&self) -> u64 {
        self.curr_items.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Zeroes the cumulative counters `reset_stats` is documented to reset.
    /// `curr_items` and `bytes` are current-state gauges, not cumulative
    /// counters, and are intentionally left untouched.
    pub fn reset(&self) {
        self.cmd_get.store(0, Ordering::Relaxed);
        self.cmd_set.store(0, Ordering::Relaxed);
        self.get_hits.store(0, Ordering::Relaxed);
        self.get_misses.store(0, Ordering::Relaxed);
        self.total_items.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expired_unfetched.store(0, Ordering::Relaxed);
        self.reclaimed.store(0, Ordering::Relaxed);
        self.cas_hits.store(0, Ordering::Relaxed);
        self.cas_misses.store(0, Ordering::Relaxed);
        self.cas_badval.store(0, Ordering::Relaxed);
        self.store_latency.reset();
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            cmd_get: self.cmd_get.load(Ordering::Relaxed),
            cmd_set: self.cmd_set.load(Ordering::Relaxed),
            get_hits: self.get_hits.load(Ordering::Relaxed),
            get_misses: self.get_misses.load(Ordering::Relaxed),
            curr_items: self.curr_items.load(Ordering::Relaxed),
            total_items: self.total_items.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_unfetched: self.expired_unfetched.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            cas_hits: self.cas_hits.load(Ordering::Relaxed),
            cas_misses: self.cas_misses.load(Ordering::Relaxed),
            cas_badval: self.cas_badval.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            store_latency: self.store_latency.snapshot(),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket latency histogram. Linear bucket scan is fine at this size
/// (ten-ish buckets); the list stays hot in cache.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with `bounds_us.len() + 1` buckets, the last one
    /// an overflow bucket for samples past every boundary.
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let mut buckets = Vec::with_capacity(bounds_us.len() + 1);
        for _ in 0..=bounds_us.len() {
            buckets.push(AtomicU64::new(0));
        }
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: Duration) {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);

        let bucket = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.sum_us.store(0, Ordering::Relaxed);
        self.samples.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_records_hit_and_miss() {
        let stats = EngineStats::new();
        stats.record_get(true);
        stats.record_get(false);
        let snap = stats.snapshot();
        assert_eq!(snap.cmd_get, 2);
        assert_eq!(snap.get_hits, 1);
        assert_eq!(snap.get_misses, 1);
    }

    #[test]
    fn reset_clears_cumulative_but_not_gauges() {
        let stats = EngineStats::new();
        stats.record_get(true);
        stats.item_linked(100);
        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.cmd_get, 0);
        assert_eq!(snap.curr_items, 1);
        assert_eq!(snap.bytes, 100);
    }

    #[test]
    fn histogram_buckets_by_boundary() {
        let histogram = LatencyHistogram::new(vec![10, 100]);
        histogram.record(Duration::from_micros(5));
        histogram.record(Duration::from_micros(50));
        histogram.record(Duration::from_micros(500));
        let snap = histogram.snapshot();
        assert_eq!(snap.buckets, vec![1, 1, 1]);
        assert_eq!(snap.samples, 3);
        assert_eq!(snap.sum_us, 555);
    }

    #[test]
    fn histogram_reset_zeroes_buckets() {
        let histogram = LatencyHistogram::new(vec![10]);
        histogram.record(Duration::from_micros(5));
        histogram.reset();
        let snap = histogram.snapshot();
        assert_eq!(snap.samples, 0);
        assert_eq!(snap.buckets, vec![0, 0]);
    }
}
