//! # Clock Service
//!
//! Provide a process-wide, low-resolution relative-time counter that every
//! other component reads to compare against item expiration without taking
//! a lock.
//!
//! ## Usage
//!
//! - Construct one `Clock` per engine instance and share it via `Arc`.
//! - Call `stop()` on shutdown to join the ticker thread; dropping a
//!   `Clock` without stopping it leaks the thread (matching the teacher's
//!   `ExpirationHandle` contract, which requires an explicit `stop`).
//!
//! ## Design Principles
//!
//! 1. **Lock-Free Reads**: `now()` is a single relaxed atomic load.
//! 2. **Bounded Staleness**: the ticker updates at least once per second, so
//!    a read is never more than one tick behind wall-clock time.
//! 3. **Boundary Conversion**: `realtime()` is the single place the dual
//!    absolute/relative `exptime` convention is implemented, shared with the
//!    engine façade and the config-adjacent call sites.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use hkv_common::time::{realtime, unix_epoch_secs};

/// Handle returned by [`Clock::start_ticker`]. Stopping joins the thread.
pub struct TickerHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TickerHandle {
    /// Signals the ticker thread to stop and waits for it to finish.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Process-wide relative-time counter, seconds since the `Clock` was
/// constructed.
pub struct Clock {
    seconds: AtomicU32,
    started_at_epoch: u64,
}

impl Clock {
    /// Creates a new clock starting at relative time zero.
    pub fn new() -> Self {
        Clock {
            seconds: AtomicU32::new(0),
            started_at_epoch: unix_epoch_secs(),
        }
    }

    /// Returns the current relative time. Lock-free, may be up to one tick
    /// stale.
    pub fn now(&self) -> u32 {
        self.seconds.load(Ordering::Relaxed)
    }

    /// Advances the clock by one tick. Called by the background ticker;
    /// exposed for tests that want deterministic control over time.
    pub fn tick(&self) {
        self.seconds.fetch_add(1, Ordering::Relaxed);
    }

    /// Converts a raw `exptime` input into the engine's relative-time frame,
    /// per the dual absolute/relative convention (spec §3/§6).
    pub fn realtime(&self, input: u32) -> u32 {
        realtime(input, self.now(), self.started_at_epoch)
    }

    /// Saturating seconds elapsed since `mark`, used by the eviction
    /// engine's bump-suppression window and by stats' uptime counter.
    pub fn elapsed_since(&self, mark: u32) -> u32 {
        self.now().saturating_sub(mark)
    }

    /// Starts a background thread that ticks the clock roughly once per
    /// second, in the style of the teacher's `start_expirer`.
    pub fn start_ticker(self: &Arc<Self>) -> TickerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let clock = Arc::clone(self);

        let join = std::thread::spawn(move || {
            while !stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_secs(1));
                clock.tick();
            }
        });

        TickerHandle {
            stop,
            join: Some(join),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
