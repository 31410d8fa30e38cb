//! # Engine Benchmark Harness
//!
//! Purpose: Provide a dependency-free, repeatable benchmark driver for the
//! storage engine so baseline throughput and latency can be compared over
//! time. Drives the façade directly, the same way the teacher's
//! `bench_engine` drove `MemoryEngine` directly, skipping any wire protocol.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use a fixed PRNG seed for stable comparisons.
//! 2. **Allocation Control**: Pre-build keys/values to keep setup costs off the hot path.
//! 3. **Zero-Cost Dispatch**: Call the concrete engine's façade methods directly.

use std::collections::BTreeMap;
use std::env;
use std::hint::black_box;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use hkv_common::StoreOperation;
use hkv_engine::{create_instance, Cookie, EngineCallbacks, Status};

const DEFAULT_KEY_COUNT: usize = 1 << 14;
const DEFAULT_OP_COUNT: usize = 200_000;
const DEFAULT_KEY_SIZE: usize = 16;
const DEFAULT_VALUE_SIZE: usize = 128;

struct BenchConfig {
    requested_keys: usize,
    key_count: usize,
    key_mask: usize,
    op_count: usize,
    key_size: usize,
    value_size: usize,
    /// When set, dump the engine's `get_stats` snapshot as JSON after the
    /// run instead of (or alongside) the human-readable throughput lines.
    emit_json_stats: bool,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut positional = Vec::new();
        let mut emit_json_stats = false;
        for arg in env::args().skip(1) {
            if arg == "--stats" {
                emit_json_stats = true;
            } else {
                positional.push(arg);
            }
        }
        let mut args = positional.into_iter();
        let requested_keys = parse_usize(args.next(), DEFAULT_KEY_COUNT);
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let key_size = parse_usize(args.next(), DEFAULT_KEY_SIZE);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);

        let key_count = normalize_power_of_two(requested_keys);
        let key_mask = key_count - 1;

        BenchConfig {
            requested_keys,
            key_count,
            key_mask,
            op_count,
            key_size,
            value_size,
            emit_json_stats,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn normalize_power_of_two(value: usize) -> usize {
    let value = value.max(1);
    if value.is_power_of_two() {
        value
    } else {
        value.next_power_of_two()
    }
}

/// Tiny deterministic PRNG used to avoid external dependencies.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

fn write_u64_le(value: u64, buffer: &mut [u8]) {
    let bytes = value.to_le_bytes();
    let copy_len = buffer.len().min(bytes.len());
    buffer[..copy_len].copy_from_slice(&bytes[..copy_len]);
}

fn build_buffers(count: usize, size: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut buffers = Vec::with_capacity(count);
    for i in 0..count {
        let mut buffer = vec![0u8; size];
        write_u64_le(seed ^ (i as u64), &mut buffer);
        buffers.push(buffer);
    }
    buffers
}

fn report(label: &str, ops: usize, elapsed: std::time::Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops as f64);
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)"
    );
}

fn main() {
    tracing_subscriber::fmt::try_init().ok();
    if let Err(err) = run() {
        eprintln!("bench_engine failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let config = BenchConfig::from_args();
    tracing::info!(
        keys = config.requested_keys,
        ops = config.op_count,
        "starting bench_engine run"
    );
    let handle = create_instance(hkv_engine::SUPPORTED_VERSION).map_err(|e| e.to_string())?;
    // `get_stats` only ever hands lines to an `add_stat` callback (spec
    // §4.5/§6), registered once at `initialize()` time since the real
    // front-end that would otherwise pass it per-call is out of scope here.
    // Collecting those lines into this map and rendering them with
    // `serde_json` in `--stats` mode is the one place this binary talks an
    // external format rather than the engine's own wire-stable contract.
    let collected_stats: Arc<Mutex<BTreeMap<String, String>>> = Arc::new(Mutex::new(BTreeMap::new()));
    let stats_sink = Arc::clone(&collected_stats);
    let callbacks = EngineCallbacks {
        notify_io_complete: Arc::new(|_cookie, _status: Status| {}),
        add_stat: Arc::new(move |k, v| {
            stats_sink.lock().unwrap().insert(
                String::from_utf8_lossy(k).into_owned(),
                String::from_utf8_lossy(v).into_owned(),
            );
        }),
        add_response: Arc::new(|_args| {}),
    };
    let cache_size = (config.key_count * (config.key_size + config.value_size + 64)).max(8 << 20);
    handle
        .initialize(&format!("cache_size={cache_size}"), callbacks)
        .map_err(|e| e.to_string())?;

    let keys = build_buffers(config.key_count, config.key_size, 0xA5A5_A5A5_A5A5_A5A5);
    let values = build_buffers(config.key_count, config.value_size, 0x5A5A_5A5A_5A5A_5A5A);

    for idx in 0..config.key_count {
        let mut allocated = handle
            .allocate(Cookie(idx as u64), &keys[idx], values[idx].len(), 0, 0)
            .map_err(|e| e.to_string())?;
        allocated.value_mut().copy_from_slice(&values[idx]);
        handle
            .store(Cookie(idx as u64), allocated, 0, StoreOperation::Set)
            .map_err(|e| e.to_string())?;
    }

    println!(
        "keys: requested={}, actual={}, ops={}, key_size={}, value_size={}",
        config.requested_keys,
        config.key_count,
        config.op_count,
        config.key_size,
        config.value_size
    );

    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let start = Instant::now();
    for i in 0..config.op_count {
        let idx = rng.next_index(config.key_mask);
        let retrieved = handle.get(Cookie(i as u64), &keys[idx]).map_err(|e| e.to_string())?;
        black_box(&retrieved.value);
        handle.release(retrieved).map_err(|e| e.to_string())?;
    }
    report("GET", config.op_count, start.elapsed());

    let mut rng = XorShift64::new(0x0FED_CBA9_8765_4321);
    let start = Instant::now();
    for i in 0..config.op_count {
        let idx = rng.next_index(config.key_mask);
        let mut value = values[idx].clone();
        if let Some(first) = value.get_mut(0) {
            *first ^= 0xFF;
        }
        let mut allocated = handle
            .allocate(Cookie(i as u64), &keys[idx], value.len(), 0, 0)
            .map_err(|e| e.to_string())?;
        allocated.value_mut().copy_from_slice(&value);
        handle
            .store(Cookie(i as u64), allocated, 0, StoreOperation::Set)
            .map_err(|e| e.to_string())?;
    }
    report("SET", config.op_count, start.elapsed());

    handle.get_stats(Cookie(0), b"").map_err(|e| e.to_string())?;
    if config.emit_json_stats {
        let snapshot = collected_stats.lock().unwrap();
        let rendered = serde_json::to_string_pretty(&*snapshot).map_err(|e| e.to_string())?;
        println!("{rendered}");
    }

    handle.destroy().map_err(|e| e.to_string())?;

    Ok(())
}
