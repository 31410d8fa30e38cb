//! Multi-threaded checks for the concurrency invariants named in the
//! engine's property list: ADD exclusivity and CAS linearisability under
//! genuine thread contention, plus a sanity check that `store` never
//! panics when many threads hammer the same key.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hkv_common::{HkvError, StoreOperation};
use hkv_engine::{create_instance, Cookie, EngineCallbacks, Status};

fn test_handle() -> hkv_engine::EngineHandle {
    let handle = create_instance(hkv_engine::SUPPORTED_VERSION).unwrap();
    let callbacks = EngineCallbacks {
        notify_io_complete: Arc::new(|_cookie, _status: Status| {}),
        add_stat: Arc::new(|_k, _v| {}),
        add_response: Arc::new(|_args| {}),
    };
    handle.initialize("cache_size=16777216", callbacks).unwrap();
    handle
}

/// P3: of N concurrent ADDs on the same key, exactly one succeeds; every
/// other thread observes NOT_STORED.
#[test]
fn add_exclusivity_under_contention() {
    let engine = test_handle();
    let successes = AtomicUsize::new(0);
    let failures = AtomicUsize::new(0);
    const WORKERS: u64 = 16;

    std::thread::scope(|scope| {
        for worker in 0..WORKERS {
            let engine = &engine;
            let successes = &successes;
            let failures = &failures;
            scope.spawn(move || {
                let cookie = Cookie(worker);
                let mut allocated = match engine.allocate(cookie, b"contended", 1, 0, 0) {
                    Ok(a) => a,
                    Err(HkvError::WouldBlock) => return,
                    Err(e) => panic!("unexpected allocate error: {e}"),
                };
                allocated.value_mut()[0] = b'0' + (worker as u8 % 10);
                match engine.store(cookie, allocated, 0, StoreOperation::Add) {
                    Ok(_) => {
                        successes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(HkvError::NotStored) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => panic!("unexpected store error: {e}"),
                }
            });
        }
    });

    assert_eq!(successes.load(Ordering::Relaxed), 1);
    assert_eq!(failures.load(Ordering::Relaxed) as u64, WORKERS - 1);
}

/// P4: of two concurrent CAS attempts sharing the same observed version, at
/// most one succeeds and the other reports KEY_EEXISTS.
#[test]
fn cas_linearisability_under_contention() {
    let engine = test_handle();
    let mut seed = engine.allocate(Cookie(0), b"k", 1, 0, 0).unwrap();
    seed.value_mut()[0] = b'1';
    let cas0 = engine.store(Cookie(0), seed, 0, StoreOperation::Set).unwrap();

    let successes = AtomicUsize::new(0);
    let conflicts = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for worker in 1..=2u64 {
            let engine = &engine;
            let successes = &successes;
            let conflicts = &conflicts;
            scope.spawn(move || {
                let cookie = Cookie(worker);
                let mut allocated = engine.allocate(cookie, b"k", 1, 0, 0).unwrap();
                allocated.value_mut()[0] = b'0' + worker as u8;
                match engine.store(cookie, allocated, cas0, StoreOperation::Cas) {
                    Ok(_) => {
                        successes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(HkvError::CasMismatch) => {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => panic!("unexpected cas error: {e}"),
                }
            });
        }
    });

    assert_eq!(successes.load(Ordering::Relaxed), 1);
    assert_eq!(conflicts.load(Ordering::Relaxed), 1);
}

/// Many threads racing SET on distinct keys never panics or loses an item.
#[test]
fn concurrent_distinct_key_sets_all_land() {
    let engine = test_handle();
    const WORKERS: u64 = 32;

    std::thread::scope(|scope| {
        for worker in 0..WORKERS {
            let engine = &engine;
            scope.spawn(move || {
                let key = format!("key-{worker}");
                let cookie = Cookie(worker);
                let mut allocated = engine.allocate(cookie, key.as_bytes(), 1, 0, 0).unwrap();
                allocated.value_mut()[0] = b'v';
                engine.store(cookie, allocated, 0, StoreOperation::Set).unwrap();
            });
        }
    });

    for worker in 0..WORKERS {
        let key = format!("key-{worker}");
        let retrieved = engine.get(Cookie(worker), key.as_bytes()).unwrap();
        assert_eq!(&*retrieved.value, b"v");
        engine.release(retrieved).unwrap();
    }
}
