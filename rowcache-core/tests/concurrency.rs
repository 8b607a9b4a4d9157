//! Concurrency and correctness scenarios from the cache's testable
//! properties: row-lock mutual exclusion, no cross-key interference,
//! callback ordering, reentrancy, and lock timeout liveness.
//!
//! Raw `std::thread` harness, no async test runner.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rowcache_common::{CacheConfig, UpdateOutcome};
use rowcache_core::Cache;

/// S1: insert/get.
#[test]
fn insert_and_get() {
    let cache: Cache<String, i32> = Cache::new(CacheConfig::new());
    cache.put("a".to_string(), 1).unwrap();
    assert_eq!(cache.get(&"a".to_string()), Some(1));
    assert_eq!(cache.get(&"b".to_string()), None);
}

/// S2: insert_new conflict.
#[test]
fn insert_new_reports_conflict() {
    let cache: Cache<String, i32> = Cache::new(CacheConfig::new());
    cache.insert_new("a".to_string(), 1).unwrap();
    let err = cache.insert_new("a".to_string(), 2).unwrap_err();
    assert!(matches!(err, rowcache_common::CacheError::AlreadyExists));
    assert_eq!(cache.get(&"a".to_string()), Some(1));
}

/// S3: 1000 concurrent callers incrementing the same key under `update`.
/// Final value is exactly 1000 and exactly 1000 update callbacks fired
/// (invariant 1, invariant 3).
#[test]
fn serialized_increment_is_exact() {
    let callback_count = Arc::new(AtomicUsize::new(0));
    let callback_count_clone = Arc::clone(&callback_count);

    let cache: Cache<String, i64> = Cache::with_callback(CacheConfig::new(), move |event| {
        if let rowcache_common::CacheEvent::Update { .. } = event {
            callback_count_clone.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    let mut handles = Vec::new();
    for _ in 0..1000 {
        let cache = cache.clone();
        handles.push(std::thread::spawn(move || {
            cache
                .update("n".to_string(), |old| {
                    UpdateOutcome::Change(old.unwrap_or(0) + 1)
                })
                .unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(cache.get(&"n".to_string()), Some(1000));
    assert_eq!(callback_count.load(Ordering::SeqCst), 1000);
}

/// Invariant 2: distinct keys never block each other beyond shard
/// coordinator latency.
#[test]
fn distinct_keys_proceed_in_parallel() {
    let cache: Cache<String, i32> = Cache::new(CacheConfig::new());
    let barrier = Arc::new(std::sync::Barrier::new(2));

    let cache_a = cache.clone();
    let barrier_a = Arc::clone(&barrier);
    let a = std::thread::spawn(move || {
        cache_a
            .isolated(&"key-a".to_string(), || {
                barrier_a.wait();
                std::thread::sleep(Duration::from_millis(100));
            })
            .unwrap();
    });

    let cache_b = cache.clone();
    let barrier_b = Arc::clone(&barrier);
    let b = std::thread::spawn(move || {
        barrier_b.wait();
        let start = std::time::Instant::now();
        cache_b.isolated(&"key-b".to_string(), || {}).unwrap();
        start.elapsed()
    });

    a.join().unwrap();
    let elapsed = b.join().unwrap();
    assert!(elapsed < Duration::from_millis(80));
}

/// Invariant 4: reentrancy. `isolated` nested on the same id by the same
/// thread terminates and returns the inner result.
#[test]
fn isolated_is_reentrant() {
    let cache: Cache<String, i32> = Cache::new(CacheConfig::new());
    let result = cache
        .isolated(&"k".to_string(), || {
            cache.isolated(&"k".to_string(), || 42).unwrap()
        })
        .unwrap();
    assert_eq!(result, 42);
}

/// S7: try_isolated reports locked while held, then succeeds after
/// release.
#[test]
fn try_isolated_reports_locked_then_succeeds() {
    let cache: Cache<String, i32> = Cache::new(CacheConfig::new());
    let ready = Arc::new(std::sync::Barrier::new(2));
    let release = Arc::new(Mutex::new(()));
    let guard = release.lock().unwrap();

    let cache_a = cache.clone();
    let ready_a = Arc::clone(&ready);
    let release_a = Arc::clone(&release);
    let holder = std::thread::spawn(move || {
        cache_a
            .isolated(&"L".to_string(), || {
                ready_a.wait();
                let _wait_for_release = release_a.lock().unwrap();
            })
            .unwrap();
    });

    ready.wait();
    std::thread::sleep(Duration::from_millis(20));
    let locked = cache.try_isolated(&"L".to_string(), || ()).is_err();
    assert!(locked);

    drop(guard);
    holder.join().unwrap();

    let unlocked = cache.try_isolated(&"L".to_string(), || ()).is_ok();
    assert!(unlocked);
}

/// Invariant 8: lock timeout liveness.
#[test]
fn lock_timeout_fires_within_bound() {
    let cache: Cache<String, i32> = Cache::new(
        CacheConfig::new().with_acquire_lock_timeout(Duration::from_millis(50)),
    );
    let ready = Arc::new(std::sync::Barrier::new(2));

    let cache_holder = cache.clone();
    let ready_holder = Arc::clone(&ready);
    let holder = std::thread::spawn(move || {
        cache_holder
            .isolated(&"L".to_string(), || {
                ready_holder.wait();
                std::thread::sleep(Duration::from_secs(5));
            })
            .unwrap();
    });

    ready.wait();
    let start = std::time::Instant::now();
    let result = cache.isolated(&"L".to_string(), || ());
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(rowcache_common::CacheError::LockTimeout)));
    assert!(elapsed < Duration::from_millis(200));

    // Let the holder finish so the process doesn't outlive the test.
    drop(holder);
}

/// Update's "no change" sentinel skips the write and the callback.
#[test]
fn update_no_change_skips_write_and_callback() {
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);
    let cache: Cache<String, i32> = Cache::with_callback(CacheConfig::new(), move |_event| {
        fired_clone.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    cache.put("a".to_string(), 1).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let result = cache
        .update("a".to_string(), |_old| UpdateOutcome::<i32>::NoChange)
        .unwrap();
    assert_eq!(result, None);
    assert_eq!(cache.get(&"a".to_string()), Some(1));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

/// Delete callback observes the value that was stored immediately before
/// the delete (invariant 3, delete branch).
#[test]
fn delete_callback_observes_prior_value() {
    let observed = Arc::new(Mutex::new(None));
    let observed_clone = Arc::clone(&observed);
    let cache: Cache<String, i32> = Cache::with_callback(CacheConfig::new(), move |event| {
        if let rowcache_common::CacheEvent::Delete { value, .. } = event {
            *observed_clone.lock().unwrap() = Some(value);
        }
        Ok(())
    });

    cache.put("a".to_string(), 7).unwrap();
    let removed = cache.delete(&"a".to_string()).unwrap();
    assert_eq!(removed, Some(7));
    assert_eq!(*observed.lock().unwrap(), Some(7));
    assert_eq!(cache.get(&"a".to_string()), None);
}

/// update_existing fails on an absent key without writing anything.
#[test]
fn update_existing_fails_on_absent_key() {
    let cache: Cache<String, i32> = Cache::new(CacheConfig::new());
    let err = cache
        .update_existing("missing".to_string(), |v| UpdateOutcome::Change(v + 1))
        .unwrap_err();
    assert!(matches!(err, rowcache_common::CacheError::NotExisting));
    assert_eq!(cache.get(&"missing".to_string()), None);
}

/// get_or_store only computes and writes once under concurrent callers.
#[test]
fn get_or_store_computes_once() {
    let computations = Arc::new(AtomicUsize::new(0));
    let cache: Cache<String, i32> = Cache::new(CacheConfig::new());

    let mut handles = Vec::new();
    for _ in 0..50 {
        let cache = cache.clone();
        let computations = Arc::clone(&computations);
        handles.push(std::thread::spawn(move || {
            cache
                .get_or_store("k".to_string(), || {
                    computations.fetch_add(1, Ordering::SeqCst);
                    99
                })
                .unwrap()
        }));
    }
    for h in handles {
        assert_eq!(h.join().unwrap(), 99);
    }
    assert_eq!(computations.load(Ordering::SeqCst), 1);
}

/// Dirty mutators commit as a single atomic store operation even without
/// the row lock (invariant 7): every write lands, none are lost.
#[test]
fn dirty_put_is_atomic_at_the_store_layer() {
    let cache: Cache<String, i32> = Cache::new(CacheConfig::new());
    let mut handles = Vec::new();
    for i in 0..100 {
        let cache = cache.clone();
        handles.push(std::thread::spawn(move || {
            cache.dirty_put(format!("k{i}"), i).unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(cache.len(), 100);
    for i in 0..100 {
        assert_eq!(cache.get(&format!("k{i}")), Some(i));
    }
}
