//! # TTL manager
//!
//! Owns a tick loop, a pending-intent queue, and a bucketed expiry wheel.
//! Supports millions of entries with O(1) amortized insert/refresh: a tick
//! only does work proportional to the keys actually due, never a full
//! table scan.
//!
//! Runs as a single background thread that sleeps one tick interval,
//! drains pending intents into the authoritative schedule, reaps
//! whatever is due, and advances.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

enum TtlIntent<K> {
    Set(K, u64),
    Clear(K),
}

/// Background tick-driven TTL scheduler.
///
/// If constructed with no tick interval, the manager is inert: no thread
/// is spawned and `set_ttl`/`clear` are no-ops, so entries never expire
/// (spec invariant "TTL disabled").
pub struct TtlManager<K> {
    tick_ms: u64,
    sender: Option<mpsc::Sender<TtlIntent<K>>>,
    stop: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<K> TtlManager<K>
where
    K: Hash + Eq + Clone + Send + 'static,
{
    /// Creates an inert manager: TTL disabled entirely.
    pub fn disabled() -> Arc<Self> {
        Arc::new(TtlManager {
            tick_ms: 0,
            sender: None,
            stop: Arc::new(AtomicBool::new(false)),
            join: Mutex::new(None),
        })
    }

    /// Spawns the tick loop. `on_expire` is invoked, off any caller's
    /// thread, for each key whose deadline has arrived; it is expected to
    /// perform the operation layer's delete path (row lock + callback)
    /// and swallow any callback failure rather than propagate it, so one
    /// failing callback cannot stall expiry of every other key.
    pub fn spawn<F>(tick: Duration, on_expire: F) -> Arc<Self>
    where
        F: Fn(K) + Send + Sync + 'static,
    {
        let tick_ms = (tick.as_millis() as u64).max(1);
        let (tx, rx) = mpsc::channel::<TtlIntent<K>>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let tick_duration = Duration::from_millis(tick_ms);

        let join = std::thread::spawn(move || {
            let mut now_tick: u64 = 0;
            let mut expiry_by_tick: HashMap<u64, HashSet<K>> = HashMap::new();
            let mut key_deadline: HashMap<K, u64> = HashMap::new();

            while !stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(tick_duration);
                if stop_thread.load(Ordering::Acquire) {
                    break;
                }

                // Step 1: drain pending intents into authoritative state.
                while let Ok(intent) = rx.try_recv() {
                    match intent {
                        TtlIntent::Set(key, ms) if ms > 0 => {
                            let ticks = ((ms + tick_ms - 1) / tick_ms).max(1);
                            let target_tick = now_tick + ticks;
                            key_deadline.insert(key.clone(), target_tick);
                            expiry_by_tick.entry(target_tick).or_default().insert(key);
                        }
                        TtlIntent::Set(key, _) | TtlIntent::Clear(key) => {
                            key_deadline.remove(&key);
                        }
                    }
                }

                // Step 2: reap everything due at this tick, filtering stale
                // references whose deadline moved since they were scheduled.
                if let Some(due) = expiry_by_tick.remove(&now_tick) {
                    tracing::trace!(tick = now_tick, due = due.len(), "ttl tick");
                    for key in due {
                        if key_deadline.get(&key) == Some(&now_tick) {
                            key_deadline.remove(&key);
                            tracing::debug!("ttl reaping expired key");
                            on_expire(key);
                        }
                    }
                }

                // Step 3: advance.
                now_tick += 1;
            }
        });

        Arc::new(TtlManager {
            tick_ms,
            sender: Some(tx),
            stop,
            join: Mutex::new(Some(join)),
        })
    }

    /// True if TTL is enabled (a tick loop is running).
    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Tick length in milliseconds, or 0 if disabled.
    pub fn tick_ms(&self) -> u64 {
        self.tick_ms
    }

    /// Emits a `set_ttl(key, ms)` intent. `ms == 0` is realized as a
    /// `clear` (never expire). Asynchronous: returns immediately.
    pub fn set_ttl(&self, key: K, ms: u64) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(TtlIntent::Set(key, ms));
        }
    }

    /// Emits a `clear(key)` intent, cancelling any scheduled deadline.
    pub fn clear(&self, key: K) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(TtlIntent::Clear(key));
        }
    }
}

impl<K> Drop for TtlManager<K> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}
