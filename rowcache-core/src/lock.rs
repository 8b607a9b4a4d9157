//! # Row-lock pool
//!
//! A fixed array of shard coordinators, one per unit of hardware
//! parallelism, each owning a mapping from lock-id to holder identity and
//! a FIFO wait queue. Lets any caller serialize on an arbitrary id while
//! every other caller proceeds in parallel.
//!
//! ## Design Principles
//!
//! 1. **Sharded mutexes, not actors**: each shard's own `Mutex` already
//!    enforces "at most one owner per lock-id" without a dedicated
//!    request/reply thread; a `Condvar` handles blocking/waking.
//! 2. **Reentrant by thread identity**: the acquiring thread's
//!    `ThreadId` is the owner token, so nested `with` calls on the same
//!    id by the same thread increment a counter instead of deadlocking.
//! 3. **RAII release**: `with`/`acquire` return a guard whose `Drop`
//!    releases on every exit path, including unwinding panics.
//! 4. **Release-side promotion**: the shard that owns a lock-id also
//!    owns promoting its waiters; a waiter never has to race to grab the
//!    lock itself, it just waits to be told it now owns it.

use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use ahash::RandomState;
use parking_lot::{Condvar, Mutex};

use rowcache_common::{CacheError, CacheResult};

struct Holder {
    owner: ThreadId,
    reentry_count: u32,
}

struct WaiterSlot {
    owner: ThreadId,
    deadline: Instant,
    promoted: AtomicBool,
}

#[derive(Default)]
struct ShardState<Id> {
    holders: HashMap<Id, Holder>,
    waiters: HashMap<Id, VecDeque<Arc<WaiterSlot>>>,
}

struct Shard<Id> {
    state: Mutex<ShardState<Id>>,
    condvar: Condvar,
}

/// Sharded pool of row-lock coordinators.
pub struct LockPool<Id> {
    shards: Vec<Shard<Id>>,
    shard_mask: usize,
    hash_state: RandomState,
}

impl<Id> LockPool<Id>
where
    Id: Hash + Eq + Clone,
{
    /// Creates a pool with `shard_count` shards, normalized to a power of
    /// two for fast masking.
    pub fn with_shard_count(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1).next_power_of_two();
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Shard {
                state: Mutex::new(ShardState::default()),
                condvar: Condvar::new(),
            });
        }
        LockPool {
            shards,
            shard_mask: shard_count - 1,
            hash_state: RandomState::new(),
        }
    }

    fn shard_for(&self, id: &Id) -> &Shard<Id> {
        let mut hasher = self.hash_state.build_hasher();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & self.shard_mask]
    }

    /// Acquires the row lock for `id`, blocking up to `timeout` if it is
    /// held by another thread. Reentrant: a nested `acquire` on `id` by
    /// the same thread increments a counter and returns immediately.
    pub fn acquire(&self, id: &Id, timeout: Duration) -> CacheResult<LockToken<'_, Id>> {
        let shard = self.shard_for(id);
        let this_thread = std::thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = shard.state.lock();

        if let Some(holder) = state.holders.get_mut(id) {
            if holder.owner == this_thread {
                holder.reentry_count += 1;
                return Ok(LockToken { pool: self, id: id.clone() });
            }
        } else {
            state.holders.insert(
                id.clone(),
                Holder { owner: this_thread, reentry_count: 1 },
            );
            return Ok(LockToken { pool: self, id: id.clone() });
        }

        let slot = Arc::new(WaiterSlot {
            owner: this_thread,
            deadline,
            promoted: AtomicBool::new(false),
        });
        state
            .waiters
            .entry(id.clone())
            .or_default()
            .push_back(Arc::clone(&slot));

        loop {
            if slot.promoted.load(Ordering::Acquire) {
                return Ok(LockToken { pool: self, id: id.clone() });
            }
            let now = Instant::now();
            if now >= deadline {
                remove_waiter(&mut state, id, &slot);
                tracing::warn!(?this_thread, "row lock acquire timed out");
                return Err(CacheError::LockTimeout);
            }
            let result = shard.condvar.wait_until(&mut state, deadline);
            if slot.promoted.load(Ordering::Acquire) {
                return Ok(LockToken { pool: self, id: id.clone() });
            }
            if result.timed_out() {
                remove_waiter(&mut state, id, &slot);
                tracing::warn!(?this_thread, "row lock acquire timed out");
                return Err(CacheError::LockTimeout);
            }
        }
    }

    /// Acquires `id` without blocking. Returns `CacheError::Locked` if it
    /// is currently held by another thread.
    pub fn try_acquire(&self, id: &Id) -> CacheResult<LockToken<'_, Id>> {
        let shard = self.shard_for(id);
        let this_thread = std::thread::current().id();
        let mut state = shard.state.lock();

        match state.holders.get_mut(id) {
            Some(holder) if holder.owner == this_thread => {
                holder.reentry_count += 1;
                Ok(LockToken { pool: self, id: id.clone() })
            }
            Some(_) => Err(CacheError::Locked),
            None => {
                state.holders.insert(
                    id.clone(),
                    Holder { owner: this_thread, reentry_count: 1 },
                );
                Ok(LockToken { pool: self, id: id.clone() })
            }
        }
    }

    /// Acquires `id`, runs `f`, and releases on every exit path
    /// (including `f` panicking). Reentrant.
    pub fn with<F, R>(&self, id: &Id, timeout: Duration, f: F) -> CacheResult<R>
    where
        F: FnOnce() -> R,
    {
        let _token = self.acquire(id, timeout)?;
        Ok(f())
    }

    fn release(&self, id: &Id) {
        let shard = self.shard_for(id);
        let mut state = shard.state.lock();

        let done = match state.holders.get_mut(id) {
            Some(holder) => {
                holder.reentry_count -= 1;
                holder.reentry_count == 0
            }
            None => return,
        };

        if !done {
            return;
        }

        state.holders.remove(id);

        if let Some(queue) = state.waiters.get_mut(id) {
            while let Some(slot) = queue.pop_front() {
                if Instant::now() >= slot.deadline {
                    // Stale waiter: never receives ownership.
                    continue;
                }
                state.holders.insert(
                    id.clone(),
                    Holder { owner: slot.owner, reentry_count: 1 },
                );
                slot.promoted.store(true, Ordering::Release);
                tracing::trace!("promoted waiter to row lock holder");
                break;
            }
            if queue.is_empty() {
                state.waiters.remove(id);
            }
        }

        drop(state);
        shard.condvar.notify_all();
    }
}

fn remove_waiter<Id: Hash + Eq>(state: &mut ShardState<Id>, id: &Id, slot: &Arc<WaiterSlot>) {
    if let Some(queue) = state.waiters.get_mut(id) {
        queue.retain(|s| !Arc::ptr_eq(s, slot));
        if queue.is_empty() {
            state.waiters.remove(id);
        }
    }
}

/// RAII handle for a held row lock. Releasing happens on drop so every
/// exit path — normal return, early return, or panic unwind — releases
/// exactly once.
pub struct LockToken<'a, Id>
where
    Id: Hash + Eq + Clone,
{
    pool: &'a LockPool<Id>,
    id: Id,
}

impl<'a, Id> Drop for LockToken<'a, Id>
where
    Id: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        self.pool.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn uncontended_acquire_release() {
        let pool: LockPool<String> = LockPool::with_shard_count(4);
        let token = pool.acquire(&"a".to_string(), Duration::from_secs(1)).unwrap();
        drop(token);
        let _token2 = pool.acquire(&"a".to_string(), Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn reentrant_acquire_does_not_deadlock() {
        let pool: LockPool<String> = LockPool::with_shard_count(4);
        let _outer = pool.acquire(&"a".to_string(), Duration::from_secs(1)).unwrap();
        let _inner = pool.acquire(&"a".to_string(), Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn try_acquire_reports_locked_from_other_thread() {
        let pool = StdArc::new(LockPool::<String>::with_shard_count(4));
        let token = pool.acquire(&"a".to_string(), Duration::from_secs(5)).unwrap();

        let pool2 = StdArc::clone(&pool);
        let handle = std::thread::spawn(move || pool2.try_acquire(&"a".to_string()).is_err());
        assert!(handle.join().unwrap());

        drop(token);
        let pool3 = StdArc::clone(&pool);
        let handle = std::thread::spawn(move || pool3.try_acquire(&"a".to_string()).is_ok());
        assert!(handle.join().unwrap());
    }

    #[test]
    fn distinct_ids_never_block_each_other() {
        let pool = StdArc::new(LockPool::<String>::with_shard_count(4));
        let _a = pool.acquire(&"a".to_string(), Duration::from_secs(5)).unwrap();

        let pool2 = StdArc::clone(&pool);
        let handle = std::thread::spawn(move || {
            pool2.acquire(&"b".to_string(), Duration::from_millis(200)).is_ok()
        });
        assert!(handle.join().unwrap());
    }

    #[test]
    fn lock_timeout_on_held_forever() {
        let pool = StdArc::new(LockPool::<String>::with_shard_count(4));
        let _holder = pool.acquire(&"a".to_string(), Duration::from_secs(5)).unwrap();

        let pool2 = StdArc::clone(&pool);
        let handle = std::thread::spawn(move || {
            pool2.acquire(&"a".to_string(), Duration::from_millis(50))
        });
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(CacheError::LockTimeout)));
    }

    #[test]
    fn waiters_serialize_fifo_and_all_eventually_succeed() {
        let pool = StdArc::new(LockPool::<String>::with_shard_count(1));
        let counter = StdArc::new(AtomicUsize::new(0));
        let order = StdArc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = StdArc::clone(&pool);
            let counter = StdArc::clone(&counter);
            let order = StdArc::clone(&order);
            handles.push(std::thread::spawn(move || {
                let _token = pool.acquire(&"a".to_string(), Duration::from_secs(5)).unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                order.lock().push(i);
                std::thread::sleep(Duration::from_millis(2));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
