//! # Operation layer
//!
//! Implements every public cache operation by composing the backing
//! store, row-lock pool, TTL manager, and callback dispatcher. None of
//! these operations synchronously contacts the TTL owner; TTL changes
//! are always fire-and-forget intents.
//!
//! One function per named operation, each taking the row lock only when
//! the operation's semantics require it, falling through to the store
//! and then the callback.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use rowcache_common::{CacheConfig, CacheError, CacheEvent, CacheResult, CallbackError, StoreKind, UpdateOutcome};

use crate::lock::LockPool;
use crate::store::ShardedStore;
use crate::ttl::TtlManager;

/// User callback invoked synchronously, inside the row lock scope for
/// mutators, after a successful insert/update or before a delete.
pub type CacheCallback<K, V> =
    Arc<dyn Fn(CacheEvent<K, V>) -> Result<(), CallbackError> + Send + Sync>;

struct CacheInner<K, V> {
    store: ShardedStore<K, V>,
    locks: LockPool<K>,
    ttl: Arc<TtlManager<K>>,
    callback: Option<CacheCallback<K, V>>,
    config: CacheConfig,
}

/// An in-process, concurrent key/value cache handle.
///
/// Cheap to clone: every clone shares the same store, lock pool, TTL
/// manager, and callback via `Arc`.
pub struct Cache<K, V>(Arc<CacheInner<K, V>>);

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Cache(Arc::clone(&self.0))
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache with no callback.
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a cache whose callback fires on every successful
    /// insert/update/delete.
    pub fn with_callback<F>(config: CacheConfig, callback: F) -> Self
    where
        F: Fn(CacheEvent<K, V>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        Self::build(config, Some(Arc::new(callback)))
    }

    fn build(config: CacheConfig, callback: Option<CacheCallback<K, V>>) -> Self {
        let shard_count = config.shard_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                * 4
        });
        let track_order = config.store_kind == StoreKind::OrderedSet;
        let store = ShardedStore::with_shard_count(shard_count, track_order);
        let locks = LockPool::with_shard_count(shard_count);

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<CacheInner<K, V>>| {
            let ttl = match config.ttl_check {
                Some(interval) if !interval.is_zero() => {
                    let weak_for_ttl = weak.clone();
                    TtlManager::spawn(interval, move |key: K| {
                        if let Some(inner) = weak_for_ttl.upgrade() {
                            inner.expire_delete(&key);
                        }
                    })
                }
                _ => TtlManager::disabled(),
            };

            CacheInner { store, locks, ttl, callback, config }
        });

        Cache(inner)
    }

    /// Reads a key. Never blocks on the row lock. If `touch_on_read` is
    /// configured and the key is present, emits a `set_ttl` intent with
    /// the default TTL.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.0.store.lookup(key);
        if value.is_some() && self.0.config.touch_on_read {
            self.0.emit_ttl_intent(key, None);
        }
        value
    }

    /// Reads a key without acquiring the row lock and calls `f` on it if
    /// present. Does not touch TTL or fire a callback.
    pub fn with_existing<F, R>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&V) -> R,
    {
        let value = self.0.store.lookup(key)?;
        Some(f(&value))
    }

    /// `set_ttl(key, default)` if a default TTL is configured, else a
    /// no-op. Does not take the row lock.
    pub fn touch(&self, key: &K) {
        if self.0.config.ttl.is_some() {
            self.0.emit_ttl_intent(key, None);
        }
    }

    /// Writes `key`/`value` under the row lock, using the configured
    /// default TTL.
    pub fn put(&self, key: K, value: V) -> CacheResult<()> {
        self.put_opt(key, value, None, true)
    }

    /// As [`Cache::put`], with a per-item TTL override. `Duration::ZERO`
    /// means "never expire".
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) -> CacheResult<()> {
        self.put_opt(key, value, Some(ttl), true)
    }

    /// As [`Cache::put`], skipping the row lock. Still atomic at the
    /// store layer and still emits the TTL intent and callback.
    pub fn dirty_put(&self, key: K, value: V) -> CacheResult<()> {
        self.put_opt(key, value, None, false)
    }

    /// Dirty twin of [`Cache::put_with_ttl`].
    pub fn dirty_put_with_ttl(&self, key: K, value: V, ttl: Duration) -> CacheResult<()> {
        self.put_opt(key, value, Some(ttl), false)
    }

    fn put_opt(&self, key: K, value: V, ttl_override: Option<Duration>, locked: bool) -> CacheResult<()> {
        let inner = &self.0;
        let _token = if locked {
            Some(inner.locks.acquire(&key, inner.config.acquire_lock_timeout)?)
        } else {
            None
        };
        inner.store.insert(key.clone(), value.clone());
        inner.emit_ttl_intent(&key, ttl_override);
        inner.fire_update_callback(&key, &value)
    }

    /// Inserts `key`/`value` only if absent. Fails with
    /// `CacheError::AlreadyExists` if present; the store is unchanged.
    pub fn insert_new(&self, key: K, value: V) -> CacheResult<()> {
        self.insert_new_opt(key, value, None, true)
    }

    /// As [`Cache::insert_new`] with a per-item TTL override.
    pub fn insert_new_with_ttl(&self, key: K, value: V, ttl: Duration) -> CacheResult<()> {
        self.insert_new_opt(key, value, Some(ttl), true)
    }

    /// As [`Cache::insert_new`], skipping the row lock.
    pub fn dirty_insert_new(&self, key: K, value: V) -> CacheResult<()> {
        self.insert_new_opt(key, value, None, false)
    }

    /// Dirty twin of [`Cache::insert_new_with_ttl`].
    pub fn dirty_insert_new_with_ttl(&self, key: K, value: V, ttl: Duration) -> CacheResult<()> {
        self.insert_new_opt(key, value, Some(ttl), false)
    }

    fn insert_new_opt(&self, key: K, value: V, ttl_override: Option<Duration>, locked: bool) -> CacheResult<()> {
        let inner = &self.0;
        let _token = if locked {
            Some(inner.locks.acquire(&key, inner.config.acquire_lock_timeout)?)
        } else {
            None
        };
        if !inner.store.insert_if_absent(key.clone(), value.clone()) {
            return Err(CacheError::AlreadyExists);
        }
        inner.emit_ttl_intent(&key, ttl_override);
        inner.fire_update_callback(&key, &value)
    }

    /// Reads the current value under the row lock, passes it to `f`, and
    /// writes the result if `f` returns `UpdateOutcome::Change`. Returns
    /// `Ok(None)` on `NoChange` (no write, no callback), `Ok(Some(v))` on
    /// `Change(v)`.
    pub fn update<F>(&self, key: K, f: F) -> CacheResult<Option<V>>
    where
        F: FnOnce(Option<V>) -> UpdateOutcome<V>,
    {
        self.update_opt(key, f, None, true)
    }

    /// As [`Cache::update`] with a per-item TTL override applied when `f`
    /// changes the value.
    pub fn update_with_ttl<F>(&self, key: K, ttl: Duration, f: F) -> CacheResult<Option<V>>
    where
        F: FnOnce(Option<V>) -> UpdateOutcome<V>,
    {
        self.update_opt(key, f, Some(ttl), true)
    }

    /// As [`Cache::update`], skipping the row lock. Without the lock,
    /// concurrent dirty updates on the same key race on the read.
    pub fn dirty_update<F>(&self, key: K, f: F) -> CacheResult<Option<V>>
    where
        F: FnOnce(Option<V>) -> UpdateOutcome<V>,
    {
        self.update_opt(key, f, None, false)
    }

    /// Dirty twin of [`Cache::update_with_ttl`].
    pub fn dirty_update_with_ttl<F>(&self, key: K, ttl: Duration, f: F) -> CacheResult<Option<V>>
    where
        F: FnOnce(Option<V>) -> UpdateOutcome<V>,
    {
        self.update_opt(key, f, Some(ttl), false)
    }

    fn update_opt<F>(
        &self,
        key: K,
        f: F,
        ttl_override: Option<Duration>,
        locked: bool,
    ) -> CacheResult<Option<V>>
    where
        F: FnOnce(Option<V>) -> UpdateOutcome<V>,
    {
        let inner = &self.0;
        let _token = if locked {
            Some(inner.locks.acquire(&key, inner.config.acquire_lock_timeout)?)
        } else {
            None
        };
        let old = inner.store.lookup(&key);
        match f(old) {
            UpdateOutcome::NoChange => Ok(None),
            UpdateOutcome::Change(new_value) => {
                inner.store.insert(key.clone(), new_value.clone());
                inner.emit_ttl_intent(&key, ttl_override);
                inner.fire_update_callback(&key, &new_value)?;
                Ok(Some(new_value))
            }
        }
    }

    /// As [`Cache::update`], but fails with `CacheError::NotExisting` if
    /// the key is absent instead of passing `None` to `f`.
    pub fn update_existing<F>(&self, key: K, f: F) -> CacheResult<V>
    where
        F: FnOnce(V) -> UpdateOutcome<V>,
    {
        self.update_existing_opt(key, f, None, true)
    }

    /// As [`Cache::update_existing`] with a per-item TTL override.
    pub fn update_existing_with_ttl<F>(&self, key: K, ttl: Duration, f: F) -> CacheResult<V>
    where
        F: FnOnce(V) -> UpdateOutcome<V>,
    {
        self.update_existing_opt(key, f, Some(ttl), true)
    }

    /// As [`Cache::update_existing`], skipping the row lock.
    pub fn dirty_update_existing<F>(&self, key: K, f: F) -> CacheResult<V>
    where
        F: FnOnce(V) -> UpdateOutcome<V>,
    {
        self.update_existing_opt(key, f, None, false)
    }

    /// Dirty twin of [`Cache::update_existing_with_ttl`].
    pub fn dirty_update_existing_with_ttl<F>(&self, key: K, ttl: Duration, f: F) -> CacheResult<V>
    where
        F: FnOnce(V) -> UpdateOutcome<V>,
    {
        self.update_existing_opt(key, f, Some(ttl), false)
    }

    fn update_existing_opt<F>(
        &self,
        key: K,
        f: F,
        ttl_override: Option<Duration>,
        locked: bool,
    ) -> CacheResult<V>
    where
        F: FnOnce(V) -> UpdateOutcome<V>,
    {
        let inner = &self.0;
        let _token = if locked {
            Some(inner.locks.acquire(&key, inner.config.acquire_lock_timeout)?)
        } else {
            None
        };
        let old = inner.store.lookup(&key).ok_or(CacheError::NotExisting)?;
        match f(old.clone()) {
            UpdateOutcome::NoChange => Ok(old),
            UpdateOutcome::Change(new_value) => {
                inner.store.insert(key.clone(), new_value.clone());
                inner.emit_ttl_intent(&key, ttl_override);
                inner.fire_update_callback(&key, &new_value)?;
                Ok(new_value)
            }
        }
    }

    /// Deletes `key`. The delete callback (if any) fires before the store
    /// is modified, so it can still observe the removed value; if the
    /// callback fails, the store is left untouched and the error
    /// propagates.
    pub fn delete(&self, key: &K) -> CacheResult<Option<V>> {
        self.delete_opt(key, true)
    }

    /// As [`Cache::delete`], skipping the row lock.
    pub fn dirty_delete(&self, key: &K) -> CacheResult<Option<V>> {
        self.delete_opt(key, false)
    }

    fn delete_opt(&self, key: &K, locked: bool) -> CacheResult<Option<V>> {
        let inner = &self.0;
        let _token = if locked {
            Some(inner.locks.acquire(key, inner.config.acquire_lock_timeout)?)
        } else {
            None
        };
        let existing = inner.store.lookup(key);
        if let Some(value) = &existing {
            inner.fire_delete_callback(key, value)?;
        }
        inner.store.delete(key);
        inner.ttl.clear(key.clone());
        Ok(existing)
    }

    /// Returns the current value for `key`, or computes and stores one
    /// via `f` if absent. The lock is held only when a write actually
    /// happens.
    pub fn get_or_store<F>(&self, key: K, f: F) -> CacheResult<V>
    where
        F: FnOnce() -> V,
    {
        self.get_or_store_opt(key, f, None, true)
    }

    /// As [`Cache::get_or_store`] with a per-item TTL override applied on
    /// miss.
    pub fn get_or_store_with_ttl<F>(&self, key: K, ttl: Duration, f: F) -> CacheResult<V>
    where
        F: FnOnce() -> V,
    {
        self.get_or_store_opt(key, f, Some(ttl), true)
    }

    /// As [`Cache::get_or_store`], skipping the row lock.
    pub fn dirty_get_or_store<F>(&self, key: K, f: F) -> CacheResult<V>
    where
        F: FnOnce() -> V,
    {
        self.get_or_store_opt(key, f, None, false)
    }

    /// Dirty twin of [`Cache::get_or_store_with_ttl`].
    pub fn dirty_get_or_store_with_ttl<F>(&self, key: K, ttl: Duration, f: F) -> CacheResult<V>
    where
        F: FnOnce() -> V,
    {
        self.get_or_store_opt(key, f, Some(ttl), false)
    }

    fn get_or_store_opt<F>(
        &self,
        key: K,
        f: F,
        ttl_override: Option<Duration>,
        locked: bool,
    ) -> CacheResult<V>
    where
        F: FnOnce() -> V,
    {
        let inner = &self.0;
        let _token = if locked {
            Some(inner.locks.acquire(&key, inner.config.acquire_lock_timeout)?)
        } else {
            None
        };
        if let Some(existing) = inner.store.lookup(&key) {
            return Ok(existing);
        }
        let value = f();
        inner.store.insert(key.clone(), value.clone());
        inner.emit_ttl_intent(&key, ttl_override);
        inner.fire_update_callback(&key, &value)?;
        Ok(value)
    }

    /// Acquires the row lock for `id`, runs `f`, and releases it
    /// afterward, including on panic. Reentrant: nesting `isolated` calls
    /// on the same `id` from the same thread does not deadlock.
    pub fn isolated<F, R>(&self, id: &K, f: F) -> CacheResult<R>
    where
        F: FnOnce() -> R,
    {
        let _token = self.0.locks.acquire(id, self.0.config.acquire_lock_timeout)?;
        Ok(f())
    }

    /// As [`Cache::isolated`], but never blocks: fails immediately with
    /// `CacheError::Locked` if `id` is held by another thread.
    pub fn try_isolated<F, R>(&self, id: &K, f: F) -> CacheResult<R>
    where
        F: FnOnce() -> R,
    {
        let _token = self.0.locks.try_acquire(id)?;
        Ok(f())
    }

    /// Number of entries currently stored. Diagnostics only.
    pub fn len(&self) -> usize {
        self.0.store.len()
    }

    /// True if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.0.store.is_empty()
    }

    /// All keys currently stored. Diagnostics only; never called from the
    /// hot path.
    pub fn keys(&self) -> Vec<K> {
        self.0.store.iterate_keys()
    }
}

impl<K, V> CacheInner<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn emit_ttl_intent(&self, key: &K, ttl_override: Option<Duration>) {
        let ms = match ttl_override {
            Some(d) => duration_ms(d),
            None => self.config.ttl.map(duration_ms).unwrap_or(0),
        };
        if ms == 0 {
            self.ttl.clear(key.clone());
        } else {
            self.ttl.set_ttl(key.clone(), ms);
        }
    }

    fn fire_update_callback(&self, key: &K, value: &V) -> CacheResult<()> {
        let Some(cb) = &self.callback else { return Ok(()) };
        let event = CacheEvent::Update {
            cache: self.config.name.clone(),
            key: key.clone(),
            value: value.clone(),
        };
        cb(event).map_err(CacheError::CallbackFailed)
    }

    fn fire_delete_callback(&self, key: &K, value: &V) -> CacheResult<()> {
        let Some(cb) = &self.callback else { return Ok(()) };
        let event = CacheEvent::Delete {
            cache: self.config.name.clone(),
            key: key.clone(),
            value: value.clone(),
        };
        cb(event).map_err(CacheError::CallbackFailed)
    }

    /// Invoked off the TTL background thread when a key's deadline
    /// arrives. Runs the delete callback with the row lock held, same as
    /// a caller-invoked `delete`, but swallows (logs) a callback failure
    /// instead of propagating it: one failing callback must not stall
    /// expiry of every other key.
    fn expire_delete(&self, key: &K) {
        let token = match self.locks.acquire(key, self.config.acquire_lock_timeout) {
            Ok(token) => token,
            Err(_) => {
                // The wheel already dropped this key's deadline before
                // calling us, so reinstate a one-tick deadline or the
                // key would never expire again.
                tracing::warn!("ttl expiry could not acquire row lock in time, rescheduling for next tick");
                self.ttl.set_ttl(key.clone(), self.ttl.tick_ms());
                return;
            }
        };

        let existing = self.store.lookup(key);
        if let Some(value) = &existing {
            if let Err(err) = self.fire_delete_callback(key, value) {
                tracing::warn!(error = %err, "ttl expiry delete callback failed, deleting anyway");
            }
        }
        self.store.delete(key);
        drop(token);
    }
}
