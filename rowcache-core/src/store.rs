//! # Backing store
//!
//! A sharded, generic concurrent key/value map supporting the atomic
//! operations the operation layer composes: `lookup`, `insert`,
//! `insert_if_absent`, `delete`, `iterate_keys`.
//!
//! ## Design Principles
//!
//! 1. **Sharded locks**: per-shard `RwLock`s reduce contention under
//!    concurrency; distinct-key writers never block each other beyond
//!    shard collisions.
//! 2. **Arc-backed keys**: shared between the map and the lock pool's
//!    shard routing without extra copies.
//! 3. **No eviction policy here**: TTL is the cache's only eviction
//!    mechanism; this store just holds whatever it is told to.
//!
//! ## Structure Overview
//!
//! ```text
//! ShardedStore<K, V>
//!   └── shards: Vec<Shard<K, V>>
//!         └── Shard
//!               └── inner: RwLock<HashMap<K, V, RandomState>>
//! ```

use std::hash::{BuildHasher, Hash, Hasher};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

/// Default shard multiplier relative to hardware parallelism.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

struct Shard<K, V> {
    inner: RwLock<ShardInner<K, V>>,
}

struct ShardInner<K, V> {
    map: HashMap<K, V, RandomState>,
    /// Insertion order, populated only when `track_order` is set
    /// (`StoreKind::OrderedSet`).
    order: Vec<K>,
}

impl<K, V> ShardInner<K, V> {
    fn new(hash_state: RandomState) -> Self {
        ShardInner {
            map: HashMap::with_hasher(hash_state),
            order: Vec::new(),
        }
    }
}

/// Sharded in-memory key/value store.
///
/// Generalizes the byte-slice-specific `MemoryEngine` shard layout to any
/// `K: Hash + Eq + Clone`, `V: Clone`. Holds no TTL metadata: the TTL
/// manager is a separate collaborator that deletes through this store when
/// entries expire.
pub struct ShardedStore<K, V> {
    shards: Vec<Shard<K, V>>,
    shard_mask: usize,
    hash_state: RandomState,
    track_order: bool,
}

impl<K, V> ShardedStore<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a new store with a default shard count based on CPU
    /// parallelism.
    pub fn new(track_order: bool) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        let shard_count = threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER);
        Self::with_shard_count(shard_count, track_order)
    }

    /// Creates a new store with a caller-provided shard count, normalized
    /// to the next power of two to enable fast masking.
    pub fn with_shard_count(shards: usize, track_order: bool) -> Self {
        let shard_count = normalize_shard_count(shards);
        let hash_state = RandomState::new();
        let mut shard_vec = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shard_vec.push(Shard {
                inner: RwLock::new(ShardInner::new(hash_state.clone())),
            });
        }

        ShardedStore {
            shards: shard_vec,
            shard_mask: shard_count - 1,
            hash_state,
            track_order,
        }
    }

    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = self.hash_state.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & self.shard_mask
    }

    fn shard_for(&self, key: &K) -> &Shard<K, V> {
        &self.shards[self.shard_index(key)]
    }

    /// Returns the current value for `key`, if present.
    pub fn lookup(&self, key: &K) -> Option<V> {
        let shard = self.shard_for(key);
        let inner = shard.inner.read();
        inner.map.get(key).cloned()
    }

    /// Overwrites the value for `key`, inserting it if absent.
    pub fn insert(&self, key: K, value: V) {
        let shard = self.shard_for(&key);
        let mut inner = shard.inner.write();
        if self.track_order && !inner.map.contains_key(&key) {
            inner.order.push(key.clone());
        }
        inner.map.insert(key, value);
    }

    /// Inserts `value` for `key` only if absent. Returns `true` if the
    /// insert happened.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let shard = self.shard_for(&key);
        let mut inner = shard.inner.write();
        if inner.map.contains_key(&key) {
            return false;
        }
        if self.track_order {
            inner.order.push(key.clone());
        }
        inner.map.insert(key, value);
        true
    }

    /// Removes `key`, returning its prior value if present.
    pub fn delete(&self, key: &K) -> Option<V> {
        let shard = self.shard_for(key);
        let mut inner = shard.inner.write();
        let removed = inner.map.remove(key);
        if removed.is_some() && self.track_order {
            inner.order.retain(|k| k != key);
        }
        removed
    }

    /// Returns every key currently stored.
    ///
    /// For `StoreKind::OrderedSet` stores, each shard's keys are returned
    /// in insertion order; overall order across shards is shard order.
    /// For `StoreKind::Set` stores, order is unspecified. Diagnostics use
    /// only; never called from the hot path.
    pub fn iterate_keys(&self) -> Vec<K> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            let inner = shard.inner.read();
            if self.track_order {
                keys.extend(inner.order.iter().cloned());
            } else {
                keys.extend(inner.map.keys().cloned());
            }
        }
        keys
    }

    /// Number of entries across all shards. Diagnostics only.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.inner.read().map.len()).sum()
    }

    /// Returns true if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Normalizes shard counts to a power of two for fast masking.
fn normalize_shard_count(count: usize) -> usize {
    let count = count.max(1);
    count.next_power_of_two()
}
