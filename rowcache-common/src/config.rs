//! Cache configuration.
//!
//! A plain data struct with builder-style setter methods, every field
//! documented, `Clone` for cheap reuse across cache instances.

use std::time::Duration;

/// Backing-store iteration flavor.
///
/// Named after the source system's ETS "set"/"ordered set" table types.
/// `rowcache` has no ETS underneath, so this only governs the order
/// `iterate_keys()` returns entries in; it has no effect on `get`/`put`
/// semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    /// Iteration order is unspecified (whatever the shard/bucket order
    /// happens to be). Cheapest; the default.
    #[default]
    Set,
    /// Iteration order follows insertion order.
    OrderedSet,
}

/// Configuration for one cache instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Opaque handle identity, meaningful only to the embedding host.
    pub name: Option<String>,
    /// Tick length for the TTL background loop. `None`/zero disables TTL
    /// entirely: entries never expire.
    pub ttl_check: Option<Duration>,
    /// Default item lifetime. `None`/zero means "never expire" unless a
    /// per-item override is supplied.
    pub ttl: Option<Duration>,
    /// When true, `get` emits a `set_ttl` intent refreshing the default
    /// TTL on every successful read.
    pub touch_on_read: bool,
    /// Row lock acquisition timeout. Default 5 seconds per spec.
    pub acquire_lock_timeout: Duration,
    /// Backing store iteration flavor.
    pub store_kind: StoreKind,
    /// Number of lock/store shards. Defaults to hardware parallelism.
    pub shard_count: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            name: None,
            ttl_check: None,
            ttl: None,
            touch_on_read: false,
            acquire_lock_timeout: Duration::from_secs(5),
            store_kind: StoreKind::default(),
            shard_count: None,
        }
    }
}

impl CacheConfig {
    /// Creates a default configuration: TTL disabled, no touch-on-read,
    /// 5 second lock timeout, `Set` iteration order.
    pub fn new() -> Self {
        CacheConfig::default()
    }

    /// Sets the tick length for the TTL loop.
    pub fn with_ttl_check(mut self, interval: Duration) -> Self {
        self.ttl_check = Some(interval);
        self
    }

    /// Sets the default item lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Enables `touch_on_read`.
    pub fn with_touch_on_read(mut self, enabled: bool) -> Self {
        self.touch_on_read = enabled;
        self
    }

    /// Overrides the row lock acquisition timeout.
    pub fn with_acquire_lock_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_lock_timeout = timeout;
        self
    }

    /// Overrides the backing store iteration flavor.
    pub fn with_store_kind(mut self, kind: StoreKind) -> Self {
        self.store_kind = kind;
        self
    }

    /// Overrides the shard count (both lock pool and backing store).
    pub fn with_shard_count(mut self, count: usize) -> Self {
        self.shard_count = Some(count);
        self
    }
}
