//! rowcache-core - Row locks, TTL scheduling, and the cache operation
//! layer for the rowcache in-process concurrent key/value cache.

mod cache;
mod lock;
mod store;
mod ttl;

pub use cache::{Cache, CacheCallback};
pub use lock::{LockPool, LockToken};
pub use rowcache_common::{CacheConfig, CacheError, CacheEvent, CacheResult, CallbackError, StoreKind, UpdateOutcome};
pub use store::ShardedStore;
pub use ttl::TtlManager;
