//! Callback event payloads.

/// Event delivered to the user callback after a successful mutation.
///
/// Update/insert events fire after the store has been written; delete
/// events fire before the store is modified, so the callback can still
/// observe the value being removed.
#[derive(Debug, Clone)]
pub enum CacheEvent<K, V> {
    /// A key was inserted or overwritten; carries the new value.
    Update {
        /// Name of the cache the event originated from, if configured.
        cache: Option<String>,
        /// The affected key.
        key: K,
        /// The value now stored for `key`.
        value: V,
    },
    /// A key was deleted; carries the value that was stored immediately
    /// before the delete.
    Delete {
        /// Name of the cache the event originated from, if configured.
        cache: Option<String>,
        /// The affected key.
        key: K,
        /// The value that was removed.
        value: V,
    },
}
