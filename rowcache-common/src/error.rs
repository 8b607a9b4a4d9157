//! Structured error kinds shared by every `rowcache` operation.
//!
//! Mirrors the tagged-error convention the cache is built around: callers
//! match on a kind, never a message.

use std::fmt;

/// Result alias used throughout `rowcache`.
pub type CacheResult<T> = Result<T, CacheError>;

/// Error surfaced by a cache operation.
///
/// # Errors
/// See the individual variants for which operation produces each kind.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// `insert_new`/`dirty_insert_new` found the key already present.
    #[error("key already exists")]
    AlreadyExists,

    /// `update_existing`/`with_existing` found the key absent.
    #[error("key does not exist")]
    NotExisting,

    /// `try_isolated` found the lock-id already held by another owner.
    #[error("lock id is held by another owner")]
    Locked,

    /// Row lock acquisition exceeded `acquire_lock_timeout`. The operation
    /// did not run.
    #[error("timed out acquiring row lock")]
    LockTimeout,

    /// The user callback returned an error. The underlying store mutation
    /// has already happened for update/insert callbacks, and has not
    /// happened for delete callbacks (the callback runs before `delete`).
    #[error("callback failed: {0}")]
    CallbackFailed(#[source] CallbackError),
}

/// Opaque error returned by a user-supplied callback.
///
/// Boxed so callbacks can report any error type without the cache needing
/// to know it.
pub struct CallbackError(pub Box<dyn std::error::Error + Send + Sync + 'static>);

impl CallbackError {
    /// Wraps any error implementing `std::error::Error`.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CallbackError(Box::new(err))
    }
}

impl fmt::Debug for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for CallbackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}
