//! Named lock and object cache error types

use thiserror::Error;

/// Named lock registry error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// Lock names must be non-empty.
    #[error("invalid lock name: {0:?}")]
    InvalidName(String),
}

/// Object cache lookup error
///
/// `E` is the error type returned by the upstream fetch callback.
#[derive(Debug, Error)]
pub enum CacheError<E> {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("upstream fetch failed: {0}")]
    Fetch(E),
}
