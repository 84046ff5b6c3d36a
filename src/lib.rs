//! Named locks for stampede-free caching
//! =====================================
//!
//! `stampede-guard` coordinates concurrent work on the same resource
//! through reader/writer locks keyed by an arbitrary string, such as a cache key.
//!
//! The [`NamedLocker`] registry creates a lock entry on the first reference
//! to a name and forgets it once the last holder releases it:
//!
//! 1. [`NamedLocker::acquire()`] and [`NamedLocker::racquire()`] return exclusive
//!    and shared lock handles respectively. Releasing a handle consumes it.
//!
//! 2. [`ReadLock::upgrade()`] trades a shared hold for an exclusive one on the same
//!    entry, and [`WriteLock::write_lock_counter()`] tells the new holder whether
//!    other writers got in first.
//!
//! [`ObjectCache`] builds the classic cache stampede protection on top:
//! concurrent misses for one key result in a single upstream fetch.

pub mod cache;
pub mod error;
pub mod locks;

pub use crate::cache::{CacheObject, CacheStatus, ObjectCache};
pub use crate::error::{CacheError, LockError};
pub use crate::locks::{NamedLocker, ReadLock, WriteLock};
