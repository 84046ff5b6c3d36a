//! Stampede-protected in-memory object cache

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, trace};
use parking_lot::RwLock;

use crate::error::{CacheError, LockError};
use crate::locks::NamedLocker;

/// HTTP 200 OK, the only cacheable upstream status
const STATUS_OK: u16 = 200;

/// Cached upstream response object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheObject {
    /// HTTP response status code
    status: u16,
    /// HTTP Content-Type header
    content_type: Option<String>,
    /// HTTP Last-Modified header
    mtime: Option<SystemTime>,
    /// Response body
    data: Vec<u8>,
    /// Object creation time
    stored: Instant,
}

impl CacheObject {
    /// Creates a response object stamped with the current time.
    #[must_use]
    pub fn new(status: u16, data: Vec<u8>) -> Self {
        CacheObject {
            status,
            content_type: None,
            mtime: None,
            data,
            stored: Instant::now(),
        }
    }

    /// Sets the HTTP Content-Type metadata.
    #[must_use]
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Sets the HTTP Last-Modified metadata.
    #[must_use]
    pub fn with_last_modified(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    #[must_use]
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.mtime
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the object, returning the response body.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Gets the time elapsed since the object was fetched.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.stored.elapsed()
    }

    /// Checks if the object may be stored in the cache.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Checks if this object is expired according to the TTL given.
    #[must_use]
    pub fn is_expired_with_ttl(&self, ttl: &Duration) -> bool {
        self.age() > *ttl
    }
}

/// Cache lookup outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the cache right away.
    Hit,
    /// Fetched from upstream by this caller.
    Miss,
    /// Served from the cache after waiting on another caller's fetch.
    Coalesced,
}

impl Display for CacheStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Coalesced => "coalesced",
        })
    }
}

/// Volatile response object cache
///
/// Concurrent misses for the same key are coalesced: one caller fetches
/// from upstream while the others wait on the key's named lock and are then
/// served the stored object.
#[derive(Debug)]
pub struct ObjectCache {
    /// Per-key locks
    locks: NamedLocker,
    /// Cached objects by key
    objects: RwLock<BTreeMap<String, CacheObject>>,
    /// Object Time-to-Live
    ttl: Duration,
}

impl ObjectCache {
    /// Creates an empty cache with its own lock registry.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::with_locker(NamedLocker::new(), ttl)
    }

    /// Creates an empty cache using an existing lock registry.
    #[must_use]
    pub fn with_locker(locks: NamedLocker, ttl: Duration) -> Self {
        ObjectCache {
            locks,
            objects: RwLock::new(BTreeMap::new()),
            ttl,
        }
    }

    /// Gets the lock registry guarding the cache keys.
    #[must_use]
    pub fn locks(&self) -> &NamedLocker {
        &self.locks
    }

    /// Gets the object Time-to-Live.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Gets the number of stored objects, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Fetches a fresh object from memory without taking the key lock.
    fn lookup(&self, key: &str) -> Option<CacheObject> {
        self.objects
            .read()
            .get(key)
            .filter(|object| !object.is_expired_with_ttl(&self.ttl))
            .cloned()
    }

    /// Fetches a fresh object for `key`, if present.
    pub fn get(&self, key: &str) -> Result<Option<CacheObject>, LockError> {
        let lock = self.locks.racquire(key)?;
        let object = self.lookup(key);
        lock.rrelease();

        Ok(object)
    }

    /// Stores `object` under `key`, replacing any previous one.
    pub fn insert(&self, key: &str, object: CacheObject) -> Result<(), LockError> {
        let lock = self.locks.acquire(key)?;
        self.objects.write().insert(key.to_owned(), object);
        lock.release();

        Ok(())
    }

    /// Erases the object stored under `key`.
    pub fn purge(&self, key: &str) -> Result<Option<CacheObject>, LockError> {
        let lock = self.locks.acquire(key)?;
        let object = self.objects.write().remove(key);
        lock.release();

        if object.is_some() {
            debug!("cache: purged {key}");
        }

        Ok(object)
    }

    /// Erases all expired objects, returning how many were dropped.
    ///
    /// Keys that are never requested again are only reclaimed here.
    pub fn purge_expired(&self) -> usize {
        let mut objects = self.objects.write();
        let before = objects.len();

        objects.retain(|_, object| !object.is_expired_with_ttl(&self.ttl));

        let purged = before - objects.len();
        if purged > 0 {
            debug!("cache: purged {purged} expired objects");
        }

        purged
    }

    /// Serves `key` from the cache, calling `fetch` on a miss.
    ///
    /// At most one caller per key runs `fetch` at a time. Callers queued
    /// behind it re-check the cache before fetching again.
    /// Objects that are not cacheable are returned but not stored.
    pub fn fetch_with<F, E>(
        &self,
        key: &str,
        fetch: F,
    ) -> Result<(CacheStatus, CacheObject), CacheError<E>>
    where
        F: FnOnce() -> Result<CacheObject, E>,
    {
        let lock = self.locks.racquire(key)?;

        if let Some(object) = self.lookup(key) {
            trace!("cache: hit for {key}");
            lock.rrelease();
            return Ok((CacheStatus::Hit, object));
        }

        let lock = lock.upgrade();

        // Another writer held the key first and may have filled it already.
        if lock.write_lock_counter() > 1 {
            if let Some(object) = self.lookup(key) {
                debug!("cache: coalesced request for {key}");
                lock.release();
                return Ok((CacheStatus::Coalesced, object));
            }
        }

        // Whatever is still stored here has expired.
        if self.objects.write().remove(key).is_some() {
            debug!("cache: dropped expired object for {key}");
        }

        debug!("cache: miss for {key}, fetching...");

        let object = fetch().map_err(CacheError::Fetch)?;

        if object.is_cacheable() {
            self.objects.write().insert(key.to_owned(), object.clone());
        } else {
            debug!(
                "cache: not storing HTTP status {} for {key}",
                object.status()
            );
        }

        lock.release();

        Ok((CacheStatus::Miss, object))
    }
}
