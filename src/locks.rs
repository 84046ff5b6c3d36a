//! Named reader/writer locks keyed by arbitrary strings
//!
//! A [`NamedLocker`] hands out exclusive ([`WriteLock`]) and shared
//! ([`ReadLock`]) holds on lock entries created on demand for each name.
//! Entries are reference counted and disappear from the registry as soon as
//! the last holder or waiter lets go.
//!
//! The registry map is only locked for lookup, insertion and removal.
//! Blocking always happens on the per-name lock, so distinct names never
//! serialize each other.
//!
//! The pending write flag ([`ReadLock::write_lock_mode()`]) is advisory:
//! every `racquire()` clears it, even while a writer is still queued.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::panic::resume_unwind;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Weak};
use std::thread;

use log::trace;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};

use crate::error::LockError;

/// Upgrade helper thread name, independent of the lock name
const UPGRADE_THREAD_NAME: &str = "lock-upgrade";

/// Registry map shared between the locker and its entries
type LockMap = Mutex<HashMap<String, Arc<LockEntry>>>;

/// Registry of named locks
///
/// Cloning the locker yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct NamedLocker {
    locks: Arc<LockMap>,
}

/// Per-name lock state
struct LockEntry {
    /// Registry key, never empty
    name: String,
    /// Reader/writer lock held across handle lifetimes
    raw: RawRwLock,
    /// Number of outstanding acquire-to-release spans
    queue_size: AtomicI32,
    /// Set while a writer is (or was recently) waiting
    write_lock_mode: AtomicBool,
    /// Exclusive acquisitions over the entry lifetime
    write_lock_count: AtomicUsize,
    /// Owning registry, for self-removal
    locker: Weak<LockMap>,
}

impl LockEntry {
    fn new(name: &str, locker: &Arc<LockMap>) -> Self {
        LockEntry {
            name: name.to_owned(),
            raw: RawRwLock::INIT,
            queue_size: AtomicI32::new(0),
            write_lock_mode: AtomicBool::new(false),
            write_lock_count: AtomicUsize::new(0),
            locker: Arc::downgrade(locker),
        }
    }

    /// Blocks until the exclusive lock is granted.
    fn lock_exclusive(&self) {
        self.raw.lock_exclusive();
        self.write_lock_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference, removing the entry from the registry on the last one.
    fn dequeue(self: &Arc<Self>) {
        if self.queue_size.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let Some(locker) = self.locker.upgrade() else {
            return;
        };

        let mut locks = locker.lock();

        // Somebody may have looked this entry up again before we got the map.
        let idle = self.queue_size.load(Ordering::Acquire) == 0;
        let current = locks
            .get(&self.name)
            .is_some_and(|entry| Arc::ptr_eq(entry, self));

        if idle && current {
            locks.remove(&self.name);
            trace!("locks: removed idle entry {}", self.name);
        }
    }
}

impl NamedLocker {
    /// Creates an empty lock registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds or creates the entry for `name` and registers one more reference on it.
    fn enqueue(&self, name: &str) -> Result<Arc<LockEntry>, LockError> {
        if name.is_empty() {
            return Err(LockError::InvalidName(name.to_owned()));
        }

        let mut locks = self.locks.lock();

        let entry = locks.entry(name.to_owned()).or_insert_with(|| {
            trace!("locks: created entry {name}");
            Arc::new(LockEntry::new(name, &self.locks))
        });

        entry.queue_size.fetch_add(1, Ordering::AcqRel);

        Ok(Arc::clone(entry))
    }

    /// Locks `name` for writing, blocking until the exclusive lock is granted.
    pub fn acquire(&self, name: &str) -> Result<WriteLock, LockError> {
        let entry = self.enqueue(name)?;

        entry.write_lock_mode.store(true, Ordering::Release);
        entry.lock_exclusive();

        Ok(WriteLock { entry })
    }

    /// Locks `name` for reading, blocking until the shared lock is granted.
    pub fn racquire(&self, name: &str) -> Result<ReadLock, LockError> {
        let entry = self.enqueue(name)?;

        entry.write_lock_mode.store(false, Ordering::Release);
        entry.raw.lock_shared();

        Ok(ReadLock { entry })
    }

    /// Gets the number of names currently held or waited on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Checks if no name is currently held or waited on.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    /// Checks if the registry currently tracks an entry for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.locks.lock().contains_key(name)
    }
}

impl Debug for NamedLocker {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("NamedLocker")
            .field("entries", &self.len())
            .finish()
    }
}

/// Exclusive hold on a named lock
///
/// The lock is released by [`WriteLock::release()`] or on drop.
#[must_use = "dropping the handle releases the lock"]
pub struct WriteLock {
    entry: Arc<LockEntry>,
}

impl WriteLock {
    /// Releases the exclusive lock.
    pub fn release(self) {
        drop(self);
    }

    /// Gets the lock name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Gets the number of exclusive acquisitions of this entry so far,
    /// including the current one.
    ///
    /// Values greater than one tell the holder that another writer
    /// got the lock first and the protected state may have changed.
    #[must_use]
    pub fn write_lock_counter(&self) -> usize {
        self.entry.write_lock_count.load(Ordering::Relaxed)
    }

    /// Checks if a writer is waiting for this entry.
    #[must_use]
    pub fn write_lock_mode(&self) -> bool {
        self.entry.write_lock_mode.load(Ordering::Acquire)
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        self.entry.write_lock_mode.store(false, Ordering::Release);
        self.entry.dequeue();

        // SAFETY: a `WriteLock` only exists while its exclusive lock is held,
        // and `drop()` runs exactly once.
        unsafe { self.entry.raw.unlock_exclusive() };
    }
}

impl Debug for WriteLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("WriteLock")
            .field("name", &self.entry.name)
            .finish_non_exhaustive()
    }
}

/// Shared hold on a named lock
///
/// The lock is released by [`ReadLock::rrelease()`], by [`ReadLock::upgrade()`]
/// or on drop.
#[must_use = "dropping the handle releases the lock"]
pub struct ReadLock {
    entry: Arc<LockEntry>,
}

impl ReadLock {
    /// Releases the shared lock.
    pub fn rrelease(self) {
        drop(self);
    }

    /// Gets the lock name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Gets the number of exclusive acquisitions of this entry so far.
    ///
    /// Only advisory for shared holders.
    #[must_use]
    pub fn write_lock_counter(&self) -> usize {
        self.entry.write_lock_count.load(Ordering::Relaxed)
    }

    /// Checks if a writer is waiting for this entry.
    #[must_use]
    pub fn write_lock_mode(&self) -> bool {
        self.entry.write_lock_mode.load(Ordering::Acquire)
    }

    /// Trades the shared lock for an exclusive lock on the same entry.
    ///
    /// The entry keeps its identity across the upgrade, so the returned handle's
    /// [`WriteLock::write_lock_counter()`] reveals whether other writers held the
    /// lock in the meantime. Other writers may well get in first: the shared lock
    /// is given up before the exclusive lock is requested.
    ///
    /// The write intent is registered on a helper thread before the shared
    /// hold goes away, so the entry can not drop out of the registry mid-way.
    pub fn upgrade(self) -> WriteLock {
        let entry = Arc::clone(&self.entry);
        let (intent_tx, intent_rx) = sync_channel::<()>(1);

        thread::scope(|scope| {
            let writer_entry = &entry;

            let writer = thread::Builder::new()
                .name(UPGRADE_THREAD_NAME.to_owned())
                .spawn_scoped(scope, move || {
                    writer_entry.queue_size.fetch_add(1, Ordering::AcqRel);
                    intent_tx.send(()).ok();

                    writer_entry.write_lock_mode.store(true, Ordering::Release);
                    writer_entry.lock_exclusive();
                })
                .expect("failed to spawn the lock upgrade thread");

            // The intent channel only disconnects early if the writer panicked,
            // which `join()` below reports.
            intent_rx.recv().ok();
            self.rrelease();

            if let Err(panic) = writer.join() {
                resume_unwind(panic);
            }
        });

        trace!("locks: upgraded entry {}", entry.name);

        WriteLock { entry }
    }
}

impl Drop for ReadLock {
    fn drop(&mut self) {
        self.entry.dequeue();

        // SAFETY: a `ReadLock` only exists while its shared lock is held,
        // and `drop()` runs exactly once.
        unsafe { self.entry.raw.unlock_shared() };
    }
}

impl Debug for ReadLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ReadLock")
            .field("name", &self.entry.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    /// Polls `cond` until it holds or a generous deadline passes.
    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);

        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }

        cond()
    }

    /// Reads the reference count of a registered entry.
    fn queue_size(locker: &NamedLocker, name: &str) -> i32 {
        locker
            .locks
            .lock()
            .get(name)
            .map_or(0, |entry| entry.queue_size.load(Ordering::SeqCst))
    }

    #[test]
    fn test_invalid_name() {
        let locker = NamedLocker::new();

        assert_eq!(
            locker.acquire("").unwrap_err(),
            LockError::InvalidName(String::new())
        );
        assert!(matches!(
            locker.racquire(""),
            Err(LockError::InvalidName(_))
        ));
        assert!(locker.is_empty());
    }

    #[test]
    fn test_entry_lifecycle() {
        let locker = NamedLocker::new();

        let lock = locker.acquire("k").unwrap();
        assert_eq!(lock.name(), "k");
        assert_eq!(lock.write_lock_counter(), 1);
        assert!(lock.write_lock_mode());
        assert!(locker.contains("k"));
        assert_eq!(locker.len(), 1);

        lock.release();
        assert!(!locker.contains("k"));
        assert!(locker.is_empty());

        // A fresh entry starts counting from scratch.
        let lock = locker.acquire("k").unwrap();
        assert_eq!(lock.write_lock_counter(), 1);
        drop(lock);
        assert!(locker.is_empty());

        let r1 = locker.racquire("k").unwrap();
        let r2 = locker.racquire("k").unwrap();
        assert_eq!(r1.write_lock_counter(), 0);
        assert!(!r1.write_lock_mode());

        r1.rrelease();
        assert!(locker.contains("k"));
        r2.rrelease();
        assert!(locker.is_empty());
    }

    #[test]
    fn test_distinct_names_do_not_block() {
        let locker = NamedLocker::new();

        let a = locker.acquire("a").unwrap();
        let b = locker.acquire("b").unwrap();
        assert_eq!(locker.len(), 2);

        a.release();
        b.release();
        assert!(locker.is_empty());
    }

    #[test]
    fn test_exclusive_handoff() {
        let locker = NamedLocker::new();
        let held = Arc::new(AtomicBool::new(false));

        let first = locker.acquire("k").unwrap();
        held.store(true, Ordering::SeqCst);

        let second = {
            let locker = locker.clone();
            let held = Arc::clone(&held);
            thread::spawn(move || {
                let lock = locker.acquire("k").unwrap();
                assert!(!held.load(Ordering::SeqCst));
                lock.write_lock_counter()
            })
        };

        assert!(wait_for(|| queue_size(&locker, "k") == 2));
        thread::sleep(Duration::from_millis(50));
        held.store(false, Ordering::SeqCst);
        first.release();

        assert_eq!(second.join().unwrap(), 2);
        assert!(locker.is_empty());
    }

    #[test]
    fn test_shared_holders_block_writer() {
        const READERS: usize = 5;

        let locker = NamedLocker::new();
        let active = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(READERS + 1));

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let locker = locker.clone();
                let active = Arc::clone(&active);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let lock = locker.racquire("k").unwrap();
                    active.fetch_add(1, Ordering::SeqCst);

                    // Every reader gets here while the others still hold.
                    barrier.wait();

                    thread::sleep(Duration::from_millis(50));
                    active.fetch_sub(1, Ordering::SeqCst);
                    lock.rrelease();
                })
            })
            .collect();

        barrier.wait();
        assert_eq!(active.load(Ordering::SeqCst), READERS);

        let lock = locker.acquire("k").unwrap();
        assert_eq!(active.load(Ordering::SeqCst), 0);
        lock.release();

        for reader in readers {
            reader.join().unwrap();
        }
        assert!(locker.is_empty());
    }

    #[test]
    fn test_no_lost_updates() {
        const WRITERS: usize = 100;

        let locker = NamedLocker::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let writers: Vec<_> = (0..WRITERS)
            .map(|_| {
                let locker = locker.clone();
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let lock = locker.acquire("k").unwrap();
                    // Deliberately non-atomic read-modify-write.
                    let value = counter.load(Ordering::Relaxed);
                    thread::yield_now();
                    counter.store(value + 1, Ordering::Relaxed);
                    lock.release();
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), WRITERS);
        assert!(locker.is_empty());
    }

    #[test]
    fn test_upgrade() {
        let locker = NamedLocker::new();

        let lock = locker.racquire("k").unwrap();
        let before = lock.write_lock_counter();

        let lock = lock.upgrade();
        assert!(lock.write_lock_counter() > before);
        assert!(lock.write_lock_mode());
        assert_eq!(locker.len(), 1);

        lock.release();
        assert!(locker.is_empty());
    }

    #[test]
    fn test_upgrade_signals_pending_write() {
        let locker = NamedLocker::new();

        let upgrader = locker.racquire("k").unwrap();
        let observer = locker.racquire("k").unwrap();
        assert!(!observer.write_lock_mode());

        let done = Arc::new(AtomicBool::new(false));
        let upgrade = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let lock = upgrader.upgrade();
                done.store(true, Ordering::SeqCst);
                lock.write_lock_counter()
            })
        };

        // The observer's shared hold keeps the upgrade waiting.
        assert!(wait_for(|| observer.write_lock_mode()));
        assert!(!done.load(Ordering::SeqCst));
        assert!(locker.contains("k"));

        observer.rrelease();

        assert_eq!(upgrade.join().unwrap(), 1);
        assert!(done.load(Ordering::SeqCst));
        assert!(locker.is_empty());
    }

    #[test]
    fn test_upgrade_excludes_others() {
        let locker = NamedLocker::new();
        let lock = locker.racquire("k").unwrap().upgrade();
        let entered = Arc::new(AtomicBool::new(false));

        let reader = {
            let locker = locker.clone();
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let lock = locker.racquire("k").unwrap();
                entered.store(true, Ordering::SeqCst);
                lock.rrelease();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        lock.release();
        reader.join().unwrap();

        assert!(entered.load(Ordering::SeqCst));
        assert!(locker.is_empty());
    }

    #[test]
    fn test_concurrent_upgrades() {
        let locker = NamedLocker::new();
        let barrier = Arc::new(Barrier::new(2));

        let upgraders: Vec<_> = (0..2)
            .map(|_| {
                let locker = locker.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let lock = locker.racquire("k").unwrap();
                    barrier.wait();
                    lock.upgrade().write_lock_counter()
                })
            })
            .collect();

        let mut counters: Vec<usize> = upgraders
            .into_iter()
            .map(|upgrader| upgrader.join().unwrap())
            .collect();
        counters.sort_unstable();

        assert_eq!(counters, [1, 2]);
        assert!(locker.is_empty());
    }

    #[test]
    fn test_reader_clears_pending_write() {
        let locker = NamedLocker::new();

        let reader = locker.racquire("k").unwrap();

        let writer = {
            let locker = locker.clone();
            thread::spawn(move || locker.acquire("k").unwrap().release())
        };

        assert!(wait_for(|| reader.write_lock_mode()));

        // A late reader overwrites the flag while the writer is still queued.
        let late = {
            let locker = locker.clone();
            thread::spawn(move || locker.racquire("k").unwrap().rrelease())
        };

        assert!(wait_for(|| !reader.write_lock_mode()));

        reader.rrelease();
        writer.join().unwrap();
        late.join().unwrap();

        assert!(locker.is_empty());
    }

    #[test]
    fn test_handle_outlives_registry() {
        let locker = NamedLocker::new();
        let lock = locker.acquire("k").unwrap();

        drop(locker);

        assert_eq!(lock.write_lock_counter(), 1);
        lock.release();
    }

    #[test]
    fn test_upgrade_any_name() {
        let locker = NamedLocker::new();

        for name in ["a\0b", "\0", "k\n\u{7f}", "ключ"] {
            let lock = locker.racquire(name).unwrap().upgrade();
            assert_eq!(lock.name(), name);
            assert_eq!(lock.write_lock_counter(), 1);
            lock.release();
        }

        assert!(locker.is_empty());
    }

    #[test]
    fn test_entry_churn() {
        const WRITERS: usize = 4;
        const WRITES: usize = 2000;
        const UPGRADERS: usize = 2;
        const UPGRADES: usize = 200;

        let locker = NamedLocker::new();
        let writing = Arc::new(AtomicBool::new(false));
        let reading = Arc::new(AtomicUsize::new(0));

        // Checks that no other holder is inside, then leaves again.
        fn exclusive_section(writing: &AtomicBool, reading: &AtomicUsize) {
            assert!(!writing.swap(true, Ordering::SeqCst));
            assert_eq!(reading.load(Ordering::SeqCst), 0);
            thread::yield_now();
            writing.store(false, Ordering::SeqCst);
        }

        let writers = (0..WRITERS).map(|_| {
            let locker = locker.clone();
            let writing = Arc::clone(&writing);
            let reading = Arc::clone(&reading);
            thread::spawn(move || {
                for _ in 0..WRITES {
                    let lock = locker.acquire("k").unwrap();
                    exclusive_section(&writing, &reading);
                    lock.release();
                }
            })
        });

        let upgraders = (0..UPGRADERS).map(|_| {
            let locker = locker.clone();
            let writing = Arc::clone(&writing);
            let reading = Arc::clone(&reading);
            thread::spawn(move || {
                for _ in 0..UPGRADES {
                    let lock = locker.racquire("k").unwrap();
                    reading.fetch_add(1, Ordering::SeqCst);
                    assert!(!writing.load(Ordering::SeqCst));
                    reading.fetch_sub(1, Ordering::SeqCst);

                    let lock = lock.upgrade();
                    exclusive_section(&writing, &reading);
                    lock.release();
                }
            })
        });

        let threads: Vec<_> = writers.chain(upgraders).collect();
        for handle in threads {
            handle.join().unwrap();
        }

        assert!(!writing.load(Ordering::SeqCst));
        assert!(locker.is_empty());

        // The registry still hands out working entries afterwards.
        let lock = locker.acquire("k").unwrap();
        assert_eq!(lock.write_lock_counter(), 1);
        lock.release();
        assert!(locker.is_empty());
    }
}
