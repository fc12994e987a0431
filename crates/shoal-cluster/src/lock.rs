//! Per-object lock table
//!
//! Read/write locks keyed by object uname, handed out as owned guards so
//! they can be held across await points and downgraded after a cold GET.
//! Entries are reference-counted and removed when the last guard drops;
//! the underlying `tokio::sync::RwLock` is write-preferring, so writers are
//! not starved by a continuous stream of readers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use xxhash_rust::xxh64::xxh64;

const NUM_SHARDS: usize = 64;

struct Entry {
    lock: Arc<RwLock<()>>,
    refs: usize,
}

/// Sharded table of per-uname locks
pub struct OlockTable {
    shards: Vec<Mutex<HashMap<String, Entry>>>,
}

impl OlockTable {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let shards = (0..NUM_SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Arc::new(Self { shards })
    }

    fn shard(&self, uname: &str) -> &Mutex<HashMap<String, Entry>> {
        let idx = xxh64(uname.as_bytes(), 0) as usize % NUM_SHARDS;
        &self.shards[idx]
    }

    fn acquire_entry(&self, uname: &str) -> Arc<RwLock<()>> {
        let mut shard = self.shard(uname).lock();
        let entry = shard.entry(uname.to_string()).or_insert_with(|| Entry {
            lock: Arc::new(RwLock::new(())),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.lock)
    }

    fn release_entry(&self, uname: &str) {
        let mut shard = self.shard(uname).lock();
        if let Some(entry) = shard.get_mut(uname) {
            entry.refs -= 1;
            if entry.refs == 0 {
                shard.remove(uname);
            }
        }
    }

    /// Acquire a shared (read) lock on `uname`
    pub async fn lock_shared(self: &Arc<Self>, uname: &str) -> ReadGuard {
        let lock = self.acquire_entry(uname);
        let release = Release {
            table: Arc::clone(self),
            uname: uname.to_string(),
        };
        ReadGuard {
            _guard: lock.read_owned().await,
            _release: release,
        }
    }

    /// Acquire an exclusive (write) lock on `uname`
    pub async fn lock_excl(self: &Arc<Self>, uname: &str) -> WriteGuard {
        let lock = self.acquire_entry(uname);
        let release = Release {
            table: Arc::clone(self),
            uname: uname.to_string(),
        };
        WriteGuard {
            guard: Some(lock.write_owned().await),
            release: Some(release),
        }
    }

    /// Try to acquire an exclusive lock without waiting
    #[must_use]
    pub fn try_lock_excl(self: &Arc<Self>, uname: &str) -> Option<WriteGuard> {
        let lock = self.acquire_entry(uname);
        match lock.try_write_owned() {
            Ok(guard) => Some(WriteGuard {
                guard: Some(guard),
                release: Some(Release {
                    table: Arc::clone(self),
                    uname: uname.to_string(),
                }),
            }),
            Err(_) => {
                self.release_entry(uname);
                None
            }
        }
    }

    /// Number of unames currently locked (or awaited on)
    #[must_use]
    pub fn num_locked(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

struct Release {
    table: Arc<OlockTable>,
    uname: String,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.table.release_entry(&self.uname);
    }
}

/// Shared lock guard; unlocks on drop
pub struct ReadGuard {
    _guard: OwnedRwLockReadGuard<()>,
    _release: Release,
}

/// Exclusive lock guard; unlocks on drop, or downgrades in place
pub struct WriteGuard {
    guard: Option<OwnedRwLockWriteGuard<()>>,
    release: Option<Release>,
}

impl WriteGuard {
    /// Atomically convert write -> read without releasing. Readers blocked
    /// on this uname proceed; writers keep waiting until the returned guard
    /// drops.
    #[must_use]
    pub fn downgrade(mut self) -> ReadGuard {
        let guard = self.guard.take().expect("guard present until downgrade");
        let release = self.release.take().expect("release present until downgrade");
        ReadGuard {
            _guard: OwnedRwLockWriteGuard::downgrade(guard),
            _release: release,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_exclusive_blocks_readers() {
        let table = OlockTable::new();
        let wguard = table.lock_excl("u1").await;
        assert!(timeout(Duration::from_millis(50), table.lock_shared("u1"))
            .await
            .is_err());
        drop(wguard);
        assert!(timeout(Duration::from_millis(50), table.lock_shared("u1"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_downgrade_admits_readers_blocks_writers() {
        let table = OlockTable::new();
        let wguard = table.lock_excl("u1").await;
        let rguard = wguard.downgrade();

        // readers proceed
        let r2 = timeout(Duration::from_millis(50), table.lock_shared("u1")).await;
        assert!(r2.is_ok());

        // writers wait until the downgraded guard drops
        assert!(timeout(Duration::from_millis(50), table.lock_excl("u1"))
            .await
            .is_err());
        drop(rguard);
        drop(r2);
        assert!(timeout(Duration::from_millis(50), table.lock_excl("u1"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_try_lock() {
        let table = OlockTable::new();
        let rguard = table.lock_shared("u1").await;
        assert!(table.try_lock_excl("u1").is_none());
        drop(rguard);
        assert!(table.try_lock_excl("u1").is_some());
    }

    #[tokio::test]
    async fn test_entries_cleaned_up() {
        let table = OlockTable::new();
        {
            let _a = table.lock_shared("u1").await;
            let _b = table.lock_shared("u2").await;
            assert_eq!(table.num_locked(), 2);
        }
        assert_eq!(table.num_locked(), 0);

        let g = table.lock_excl("u3").await;
        let r = g.downgrade();
        assert_eq!(table.num_locked(), 1);
        drop(r);
        assert_eq!(table.num_locked(), 0);
    }

    #[tokio::test]
    async fn test_distinct_unames_independent() {
        let table = OlockTable::new();
        let _w1 = table.lock_excl("u1").await;
        assert!(timeout(Duration::from_millis(50), table.lock_excl("u2"))
            .await
            .is_ok());
    }
}
