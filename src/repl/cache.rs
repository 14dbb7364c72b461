//! Donor-side ordered write-set cache.
//!
//! The cache retains a bounded tail of the group stream. A donor serving an
//! incremental transfer takes a seqno lock at the joiner's resume point;
//! while the lock is held at `L`, no write-set with seqno >= `L` is evicted.
//! The lock is a linear capability (`SeqnoLockGuard`): released exactly
//! once, either when the guard drops on a donor-side error or when the
//! sender that took ownership finishes streaming.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use uuid::Uuid;

use crate::core::{Seqno, WriteSet};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("seqno {seqno} not in cache (low-water {low_water})")]
    NotFound { seqno: Seqno, low_water: Seqno },
    #[error("cache already locked at {locked_at}")]
    AlreadyLocked { locked_at: Seqno },
}

#[derive(Debug)]
struct CacheInner {
    uuid: Uuid,
    sets: BTreeMap<i64, WriteSet>,
    capacity: usize,
    locked_at: Option<i64>,
}

impl CacheInner {
    fn low_water(&self) -> Seqno {
        self.sets
            .keys()
            .next()
            .copied()
            .map(Seqno::new)
            .unwrap_or(Seqno::UNDEFINED)
    }

    fn trim(&mut self) {
        while self.sets.len() > self.capacity {
            let Some(front) = self.sets.keys().next().copied() else {
                break;
            };
            if let Some(locked) = self.locked_at
                && front >= locked
            {
                break;
            }
            self.sets.remove(&front);
        }
    }
}

#[derive(Debug)]
pub struct WriteSetCache {
    inner: Mutex<CacheInner>,
}

impl WriteSetCache {
    pub fn new(uuid: Uuid, capacity: usize) -> Self {
        WriteSetCache {
            inner: Mutex::new(CacheInner {
                uuid,
                sets: BTreeMap::new(),
                capacity,
                locked_at: None,
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.lock().uuid
    }

    /// Smallest seqno still retained, `UNDEFINED` when empty.
    pub fn low_water(&self) -> Seqno {
        self.lock().low_water()
    }

    pub fn high_water(&self) -> Seqno {
        self.lock()
            .sets
            .keys()
            .next_back()
            .copied()
            .map(Seqno::new)
            .unwrap_or(Seqno::UNDEFINED)
    }

    pub fn append(&self, ws: WriteSet) {
        let mut inner = self.lock();
        inner.sets.insert(ws.seqno.get(), ws);
        inner.trim();
    }

    pub fn get(&self, seqno: Seqno) -> Option<WriteSet> {
        self.lock().sets.get(&seqno.get()).cloned()
    }

    /// Drop all cached write-sets and rebase the cache on a new position.
    pub fn seqno_reset(&self, uuid: Uuid, _seqno: Seqno) {
        let mut inner = self.lock();
        inner.uuid = uuid;
        inner.sets.clear();
    }

    /// Pin the cache at `seqno`. Fails with `NotFound` when the requested
    /// starting point has already been evicted (or was never cached).
    pub fn seqno_lock(self: &Arc<Self>, seqno: Seqno) -> Result<SeqnoLockGuard, CacheError> {
        let mut inner = self.lock();
        if let Some(locked_at) = inner.locked_at {
            return Err(CacheError::AlreadyLocked {
                locked_at: Seqno::new(locked_at),
            });
        }
        if !inner.sets.contains_key(&seqno.get()) {
            return Err(CacheError::NotFound {
                seqno,
                low_water: inner.low_water(),
            });
        }
        inner.locked_at = Some(seqno.get());
        drop(inner);
        Ok(SeqnoLockGuard {
            cache: Arc::clone(self),
            armed: true,
        })
    }

    pub fn locked_at(&self) -> Option<Seqno> {
        self.lock().locked_at.map(Seqno::new)
    }

    fn seqno_unlock(&self) {
        let mut inner = self.lock();
        debug_assert!(inner.locked_at.is_some(), "seqno lock released twice");
        inner.locked_at = None;
        inner.trim();
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("write-set cache lock poisoned")
    }
}

/// Linear capability over the cache's seqno lock. Dropping the guard
/// releases the lock; ownership can be moved into the sender thread so the
/// release happens at end-of-stream instead.
#[derive(Debug)]
pub struct SeqnoLockGuard {
    cache: Arc<WriteSetCache>,
    armed: bool,
}

impl SeqnoLockGuard {
    pub fn cache(&self) -> &Arc<WriteSetCache> {
        &self.cache
    }

    /// Release the lock now.
    pub fn release(mut self) {
        self.armed = false;
        self.cache.seqno_unlock();
    }
}

impl Drop for SeqnoLockGuard {
    fn drop(&mut self) {
        if self.armed {
            self.cache.seqno_unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn cache_with(range: std::ops::RangeInclusive<i64>, capacity: usize) -> Arc<WriteSetCache> {
        let cache = Arc::new(WriteSetCache::new(Uuid::from_bytes([9; 16]), capacity));
        for s in range {
            cache.append(WriteSet::new(
                Uuid::from_bytes([9; 16]),
                Seqno::new(s),
                Seqno::new(s - 1),
                Bytes::from(format!("ws-{s}")),
            ));
        }
        cache
    }

    #[test]
    fn trims_to_capacity_from_the_front() {
        let cache = cache_with(1..=10, 5);
        assert_eq!(cache.low_water(), Seqno::new(6));
        assert_eq!(cache.high_water(), Seqno::new(10));
    }

    #[test]
    fn lock_below_low_water_is_not_found() {
        let cache = cache_with(80..=100, 100);
        let err = cache.seqno_lock(Seqno::new(51)).unwrap_err();
        match err {
            CacheError::NotFound { seqno, low_water } => {
                assert_eq!(seqno, Seqno::new(51));
                assert_eq!(low_water, Seqno::new(80));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lock_pins_tail_against_eviction() {
        let cache = cache_with(1..=10, 5);
        let guard = cache.seqno_lock(Seqno::new(7)).unwrap();

        // Appends past capacity may only evict below the locked seqno.
        for s in 11..=20 {
            cache.append(WriteSet::new(
                Uuid::from_bytes([9; 16]),
                Seqno::new(s),
                Seqno::new(s - 1),
                Bytes::from(format!("ws-{s}")),
            ));
        }
        assert_eq!(cache.low_water(), Seqno::new(7));

        guard.release();
        cache.append(WriteSet::new(
            Uuid::from_bytes([9; 16]),
            Seqno::new(21),
            Seqno::new(20),
            Bytes::from_static(b"ws-21"),
        ));
        assert_eq!(cache.low_water(), Seqno::new(17));
    }

    #[test]
    fn guard_drop_releases_exactly_once() {
        let cache = cache_with(1..=5, 10);
        {
            let _guard = cache.seqno_lock(Seqno::new(3)).unwrap();
            assert_eq!(cache.locked_at(), Some(Seqno::new(3)));
        }
        assert_eq!(cache.locked_at(), None);
        // Lock can be retaken after release.
        let guard = cache.seqno_lock(Seqno::new(3)).unwrap();
        guard.release();
        assert_eq!(cache.locked_at(), None);
    }

    #[test]
    fn second_lock_while_held_is_rejected() {
        let cache = cache_with(1..=5, 10);
        let _guard = cache.seqno_lock(Seqno::new(2)).unwrap();
        assert!(matches!(
            cache.seqno_lock(Seqno::new(3)),
            Err(CacheError::AlreadyLocked { .. })
        ));
    }

    #[test]
    fn reset_clears_and_rebases() {
        let cache = cache_with(1..=5, 10);
        let uuid = Uuid::from_bytes([7; 16]);
        cache.seqno_reset(uuid, Seqno::new(100));
        assert_eq!(cache.uuid(), uuid);
        assert_eq!(cache.low_water(), Seqno::UNDEFINED);
        assert!(cache.get(Seqno::new(3)).is_none());
    }
}
