//! # Distributed Locks
//!
//! One writer per job. A lock is identified by its key (the job id) plus a
//! random token; only the holder of the matching token can release or extend
//! it, so a stale handle from an expired acquisition can never free a newer
//! lock on the same key.

use crate::error::{EngineError, EngineResult};
use crate::models::{PartitionId, Priority};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub ttl: Duration,
    pub partition: Option<PartitionId>,
    pub priority: Priority,
}

impl LockOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            partition: None,
            priority: Priority::Normal,
        }
    }

    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedLock {
    pub key: String,
    pub token: Uuid,
    pub ttl: Duration,
    pub owner_partition: Option<PartitionId>,
    pub priority: Priority,
    pub acquired_at: Instant,
    pub expires_at: Instant,
}

impl DistributedLock {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct LockManager {
    locks: DashMap<String, DistributedLock>,
    acquired: AtomicU64,
    contended: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `key` unless a live lock already holds it. An expired lock is
    /// taken over.
    pub fn acquire(&self, key: &str, options: LockOptions) -> EngineResult<DistributedLock> {
        let now = Instant::now();
        let lock = DistributedLock {
            key: key.to_string(),
            token: Uuid::new_v4(),
            ttl: options.ttl,
            owner_partition: options.partition,
            priority: options.priority,
            acquired_at: now,
            expires_at: now + options.ttl,
        };

        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if !held.get().is_expired() {
                    self.contended.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, owner = ?held.get().owner_partition, "🔒 LOCK: contention");
                    return Err(EngineError::LockContention {
                        key: key.to_string(),
                        owner_partition: held.get().owner_partition,
                    });
                }
                warn!(key = %key, "🔒 LOCK: taking over expired lock");
                held.insert(lock.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lock.clone());
            }
        }

        self.acquired.fetch_add(1, Ordering::Relaxed);
        debug!(
            key = %key,
            partition = ?lock.owner_partition,
            ttl_ms = lock.ttl.as_millis() as u64,
            "🔒 LOCK: acquired"
        );
        Ok(lock)
    }

    /// Count a contention detected outside [`LockManager::acquire`]
    pub fn record_contention(&self) {
        self.contended.fetch_add(1, Ordering::Relaxed);
    }

    /// Release a lock. Returns false when the lock was already released or
    /// has been taken over by another holder; calling it twice is harmless.
    pub fn release(&self, lock: &DistributedLock) -> bool {
        let released = self
            .locks
            .remove_if(&lock.key, |_, held| held.token == lock.token)
            .is_some();
        if released {
            debug!(key = %lock.key, "🔓 LOCK: released");
        }
        released
    }

    /// Push a held lock's expiry to `now + ttl`
    pub fn extend(&self, lock: &mut DistributedLock, ttl: Duration) -> bool {
        let Some(mut held) = self.locks.get_mut(&lock.key) else {
            return false;
        };
        if held.token != lock.token || held.is_expired() {
            return false;
        }
        let expires_at = Instant::now() + ttl;
        held.expires_at = expires_at;
        held.ttl = ttl;
        lock.expires_at = expires_at;
        lock.ttl = ttl;
        true
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|held| !held.is_expired())
            .unwrap_or(false)
    }

    pub fn active_locks(&self) -> usize {
        self.locks.iter().filter(|held| !held.is_expired()).count()
    }

    /// Drop expired entries, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, held| !held.is_expired());
        let swept = before.saturating_sub(self.locks.len());
        if swept > 0 {
            debug!(swept, "🔒 LOCK: swept expired locks");
        }
        swept
    }

    pub fn total_acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn total_contended(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }
}

/// Holds a lock and releases it on drop
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<LockManager>,
    lock: DistributedLock,
}

impl LockGuard {
    pub(crate) fn new(manager: Arc<LockManager>, lock: DistributedLock) -> Self {
        Self { manager, lock }
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    pub fn extend(&mut self, ttl: Duration) -> bool {
        self.manager.extend(&mut self.lock, ttl)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(&self.lock);
    }
}
