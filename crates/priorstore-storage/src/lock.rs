//! Exclusive per-shard directory locks.
//!
//! Every component touching a shard's files on this node goes through the
//! same [`ShardLocks`] registry. Exclusion is within this process only; no
//! lock file is taken on disk. A lock is held only across the file move and
//! is independent of the migration permits.
//!
//! Entries live only while a shard is locked or awaited, so the registry
//! stays bounded by the shards in use rather than every shard ever moved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

use crate::error::{Error, Result};
use crate::shard::ShardId;

type Registry = Mutex<HashMap<ShardId, Arc<AsyncMutex<()>>>>;

#[derive(Debug, Default)]
pub struct ShardLocks {
    locks: Arc<Registry>,
}

/// Held while a shard's directory is exclusively owned.
#[derive(Debug)]
pub struct ShardLockGuard {
    shard: ShardId,
    registry: Arc<Registry>,
    _guard: OwnedMutexGuard<()>,
}

impl ShardLockGuard {
    pub fn shard(&self) -> &ShardId {
        &self.shard
    }
}

impl Drop for ShardLockGuard {
    fn drop(&mut self) {
        // The map and this guard hold the only references when nobody waits.
        prune(&self.registry, &self.shard, 2);
        trace!(shard = %self.shard, "Released shard lock");
    }
}

fn prune(registry: &Registry, shard: &ShardId, holders: usize) {
    // A poisoned map still holds valid Arcs.
    let mut locks = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if locks
        .get(shard)
        .is_some_and(|lock| Arc::strong_count(lock) <= holders)
    {
        locks.remove(shard);
    }
}

impl ShardLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, shard: &ShardId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(shard.clone()).or_default())
    }

    fn guard(&self, shard: &ShardId, guard: OwnedMutexGuard<()>) -> ShardLockGuard {
        ShardLockGuard {
            shard: shard.clone(),
            registry: Arc::clone(&self.locks),
            _guard: guard,
        }
    }

    /// Shards currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock a shard's directory, waiting at most `wait`.
    pub async fn acquire(&self, shard: &ShardId, wait: Duration) -> Result<ShardLockGuard> {
        let lock = self.entry(shard);
        match tokio::time::timeout(wait, lock.lock_owned()).await {
            Ok(guard) => {
                trace!(shard = %shard, "Acquired shard lock");
                Ok(self.guard(shard, guard))
            }
            Err(_) => {
                prune(&self.locks, shard, 1);
                Err(Error::LockTimeout {
                    shard: shard.clone(),
                    waited: wait,
                })
            }
        }
    }

    /// Lock a shard's directory only if nobody holds it.
    pub fn try_acquire(&self, shard: &ShardId) -> Option<ShardLockGuard> {
        match self.entry(shard).try_lock_owned() {
            Ok(guard) => Some(self.guard(shard, guard)),
            Err(_) => {
                prune(&self.locks, shard, 1);
                None
            }
        }
    }
}
