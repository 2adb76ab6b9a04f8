//! Migration Permits
//!
//! Bounds how many shards may sit between unassign and reassign at once.
//! Each in-flight shard holds one permit; queued shards hold none.
//!
//! A permit is taken before the unassign request and dropped after the
//! reassign acknowledgment, so the bound covers the whole window in which
//! a shard is out of service and its files may exist on two volumes.
//!
//! ## Usage
//!
//! ```ignore
//! let permits = MigrationPermits::new(5, Duration::from_secs(3600));
//!
//! let permit = permits.acquire().await?;   // may wait up to the timeout
//! // unassign, lock, move, reassign ...
//! drop(permit);
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{MigrationError, Result};

#[derive(Debug, Clone)]
pub struct MigrationPermits {
    semaphore: Arc<Semaphore>,
    limit: usize,
    timeout: Duration,
}

/// Held by one shard for its unassign..reassign window.
#[derive(Debug)]
pub struct MigrationPermit {
    _permit: OwnedSemaphorePermit,
}

impl MigrationPermits {
    pub fn new(limit: usize, timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            timeout,
        }
    }

    /// Wait for a permit, up to the configured timeout.
    pub async fn acquire(&self) -> Result<MigrationPermit> {
        match tokio::time::timeout(self.timeout, Arc::clone(&self.semaphore).acquire_owned()).await
        {
            Ok(Ok(permit)) => Ok(MigrationPermit { _permit: permit }),
            Ok(Err(_)) => Err(MigrationError::PermitsClosed),
            Err(_) => Err(MigrationError::PermitTimeout {
                waited: self.timeout,
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.limit.saturating_sub(self.semaphore.available_permits())
    }

    /// Refuse all further acquisitions. Held permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}
