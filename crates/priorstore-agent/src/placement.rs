//! Placement Authority boundary
//!
//! The cluster service that owns shard-to-node assignment. The migration
//! scheduler only calls into it: it never decides placement itself.
//!
//! Implementations are expected to:
//!
//! - On `unassign`, promote an active replica elsewhere before removing this
//!   node's primary copy, so the partition never loses its primary.
//! - On `reassign`, assign this node's unassigned copies back to this node.
//!   The node resolves the shard's files from whichever volume holds them.
//! - Answer `health_of` from the node's view of cluster state.

use async_trait::async_trait;
use priorstore_storage::ShardId;

use crate::error::{MigrationError, PlacementAction, Result};

/// Answer to an unassign or reassign request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementAck {
    pub acknowledged: bool,
}

impl PlacementAck {
    pub fn accepted() -> Self {
        Self { acknowledged: true }
    }

    pub fn rejected() -> Self {
        Self {
            acknowledged: false,
        }
    }

    /// Turn a negative acknowledgment into an error.
    pub fn ensure(self, shard: &ShardId, action: PlacementAction) -> Result<()> {
        if self.acknowledged {
            Ok(())
        } else {
            Err(MigrationError::PlacementRejected {
                shard: shard.clone(),
                action,
            })
        }
    }
}

/// Replica health of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// All replicas present and in sync.
    Green,
    /// Primaries assigned, some replicas missing.
    Yellow,
    /// Some primaries unassigned.
    Red,
}

impl HealthStatus {
    pub fn is_green(&self) -> bool {
        matches!(self, HealthStatus::Green)
    }
}

#[async_trait]
pub trait PlacementAuthority: Send + Sync {
    /// Remove this node's copies of `shards` from service.
    ///
    /// Completes once the authority has applied or refused the transition.
    async fn unassign(&self, shards: &[ShardId]) -> Result<PlacementAck>;

    /// Put this node's unassigned copies of `shards` back in service.
    async fn reassign(&self, shards: &[ShardId]) -> Result<PlacementAck>;

    /// Health of a partition, by partition directory name.
    async fn health_of(&self, partition: &str) -> Result<HealthStatus>;
}
