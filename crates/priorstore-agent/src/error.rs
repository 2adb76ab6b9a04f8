//! Error types for the migration agent

use std::time::Duration;

use priorstore_storage::ShardId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrationError>;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Placement request for {shard} failed: {reason}")]
    Placement { shard: ShardId, reason: String },

    #[error("Placement authority rejected {action} of {shard}")]
    PlacementRejected { shard: ShardId, action: PlacementAction },

    #[error("No migration permit within {waited:?}")]
    PermitTimeout { waited: Duration },

    #[error("Migration permits closed")]
    PermitsClosed,

    #[error("Migration scheduler already started")]
    AlreadyStarted,

    #[error("Migration scheduler was stopped and cannot be restarted")]
    Stopped,

    #[error("Storage error: {0}")]
    Storage(#[from] priorstore_storage::Error),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Placement transition a request asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementAction {
    Unassign,
    Reassign,
}

impl std::fmt::Display for PlacementAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementAction::Unassign => write!(f, "unassign"),
            PlacementAction::Reassign => write!(f, "reassign"),
        }
    }
}
