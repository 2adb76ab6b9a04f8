//! Storage Error Types
//!
//! This module defines all error types that can occur while placing data on
//! volumes, scanning partitions, and moving shard files.
//!
//! ## Error Categories
//!
//! ### Scan Errors
//! - `Scan`: The partition tree of a volume could not be traversed. The
//!   scheduler aborts that volume's pass and retries on the next tick.
//! - `SpaceProbe`: Free/total space of a volume could not be read.
//!
//! ### Move Errors
//! - `Copy`: I/O failure while copying, renaming, deleting or syncing a
//!   shard file. Files already moved stay moved.
//! - `LockTimeout`: The shard directory lock was not obtained in time.
//!
//! ### Configuration Errors
//! - `Config`: A setting is out of range.
//! - `NoPriorVolumes`: The prior store is active but none of the configured
//!   prior paths matches a node volume.
//!
//! ## Usage
//!
//! All storage operations return `Result<T>` which is aliased to
//! `Result<T, Error>`. This allows clean error propagation with `?`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::shard::ShardId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to scan partition tree at {path:?}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to probe space of volume {path:?}: {source}")]
    SpaceProbe {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{shard} failed to move {path:?}: {source}")]
    Copy {
        shard: ShardId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{shard} lock not obtained within {waited:?}")]
    LockTimeout { shard: ShardId, waited: Duration },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Prior store enabled but no node volume matches the configured prior paths")]
    NoPriorVolumes,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error came from the filesystem while moving files.
    pub fn is_copy_failure(&self) -> bool {
        matches!(self, Error::Copy { .. })
    }
}
