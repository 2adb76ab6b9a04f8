//! Prior Store Storage Layer
//!
//! This crate implements the node-local half of tiered storage: deciding
//! where new shard data lands and which data leaves a full fast volume.
//!
//! ## What is the Prior Store?
//!
//! A node has one or more *prior* volumes (fast, limited capacity) and one or
//! more *regular* volumes. New writes prefer prior volumes. When a prior
//! volume fills up, whole partitions are moved to a regular volume in the
//! background.
//!
//! ## Architecture Overview
//!
//! ```text
//!                 ┌──────────────┐
//!                 │  VolumeSet   │  prior + regular volumes, live space
//!                 └──────┬───────┘
//!            ┌───────────┴────────────┐
//!            ▼                        ▼
//! ┌─────────────────────┐   ┌─────────────────────┐
//! │ PriorStoreDistributor│   │  MigrationPolicy    │
//! │ - write placement    │   │ - scan partitions   │
//! │ - saturation cutoff  │   │ - rank and drain    │
//! └─────────────────────┘   └──────────┬──────────┘
//!                                      │ candidates
//!                                      ▼
//!                           ┌─────────────────────┐
//!                           │  mover + ShardLocks │
//!                           │ - copy/rename/delete│
//!                           │ - fsync             │
//!                           └─────────────────────┘
//! ```
//!
//! Coordination with the cluster (unassign, reassign, health) and the
//! periodic job live in `priorstore-agent`.
//!
//! ## Usage Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use priorstore_storage::{PriorStoreConfig, PriorStoreDistributor, VolumeSet};
//!
//! let config = PriorStoreConfig::from_env();
//! config.validate()?;
//!
//! let volumes = Arc::new(VolumeSet::resolve(&data_paths, &config.prior_paths)?);
//! let distributor = PriorStoreDistributor::new(volumes, config.max_threshold);
//! let target = distributor.select();
//! ```

pub mod config;
pub mod distributor;
pub mod error;
pub mod lock;
pub mod mover;
pub mod partition;
pub mod policy;
pub mod shard;
pub mod volume;

pub use config::{MigrationPolicyKind, PriorStoreConfig};
pub use distributor::PriorStoreDistributor;
pub use error::{Error, Result};
pub use lock::{ShardLockGuard, ShardLocks};
pub use mover::{relocate_shard, sweep_orphaned_temp_files, MoveReport};
pub use partition::{PartitionId, PartitionUsage};
pub use policy::{build_policy, MigrationCandidates, MigrationPolicy, SizeAgeEvictionPolicy};
pub use shard::{discover_shards, ShardId};
pub use volume::{
    DeviceKey, FixedSpaceProbe, FsSpaceProbe, SpaceProbe, SpaceUsage, Volume, VolumeSet,
    VolumeTier,
};
