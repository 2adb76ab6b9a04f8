//! Prior Store Agent - Background Shard Migration
//!
//! This crate moves shards off saturated prior volumes while coordinating
//! with the cluster's placement authority, so that no reader or writer ever
//! sees a torn or doubly assigned shard.
//!
//! ## Components
//!
//! - **PlacementAuthority**: Boundary to the cluster service owning shard assignment
//! - **MigrationPermits**: Bound on shards between unassign and reassign
//! - **MigrationScheduler**: Periodic single-flight migration job
//! - **PriorStoreService**: Node wiring and lifecycle
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use priorstore_agent::{PlacementAuthority, PriorStoreService};
//! use priorstore_storage::PriorStoreConfig;
//!
//! # async fn example(
//! #     placement: Arc<dyn PlacementAuthority>,
//! #     data_paths: Vec<std::path::PathBuf>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = PriorStoreConfig::from_env();
//! let service = PriorStoreService::new(config, &data_paths, placement)?;
//!
//! // Sweep interrupted moves and schedule migration
//! service.start().await?;
//!
//! // Write path: choose the volume for a new shard
//! let _volume = service.distributor().select();
//!
//! // Graceful shutdown (waits for a running tick)
//! service.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod permits;
pub mod placement;
pub mod scheduler;
pub mod service;

pub use error::{MigrationError, PlacementAction, Result};
pub use permits::{MigrationPermit, MigrationPermits};
pub use placement::{HealthStatus, PlacementAck, PlacementAuthority};
pub use scheduler::{
    select_destination, MigrationScheduler, MigrationStats, ShardPhase, ShardRelocation,
    TickReport,
};
pub use service::PriorStoreService;
