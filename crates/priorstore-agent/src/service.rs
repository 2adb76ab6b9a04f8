//! Prior Store Service
//!
//! Wires the prior store into a node: resolves volumes, builds the write
//! distributor and the migration scheduler, and owns the scheduler's
//! background task.
//!
//! ## Lifecycle
//!
//! 1. `new()` validates configuration and resolves volumes. An active prior
//!    store whose prior paths match no volume is a startup error.
//! 2. `start()` sweeps temp files left by interrupted moves, then spawns the
//!    periodic migration job.
//! 3. `stop()` signals shutdown, waits for any running tick (so every
//!    in-flight shard reaches its reassign step) and closes the permits.
//!
//! ```ignore
//! let service = PriorStoreService::new(config, &data_paths, placement)?;
//! service.start().await?;
//!
//! let volume = service.distributor().select();
//!
//! service.stop().await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use priorstore_storage::{
    build_policy, sweep_orphaned_temp_files, Error as StorageError, MigrationPolicy,
    PriorStoreConfig, PriorStoreDistributor, ShardLocks, VolumeSet,
};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{MigrationError, Result};
use crate::placement::PlacementAuthority;
use crate::scheduler::MigrationScheduler;

struct RunningTask {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct PriorStoreService {
    config: PriorStoreConfig,
    active: bool,
    volumes: Arc<VolumeSet>,
    locks: Arc<ShardLocks>,
    distributor: PriorStoreDistributor,
    scheduler: Arc<MigrationScheduler>,
    task: Mutex<Option<RunningTask>>,
}

impl PriorStoreService {
    /// Resolve the node's data paths and build the service.
    ///
    /// When the prior store is inactive (disabled, or its first prior path
    /// is not a directory) every volume is regular and no migration runs.
    pub fn new(
        config: PriorStoreConfig,
        data_paths: &[PathBuf],
        placement: Arc<dyn PlacementAuthority>,
    ) -> Result<Self> {
        config.validate()?;
        let active = config.is_active();
        let prior_paths: &[PathBuf] = if active { &config.prior_paths } else { &[] };
        let volumes = Arc::new(VolumeSet::resolve(data_paths, prior_paths)?);
        let policy = build_policy(&config);
        Self::build(config, active, volumes, policy, placement)
    }

    /// Build the service over already resolved volumes and a chosen policy.
    ///
    /// The prior store is active when enabled in `config`.
    pub fn with_volumes(
        config: PriorStoreConfig,
        volumes: Arc<VolumeSet>,
        policy: Arc<dyn MigrationPolicy>,
        placement: Arc<dyn PlacementAuthority>,
    ) -> Result<Self> {
        config.validate()?;
        let active = config.enabled;
        Self::build(config, active, volumes, policy, placement)
    }

    fn build(
        config: PriorStoreConfig,
        active: bool,
        volumes: Arc<VolumeSet>,
        policy: Arc<dyn MigrationPolicy>,
        placement: Arc<dyn PlacementAuthority>,
    ) -> Result<Self> {
        if active && volumes.prior().next().is_none() {
            return Err(StorageError::NoPriorVolumes.into());
        }

        let locks = Arc::new(ShardLocks::new());
        let distributor = PriorStoreDistributor::new(Arc::clone(&volumes), config.max_threshold);
        let scheduler = Arc::new(MigrationScheduler::new(
            config.clone(),
            Arc::clone(&volumes),
            policy,
            placement,
            Arc::clone(&locks),
        ));

        info!(
            active,
            volumes = volumes.len(),
            prior = volumes.prior().count(),
            distributor = distributor.name(),
            "Prior store configured"
        );

        Ok(Self {
            config,
            active,
            volumes,
            locks,
            distributor,
            scheduler,
            task: Mutex::new(None),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn config(&self) -> &PriorStoreConfig {
        &self.config
    }

    pub fn volumes(&self) -> &Arc<VolumeSet> {
        &self.volumes
    }

    /// Shard directory locks shared with everything touching shard files.
    pub fn locks(&self) -> &Arc<ShardLocks> {
        &self.locks
    }

    pub fn distributor(&self) -> &PriorStoreDistributor {
        &self.distributor
    }

    pub fn scheduler(&self) -> &Arc<MigrationScheduler> {
        &self.scheduler
    }

    /// Sweep orphaned temp files and start the periodic migration job.
    ///
    /// A service runs at most once; starting again after [`stop`](Self::stop)
    /// fails with [`MigrationError::Stopped`].
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(MigrationError::AlreadyStarted);
        }
        if self.scheduler.permits().is_closed() {
            return Err(MigrationError::Stopped);
        }

        if !self.active {
            info!("Prior store inactive, migration not scheduled");
            return Ok(());
        }

        for volume in self.volumes.all() {
            if let Err(e) = sweep_orphaned_temp_files(&volume.indices_path()).await {
                warn!(volume = %volume, error = %e, "Orphaned temp file sweep failed");
            }
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = Arc::clone(&self.scheduler).start(shutdown_rx);
        *task = Some(RunningTask {
            shutdown_tx,
            handle,
        });

        Ok(())
    }

    /// Stop the migration job after any running tick completes.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.task.lock().await.take() else {
            warn!("Prior store migration not running, skipping stop");
            return Ok(());
        };

        // The job may already have exited; a closed channel is fine.
        let _ = running.shutdown_tx.send(());
        running.handle.await?;
        self.scheduler.permits().close();

        let stats = self.scheduler.stats().await;
        info!(
            ticks = stats.ticks_run,
            migrated = stats.shards_migrated,
            restarted = stats.shards_restarted,
            bytes = stats.bytes_moved,
            "Prior store migration stopped"
        );
        Ok(())
    }
}
