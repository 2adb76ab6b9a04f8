//! Migration Scheduler Background Task
//!
//! Periodically relieves saturated prior volumes by moving whole partitions
//! to a regular volume.
//!
//! ## Per Tick
//!
//! 1. Skip every prior volume whose saturation does not exceed
//!    `migration_threshold`
//! 2. Ask the [`MigrationPolicy`] for candidate partitions
//! 3. Pick the destination: not on the source's device, enough usable space
//!    for the candidates, most usable space wins
//! 4. Skip partitions that are not GREEN; they are retried next tick
//! 5. Relocate each shard of the remaining partitions
//!
//! ## Shard Relocation
//!
//! ```text
//! ASSIGNED(src) → UNASSIGNING → UNASSIGNED → LOCKING → COPYING → ASSIGNING → ASSIGNED(dst)
//!                      │                        │          │
//!                      └────────────────────────┴──────────┴──▶ ASSIGNING → ASSIGNED(src)
//! ```
//!
//! A migration permit is taken before unassigning and dropped after the
//! reassign acknowledgment. Every path out of `UNASSIGNING` goes through a
//! reassign, retried with backoff, whatever happened to the files.
//!
//! Only one tick runs at a time. A tick that finds another one running
//! returns immediately without doing anything.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use priorstore_storage::{
    discover_shards, relocate_shard, MigrationPolicy, MoveReport, PartitionId, PriorStoreConfig,
    ShardId, ShardLocks, Volume, VolumeSet,
};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{PlacementAction, Result};
use crate::permits::{MigrationPermit, MigrationPermits};
use crate::placement::PlacementAuthority;

/// Step of a shard relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPhase {
    Unassigning,
    Unassigned,
    Locking,
    Copying,
    Assigning,
    Assigned,
}

impl fmt::Display for ShardPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardPhase::Unassigning => "UNASSIGNING",
            ShardPhase::Unassigned => "UNASSIGNED",
            ShardPhase::Locking => "LOCKING",
            ShardPhase::Copying => "COPYING",
            ShardPhase::Assigning => "ASSIGNING",
            ShardPhase::Assigned => "ASSIGNED",
        };
        f.write_str(name)
    }
}

/// Result of relocating one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRelocation {
    pub shard: ShardId,
    /// Set when every file reached the destination.
    pub moved: Option<MoveReport>,
    /// Whether the shard was put back in service.
    pub reassigned: bool,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Another tick was running; nothing was done.
    pub skipped: bool,
    pub volumes_saturated: usize,
    pub volumes_without_destination: usize,
    pub scan_failures: usize,
    pub partitions_unhealthy: usize,
    pub shards_migrated: usize,
    /// Reassigned without having migrated.
    pub shards_restarted: usize,
    /// Never unassigned because no permit was available.
    pub permit_failures: usize,
    pub reassign_failures: usize,
    pub files_moved: usize,
    pub bytes_moved: u64,
}

impl TickReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    fn record(&mut self, relocation: &ShardRelocation) {
        match relocation.moved {
            Some(moved) => {
                self.shards_migrated += 1;
                self.files_moved += moved.files_moved;
                self.bytes_moved += moved.bytes_moved;
            }
            None => self.shards_restarted += 1,
        }
        if !relocation.reassigned {
            self.reassign_failures += 1;
        }
    }
}

/// Totals since the scheduler was created.
#[derive(Debug, Default, Clone)]
pub struct MigrationStats {
    /// Ticks that ran
    pub ticks_run: u64,
    /// Ticks that found another tick running
    pub ticks_skipped: u64,
    /// Shards whose files all reached the destination
    pub shards_migrated: u64,
    /// Shards put back in service without migrating
    pub shards_restarted: u64,
    /// Shards never started for lack of a permit
    pub permit_failures: u64,
    /// Shards whose reassign never succeeded
    pub reassign_failures: u64,
    /// Files moved
    pub files_moved: u64,
    /// Bytes moved
    pub bytes_moved: u64,
}

impl MigrationStats {
    fn absorb(&mut self, report: &TickReport) {
        self.ticks_run += 1;
        self.shards_migrated += report.shards_migrated as u64;
        self.shards_restarted += report.shards_restarted as u64;
        self.permit_failures += report.permit_failures as u64;
        self.reassign_failures += report.reassign_failures as u64;
        self.files_moved += report.files_moved as u64;
        self.bytes_moved += report.bytes_moved;
    }
}

/// Clears the running flag when a tick ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MigrationScheduler {
    config: PriorStoreConfig,
    volumes: Arc<VolumeSet>,
    policy: Arc<dyn MigrationPolicy>,
    placement: Arc<dyn PlacementAuthority>,
    locks: Arc<ShardLocks>,
    permits: MigrationPermits,
    running: AtomicBool,
    stats: RwLock<MigrationStats>,
}

impl MigrationScheduler {
    pub fn new(
        config: PriorStoreConfig,
        volumes: Arc<VolumeSet>,
        policy: Arc<dyn MigrationPolicy>,
        placement: Arc<dyn PlacementAuthority>,
        locks: Arc<ShardLocks>,
    ) -> Self {
        let permits = MigrationPermits::new(config.migration_concurrency, config.permit_timeout);
        Self {
            config,
            volumes,
            policy,
            placement,
            locks,
            permits,
            running: AtomicBool::new(false),
            stats: RwLock::new(MigrationStats::default()),
        }
    }

    pub fn permits(&self) -> &MigrationPermits {
        &self.permits
    }

    /// Whether a tick is executing right now.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> MigrationStats {
        self.stats.read().await.clone()
    }

    /// Run ticks with a fixed delay until `shutdown_rx` fires.
    ///
    /// Shutdown is observed between ticks; a running tick always finishes.
    pub fn start(self: Arc<Self>, shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;

            info!(
                interval = ?self.config.schedule_interval,
                concurrency = self.permits.limit(),
                policy = self.policy.name(),
                "Prior store migration started"
            );

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.schedule_interval) => {
                        self.run_once().await;
                    }
                    _ = &mut shutdown_rx => {
                        info!("Prior store migration stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Run one tick, unless one is already running.
    pub async fn run_once(self: &Arc<Self>) -> TickReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Migration tick already running, skipping");
            self.stats.write().await.ticks_skipped += 1;
            return TickReport::skipped();
        }
        let _running = RunningGuard(&self.running);

        let mut report = TickReport::default();
        for source in self.volumes.prior_volumes() {
            self.migrate_volume(&source, &mut report).await;
        }

        self.stats.write().await.absorb(&report);

        if report.volumes_saturated > 0 {
            info!(
                migrated = report.shards_migrated,
                restarted = report.shards_restarted,
                permit_failures = report.permit_failures,
                reassign_failures = report.reassign_failures,
                bytes = report.bytes_moved,
                "Migration tick finished"
            );
        } else {
            debug!("Migration tick found no saturated prior volume");
        }

        report
    }

    async fn migrate_volume(self: &Arc<Self>, source: &Arc<Volume>, report: &mut TickReport) {
        let saturation = match source.saturation() {
            Ok(saturation) => saturation,
            Err(e) => {
                warn!(volume = %source, error = %e, "Cannot read volume saturation");
                return;
            }
        };
        if saturation <= self.config.migration_threshold {
            trace!(volume = %source, saturation, "Prior volume below migration threshold");
            return;
        }
        report.volumes_saturated += 1;

        let candidates = match self.policy.select_candidates(source).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(volume = %source, error = %e, "Migration candidate scan failed");
                report.scan_failures += 1;
                return;
            }
        };
        if candidates.is_empty() {
            debug!(volume = %source, "No migration candidates");
            return;
        }

        let Some(destination) = select_destination(&self.volumes, source, candidates.total_bytes)
        else {
            warn!(
                volume = %source,
                required = candidates.total_bytes,
                "No destination volume can take the migration candidates"
            );
            report.volumes_without_destination += 1;
            return;
        };

        info!(
            from = %source,
            to = %destination,
            saturation,
            partitions = ?candidates.names(),
            bytes = candidates.total_bytes,
            "Migrating partitions off prior volume"
        );

        let mut handles = Vec::new();
        for partition in &candidates.partitions {
            if !self.is_green(partition).await {
                report.partitions_unhealthy += 1;
                continue;
            }

            let shards = match discover_shards(&source.indices_path().join(partition.name())).await
            {
                Ok(shards) => shards,
                Err(e) => {
                    error!(partition = %partition, error = %e, "Cannot list partition shards");
                    continue;
                }
            };
            info!(partition = %partition, shards = shards.len(), "Migrating partition");

            for shard in shards {
                let permit = match self.permits.acquire().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!(shard = %shard, error = %e, "Shard migration not started");
                        report.permit_failures += 1;
                        continue;
                    }
                };

                let scheduler = Arc::clone(self);
                let source = Arc::clone(source);
                let destination = Arc::clone(&destination);
                handles.push(tokio::spawn(async move {
                    scheduler
                        .relocate(shard, &source, &destination, permit)
                        .await
                }));
            }
        }

        for handle in handles {
            match handle.await {
                Ok(relocation) => report.record(&relocation),
                Err(e) => error!(error = %e, "Shard relocation task failed"),
            }
        }
    }

    async fn is_green(&self, partition: &PartitionId) -> bool {
        match self.placement.health_of(partition.name()).await {
            Ok(status) if status.is_green() => true,
            Ok(status) => {
                debug!(partition = %partition, status = ?status, "Partition not green, skipping");
                false
            }
            Err(e) => {
                warn!(partition = %partition, error = %e, "Partition health unknown, skipping");
                false
            }
        }
    }

    /// Drive one shard from unassign to reassign.
    async fn relocate(
        &self,
        shard: ShardId,
        source: &Volume,
        destination: &Volume,
        permit: MigrationPermit,
    ) -> ShardRelocation {
        phase(&shard, ShardPhase::Unassigning);
        let moved = match self.unassign(&shard).await {
            Ok(()) => {
                phase(&shard, ShardPhase::Unassigned);
                match self.move_locked(&shard, source, destination).await {
                    Ok(report) => Some(report),
                    Err(e) => {
                        error!(shard = %shard, error = %e, "Restarting shard without migrating");
                        None
                    }
                }
            }
            Err(e) => {
                error!(shard = %shard, error = %e, "Unassign failed");
                None
            }
        };

        phase(&shard, ShardPhase::Assigning);
        let reassigned = self.reassign(&shard).await;
        drop(permit);

        if reassigned {
            phase(&shard, ShardPhase::Assigned);
            if moved.is_some() {
                info!(shard = %shard, to = %destination, "Shard migrated");
            }
        }

        ShardRelocation {
            shard,
            moved,
            reassigned,
        }
    }

    async fn unassign(&self, shard: &ShardId) -> Result<()> {
        self.placement
            .unassign(std::slice::from_ref(shard))
            .await?
            .ensure(shard, PlacementAction::Unassign)
    }

    async fn move_locked(
        &self,
        shard: &ShardId,
        source: &Volume,
        destination: &Volume,
    ) -> Result<MoveReport> {
        phase(shard, ShardPhase::Locking);
        let _lock = self
            .locks
            .acquire(shard, self.config.shard_lock_timeout)
            .await?;

        phase(shard, ShardPhase::Copying);
        let report = relocate_shard(
            shard,
            &shard.dir_in(&source.indices_path()),
            &shard.dir_in(&destination.indices_path()),
        )
        .await?;
        Ok(report)
    }

    /// Put the shard back in service, retrying with backoff.
    async fn reassign(&self, shard: &ShardId) -> bool {
        let attempts = self.config.reassign_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let result = match self.placement.reassign(std::slice::from_ref(shard)).await {
                Ok(ack) => ack.ensure(shard, PlacementAction::Reassign),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => return true,
                Err(e) if attempt < attempts => {
                    let delay = backoff_delay(self.config.reassign_backoff, attempt);
                    warn!(shard = %shard, attempt, delay = ?delay, error = %e, "Reassign failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(shard = %shard, attempts, error = %e, "Reassign failed, giving up");
                }
            }
        }

        false
    }
}

fn phase(shard: &ShardId, phase: ShardPhase) {
    trace!(shard = %shard, phase = %phase, "Shard phase");
}

/// Pick where a source volume's candidates go.
///
/// Volumes on the source's device and volumes with less usable space than
/// `required` are excluded. The most usable space wins; on a tie the first
/// volume in node order is kept.
pub fn select_destination(
    volumes: &VolumeSet,
    source: &Volume,
    required: u64,
) -> Option<Arc<Volume>> {
    let mut best: Option<(&Arc<Volume>, u64)> = None;

    for candidate in volumes.all() {
        if candidate.same_device(source) {
            continue;
        }
        let usable = match candidate.usable_bytes() {
            Ok(usable) => usable,
            Err(e) => {
                warn!(volume = %candidate, error = %e, "Skipping destination with unreadable space");
                continue;
            }
        };
        if usable < required {
            continue;
        }
        if best.map_or(true, |(_, best_usable)| usable > best_usable) {
            best = Some((candidate, usable));
        }
    }

    best.map(|(volume, _)| Arc::clone(volume))
}

/// Exponential backoff with up to 25% jitter; `attempt` starts at 1.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exponent);
    let jitter = delay.mul_f64(rand::random::<f64>() * 0.25);
    delay.saturating_add(jitter)
}
