//! Migration Policy
//!
//! Decides which partitions leave a saturated prior volume, and how much.
//!
//! ## Size- and age-biased eviction
//!
//! 1. Sum the regular-file bytes under every partition directory.
//! 2. If non-partitioned indices hold more than `non_partition_threshold` of
//!    the volume, evict from them, largest first.
//! 3. Otherwise evict partitioned sub-indices in ascending partition key,
//!    then base index. Keys are assumed to be time-ordered, so this drains
//!    the oldest data first.
//! 4. Stop once the selected bytes reach `migration_fraction` of the volume.
//!
//! The ordering and draining steps are plain functions over
//! [`PartitionUsage`] lists so they can be tested without a filesystem.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{MigrationPolicyKind, PriorStoreConfig};
use crate::error::{Error, Result};
use crate::partition::{PartitionId, PartitionUsage};
use crate::shard::is_location_marker;
use crate::volume::Volume;

/// Partitions chosen to leave a volume in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationCandidates {
    /// Selected partitions, in eviction order.
    pub partitions: Vec<PartitionId>,
    /// Sum of the selected partitions' known sizes.
    pub total_bytes: u64,
}

impl MigrationCandidates {
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.partitions.iter().map(PartitionId::name).collect()
    }
}

/// Strategy choosing what to migrate off a volume.
#[async_trait]
pub trait MigrationPolicy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Choose partitions to evacuate from `volume`.
    ///
    /// Fails with [`Error::Scan`] if the partition tree cannot be listed.
    async fn select_candidates(&self, volume: &Volume) -> Result<MigrationCandidates>;
}

/// Build the configured policy.
pub fn build_policy(config: &PriorStoreConfig) -> Arc<dyn MigrationPolicy> {
    match config.policy {
        MigrationPolicyKind::SizeAge => Arc::new(SizeAgeEvictionPolicy::from_config(config)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeAgeEvictionPolicy {
    migration_fraction: f64,
    non_partition_threshold: f64,
}

impl SizeAgeEvictionPolicy {
    pub fn new(migration_fraction: f64, non_partition_threshold: f64) -> Self {
        Self {
            migration_fraction,
            non_partition_threshold,
        }
    }

    pub fn from_config(config: &PriorStoreConfig) -> Self {
        Self::new(config.migration_fraction, config.non_partition_threshold)
    }
}

#[async_trait]
impl MigrationPolicy for SizeAgeEvictionPolicy {
    fn name(&self) -> &'static str {
        "size_age"
    }

    async fn select_candidates(&self, volume: &Volume) -> Result<MigrationCandidates> {
        let usages = scan_partitions(&volume.indices_path()).await?;
        let total_space = volume.total_bytes()?;

        let candidates = plan(
            usages,
            total_space,
            self.migration_fraction,
            self.non_partition_threshold,
        );

        info!(
            volume = %volume,
            partitions = candidates.len(),
            bytes = candidates.total_bytes,
            "Selected migration candidates"
        );
        Ok(candidates)
    }
}

/// Select partitions from a volume's usage list.
///
/// `total_space` is the volume's capacity in bytes.
pub fn plan(
    usages: Vec<PartitionUsage>,
    total_space: u64,
    migration_fraction: f64,
    non_partition_threshold: f64,
) -> MigrationCandidates {
    let (partitioned, plain): (Vec<_>, Vec<_>) =
        usages.into_iter().partition(|u| u.id.is_partitioned());

    let plain_bytes: u64 = plain.iter().map(|u| u.size_bytes.unwrap_or(0)).sum();
    let cutoff = total_space as f64 * non_partition_threshold;
    let target = (total_space as f64 * migration_fraction) as u64;

    let ordered = if plain_bytes as f64 > cutoff {
        debug!(plain_bytes, cutoff, "Evicting non-partitioned indices");
        order_by_size_desc(plain)
    } else {
        debug!(plain_bytes, cutoff, "Evicting oldest partitions");
        order_by_partition_key(partitioned)
    };

    drain_until(ordered, target)
}

/// Largest first; partitions of unknown size lead.
pub fn order_by_size_desc(mut usages: Vec<PartitionUsage>) -> Vec<PartitionUsage> {
    usages.sort_by(|a, b| match (a.size_bytes, b.size_bytes) {
        (None, None) => a.id.name().cmp(b.id.name()),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.id.name().cmp(b.id.name())),
    });
    usages
}

/// Ascending partition key, then base index.
pub fn order_by_partition_key(mut usages: Vec<PartitionUsage>) -> Vec<PartitionUsage> {
    usages.sort_by(|a, b| {
        a.id.key()
            .cmp(&b.id.key())
            .then_with(|| a.id.base_index().cmp(b.id.base_index()))
    });
    usages
}

/// Take partitions in order until their sizes reach `target`.
///
/// Yields the shortest prefix whose total is at least `target`, or the
/// whole list if it never gets there.
pub fn drain_until(ordered: Vec<PartitionUsage>, target: u64) -> MigrationCandidates {
    let mut selected = MigrationCandidates::default();
    for usage in ordered {
        if selected.total_bytes >= target {
            break;
        }
        selected.total_bytes = selected
            .total_bytes
            .saturating_add(usage.size_bytes.unwrap_or(0));
        selected.partitions.push(usage.id);
    }
    selected
}

/// Measure every partition directory directly under `indices_path`.
///
/// A missing `indices` directory is an empty volume. Failing to list
/// `indices_path` itself is a scan error; failing to read something deeper
/// only makes that partition's size unknown.
pub async fn scan_partitions(indices_path: &Path) -> Result<Vec<PartitionUsage>> {
    let scan_err = |source| Error::Scan {
        path: indices_path.to_path_buf(),
        source,
    };

    let mut entries = match tokio::fs::read_dir(indices_path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(scan_err(e)),
    };

    let mut usages = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(scan_err)? {
        if !entry.file_type().await.map_err(scan_err)?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let size = tree_size(entry.path()).await;
        usages.push(PartitionUsage::new(name, size));
    }

    usages.sort_by(|a, b| a.id.name().cmp(b.id.name()));
    Ok(usages)
}

/// Bytes of regular files under `root`, walking every subdirectory.
async fn tree_size(root: PathBuf) -> Option<u64> {
    let mut total = 0u64;
    let mut complete = true;
    let mut pending = vec![root];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = ?dir, error = %e, "Cannot read partition directory");
                complete = false;
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(path = ?dir, error = %e, "Partition listing interrupted");
                    complete = false;
                    break;
                }
            };

            // Entry metadata does not follow symlinks.
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = ?entry.path(), error = %e, "Cannot stat partition entry");
                    complete = false;
                    continue;
                }
            };

            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file()
                && !is_location_marker(&entry.file_name().to_string_lossy())
            {
                total = total.saturating_add(metadata.len());
            }
        }
    }

    complete.then_some(total)
}
