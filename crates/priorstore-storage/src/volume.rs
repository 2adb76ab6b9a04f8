//! Node Volumes
//!
//! A node stores shards on one or more volumes. Some of them are *prior*
//! volumes: fast, limited-capacity storage that new writes prefer. The rest
//! are *regular* volumes that receive data migrated off the prior tier.
//!
//! Tier membership is fixed when the [`VolumeSet`] is resolved at startup.
//! Space metrics are read live on every call, through a [`SpaceProbe`], so
//! a volume relieved by a previous migration pass is seen as such.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::shard::INDICES_DIR;

/// Identity of the physical device backing a volume.
///
/// Two paths on the same device compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey(pub u64);

impl DeviceKey {
    /// Resolve the device of an existing path.
    #[cfg(unix)]
    pub fn of(path: &Path) -> std::io::Result<Self> {
        use std::os::unix::fs::MetadataExt;
        Ok(DeviceKey(std::fs::metadata(path)?.dev()))
    }

    /// Resolve the device of an existing path.
    ///
    /// Without device numbers, the canonical path stands in for the device.
    #[cfg(not(unix))]
    pub fn of(path: &Path) -> std::io::Result<Self> {
        use std::hash::{Hash, Hasher};
        let canonical = std::fs::canonicalize(path)?;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        canonical.hash(&mut hasher);
        Ok(DeviceKey(hasher.finish()))
    }
}

/// Storage tier of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeTier {
    /// Preferred for new writes, subject to migration pressure.
    Prior,
    /// Destination for migrated data.
    Regular,
}

impl fmt::Display for VolumeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeTier::Prior => write!(f, "prior"),
            VolumeTier::Regular => write!(f, "regular"),
        }
    }
}

/// Point-in-time space metrics of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceUsage {
    pub usable_bytes: u64,
    pub total_bytes: u64,
}

impl SpaceUsage {
    /// Build a snapshot, clamping usable space to the total.
    pub fn new(usable_bytes: u64, total_bytes: u64) -> Self {
        Self {
            usable_bytes: usable_bytes.min(total_bytes),
            total_bytes,
        }
    }

    /// Used share of the volume, `1 - usable / total`.
    ///
    /// A volume reporting zero total space counts as fully saturated.
    pub fn saturation(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        1.0 - (self.usable_bytes as f64 / self.total_bytes as f64)
    }
}

/// Reads free and total space for a volume root.
pub trait SpaceProbe: Send + Sync + fmt::Debug {
    fn usable_bytes(&self, path: &Path) -> std::io::Result<u64>;
    fn total_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

/// Space probe backed by the filesystem (`statvfs` and friends).
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn usable_bytes(&self, path: &Path) -> std::io::Result<u64> {
        fs2::available_space(path)
    }

    fn total_bytes(&self, path: &Path) -> std::io::Result<u64> {
        fs2::total_space(path)
    }
}

/// Space probe with externally controlled values.
///
/// Used when the embedding process already tracks volume usage, and in tests.
#[derive(Debug, Default)]
pub struct FixedSpaceProbe {
    usable: AtomicU64,
    total: AtomicU64,
}

impl FixedSpaceProbe {
    pub fn new(usable_bytes: u64, total_bytes: u64) -> Self {
        Self {
            usable: AtomicU64::new(usable_bytes),
            total: AtomicU64::new(total_bytes),
        }
    }

    pub fn set_usable(&self, usable_bytes: u64) {
        self.usable.store(usable_bytes, Ordering::SeqCst);
    }

    pub fn set_total(&self, total_bytes: u64) {
        self.total.store(total_bytes, Ordering::SeqCst);
    }
}

impl SpaceProbe for FixedSpaceProbe {
    fn usable_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.usable.load(Ordering::SeqCst))
    }

    fn total_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.total.load(Ordering::SeqCst))
    }
}

/// A storage location of this node.
#[derive(Debug, Clone)]
pub struct Volume {
    root: PathBuf,
    device: DeviceKey,
    tier: VolumeTier,
    probe: Arc<dyn SpaceProbe>,
}

impl Volume {
    /// Open an existing volume root, reading space from the filesystem.
    pub fn open(root: impl Into<PathBuf>, tier: VolumeTier) -> Result<Self> {
        let root = root.into();
        let device = DeviceKey::of(&root).map_err(|source| Error::SpaceProbe {
            path: root.clone(),
            source,
        })?;
        Ok(Self::with_probe(root, device, tier, Arc::new(FsSpaceProbe)))
    }

    /// Build a volume with an explicit device identity and space probe.
    pub fn with_probe(
        root: impl Into<PathBuf>,
        device: DeviceKey,
        tier: VolumeTier,
        probe: Arc<dyn SpaceProbe>,
    ) -> Self {
        Self {
            root: root.into(),
            device,
            tier,
            probe,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding this volume's partitions.
    pub fn indices_path(&self) -> PathBuf {
        self.root.join(INDICES_DIR)
    }

    pub fn device(&self) -> DeviceKey {
        self.device
    }

    pub fn tier(&self) -> VolumeTier {
        self.tier
    }

    pub fn is_prior(&self) -> bool {
        self.tier == VolumeTier::Prior
    }

    /// Whether both volumes live on the same physical device.
    pub fn same_device(&self, other: &Volume) -> bool {
        self.device == other.device
    }

    /// Read live space metrics.
    pub fn space(&self) -> Result<SpaceUsage> {
        let probe_err = |source| Error::SpaceProbe {
            path: self.root.clone(),
            source,
        };
        let usable = self.probe.usable_bytes(&self.root).map_err(probe_err)?;
        let total = self.probe.total_bytes(&self.root).map_err(probe_err)?;
        Ok(SpaceUsage::new(usable, total))
    }

    pub fn usable_bytes(&self) -> Result<u64> {
        Ok(self.space()?.usable_bytes)
    }

    pub fn total_bytes(&self) -> Result<u64> {
        Ok(self.space()?.total_bytes)
    }

    pub fn saturation(&self) -> Result<f64> {
        Ok(self.space()?.saturation())
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.root.display(), self.tier)
    }
}

/// All volumes of a node, split by tier.
#[derive(Debug, Clone, Default)]
pub struct VolumeSet {
    volumes: Vec<Arc<Volume>>,
}

impl VolumeSet {
    /// Build a set from already constructed volumes.
    pub fn new(volumes: Vec<Arc<Volume>>) -> Self {
        Self { volumes }
    }

    /// Open the node's data paths and mark the prior ones.
    ///
    /// Each configured prior path claims the first data path located under
    /// it; prior paths matching no data path are ignored.
    pub fn resolve(data_paths: &[PathBuf], prior_paths: &[PathBuf]) -> Result<Self> {
        let mut prior_index = Vec::new();
        for prior in prior_paths {
            let claimed = data_paths
                .iter()
                .enumerate()
                .find(|(i, path)| path.starts_with(prior) && !prior_index.contains(i));
            match claimed {
                Some((i, path)) => {
                    debug!(prior = ?prior, path = ?path, "Resolved prior volume");
                    prior_index.push(i);
                }
                None => debug!(prior = ?prior, "Prior path matches no data path"),
            }
        }

        let mut volumes = Vec::with_capacity(data_paths.len());
        for (i, path) in data_paths.iter().enumerate() {
            let tier = if prior_index.contains(&i) {
                VolumeTier::Prior
            } else {
                VolumeTier::Regular
            };
            volumes.push(Arc::new(Volume::open(path.clone(), tier)?));
        }

        let set = Self { volumes };
        info!(
            volumes = set.len(),
            prior = set.prior().count(),
            "Resolved node volumes"
        );
        Ok(set)
    }

    pub fn all(&self) -> &[Arc<Volume>] {
        &self.volumes
    }

    pub fn prior(&self) -> impl Iterator<Item = &Arc<Volume>> {
        self.volumes.iter().filter(|v| v.is_prior())
    }

    pub fn regular(&self) -> impl Iterator<Item = &Arc<Volume>> {
        self.volumes.iter().filter(|v| !v.is_prior())
    }

    pub fn prior_volumes(&self) -> Vec<Arc<Volume>> {
        self.prior().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}
