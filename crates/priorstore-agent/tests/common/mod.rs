//! Shared fixtures for agent integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use priorstore_agent::{HealthStatus, MigrationError, PlacementAck, PlacementAuthority};
use priorstore_storage::{
    DeviceKey, FixedSpaceProbe, PriorStoreConfig, ShardId, Volume, VolumeSet, VolumeTier,
};

pub const LOCAL_NODE: &str = "local";
pub const REMOTE_NODE: &str = "remote";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyState {
    Started,
    Unassigned,
}

#[derive(Debug, Clone)]
pub struct ShardCopy {
    pub node: &'static str,
    pub primary: bool,
    pub state: CopyState,
}

#[derive(Debug, Default)]
struct RoutingState {
    routing: HashMap<ShardId, Vec<ShardCopy>>,
    health: HashMap<String, HealthStatus>,
    unassigned_now: usize,
    max_unassigned: usize,
    unassign_calls: usize,
    reassign_calls: usize,
}

/// Placement authority holding a routing table in memory.
///
/// Unassign promotes a started replica on another node before taking the
/// local primary out of service. Failures can be injected per call.
#[derive(Debug, Default)]
pub struct InMemoryPlacement {
    state: Mutex<RoutingState>,
    unassign_delay: Duration,
    fail_unassign: AtomicUsize,
    reject_unassign: AtomicUsize,
    fail_reassign: AtomicUsize,
    reject_reassign: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl InMemoryPlacement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold each unassign for `delay` before acknowledging it.
    pub fn with_unassign_delay(delay: Duration) -> Self {
        Self {
            unassign_delay: delay,
            ..Default::default()
        }
    }

    /// Register a shard whose primary is on this node.
    pub fn add_shard(&self, shard: ShardId, with_remote_replica: bool) {
        let mut copies = vec![ShardCopy {
            node: LOCAL_NODE,
            primary: true,
            state: CopyState::Started,
        }];
        if with_remote_replica {
            copies.push(ShardCopy {
                node: REMOTE_NODE,
                primary: false,
                state: CopyState::Started,
            });
        }
        self.state.lock().unwrap().routing.insert(shard, copies);
    }

    pub fn set_health(&self, partition: &str, status: HealthStatus) {
        self.state
            .lock()
            .unwrap()
            .health
            .insert(partition.to_string(), status);
    }

    pub fn fail_next_unassigns(&self, n: usize) {
        self.fail_unassign.store(n, Ordering::SeqCst);
    }

    pub fn reject_next_unassigns(&self, n: usize) {
        self.reject_unassign.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_reassigns(&self, n: usize) {
        self.fail_reassign.store(n, Ordering::SeqCst);
    }

    pub fn reject_next_reassigns(&self, n: usize) {
        self.reject_reassign.store(n, Ordering::SeqCst);
    }

    pub fn local_copy(&self, shard: &ShardId) -> Option<ShardCopy> {
        self.state
            .lock()
            .unwrap()
            .routing
            .get(shard)
            .and_then(|copies| copies.iter().find(|c| c.node == LOCAL_NODE).cloned())
    }

    /// Shards never unassigned count as still in service here.
    pub fn is_assigned_locally(&self, shard: &ShardId) -> bool {
        self.local_copy(shard)
            .map(|c| c.state == CopyState::Started)
            .unwrap_or(true)
    }

    pub fn primary_node(&self, shard: &ShardId) -> Option<&'static str> {
        self.state
            .lock()
            .unwrap()
            .routing
            .get(shard)
            .and_then(|copies| copies.iter().find(|c| c.primary).map(|c| c.node))
    }

    /// Local copies out of service right now.
    pub fn currently_unassigned(&self) -> usize {
        self.state.lock().unwrap().unassigned_now
    }

    /// Most local copies ever out of service at once.
    pub fn max_unassigned(&self) -> usize {
        self.state.lock().unwrap().max_unassigned
    }

    pub fn unassign_calls(&self) -> usize {
        self.state.lock().unwrap().unassign_calls
    }

    pub fn reassign_calls(&self) -> usize {
        self.state.lock().unwrap().reassign_calls
    }
}

#[async_trait]
impl PlacementAuthority for InMemoryPlacement {
    async fn unassign(&self, shards: &[ShardId]) -> Result<PlacementAck, MigrationError> {
        self.state.lock().unwrap().unassign_calls += 1;

        if !self.unassign_delay.is_zero() {
            tokio::time::sleep(self.unassign_delay).await;
        }

        if take_one(&self.fail_unassign) {
            return Err(MigrationError::Placement {
                shard: shards[0].clone(),
                reason: "injected unassign failure".to_string(),
            });
        }
        if take_one(&self.reject_unassign) {
            return Ok(PlacementAck::rejected());
        }

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        for shard in shards {
            let copies = state.routing.entry(shard.clone()).or_insert_with(|| {
                vec![ShardCopy {
                    node: LOCAL_NODE,
                    primary: true,
                    state: CopyState::Started,
                }]
            });

            let local_primary = copies
                .iter()
                .any(|c| c.node == LOCAL_NODE && c.primary && c.state == CopyState::Started);
            let replica = copies
                .iter()
                .position(|c| c.node != LOCAL_NODE && c.state == CopyState::Started);
            if let (true, Some(i)) = (local_primary, replica) {
                copies[i].primary = true;
                for copy in copies.iter_mut().filter(|c| c.node == LOCAL_NODE) {
                    copy.primary = false;
                }
            }

            for copy in copies.iter_mut().filter(|c| c.node == LOCAL_NODE) {
                copy.state = CopyState::Unassigned;
            }
            state.unassigned_now += 1;
            state.max_unassigned = state.max_unassigned.max(state.unassigned_now);
        }

        Ok(PlacementAck::accepted())
    }

    async fn reassign(&self, shards: &[ShardId]) -> Result<PlacementAck, MigrationError> {
        self.state.lock().unwrap().reassign_calls += 1;

        if take_one(&self.fail_reassign) {
            return Err(MigrationError::Placement {
                shard: shards[0].clone(),
                reason: "injected reassign failure".to_string(),
            });
        }
        if take_one(&self.reject_reassign) {
            return Ok(PlacementAck::rejected());
        }

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        for shard in shards {
            let mut restored = false;
            if let Some(copies) = state.routing.get_mut(shard) {
                for copy in copies
                    .iter_mut()
                    .filter(|c| c.node == LOCAL_NODE && c.state == CopyState::Unassigned)
                {
                    copy.state = CopyState::Started;
                    restored = true;
                }
            }
            if restored {
                state.unassigned_now -= 1;
            }
        }

        Ok(PlacementAck::accepted())
    }

    async fn health_of(&self, partition: &str) -> Result<HealthStatus, MigrationError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .health
            .get(partition)
            .copied()
            .unwrap_or(HealthStatus::Green))
    }
}

/// A node with one prior volume (`ssd`) and one regular volume (`hdd`)
/// on separate devices, with controllable space.
pub struct TestNode {
    pub dir: tempfile::TempDir,
    pub ssd: Arc<Volume>,
    pub ssd_space: Arc<FixedSpaceProbe>,
    pub hdd: Arc<Volume>,
    pub hdd_space: Arc<FixedSpaceProbe>,
    pub volumes: Arc<VolumeSet>,
}

impl TestNode {
    /// Prior volume 90% full out of 100 bytes, regular volume empty.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ssd_root = dir.path().join("ssd");
        let hdd_root = dir.path().join("hdd");
        std::fs::create_dir_all(&ssd_root).unwrap();
        std::fs::create_dir_all(&hdd_root).unwrap();

        let ssd_space = Arc::new(FixedSpaceProbe::new(10, 100));
        let hdd_space = Arc::new(FixedSpaceProbe::new(1000, 1000));
        let ssd = Arc::new(Volume::with_probe(
            ssd_root,
            DeviceKey(1),
            VolumeTier::Prior,
            ssd_space.clone(),
        ));
        let hdd = Arc::new(Volume::with_probe(
            hdd_root,
            DeviceKey(2),
            VolumeTier::Regular,
            hdd_space.clone(),
        ));
        let volumes = Arc::new(VolumeSet::new(vec![ssd.clone(), hdd.clone()]));

        Self {
            dir,
            ssd,
            ssd_space,
            hdd,
            hdd_space,
            volumes,
        }
    }

    /// Lay out the standard tree on the prior volume:
    ///
    /// - `logs` (15 bytes, non-partitioned)
    /// - `events@2023-01` shards 0 and 1 (9 bytes, 3 files)
    /// - `events@2023-02` shard 0 (6 bytes, 1 file)
    ///
    /// With 100 bytes total and the default ratios, both `events`
    /// partitions are selected.
    pub fn populate(&self) {
        let root = self.ssd.root();
        write(root, "logs/0/index/_0.cfs", b"0123456789abcde");
        write(root, "events@2023-01/0/index/_0.cfs", b"abc");
        write(root, "events@2023-01/0/index/write.lock", b"");
        write(root, "events@2023-01/0/translog/translog-1.tlog", b"tl");
        write(root, "events@2023-01/1/index/_1.cfs", b"defg");
        write(root, "events@2023-02/0/index/_0.cfs", b"hijklm");
    }

    pub fn shard_dir(&self, volume: &Volume, index: &str, shard: u32) -> PathBuf {
        ShardId::new(index, shard).dir_in(&volume.indices_path())
    }
}

pub fn write(volume_root: &Path, relative: &str, contents: &[u8]) {
    let path = volume_root.join("indices").join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

pub fn shards_of_standard_tree() -> Vec<ShardId> {
    vec![
        ShardId::new("events@2023-01", 0),
        ShardId::new("events@2023-01", 1),
        ShardId::new("events@2023-02", 0),
    ]
}

/// Configuration with short waits for tests.
pub fn test_config() -> PriorStoreConfig {
    PriorStoreConfig {
        shard_lock_timeout: Duration::from_millis(100),
        permit_timeout: Duration::from_secs(5),
        reassign_backoff: Duration::from_millis(5),
        schedule_interval: Duration::from_millis(50),
        ..Default::default()
    }
}
