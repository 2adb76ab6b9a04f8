//! Directory Distributor
//!
//! Picks the volume that receives the next write.
//!
//! ## Selection
//!
//! 1. Among prior volumes, skip any whose saturation meets or exceeds
//!    `max_threshold`, then pick the one with the most usable space.
//! 2. If no prior volume qualifies, pick among *all* volumes with no
//!    threshold.
//!
//! Volumes sharing the maximum usable space are chosen uniformly at random,
//! in a single pass without collecting the tied candidates:
//!
//! ```text
//! usable:  80  120  120  40  120
//! best:    a    b    b|c  .   b|c|e     (the k-th tie replaces best with p = 1/k)
//! ```

use std::sync::Arc;

use rand::Rng;
use tracing::{trace, warn};

use crate::volume::{Volume, VolumeSet};

/// Pick the candidate with the most usable space.
///
/// With a threshold, candidates whose saturation is at or above it are
/// excluded. Candidates whose space cannot be read are excluded as well.
/// Returns `None` when nothing qualifies.
pub fn pick<'a, R: Rng + ?Sized>(
    candidates: &'a [Arc<Volume>],
    threshold: Option<f64>,
    rng: &mut R,
) -> Option<&'a Arc<Volume>> {
    let mut best: Option<&'a Arc<Volume>> = None;
    let mut best_usable = 0u64;
    let mut ties = 0u32;

    for volume in candidates {
        let space = match volume.space() {
            Ok(space) => space,
            Err(e) => {
                warn!(volume = %volume, error = %e, "Skipping volume with unreadable space");
                continue;
            }
        };

        if let Some(threshold) = threshold {
            if space.saturation() >= threshold {
                trace!(
                    volume = %volume,
                    saturation = space.saturation(),
                    threshold,
                    "Volume above saturation threshold"
                );
                continue;
            }
        }

        if best.is_none() || space.usable_bytes > best_usable {
            best = Some(volume);
            best_usable = space.usable_bytes;
            ties = 1;
        } else if space.usable_bytes == best_usable {
            ties += 1;
            if rng.gen::<f64>() < 1.0 / ties as f64 {
                best = Some(volume);
            }
        }
    }

    best
}

/// Write-path placement preferring prior volumes.
#[derive(Debug, Clone)]
pub struct PriorStoreDistributor {
    volumes: Arc<VolumeSet>,
    prior: Vec<Arc<Volume>>,
    max_threshold: f64,
}

impl PriorStoreDistributor {
    pub fn new(volumes: Arc<VolumeSet>, max_threshold: f64) -> Self {
        let prior = volumes.prior_volumes();
        Self {
            volumes,
            prior,
            max_threshold,
        }
    }

    pub fn name(&self) -> &'static str {
        "prior_store"
    }

    /// Pick the volume for the next write.
    pub fn select(&self) -> Option<Arc<Volume>> {
        self.select_with(&mut rand::thread_rng())
    }

    /// Pick the volume for the next write using the given randomness.
    pub fn select_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Arc<Volume>> {
        if !self.prior.is_empty() {
            if let Some(volume) = pick(&self.prior, Some(self.max_threshold), rng) {
                return Some(Arc::clone(volume));
            }
        }
        pick(self.volumes.all(), None, rng).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{DeviceKey, FixedSpaceProbe, VolumeTier};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn volume(root: &str, tier: VolumeTier, usable: u64, total: u64) -> Arc<Volume> {
        Arc::new(Volume::with_probe(
            root,
            DeviceKey(root.len() as u64),
            tier,
            Arc::new(FixedSpaceProbe::new(usable, total)),
        ))
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_pick_most_usable() {
        let candidates = vec![
            volume("/a", VolumeTier::Regular, 30, 100),
            volume("/bb", VolumeTier::Regular, 70, 100),
            volume("/ccc", VolumeTier::Regular, 50, 100),
        ];
        let picked = pick(&candidates, None, &mut rng()).unwrap();
        assert_eq!(picked.root().to_str(), Some("/bb"));
    }

    #[test]
    fn test_pick_empty_returns_none() {
        assert!(pick(&[], None, &mut rng()).is_none());
        assert!(pick(&[], Some(0.5), &mut rng()).is_none());
    }

    #[test]
    fn test_pick_below_threshold_returns_member() {
        let candidates = vec![
            volume("/a", VolumeTier::Prior, 60, 100),
            volume("/bb", VolumeTier::Prior, 90, 100),
        ];
        let picked = pick(&candidates, Some(0.85), &mut rng()).unwrap();
        assert!(candidates.iter().any(|c| Arc::ptr_eq(c, picked)));
    }

    #[test]
    fn test_pick_threshold_is_inclusive() {
        // Saturation exactly 0.85 is excluded, as is anything above.
        let candidates = vec![
            volume("/a", VolumeTier::Prior, 15, 100),
            volume("/bb", VolumeTier::Prior, 5, 100),
        ];
        assert!(pick(&candidates, Some(0.85), &mut rng()).is_none());
    }

    #[test]
    fn test_pick_skips_saturated_but_keeps_others() {
        let candidates = vec![
            volume("/a", VolumeTier::Prior, 10, 100),
            volume("/bb", VolumeTier::Prior, 20, 100),
        ];
        let picked = pick(&candidates, Some(0.85), &mut rng()).unwrap();
        assert_eq!(picked.root().to_str(), Some("/bb"));
    }

    #[test]
    fn test_pick_zero_usable_still_selectable_without_threshold() {
        let candidates = vec![volume("/a", VolumeTier::Regular, 0, 100)];
        assert!(pick(&candidates, None, &mut rng()).is_some());
    }

    #[test]
    fn test_ties_are_uniform() {
        let candidates = vec![
            volume("/a", VolumeTier::Regular, 500, 1000),
            volume("/bb", VolumeTier::Regular, 500, 1000),
        ];
        let mut rng = rng();
        let trials = 10_000;
        let mut first = 0;
        for _ in 0..trials {
            let picked = pick(&candidates, None, &mut rng).unwrap();
            if Arc::ptr_eq(picked, &candidates[0]) {
                first += 1;
            }
        }
        let ratio = first as f64 / trials as f64;
        assert!((ratio - 0.5).abs() < 0.03, "ratio was {}", ratio);
    }

    #[test]
    fn test_three_way_tie_is_uniform() {
        let candidates = vec![
            volume("/a", VolumeTier::Regular, 500, 1000),
            volume("/bb", VolumeTier::Regular, 100, 1000),
            volume("/ccc", VolumeTier::Regular, 500, 1000),
            volume("/dddd", VolumeTier::Regular, 500, 1000),
        ];
        let mut rng = rng();
        let mut counts = [0u32; 4];
        let trials = 30_000;
        for _ in 0..trials {
            let picked = pick(&candidates, None, &mut rng).unwrap();
            let i = candidates.iter().position(|c| Arc::ptr_eq(c, picked)).unwrap();
            counts[i] += 1;
        }
        assert_eq!(counts[1], 0);
        for i in [0, 2, 3] {
            let ratio = counts[i] as f64 / trials as f64;
            assert!((ratio - 1.0 / 3.0).abs() < 0.03, "ratio[{}] was {}", i, ratio);
        }
    }

    #[test]
    fn test_distributor_prefers_prior() {
        let set = Arc::new(VolumeSet::new(vec![
            volume("/hdd", VolumeTier::Regular, 900, 1000),
            volume("/ssd", VolumeTier::Prior, 300, 1000),
        ]));
        let distributor = PriorStoreDistributor::new(set, 0.85);
        let picked = distributor.select_with(&mut rng()).unwrap();
        assert_eq!(picked.root().to_str(), Some("/ssd"));
        assert_eq!(distributor.name(), "prior_store");
    }

    #[test]
    fn test_distributor_falls_back_when_prior_saturated() {
        let set = Arc::new(VolumeSet::new(vec![
            volume("/hdd0", VolumeTier::Regular, 400, 1000),
            volume("/ssd", VolumeTier::Prior, 100, 1000),
            volume("/hdd1", VolumeTier::Regular, 700, 1000),
        ]));
        let distributor = PriorStoreDistributor::new(set, 0.85);
        let picked = distributor.select_with(&mut rng()).unwrap();
        assert_eq!(picked.root().to_str(), Some("/hdd1"));
    }

    #[test]
    fn test_distributor_without_prior_volumes() {
        let set = Arc::new(VolumeSet::new(vec![
            volume("/hdd0", VolumeTier::Regular, 1, 1000),
            volume("/hdd1", VolumeTier::Regular, 2, 1000),
        ]));
        let distributor = PriorStoreDistributor::new(set, 0.85);
        let picked = distributor.select().unwrap();
        assert_eq!(picked.root().to_str(), Some("/hdd1"));
    }
}
