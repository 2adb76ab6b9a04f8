//! Prior Store Configuration
//!
//! This module defines configuration for write placement and background migration.
//!
//! ## PriorStoreConfig
//!
//! Controls where new data lands and when it is moved off the prior tier:
//!
//! - **enabled**: Master switch for the prior store (default: true)
//! - **prior_paths**: Roots of the fast, limited-capacity volumes
//! - **max_threshold**: Saturation at which the distributor stops preferring a prior volume (default: 0.85)
//! - **migration_threshold**: Saturation that triggers migration off a prior volume (default: 0.80)
//! - **migration_fraction**: Share of a volume's total space drained per pass (default: 0.10)
//! - **non_partition_threshold**: Share of total space non-partitioned indices may hold
//!   before they are evacuated first (default: 0.20)
//! - **schedule_interval**: Fixed delay between migration passes (default: 1 hour)
//! - **migration_concurrency**: Shards allowed between unassign and reassign at once (default: 5)
//!
//! ## Usage
//!
//! ```ignore
//! use priorstore_storage::PriorStoreConfig;
//!
//! let config = PriorStoreConfig {
//!     prior_paths: vec!["/mnt/nvme0".into()],
//!     migration_threshold: 0.75,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which migration strategy picks partitions off a saturated volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPolicyKind {
    /// Evict large non-partitioned indices first when they dominate the
    /// volume, otherwise the oldest partitions.
    #[default]
    SizeAge,
}

impl std::str::FromStr for MigrationPolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "size_age" => Ok(MigrationPolicyKind::SizeAge),
            other => Err(Error::Config(format!("unknown migration policy: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorStoreConfig {
    /// Whether the prior store is enabled (default: true)
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Root paths of prior-tier volumes
    #[serde(default)]
    pub prior_paths: Vec<PathBuf>,

    /// Distributor saturation cutoff for prior volumes (default: 0.85)
    #[serde(default = "default_max_threshold")]
    pub max_threshold: f64,

    /// Saturation above which a prior volume is migrated (default: 0.80)
    #[serde(default = "default_migration_threshold")]
    pub migration_threshold: f64,

    /// Fraction of total space selected per migration pass (default: 0.10)
    #[serde(default = "default_migration_fraction")]
    pub migration_fraction: f64,

    /// Non-partitioned pool cutoff as a fraction of total space (default: 0.20)
    #[serde(default = "default_non_partition_threshold")]
    pub non_partition_threshold: f64,

    /// Fixed delay between migration passes (default: 1 hour)
    #[serde(default = "default_schedule_interval", with = "duration_secs")]
    pub schedule_interval: Duration,

    /// Maximum shards mid-migration at once (default: 5)
    #[serde(default = "default_migration_concurrency")]
    pub migration_concurrency: usize,

    /// How long to wait for a migration permit (default: 1 hour)
    #[serde(default = "default_permit_timeout", with = "duration_secs")]
    pub permit_timeout: Duration,

    /// How long to wait for a shard directory lock (default: 60s)
    #[serde(default = "default_shard_lock_timeout", with = "duration_secs")]
    pub shard_lock_timeout: Duration,

    /// Extra reassign attempts after a failed reassign (default: 3)
    #[serde(default = "default_reassign_retries")]
    pub reassign_retries: u32,

    /// Initial backoff between reassign attempts, doubled per attempt (default: 1s)
    #[serde(default = "default_reassign_backoff", with = "duration_secs")]
    pub reassign_backoff: Duration,

    /// Migration strategy (default: size_age)
    #[serde(default)]
    pub policy: MigrationPolicyKind,
}

impl Default for PriorStoreConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            prior_paths: Vec::new(),
            max_threshold: default_max_threshold(),
            migration_threshold: default_migration_threshold(),
            migration_fraction: default_migration_fraction(),
            non_partition_threshold: default_non_partition_threshold(),
            schedule_interval: default_schedule_interval(),
            migration_concurrency: default_migration_concurrency(),
            permit_timeout: default_permit_timeout(),
            shard_lock_timeout: default_shard_lock_timeout(),
            reassign_retries: default_reassign_retries(),
            reassign_backoff: default_reassign_backoff(),
            policy: MigrationPolicyKind::default(),
        }
    }
}

impl PriorStoreConfig {
    /// Load configuration from `PRIOR_STORE_*` environment variables.
    ///
    /// Missing or unparsable values fall back to their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from `PRIOR_STORE_*` keys resolved by `lookup`.
    ///
    /// `PRIOR_STORE_PATHS` is a comma-separated list; entries are trimmed and
    /// empty ones dropped.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).map(|s| s.trim().to_string());

        let prior_paths = parse("PRIOR_STORE_PATHS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            enabled: parsed(parse("PRIOR_STORE_ENABLED")).unwrap_or(defaults.enabled),
            prior_paths,
            max_threshold: parsed(parse("PRIOR_STORE_MAX_THRESHOLD"))
                .unwrap_or(defaults.max_threshold),
            migration_threshold: parsed(parse("PRIOR_STORE_MIGRATION_THRESHOLD"))
                .unwrap_or(defaults.migration_threshold),
            migration_fraction: parsed(parse("PRIOR_STORE_MIGRATION_FRACTION"))
                .unwrap_or(defaults.migration_fraction),
            non_partition_threshold: parsed(parse("PRIOR_STORE_NON_PARTITION_THRESHOLD"))
                .unwrap_or(defaults.non_partition_threshold),
            schedule_interval: parsed::<u64>(parse("PRIOR_STORE_SCHEDULE_INTERVAL_SECS"))
                .map(Duration::from_secs)
                .unwrap_or(defaults.schedule_interval),
            migration_concurrency: parsed(parse("PRIOR_STORE_MIGRATION_CONCURRENCY"))
                .unwrap_or(defaults.migration_concurrency),
            policy: parsed(parse("PRIOR_STORE_POLICY")).unwrap_or(defaults.policy),
            ..defaults
        }
    }

    /// Check that every ratio and limit is usable.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_threshold", self.max_threshold),
            ("migration_threshold", self.migration_threshold),
            ("non_partition_threshold", self.non_partition_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if !(self.migration_fraction > 0.0 && self.migration_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "migration_fraction must be within (0, 1], got {}",
                self.migration_fraction
            )));
        }

        if self.migration_concurrency == 0 {
            return Err(Error::Config(
                "migration_concurrency must be at least 1".to_string(),
            ));
        }

        for (name, value) in [
            ("schedule_interval", self.schedule_interval),
            ("permit_timeout", self.permit_timeout),
            ("shard_lock_timeout", self.shard_lock_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }

        Ok(())
    }

    /// Whether the prior store should be wired in at all.
    ///
    /// Requires the switch to be on and the first prior path to be an
    /// existing directory.
    pub fn is_active(&self) -> bool {
        self.enabled
            && self
                .prior_paths
                .first()
                .map(|p| p.is_dir())
                .unwrap_or(false)
    }
}

fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|s| s.parse().ok())
}

fn default_enabled() -> bool {
    true
}

fn default_max_threshold() -> f64 {
    0.85
}

fn default_migration_threshold() -> f64 {
    0.80
}

fn default_migration_fraction() -> f64 {
    0.10
}

fn default_non_partition_threshold() -> f64 {
    0.20
}

fn default_schedule_interval() -> Duration {
    Duration::from_secs(3600) // 1 hour
}

fn default_migration_concurrency() -> usize {
    5
}

fn default_permit_timeout() -> Duration {
    Duration::from_secs(3600) // 1 hour
}

fn default_shard_lock_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_reassign_retries() -> u32 {
    3
}

fn default_reassign_backoff() -> Duration {
    Duration::from_secs(1)
}

/// Durations as whole seconds on the wire.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
