//! Partition identifiers recovered from directory names.
//!
//! A directory under `indices/` is either a plain index (`logs`) or a
//! partitioned sub-index (`events@2023-01`). The name is split at the first
//! `@`; both halves must be non-empty for the name to count as partitioned.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator between base index and partition key.
pub const PARTITION_SEPARATOR: char = '@';

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId {
    /// Full directory name, as found on disk.
    name: String,
    base_index: String,
    key: Option<String>,
}

impl PartitionId {
    pub fn parse(name: impl Into<String>) -> Self {
        let name = name.into();
        let (base_index, key) = match name.split_once(PARTITION_SEPARATOR) {
            Some((base, key)) if !base.is_empty() && !key.is_empty() => {
                (base.to_string(), Some(key.to_string()))
            }
            _ => (name.clone(), None),
        };
        Self {
            name,
            base_index,
            key,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_index(&self) -> &str {
        &self.base_index
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn is_partitioned(&self) -> bool {
        self.key.is_some()
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// On-disk footprint of one partition on one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionUsage {
    pub id: PartitionId,
    /// Bytes of regular files beneath the partition directory.
    /// `None` when part of the tree could not be read.
    pub size_bytes: Option<u64>,
}

impl PartitionUsage {
    pub fn new(name: impl Into<String>, size_bytes: Option<u64>) -> Self {
        Self {
            id: PartitionId::parse(name),
            size_bytes,
        }
    }
}
