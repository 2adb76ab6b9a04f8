//! Shard identity and on-disk layout.
//!
//! ```text
//! <volume root>/indices/<partition>/<shard number>/index/     primary data
//!                                                 /translog/  write-ahead log
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Directory under a volume root that holds all partitions.
pub const INDICES_DIR: &str = "indices";

/// Primary data sub-area of a shard directory.
pub const DATA_DIR: &str = "index";

/// Write-ahead log sub-area of a shard directory.
pub const WAL_DIR: &str = "translog";

/// Active writer lock marker. Belongs to the location, never moved.
pub const WRITE_LOCK_FILE: &str = "write.lock";

/// Generation marker. Belongs to the location, never moved.
pub const GENERATION_FILE: &str = "segments.gen";

/// Identifies one shard of an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }

    /// Shard directory under an `indices` directory.
    pub fn dir_in(&self, indices_path: &Path) -> PathBuf {
        indices_path.join(&self.index).join(self.shard.to_string())
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Whether a file inside a sub-area is per-location bookkeeping.
pub fn is_location_marker(file_name: &str) -> bool {
    file_name == WRITE_LOCK_FILE || file_name == GENERATION_FILE
}

/// List the shards of an index by their numbered directories.
///
/// Entries whose names are not unsigned integers are ignored. A missing
/// index directory yields no shards.
pub async fn discover_shards(index_path: &Path) -> std::io::Result<Vec<ShardId>> {
    let index = match index_path.file_name() {
        Some(name) => name.to_string_lossy().to_string(),
        None => return Ok(Vec::new()),
    };

    let mut entries = match tokio::fs::read_dir(index_path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut shards = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if let Ok(number) = entry.file_name().to_string_lossy().parse::<u32>() {
            shards.push(ShardId::new(index.clone(), number));
        }
    }

    shards.sort();
    Ok(shards)
}
