//! Shard File Mover
//!
//! Moves a shard's files between volumes so that, at every crash point, a
//! file is either complete at its final name or still at the source:
//!
//! ```text
//! src/index/_0.cfs ──copy──▶ dst/index/migrating_3fa1c2d0__0.cfs
//!                            dst/index/migrating_3fa1c2d0__0.cfs ──rename──▶ dst/index/_0.cfs
//! src/index/_0.cfs ──delete
//! ```
//!
//! A crash between rename and delete leaves the file at both ends; moving
//! again overwrites the destination with identical bytes and removes the
//! source. A crash before the rename leaves a `migrating_*` file that
//! [`sweep_orphaned_temp_files`] deletes on the next start.
//!
//! Once a sub-area is moved, each moved file and then the destination
//! directory are fsynced.

use std::path::{Path, PathBuf};

use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::shard::{is_location_marker, ShardId, DATA_DIR, WAL_DIR};

/// Prefix of in-flight copies inside a destination sub-area.
pub const TEMP_PREFIX: &str = "migrating_";

/// What a relocation moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveReport {
    pub files_moved: usize,
    pub bytes_moved: u64,
}

impl MoveReport {
    fn add(&mut self, other: MoveReport) {
        self.files_moved += other.files_moved;
        self.bytes_moved += other.bytes_moved;
    }
}

/// Move a shard's primary data and write-ahead log to another volume.
///
/// The caller must hold the shard's directory lock. Files moved before an
/// error stay moved.
pub async fn relocate_shard(shard: &ShardId, src_dir: &Path, dst_dir: &Path) -> Result<MoveReport> {
    let mut report = MoveReport::default();

    for area in [DATA_DIR, WAL_DIR] {
        let dst_area = dst_dir.join(area);
        tokio::fs::create_dir_all(&dst_area)
            .await
            .map_err(|source| copy_err(shard, &dst_area, source))?;
    }

    for area in [DATA_DIR, WAL_DIR] {
        let moved = move_area(shard, &src_dir.join(area), &dst_dir.join(area)).await?;
        report.add(moved);
    }

    retire_source(src_dir).await;

    info!(
        shard = %shard,
        files = report.files_moved,
        bytes = report.bytes_moved,
        "Moved shard files"
    );
    Ok(report)
}

/// Move every regular file of one sub-area, then make the moves durable.
async fn move_area(shard: &ShardId, src: &Path, dst: &Path) -> Result<MoveReport> {
    let mut entries = match tokio::fs::read_dir(src).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(shard = %shard, path = ?src, "Source sub-area absent");
            return Ok(MoveReport::default());
        }
        Err(e) => return Err(copy_err(shard, src, e)),
    };

    let mut report = MoveReport::default();
    let mut moved = Vec::new();

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| copy_err(shard, src, e))?
    {
        let src_file = entry.path();
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| copy_err(shard, &src_file, e))?;
        if !file_type.is_file() {
            continue;
        }

        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_location_marker(&name) {
            trace!(shard = %shard, file = %name, "Skipping location marker");
            continue;
        }

        let dst_file = dst.join(&*name);
        let bytes = move_file(shard, &src_file, &dst_file, &name).await?;
        report.files_moved += 1;
        report.bytes_moved += bytes;
        moved.push(dst_file);
    }

    for file in &moved {
        sync_file(file)
            .await
            .map_err(|e| copy_err(shard, file, e))?;
        trace!(shard = %shard, path = ?file, "Synced file");
    }
    sync_dir(dst).await.map_err(|e| copy_err(shard, dst, e))?;
    trace!(shard = %shard, path = ?dst, "Synced directory");

    Ok(report)
}

/// Copy to a temp name, rename into place, then delete the source.
async fn move_file(shard: &ShardId, src: &Path, dst: &Path, name: &str) -> Result<u64> {
    let dst_dir = dst.parent().unwrap_or(dst);
    let temp = dst_dir.join(format!("{}{:08x}_{}", TEMP_PREFIX, rand::random::<u32>(), name));

    let bytes = match tokio::fs::copy(src, &temp).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(copy_err(shard, src, e));
        }
    };
    if let Err(e) = tokio::fs::rename(&temp, dst).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(copy_err(shard, dst, e));
    }
    tokio::fs::remove_file(src)
        .await
        .map_err(|e| copy_err(shard, src, e))?;

    trace!(shard = %shard, from = ?src, to = ?dst, bytes, "Moved file");
    Ok(bytes)
}

/// Drop the emptied source shard directory.
///
/// Only location markers and empty directories are removed; anything else
/// left behind keeps its directory alive.
async fn retire_source(src_dir: &Path) {
    for area in [DATA_DIR, WAL_DIR] {
        let area_dir = src_dir.join(area);
        for marker in [crate::shard::WRITE_LOCK_FILE, crate::shard::GENERATION_FILE] {
            let _ = tokio::fs::remove_file(area_dir.join(marker)).await;
        }
        let _ = tokio::fs::remove_dir(&area_dir).await;
    }

    if let Err(e) = tokio::fs::remove_dir(src_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = ?src_dir, error = %e, "Source shard directory kept");
        }
        return;
    }
    if let Some(partition_dir) = src_dir.parent() {
        let _ = tokio::fs::remove_dir(partition_dir).await;
    }
}

/// Delete `migrating_*` files left in shard sub-areas by an interrupted move.
///
/// Walks `<indices>/<partition>/<shard>/{index,translog}`. Returns how many
/// files were removed.
pub async fn sweep_orphaned_temp_files(indices_path: &Path) -> Result<usize> {
    let mut removed = 0;

    for partition_dir in subdirs(indices_path).await? {
        let shard_dirs = match subdirs(&partition_dir).await {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(path = ?partition_dir, error = %e, "Skipping unreadable partition in sweep");
                continue;
            }
        };
        for shard_dir in shard_dirs {
            for area in [DATA_DIR, WAL_DIR] {
                let area_dir = shard_dir.join(area);
                match sweep_area(&area_dir).await {
                    Ok(n) => removed += n,
                    Err(e) => {
                        warn!(path = ?area_dir, error = %e, "Skipping unreadable shard directory in sweep")
                    }
                }
            }
        }
    }

    if removed > 0 {
        info!(path = ?indices_path, removed, "Swept orphaned temp files");
    }
    Ok(removed)
}

async fn sweep_area(area_dir: &Path) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(area_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                debug!(path = ?entry.path(), "Removed orphaned temp file");
                removed += 1;
            }
            Err(e) => {
                warn!(path = ?entry.path(), error = %e, "Failed to remove orphaned temp file")
            }
        }
    }
    Ok(removed)
}

async fn subdirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

async fn sync_file(path: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(path).await?.sync_all().await
}

async fn sync_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        tokio::fs::File::open(path).await?.sync_all().await?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

fn copy_err(shard: &ShardId, path: &Path, source: std::io::Error) -> Error {
    Error::Copy {
        shard: shard.clone(),
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_relocate_moves_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let shard = ShardId::new("logs", 0);
        let src = dir.path().join("ssd/indices/logs/0");
        let dst = dir.path().join("hdd/indices/logs/0");

        write(&src.join("index/_0.cfs"), b"segment zero");
        write(&src.join("index/_1.cfs"), b"segment one");
        write(&src.join("index/segments_2"), b"commit");
        write(&src.join("translog/translog-3.tlog"), b"ops");
        write(&src.join("translog/translog.ckp"), b"checkpoint");

        let report = relocate_shard(&shard, &src, &dst).await.unwrap();

        assert_eq!(report.files_moved, 5);
        assert_eq!(report.bytes_moved, 12 + 11 + 6 + 3 + 10);
        assert_eq!(
            file_names(&dst.join("index")),
            vec!["_0.cfs", "_1.cfs", "segments_2"]
        );
        assert_eq!(
            file_names(&dst.join("translog")),
            vec!["translog-3.tlog", "translog.ckp"]
        );
        assert_eq!(std::fs::read(dst.join("index/_0.cfs")).unwrap(), b"segment zero");
        assert_eq!(std::fs::read(dst.join("translog/translog.ckp")).unwrap(), b"checkpoint");
        assert!(!src.exists());
    }

    #[tokio::test]
    async fn test_relocate_leaves_markers_and_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let shard = ShardId::new("logs", 0);
        let src = dir.path().join("ssd/indices/logs/0");
        let dst = dir.path().join("hdd/indices/logs/0");

        write(&src.join("index/_0.cfs"), b"data");
        write(&src.join("index/write.lock"), b"");
        write(&src.join("index/segments.gen"), b"gen");
        write(&src.join("index/nested/keep"), b"nested");

        let report = relocate_shard(&shard, &src, &dst).await.unwrap();

        assert_eq!(report.files_moved, 1);
        assert_eq!(file_names(&dst.join("index")), vec!["_0.cfs"]);
        assert!(dst.join("translog").is_dir());
        assert!(src.join("index/nested/keep").exists());
        assert!(!src.join("index/_0.cfs").exists());
    }

    #[tokio::test]
    async fn test_rerun_after_rename_before_delete() {
        let dir = tempfile::tempdir().unwrap();
        let shard = ShardId::new("logs", 0);
        let src = dir.path().join("ssd/indices/logs/0");
        let dst = dir.path().join("hdd/indices/logs/0");

        // Crashed after renaming _0.cfs into place but before deleting it.
        write(&src.join("index/_0.cfs"), b"segment zero");
        write(&dst.join("index/_0.cfs"), b"segment zero");
        write(&src.join("index/_1.cfs"), b"segment one");

        let report = relocate_shard(&shard, &src, &dst).await.unwrap();

        assert_eq!(report.files_moved, 2);
        assert_eq!(file_names(&dst.join("index")), vec!["_0.cfs", "_1.cfs"]);
        assert_eq!(std::fs::read(dst.join("index/_0.cfs")).unwrap(), b"segment zero");
        assert!(file_names(&src.join("index")).is_empty());
    }

    #[tokio::test]
    async fn test_relocate_missing_source_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let shard = ShardId::new("logs", 4);
        let report = relocate_shard(&shard, &dir.path().join("gone"), &dir.path().join("dst"))
            .await
            .unwrap();
        assert_eq!(report, MoveReport::default());
    }

    #[tokio::test]
    async fn test_relocate_into_blocked_destination_fails() {
        let dir = tempfile::tempdir().unwrap();
        let shard = ShardId::new("logs", 0);
        let src = dir.path().join("ssd/indices/logs/0");
        let dst = dir.path().join("hdd/indices/logs/0");
        write(&src.join("index/_0.cfs"), b"data");
        write(&dst, b"a file where the shard directory belongs");

        let err = relocate_shard(&shard, &src, &dst).await.unwrap_err();

        assert!(err.is_copy_failure());
        assert!(src.join("index/_0.cfs").exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let indices = dir.path().join("indices");
        write(&indices.join("logs/0/index/migrating_0000abcd__0.cfs"), b"partial");
        write(&indices.join("logs/0/index/_0.cfs"), b"data");
        write(&indices.join("logs/1/translog/migrating_12345678_translog.ckp"), b"p");
        write(&indices.join("logs/1/translog/translog.ckp"), b"c");

        let removed = sweep_orphaned_temp_files(&indices).await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(file_names(&indices.join("logs/0/index")), vec!["_0.cfs"]);
        assert_eq!(file_names(&indices.join("logs/1/translog")), vec!["translog.ckp"]);
    }

    #[tokio::test]
    async fn test_sweep_continues_past_unreadable_shard() {
        let dir = tempfile::tempdir().unwrap();
        let indices = dir.path().join("indices");
        // A file where a sub-area directory belongs cannot be listed.
        write(&indices.join("aaa/0/index"), b"not a directory");
        write(&indices.join("aaa/1/index/migrating_00000001__0.cfs"), b"partial");
        write(&indices.join("zzz/0/translog/migrating_00000002_translog.ckp"), b"p");

        let removed = sweep_orphaned_temp_files(&indices).await.unwrap();

        assert_eq!(removed, 2);
        assert!(file_names(&indices.join("aaa/1/index")).is_empty());
        assert!(file_names(&indices.join("zzz/0/translog")).is_empty());
        assert!(indices.join("aaa/0/index").is_file());
    }

    #[tokio::test]
    async fn test_sweep_missing_indices() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(sweep_orphaned_temp_files(&dir.path().join("indices")).await.unwrap(), 0);
    }
}
