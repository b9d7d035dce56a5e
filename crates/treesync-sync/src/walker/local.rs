//! Local directory walker
//!
//! Depth-first traversal with `tokio::fs`. Entry IDs are inode numbers and
//! file hashes are lowercase hex SHA-256 digests, computed with one scratch
//! buffer reused across the whole walk.
//!
//! A file with several hard links is reported once, at the first path the
//! walk reaches, since every link carries the same inode.

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use treesync_core::config::{WalkerConfig, DEFAULT_HASH_BUFFER_SIZE};
use treesync_core::domain::entry::join_path;
use treesync_core::domain::{EntryId, FsName, SnapshotEntry};
use treesync_core::ports::{IngestOutcome, TreeWalker};

use super::EntryEmitter;
use crate::SyncError;

/// Walks a local directory tree
#[derive(Debug, Clone)]
pub struct LocalWalker {
    hash_buffer_size: usize,
}

impl LocalWalker {
    #[must_use]
    pub fn new(hash_buffer_size: usize) -> Self {
        Self {
            hash_buffer_size: hash_buffer_size.max(1),
        }
    }

    #[must_use]
    pub fn from_config(config: &WalkerConfig) -> Self {
        Self::new(config.hash_buffer_size)
    }

    async fn traverse(
        &self,
        emitter: &mut EntryEmitter<'_>,
        fs_name: &FsName,
        root: &Path,
    ) -> Result<(), SyncError> {
        let root_meta = tokio::fs::symlink_metadata(root)
            .await
            .map_err(|e| SyncError::from_io(root, e))?;
        if !root_meta.is_dir() {
            return Err(SyncError::InvalidPath(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        let root_dev = root_meta.dev();

        let root_id = EntryId::from_inode(root_meta.ino());
        let root_name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        let (created, modified) = timestamps(&root_meta);
        emitter
            .emit(
                SnapshotEntry::folder(fs_name.clone(), root_id.clone(), None, "/")
                    .with_name(root_name)
                    .with_times(created, modified),
            )
            .await?;

        let mut visited: HashMap<PathBuf, EntryId> = HashMap::new();
        visited.insert(root.to_path_buf(), root_id);
        // Inodes of multiply linked files already emitted.
        let mut linked_files: HashSet<u64> = HashSet::new();

        let mut scratch = vec![0u8; self.hash_buffer_size];
        let mut stack: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), "/".to_string())];

        while let Some((dir, rel)) = stack.pop() {
            if emitter.cancel().is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let parent_id = visited
                .get(&dir)
                .cloned()
                .ok_or_else(|| SyncError::OrphanEntry {
                    entry_id: "?".to_string(),
                    path: rel.clone(),
                })?;

            let mut subdirs = Vec::new();
            for (name, path) in sorted_children(&dir).await? {
                let meta = tokio::fs::symlink_metadata(&path)
                    .await
                    .map_err(|e| SyncError::from_io(&path, e))?;
                let file_type = meta.file_type();
                let child_rel = join_path(&rel, &name);
                let (created, modified) = timestamps(&meta);
                let id = EntryId::from_inode(meta.ino());

                if file_type.is_dir() {
                    if meta.dev() != root_dev {
                        debug!(path = %child_rel, "Pruning subtree on another device");
                        continue;
                    }
                    emitter
                        .emit(
                            SnapshotEntry::folder(
                                fs_name.clone(),
                                id.clone(),
                                Some(parent_id.clone()),
                                child_rel.clone(),
                            )
                            .with_times(created, modified),
                        )
                        .await?;
                    visited.insert(path.clone(), id);
                    subdirs.push((path, child_rel));
                } else if file_type.is_file() {
                    if meta.nlink() > 1 && !linked_files.insert(meta.ino()) {
                        debug!(path = %child_rel, "Skipping additional hard link");
                        continue;
                    }
                    let hash = hash_file(emitter.cancel(), &path, &mut scratch).await?;
                    emitter
                        .emit(
                            SnapshotEntry::file(
                                fs_name.clone(),
                                id,
                                Some(parent_id.clone()),
                                child_rel,
                                meta.len(),
                                hash,
                            )
                            .with_times(created, modified),
                        )
                        .await?;
                } else {
                    debug!(path = %child_rel, "Skipping symlink or special file");
                }
            }

            // Reverse so the first name is expanded first.
            stack.extend(subdirs.into_iter().rev());
        }

        Ok(())
    }
}

impl Default for LocalWalker {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_BUFFER_SIZE)
    }
}

#[async_trait::async_trait]
impl TreeWalker for LocalWalker {
    #[instrument(skip(self, cancel, entries_out, err_in), fields(fs_name = %fs_name))]
    async fn walk(
        &self,
        cancel: &CancellationToken,
        fs_name: &FsName,
        root: &str,
        entries_out: mpsc::Sender<SnapshotEntry>,
        err_in: oneshot::Receiver<IngestOutcome>,
    ) -> anyhow::Result<u64> {
        let mut emitter = EntryEmitter::new(cancel, entries_out, err_in);
        match self.traverse(&mut emitter, fs_name, Path::new(root)).await {
            Ok(()) => Ok(emitter.finish().await?),
            Err(e) => Err(emitter.abort(e).await.into()),
        }
    }
}

/// Children of `dir` as `(name, path)`, sorted by name
async fn sorted_children(dir: &Path) -> Result<Vec<(String, PathBuf)>, SyncError> {
    let mut reader = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| SyncError::from_io(dir, e))?;

    let mut children = Vec::new();
    while let Some(child) = reader
        .next_entry()
        .await
        .map_err(|e| SyncError::from_io(dir, e))?
    {
        match child.file_name().into_string() {
            Ok(name) => children.push((name, child.path())),
            Err(raw) => warn!(dir = %dir.display(), name = ?raw, "Skipping non UTF-8 name"),
        }
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(children)
}

async fn hash_file(
    cancel: &CancellationToken,
    path: &Path,
    scratch: &mut [u8],
) -> Result<String, SyncError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SyncError::from_io(path, e))?;
    let mut hasher = Sha256::new();

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let n = file.read(scratch).await?;
        if n == 0 {
            break;
        }
        hasher.update(&scratch[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// `(created, modified)`; created falls back to modified where unsupported
fn timestamps(meta: &std::fs::Metadata) -> (DateTime<Utc>, DateTime<Utc>) {
    let modified = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_default();
    let created = meta
        .created()
        .map(DateTime::<Utc>::from)
        .unwrap_or(modified);
    (created, modified)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::super::testing::collecting_consumer;
    use super::*;

    /// root/{a.txt, sub/{b.txt, deeper/}, link -> a.txt}
    fn sample_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"").unwrap();
        std::os::unix::fs::symlink(dir.path().join("a.txt"), dir.path().join("link")).unwrap();
        dir
    }

    async fn walk_all(dir: &Path, buffer: usize) -> (u64, Vec<SnapshotEntry>) {
        let cancel = CancellationToken::new();
        let fs_name = FsName::new("local").unwrap();
        let (entries_tx, report_rx, handle) = collecting_consumer(2);

        let count = LocalWalker::new(buffer)
            .walk(
                &cancel,
                &fs_name,
                dir.to_str().unwrap(),
                entries_tx,
                report_rx,
            )
            .await
            .unwrap();
        (count, handle.await.unwrap())
    }

    #[tokio::test]
    async fn test_walk_emits_tree_in_order() {
        let dir = sample_dir();
        let (count, entries) = walk_all(dir.path(), 3).await;

        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/a.txt", "/sub", "/sub/b.txt", "/sub/deeper"]);
        assert_eq!(count, 5);

        let root = &entries[0];
        assert!(root.is_folder);
        assert!(root.parent_entry_id.is_none());

        let sub = &entries[2];
        let b = &entries[3];
        assert_eq!(b.parent_entry_id.as_ref(), Some(&sub.entry_id));
        assert_eq!(sub.parent_entry_id.as_ref(), Some(&root.entry_id));
    }

    #[tokio::test]
    async fn test_walk_hashes_files_with_sha256() {
        let dir = sample_dir();
        // A buffer smaller than the file exercises the read loop.
        let (_, entries) = walk_all(dir.path(), 2).await;

        let a = entries.iter().find(|e| e.name == "a.txt").unwrap();
        assert_eq!(
            a.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(a.size, 5);

        let b = entries.iter().find(|e| e.name == "b.txt").unwrap();
        assert_eq!(
            b.hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        assert!(entries.iter().filter(|e| e.is_folder).all(|e| e.hash.is_empty()));
    }

    #[tokio::test]
    async fn test_walk_ids_are_inodes_and_stable() {
        let dir = sample_dir();
        let (_, first) = walk_all(dir.path(), 64).await;
        let (_, second) = walk_all(dir.path(), 64).await;
        assert_eq!(first, second);

        let ino = std::fs::metadata(dir.path().join("a.txt")).unwrap().ino();
        let a = first.iter().find(|e| e.name == "a.txt").unwrap();
        assert_eq!(a.entry_id, EntryId::from_inode(ino));
    }

    #[tokio::test]
    async fn test_walk_reports_hard_linked_file_once() {
        let dir = sample_dir();
        std::fs::hard_link(dir.path().join("a.txt"), dir.path().join("sub/again.txt")).unwrap();

        let (count, entries) = walk_all(dir.path(), 64).await;

        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/a.txt", "/sub", "/sub/b.txt", "/sub/deeper"]);
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_walk_missing_root_fails_and_closes_channel() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let cancel = CancellationToken::new();
        let fs_name = FsName::new("local").unwrap();
        let (entries_tx, report_rx, handle) = collecting_consumer(2);

        let err = LocalWalker::default()
            .walk(&cancel, &fs_name, missing.to_str().unwrap(), entries_tx, report_rx)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::PathNotFound(_))
        ));
        assert!(handle.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_walk_cancelled_returns_promptly() {
        let dir = sample_dir();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let fs_name = FsName::new("local").unwrap();
        let (entries_tx, report_rx, handle) = collecting_consumer(2);

        let err = LocalWalker::default()
            .walk(&cancel, &fs_name, dir.path().to_str().unwrap(), entries_tx, report_rx)
            .await
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Cancelled)));
        assert!(handle.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_walk_surfaces_consumer_failure() {
        let dir = sample_dir();
        let cancel = CancellationToken::new();
        let fs_name = FsName::new("local").unwrap();
        let (entries_tx, mut entries_rx) = mpsc::channel(1);
        let (report_tx, report_rx) = oneshot::channel();

        tokio::spawn(async move {
            let _ = entries_rx.recv().await;
            drop(entries_rx);
            let _ = report_tx.send(Err(anyhow::anyhow!("insert rejected")));
        });

        let err = LocalWalker::default()
            .walk(&cancel, &fs_name, dir.path().to_str().unwrap(), entries_tx, report_rx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("insert rejected"));
    }
}
