//! Remote tree walker
//!
//! Fetches the whole tree with one recursive listing, then expands it with
//! an explicit stack. Items the remote marks as deleted are skipped along
//! with everything below them.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use treesync_core::domain::entry::join_path;
use treesync_core::domain::{EntryId, FsName, SnapshotEntry};
use treesync_core::ports::{
    FolderRef, IngestOutcome, ListOptions, RemoteItem, RemoteLister, TreeWalker,
};

use super::EntryEmitter;
use crate::SyncError;

/// Walks a remote folder through a [`RemoteLister`]
pub struct RemoteWalker {
    lister: Arc<dyn RemoteLister>,
}

impl RemoteWalker {
    pub fn new(lister: Arc<dyn RemoteLister>) -> Self {
        Self { lister }
    }

    async fn traverse(
        &self,
        emitter: &mut EntryEmitter<'_>,
        fs_name: &FsName,
        root: &str,
    ) -> Result<(), SyncError> {
        let tree = self
            .lister
            .list_folder(&FolderRef::Path(root.to_string()), ListOptions::recursive_tree())
            .await
            .map_err(|e| SyncError::Listing(format!("{e:#}")))?;

        if !tree.is_folder {
            return Err(SyncError::InvalidPath(format!("{root} is not a folder")));
        }

        let root_id = EntryId::remote_folder(tree.id);
        emitter
            .emit(
                SnapshotEntry::folder(fs_name.clone(), root_id, None, "/")
                    .with_name(tree.name.clone())
                    .with_times(tree.created, tree.modified),
            )
            .await?;

        let mut emitted_folders: HashSet<u64> = HashSet::from([tree.id]);
        let mut stack: Vec<(&RemoteItem, u64, String)> = tree
            .contents
            .iter()
            .rev()
            .map(|child| (child, tree.id, "/".to_string()))
            .collect();

        while let Some((item, structural_parent, parent_path)) = stack.pop() {
            if emitter.cancel().is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let path = join_path(&parent_path, &item.name);
            if item.is_deleted {
                debug!(path = %path, "Skipping deleted remote item");
                continue;
            }

            let parent = item.parent_folder_id.unwrap_or(structural_parent);
            if !emitted_folders.contains(&parent) {
                return Err(SyncError::OrphanEntry {
                    entry_id: item_id(item).to_string(),
                    path,
                });
            }
            let parent_id = Some(EntryId::remote_folder(parent));

            let mut entry = if item.is_folder {
                SnapshotEntry::folder(fs_name.clone(), item_id(item), parent_id, path.clone())
            } else {
                SnapshotEntry::file(
                    fs_name.clone(),
                    item_id(item),
                    parent_id,
                    path.clone(),
                    item.size,
                    item.hash.to_string(),
                )
            };
            entry.name = item.name.clone();
            entry.deleted_entry_id = item.deleted_file_id.map(EntryId::remote_file);
            emitter
                .emit(entry.with_times(item.created, item.modified))
                .await?;

            if item.is_folder {
                emitted_folders.insert(item.id);
                stack.extend(
                    item.contents
                        .iter()
                        .rev()
                        .map(|child| (child, item.id, path.clone())),
                );
            }
        }

        Ok(())
    }
}

fn item_id(item: &RemoteItem) -> EntryId {
    if item.is_folder {
        EntryId::remote_folder(item.id)
    } else {
        EntryId::remote_file(item.id)
    }
}

#[async_trait::async_trait]
impl TreeWalker for RemoteWalker {
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
        match self.traverse(&mut emitter, fs_name, root).await {
            Ok(()) => Ok(emitter.finish().await?),
            Err(e) => Err(emitter.abort(e).await.into()),
        }
    }
}
