//! One-way mutation replay
//!
//! [`OneWayApplier::apply`] takes the mutation list produced by the diff
//! engine and reproduces it on a [`SyncDestination`], reading file content
//! from a [`SyncSource`].
//!
//! ## Application order
//!
//! 1. Created folders and moves, shallowest new path first (moves before
//!    creations at the same depth). Each folder move is remembered so later
//!    source paths under its old location are rebased onto the new one.
//! 2. Created files, then modified files (full re-transfer).
//! 3. Deletions, deepest path first. A deletion whose path is now taken by
//!    a created, moved or modified entry of the same kind is skipped: the
//!    entry was replaced in place. When a file becomes a folder (or the
//!    reverse) the old entry and anything below it are removed just before
//!    the new one is put there.
//!
//! A run that failed part way can be replayed with the same mutations: a
//! move whose source is gone and whose target already holds the entry, or a
//! removal whose path is already empty, counts as done.
//!
//! Every mutation is checked before the first destination call.
//!
//! ## Streamed transfers
//!
//! A transfer runs the destination writer on the caller's task and a relay
//! task that forwards source chunks to it. The relay watches the source's
//! completion report; on failure it cancels the transfer's child token
//! before closing the writer's channel, so the writer discards the
//! partial file instead of committing it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use treesync_core::domain::entry::path_depth;
use treesync_core::domain::{Mutation, MutationKind, SnapshotEntry};
use treesync_core::ports::{FileStream, PathKind, SyncDestination, SyncSource};

use crate::SyncError;

/// Chunks buffered between the relay and the destination writer
const RELAY_CHANNEL_CAPACITY: usize = 4;

/// Counts of what an apply run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub dirs_created: usize,
    pub files_transferred: usize,
    pub moved: usize,
    pub deleted: usize,
    /// Deletions skipped because their path was reused
    pub skipped: usize,
    /// Moves and removals a previous, interrupted run had already done
    pub already_applied: usize,
}

/// Replays mutations from a source onto a destination
pub struct OneWayApplier {
    source: Arc<dyn SyncSource>,
    destination: Arc<dyn SyncDestination>,
}

/// Folder moves applied so far, as (old path, new path)
#[derive(Debug, Default)]
struct MoveLog {
    moves: Vec<(String, String)>,
}

impl MoveLog {
    fn record(&mut self, from: &str, to: &str) {
        self.moves.push((from.to_string(), to.to_string()));
    }

    /// Current location of something that lived at `path` before the run
    ///
    /// The longest recorded old path wins, so a folder moved inside a
    /// moved folder is followed to its own destination.
    fn rebase(&self, path: &str) -> String {
        self.moves
            .iter()
            .filter(|(from, _)| is_within(path, from))
            .max_by_key(|(from, _)| from.len())
            .map(|(from, to)| format!("{to}{}", &path[from.len()..]))
            .unwrap_or_else(|| path.to_string())
    }
}

/// Whether `path` is `ancestor` or lies below it
fn is_within(path: &str, ancestor: &str) -> bool {
    match path.strip_prefix(ancestor) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || ancestor == "/",
        None => false,
    }
}

/// Deleted entries not yet removed from the destination
struct PendingRemovals<'a> {
    entries: Vec<&'a SnapshotEntry>,
    done: Vec<bool>,
}

impl<'a> PendingRemovals<'a> {
    fn new(mutations: &'a [Mutation]) -> Self {
        let entries: Vec<&SnapshotEntry> = mutations
            .iter()
            .filter(|m| m.kind == MutationKind::Deleted)
            .map(|m| &m.entries[0])
            .collect();
        let done = vec![false; entries.len()];
        Self { entries, done }
    }

    fn entry(&self, index: usize) -> &'a SnapshotEntry {
        self.entries[index]
    }

    fn finish(&mut self, index: usize) {
        self.done[index] = true;
    }

    /// Whether an outstanding deletion of the other kind sits at `path`
    fn blocks(&self, moves: &MoveLog, path: &str, kind: PathKind) -> bool {
        self.entries.iter().zip(&self.done).any(|(entry, done)| {
            !done && PathKind::of(entry) != kind && moves.rebase(&entry.path) == path
        })
    }

    /// Outstanding deletions at or below `root`, by current path, deepest first
    fn within(&self, moves: &MoveLog, root: &str) -> Vec<(usize, String)> {
        let mut found: Vec<(usize, String)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(index, _)| !self.done[*index])
            .map(|(index, entry)| (index, moves.rebase(&entry.path)))
            .filter(|(_, path)| is_within(path, root))
            .collect();
        found.sort_by(|a, b| {
            path_depth(&b.1)
                .cmp(&path_depth(&a.1))
                .then_with(|| b.1.cmp(&a.1))
        });
        found
    }
}

fn destination_error(operation: &'static str, path: &str, e: anyhow::Error) -> SyncError {
    match e.downcast::<SyncError>() {
        Ok(SyncError::Cancelled) => SyncError::Cancelled,
        Ok(other) => SyncError::Destination {
            operation,
            path: path.to_string(),
            message: other.to_string(),
        },
        Err(e) => SyncError::Destination {
            operation,
            path: path.to_string(),
            message: format!("{e:#}"),
        },
    }
}

/// Checks record counts and content-transfer targets up front
fn validate(mutations: &[Mutation]) -> Result<(), SyncError> {
    for mutation in mutations {
        mutation.validate()?;
        if mutation.kind == MutationKind::Modified {
            if let Some(folder) = mutation.entries.iter().find(|e| e.is_folder) {
                return Err(SyncError::ModifiedFolder {
                    entry_id: folder.entry_id.to_string(),
                    path: folder.path.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Forwards source chunks to the writer until the source reports
async fn relay_chunks(
    cancel: CancellationToken,
    path: String,
    mut chunks: mpsc::Receiver<Vec<u8>>,
    mut done: oneshot::Receiver<anyhow::Result<()>>,
    out: mpsc::Sender<Vec<u8>>,
) -> Result<(), SyncError> {
    let source_failed = |message: String| SyncError::Source {
        path: path.clone(),
        message,
    };
    let mut reported_ok = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            report = &mut done, if !reported_ok => match report {
                Ok(Ok(())) => reported_ok = true,
                Ok(Err(e)) => {
                    cancel.cancel();
                    return Err(source_failed(format!("{e:#}")));
                }
                Err(_) => {
                    cancel.cancel();
                    return Err(source_failed("source stopped without reporting".into()));
                }
            },
            chunk = chunks.recv() => match chunk {
                Some(bytes) => {
                    if out.send(bytes).await.is_err() {
                        // Writer gave up; its own error is reported.
                        cancel.cancel();
                        return Ok(());
                    }
                }
                None => break,
            },
        }
    }

    if !reported_ok {
        let report = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            report = done => report,
        };
        match report {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                cancel.cancel();
                return Err(source_failed(format!("{e:#}")));
            }
            Err(_) => {
                cancel.cancel();
                return Err(source_failed("source stopped without reporting".into()));
            }
        }
    }

    drop(out);
    Ok(())
}

impl OneWayApplier {
    pub fn new(source: Arc<dyn SyncSource>, destination: Arc<dyn SyncDestination>) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Reproduces `mutations` on the destination
    ///
    /// # Errors
    /// Invalid mutations fail before anything is touched. Afterwards the
    /// first failing step aborts the run; steps already applied stay applied.
    #[instrument(skip(self, cancel, mutations), fields(mutations = mutations.len()))]
    pub async fn apply(
        &self,
        cancel: &CancellationToken,
        mutations: &[Mutation],
    ) -> anyhow::Result<ApplyReport> {
        validate(mutations)?;

        let mut report = ApplyReport::default();
        let mut moves = MoveLog::default();
        let mut pending = PendingRemovals::new(mutations);

        // Phase 1: structure.
        let mut structural: Vec<&Mutation> = mutations
            .iter()
            .filter(|m| match m.kind {
                MutationKind::Created => m.entries[0].is_folder,
                MutationKind::Moved => true,
                _ => false,
            })
            .collect();
        structural.sort_by_key(|m| {
            let target = &m.entries[m.entries.len() - 1];
            (target.depth(), m.kind != MutationKind::Moved, target.path.clone())
        });

        for mutation in structural {
            Self::check_cancelled(cancel)?;
            match mutation.kind {
                MutationKind::Moved => {
                    let (previous, new) = (&mutation.entries[0], &mutation.entries[1]);
                    let from = moves.rebase(&previous.path);
                    if from != new.path {
                        self.clear_conflict(&mut pending, &moves, new, &mut report)
                            .await?;
                        if self.move_entry(new, &from).await? {
                            report.moved += 1;
                        } else {
                            report.already_applied += 1;
                        }
                    }
                    if new.is_folder {
                        moves.record(&previous.path, &new.path);
                    }
                }
                _ => {
                    let folder = &mutation.entries[0];
                    self.clear_conflict(&mut pending, &moves, folder, &mut report)
                        .await?;
                    self.destination
                        .mk_dir(&folder.path)
                        .await
                        .map_err(|e| destination_error("mk_dir", &folder.path, e))?;
                    report.dirs_created += 1;
                }
            }
        }

        // Phase 2: content.
        let transfers = mutations
            .iter()
            .filter(|m| m.kind == MutationKind::Created && !m.entries[0].is_folder)
            .chain(mutations.iter().filter(|m| m.kind == MutationKind::Modified));
        for mutation in transfers {
            Self::check_cancelled(cancel)?;
            let target = &mutation.entries[mutation.entries.len() - 1];
            self.clear_conflict(&mut pending, &moves, target, &mut report)
                .await?;
            self.transfer(cancel, target).await?;
            report.files_transferred += 1;
        }

        // Phase 3: removal.
        let occupied: HashMap<&str, PathKind> = mutations
            .iter()
            .filter(|m| m.kind != MutationKind::Deleted)
            .map(|m| {
                let target = &m.entries[m.entries.len() - 1];
                (target.path.as_str(), PathKind::of(target))
            })
            .collect();

        for (index, path) in pending.within(&moves, "/") {
            Self::check_cancelled(cancel)?;
            let entry = pending.entry(index);
            if occupied.get(path.as_str()) == Some(&PathKind::of(entry)) {
                debug!(
                    path = %path,
                    entry_id = %entry.entry_id,
                    "Skipping deletion of replaced entry"
                );
                report.skipped += 1;
                continue;
            }
            self.remove_pending(&mut pending, index, &path, &mut report)
                .await?;
        }

        info!(
            dirs_created = report.dirs_created,
            files_transferred = report.files_transferred,
            moved = report.moved,
            deleted = report.deleted,
            skipped = report.skipped,
            already_applied = report.already_applied,
            "Mutations applied"
        );
        Ok(report)
    }

    fn check_cancelled(cancel: &CancellationToken) -> Result<(), SyncError> {
        if cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Moves `from` to where `new` lives now
    ///
    /// Returns `false` when a replayed run finds the move already done:
    /// nothing left at `from` and an entry of the right kind at the target.
    async fn move_entry(&self, new: &SnapshotEntry, from: &str) -> Result<bool, SyncError> {
        let (operation, moved) = if new.is_folder {
            ("mv_dir", self.destination.mv_dir(from, &new.path).await)
        } else {
            ("mv_file", self.destination.mv_file(from, &new.path).await)
        };
        let Err(e) = moved else {
            return Ok(true);
        };

        let source_left = self.destination.lookup(from).await;
        let target_now = self.destination.lookup(&new.path).await;
        match (source_left, target_now) {
            (Ok(None), Ok(Some(kind))) if kind == PathKind::of(new) => {
                debug!(from, to = %new.path, "Move already applied");
                Ok(false)
            }
            _ => Err(destination_error(operation, from, e)),
        }
    }

    /// Removes one outstanding deletion at its current `path`
    ///
    /// A path that no longer holds an entry of the deleted kind counts as
    /// removed, so replaying a partly applied run converges.
    async fn remove_pending(
        &self,
        pending: &mut PendingRemovals<'_>,
        index: usize,
        path: &str,
        report: &mut ApplyReport,
    ) -> Result<(), SyncError> {
        let entry = pending.entry(index);
        let (operation, removed) = if entry.is_folder {
            ("rm_dir", self.destination.rm_dir(path).await)
        } else {
            ("rm_file", self.destination.rm_file(path).await)
        };

        match removed {
            Ok(()) => report.deleted += 1,
            Err(e) => match self.destination.lookup(path).await {
                Ok(found) if found != Some(PathKind::of(entry)) => {
                    debug!(path, entry_id = %entry.entry_id, "Already removed");
                    report.already_applied += 1;
                }
                _ => return Err(destination_error(operation, path, e)),
            },
        }
        pending.finish(index);
        Ok(())
    }

    /// Removes a deleted entry of the other kind that still holds
    /// `target`'s path, children first
    async fn clear_conflict(
        &self,
        pending: &mut PendingRemovals<'_>,
        moves: &MoveLog,
        target: &SnapshotEntry,
        report: &mut ApplyReport,
    ) -> Result<(), SyncError> {
        if !pending.blocks(moves, &target.path, PathKind::of(target)) {
            return Ok(());
        }
        debug!(path = %target.path, "Removing entry of the other kind first");
        for (index, path) in pending.within(moves, &target.path) {
            self.remove_pending(pending, index, &path, report).await?;
        }
        Ok(())
    }

    /// Streams `entry` from the source into the destination at its path
    async fn transfer(
        &self,
        cancel: &CancellationToken,
        entry: &SnapshotEntry,
    ) -> Result<(), SyncError> {
        let child = cancel.child_token();
        let FileStream { chunks, done } = self.source.stream_file(&child, entry);
        let (relay_tx, relay_rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);

        let relay = tokio::spawn(relay_chunks(
            child.clone(),
            entry.path.clone(),
            chunks,
            done,
            relay_tx,
        ));

        let written = self.destination.mk_file(&child, &entry.path, relay_rx).await;
        let relayed = relay.await.map_err(|e| SyncError::Source {
            path: entry.path.clone(),
            message: format!("relay task failed: {e}"),
        })?;

        // The source's failure explains a cancelled write.
        relayed?;
        written.map_err(|e| destination_error("mk_file", &entry.path, e))?;

        debug!(path = %entry.path, "File transferred");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use tempfile::TempDir;
    use treesync_core::domain::{EntryId, FsName};

    use super::*;
    use crate::LocalFileSystem;

    // ------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------

    /// Destination that records every call
    ///
    /// Moves and removals of a path listed in `failing` are recorded and
    /// then fail; `lookup` answers from `present`.
    #[derive(Default)]
    struct RecordingDestination {
        calls: Mutex<Vec<String>>,
        failing: HashSet<String>,
        present: HashMap<String, PathKind>,
    }

    impl RecordingDestination {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn outcome(&self, path: &str) -> anyhow::Result<()> {
            if self.failing.contains(path) {
                Err(SyncError::PathNotFound(path.into()).into())
            } else {
                Ok(())
            }
        }
    }

    #[async_trait::async_trait]
    impl SyncDestination for RecordingDestination {
        async fn mk_dir(&self, path: &str) -> anyhow::Result<()> {
            self.push(format!("mk_dir {path}"));
            Ok(())
        }

        async fn mk_file(
            &self,
            _cancel: &CancellationToken,
            path: &str,
            mut chunks: mpsc::Receiver<Vec<u8>>,
        ) -> anyhow::Result<()> {
            let mut content = Vec::new();
            while let Some(chunk) = chunks.recv().await {
                content.extend(chunk);
            }
            self.push(format!(
                "mk_file {path} {}",
                String::from_utf8_lossy(&content)
            ));
            Ok(())
        }

        async fn rm_dir(&self, path: &str) -> anyhow::Result<()> {
            self.push(format!("rm_dir {path}"));
            self.outcome(path)
        }

        async fn rm_file(&self, path: &str) -> anyhow::Result<()> {
            self.push(format!("rm_file {path}"));
            self.outcome(path)
        }

        async fn mv_dir(&self, from: &str, to: &str) -> anyhow::Result<()> {
            self.push(format!("mv_dir {from} {to}"));
            self.outcome(from)
        }

        async fn mv_file(&self, from: &str, to: &str) -> anyhow::Result<()> {
            self.push(format!("mv_file {from} {to}"));
            self.outcome(from)
        }

        async fn lookup(&self, path: &str) -> anyhow::Result<Option<PathKind>> {
            Ok(self.present.get(path).copied())
        }
    }

    /// Source serving fixed content, or failing after a first chunk
    #[derive(Default)]
    struct FakeSource {
        content: HashMap<String, Vec<u8>>,
        failing: bool,
    }

    impl SyncSource for FakeSource {
        fn stream_file(&self, _cancel: &CancellationToken, entry: &SnapshotEntry) -> FileStream {
            let (chunks_tx, chunks_rx) = mpsc::channel(4);
            let (done_tx, done_rx) = oneshot::channel();
            let data = self.content.get(&entry.path).cloned().unwrap_or_default();
            let failing = self.failing;

            tokio::spawn(async move {
                if failing {
                    let _ = chunks_tx.send(b"partial".to_vec()).await;
                    let _ = done_tx.send(Err(anyhow::anyhow!("read interrupted")));
                    return;
                }
                for piece in data.chunks(2) {
                    let _ = chunks_tx.send(piece.to_vec()).await;
                }
                drop(chunks_tx);
                let _ = done_tx.send(Ok(()));
            });

            FileStream {
                chunks: chunks_rx,
                done: done_rx,
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn fs() -> FsName {
        FsName::new("local").unwrap()
    }

    fn folder(id: u64, path: &str) -> SnapshotEntry {
        SnapshotEntry::folder(fs(), EntryId::from_inode(id), None, path)
    }

    fn file(id: u64, path: &str, hash: &str) -> SnapshotEntry {
        SnapshotEntry::file(fs(), EntryId::from_inode(id), None, path, 1, hash)
    }

    fn applier(
        source: FakeSource,
    ) -> (OneWayApplier, Arc<RecordingDestination>) {
        let destination = Arc::new(RecordingDestination::default());
        (
            OneWayApplier::new(Arc::new(source), destination.clone()),
            destination,
        )
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_bad_cardinality_fails_before_any_call() {
        let (applier, destination) = applier(FakeSource::default());
        let mutations = vec![
            Mutation::created(folder(1, "/A")),
            Mutation {
                kind: MutationKind::Moved,
                entries: vec![file(2, "/b", "h")],
            },
        ];

        let err = applier
            .apply(&CancellationToken::new(), &mutations)
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("Moved"), "{message}");
        assert!(message.contains("expects 2"), "{message}");
        assert!(message.contains("got 1"), "{message}");
        assert!(destination.calls().is_empty());
    }

    #[tokio::test]
    async fn test_modified_folder_is_fatal() {
        let (applier, destination) = applier(FakeSource::default());
        let mutations = vec![Mutation::modified(folder(7, "/F"), folder(7, "/F"))];

        let err = applier
            .apply(&CancellationToken::new(), &mutations)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::ModifiedFolder { entry_id, path }) if entry_id == "7" && path == "/F"
        ));
        assert!(destination.calls().is_empty());
    }

    // ------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_creations_then_transfers_then_deletions() {
        let source = FakeSource {
            content: HashMap::from([
                ("/A/f.txt".to_string(), b"abc".to_vec()),
                ("/g.txt".to_string(), b"new".to_vec()),
            ]),
            ..FakeSource::default()
        };
        let (applier, destination) = applier(source);
        let mutations = vec![
            Mutation::deleted(file(9, "/old.txt", "x")),
            Mutation::modified(file(3, "/g.txt", "1"), file(3, "/g.txt", "2")),
            Mutation::created(file(2, "/A/f.txt", "h")),
            Mutation::created(folder(1, "/A")),
        ];

        let report = applier
            .apply(&CancellationToken::new(), &mutations)
            .await
            .unwrap();

        assert_eq!(
            destination.calls(),
            vec![
                "mk_dir /A",
                "mk_file /A/f.txt abc",
                "mk_file /g.txt new",
                "rm_file /old.txt",
            ]
        );
        assert_eq!(report.dirs_created, 1);
        assert_eq!(report.files_transferred, 2);
        assert_eq!(report.deleted, 1);
    }

    #[tokio::test]
    async fn test_deletions_deepest_first() {
        let (applier, destination) = applier(FakeSource::default());
        let mutations = vec![
            Mutation::deleted(folder(1, "/A")),
            Mutation::deleted(folder(2, "/A/B")),
            Mutation::deleted(file(3, "/A/B/c.txt", "h")),
            Mutation::deleted(file(4, "/A/d.txt", "h")),
        ];

        applier
            .apply(&CancellationToken::new(), &mutations)
            .await
            .unwrap();

        assert_eq!(
            destination.calls(),
            vec![
                "rm_file /A/B/c.txt",
                "rm_file /A/d.txt",
                "rm_dir /A/B",
                "rm_dir /A",
            ]
        );
    }

    #[tokio::test]
    async fn test_moves_rebase_later_paths() {
        let (applier, destination) = applier(FakeSource::default());
        let mutations = vec![
            // Folder renamed, one child moved out of it, another deleted.
            Mutation::moved(folder(1, "/Old"), folder(1, "/New")),
            Mutation::moved(file(2, "/Old/a.txt", "h"), file(2, "/a.txt", "h")),
            Mutation::deleted(file(3, "/Old/b.txt", "h")),
        ];

        let report = applier
            .apply(&CancellationToken::new(), &mutations)
            .await
            .unwrap();

        assert_eq!(
            destination.calls(),
            vec![
                "mv_dir /Old /New",
                "mv_file /New/a.txt /a.txt",
                "rm_file /New/b.txt",
            ]
        );
        assert_eq!(report.moved, 2);
    }

    #[tokio::test]
    async fn test_replaced_entry_deletion_skipped() {
        let source = FakeSource {
            content: HashMap::from([("/doc.txt".to_string(), b"v2".to_vec())]),
            ..FakeSource::default()
        };
        let (applier, destination) = applier(source);
        let mutations = vec![
            Mutation::deleted(file(1, "/doc.txt", "v1")),
            Mutation::created(file(2, "/doc.txt", "v2")),
        ];

        let report = applier
            .apply(&CancellationToken::new(), &mutations)
            .await
            .unwrap();

        assert_eq!(destination.calls(), vec!["mk_file /doc.txt v2"]);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_file_replaced_by_folder_is_removed_first() {
        let source = FakeSource {
            content: HashMap::from([("/x/in.txt".to_string(), b"in".to_vec())]),
            ..FakeSource::default()
        };
        let (applier, destination) = applier(source);
        let mutations = vec![
            Mutation::created(file(3, "/x/in.txt", "h")),
            Mutation::created(folder(2, "/x")),
            Mutation::deleted(file(1, "/x", "h")),
        ];

        let report = applier
            .apply(&CancellationToken::new(), &mutations)
            .await
            .unwrap();

        assert_eq!(
            destination.calls(),
            vec!["rm_file /x", "mk_dir /x", "mk_file /x/in.txt in"]
        );
        assert_eq!(report.deleted, 1);
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn test_folder_replaced_by_file_removes_subtree_first() {
        let source = FakeSource {
            content: HashMap::from([("/x".to_string(), b"flat".to_vec())]),
            ..FakeSource::default()
        };
        let (applier, destination) = applier(source);
        let mutations = vec![
            Mutation::deleted(file(9, "/other.txt", "h")),
            Mutation::deleted(folder(1, "/x")),
            Mutation::deleted(folder(2, "/x/y")),
            Mutation::deleted(file(3, "/x/y/z.txt", "h")),
            Mutation::deleted(file(4, "/x/a.txt", "h")),
            Mutation::created(file(5, "/x", "h")),
        ];

        let report = applier
            .apply(&CancellationToken::new(), &mutations)
            .await
            .unwrap();

        assert_eq!(
            destination.calls(),
            vec![
                "rm_file /x/y/z.txt",
                "rm_dir /x/y",
                "rm_file /x/a.txt",
                "rm_dir /x",
                "mk_file /x flat",
                "rm_file /other.txt",
            ]
        );
        assert_eq!(report.deleted, 5);
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn test_move_and_modify_moves_before_transfer() {
        let source = FakeSource {
            content: HashMap::from([("/B/f.txt".to_string(), b"edited".to_vec())]),
            ..FakeSource::default()
        };
        let (applier, destination) = applier(source);
        let mutations = vec![
            Mutation::modified(file(5, "/A/f.txt", "1"), file(5, "/B/f.txt", "2")),
            Mutation::moved(file(5, "/A/f.txt", "1"), file(5, "/B/f.txt", "2")),
        ];

        applier
            .apply(&CancellationToken::new(), &mutations)
            .await
            .unwrap();

        assert_eq!(
            destination.calls(),
            vec!["mv_file /A/f.txt /B/f.txt", "mk_file /B/f.txt edited"]
        );
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_replayed_moves_and_removals_count_as_done() {
        let destination = Arc::new(RecordingDestination {
            failing: ["/Old", "/New/c", "/a.txt", "/old.txt"]
                .into_iter()
                .map(String::from)
                .collect(),
            present: HashMap::from([
                ("/New".to_string(), PathKind::Folder),
                ("/b.txt".to_string(), PathKind::File),
                ("/c".to_string(), PathKind::File),
            ]),
            ..RecordingDestination::default()
        });
        let applier = OneWayApplier::new(Arc::new(FakeSource::default()), destination.clone());
        let mutations = vec![
            Mutation::moved(folder(1, "/Old"), folder(1, "/New")),
            Mutation::moved(file(2, "/Old/c", "h"), file(2, "/c", "h")),
            Mutation::moved(file(3, "/a.txt", "h"), file(3, "/b.txt", "h")),
            Mutation::deleted(file(4, "/old.txt", "h")),
        ];

        let report = applier
            .apply(&CancellationToken::new(), &mutations)
            .await
            .unwrap();

        assert_eq!(
            destination.calls(),
            vec![
                "mv_dir /Old /New",
                "mv_file /a.txt /b.txt",
                "mv_file /New/c /c",
                "rm_file /old.txt",
            ]
        );
        assert_eq!(report.already_applied, 4);
        assert_eq!(report.moved, 0);
        assert_eq!(report.deleted, 0);
    }

    #[tokio::test]
    async fn test_failed_move_with_source_still_present_is_fatal() {
        let destination = Arc::new(RecordingDestination {
            failing: HashSet::from(["/a.txt".to_string()]),
            present: HashMap::from([("/a.txt".to_string(), PathKind::File)]),
            ..RecordingDestination::default()
        });
        let applier = OneWayApplier::new(Arc::new(FakeSource::default()), destination);
        let mutations = vec![Mutation::moved(
            file(3, "/a.txt", "h"),
            file(3, "/b.txt", "h"),
        )];

        let err = applier
            .apply(&CancellationToken::new(), &mutations)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Destination { operation: "mv_file", path, .. }) if path == "/a.txt"
        ));
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_failing_source_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let destination = Arc::new(LocalFileSystem::new(dir.path()));
        let source = FakeSource {
            failing: true,
            ..FakeSource::default()
        };
        let applier = OneWayApplier::new(Arc::new(source), destination);

        let mutations = vec![Mutation::created(file(1, "/broken.bin", "h"))];
        let err = applier
            .apply(&CancellationToken::new(), &mutations)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("read interrupted"), "{err}");
        assert!(!dir.path().join("broken.bin").exists());
        assert!(!dir.path().join(".broken.bin.treesync-tmp").exists());
    }

    #[tokio::test]
    async fn test_cancelled_apply_stops() {
        let (applier, destination) = applier(FakeSource::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = applier
            .apply(&cancel, &[Mutation::created(folder(1, "/A"))])
            .await
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Cancelled)));
        assert!(destination.calls().is_empty());
    }

    #[test]
    fn test_move_log_prefers_longest_match() {
        let mut log = MoveLog::default();
        log.record("/A", "/X");
        log.record("/A/B", "/X/C");

        assert_eq!(log.rebase("/A/B/f"), "/X/C/f");
        assert_eq!(log.rebase("/A/g"), "/X/g");
        assert_eq!(log.rebase("/AB/g"), "/AB/g");
        assert_eq!(log.rebase("/A"), "/X");
    }
}
