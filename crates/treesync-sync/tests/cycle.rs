//! End-to-end refresh → sync cycles between two local directories
//!
//! The source tree is walked with the local walker into an in-memory
//! snapshot store, and every sync replays the diff onto a mirror directory
//! through the local filesystem adapter.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use treesync_cache::{DatabasePool, SqliteSnapshotStore};
use treesync_core::domain::FsName;
use treesync_core::ports::SnapshotStore;
use treesync_sync::{LocalFileSystem, LocalWalker, OneWayApplier, SyncError, Tracker};

// ============================================================================
// Test helpers
// ============================================================================

struct Harness {
    db: DatabasePool,
    source: TempDir,
    mirror: TempDir,
    tracker: Tracker,
    applier: OneWayApplier,
}

impl Harness {
    async fn new() -> Self {
        let db = DatabasePool::in_memory()
            .await
            .expect("Failed to create in-memory database");
        Self::build(db, TempDir::new().unwrap(), TempDir::new().unwrap())
    }

    fn build(db: DatabasePool, source: TempDir, mirror: TempDir) -> Self {
        let store = Arc::new(SqliteSnapshotStore::new(db.pool().clone()));

        let tracker = Tracker::new(
            fs_name(),
            source.path().to_str().unwrap(),
            Arc::new(LocalWalker::new(7)),
            store.clone(),
            store,
        )
        .with_channel_capacity(2);

        let applier = OneWayApplier::new(
            Arc::new(LocalFileSystem::new(source.path()).with_chunk_size(3)),
            Arc::new(LocalFileSystem::new(mirror.path())),
        );

        Self {
            db,
            source,
            mirror,
            tracker,
            applier,
        }
    }

    fn src(&self, rel: &str) -> std::path::PathBuf {
        self.source.path().join(rel)
    }

    /// Runs one refresh and one sync, returning the number of mutations
    async fn cycle(&self) -> usize {
        let cancel = CancellationToken::new();
        self.tracker.refresh(&cancel).await.unwrap();
        self.tracker
            .sync(&cancel, &self.applier)
            .await
            .unwrap()
            .mutations
    }

    fn assert_mirrored(&self) {
        assert_eq!(listing(self.mirror.path()), listing(self.source.path()));
    }
}

fn fs_name() -> FsName {
    FsName::new("local").unwrap()
}

/// Relative path → file content (`None` for directories)
fn listing(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    fn visit(root: &Path, dir: &Path, out: &mut BTreeMap<String, Option<Vec<u8>>>) {
        for child in fs::read_dir(dir).unwrap() {
            let path = child.unwrap().path();
            let rel = path
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .into_owned();
            if path.is_dir() {
                out.insert(rel, None);
                visit(root, &path, out);
            } else {
                out.insert(rel, Some(fs::read(&path).unwrap()));
            }
        }
    }

    let mut out = BTreeMap::new();
    visit(root, root, &mut out);
    out
}

// ============================================================================
// Cycles
// ============================================================================

#[tokio::test]
async fn test_initial_sync_mirrors_tree() {
    let h = Harness::new().await;
    fs::create_dir_all(h.src("sub/deeper")).unwrap();
    fs::create_dir(h.src("empty")).unwrap();
    fs::write(h.src("a.txt"), b"alpha").unwrap();
    fs::write(h.src("sub/b.txt"), b"bravo bravo").unwrap();
    fs::write(h.src("sub/deeper/c.txt"), b"").unwrap();

    // root, a.txt, empty, sub, sub/b.txt, sub/deeper, sub/deeper/c.txt
    assert_eq!(h.cycle().await, 7);
    h.assert_mirrored();

    // Nothing changed: the next cycle has nothing to replay.
    assert_eq!(h.cycle().await, 0);
    h.assert_mirrored();
}

#[tokio::test]
async fn test_edits_moves_and_deletions_are_mirrored() {
    let h = Harness::new().await;
    fs::create_dir_all(h.src("sub/deeper")).unwrap();
    fs::write(h.src("a.txt"), b"alpha").unwrap();
    fs::write(h.src("sub/b.txt"), b"bravo").unwrap();
    fs::write(h.src("sub/deeper/c.txt"), b"charlie").unwrap();
    h.cycle().await;
    h.assert_mirrored();

    // Creations come before the removal so no inode is recycled.
    fs::write(h.src("new.txt"), b"november").unwrap();
    fs::create_dir(h.src("fresh")).unwrap();
    fs::write(h.src("a.txt"), b"alpha, second edition").unwrap();
    fs::rename(h.src("sub"), h.src("renamed")).unwrap();
    fs::rename(h.src("renamed/b.txt"), h.src("fresh/b.txt")).unwrap();
    fs::remove_file(h.src("renamed/deeper/c.txt")).unwrap();

    // Modified a.txt, Moved sub and b.txt, Deleted c.txt, Created fresh and new.txt
    assert_eq!(h.cycle().await, 6);
    h.assert_mirrored();
}

#[tokio::test]
async fn test_emptied_tree_is_mirrored() {
    let h = Harness::new().await;
    fs::create_dir_all(h.src("x/y/z")).unwrap();
    fs::write(h.src("x/y/z/leaf.txt"), b"leaf").unwrap();
    fs::write(h.src("x/top.txt"), b"top").unwrap();
    h.cycle().await;
    h.assert_mirrored();

    fs::remove_dir_all(h.src("x")).unwrap();

    assert_eq!(h.cycle().await, 5);
    h.assert_mirrored();
    assert!(listing(h.mirror.path()).is_empty());
}

#[tokio::test]
async fn test_refresh_twice_before_sync_keeps_full_diff() {
    let h = Harness::new().await;
    fs::write(h.src("one.txt"), b"1").unwrap();
    h.cycle().await;

    let cancel = CancellationToken::new();
    fs::write(h.src("two.txt"), b"2").unwrap();
    h.tracker.refresh(&cancel).await.unwrap();
    fs::write(h.src("three.txt"), b"3").unwrap();
    let second = h.tracker.refresh(&cancel).await.unwrap();
    assert!(!second.rotated);

    let report = h.tracker.sync(&cancel, &h.applier).await.unwrap();
    assert_eq!(report.mutations, 2);
    h.assert_mirrored();
}

#[tokio::test]
async fn test_failed_sync_converges_on_retry() {
    let h = Harness::new().await;
    fs::write(h.src("a.txt"), b"alpha").unwrap();
    h.cycle().await;

    fs::write(h.src("n.txt"), b"november").unwrap();
    fs::rename(h.src("a.txt"), h.src("b.txt")).unwrap();
    let cancel = CancellationToken::new();
    h.tracker.refresh(&cancel).await.unwrap();
    // Gone before its content is copied.
    fs::remove_file(h.src("n.txt")).unwrap();

    let err = h.tracker.sync(&cancel, &h.applier).await.unwrap_err();
    assert!(
        matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Source { .. })),
        "{err:#}"
    );
    // The move landed before the failure.
    assert!(h.mirror.path().join("b.txt").exists());
    assert!(!h.mirror.path().join("a.txt").exists());

    // Moved a.txt is replayed onto a mirror that already has it.
    assert_eq!(h.cycle().await, 1);
    h.assert_mirrored();
}

#[tokio::test]
async fn test_file_replaced_by_folder_is_mirrored() {
    let h = Harness::new().await;
    fs::write(h.src("x"), b"plain file").unwrap();
    fs::write(h.src("keep.txt"), b"keep").unwrap();
    h.cycle().await;
    h.assert_mirrored();

    // Built aside first so the old inode is not recycled.
    fs::create_dir(h.src("x.new")).unwrap();
    fs::write(h.src("x.new/inner.txt"), b"inner").unwrap();
    fs::remove_file(h.src("x")).unwrap();
    fs::rename(h.src("x.new"), h.src("x")).unwrap();

    // Deleted file x, Created folder x, Created x/inner.txt
    assert_eq!(h.cycle().await, 3);
    h.assert_mirrored();
}

#[tokio::test]
async fn test_folder_replaced_by_file_is_mirrored() {
    let h = Harness::new().await;
    fs::create_dir_all(h.src("x/y")).unwrap();
    fs::write(h.src("x/y/z.txt"), b"zulu").unwrap();
    fs::write(h.src("x/a.txt"), b"alpha").unwrap();
    h.cycle().await;
    h.assert_mirrored();

    fs::write(h.src("x.new"), b"now a file").unwrap();
    fs::remove_dir_all(h.src("x")).unwrap();
    fs::rename(h.src("x.new"), h.src("x")).unwrap();

    // Deleted x, x/y, x/y/z.txt and x/a.txt, Created file x
    assert_eq!(h.cycle().await, 5);
    h.assert_mirrored();
}

#[tokio::test]
async fn test_cycle_after_crash_holding_lock_recovers() {
    let state = TempDir::new().unwrap();
    let db_path = state.path().join("treesync.db");
    let db = DatabasePool::new(&db_path).await.unwrap();
    let h = Harness::build(db, TempDir::new().unwrap(), TempDir::new().unwrap());
    fs::write(h.src("a.txt"), b"alpha").unwrap();
    h.cycle().await;

    // The process dies in the middle of a cycle, lock taken.
    fs::write(h.src("b.txt"), b"bravo").unwrap();
    let store = SqliteSnapshotStore::new(h.db.pool().clone());
    assert!(store.try_acquire(&fs_name()).await.unwrap());
    let busy = h
        .tracker
        .refresh(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(busy.downcast_ref::<SyncError>(), Some(SyncError::Busy(_))));

    let Harness {
        db, source, mirror, ..
    } = h;
    db.pool().close().await;

    let db = DatabasePool::new(&db_path).await.unwrap();
    let h = Harness::build(db, source, mirror);
    assert_eq!(h.cycle().await, 1);
    h.assert_mirrored();
}

#[tokio::test]
async fn test_hard_links_mirror_first_path_only() {
    let h = Harness::new().await;
    fs::write(h.src("a.txt"), b"alpha").unwrap();
    fs::hard_link(h.src("a.txt"), h.src("b.txt")).unwrap();

    // root and a.txt
    assert_eq!(h.cycle().await, 2);

    let mirrored: Vec<String> = listing(h.mirror.path()).into_keys().collect();
    assert_eq!(mirrored, vec!["a.txt"]);
}
