//! SQLite implementation of the `SnapshotStore` and `DiffReader` ports
//!
//! ## Type Mapping
//!
//! | Domain Type     | SQL Type | Strategy                                        |
//! |-----------------|----------|-------------------------------------------------|
//! | FsName, EntryId | TEXT     | `.as_str()` / `::new()`                         |
//! | Version         | TEXT     | `'P'` / `'N'` via `as_str()` / `FromStr`        |
//! | MutationKind    | TEXT     | bound into diff queries, decoded via `FromStr`  |
//! | DateTime<Utc>   | TEXT     | RFC 3339, microsecond precision                 |
//! | bool            | INTEGER  | 0 / 1                                           |
//! | u64 size        | INTEGER  | checked `i64` conversion                        |
//!
//! ## Diff
//!
//! Each mutation kind is one fixed query. The kind tag, both version tags
//! and the file-system name are bound as parameters, and Previous / New
//! columns are aliased with `p_` / `n_` prefixes so a single row decoder
//! handles every kind. All four queries run in one transaction so they see
//! the same snapshot pair.
//!
//! An ID that switches between file and folder (a recycled inode) is a
//! different object: it is reported as Deleted plus Created.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use treesync_core::domain::{
    EntryId, FsName, Mutation, MutationKind, SnapshotEntry, TrackingState, Version,
};
use treesync_core::ports::{DiffReader, IngestOutcome, RefreshRecord, SnapshotStore};

use crate::CacheError;

/// Entries committed per ingest transaction
const INGEST_BATCH_SIZE: usize = 256;

/// Persisted entry columns, in decode order
const ENTRY_COLUMNS: [&str; 12] = [
    "fs_name",
    "entry_id",
    "is_folder",
    "is_deleted",
    "deleted_file_id",
    "name",
    "parent_folder_id",
    "path",
    "created",
    "modified",
    "size",
    "hash",
];

/// SQLite-backed two-generation snapshot store
///
/// Cheap to clone; every clone shares the same connection pool.
#[derive(Clone)]
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    /// Creates a new store instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Runs the four classification queries inside `tx`
    async fn classify(
        tx: &mut Transaction<'_, Sqlite>,
        fs_name: &FsName,
    ) -> Result<Vec<Mutation>, CacheError> {
        let mut mutations = Vec::new();

        for kind in MutationKind::ALL {
            let rows = sqlx::query(&diff_query(kind))
                .bind(kind.as_str())
                .bind(Version::Previous.as_str())
                .bind(Version::New.as_str())
                .bind(fs_name.as_str())
                .fetch_all(&mut **tx)
                .await?;

            tracing::trace!(fs_name = %fs_name, kind = %kind, count = rows.len(), "Classified");

            for row in &rows {
                mutations.push(mutation_from_row(row)?);
            }
        }

        Ok(mutations)
    }
}

// ============================================================================
// Conversion helpers
// ============================================================================

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

fn size_to_sql(size: u64) -> Result<i64, CacheError> {
    i64::try_from(size)
        .map_err(|_| CacheError::SerializationError(format!("Size {} does not fit INTEGER", size)))
}

/// Comma-separated `alias.col AS prefixcol` list for the entry columns
fn select_columns(alias: &str, prefix: &str) -> String {
    ENTRY_COLUMNS
        .iter()
        .map(|col| format!("{alias}.{col} AS {prefix}{col}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Query for one mutation kind
///
/// Parameters: `?1` kind tag, `?2` Previous tag, `?3` New tag, `?4` fs name.
fn diff_query(kind: MutationKind) -> String {
    let previous = select_columns("p", "p_");
    let new = select_columns("n", "n_");

    match kind {
        MutationKind::Created => format!(
            "SELECT ?1 AS kind, {new} FROM filesystem n \
             WHERE n.fs_name = ?4 AND n.version = ?3 AND n.is_deleted = 0 \
               AND NOT EXISTS (SELECT 1 FROM filesystem p \
                               WHERE p.fs_name = n.fs_name AND p.version = ?2 \
                                 AND p.entry_id = n.entry_id AND p.is_folder = n.is_folder \
                                 AND p.is_deleted = 0) \
             ORDER BY n.path"
        ),
        MutationKind::Deleted => format!(
            "SELECT ?1 AS kind, {previous} FROM filesystem p \
             WHERE p.fs_name = ?4 AND p.version = ?2 AND p.is_deleted = 0 \
               AND NOT EXISTS (SELECT 1 FROM filesystem n \
                               WHERE n.fs_name = p.fs_name AND n.version = ?3 \
                                 AND n.entry_id = p.entry_id AND n.is_folder = p.is_folder \
                                 AND n.is_deleted = 0) \
             ORDER BY p.path"
        ),
        MutationKind::Modified => format!(
            "SELECT ?1 AS kind, {previous}, {new} FROM filesystem p \
             JOIN filesystem n ON n.fs_name = p.fs_name AND n.entry_id = p.entry_id \
                              AND n.is_folder = p.is_folder \
             WHERE p.fs_name = ?4 AND p.version = ?2 AND n.version = ?3 \
               AND p.is_deleted = 0 AND n.is_deleted = 0 \
               AND p.hash <> n.hash \
             ORDER BY n.path"
        ),
        MutationKind::Moved => format!(
            "SELECT ?1 AS kind, {previous}, {new} FROM filesystem p \
             JOIN filesystem n ON n.fs_name = p.fs_name AND n.entry_id = p.entry_id \
                              AND n.is_folder = p.is_folder \
             WHERE p.fs_name = ?4 AND p.version = ?2 AND n.version = ?3 \
               AND p.is_deleted = 0 AND n.is_deleted = 0 \
               AND (p.parent_folder_id IS NOT n.parent_folder_id OR p.name <> n.name) \
             ORDER BY n.path"
        ),
    }
}

// ============================================================================
// Row mapping functions
// ============================================================================

/// Reconstructs a SnapshotEntry from columns carrying `prefix`
fn entry_from_row(row: &SqliteRow, prefix: &str) -> Result<SnapshotEntry, CacheError> {
    let col = |name: &str| format!("{prefix}{name}");

    let fs_name: String = row.try_get(col("fs_name").as_str())?;
    let entry_id: String = row.try_get(col("entry_id").as_str())?;
    let is_folder: bool = row.try_get(col("is_folder").as_str())?;
    let is_deleted: bool = row.try_get(col("is_deleted").as_str())?;
    let deleted_file_id: Option<String> = row.try_get(col("deleted_file_id").as_str())?;
    let name: String = row.try_get(col("name").as_str())?;
    let parent_folder_id: Option<String> = row.try_get(col("parent_folder_id").as_str())?;
    let path: String = row.try_get(col("path").as_str())?;
    let created: String = row.try_get(col("created").as_str())?;
    let modified: String = row.try_get(col("modified").as_str())?;
    let size: i64 = row.try_get(col("size").as_str())?;
    let hash: String = row.try_get(col("hash").as_str())?;

    Ok(SnapshotEntry {
        fs_name: FsName::new(fs_name)?,
        entry_id: EntryId::new(entry_id)?,
        is_folder,
        is_deleted,
        deleted_entry_id: deleted_file_id.map(EntryId::new).transpose()?,
        name,
        parent_entry_id: parent_folder_id.map(EntryId::new).transpose()?,
        path,
        created: parse_datetime(&created)?,
        modified: parse_datetime(&modified)?,
        size: u64::try_from(size).map_err(|_| {
            CacheError::SerializationError(format!("Negative size {} in database", size))
        })?,
        hash,
    })
}

fn mutation_from_row(row: &SqliteRow) -> Result<Mutation, CacheError> {
    let tag: String = row.try_get("kind")?;
    let kind: MutationKind = tag.parse()?;

    Ok(match kind {
        MutationKind::Created => Mutation::created(entry_from_row(row, "n_")?),
        MutationKind::Deleted => Mutation::deleted(entry_from_row(row, "p_")?),
        MutationKind::Modified => {
            Mutation::modified(entry_from_row(row, "p_")?, entry_from_row(row, "n_")?)
        }
        MutationKind::Moved => {
            Mutation::moved(entry_from_row(row, "p_")?, entry_from_row(row, "n_")?)
        }
    })
}

fn tracking_state_from_row(row: &SqliteRow) -> Result<TrackingState, CacheError> {
    let fs_name: String = row.try_get("fs_name")?;
    let last_refresh: Option<String> = row.try_get("last_refresh")?;

    Ok(TrackingState {
        fs_name: FsName::new(fs_name)?,
        changed: row.try_get("changed")?,
        sync_in_progress: row.try_get("sync_in_progress")?,
        rotation_pending: row.try_get("rotation_pending")?,
        last_refresh: last_refresh.as_deref().map(parse_datetime).transpose()?,
    })
}

// ============================================================================
// Ingest
// ============================================================================

/// Drains `entries` into the New generation, one transaction per batch
///
/// Returning drops the receiver, which is what stops a walker blocked on a
/// full channel after a failure.
async fn consume_entries(
    pool: SqlitePool,
    fs_name: FsName,
    mut entries: mpsc::Receiver<SnapshotEntry>,
) -> Result<u64, CacheError> {
    let mut stored = 0u64;
    let mut batch = Vec::with_capacity(INGEST_BATCH_SIZE);

    while let Some(first) = entries.recv().await {
        batch.push(first);
        while batch.len() < INGEST_BATCH_SIZE {
            match entries.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(_) => break,
            }
        }

        insert_batch(&pool, &fs_name, &batch).await?;
        stored += batch.len() as u64;
        batch.clear();
    }

    Ok(stored)
}

async fn insert_batch(
    pool: &SqlitePool,
    fs_name: &FsName,
    batch: &[SnapshotEntry],
) -> Result<(), CacheError> {
    let mut tx = pool.begin().await?;

    for entry in batch {
        let failed = |message: String| CacheError::IngestFailed {
            fs_name: fs_name.to_string(),
            entry_id: entry.entry_id.to_string(),
            message,
        };

        if &entry.fs_name != fs_name {
            return Err(failed(format!(
                "entry belongs to file system '{}'",
                entry.fs_name
            )));
        }

        sqlx::query(
            "INSERT INTO filesystem \
             (fs_name, version, entry_id, is_folder, is_deleted, deleted_file_id, name, \
              parent_folder_id, path, created, modified, size, hash) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(fs_name.as_str())
        .bind(Version::New.as_str())
        .bind(entry.entry_id.as_str())
        .bind(entry.is_folder)
        .bind(entry.is_deleted)
        .bind(entry.deleted_entry_id.as_ref().map(EntryId::as_str))
        .bind(&entry.name)
        .bind(entry.parent_entry_id.as_ref().map(EntryId::as_str))
        .bind(&entry.path)
        .bind(format_datetime(&entry.created))
        .bind(format_datetime(&entry.modified))
        .bind(size_to_sql(entry.size).map_err(|e| failed(e.to_string()))?)
        .bind(&entry.hash)
        .execute(&mut *tx)
        .await
        .map_err(|e| failed(e.to_string()))?;
    }

    tx.commit().await?;
    tracing::trace!(fs_name = %fs_name, count = batch.len(), "Stored entry batch");
    Ok(())
}

// ============================================================================
// SnapshotStore implementation
// ============================================================================

#[async_trait::async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    fn ingest(
        &self,
        fs_name: &FsName,
        capacity: usize,
    ) -> (mpsc::Sender<SnapshotEntry>, oneshot::Receiver<IngestOutcome>) {
        let (entries_tx, entries_rx) = mpsc::channel(capacity.max(1));
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let pool = self.pool.clone();
        let fs_name = fs_name.clone();

        tokio::spawn(async move {
            let outcome = consume_entries(pool, fs_name.clone(), entries_rx).await;
            match &outcome {
                Ok(count) => tracing::debug!(fs_name = %fs_name, count, "Ingest finished"),
                Err(e) => tracing::warn!(fs_name = %fs_name, error = %e, "Ingest failed"),
            }
            // The walker may already be gone; nothing left to report to.
            let _ = outcome_tx.send(outcome.map_err(anyhow::Error::from));
        });

        (entries_tx, outcome_rx)
    }

    #[tracing::instrument(skip(self), fields(fs_name = %fs_name))]
    async fn rotate(&self, fs_name: &FsName) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        let dropped = sqlx::query("DELETE FROM filesystem WHERE fs_name = ? AND version = ?")
            .bind(fs_name.as_str())
            .bind(Version::Previous.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let promoted = sqlx::query(
            "UPDATE filesystem SET version = ? WHERE fs_name = ? AND version = ?",
        )
        .bind(Version::Previous.as_str())
        .bind(fs_name.as_str())
        .bind(Version::New.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "INSERT INTO tracked_filesystem (fs_name, rotation_pending) VALUES (?, 1) \
             ON CONFLICT(fs_name) DO UPDATE SET rotation_pending = 1",
        )
        .bind(fs_name.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(dropped, promoted, "Rotated snapshot generations");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(fs_name = %fs_name))]
    async fn clear_new(&self, fs_name: &FsName) -> anyhow::Result<()> {
        let cleared = sqlx::query("DELETE FROM filesystem WHERE fs_name = ? AND version = ?")
            .bind(fs_name.as_str())
            .bind(Version::New.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

        tracing::debug!(cleared, "Cleared New generation");
        Ok(())
    }

    async fn snapshot(
        &self,
        fs_name: &FsName,
        version: Version,
    ) -> anyhow::Result<Vec<SnapshotEntry>> {
        let sql = format!(
            "SELECT {} FROM filesystem WHERE fs_name = ? AND version = ? ORDER BY path",
            ENTRY_COLUMNS.join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(fs_name.as_str())
            .bind(version.as_str())
            .fetch_all(&self.pool)
            .await?;

        let entries = rows
            .iter()
            .map(|row| entry_from_row(row, ""))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn tracking_state(&self, fs_name: &FsName) -> anyhow::Result<TrackingState> {
        let row = sqlx::query(
            "SELECT fs_name, changed, sync_in_progress, rotation_pending, last_refresh \
             FROM tracked_filesystem WHERE fs_name = ?",
        )
        .bind(fs_name.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(tracking_state_from_row(r)?),
            None => Ok(TrackingState::untracked(fs_name.clone())),
        }
    }

    #[tracing::instrument(skip(self), fields(fs_name = %fs_name))]
    async fn set_changed(&self, fs_name: &FsName, changed: bool) -> anyhow::Result<()> {
        if !changed {
            sqlx::query(
                "INSERT INTO tracked_filesystem (fs_name, changed) VALUES (?, 0) \
                 ON CONFLICT(fs_name) DO UPDATE SET changed = 0",
            )
            .bind(fs_name.as_str())
            .execute(&self.pool)
            .await?;
            tracing::debug!("Marked file system as synchronized");
            return Ok(());
        }

        let now = format_datetime(&Utc::now());
        let diff_id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO tracked_filesystem (fs_name, changed, rotation_pending, last_refresh) \
             VALUES (?, 1, 0, ?) \
             ON CONFLICT(fs_name) DO UPDATE SET \
               changed = 1, rotation_pending = 0, last_refresh = excluded.last_refresh",
        )
        .bind(fs_name.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO tracker_diff (diff_id, fs_name, timestamp) VALUES (?, ?, ?)")
            .bind(&diff_id)
            .bind(fs_name.as_str())
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(diff_id = %diff_id, "Recorded completed refresh");
        Ok(())
    }

    async fn try_acquire(&self, fs_name: &FsName) -> anyhow::Result<bool> {
        sqlx::query("INSERT OR IGNORE INTO tracked_filesystem (fs_name) VALUES (?)")
            .bind(fs_name.as_str())
            .execute(&self.pool)
            .await?;

        let acquired = sqlx::query(
            "UPDATE tracked_filesystem SET sync_in_progress = 1 \
             WHERE fs_name = ? AND sync_in_progress = 0",
        )
        .bind(fs_name.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        tracing::trace!(fs_name = %fs_name, acquired, "Lock attempt");
        Ok(acquired)
    }

    async fn release(&self, fs_name: &FsName) -> anyhow::Result<()> {
        sqlx::query("UPDATE tracked_filesystem SET sync_in_progress = 0 WHERE fs_name = ?")
            .bind(fs_name.as_str())
            .execute(&self.pool)
            .await?;

        tracing::trace!(fs_name = %fs_name, "Lock released");
        Ok(())
    }

    async fn refresh_history(
        &self,
        fs_name: &FsName,
        limit: u32,
    ) -> anyhow::Result<Vec<RefreshRecord>> {
        let rows = sqlx::query(
            "SELECT diff_id, fs_name, timestamp FROM tracker_diff \
             WHERE fs_name = ? ORDER BY timestamp DESC, rowid DESC LIMIT ?",
        )
        .bind(fs_name.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let fs: String = row.try_get("fs_name")?;
            let timestamp: String = row.try_get("timestamp")?;
            records.push(RefreshRecord {
                diff_id: row.try_get("diff_id")?,
                fs_name: FsName::new(fs).map_err(CacheError::from)?,
                timestamp: parse_datetime(&timestamp)?,
            });
        }
        Ok(records)
    }
}

// ============================================================================
// DiffReader implementation
// ============================================================================

#[async_trait::async_trait]
impl DiffReader for SqliteSnapshotStore {
    #[tracing::instrument(skip(self), fields(fs_name = %fs_name))]
    async fn diff(&self, fs_name: &FsName) -> anyhow::Result<Vec<Mutation>> {
        let mut tx = self.pool.begin().await?;
        let mutations = Self::classify(&mut tx, fs_name).await?;
        tx.commit().await?;

        tracing::debug!(count = mutations.len(), "Computed diff");
        Ok(mutations)
    }
}
