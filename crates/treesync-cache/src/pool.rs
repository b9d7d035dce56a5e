//! SQLite pool and schema migrations
//!
//! [`DatabasePool`] opens the snapshot database (file-backed in WAL mode,
//! or a single in-memory connection for tests) and brings its schema up to
//! date before handing out the pool.
//!
//! ## Migration guard
//!
//! Each migration is recorded as `in progress` before its SQL runs and
//! flipped to `applied` afterwards. If the newest row is still
//! `in progress` at startup, a previous run died mid-migration and the pool
//! refuses to open, naming the suspect version.
//!
//! ## Stale locks
//!
//! Opening a file database clears every `sync_in_progress` flag: a lock
//! that survived until the next open belonged to a process that crashed.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

/// Status of a migration that started but has not finished
const STATUS_IN_PROGRESS: &str = "in progress";

/// Status of a migration that completed
const STATUS_APPLIED: &str = "applied";

/// One embedded schema migration
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations, in ascending version order
const MIGRATIONS: &[Migration] = &[Migration {
    version: 20260301,
    name: "initial",
    sql: include_str!("migrations/20260301_initial.sql"),
}];

/// Migrated connection pool over the snapshot database
///
/// File databases get five connections and a five second busy timeout so
/// the ingest consumer and flag updates can overlap with diff reads.
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if needed) the database at `db_path` and migrates it
    ///
    /// # Errors
    ///
    /// `ConnectionFailed` when the directory or file cannot be opened,
    /// otherwise whatever [`DatabasePool::migrate`] reports.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("cannot open {}: {e}", db_path.display()))
            })?;

        Self::migrate(&pool).await?;
        Self::release_stale_locks(&pool).await?;

        tracing::info!(path = %db_path.display(), "Snapshot database ready");

        Ok(Self { pool })
    }

    /// Private in-memory database
    ///
    /// Limited to one connection: every SQLite `:memory:` connection is its
    /// own database.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("cannot open in-memory database: {e}"))
            })?;

        Self::migrate(&pool).await?;

        tracing::debug!("In-memory snapshot database ready");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Applies every migration newer than the last recorded one
    ///
    /// # Errors
    ///
    /// Returns `CacheError::MigrationInProgress` if the newest recorded
    /// migration never finished, or `CacheError::MigrationFailed` if a
    /// migration's SQL fails (it is rolled back and its marker removed).
    pub async fn migrate(pool: &SqlitePool) -> Result<(), CacheError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS schema_migrations (\
                 version INTEGER PRIMARY KEY, \
                 status TEXT NOT NULL CHECK (status IN ('in progress', 'applied'))\
             );",
        )
        .execute(pool)
        .await
        .map_err(|e| {
            CacheError::MigrationFailed(format!("Failed to create schema_migrations: {}", e))
        })?;

        let latest: Option<(i64, String)> = sqlx::query_as(
            "SELECT version, status FROM schema_migrations ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(pool)
        .await?;

        if let Some((version, status)) = &latest {
            if status == STATUS_IN_PROGRESS {
                tracing::error!(version, "Found unfinished schema migration");
                return Err(CacheError::MigrationInProgress(*version));
            }
        }

        let applied_up_to = latest.map(|(version, _)| version).unwrap_or(0);

        for migration in MIGRATIONS.iter().filter(|m| m.version > applied_up_to) {
            Self::apply(pool, migration).await?;
        }

        tracing::debug!(applied_up_to, "Schema up to date");
        Ok(())
    }

    /// Clears refresh locks left behind by a process that died mid-cycle
    ///
    /// The lock only lives as long as the process holding it, so anything
    /// still set when the database is opened is stale.
    async fn release_stale_locks(pool: &SqlitePool) -> Result<(), CacheError> {
        let released = sqlx::query(
            "UPDATE tracked_filesystem SET sync_in_progress = 0 WHERE sync_in_progress = 1",
        )
        .execute(pool)
        .await?
        .rows_affected();

        if released > 0 {
            tracing::warn!(released, "Released refresh locks left by an interrupted run");
        }
        Ok(())
    }

    async fn apply(pool: &SqlitePool, migration: &Migration) -> Result<(), CacheError> {
        sqlx::query("INSERT INTO schema_migrations (version, status) VALUES (?, ?)")
            .bind(migration.version)
            .bind(STATUS_IN_PROGRESS)
            .execute(pool)
            .await?;

        if let Err(e) = run_in_transaction(pool, migration.sql).await {
            sqlx::query("DELETE FROM schema_migrations WHERE version = ?")
                .bind(migration.version)
                .execute(pool)
                .await?;
            return Err(CacheError::MigrationFailed(format!(
                "Migration {} ({}) failed: {}",
                migration.version, migration.name, e
            )));
        }

        sqlx::query("UPDATE schema_migrations SET status = ? WHERE version = ?")
            .bind(STATUS_APPLIED)
            .bind(migration.version)
            .execute(pool)
            .await?;

        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied schema migration"
        );
        Ok(())
    }
}

/// Executes a (possibly multi-statement) script atomically
async fn run_in_transaction(pool: &SqlitePool, sql: &str) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::raw_sql(sql).execute(&mut *tx).await?;
    tx.commit().await
}
