//! Journal database lifecycle
//!
//! Opens the per-root SQLite file with WAL journal mode, gates on the
//! schema version, runs migrations, and recovers from corruption by
//! discarding the journal (the caller then schedules a full rediscovery).

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::JournalError;

/// Schema version written by this build. Opening a journal with a higher
/// version fails; a lower version runs migrations in one transaction.
pub const SCHEMA_VERSION: i64 = 1;

/// Handle to an opened per-root journal database.
///
/// The database lives at `<root>/.sync_<hash>.db` (with `-wal`/`-shm`
/// companions); `<hash>` derives from the remote identity so two roots in
/// the same directory never collide.
pub struct JournalDb {
    pool: SqlitePool,
    db_path: Option<PathBuf>,
}

impl JournalDb {
    /// File name of the journal for a given remote identity
    /// (account url + remote path). Exposed so the exclude engine can
    /// auto-exclude the journal and its companions.
    pub fn file_name(remote_identity: &str) -> String {
        let digest = Sha256::digest(remote_identity.as_bytes());
        let mut hash = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            hash.push_str(&format!("{byte:02x}"));
        }
        format!(".sync_{hash}.db")
    }

    /// Opens (or creates) the journal under `root`.
    ///
    /// Returns the handle and a `first_sync` flag: true when the journal
    /// was created fresh, including after corruption recovery.
    pub async fn open(root: &Path, remote_identity: &str) -> Result<(Self, bool), JournalError> {
        let db_path = root.join(Self::file_name(remote_identity));
        let existed = db_path.exists();

        match Self::open_at(&db_path).await {
            Ok(db) => Ok((db, !existed)),
            Err(err) if existed => {
                // A journal we cannot read is discarded; the caller treats
                // the root as never synced and rediscovers everything.
                tracing::warn!(
                    path = %db_path.display(),
                    error = %err,
                    "Journal unreadable, discarding and starting fresh"
                );
                Self::remove_files(&db_path);
                let db = Self::open_at(&db_path).await?;
                Ok((db, true))
            }
            Err(err) => Err(err),
        }
    }

    async fn open_at(db_path: &Path) -> Result<Self, JournalError> {
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
                JournalError::ConnectionFailed(format!(
                    "Failed to open journal at {}: {}",
                    db_path.display(),
                    e
                ))
            })?;

        Self::migrate(&pool).await?;

        tracing::info!(path = %db_path.display(), "Journal opened");

        Ok(Self {
            pool,
            db_path: Some(db_path.to_path_buf()),
        })
    }

    /// In-memory journal for tests. A single connection keeps the data
    /// alive across queries.
    pub async fn in_memory() -> Result<Self, JournalError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                JournalError::ConnectionFailed(format!("in-memory journal: {e}"))
            })?;

        Self::migrate(&pool).await?;

        Ok(Self {
            pool,
            db_path: None,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the pool and deletes the database with its companions.
    pub async fn discard(self) -> Result<(), JournalError> {
        self.pool.close().await;
        if let Some(path) = &self.db_path {
            Self::remove_files(path);
        }
        Ok(())
    }

    fn remove_files(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut candidate = db_path.as_os_str().to_owned();
            candidate.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(candidate));
        }
    }

    /// Checks the stored schema version and runs migrations inside a
    /// single transaction.
    async fn migrate(pool: &SqlitePool) -> Result<(), JournalError> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| JournalError::MigrationFailed(e.to_string()))?;

        sqlx::raw_sql("CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)")
            .execute(&mut *tx)
            .await
            .map_err(|e| JournalError::MigrationFailed(e.to_string()))?;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = 'schema_version'")
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| JournalError::MigrationFailed(e.to_string()))?;

        let stored_version = stored.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);

        if stored_version > SCHEMA_VERSION {
            return Err(JournalError::VersionTooNew {
                found: stored_version,
                supported: SCHEMA_VERSION,
            });
        }

        if stored_version < SCHEMA_VERSION {
            let migration_sql = include_str!("migrations/0001_initial.sql");
            sqlx::raw_sql(migration_sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| JournalError::MigrationFailed(e.to_string()))?;

            sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?)")
                .bind(SCHEMA_VERSION.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| JournalError::MigrationFailed(e.to_string()))?;

            tracing::debug!(
                from = stored_version,
                to = SCHEMA_VERSION,
                "Journal schema migrated"
            );
        }

        tx.commit()
            .await
            .map_err(|e| JournalError::MigrationFailed(e.to_string()))?;

        Ok(())
    }
}
