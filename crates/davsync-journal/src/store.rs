//! Journal store - typed access to the journal tables
//!
//! All writes happen from the folder's owner task; operations are
//! transactional at the granularity of a single sync-item completion.
//!
//! ## Type mapping
//!
//! | Domain type        | SQL type | Strategy                                  |
//! |--------------------|----------|-------------------------------------------|
//! | RelativePath       | TEXT     | `as_str()` / `RelativePath::new()`        |
//! | Etag, FileId       | TEXT     | `as_str()` / constructor                  |
//! | Checksum           | TEXT     | `<ALGO>:<hex>` header form                |
//! | RemotePermissions  | INTEGER  | raw bits                                  |
//! | ItemKind, PinState | TEXT     | snake_case names                          |
//! | DateTime<Utc>      | TEXT     | RFC 3339                                  |
//! | TransferSession    | TEXT     | serde_json                                |

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use davsync_core::domain::{
    Checksum, Etag, FileId, ItemKind, JournalRecord, PinState, RelativePath, RemotePermissions,
    TransferId,
};
use davsync_core::ports::TransferSession;

use crate::JournalError;

// ============================================================================
// Auxiliary row types
// ============================================================================

/// The three selective-sync lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectiveSyncList {
    /// Never sync these subtrees.
    Blacklist,
    /// Explicit includes.
    Whitelist,
    /// Big new remote folders awaiting a user decision.
    Undecided,
}

impl SelectiveSyncList {
    fn as_i64(self) -> i64 {
        match self {
            SelectiveSyncList::Blacklist => 1,
            SelectiveSyncList::Whitelist => 2,
            SelectiveSyncList::Undecided => 3,
        }
    }
}

/// Category of an error-blacklist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistCategory {
    /// Expires with exponential backoff.
    Normal,
    /// Wiped on unlock event or at the start of the next run.
    SoftLocal,
    /// Parked until the server lock expires.
    FileLocked,
}

impl BlacklistCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            BlacklistCategory::Normal => "normal",
            BlacklistCategory::SoftLocal => "soft_local",
            BlacklistCategory::FileLocked => "file_locked",
        }
    }

    fn parse(s: &str) -> Result<Self, JournalError> {
        match s {
            "normal" => Ok(BlacklistCategory::Normal),
            "soft_local" => Ok(BlacklistCategory::SoftLocal),
            "file_locked" => Ok(BlacklistCategory::FileLocked),
            other => Err(JournalError::Serialization(format!(
                "unknown blacklist category: {other}"
            ))),
        }
    }
}

/// One row of the error blacklist.
#[derive(Debug, Clone, PartialEq)]
pub struct BlacklistEntry {
    pub path: RelativePath,
    pub category: BlacklistCategory,
    pub retry_count: u32,
    pub ignore_until: Option<DateTime<Utc>>,
    pub error_string: String,
}

impl BlacklistEntry {
    /// Backoff ladder for `normal` entries: 1, 2, 5, 10, 30 minutes, then
    /// a 2 hour cap.
    pub fn backoff_for(retry_count: u32) -> Duration {
        match retry_count {
            0 => Duration::minutes(1),
            1 => Duration::minutes(2),
            2 => Duration::minutes(5),
            3 => Duration::minutes(10),
            4 => Duration::minutes(30),
            _ => Duration::hours(2),
        }
    }

    /// True when the entry still suppresses propagation of its path.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.ignore_until {
            Some(until) => now < until,
            None => true,
        }
    }
}

/// Resumable-download scratch info.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadInfo {
    pub path: RelativePath,
    pub tmp_file: String,
    pub etag: Etag,
}

/// Resumable chunked-upload info.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadInfo {
    pub path: RelativePath,
    pub transfer_id: TransferId,
    pub session: TransferSession,
    /// Bytes acknowledged by the server when this row was last written.
    pub committed: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub size: u64,
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, JournalError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| JournalError::Serialization(format!("bad datetime '{s}': {e}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, JournalError> {
    match s {
        Some(ref v) if !v.is_empty() => parse_datetime(v).map(Some),
        _ => Ok(None),
    }
}

fn path_from_str(s: &str) -> Result<RelativePath, JournalError> {
    RelativePath::new(s).map_err(|e| JournalError::Serialization(format!("bad path '{s}': {e}")))
}

fn record_from_row(row: &SqliteRow) -> Result<JournalRecord, JournalError> {
    let path: String = row.get("path");
    let inode: i64 = row.get("inode");
    let mtime: Option<String> = row.get("mtime");
    let size: i64 = row.get("size");
    let kind: String = row.get("kind");
    let etag: Option<String> = row.get("etag");
    let file_id: Option<String> = row.get("file_id");
    let perms: i64 = row.get("perms");
    let checksum: Option<String> = row.get("checksum");
    let content_checksum: Option<String> = row.get("content_checksum");
    let dirty_placeholder: i64 = row.get("dirty_placeholder");

    let kind = ItemKind::parse(&kind)
        .ok_or_else(|| JournalError::Serialization(format!("unknown item kind: {kind}")))?;

    let etag = match etag {
        Some(ref e) if !e.is_empty() => Some(
            Etag::new(e).map_err(|err| JournalError::Serialization(err.to_string()))?,
        ),
        _ => None,
    };

    let file_id = match file_id {
        Some(ref f) if !f.is_empty() => Some(
            FileId::new(f.clone()).map_err(|err| JournalError::Serialization(err.to_string()))?,
        ),
        _ => None,
    };

    let parse_checksum = |s: Option<String>| -> Result<Option<Checksum>, JournalError> {
        match s {
            Some(ref c) if !c.is_empty() => Checksum::parse_header(c)
                .map(Some)
                .map_err(|e| JournalError::Serialization(e.to_string())),
            _ => Ok(None),
        }
    };

    Ok(JournalRecord {
        path: path_from_str(&path)?,
        inode: inode as u64,
        mtime: parse_optional_datetime(mtime)?,
        size: size as u64,
        kind,
        etag,
        file_id,
        remote_permissions: RemotePermissions::from_bits(perms as u16),
        checksum: parse_checksum(checksum)?,
        content_checksum: parse_checksum(content_checksum)?,
        has_dirty_placeholder_metadata: dirty_placeholder != 0,
    })
}

fn blacklist_from_row(row: &SqliteRow) -> Result<BlacklistEntry, JournalError> {
    let path: String = row.get("path");
    let category: String = row.get("category");
    let retry_count: i64 = row.get("retry_count");
    let ignore_until: Option<String> = row.get("ignore_until");
    let error_string: String = row.get("error_string");

    Ok(BlacklistEntry {
        path: path_from_str(&path)?,
        category: BlacklistCategory::parse(&category)?,
        retry_count: retry_count as u32,
        ignore_until: parse_optional_datetime(ignore_until)?,
        error_string,
    })
}

// ============================================================================
// SyncJournal
// ============================================================================

/// Typed access to all journal tables.
pub struct SyncJournal {
    pool: SqlitePool,
}

impl SyncJournal {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // --- sync records ---

    pub async fn get(&self, path: &RelativePath) -> Result<Option<JournalRecord>, JournalError> {
        let row = sqlx::query("SELECT * FROM records WHERE path = ?")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(ref r) => Ok(Some(record_from_row(r)?)),
            None => Ok(None),
        }
    }

    pub async fn get_by_file_id(
        &self,
        file_id: &FileId,
    ) -> Result<Option<JournalRecord>, JournalError> {
        let row = sqlx::query("SELECT * FROM records WHERE file_id = ?")
            .bind(file_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(ref r) => Ok(Some(record_from_row(r)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, record: &JournalRecord) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT OR REPLACE INTO records \
             (path, inode, mtime, size, kind, etag, file_id, perms, \
              checksum, content_checksum, dirty_placeholder) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.path.as_str())
        .bind(record.inode as i64)
        .bind(record.mtime.map(|dt| dt.to_rfc3339()))
        .bind(record.size as i64)
        .bind(record.kind.as_str())
        .bind(record.etag.as_ref().map(|e| e.as_str().to_string()))
        .bind(record.file_id.as_ref().map(|f| f.as_str().to_string()))
        .bind(record.remote_permissions.bits() as i64)
        .bind(record.checksum.as_ref().map(|c| c.to_string()))
        .bind(record.content_checksum.as_ref().map(|c| c.to_string()))
        .bind(i64::from(record.has_dirty_placeholder_metadata))
        .execute(&self.pool)
        .await?;

        tracing::trace!(path = %record.path, "Journal record written");
        Ok(())
    }

    pub async fn delete(&self, path: &RelativePath) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM records WHERE path = ?")
            .bind(path.as_str())
            .execute(&self.pool)
            .await?;
        tracing::trace!(path = %path, "Journal record deleted");
        Ok(())
    }

    /// All records under `prefix` (inclusive), ordered by path.
    pub async fn iterate(
        &self,
        prefix: &RelativePath,
    ) -> Result<Vec<JournalRecord>, JournalError> {
        let rows = if prefix.is_root() {
            sqlx::query("SELECT * FROM records ORDER BY path")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query(
                "SELECT * FROM records WHERE path = ? OR path LIKE ? ORDER BY path",
            )
            .bind(prefix.as_str())
            .bind(format!("{}/%", prefix.as_str()))
            .fetch_all(&self.pool)
            .await?
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(record_from_row(row)?);
        }
        Ok(records)
    }

    /// Renames a record and its whole subtree in one transaction.
    pub async fn rename_subtree(
        &self,
        from: &RelativePath,
        to: &RelativePath,
    ) -> Result<(), JournalError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query("SELECT path FROM records WHERE path = ? OR path LIKE ?")
            .bind(from.as_str())
            .bind(format!("{}/%", from.as_str()))
            .fetch_all(&mut *tx)
            .await?;

        for row in &rows {
            let old: String = row.get("path");
            let old_path = path_from_str(&old)?;
            let new_path = old_path
                .reparent(from, to)
                .map_err(|e| JournalError::Serialization(e.to_string()))?;
            sqlx::query("UPDATE records SET path = ? WHERE path = ?")
                .bind(new_path.as_str())
                .bind(old_path.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // --- selective sync ---

    pub async fn selective_sync_list(
        &self,
        list: SelectiveSyncList,
    ) -> Result<Vec<RelativePath>, JournalError> {
        let rows = sqlx::query("SELECT path FROM selective_sync WHERE kind = ? ORDER BY path")
            .bind(list.as_i64())
            .fetch_all(&self.pool)
            .await?;
        let mut paths = Vec::with_capacity(rows.len());
        for row in &rows {
            let p: String = row.get("path");
            paths.push(path_from_str(&p)?);
        }
        Ok(paths)
    }

    pub async fn add_to_selective_sync(
        &self,
        list: SelectiveSyncList,
        path: &RelativePath,
    ) -> Result<(), JournalError> {
        sqlx::query("INSERT OR IGNORE INTO selective_sync (path, kind) VALUES (?, ?)")
            .bind(path.as_str())
            .bind(list.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_from_selective_sync(
        &self,
        list: SelectiveSyncList,
        path: &RelativePath,
    ) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM selective_sync WHERE path = ? AND kind = ?")
            .bind(path.as_str())
            .bind(list.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- error blacklist ---

    pub async fn blacklist_entry(
        &self,
        path: &RelativePath,
    ) -> Result<Option<BlacklistEntry>, JournalError> {
        let row = sqlx::query("SELECT * FROM error_blacklist WHERE path = ?")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(ref r) => Ok(Some(blacklist_from_row(r)?)),
            None => Ok(None),
        }
    }

    /// Records a failure: increments the retry count of an existing entry
    /// and advances `ignore_until` along the backoff ladder for `normal`
    /// entries.
    pub async fn record_failure(
        &self,
        path: &RelativePath,
        category: BlacklistCategory,
        error_string: &str,
        lock_expiry: Option<DateTime<Utc>>,
    ) -> Result<BlacklistEntry, JournalError> {
        let existing = self.blacklist_entry(path).await?;
        let retry_count = existing.map(|e| e.retry_count + 1).unwrap_or(0);

        let ignore_until = match category {
            BlacklistCategory::Normal => {
                Some(Utc::now() + BlacklistEntry::backoff_for(retry_count))
            }
            BlacklistCategory::FileLocked => lock_expiry,
            BlacklistCategory::SoftLocal => None,
        };

        let entry = BlacklistEntry {
            path: path.clone(),
            category,
            retry_count,
            ignore_until,
            error_string: error_string.to_string(),
        };

        sqlx::query(
            "INSERT OR REPLACE INTO error_blacklist \
             (path, category, retry_count, ignore_until, error_string) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.path.as_str())
        .bind(entry.category.as_str())
        .bind(entry.retry_count as i64)
        .bind(entry.ignore_until.map(|dt| dt.to_rfc3339()))
        .bind(&entry.error_string)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            path = %path,
            category = entry.category.as_str(),
            retry_count = entry.retry_count,
            "Error blacklist entry recorded"
        );
        Ok(entry)
    }

    pub async fn clear_blacklist(&self, path: &RelativePath) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM error_blacklist WHERE path = ?")
            .bind(path.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Wipes a whole category; `soft_local` is wiped on unlock events.
    pub async fn wipe_blacklist_category(
        &self,
        category: BlacklistCategory,
    ) -> Result<u64, JournalError> {
        let result = sqlx::query("DELETE FROM error_blacklist WHERE category = ?")
            .bind(category.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // --- download info ---

    pub async fn download_info(
        &self,
        path: &RelativePath,
    ) -> Result<Option<DownloadInfo>, JournalError> {
        let row = sqlx::query("SELECT * FROM download_info WHERE path = ?")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => {
                let tmp_file: String = r.get("tmp_file");
                let etag: String = r.get("etag");
                Ok(Some(DownloadInfo {
                    path: path.clone(),
                    tmp_file,
                    etag: Etag::new(&etag)
                        .map_err(|e| JournalError::Serialization(e.to_string()))?,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn set_download_info(&self, info: &DownloadInfo) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT OR REPLACE INTO download_info (path, tmp_file, etag) VALUES (?, ?, ?)",
        )
        .bind(info.path.as_str())
        .bind(&info.tmp_file)
        .bind(info.etag.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_download_info(&self, path: &RelativePath) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM download_info WHERE path = ?")
            .bind(path.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- upload info ---

    pub async fn upload_info(
        &self,
        path: &RelativePath,
    ) -> Result<Option<UploadInfo>, JournalError> {
        let row = sqlx::query("SELECT * FROM upload_info WHERE path = ?")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => {
                let transfer_id: String = r.get("transfer_id");
                let session: String = r.get("session");
                let committed: i64 = r.get("committed");
                let mtime: Option<String> = r.get("mtime");
                let size: i64 = r.get("size");
                Ok(Some(UploadInfo {
                    path: path.clone(),
                    transfer_id: TransferId::new(transfer_id)
                        .map_err(|e| JournalError::Serialization(e.to_string()))?,
                    session: serde_json::from_str(&session)
                        .map_err(|e| JournalError::Serialization(e.to_string()))?,
                    committed: committed as u64,
                    mtime: parse_optional_datetime(mtime)?,
                    size: size as u64,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn set_upload_info(&self, info: &UploadInfo) -> Result<(), JournalError> {
        let session = serde_json::to_string(&info.session)
            .map_err(|e| JournalError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT OR REPLACE INTO upload_info \
             (path, transfer_id, session, committed, mtime, size) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(info.path.as_str())
        .bind(info.transfer_id.as_str())
        .bind(&session)
        .bind(info.committed as i64)
        .bind(info.mtime.map(|dt| dt.to_rfc3339()))
        .bind(info.size as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_upload_info(&self, path: &RelativePath) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM upload_info WHERE path = ?")
            .bind(path.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- conflicts ---

    pub async fn record_conflict(
        &self,
        conflict_path: &RelativePath,
        base_path: &RelativePath,
    ) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT OR REPLACE INTO conflicts (conflict_path, base_path) VALUES (?, ?)",
        )
        .bind(conflict_path.as_str())
        .bind(base_path.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn conflict_base(
        &self,
        conflict_path: &RelativePath,
    ) -> Result<Option<RelativePath>, JournalError> {
        let base: Option<String> =
            sqlx::query_scalar("SELECT base_path FROM conflicts WHERE conflict_path = ?")
                .bind(conflict_path.as_str())
                .fetch_optional(&self.pool)
                .await?;
        match base {
            Some(b) => Ok(Some(path_from_str(&b)?)),
            None => Ok(None),
        }
    }

    pub async fn remove_conflict(&self, conflict_path: &RelativePath) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM conflicts WHERE conflict_path = ?")
            .bind(conflict_path.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- pin states ---

    pub async fn set_pin_state(
        &self,
        path: &RelativePath,
        state: PinState,
    ) -> Result<(), JournalError> {
        sqlx::query("INSERT OR REPLACE INTO pin_states (path, state) VALUES (?, ?)")
            .bind(path.as_str())
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The pin stored for exactly this path.
    pub async fn raw_pin_state(
        &self,
        path: &RelativePath,
    ) -> Result<Option<PinState>, JournalError> {
        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM pin_states WHERE path = ?")
                .bind(path.as_str())
                .fetch_optional(&self.pool)
                .await?;
        match state {
            Some(s) => PinState::parse(&s)
                .map(Some)
                .ok_or_else(|| JournalError::Serialization(format!("unknown pin state: {s}"))),
            None => Ok(None),
        }
    }

    /// Resolves `inherited` by walking up the ancestors; `unspecified`
    /// when no ancestor carries an explicit pin.
    pub async fn effective_pin_state(
        &self,
        path: &RelativePath,
    ) -> Result<PinState, JournalError> {
        let mut cursor = Some(path.clone());
        while let Some(p) = cursor {
            match self.raw_pin_state(&p).await? {
                Some(PinState::Inherited) | None => {}
                Some(explicit) => return Ok(explicit),
            }
            cursor = p.parent();
        }
        Ok(PinState::Unspecified)
    }
}
