//! davsync-journal - Per-root persistent sync journal
//!
//! SQLite-backed record of the last reconciled state, plus the auxiliary
//! tables the engine needs to be resumable:
//!
//! - sync records keyed by relative path, with a file-id index for move
//!   detection
//! - selective-sync lists (blacklist / whitelist / undecided)
//! - the error blacklist with exponential backoff
//! - download and chunked-upload resumption info
//! - the conflict table linking conflict copies to their base paths
//! - per-path pin states for the VFS layer
//!
//! The journal records what was reconciled and propagated, never
//! speculative state. Writers are single-threaded per root (the folder's
//! owner task); readers may be concurrent thanks to WAL mode.

pub mod pool;
pub mod store;

pub use pool::JournalDb;
pub use store::{BlacklistCategory, BlacklistEntry, DownloadInfo, SelectiveSyncList, SyncJournal, UploadInfo};

/// Errors raised by journal operations.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Failed to open or create the database file
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// The journal was written by a newer, incompatible version
    #[error("Journal schema version {found} is newer than supported version {supported}")]
    VersionTooNew { found: i64, supported: i64 },

    /// A stored value could not be mapped back to a domain type
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for JournalError {
    fn from(e: sqlx::Error) -> Self {
        JournalError::QueryFailed(e.to_string())
    }
}
