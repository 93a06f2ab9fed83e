//! Engine error type and run-level classification

use std::path::PathBuf;

use davsync_core::events::ErrorClass;
use davsync_core::ports::RemoteError;
use davsync_journal::JournalError;

/// Errors raised while running a sync.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),

    #[error("journal: {0}")]
    Journal(#[from] JournalError),

    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("local sync root not usable: {0}")]
    RootUnusable(String),

    #[error("sync aborted")]
    Aborted,

    #[error("{0}")]
    Fatal(String),
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must end the whole run.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_fatal(),
            SyncError::Journal(_) => true,
            SyncError::RootUnusable(_) => true,
            SyncError::Fatal(_) => true,
            SyncError::Aborted => true,
            SyncError::Io { .. } => false,
        }
    }

    /// The run-level taxonomy class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Io { .. } => ErrorClass::SoftLocal,
            SyncError::Remote(e) if !e.is_fatal() => ErrorClass::Normal,
            _ => ErrorClass::Fatal,
        }
    }
}
