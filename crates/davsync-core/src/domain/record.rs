//! Journal record - the last-reconciled state of a path
//!
//! A record exists iff the path was last seen consistent on both sides.
//! Records are created when an item first reaches success, mutated only at
//! successful item completion, and removed when the path disappears on
//! both sides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{Checksum, Etag, FileId, RelativePath};
use super::permissions::RemotePermissions;
use super::sync_item::{ItemKind, SyncFileItem};

/// Per-path row of the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub path: RelativePath,
    /// Local inode, used to notice in-place replacement.
    pub inode: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub size: u64,
    pub kind: ItemKind,
    pub etag: Option<Etag>,
    pub file_id: Option<FileId>,
    pub remote_permissions: RemotePermissions,
    /// Checksum the server reported for this version.
    pub checksum: Option<Checksum>,
    /// Checksum of the local content at last reconciliation.
    pub content_checksum: Option<Checksum>,
    /// Set when a placeholder's metadata changed without hydration.
    pub has_dirty_placeholder_metadata: bool,
}

impl JournalRecord {
    pub fn new(path: RelativePath, kind: ItemKind) -> Self {
        Self {
            path,
            inode: 0,
            mtime: None,
            size: 0,
            kind,
            etag: None,
            file_id: None,
            remote_permissions: RemotePermissions::unrestricted(),
            checksum: None,
            content_checksum: None,
            has_dirty_placeholder_metadata: false,
        }
    }

    /// Builds the record a successfully propagated item settles into.
    pub fn from_completed_item(item: &SyncFileItem, inode: u64) -> Self {
        Self {
            path: item.rename_target.clone().unwrap_or_else(|| item.path.clone()),
            inode,
            mtime: item.mtime,
            size: item.size,
            kind: item.kind,
            etag: item.etag.clone(),
            file_id: item.file_id.clone(),
            remote_permissions: item.remote_permissions,
            checksum: item.checksum.clone(),
            content_checksum: item.checksum.clone(),
            has_dirty_placeholder_metadata: false,
        }
    }
}
