//! SyncFileItem - the unit of work of a sync run
//!
//! Discovery emits exactly one item per path it visits; the propagator
//! consumes them and reports each back with a terminal [`ItemStatus`].
//! Items live for the duration of one run and are then folded into the
//! journal or discarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::newtypes::{Checksum, Etag, FileId, RelativePath};
use super::permissions::RemotePermissions;

/// What kind of filesystem object an item refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    #[default]
    File,
    Directory,
    /// A dehydrated placeholder managed by the VFS layer.
    VirtualFile,
    /// Reported but never followed.
    SoftLink,
}

impl ItemKind {
    pub fn is_directory(&self) -> bool {
        matches!(self, ItemKind::Directory)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Directory => "directory",
            ItemKind::VirtualFile => "virtual_file",
            ItemKind::SoftLink => "soft_link",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(ItemKind::File),
            "directory" => Some(ItemKind::Directory),
            "virtual_file" => Some(ItemKind::VirtualFile),
            "soft_link" => Some(ItemKind::SoftLink),
            _ => None,
        }
    }
}

/// Which side the data moves towards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// No transfer involved (metadata, ignores, errors).
    #[default]
    None,
    /// Local change propagates to the server.
    Up,
    /// Remote change propagates to the local tree.
    Down,
}

/// What the propagator must do for a path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    /// Nothing to do; both sides match the journal.
    #[default]
    None,
    /// Create the object on the target side.
    New,
    /// Only metadata (permissions, mtime) differs.
    UpdateMetadata,
    /// Move, detected via file id; no data transfer.
    Rename,
    /// Remove from the target side.
    Remove,
    /// Both sides changed; keep server version, rename local copy.
    Conflict,
    /// Excluded or selective-sync'd; reported, never propagated.
    Ignore,
    /// Classification failed; surfaced as an error item.
    Error,
    /// Hydrate a placeholder into a full file.
    Sync,
    /// Metadata change on a dehydrated path; must not hydrate.
    UpdateVfsMetadata,
    /// File became directory or vice versa; remove then create.
    TypeChange,
}

/// Terminal (or intermediate) status of a propagated item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    NoStatus,
    Success,
    Warning,
    /// Will be retried by a later run without being counted as failure.
    SoftError,
    /// Failed; entered into the error blacklist with backoff.
    NormalError,
    /// Aborts the whole run.
    FatalError,
    /// Parked on the lock watcher (HTTP 423).
    FileLocked,
    FileIgnored,
    Conflict,
    /// Server content restored over a rejected local change.
    Restoration,
    /// Skipped because a blacklist entry is still active.
    Blacklisted,
}

impl ItemStatus {
    /// True for outcomes that count as failed in the run summary.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ItemStatus::SoftError
                | ItemStatus::NormalError
                | ItemStatus::FatalError
                | ItemStatus::FileLocked
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemStatus::Success | ItemStatus::Restoration)
    }
}

/// The unit of work produced by discovery and executed by the propagator.
///
/// Plain data: invariants about ordering and uniqueness are maintained by
/// the plan that holds the items, not by the item itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFileItem {
    /// Path relative to the sync root.
    pub path: RelativePath,
    /// Destination path for renames.
    pub rename_target: Option<RelativePath>,
    pub kind: ItemKind,
    pub direction: Direction,
    pub instruction: Instruction,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub etag: Option<Etag>,
    pub file_id: Option<FileId>,
    pub checksum: Option<Checksum>,
    pub remote_permissions: RemotePermissions,
    pub status: ItemStatus,
    pub error_string: Option<String>,
    pub http_error_code: Option<u16>,
    /// When an advisory server lock on this path expires.
    pub lock_expire_time: Option<DateTime<Utc>>,
}

impl SyncFileItem {
    /// A blank item for `path`; callers fill in what they classified.
    pub fn new(path: RelativePath, kind: ItemKind) -> Self {
        Self {
            path,
            rename_target: None,
            kind,
            direction: Direction::None,
            instruction: Instruction::None,
            size: 0,
            mtime: None,
            etag: None,
            file_id: None,
            checksum: None,
            remote_permissions: RemotePermissions::unrestricted(),
            status: ItemStatus::NoStatus,
            error_string: None,
            http_error_code: None,
            lock_expire_time: None,
        }
    }

    pub fn with_instruction(mut self, instruction: Instruction, direction: Direction) -> Self {
        self.instruction = instruction;
        self.direction = direction;
        self
    }

    pub fn is_directory(&self) -> bool {
        self.kind.is_directory()
    }

    /// True if executing this item performs network or filesystem work.
    pub fn needs_propagation(&self) -> bool {
        !matches!(
            self.instruction,
            Instruction::None | Instruction::Ignore | Instruction::Error
        )
    }

    /// Marks the item failed with a human-readable reason.
    pub fn set_error(&mut self, status: ItemStatus, reason: impl Into<String>) {
        self.status = status;
        self.error_string = Some(reason.into());
    }
}

impl fmt::Display for SyncFileItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:?} {}",
            self.instruction, self.direction, self.path
        )
    }
}
