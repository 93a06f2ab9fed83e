//! Events published per sync root
//!
//! One in-process broadcast bus per root; UI and socket collaborators
//! subscribe. The engine's internal state machines consume the same types
//! synchronously within the owner task.

use serde::{Deserialize, Serialize};

use crate::domain::newtypes::RelativePath;
use crate::domain::sync_item::SyncFileItem;

/// External status of one file, as shown by overlay icons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    None,
    Sync,
    Warning,
    Error,
    Ok,
    Excluded,
}

/// Error classes of the run-level taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Run ends, folder goes to error/setup-error, no retries.
    Fatal,
    /// Item failed; blacklisted with backoff, run continues.
    Normal,
    /// Cleared by an unlock event or the next run.
    SoftLocal,
    /// Handled inline, reported but not an error to the user.
    Conflict,
    /// Excludes and selective sync; informational.
    Ignored,
}

/// One error class as attached to the run summary: the first message of the
/// class verbatim, later duplicates only counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub message: String,
    pub occurrences: u64,
}

/// Terminal status of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Some items failed but the run finished.
    Problem,
    /// A fatal error ended the run early.
    Error,
    Aborted,
}

/// Summary of one finished sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub status: RunStatus,
    pub items_total: u64,
    pub items_completed: u64,
    pub items_failed: u64,
    pub bytes_transferred: u64,
    pub errors: Vec<ClassifiedError>,
    /// The engine wants an immediate follow-up run (e.g. after a 412).
    pub another_sync_needed: bool,
}

impl SyncRunSummary {
    pub fn aborted() -> Self {
        Self {
            status: RunStatus::Aborted,
            items_total: 0,
            items_completed: 0,
            items_failed: 0,
            bytes_transferred: 0,
            errors: Vec::new(),
            another_sync_needed: false,
        }
    }

    /// Records an error, keeping the first message of each class verbatim.
    pub fn record_error(&mut self, class: ErrorClass, message: &str) {
        if let Some(existing) = self.errors.iter_mut().find(|e| e.class == class) {
            existing.occurrences += 1;
        } else {
            self.errors.push(ClassifiedError {
                class,
                message: message.to_string(),
                occurrences: 1,
            });
        }
    }
}

/// Transfer progress of a running item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionProgress {
    pub path: RelativePath,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// Everything a root publishes on its event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SyncEvent {
    SyncStarted {
        folder: String,
    },
    ItemCompleted {
        folder: String,
        item: Box<SyncFileItem>,
    },
    TransmissionProgress {
        folder: String,
        progress: TransmissionProgress,
    },
    NewBigFolder {
        folder: String,
        path: RelativePath,
    },
    SyncFinished {
        folder: String,
        result: SyncRunSummary,
    },
    FileStatusChanged {
        folder: String,
        path: RelativePath,
        status: FileStatus,
    },
}
