//! Propagator - executes the sync plan
//!
//! Consumes the ordered plan in phases that encode the barriers:
//!
//! 1. file removals (bounded-parallel)
//! 2. directory creations and directory metadata (serial, parents first)
//! 3. renames (serial; prior phases drained the source subtrees)
//! 4. file transfers (bounded-parallel, paced, globally queued)
//! 5. directory removals (serial, deepest first)
//!
//! Jobs run on the pool; their results rendezvous back here, and this
//! owner task is the only journal writer. A failed job never mutates the
//! journal for its path except to record an error-blacklist entry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use davsync_core::capabilities::ServerCapabilities;
use davsync_core::config::Config;
use davsync_core::domain::{
    Checksum, ChecksumAlgorithm, Direction, Instruction, ItemKind, ItemStatus, JournalRecord,
    RelativePath, SyncFileItem,
};
use davsync_core::events::{
    ErrorClass, FileStatus, RunStatus, SyncEvent, SyncRunSummary, TransmissionProgress,
};
use davsync_core::ports::{
    FinalizeArgs, PlaceholderMetadata, RemoteClient, RemoteError, Vfs,
};
use davsync_journal::{BlacklistCategory, DownloadInfo, SyncJournal, UploadInfo};

use crate::bandwidth::BandwidthManager;
use crate::discovery::{checksum_of, SyncPlan};
use crate::error::SyncError;
use crate::queue::JobQueue;

/// Everything a propagator needs to run one root's plans.
pub struct PropagatorContext {
    pub folder: String,
    pub root: PathBuf,
    pub remote: Arc<dyn RemoteClient>,
    pub journal: Arc<SyncJournal>,
    pub vfs: Arc<dyn Vfs>,
    pub bandwidth: Arc<BandwidthManager>,
    pub queue: Arc<JobQueue>,
    pub events: tokio::sync::broadcast::Sender<SyncEvent>,
    /// Last published per-path status; suppresses duplicate events.
    pub statuses: Arc<dashmap::DashMap<RelativePath, FileStatus>>,
    pub config: Config,
    pub capabilities: ServerCapabilities,
}

/// What the owner task must write to the journal after a job.
#[derive(Debug)]
enum JournalUpdate {
    None,
    Put(JournalRecord),
    Delete(RelativePath),
    RenameSubtree {
        from: RelativePath,
        to: RelativePath,
        record: JournalRecord,
    },
}

/// The rendezvous payload of one finished job.
struct JobResult {
    item: SyncFileItem,
    /// Whether the job's work completed (conflict fixups complete with a
    /// conflict status, not a success status).
    succeeded: bool,
    update: JournalUpdate,
    bytes: u64,
    another_sync_needed: bool,
    blacklist: Option<(BlacklistCategory, String, Option<DateTime<Utc>>)>,
    fatal: Option<String>,
}

/// Executes plans for one sync root.
pub struct Propagator {
    ctx: Arc<PropagatorContext>,
}

impl Propagator {
    pub fn new(ctx: PropagatorContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Runs the whole plan; item-local errors never abort the run, fatal
    /// errors do.
    pub async fn propagate(
        &self,
        plan: SyncPlan,
        cancel: &CancellationToken,
    ) -> SyncRunSummary {
        let mut summary = SyncRunSummary {
            status: RunStatus::Success,
            items_total: 0,
            items_completed: 0,
            items_failed: 0,
            bytes_transferred: 0,
            errors: Vec::new(),
            another_sync_needed: false,
        };

        // paths gone from both sides leave the journal first
        for path in &plan.journal_purges {
            if let Err(e) = self.ctx.journal.delete(path).await {
                warn!(path = %path, error = %e, "Failed to purge journal row");
            }
        }

        let mut file_deletes = Vec::new();
        let mut dir_ops = Vec::new();
        let mut renames = Vec::new();
        let mut transfers = Vec::new();
        let mut dir_deletes = Vec::new();

        for item in plan.items {
            if !item.needs_propagation() {
                self.report_passive(&mut summary, item);
                continue;
            }
            summary.items_total += 1;
            match (item.instruction, item.kind.is_directory()) {
                (Instruction::Remove, false) => file_deletes.push(item),
                (Instruction::Remove, true) => dir_deletes.push(item),
                (Instruction::Rename, _) => renames.push(item),
                (Instruction::New | Instruction::UpdateMetadata, true) => dir_ops.push(item),
                _ => transfers.push(item),
            }
        }

        info!(
            folder = %self.ctx.folder,
            total = summary.items_total,
            deletes = file_deletes.len() + dir_deletes.len(),
            dirs = dir_ops.len(),
            renames = renames.len(),
            transfers = transfers.len(),
            "Propagation starting"
        );

        self.run_parallel(file_deletes, &mut summary, cancel).await;
        self.run_serial(dir_ops, &mut summary, cancel).await;
        self.run_serial(renames, &mut summary, cancel).await;
        self.run_parallel(transfers, &mut summary, cancel).await;
        self.run_serial(dir_deletes, &mut summary, cancel).await;

        if cancel.is_cancelled() {
            summary.status = RunStatus::Aborted;
        } else if summary.status != RunStatus::Error {
            summary.status = if summary.items_failed > 0 {
                RunStatus::Problem
            } else {
                RunStatus::Success
            };
        }

        info!(
            folder = %self.ctx.folder,
            status = ?summary.status,
            completed = summary.items_completed,
            failed = summary.items_failed,
            bytes = summary.bytes_transferred,
            "Propagation finished"
        );
        summary
    }

    /// Ignore/error items produced by discovery: reported, never executed.
    fn report_passive(&self, summary: &mut SyncRunSummary, item: SyncFileItem) {
        match item.instruction {
            Instruction::Ignore => {
                if let Some(reason) = &item.error_string {
                    summary.record_error(ErrorClass::Ignored, reason);
                }
                self.emit_status(&item.path, FileStatus::Excluded);
            }
            Instruction::Error => {
                summary.items_total += 1;
                summary.items_failed += 1;
                if let Some(reason) = &item.error_string {
                    summary.record_error(ErrorClass::Normal, reason);
                }
                self.emit_status(&item.path, FileStatus::Error);
            }
            _ => return,
        }
        let _ = self.ctx.events.send(SyncEvent::ItemCompleted {
            folder: self.ctx.folder.clone(),
            item: Box::new(item),
        });
    }

    async fn run_serial(
        &self,
        items: Vec<SyncFileItem>,
        summary: &mut SyncRunSummary,
        cancel: &CancellationToken,
    ) {
        for item in items {
            if cancel.is_cancelled() || summary.status == RunStatus::Error {
                return;
            }
            let result = self.run_item(item, cancel).await;
            self.apply(result, summary, cancel).await;
        }
    }

    async fn run_parallel(
        &self,
        items: Vec<SyncFileItem>,
        summary: &mut SyncRunSummary,
        cancel: &CancellationToken,
    ) {
        let parallelism = if self.ctx.remote.is_http2() {
            self.ctx.config.propagator.parallelism_http2
        } else {
            self.ctx.config.propagator.parallelism
        };
        let limiter = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut join_set = tokio::task::JoinSet::new();

        for item in items {
            if cancel.is_cancelled() || summary.status == RunStatus::Error {
                break;
            }
            let permit = match limiter.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let this = Self {
                ctx: Arc::clone(&self.ctx),
            };
            let job_cancel = cancel.clone();
            join_set.spawn(async move {
                let result = this.run_item(item, &job_cancel).await;
                drop(permit);
                result
            });

            // fold in whatever already finished, keeping journal writes
            // on this task only
            while let Some(done) = join_set.try_join_next() {
                if let Ok(result) = done {
                    self.apply(result, summary, cancel).await;
                }
            }
        }

        while let Some(done) = join_set.join_next().await {
            if let Ok(result) = done {
                self.apply(result, summary, cancel).await;
            }
        }
    }

    /// Folds one job result into the summary and the journal.
    async fn apply(
        &self,
        result: JobResult,
        summary: &mut SyncRunSummary,
        cancel: &CancellationToken,
    ) {
        let JobResult {
            item,
            succeeded,
            update,
            bytes,
            another_sync_needed,
            blacklist,
            fatal,
        } = result;

        summary.bytes_transferred += bytes;
        summary.another_sync_needed |= another_sync_needed;

        if let Some(reason) = fatal {
            error!(folder = %self.ctx.folder, path = %item.path, %reason, "Fatal error, aborting run");
            summary.status = RunStatus::Error;
            summary.record_error(ErrorClass::Fatal, &reason);
            cancel.cancel();
        }

        if succeeded {
            summary.items_completed += 1;
            // completion drops any stale blacklist entry and commits the
            // reconciled state
            if let Err(e) = self.ctx.journal.clear_blacklist(&item.path).await {
                warn!(path = %item.path, error = %e, "Failed to clear blacklist entry");
            }
            let applied = match update {
                JournalUpdate::None => Ok(()),
                JournalUpdate::Put(record) => self.ctx.journal.put(&record).await,
                JournalUpdate::Delete(path) => self.ctx.journal.delete(&path).await,
                JournalUpdate::RenameSubtree { from, to, record } => {
                    match self.ctx.journal.rename_subtree(&from, &to).await {
                        Ok(()) => self.ctx.journal.put(&record).await,
                        Err(e) => Err(e),
                    }
                }
            };
            if let Err(e) = applied {
                error!(path = %item.path, error = %e, "Journal write failed");
                summary.status = RunStatus::Error;
                summary.record_error(ErrorClass::Fatal, &e.to_string());
                cancel.cancel();
            }
            if item.status == ItemStatus::Conflict {
                summary.record_error(
                    ErrorClass::Conflict,
                    item.error_string.as_deref().unwrap_or("conflict"),
                );
                self.emit_status(&item.path, FileStatus::Warning);
            } else {
                self.emit_status(&item.path, FileStatus::Ok);
            }
        } else if item.status == ItemStatus::Blacklisted {
            summary.record_error(
                ErrorClass::Ignored,
                &format!("{} is blacklisted after earlier errors", item.path),
            );
            self.emit_status(&item.path, FileStatus::Warning);
        } else if item.status == ItemStatus::Conflict {
            summary.record_error(
                ErrorClass::Conflict,
                item.error_string.as_deref().unwrap_or("conflict"),
            );
            self.emit_status(&item.path, FileStatus::Warning);
        } else if item.status.is_error() {
            summary.items_failed += 1;
            // fatal errors were already recorded under their own class
            if item.status != ItemStatus::FatalError {
                let class = match item.status {
                    ItemStatus::SoftError | ItemStatus::FileLocked => ErrorClass::SoftLocal,
                    _ => ErrorClass::Normal,
                };
                summary.record_error(
                    class,
                    item.error_string.as_deref().unwrap_or("unknown error"),
                );
            }
            if let Some((category, message, until)) = blacklist {
                if let Err(e) = self
                    .ctx
                    .journal
                    .record_failure(&item.path, category, &message, until)
                    .await
                {
                    warn!(path = %item.path, error = %e, "Failed to record blacklist entry");
                }
            }
            self.emit_status(&item.path, FileStatus::Error);
        }

        let _ = self.ctx.events.send(SyncEvent::ItemCompleted {
            folder: self.ctx.folder.clone(),
            item: Box::new(item),
        });
    }

    fn emit_status(&self, path: &RelativePath, status: FileStatus) {
        let unchanged = self
            .ctx
            .statuses
            .insert(path.clone(), status)
            .is_some_and(|prev| prev == status);
        if unchanged {
            return;
        }
        let _ = self.ctx.events.send(SyncEvent::FileStatusChanged {
            folder: self.ctx.folder.clone(),
            path: path.clone(),
            status,
        });
    }

    fn emit_progress(&self, path: &RelativePath, done: u64, total: u64) {
        let _ = self.ctx.events.send(SyncEvent::TransmissionProgress {
            folder: self.ctx.folder.clone(),
            progress: TransmissionProgress {
                path: path.clone(),
                bytes_done: done,
                bytes_total: total,
            },
        });
    }

    fn absolute(&self, path: &RelativePath) -> PathBuf {
        let mut abs = self.ctx.root.clone();
        if !path.is_root() {
            abs.push(path.as_str());
        }
        abs
    }

    /// Runs one item end to end, classifying any error into an item
    /// status plus blacklist/fatal intents; never touches the journal.
    async fn run_item(&self, mut item: SyncFileItem, cancel: &CancellationToken) -> JobResult {
        let mut result = JobResult {
            item: SyncFileItem::new(RelativePath::root(), ItemKind::File),
            succeeded: false,
            update: JournalUpdate::None,
            bytes: 0,
            another_sync_needed: false,
            blacklist: None,
            fatal: None,
        };

        // an active blacklist entry suppresses the attempt entirely
        match self.ctx.journal.blacklist_entry(&item.path).await {
            Ok(Some(entry)) if entry.is_active(Utc::now()) => {
                debug!(path = %item.path, "Skipping blacklisted item");
                item.status = ItemStatus::Blacklisted;
                item.error_string = Some(entry.error_string);
                result.item = item;
                return result;
            }
            _ => {}
        }

        let priority = item.instruction == Instruction::Sync;
        let Some(_permit) = self.ctx.queue.acquire(priority, cancel).await else {
            item.status = ItemStatus::SoftError;
            item.error_string = Some("aborted before dispatch".to_string());
            result.item = item;
            return result;
        };

        self.emit_status(&item.path, FileStatus::Sync);

        match self.execute_item(&mut item, cancel).await {
            Ok((update, bytes, follow_up)) => {
                if item.status == ItemStatus::NoStatus {
                    item.status = ItemStatus::Success;
                }
                result.succeeded = true;
                result.update = update;
                result.bytes = bytes;
                result.another_sync_needed = follow_up;
            }
            Err(err) => self.classify_failure(&mut item, &mut result, err),
        }

        result.item = item;
        result
    }

    /// Maps an execution error onto item status, blacklist and fatal
    /// intents.
    fn classify_failure(&self, item: &mut SyncFileItem, result: &mut JobResult, err: SyncError) {
        match &err {
            SyncError::Remote(RemoteError::PreconditionFailed) => {
                // lost update: the server changed underneath us; the next
                // run reconciles it as a proper conflict
                item.status = ItemStatus::Conflict;
                item.http_error_code = Some(412);
                item.error_string = Some(format!("{} changed on the server meanwhile", item.path));
                result.another_sync_needed = true;
            }
            SyncError::Remote(RemoteError::Locked { retry_after }) => {
                item.status = ItemStatus::FileLocked;
                item.http_error_code = Some(423);
                let until = (*retry_after)
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .map(|d| Utc::now() + d);
                item.lock_expire_time = until;
                item.error_string = Some(format!("{} is locked on the server", item.path));
                result.blacklist = Some((
                    BlacklistCategory::FileLocked,
                    item.error_string.clone().unwrap_or_default(),
                    until,
                ));
            }
            SyncError::Remote(remote) if remote.is_fatal() => {
                item.status = ItemStatus::FatalError;
                item.http_error_code = remote.status();
                item.error_string = Some(remote.to_string());
                result.fatal = Some(remote.to_string());
            }
            SyncError::Remote(remote) => {
                item.status = ItemStatus::NormalError;
                item.http_error_code = remote.status();
                item.error_string = Some(remote.to_string());
                result.blacklist = Some((
                    BlacklistCategory::Normal,
                    remote.to_string(),
                    None,
                ));
            }
            SyncError::Io { .. } => {
                item.status = ItemStatus::SoftError;
                item.error_string = Some(err.to_string());
                result.blacklist = Some((
                    BlacklistCategory::SoftLocal,
                    err.to_string(),
                    None,
                ));
            }
            SyncError::Aborted => {
                item.status = ItemStatus::SoftError;
                item.error_string = Some("sync aborted".to_string());
            }
            other => {
                item.status = ItemStatus::FatalError;
                item.error_string = Some(other.to_string());
                result.fatal = Some(other.to_string());
            }
        }
        debug!(path = %item.path, status = ?item.status, "Item failed");
    }

    /// Dispatches on the instruction; returns the journal update, the
    /// bytes moved and whether a follow-up sync is wanted.
    async fn execute_item(
        &self,
        item: &mut SyncFileItem,
        cancel: &CancellationToken,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Aborted);
        }
        match (item.instruction, item.direction) {
            (Instruction::Remove, Direction::Up) => self.remove_remote(item, cancel).await,
            (Instruction::Remove, _) => self.remove_local(item).await,
            (Instruction::Rename, Direction::Up) => self.rename_remote(item, cancel).await,
            (Instruction::Rename, _) => self.rename_local(item).await,
            (Instruction::New, Direction::Up) if item.kind.is_directory() => {
                self.mkdir_remote(item, cancel).await
            }
            (Instruction::New | Instruction::Conflict, Direction::Up) => {
                self.upload(item, cancel).await
            }
            (Instruction::New, Direction::Down) if item.kind.is_directory() => {
                self.mkdir_local(item).await
            }
            (Instruction::New, Direction::Down) if item.kind == ItemKind::VirtualFile => {
                self.materialize(item).await
            }
            (Instruction::New | Instruction::Sync, Direction::Down) => {
                self.download(item, cancel, false).await
            }
            (Instruction::Conflict, Direction::Down) => self.resolve_conflict(item, cancel).await,
            (Instruction::TypeChange, _) => self.type_change(item, cancel).await,
            (Instruction::UpdateMetadata, _) => self.update_metadata(item).await,
            (Instruction::UpdateVfsMetadata, _) => self.update_vfs_metadata(item).await,
            (instruction, direction) => Err(SyncError::Fatal(format!(
                "unexpected plan entry {instruction:?}/{direction:?} for {}",
                item.path
            ))),
        }
    }

    /// Retry ladder for transient remote errors; everything else returns
    /// immediately.
    async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut f: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RemoteError>>,
    {
        let delays = &self.ctx.config.propagator.retry_delays_ms;
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Aborted);
            }
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < delays.len() => {
                    let delay = Duration::from_millis(delays[attempt]);
                    warn!(operation, attempt, delay_ms = delays[attempt], error = %err, "Transient error, retrying");
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    async fn remove_remote(
        &self,
        item: &SyncFileItem,
        cancel: &CancellationToken,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        let path = item.path.clone();
        match self
            .with_retry(cancel, "delete", || self.ctx.remote.delete(&path))
            .await
        {
            Ok(()) => {}
            // already gone on the server: the goal state is reached
            Err(SyncError::Remote(RemoteError::NotFound(_))) => {}
            Err(e) => return Err(e),
        }
        debug!(path = %item.path, "Removed on server");
        Ok((JournalUpdate::Delete(item.path.clone()), 0, false))
    }

    async fn remove_local(
        &self,
        item: &SyncFileItem,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        let abs = self.absolute(&item.path);
        let attempt = if item.kind.is_directory() {
            tokio::fs::remove_dir(&abs).await
        } else {
            match tokio::fs::remove_file(&abs).await {
                // a dehydrated file lives under its placeholder name
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let placeholder = item
                        .path
                        .file_name()
                        .map(|n| abs.with_file_name(self.ctx.vfs.placeholder_file_name(n)));
                    match placeholder {
                        Some(p) if p != abs => tokio::fs::remove_file(&p).await,
                        _ => Err(e),
                    }
                }
                other => other,
            }
        };

        match attempt {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if item.kind.is_directory() => {
                // locally added or excluded entries keep the directory
                // alive; they will be rediscovered as new
                warn!(path = %item.path, error = %e, "Directory not removed (still has entries)");
                return Ok((JournalUpdate::Delete(item.path.clone()), 0, true));
            }
            Err(e) => return Err(SyncError::io(&abs, e)),
        }
        debug!(path = %item.path, "Removed locally");
        Ok((JournalUpdate::Delete(item.path.clone()), 0, false))
    }

    async fn rename_remote(
        &self,
        item: &SyncFileItem,
        cancel: &CancellationToken,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        let target = item
            .rename_target
            .clone()
            .ok_or_else(|| SyncError::Fatal(format!("rename of {} without target", item.path)))?;
        let from = item.path.clone();
        let outcome = self
            .with_retry(cancel, "move", || self.ctx.remote.move_item(&from, &target))
            .await?;

        let mut record = JournalRecord::from_completed_item(item, self.inode_of(&target).await);
        record.path = target.clone();
        record.etag = Some(outcome.etag);
        if let Some(fid) = outcome.file_id {
            record.file_id = Some(fid);
        }
        info!(from = %item.path, to = %target, "Moved on server");
        Ok((
            JournalUpdate::RenameSubtree {
                from: item.path.clone(),
                to: target,
                record,
            },
            0,
            false,
        ))
    }

    async fn rename_local(
        &self,
        item: &SyncFileItem,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        let target = item
            .rename_target
            .clone()
            .ok_or_else(|| SyncError::Fatal(format!("rename of {} without target", item.path)))?;
        let from_abs = self.absolute(&item.path);
        let to_abs = self.absolute(&target);
        if let Some(parent) = to_abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::io(parent, e))?;
        }
        tokio::fs::rename(&from_abs, &to_abs)
            .await
            .map_err(|e| SyncError::io(&from_abs, e))?;

        let mut record = JournalRecord::from_completed_item(item, self.inode_of(&target).await);
        record.path = target.clone();
        info!(from = %item.path, to = %target, "Moved locally");
        Ok((
            JournalUpdate::RenameSubtree {
                from: item.path.clone(),
                to: target,
                record,
            },
            0,
            false,
        ))
    }

    async fn mkdir_remote(
        &self,
        item: &mut SyncFileItem,
        cancel: &CancellationToken,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        let path = item.path.clone();
        let outcome = self
            .with_retry(cancel, "mkcol", || self.ctx.remote.mkcol(&path))
            .await?;
        item.etag = Some(outcome.etag.clone());
        item.file_id = outcome.file_id.clone();

        let mut record = JournalRecord::from_completed_item(item, self.inode_of(&item.path).await);
        record.kind = ItemKind::Directory;
        debug!(path = %item.path, "Directory created on server");
        Ok((JournalUpdate::Put(record), 0, false))
    }

    async fn mkdir_local(
        &self,
        item: &SyncFileItem,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        let abs = self.absolute(&item.path);
        tokio::fs::create_dir_all(&abs)
            .await
            .map_err(|e| SyncError::io(&abs, e))?;
        let mut record = JournalRecord::from_completed_item(item, self.inode_of(&item.path).await);
        record.kind = ItemKind::Directory;
        debug!(path = %item.path, "Directory created locally");
        Ok((JournalUpdate::Put(record), 0, false))
    }

    async fn materialize(
        &self,
        item: &SyncFileItem,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        self.ctx
            .vfs
            .materialize_placeholder(
                &item.path,
                &PlaceholderMetadata {
                    size: item.size,
                    mtime: item.mtime,
                    etag: item.etag.clone(),
                    file_id: item.file_id.clone(),
                },
            )
            .await
            .map_err(|e| {
                SyncError::io(self.absolute(&item.path), std::io::Error::other(e.to_string()))
            })?;

        let mut record = JournalRecord::from_completed_item(item, 0);
        record.kind = ItemKind::VirtualFile;
        Ok((JournalUpdate::Put(record), 0, false))
    }

    async fn update_metadata(
        &self,
        item: &SyncFileItem,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        let record = JournalRecord::from_completed_item(item, self.inode_of(&item.path).await);
        Ok((JournalUpdate::Put(record), 0, false))
    }

    async fn update_vfs_metadata(
        &self,
        item: &SyncFileItem,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        self.ctx
            .vfs
            .materialize_placeholder(
                &item.path,
                &PlaceholderMetadata {
                    size: item.size,
                    mtime: item.mtime,
                    etag: item.etag.clone(),
                    file_id: item.file_id.clone(),
                },
            )
            .await
            .map_err(|e| {
                SyncError::io(self.absolute(&item.path), std::io::Error::other(e.to_string()))
            })?;
        let mut record = JournalRecord::from_completed_item(item, 0);
        record.kind = ItemKind::VirtualFile;
        record.has_dirty_placeholder_metadata = false;
        Ok((JournalUpdate::Put(record), 0, false))
    }

    async fn type_change(
        &self,
        item: &mut SyncFileItem,
        cancel: &CancellationToken,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        // remove whatever is there, then create the other kind
        let abs = self.absolute(&item.path);
        match tokio::fs::symlink_metadata(&abs).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&abs)
                .await
                .map_err(|e| SyncError::io(&abs, e))?,
            Ok(_) => tokio::fs::remove_file(&abs)
                .await
                .map_err(|e| SyncError::io(&abs, e))?,
            Err(_) => {}
        }
        if item.kind.is_directory() {
            self.mkdir_local(item).await
        } else {
            self.download(item, cancel, false).await
        }
    }

    /// Conflict with both sides present: the local version moves aside as
    /// a conflict copy, the server version lands at the original path.
    /// The conflict copy uploads on the follow-up run.
    async fn resolve_conflict(
        &self,
        item: &mut SyncFileItem,
        cancel: &CancellationToken,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        let abs = self.absolute(&item.path);
        if tokio::fs::symlink_metadata(&abs).await.is_ok() {
            let conflict = crate::conflict::conflict_path(&item.path, Utc::now(), |candidate| {
                self.absolute(candidate).exists()
            });
            let conflict_abs = self.absolute(&conflict);
            tokio::fs::rename(&abs, &conflict_abs)
                .await
                .map_err(|e| SyncError::io(&abs, e))?;
            self.ctx
                .journal
                .record_conflict(&conflict, &item.path)
                .await?;
            info!(path = %item.path, conflict = %conflict, "Local version preserved as conflict copy");
            item.error_string = Some(format!("conflict, local copy kept as {conflict}"));
        }

        let (update, bytes, _) = self.download(item, cancel, true).await?;
        item.status = ItemStatus::Conflict;
        Ok((update, bytes, true))
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    async fn download(
        &self,
        item: &mut SyncFileItem,
        cancel: &CancellationToken,
        _conflict_fixup: bool,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        let abs = self.absolute(&item.path);
        let parent = abs
            .parent()
            .ok_or_else(|| SyncError::Fatal(format!("{} has no parent", item.path)))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::io(parent, e))?;

        // resume from the recorded scratch file when the etag still
        // matches; otherwise start a fresh temp file
        let name = item.path.file_name().unwrap_or_default();
        let expected_etag = item.etag.clone();
        let (tmp_name, resume_offset) = match self.ctx.journal.download_info(&item.path).await? {
            Some(info) if Some(&info.etag) == expected_etag.as_ref() => {
                let tmp_abs = parent.join(&info.tmp_file);
                let offset = tokio::fs::metadata(&tmp_abs).await.map(|m| m.len()).unwrap_or(0);
                (info.tmp_file, offset)
            }
            _ => {
                let tmp = format!(".{name}.~{:08x}", rand::random::<u32>());
                if let Some(etag) = &expected_etag {
                    self.ctx
                        .journal
                        .set_download_info(&DownloadInfo {
                            path: item.path.clone(),
                            tmp_file: tmp.clone(),
                            etag: etag.clone(),
                        })
                        .await?;
                }
                (tmp, 0)
            }
        };
        let tmp_abs = parent.join(&tmp_name);

        let pacer = self.ctx.bandwidth.pacer(Direction::Down);
        let path = item.path.clone();
        let total = item.size;
        let events_ctx = Arc::clone(&self.ctx);
        let progress_path = item.path.clone();
        let progress: davsync_core::ports::ProgressFn = Box::new(move |done, _| {
            let _ = events_ctx.events.send(SyncEvent::TransmissionProgress {
                folder: events_ctx.folder.clone(),
                progress: TransmissionProgress {
                    path: progress_path.clone(),
                    bytes_done: done,
                    bytes_total: total,
                },
            });
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Aborted),
            outcome = self.ctx.remote.download(
                &path,
                &tmp_abs,
                resume_offset,
                expected_etag.as_ref(),
                pacer,
                Some(progress),
            ) => outcome.map_err(SyncError::from)?,
        };

        // verify length and, when the server told us one, the checksum
        if item.size > 0 && outcome.size != item.size {
            tokio::fs::remove_file(&tmp_abs).await.ok();
            self.ctx.journal.remove_download_info(&item.path).await?;
            return Err(SyncError::Remote(RemoteError::Protocol(format!(
                "size mismatch for {}: got {}, expected {}",
                item.path, outcome.size, item.size
            ))));
        }
        let expected_sum = item.checksum.clone().or(outcome.checksum.clone());
        if let Some(expected) = &expected_sum {
            if expected.algorithm == ChecksumAlgorithm::Sha256 {
                let tmp_rel = tmp_rel_for(parent, &self.ctx.root, &tmp_name, &item.path);
                if let Some(actual) =
                    checksum_of(&self.ctx.root, &tmp_rel, expected.algorithm).await?
                {
                    if actual != *expected {
                        tokio::fs::remove_file(&tmp_abs).await.ok();
                        self.ctx.journal.remove_download_info(&item.path).await?;
                        return Err(SyncError::Remote(RemoteError::Protocol(format!(
                            "checksum mismatch for {}",
                            item.path
                        ))));
                    }
                }
            }
        }

        // keep the server mtime so future change detection agrees
        if let Some(mtime) = item.mtime {
            set_file_mtime(&tmp_abs, mtime).await;
        }

        // the placeholder, if any, is replaced by the hydrated file
        let placeholder_abs = item
            .path
            .file_name()
            .map(|n| abs.with_file_name(self.ctx.vfs.placeholder_file_name(n)))
            .filter(|p| *p != abs);

        tokio::fs::rename(&tmp_abs, &abs)
            .await
            .map_err(|e| SyncError::io(&tmp_abs, e))?;
        if let Some(ph) = placeholder_abs {
            tokio::fs::remove_file(ph).await.ok();
        }
        self.ctx.journal.remove_download_info(&item.path).await?;

        item.etag = Some(outcome.etag.clone());
        if outcome.file_id.is_some() {
            item.file_id = outcome.file_id.clone();
        }
        if item.checksum.is_none() {
            item.checksum = outcome.checksum.clone();
        }
        item.size = outcome.size;
        item.kind = ItemKind::File;

        let record = JournalRecord::from_completed_item(item, self.inode_of(&item.path).await);
        debug!(path = %item.path, bytes = outcome.size, "Downloaded");
        Ok((JournalUpdate::Put(record), outcome.size, false))
    }

    async fn upload(
        &self,
        item: &mut SyncFileItem,
        cancel: &CancellationToken,
    ) -> Result<(JournalUpdate, u64, bool), SyncError> {
        let abs = self.absolute(&item.path);
        let meta = tokio::fs::metadata(&abs)
            .await
            .map_err(|e| SyncError::io(&abs, e))?;
        let size = meta.len();
        item.size = size;
        item.mtime = meta.modified().ok().map(DateTime::<Utc>::from);

        let checksum = match self.ctx.capabilities.preferred_checksum() {
            Some(ChecksumAlgorithm::Sha256) => {
                checksum_of(&self.ctx.root, &item.path, ChecksumAlgorithm::Sha256).await?
            }
            _ => None,
        };

        let chunked = size >= self.ctx.config.chunks.chunk_threshold_bytes
            && self.ctx.capabilities.preferred_chunk_dialect().is_some();

        let outcome = if chunked {
            self.upload_chunked(item, &abs, size, checksum.clone(), cancel)
                .await?
        } else {
            let data = Bytes::from(
                tokio::fs::read(&abs)
                    .await
                    .map_err(|e| SyncError::io(&abs, e))?,
            );
            let path = item.path.clone();
            let if_match = item.etag.clone();
            let mtime = item.mtime;
            self.with_retry(cancel, "put", || {
                self.ctx.remote.put_file(
                    &path,
                    data.clone(),
                    if_match.as_ref(),
                    mtime,
                    self.ctx.bandwidth.pacer(Direction::Up),
                )
            })
            .await?
        };

        item.etag = Some(outcome.etag);
        if outcome.file_id.is_some() {
            item.file_id = outcome.file_id;
        }
        item.checksum = checksum;

        let mut record = JournalRecord::from_completed_item(item, inode_of_meta(&meta));
        record.content_checksum = item.checksum.clone();
        self.emit_progress(&item.path, size, size);
        debug!(path = %item.path, bytes = size, "Uploaded");
        Ok((JournalUpdate::Put(record), size, false))
    }

    /// Chunked upload with journaled resumption: the server's committed
    /// offset decides where to continue, so acknowledged chunks are never
    /// retransmitted.
    async fn upload_chunked(
        &self,
        item: &SyncFileItem,
        abs: &std::path::Path,
        size: u64,
        checksum: Option<Checksum>,
        cancel: &CancellationToken,
    ) -> Result<davsync_core::ports::PutOutcome, SyncError> {
        let chunks = &self.ctx.config.chunks;
        let caps = &self.ctx.capabilities.chunking_ng;
        let min_chunk = chunks.min_chunk_size_bytes.max(caps.min_chunk_size);
        let max_chunk = if caps.enabled {
            chunks.max_chunk_size_bytes.min(caps.max_chunk_size)
        } else {
            chunks.max_chunk_size_bytes
        };
        let target = Duration::from_secs(if caps.enabled {
            caps.target_chunk_upload_duration
        } else {
            chunks.target_chunk_duration_secs
        });

        // reuse a journaled session when it still matches this version of
        // the file
        let existing = self.ctx.journal.upload_info(&item.path).await?;
        let reusable = existing.filter(|info| {
            info.size == size
                && info.mtime.map(|m| m.timestamp()) == item.mtime.map(|m| m.timestamp())
        });

        let (session, mut offset) = match reusable {
            Some(info) => match self.ctx.remote.transfer_offset(&info.session).await {
                Ok(committed) => {
                    info!(
                        path = %item.path,
                        committed,
                        "Resuming chunked upload"
                    );
                    (info.session, committed)
                }
                Err(RemoteError::NotFound(_)) => {
                    self.ctx.journal.remove_upload_info(&item.path).await?;
                    let session = self
                        .with_retry(cancel, "create-transfer", || {
                            self.ctx.remote.create_transfer(&item.path, size)
                        })
                        .await?;
                    (session, 0)
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                let session = self
                    .with_retry(cancel, "create-transfer", || {
                        self.ctx.remote.create_transfer(&item.path, size)
                    })
                    .await?;
                (session, 0)
            }
        };

        self.ctx
            .journal
            .set_upload_info(&UploadInfo {
                path: item.path.clone(),
                transfer_id: session.id.clone(),
                session: session.clone(),
                committed: offset,
                mtime: item.mtime,
                size,
            })
            .await?;

        let mut file = tokio::fs::File::open(abs)
            .await
            .map_err(|e| SyncError::io(abs, e))?;
        let mut chunk_size = chunks.initial_chunk_size_bytes.clamp(min_chunk, max_chunk);

        while offset < size {
            if cancel.is_cancelled() {
                return Err(SyncError::Aborted);
            }
            let this_chunk = chunk_size.min(size - offset);
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| SyncError::io(abs, e))?;
            let mut buf = vec![0u8; this_chunk as usize];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| SyncError::io(abs, e))?;
            let data = Bytes::from(buf);

            let started = Instant::now();
            let chunk_offset = offset;
            self.with_retry(cancel, "upload-chunk", || {
                self.ctx.remote.upload_chunk(
                    &session,
                    chunk_offset,
                    data.clone(),
                    self.ctx.bandwidth.pacer(Direction::Up),
                )
            })
            .await?;
            let elapsed = started.elapsed();

            offset += this_chunk;
            self.ctx
                .journal
                .set_upload_info(&UploadInfo {
                    path: item.path.clone(),
                    transfer_id: session.id.clone(),
                    session: session.clone(),
                    committed: offset,
                    mtime: item.mtime,
                    size,
                })
                .await?;
            self.emit_progress(&item.path, offset, size);

            chunk_size = next_chunk_size(chunk_size, elapsed, target, min_chunk, max_chunk);
        }

        let outcome = self
            .with_retry(cancel, "finalize-transfer", || {
                self.ctx.remote.finalize_transfer(
                    &session,
                    &item.path,
                    FinalizeArgs {
                        total_size: size,
                        if_match: item.etag.clone(),
                        mtime: item.mtime,
                        checksum: checksum.clone(),
                    },
                )
            })
            .await?;

        self.ctx.journal.remove_upload_info(&item.path).await?;
        Ok(outcome)
    }

    async fn inode_of(&self, path: &RelativePath) -> u64 {
        tokio::fs::symlink_metadata(self.absolute(path))
            .await
            .map(|m| inode_of_meta(&m))
            .unwrap_or(0)
    }
}

/// Scales the chunk size towards the target duration, bounded to a factor
/// of two per step and clamped to the advertised window.
pub(crate) fn next_chunk_size(
    previous: u64,
    elapsed: Duration,
    target: Duration,
    min: u64,
    max: u64,
) -> u64 {
    if elapsed.is_zero() {
        return previous.clamp(min, max);
    }
    let factor = (target.as_secs_f64() / elapsed.as_secs_f64()).clamp(0.5, 2.0);
    ((previous as f64 * factor) as u64).clamp(min, max)
}

#[cfg(unix)]
fn inode_of_meta(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of_meta(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Relative path of the scratch file, for checksum verification.
fn tmp_rel_for(
    parent: &std::path::Path,
    root: &std::path::Path,
    tmp_name: &str,
    fallback: &RelativePath,
) -> RelativePath {
    parent
        .strip_prefix(root)
        .ok()
        .and_then(|p| p.to_str())
        .and_then(|p| {
            if p.is_empty() {
                RelativePath::new(tmp_name).ok()
            } else {
                RelativePath::new(format!("{p}/{tmp_name}")).ok()
            }
        })
        .unwrap_or_else(|| fallback.clone())
}

async fn set_file_mtime(path: &std::path::Path, mtime: DateTime<Utc>) {
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(std::time::SystemTime::from(mtime))
    })
    .await;
    if let Ok(Err(e)) = result {
        warn!(error = %e, "Failed to set file mtime");
    }
}

/// Computes a SHA-256 over arbitrary bytes, for tests and verification.
#[allow(dead_code)]
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
