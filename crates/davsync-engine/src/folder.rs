//! Folder - the per-root sync loop
//!
//! Owns one (local root, remote root, journal) triple. Triggers a sync
//! run on a root-etag change, on settled watcher events, on user request,
//! and as a bounded follow-up after runs that ask for one. All journal
//! writes for the root happen on this owner task.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use davsync_core::config::{Config, VfsMode};
use davsync_core::domain::{
    Etag, ItemKind, JournalRecord, PinState, RelativePath,
};
use davsync_core::events::{FileStatus, RunStatus, SyncEvent, SyncRunSummary};
use davsync_core::ports::{RemoteClient, RemoteEntry, RemoteError, Vfs};
use davsync_journal::{BlacklistCategory, SelectiveSyncList, SyncJournal};

use crate::bandwidth::BandwidthManager;
use crate::discovery::Discovery;
use crate::error::SyncError;
use crate::exclude::ExcludeEngine;
use crate::lister::RemoteLister;
use crate::propagator::{Propagator, PropagatorContext};
use crate::queue::JobQueue;
use crate::scanner::{DiscoveryMode, LocalScanner};
use crate::watcher::{relative_to_root, ChangeEvent, DebouncedChangeQueue};

/// Lifecycle of a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    NotYetStarted,
    SyncPrepare,
    SyncRunning,
    SyncAbortRequested,
    Success,
    Problem,
    Error,
    SetupError,
    Paused,
}

/// User-facing control of a folder loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderCommand {
    Pause,
    Resume,
    /// Bypasses the etag poll and runs immediately.
    SyncNow,
    /// Cancels the running sync.
    Abort,
}

/// One sync root and its loop state.
pub struct Folder {
    name: String,
    root: PathBuf,
    remote: Arc<dyn RemoteClient>,
    journal: Arc<SyncJournal>,
    vfs: Arc<dyn Vfs>,
    excludes: Arc<ExcludeEngine>,
    bandwidth: Arc<BandwidthManager>,
    queue: Arc<JobQueue>,
    config: Config,
    events: broadcast::Sender<SyncEvent>,
    statuses: Arc<DashMap<RelativePath, FileStatus>>,
    state: Mutex<FolderState>,
    last_root_etag: Mutex<Option<Etag>>,
    last_full_walk: Mutex<Option<Instant>>,
    touched: Mutex<BTreeSet<RelativePath>>,
    /// Hydration requests forwarded by the VFS strategy.
    hydration_rx: Mutex<Option<mpsc::UnboundedReceiver<RelativePath>>>,
    first_sync: AtomicBool,
    watcher_healthy: AtomicBool,
}

impl Folder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        remote: Arc<dyn RemoteClient>,
        journal: Arc<SyncJournal>,
        vfs: Arc<dyn Vfs>,
        excludes: Arc<ExcludeEngine>,
        queue: Arc<JobQueue>,
        config: Config,
        first_sync: bool,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(512);
        let bandwidth = Arc::new(BandwidthManager::new(&config.bandwidth));
        Arc::new(Self {
            name: name.into(),
            root: root.into(),
            remote,
            journal,
            vfs,
            excludes,
            bandwidth,
            queue,
            config,
            events,
            statuses: Arc::new(DashMap::new()),
            state: Mutex::new(FolderState::NotYetStarted),
            last_root_etag: Mutex::new(None),
            last_full_walk: Mutex::new(None),
            touched: Mutex::new(BTreeSet::new()),
            hydration_rx: Mutex::new(None),
            first_sync: AtomicBool::new(first_sync),
            watcher_healthy: AtomicBool::new(false),
        })
    }

    /// Connects the VFS hydration request channel.
    pub fn set_hydration_receiver(&self, rx: mpsc::UnboundedReceiver<RelativePath>) {
        *self.hydration_rx.lock().unwrap() = Some(rx);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> FolderState {
        *self.state.lock().unwrap()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last published status of a path, for overlay providers.
    pub fn file_status(&self, path: &RelativePath) -> FileStatus {
        self.statuses
            .get(path)
            .map(|s| *s)
            .unwrap_or(FileStatus::None)
    }

    fn set_state(&self, state: FolderState) {
        *self.state.lock().unwrap() = state;
    }

    /// Appends watcher paths to the touched set for the next run.
    pub fn note_touched(&self, event: &ChangeEvent) {
        let mut touched = self.touched.lock().unwrap();
        for abs in event.touched_paths() {
            if let Some(rel) = relative_to_root(&self.root, abs) {
                if !rel.is_root() {
                    touched.insert(rel);
                }
            }
        }
    }

    /// Picks the discovery mode for this run and drains the touched set.
    fn choose_mode(&self) -> DiscoveryMode {
        let touched: BTreeSet<RelativePath> =
            std::mem::take(&mut *self.touched.lock().unwrap());

        let full_interval =
            Duration::from_secs(self.config.sync.full_local_discovery_interval_secs);
        let walk_fresh = self
            .last_full_walk
            .lock()
            .unwrap()
            .map(|at| at.elapsed() < full_interval)
            .unwrap_or(false);

        if !self.first_sync.load(Ordering::Acquire)
            && self.watcher_healthy.load(Ordering::Acquire)
            && walk_fresh
        {
            DiscoveryMode::DatabaseAndFilesystem { touched }
        } else {
            DiscoveryMode::FilesystemOnly
        }
    }

    /// Runs one sync cycle end to end.
    pub async fn sync_once(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<SyncRunSummary, SyncError> {
        self.set_state(FolderState::SyncPrepare);
        let _ = self.events.send(SyncEvent::SyncStarted {
            folder: self.name.clone(),
        });
        self.excludes.reset_cache();

        // the root must exist and be a directory before anything else
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                self.set_state(FolderState::SetupError);
                return Err(SyncError::RootUnusable(format!(
                    "{} is not an accessible directory",
                    self.root.display()
                )));
            }
        }

        // soft-local failures get a fresh chance every run
        self.journal
            .wipe_blacklist_category(BlacklistCategory::SoftLocal)
            .await?;

        let capabilities = match self.remote.capabilities().await {
            Ok(caps) => caps,
            Err(e) => return self.finish_fatal(e.into()),
        };

        // journal snapshot for the three-way join
        let records = self.journal.iterate(&RelativePath::root()).await?;
        let journal_map: BTreeMap<RelativePath, JournalRecord> = records
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();
        let known_dir_etags: BTreeMap<RelativePath, Etag> = journal_map
            .values()
            .filter(|r| r.kind == ItemKind::Directory)
            .filter_map(|r| r.etag.clone().map(|e| (r.path.clone(), e)))
            .collect();

        let mode = self.choose_mode();
        let full_walk = matches!(mode, DiscoveryMode::FilesystemOnly);
        let touched_for_remote: Option<BTreeSet<RelativePath>> = match &mode {
            DiscoveryMode::DatabaseAndFilesystem { touched } => Some(touched.clone()),
            DiscoveryMode::FilesystemOnly => None,
        };
        debug!(folder = %self.name, full_walk, "Discovery mode chosen");

        let scanner = LocalScanner::new(&self.root, &self.excludes, self.vfs.as_ref());
        let local = scanner.scan(&mode, &journal_map).await?;

        let lister = RemoteLister::new(self.remote.as_ref());
        let mut remote_snapshot = match lister
            .list_tree(&known_dir_etags, touched_for_remote.as_ref())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => return self.finish_fatal(e.into()),
        };

        // replay journal state for subtrees the lister pruned
        for pruned in &remote_snapshot.pruned {
            for record in journal_map.values() {
                if pruned.is_ancestor_of(&record.path) {
                    if let Some(entry) = entry_from_record(record) {
                        remote_snapshot.entries.entry(record.path.clone()).or_insert(entry);
                    }
                }
            }
        }

        // selective-sync lists and hydration wishes
        let blacklist: BTreeSet<_> = self
            .journal
            .selective_sync_list(SelectiveSyncList::Blacklist)
            .await?
            .into_iter()
            .collect();
        let whitelist: BTreeSet<_> = self
            .journal
            .selective_sync_list(SelectiveSyncList::Whitelist)
            .await?
            .into_iter()
            .collect();
        let undecided: BTreeSet<_> = self
            .journal
            .selective_sync_list(SelectiveSyncList::Undecided)
            .await?
            .into_iter()
            .collect();

        let mut eager_hydrations: BTreeSet<RelativePath> = BTreeSet::new();
        if let Some(rx) = self.hydration_rx.lock().unwrap().as_mut() {
            while let Ok(path) = rx.try_recv() {
                eager_hydrations.insert(path);
            }
        }
        if self.config.vfs.mode == VfsMode::Suffix {
            for record in journal_map.values() {
                if record.kind == ItemKind::VirtualFile
                    && self.journal.effective_pin_state(&record.path).await?
                        == PinState::AlwaysLocal
                {
                    eager_hydrations.insert(record.path.clone());
                }
            }
        }

        let discovery = Discovery {
            root: self.root.clone(),
            vfs_mode: self.config.vfs.mode,
            excludes: Some(Arc::clone(&self.excludes)),
            blacklist,
            whitelist,
            undecided,
            big_folder_limit: match self.config.sync.big_folder_size_limit_mb {
                0 => None,
                mb => Some(mb * 1024 * 1024),
            },
            eager_hydrations,
        };
        let plan = discovery
            .discover(&local, &remote_snapshot.entries, &journal_map)
            .await?;

        // big folders wait in the undecided list for the user
        for path in &plan.new_big_folders {
            self.journal
                .add_to_selective_sync(SelectiveSyncList::Undecided, path)
                .await?;
            let _ = self.events.send(SyncEvent::NewBigFolder {
                folder: self.name.clone(),
                path: path.clone(),
            });
        }

        self.set_state(FolderState::SyncRunning);
        let propagator = Propagator::new(PropagatorContext {
            folder: self.name.clone(),
            root: self.root.clone(),
            remote: Arc::clone(&self.remote),
            journal: Arc::clone(&self.journal),
            vfs: Arc::clone(&self.vfs),
            bandwidth: Arc::clone(&self.bandwidth),
            queue: Arc::clone(&self.queue),
            events: self.events.clone(),
            statuses: Arc::clone(&self.statuses),
            config: self.config.clone(),
            capabilities,
        });
        let summary = propagator.propagate(plan, cancel).await;

        if full_walk {
            *self.last_full_walk.lock().unwrap() = Some(Instant::now());
        }
        self.first_sync.store(false, Ordering::Release);

        // online-only pins dehydrate once the run settled cleanly
        if summary.status == RunStatus::Success && self.config.vfs.mode == VfsMode::Suffix {
            if let Err(e) = self.dehydration_pass().await {
                warn!(folder = %self.name, error = %e, "Dehydration pass failed");
            }
        }

        self.set_state(match summary.status {
            RunStatus::Success => FolderState::Success,
            RunStatus::Problem => FolderState::Problem,
            RunStatus::Error => FolderState::Error,
            RunStatus::Aborted => FolderState::SyncAbortRequested,
        });
        let _ = self.events.send(SyncEvent::SyncFinished {
            folder: self.name.clone(),
            result: summary.clone(),
        });
        Ok(summary)
    }

    /// Ends the run on a fatal pre-propagation error.
    fn finish_fatal(&self, err: SyncError) -> Result<SyncRunSummary, SyncError> {
        error!(folder = %self.name, error = %err, "Sync run failed before propagation");
        self.set_state(
            if matches!(&err, SyncError::Remote(RemoteError::Unauthorized)) {
                // credential invalidation pauses the folder
                FolderState::Paused
            } else {
                FolderState::Error
            },
        );
        let _ = self.events.send(SyncEvent::SyncFinished {
            folder: self.name.clone(),
            result: SyncRunSummary::aborted(),
        });
        Err(err)
    }

    /// Replaces hydrated online-only files with placeholders.
    async fn dehydration_pass(&self) -> Result<(), SyncError> {
        let records = self.journal.iterate(&RelativePath::root()).await?;
        for record in records {
            if record.kind != ItemKind::File {
                continue;
            }
            if self.journal.effective_pin_state(&record.path).await? != PinState::OnlineOnly {
                continue;
            }
            if let Err(e) = self.vfs.dehydrate(&record.path).await {
                warn!(path = %record.path, error = %e, "Failed to dehydrate");
                continue;
            }
            let mut updated = record.clone();
            updated.kind = ItemKind::VirtualFile;
            self.journal.put(&updated).await?;
        }
        Ok(())
    }

    /// Whether the root etag moved since the last poll.
    async fn root_etag_changed(&self) -> bool {
        match self.remote.root_etag().await {
            Ok(etag) => {
                let mut last = self.last_root_etag.lock().unwrap();
                let changed = last.as_ref() != Some(&etag);
                if changed {
                    info!(folder = %self.name, etag = %etag, "Root etag changed");
                    *last = Some(etag);
                }
                changed
            }
            Err(e) => {
                warn!(folder = %self.name, error = %e, "Etag poll failed");
                false
            }
        }
    }

    /// The long-running loop for this root: etag polling, watcher events,
    /// commands and bounded follow-up syncs.
    pub async fn run_loop(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<FolderCommand>,
        watcher_rx: Option<mpsc::Receiver<ChangeEvent>>,
        cancel: CancellationToken,
    ) {
        let poll_interval = match self.remote.capabilities().await {
            Ok(caps) => caps
                .remote_poll_interval
                .unwrap_or(Duration::from_secs(self.config.sync.poll_interval_secs)),
            Err(_) => Duration::from_secs(self.config.sync.poll_interval_secs),
        };
        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut debounce = DebouncedChangeQueue::new(Duration::from_secs(2));
        let mut debounce_tick = tokio::time::interval(Duration::from_millis(500));
        self.watcher_healthy
            .store(watcher_rx.is_some(), Ordering::Release);
        let (mut watcher_open, mut watcher_rx) = match watcher_rx {
            Some(rx) => (true, rx),
            None => {
                // placeholder channel; the branch below stays disabled
                let (_tx, rx) = mpsc::channel(1);
                (false, rx)
            }
        };

        info!(folder = %self.name, poll_secs = poll_interval.as_secs(), "Folder loop started");

        loop {
            let mut run_wanted = false;

            tokio::select! {
                _ = cancel.cancelled() => break,

                Some(command) = commands.recv() => match command {
                    FolderCommand::Pause => {
                        info!(folder = %self.name, "Paused");
                        self.set_state(FolderState::Paused);
                    }
                    FolderCommand::Resume => {
                        info!(folder = %self.name, "Resumed");
                        self.set_state(FolderState::NotYetStarted);
                        run_wanted = true;
                    }
                    FolderCommand::SyncNow => run_wanted = true,
                    FolderCommand::Abort => {}
                },

                event = watcher_rx.recv(), if watcher_open => match event {
                    Some(change) => {
                        debug!(folder = %self.name, event = ?change, "Watcher event");
                        debounce.push(change);
                    }
                    None => {
                        warn!(folder = %self.name, "Watcher channel closed");
                        self.watcher_healthy.store(false, Ordering::Release);
                        watcher_open = false;
                    }
                },

                _ = debounce_tick.tick() => {
                    let settled = debounce.poll();
                    if !settled.is_empty() {
                        for event in &settled {
                            self.note_touched(event);
                        }
                        run_wanted = true;
                    }
                }

                _ = poll.tick() => {
                    if self.state() != FolderState::Paused && self.root_etag_changed().await {
                        run_wanted = true;
                    }
                }
            }

            if run_wanted && self.state() != FolderState::Paused {
                self.run_with_follow_ups(&mut commands, &cancel).await;
            }
        }

        info!(folder = %self.name, "Folder loop stopped");
    }

    /// Runs a sync and up to `follow_up_limit` immediate follow-ups while
    /// staying responsive to abort/pause commands.
    async fn run_with_follow_ups(
        self: &Arc<Self>,
        commands: &mut mpsc::Receiver<FolderCommand>,
        cancel: &CancellationToken,
    ) {
        let mut follow_ups = 0u32;
        let mut pause_when_done = false;
        loop {
            let run_cancel = cancel.child_token();
            let folder = Arc::clone(self);
            let job_cancel = run_cancel.clone();
            let mut run =
                tokio::spawn(async move { folder.sync_once(&job_cancel).await });

            let outcome = loop {
                tokio::select! {
                    result = &mut run => break result,
                    Some(command) = commands.recv() => match command {
                        FolderCommand::Abort | FolderCommand::Pause => {
                            info!(folder = %self.name, "Abort requested");
                            self.set_state(FolderState::SyncAbortRequested);
                            run_cancel.cancel();
                            pause_when_done = command == FolderCommand::Pause;
                        }
                        _ => {}
                    },
                }
            };

            match outcome {
                Ok(Ok(summary)) => {
                    if summary.another_sync_needed
                        && follow_ups < self.config.sync.follow_up_limit
                        && !cancel.is_cancelled()
                    {
                        follow_ups += 1;
                        debug!(folder = %self.name, follow_ups, "Follow-up sync");
                        continue;
                    }
                }
                Ok(Err(e)) => {
                    error!(folder = %self.name, error = %e, "Sync run failed");
                }
                Err(e) => {
                    error!(folder = %self.name, error = %e, "Sync task panicked");
                    self.set_state(FolderState::Error);
                }
            }
            break;
        }
        if pause_when_done {
            self.set_state(FolderState::Paused);
        }
    }
}

/// Synthesizes the remote entry a pruned subtree's journal row stands for.
fn entry_from_record(record: &JournalRecord) -> Option<RemoteEntry> {
    Some(RemoteEntry {
        path: record.path.clone(),
        kind: match record.kind {
            ItemKind::VirtualFile => ItemKind::File,
            other => other,
        },
        size: record.size,
        mtime: record.mtime,
        etag: record.etag.clone()?,
        file_id: record.file_id.clone()?,
        permissions: record.remote_permissions,
        checksum: record.checksum.clone(),
        is_shared_mount: record.remote_permissions.is_mounted(),
    })
}
