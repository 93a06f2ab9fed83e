//! Discovery - the three-way reconciler
//!
//! Joins the local snapshot, the remote snapshot and the journal into an
//! ordered plan of sync items. For every path seen in any input exactly
//! one item is emitted.
//!
//! The classification matrix (L = local, R = remote, J = journal):
//!
//! | L | R | J | decision |
//! |---|---|---|----------|
//! | - | - | - | (not visited) |
//! | x | - | - | new, up |
//! | - | x | - | new, down |
//! | x | x | - | conflict unless identical by checksum |
//! | x | - | x | remove down if local unchanged, else conflict |
//! | - | x | x | remove up if remote unchanged, else conflict |
//! | x | x | x | change rules (mtime/size vs etag) |
//! | - | - | x | purge journal entry |
//!
//! Before a delete/create pair is classified, it is cross-referenced by
//! file id (remote side) or inode (local side); a match collapses the
//! pair into a single rename with no data movement.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, trace};

use davsync_core::config::VfsMode;
use davsync_core::domain::{
    Checksum, ChecksumAlgorithm, Direction, Instruction, ItemKind, ItemStatus, JournalRecord,
    RelativePath, RemotePermissions, SyncFileItem,
};
use davsync_core::ports::RemoteEntry;

use crate::error::SyncError;
use crate::exclude::ExcludeClass;
use crate::scanner::{LocalEntry, LocalSnapshot};

/// The ordered output of one discovery pass.
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub items: Vec<SyncFileItem>,
    /// Journal rows whose path disappeared on both sides.
    pub journal_purges: Vec<RelativePath>,
    /// New remote directories above the size limit, awaiting a decision.
    pub new_big_folders: Vec<RelativePath>,
}

impl SyncPlan {
    /// Items that actually perform work.
    pub fn propagating_items(&self) -> impl Iterator<Item = &SyncFileItem> {
        self.items.iter().filter(|i| i.needs_propagation())
    }
}

/// Reconciler configuration for one run.
pub struct Discovery {
    pub root: PathBuf,
    pub vfs_mode: VfsMode,
    /// Exclude matcher, applied to remote-only names (the scanner already
    /// filtered the local side).
    pub excludes: Option<std::sync::Arc<crate::exclude::ExcludeEngine>>,
    /// Never-sync subtrees.
    pub blacklist: BTreeSet<RelativePath>,
    /// Explicit includes; bypass the big-folder guard.
    pub whitelist: BTreeSet<RelativePath>,
    /// Big folders awaiting a user decision.
    pub undecided: BTreeSet<RelativePath>,
    /// Bytes above which a new remote directory needs confirmation;
    /// `None` disables the guard.
    pub big_folder_limit: Option<u64>,
    /// Placeholders to hydrate this run (pins and explicit requests).
    pub eager_hydrations: BTreeSet<RelativePath>,
}

impl Discovery {
    /// Runs the reconciliation.
    pub async fn discover(
        &self,
        local: &LocalSnapshot,
        remote: &BTreeMap<RelativePath, RemoteEntry>,
        journal: &BTreeMap<RelativePath, JournalRecord>,
    ) -> Result<SyncPlan, SyncError> {
        let mut plan = SyncPlan::default();
        let mut consumed: BTreeSet<RelativePath> = BTreeSet::new();
        let mut items: Vec<SyncFileItem> = Vec::new();

        // ----- move detection -------------------------------------------
        let remote_new_by_file_id: HashMap<&str, &RemoteEntry> = remote
            .values()
            .filter(|e| !journal.contains_key(&e.path))
            .map(|e| (e.file_id.as_str(), e))
            .collect();
        let local_new_by_inode: HashMap<u64, &LocalEntry> = local
            .entries
            .values()
            .filter(|e| e.inode != 0 && !journal.contains_key(&e.path))
            .map(|e| (e.inode, e))
            .collect();

        for (path, record) in journal {
            if self.is_blacklisted(path) {
                continue;
            }
            let local_gone = !local.entries.contains_key(path);
            let remote_gone = !remote.contains_key(path);

            // remote-side move: the file id reappeared elsewhere
            if remote_gone && !local_gone {
                if let Some(fid) = &record.file_id {
                    if let Some(target) = remote_new_by_file_id.get(fid.as_str()) {
                        let mut item = SyncFileItem::new(path.clone(), record.kind)
                            .with_instruction(Instruction::Rename, Direction::Down);
                        item.rename_target = Some(target.path.clone());
                        item.size = target.size;
                        item.mtime = target.mtime;
                        item.etag = Some(target.etag.clone());
                        item.file_id = Some(target.file_id.clone());
                        item.remote_permissions = target.permissions;
                        info!(from = %path, to = %target.path, "Remote rename detected");
                        consumed.insert(path.clone());
                        consumed.insert(target.path.clone());
                        items.push(item);
                        continue;
                    }
                }
            }

            // local-side move: the inode reappeared elsewhere, unchanged
            if local_gone && !remote_gone {
                if let Some(entry) = local_new_by_inode.get(&record.inode) {
                    let unchanged = entry.size == record.size
                        && timestamps_equal(entry.mtime, record.mtime);
                    if unchanged && !consumed.contains(&entry.path) {
                        if record.remote_permissions.can_rename()
                            && record.remote_permissions.can_move()
                        {
                            let mut item = SyncFileItem::new(path.clone(), record.kind)
                                .with_instruction(Instruction::Rename, Direction::Up);
                            item.rename_target = Some(entry.path.clone());
                            item.size = record.size;
                            item.mtime = record.mtime;
                            item.etag = record.etag.clone();
                            item.file_id = record.file_id.clone();
                            item.remote_permissions = record.remote_permissions;
                            info!(from = %path, to = %entry.path, "Local rename detected");
                            consumed.insert(path.clone());
                            consumed.insert(entry.path.clone());
                            items.push(item);
                            continue;
                        }
                        // forbidden moves degrade to remove + new
                        debug!(path = %path, "Move not permitted, degrading to remove+new");
                    }
                }
            }
        }

        // ----- per-path classification ----------------------------------
        let mut all_paths: BTreeSet<RelativePath> = BTreeSet::new();
        all_paths.extend(local.entries.keys().cloned());
        all_paths.extend(remote.keys().cloned());
        all_paths.extend(journal.keys().cloned());

        let mut ignored_subtrees: BTreeSet<RelativePath> = BTreeSet::new();

        for path in &all_paths {
            if consumed.contains(path) {
                continue;
            }
            if ignored_subtrees.iter().any(|d| d.is_ancestor_of(path)) {
                items.push(self.ignore_item(path, local, remote, "parent awaits confirmation"));
                continue;
            }

            let l = local.entries.get(path);
            let r = remote.get(path);
            let j = journal.get(path);

            // excluded names on the server are never brought down
            if l.is_none() && j.is_none() {
                if let (Some(excludes), Some(entry)) = (&self.excludes, r) {
                    let class = excludes.classify(path);
                    if class.is_excluded() {
                        if entry.kind.is_directory() {
                            ignored_subtrees.insert(path.clone());
                        }
                        let mut item = SyncFileItem::new(path.clone(), entry.kind)
                            .with_instruction(Instruction::Ignore, Direction::None);
                        item.status = ItemStatus::FileIgnored;
                        item.error_string = Some(format!("excluded ({class:?})"));
                        items.push(item);
                        continue;
                    }
                }
            }

            if self.is_blacklisted(path) {
                // existing local copies are queued for removal on the
                // first application of the blacklist
                if l.is_some() || j.is_some() {
                    let kind = l.map(|e| e.kind).or(j.map(|r| r.kind)).unwrap_or_default();
                    items.push(
                        SyncFileItem::new(path.clone(), kind)
                            .with_instruction(Instruction::Remove, Direction::Down),
                    );
                } else {
                    items.push(self.ignore_item(path, local, remote, "selective sync"));
                }
                continue;
            }
            if self
                .undecided
                .iter()
                .any(|d| d == path || d.is_ancestor_of(path))
            {
                items.push(self.ignore_item(path, local, remote, "awaiting confirmation"));
                continue;
            }

            let item = match (l, r, j) {
                (None, None, None) => continue,
                (None, None, Some(_)) => {
                    plan.journal_purges.push(path.clone());
                    trace!(path = %path, "Journal entry purged (gone on both sides)");
                    SyncFileItem::new(path.clone(), ItemKind::File)
                }
                (Some(l), None, None) => self.classify_local_new(l, remote, journal),
                (None, Some(r), None) => {
                    self.classify_remote_new(r, &mut plan, &mut ignored_subtrees)
                }
                (Some(l), Some(r), None) => self.classify_both_new(l, r).await?,
                (Some(l), None, Some(j)) => classify_remote_removed(l, j),
                (None, Some(r), Some(j)) => classify_local_removed(r, j),
                (Some(l), Some(r), Some(j)) => self.classify_changed(l, r, j).await?,
            };
            items.push(item);
        }

        // excluded paths and case-collision losers are reported as
        // informational ignores
        for (path, class) in &local.excluded {
            if *class == ExcludeClass::ExcludedTransient {
                // may resolve by the next run; stay silent
                continue;
            }
            let mut item = SyncFileItem::new(path.clone(), ItemKind::File)
                .with_instruction(Instruction::Ignore, Direction::None);
            item.status = ItemStatus::FileIgnored;
            item.error_string = Some(format!("excluded ({class:?})"));
            items.push(item);
        }
        for path in &local.collisions {
            let mut item = SyncFileItem::new(path.clone(), ItemKind::File)
                .with_instruction(Instruction::Ignore, Direction::None);
            item.status = ItemStatus::FileIgnored;
            item.error_string = Some("case clash with a sibling entry".to_string());
            items.push(item);
        }

        plan.items = order_plan(items);
        debug!(
            items = plan.items.len(),
            purges = plan.journal_purges.len(),
            big_folders = plan.new_big_folders.len(),
            "Discovery produced plan"
        );
        Ok(plan)
    }

    fn is_blacklisted(&self, path: &RelativePath) -> bool {
        self.blacklist
            .iter()
            .any(|b| b == path || b.is_ancestor_of(path))
    }

    fn ignore_item(
        &self,
        path: &RelativePath,
        local: &LocalSnapshot,
        remote: &BTreeMap<RelativePath, RemoteEntry>,
        reason: &str,
    ) -> SyncFileItem {
        let kind = local
            .entries
            .get(path)
            .map(|e| e.kind)
            .or_else(|| remote.get(path).map(|e| e.kind))
            .unwrap_or_default();
        let mut item = SyncFileItem::new(path.clone(), kind)
            .with_instruction(Instruction::Ignore, Direction::None);
        item.status = ItemStatus::FileIgnored;
        item.error_string = Some(reason.to_string());
        item
    }

    /// L only: a new local entry to upload.
    fn classify_local_new(
        &self,
        l: &LocalEntry,
        remote: &BTreeMap<RelativePath, RemoteEntry>,
        journal: &BTreeMap<RelativePath, JournalRecord>,
    ) -> SyncFileItem {
        if l.kind == ItemKind::SoftLink {
            let mut item = SyncFileItem::new(l.path.clone(), l.kind)
                .with_instruction(Instruction::Ignore, Direction::None);
            item.status = ItemStatus::FileIgnored;
            item.error_string = Some("symbolic links are not synchronized".to_string());
            return item;
        }
        if l.is_placeholder {
            // a placeholder without remote or journal backing carries no
            // content to upload
            let mut item = SyncFileItem::new(l.path.clone(), ItemKind::VirtualFile)
                .with_instruction(Instruction::Ignore, Direction::None);
            item.status = ItemStatus::FileIgnored;
            item.error_string = Some("orphaned placeholder".to_string());
            return item;
        }

        let parent_perms = parent_permissions(&l.path, remote, journal);
        let allowed = if l.kind.is_directory() {
            parent_perms.can_add_subdirs()
        } else {
            parent_perms.can_add_file()
        };

        let mut item = SyncFileItem::new(l.path.clone(), l.kind);
        item.size = l.size;
        item.mtime = l.mtime;
        item.remote_permissions = parent_perms;
        if allowed {
            item.instruction = Instruction::New;
            item.direction = Direction::Up;
        } else {
            item.instruction = Instruction::Error;
            item.status = ItemStatus::NormalError;
            item.error_string = Some(format!(
                "not allowed to add entries to the parent of {}",
                l.path
            ));
        }
        item
    }

    /// R only: new on the server; download, place a placeholder, or park
    /// behind the big-folder guard.
    fn classify_remote_new(
        &self,
        r: &RemoteEntry,
        plan: &mut SyncPlan,
        ignored_subtrees: &mut BTreeSet<RelativePath>,
    ) -> SyncFileItem {
        let whitelisted = self
            .whitelist
            .iter()
            .any(|w| w == &r.path || w.is_ancestor_of(&r.path));

        if r.kind.is_directory() && !whitelisted {
            if let Some(limit) = self.big_folder_limit {
                if r.size > limit {
                    info!(path = %r.path, size = r.size, "New big remote folder needs confirmation");
                    plan.new_big_folders.push(r.path.clone());
                    ignored_subtrees.insert(r.path.clone());
                    let mut item = SyncFileItem::new(r.path.clone(), r.kind)
                        .with_instruction(Instruction::Ignore, Direction::None);
                    item.status = ItemStatus::FileIgnored;
                    item.error_string = Some("awaiting confirmation (big folder)".to_string());
                    return item;
                }
            }
        }

        let mut item = SyncFileItem::new(r.path.clone(), r.kind)
            .with_instruction(Instruction::New, Direction::Down);
        item.size = r.size;
        item.mtime = r.mtime;
        item.etag = Some(r.etag.clone());
        item.file_id = Some(r.file_id.clone());
        item.checksum = r.checksum.clone();
        item.remote_permissions = r.permissions;

        // in suffix mode new remote files materialize as placeholders
        // unless something pinned them local
        if self.vfs_mode == VfsMode::Suffix
            && r.kind == ItemKind::File
            && !self.eager_hydrations.contains(&r.path)
        {
            item.kind = ItemKind::VirtualFile;
        }
        item
    }

    /// L and R with no journal: same name appeared on both sides.
    async fn classify_both_new(
        &self,
        l: &LocalEntry,
        r: &RemoteEntry,
    ) -> Result<SyncFileItem, SyncError> {
        let mut item = SyncFileItem::new(l.path.clone(), r.kind);
        item.size = r.size;
        item.mtime = r.mtime;
        item.etag = Some(r.etag.clone());
        item.file_id = Some(r.file_id.clone());
        item.checksum = r.checksum.clone();
        item.remote_permissions = r.permissions;

        if l.kind.is_directory() && r.kind.is_directory() {
            // the directory exists on both sides; just reconcile metadata
            item.instruction = Instruction::UpdateMetadata;
            item.direction = Direction::Down;
            return Ok(item);
        }
        if l.kind.is_directory() != r.kind.is_directory() {
            item.instruction = Instruction::TypeChange;
            item.direction = Direction::Down;
            return Ok(item);
        }

        if let Some(remote_sum) = &r.checksum {
            if let Some(local_sum) =
                checksum_of(&self.root, &l.path, remote_sum.algorithm).await?
            {
                if local_sum == *remote_sum {
                    item.instruction = Instruction::UpdateMetadata;
                    item.direction = Direction::Down;
                    return Ok(item);
                }
            }
        }

        item.instruction = Instruction::Conflict;
        item.direction = Direction::Down;
        Ok(item)
    }

    /// L, R and J all present: the change rules.
    async fn classify_changed(
        &self,
        l: &LocalEntry,
        r: &RemoteEntry,
        j: &JournalRecord,
    ) -> Result<SyncFileItem, SyncError> {
        if l.kind.is_directory() != r.kind.is_directory() {
            let mut item = SyncFileItem::new(l.path.clone(), r.kind)
                .with_instruction(Instruction::TypeChange, Direction::Down);
            item.size = r.size;
            item.etag = Some(r.etag.clone());
            item.file_id = Some(r.file_id.clone());
            item.remote_permissions = r.permissions;
            return Ok(item);
        }

        let local_changed = local_changed(l, j);
        let remote_changed = r.etag.as_str() != j.etag.as_ref().map(|e| e.as_str()).unwrap_or("");

        let mut item = SyncFileItem::new(l.path.clone(), l.kind);
        item.file_id = Some(r.file_id.clone());
        item.remote_permissions = r.permissions;

        match (local_changed, remote_changed) {
            (false, false) => {
                // hydration requests surface even without a change
                if l.is_placeholder && self.eager_hydrations.contains(&l.path) {
                    item.instruction = Instruction::Sync;
                    item.direction = Direction::Down;
                    item.kind = ItemKind::File;
                    item.size = r.size;
                    item.mtime = r.mtime;
                    item.etag = Some(r.etag.clone());
                    item.checksum = r.checksum.clone();
                } else if r.permissions != j.remote_permissions {
                    item.instruction = if l.is_placeholder {
                        Instruction::UpdateVfsMetadata
                    } else {
                        Instruction::UpdateMetadata
                    };
                    item.direction = Direction::Down;
                    item.size = j.size;
                    item.mtime = j.mtime;
                    item.etag = Some(r.etag.clone());
                } else {
                    item.instruction = Instruction::None;
                }
            }
            (true, false) => {
                if !r.permissions.can_write() {
                    item.instruction = Instruction::Error;
                    item.status = ItemStatus::NormalError;
                    item.error_string =
                        Some(format!("not allowed to modify {} on the server", l.path));
                } else {
                    item.instruction = Instruction::New;
                    item.direction = Direction::Up;
                    item.size = l.size;
                    item.mtime = l.mtime;
                    // If-Match precondition against lost updates
                    item.etag = j.etag.clone();
                }
            }
            (false, true) => {
                item.size = r.size;
                item.mtime = r.mtime;
                item.etag = Some(r.etag.clone());
                item.checksum = r.checksum.clone();
                if l.is_placeholder && !self.eager_hydrations.contains(&l.path) {
                    // metadata-only for dehydrated files; never hydrates
                    item.instruction = Instruction::UpdateVfsMetadata;
                    item.direction = Direction::Down;
                    item.kind = ItemKind::VirtualFile;
                } else if l.is_placeholder {
                    item.instruction = Instruction::Sync;
                    item.direction = Direction::Down;
                    item.kind = ItemKind::File;
                } else if l.kind.is_directory() {
                    item.instruction = Instruction::UpdateMetadata;
                    item.direction = Direction::Down;
                } else {
                    item.instruction = Instruction::New;
                    item.direction = Direction::Down;
                }
            }
            (true, true) => {
                // both sides changed; identical content resolves silently
                if let Some(remote_sum) = &r.checksum {
                    if let Some(local_sum) =
                        checksum_of(&self.root, &l.path, remote_sum.algorithm).await?
                    {
                        if local_sum == *remote_sum {
                            item.instruction = Instruction::UpdateMetadata;
                            item.direction = Direction::Down;
                            item.size = r.size;
                            item.mtime = r.mtime;
                            item.etag = Some(r.etag.clone());
                            item.checksum = r.checksum.clone();
                            return Ok(item);
                        }
                    }
                }
                item.instruction = Instruction::Conflict;
                item.direction = Direction::Down;
                item.size = r.size;
                item.mtime = r.mtime;
                item.etag = Some(r.etag.clone());
                item.checksum = r.checksum.clone();
            }
        }
        Ok(item)
    }
}

/// R gone, J present: the server deleted it (or we conflict).
fn classify_remote_removed(l: &LocalEntry, j: &JournalRecord) -> SyncFileItem {
    let mut item = SyncFileItem::new(l.path.clone(), l.kind);
    if local_changed(l, j) {
        // deleted remotely but modified here: local content wins and is
        // re-uploaded as new
        item.instruction = Instruction::Conflict;
        item.direction = Direction::Up;
        item.size = l.size;
        item.mtime = l.mtime;
        item.status = ItemStatus::Restoration;
    } else {
        item.instruction = Instruction::Remove;
        item.direction = Direction::Down;
    }
    item
}

/// L gone, J present: deleted locally (or the server changed it since).
fn classify_local_removed(r: &RemoteEntry, j: &JournalRecord) -> SyncFileItem {
    let remote_changed = r.etag.as_str() != j.etag.as_ref().map(|e| e.as_str()).unwrap_or("");
    let mut item = SyncFileItem::new(r.path.clone(), r.kind);
    item.etag = Some(r.etag.clone());
    item.file_id = Some(r.file_id.clone());
    item.remote_permissions = r.permissions;

    if remote_changed {
        // deletion raced a server-side change; the server version comes
        // back down
        item.instruction = Instruction::Conflict;
        item.direction = Direction::Down;
        item.size = r.size;
        item.mtime = r.mtime;
        item.checksum = r.checksum.clone();
    } else if !r.permissions.can_delete() {
        item.instruction = Instruction::Error;
        item.status = ItemStatus::NormalError;
        item.error_string = Some(format!("not allowed to delete {} on the server", r.path));
    } else {
        item.instruction = Instruction::Remove;
        item.direction = Direction::Up;
    }
    item
}

/// Local change test: mtime or size for hydrated files; placeholders only
/// change through their dirty-metadata flag.
fn local_changed(l: &LocalEntry, j: &JournalRecord) -> bool {
    if l.is_placeholder {
        return j.has_dirty_placeholder_metadata;
    }
    if l.kind.is_directory() {
        return false;
    }
    l.size != j.size || !timestamps_equal(l.mtime, j.mtime)
}

/// Second-granularity timestamp comparison; filesystems and servers do
/// not agree on sub-second precision.
fn timestamps_equal(
    a: Option<chrono::DateTime<chrono::Utc>>,
    b: Option<chrono::DateTime<chrono::Utc>>,
) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.timestamp() == b.timestamp(),
        (None, None) => true,
        _ => false,
    }
}

/// Permissions governing creation under `path`'s parent.
fn parent_permissions(
    path: &RelativePath,
    remote: &BTreeMap<RelativePath, RemoteEntry>,
    journal: &BTreeMap<RelativePath, JournalRecord>,
) -> RemotePermissions {
    let mut cursor = path.parent();
    while let Some(parent) = cursor {
        if parent.is_root() {
            break;
        }
        if let Some(entry) = remote.get(&parent) {
            return entry.permissions;
        }
        if let Some(record) = journal.get(&parent) {
            return record.remote_permissions;
        }
        cursor = parent.parent();
    }
    RemotePermissions::unrestricted()
}

/// Computes a checksum of the local file, `None` when unreadable.
pub(crate) async fn checksum_of(
    root: &Path,
    path: &RelativePath,
    algorithm: ChecksumAlgorithm,
) -> Result<Option<Checksum>, SyncError> {
    // only SHA-256 is computed locally; other algorithms skip the
    // comparison rather than guessing
    if algorithm != ChecksumAlgorithm::Sha256 {
        return Ok(None);
    }
    let abs = root.join(path.as_str());
    let Ok(mut file) = tokio::fs::File::open(&abs).await else {
        return Ok(None);
    };
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| SyncError::io(&abs, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    Ok(Checksum::new(algorithm, hex).ok())
}

/// Orders a plan so that:
/// - removals come first, descendants before their directories
/// - renames run next, before any creation may take a freed name
/// - creations follow in path order, parents before descendants
/// - non-propagating items trail, in path order
fn order_plan(mut items: Vec<SyncFileItem>) -> Vec<SyncFileItem> {
    fn rank(item: &SyncFileItem) -> u8 {
        match item.instruction {
            Instruction::Remove => 0,
            Instruction::Rename => 1,
            Instruction::New
            | Instruction::Sync
            | Instruction::TypeChange
            | Instruction::Conflict
            | Instruction::UpdateMetadata
            | Instruction::UpdateVfsMetadata => 2,
            Instruction::None | Instruction::Ignore | Instruction::Error => 3,
        }
    }

    items.sort_by(|a, b| {
        rank(a).cmp(&rank(b)).then_with(|| {
            if rank(a) == 0 {
                // removals deepest first
                b.path
                    .depth()
                    .cmp(&a.path.depth())
                    .then_with(|| a.path.cmp(&b.path))
            } else {
                a.path.cmp(&b.path)
            }
        })
    });
    items
}
