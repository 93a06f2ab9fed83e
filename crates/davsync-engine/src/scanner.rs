//! Local scanner
//!
//! Walks the local tree and produces the local half of discovery's input.
//! Two modes, chosen per run by the folder loop:
//!
//! - `filesystem_only`: walk everything under the root
//! - `database_and_filesystem`: replay the journal and re-walk only the
//!   subpaths the filesystem watcher reported as touched
//!
//! Symlinks are reported but never followed. On case-insensitive
//! filesystems, entries differing only in case are collisions: the first
//! name in byte order wins, the rest are reported and skipped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use davsync_core::domain::{ItemKind, JournalRecord, RelativePath};
use davsync_core::ports::Vfs;

use crate::error::SyncError;
use crate::exclude::{ExcludeClass, ExcludeEngine};

/// Metadata of one visited local entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEntry {
    pub path: RelativePath,
    pub kind: ItemKind,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub inode: u64,
    pub is_placeholder: bool,
}

/// How to obtain the local snapshot for this run.
#[derive(Debug, Clone)]
pub enum DiscoveryMode {
    /// Walk the entire tree.
    FilesystemOnly,
    /// Replay the journal, re-walking only the touched subpaths.
    DatabaseAndFilesystem { touched: BTreeSet<RelativePath> },
}

/// Everything one local discovery pass produced.
#[derive(Debug, Default)]
pub struct LocalSnapshot {
    pub entries: BTreeMap<RelativePath, LocalEntry>,
    pub excluded: Vec<(RelativePath, ExcludeClass)>,
    /// Case-fold losers; never propagated.
    pub collisions: Vec<RelativePath>,
}

/// Walks one sync root.
pub struct LocalScanner<'a> {
    root: &'a Path,
    excludes: &'a ExcludeEngine,
    vfs: &'a dyn Vfs,
}

impl<'a> LocalScanner<'a> {
    pub fn new(root: &'a Path, excludes: &'a ExcludeEngine, vfs: &'a dyn Vfs) -> Self {
        Self {
            root,
            excludes,
            vfs,
        }
    }

    pub async fn scan(
        &self,
        mode: &DiscoveryMode,
        journal: &BTreeMap<RelativePath, JournalRecord>,
    ) -> Result<LocalSnapshot, SyncError> {
        let mut snapshot = LocalSnapshot::default();

        match mode {
            DiscoveryMode::FilesystemOnly => {
                self.walk(self.root.to_path_buf(), RelativePath::root(), &mut snapshot)
                    .await?;
            }
            DiscoveryMode::DatabaseAndFilesystem { touched } => {
                // everything not touched is served from the journal
                for record in journal.values() {
                    snapshot.entries.insert(
                        record.path.clone(),
                        LocalEntry {
                            path: record.path.clone(),
                            kind: record.kind,
                            size: record.size,
                            mtime: record.mtime,
                            inode: record.inode,
                            is_placeholder: record.kind == ItemKind::VirtualFile,
                        },
                    );
                }

                for subpath in minimal_cover(touched) {
                    // drop stale replayed state under the touched path
                    snapshot
                        .entries
                        .retain(|p, _| p != &subpath && !subpath.is_ancestor_of(p));

                    let abs = self.absolute(&subpath);
                    // a dehydrated file lives on disk under its
                    // placeholder decoration
                    let placeholder_abs = subpath.file_name().map(|name| {
                        abs.with_file_name(self.vfs.placeholder_file_name(name))
                    });
                    match tokio::fs::symlink_metadata(&abs).await {
                        Ok(meta) if meta.is_dir() => {
                            self.walk(abs, subpath, &mut snapshot).await?;
                        }
                        Ok(meta) => {
                            if let Some(entry) =
                                self.entry_for(&subpath, &meta, false, &mut snapshot)
                            {
                                snapshot.entries.insert(entry.path.clone(), entry);
                            }
                        }
                        Err(_) => {
                            let Some(ph) = placeholder_abs else { continue };
                            if let Ok(meta) = tokio::fs::symlink_metadata(&ph).await {
                                if let Some(entry) =
                                    self.entry_for(&subpath, &meta, true, &mut snapshot)
                                {
                                    snapshot.entries.insert(entry.path.clone(), entry);
                                }
                            }
                            // otherwise vanished; absence is the observation
                        }
                    }
                }
            }
        }

        debug!(
            entries = snapshot.entries.len(),
            excluded = snapshot.excluded.len(),
            collisions = snapshot.collisions.len(),
            "Local discovery finished"
        );
        Ok(snapshot)
    }

    fn absolute(&self, path: &RelativePath) -> PathBuf {
        let mut abs = self.root.to_path_buf();
        if !path.is_root() {
            abs.push(path.as_str());
        }
        abs
    }

    /// Builds an entry, consulting the exclude engine; `None` when the
    /// path is excluded (recorded in the snapshot).
    fn entry_for(
        &self,
        path: &RelativePath,
        meta: &std::fs::Metadata,
        is_placeholder: bool,
        snapshot: &mut LocalSnapshot,
    ) -> Option<LocalEntry> {
        let class = self.excludes.classify(path);
        if class.is_excluded() {
            snapshot.excluded.push((path.clone(), class));
            return None;
        }

        let kind = if meta.file_type().is_symlink() {
            ItemKind::SoftLink
        } else if meta.is_dir() {
            ItemKind::Directory
        } else if is_placeholder {
            ItemKind::VirtualFile
        } else {
            ItemKind::File
        };

        Some(LocalEntry {
            path: path.clone(),
            kind,
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime: meta.modified().ok().map(DateTime::<Utc>::from),
            inode: inode_of(meta),
            is_placeholder,
        })
    }

    fn walk<'b>(
        &'b self,
        dir_abs: PathBuf,
        dir_rel: RelativePath,
        snapshot: &'b mut LocalSnapshot,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SyncError>> + Send + 'b>>
    {
        Box::pin(async move {
            let mut reader = match tokio::fs::read_dir(&dir_abs).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    warn!(dir = %dir_abs.display(), "Traversal denied");
                    snapshot
                        .excluded
                        .push((dir_rel, ExcludeClass::ExcludedTraversalDenied));
                    return Ok(());
                }
                Err(e) => return Err(SyncError::io(dir_abs, e)),
            };

            // collect and sort for deterministic output and collision
            // detection in byte order
            let mut children: Vec<(String, std::fs::Metadata)> = Vec::new();
            while let Some(entry) = reader
                .next_entry()
                .await
                .map_err(|e| SyncError::io(&dir_abs, e))?
            {
                let Ok(name) = entry.file_name().into_string() else {
                    warn!(entry = ?entry.file_name(), "Skipping non-UTF8 name");
                    continue;
                };
                match tokio::fs::symlink_metadata(entry.path()).await {
                    Ok(meta) => children.push((name, meta)),
                    Err(e) => warn!(name, error = %e, "Failed to stat, skipping"),
                }
            }
            children.sort_by(|a, b| a.0.cmp(&b.0));

            let mut seen_folded: HashMap<String, ()> = HashMap::new();

            for (name, meta) in children {
                let is_placeholder = self.vfs.is_placeholder(&name);
                let logical_name = if is_placeholder {
                    self.vfs.underlying_file_name(&name)
                } else {
                    name.clone()
                };

                let path = match dir_rel.join(&logical_name) {
                    Ok(path) => path,
                    Err(_) => {
                        let approx = dir_rel
                            .join(&logical_name.replace(['/', '\\'], "_"))
                            .unwrap_or_else(|_| dir_rel.clone());
                        snapshot
                            .excluded
                            .push((approx, ExcludeClass::ExcludedInvalidName));
                        continue;
                    }
                };

                // case-collision: the first name in byte order wins
                if seen_folded
                    .insert(logical_name.to_lowercase(), ())
                    .is_some()
                {
                    warn!(path = %path, "Case collision, entry skipped");
                    snapshot.collisions.push(path);
                    continue;
                }

                let Some(local) = self.entry_for(&path, &meta, is_placeholder, snapshot) else {
                    continue;
                };
                let descend = local.kind == ItemKind::Directory;
                snapshot.entries.insert(path.clone(), local);

                if descend {
                    self.walk(dir_abs.join(&name), path, snapshot).await?;
                }
            }

            Ok(())
        })
    }
}

/// Reduces a touched set to its outermost members.
fn minimal_cover(touched: &BTreeSet<RelativePath>) -> Vec<RelativePath> {
    let mut cover: Vec<RelativePath> = Vec::new();
    for path in touched {
        if !cover.iter().any(|c| c == path || c.is_ancestor_of(path)) {
            cover.push(path.clone());
        }
    }
    cover
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use davsync_vfs::VfsOff;

    fn rel(p: &str) -> RelativePath {
        RelativePath::new(p).unwrap()
    }

    fn excludes() -> ExcludeEngine {
        ExcludeEngine::new(&[], false, Some(".sync_testjournal.db"))
    }

    #[tokio::test]
    async fn test_full_walk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
        std::fs::write(dir.path().join("d/b.txt"), b"x").unwrap();
        std::fs::write(dir.path().join(".sync_testjournal.db"), b"junk").unwrap();

        let ex = excludes();
        let vfs = VfsOff;
        let scanner = LocalScanner::new(dir.path(), &ex, &vfs);
        let snapshot = scanner
            .scan(&DiscoveryMode::FilesystemOnly, &BTreeMap::new())
            .await
            .unwrap();

        let paths: Vec<_> = snapshot.entries.keys().map(|p| p.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "d", "d/b.txt"]);
        assert_eq!(snapshot.entries[&rel("a.txt")].size, 10);
        assert_eq!(snapshot.entries[&rel("d")].kind, ItemKind::Directory);
        assert_eq!(snapshot.excluded.len(), 1);
        assert!(snapshot.entries[&rel("a.txt")].mtime.is_some());
        #[cfg(unix)]
        assert!(snapshot.entries[&rel("a.txt")].inode != 0);
    }

    #[tokio::test]
    async fn test_symlinks_reported_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::fs::write(dir.path().join("real/inner.txt"), b"x").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        let ex = excludes();
        let vfs = VfsOff;
        let scanner = LocalScanner::new(dir.path(), &ex, &vfs);
        let snapshot = scanner
            .scan(&DiscoveryMode::FilesystemOnly, &BTreeMap::new())
            .await
            .unwrap();

        #[cfg(unix)]
        {
            assert_eq!(snapshot.entries[&rel("link")].kind, ItemKind::SoftLink);
            assert!(!snapshot.entries.contains_key(&rel("link/inner.txt")));
        }
        assert!(snapshot.entries.contains_key(&rel("real/inner.txt")));
    }

    #[tokio::test]
    async fn test_database_and_filesystem_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("touched")).unwrap();
        std::fs::write(dir.path().join("touched/new.txt"), b"new").unwrap();

        // the journal claims an untouched file and a stale touched one
        let mut journal = BTreeMap::new();
        let mut untouched = JournalRecord::new(rel("kept.txt"), ItemKind::File);
        untouched.size = 7;
        journal.insert(untouched.path.clone(), untouched);
        let stale = JournalRecord::new(rel("touched/gone.txt"), ItemKind::File);
        journal.insert(stale.path.clone(), stale);

        let ex = excludes();
        let vfs = VfsOff;
        let scanner = LocalScanner::new(dir.path(), &ex, &vfs);
        let mode = DiscoveryMode::DatabaseAndFilesystem {
            touched: [rel("touched")].into_iter().collect(),
        };
        let snapshot = scanner.scan(&mode, &journal).await.unwrap();

        // untouched file replayed from the journal even though not on disk
        assert_eq!(snapshot.entries[&rel("kept.txt")].size, 7);
        // the touched subtree reflects the filesystem
        assert!(snapshot.entries.contains_key(&rel("touched/new.txt")));
        assert!(!snapshot.entries.contains_key(&rel("touched/gone.txt")));
    }

    #[tokio::test]
    async fn test_case_collision_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("File.txt"), b"upper").unwrap();
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.path().join("file.txt"))
        {
            Ok(_) => {}
            // case-insensitive filesystem; nothing to test here
            Err(_) => return,
        }

        let ex = excludes();
        let vfs = VfsOff;
        let scanner = LocalScanner::new(dir.path(), &ex, &vfs);
        let snapshot = scanner
            .scan(&DiscoveryMode::FilesystemOnly, &BTreeMap::new())
            .await
            .unwrap();

        // byte order puts "File.txt" first
        assert!(snapshot.entries.contains_key(&rel("File.txt")));
        assert!(!snapshot.entries.contains_key(&rel("file.txt")));
        assert_eq!(snapshot.collisions, vec![rel("file.txt")]);
    }

    #[test]
    fn test_minimal_cover() {
        let touched: BTreeSet<_> = [rel("a"), rel("a/b/c"), rel("d")].into_iter().collect();
        assert_eq!(minimal_cover(&touched), vec![rel("a"), rel("d")]);
    }
}
