//! Filesystem watching and the debounced touched-set
//!
//! Wraps the `notify` crate to observe the sync root, converting raw OS
//! events into [`ChangeEvent`]s. The [`DebouncedChangeQueue`] coalesces
//! rapid-fire events so the folder loop only reacts once a path has been
//! quiet for the debounce window; settled events become the touched set
//! driving `database_and_filesystem` discovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use davsync_core::domain::RelativePath;

/// A filesystem change observed under the sync root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed { old: PathBuf, new: PathBuf },
}

impl ChangeEvent {
    /// The primary path; for renames the destination.
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) => p,
            ChangeEvent::Modified(p) => p,
            ChangeEvent::Deleted(p) => p,
            ChangeEvent::Renamed { new, .. } => new,
        }
    }

    /// Both paths the event touches.
    pub fn touched_paths(&self) -> Vec<&Path> {
        match self {
            ChangeEvent::Renamed { old, new } => vec![old.as_path(), new.as_path()],
            other => vec![other.path()],
        }
    }
}

/// Converts an absolute path into a path relative to `root`, when it is
/// inside the root.
pub fn relative_to_root(root: &Path, absolute: &Path) -> Option<RelativePath> {
    let rel = absolute.strip_prefix(root).ok()?;
    let s = rel.to_str()?;
    if s.is_empty() {
        return Some(RelativePath::root());
    }
    RelativePath::new(s.replace(std::path::MAIN_SEPARATOR, "/")).ok()
}

fn map_notify_event(event: &notify::Event) -> Vec<ChangeEvent> {
    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| ChangeEvent::Created(p.clone()))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| ChangeEvent::Deleted(p.clone()))
            .collect(),
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() == 2 {
                vec![ChangeEvent::Renamed {
                    old: event.paths[0].clone(),
                    new: event.paths[1].clone(),
                }]
            } else {
                // one-sided rename notification: treat as modification
                event
                    .paths
                    .iter()
                    .map(|p| ChangeEvent::Modified(p.clone()))
                    .collect()
            }
        }
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| ChangeEvent::Modified(p.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Watches one sync root with the OS-native mechanism.
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Creates the watcher; the receiver yields change events.
    pub fn new() -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::channel::<ChangeEvent>(1024);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for change in map_notify_event(&event) {
                        if let Err(e) = tx.blocking_send(change) {
                            warn!(error = %e, "Dropping change event (receiver gone)");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((Self { watcher }, rx))
    }

    /// Starts watching `path` recursively.
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Watching recursively");
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", path.display()))
    }

    pub fn unwatch(&mut self, path: &Path) -> Result<()> {
        self.watcher
            .unwatch(path)
            .with_context(|| format!("Failed to unwatch {}", path.display()))
    }
}

/// Coalesces rapid-fire events until a path has been quiet for the
/// debounce window.
pub struct DebouncedChangeQueue {
    debounce: Duration,
    pending: HashMap<PathBuf, (ChangeEvent, Instant)>,
}

impl DebouncedChangeQueue {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: HashMap::new(),
        }
    }

    /// Records an event, replacing any earlier event for the same path.
    pub fn push(&mut self, event: ChangeEvent) {
        let key = event.path().to_path_buf();
        debug!(path = %key.display(), "Change queued");
        self.pending.insert(key, (event, Instant::now()));
    }

    /// Drains the events whose debounce window has elapsed.
    pub fn poll(&mut self) -> Vec<ChangeEvent> {
        let now = Instant::now();
        let settled: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= self.debounce)
            .map(|(k, _)| k.clone())
            .collect();

        settled
            .into_iter()
            .filter_map(|k| self.pending.remove(&k).map(|(e, _)| e))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_to_root() {
        let root = Path::new("/home/user/sync");
        assert_eq!(
            relative_to_root(root, Path::new("/home/user/sync/d/f.txt")),
            Some(RelativePath::new("d/f.txt").unwrap())
        );
        assert_eq!(
            relative_to_root(root, Path::new("/home/user/sync")),
            Some(RelativePath::root())
        );
        assert_eq!(relative_to_root(root, Path::new("/etc/passwd")), None);
    }

    #[test]
    fn test_debounce_coalesces_same_path() {
        let mut queue = DebouncedChangeQueue::new(Duration::ZERO);
        queue.push(ChangeEvent::Created(PathBuf::from("/a")));
        queue.push(ChangeEvent::Modified(PathBuf::from("/a")));
        queue.push(ChangeEvent::Modified(PathBuf::from("/b")));

        let mut settled = queue.poll();
        settled.sort_by_key(|e| e.path().to_path_buf());
        assert_eq!(settled.len(), 2);
        // the later event for /a replaced the earlier one
        assert_eq!(settled[0], ChangeEvent::Modified(PathBuf::from("/a")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_debounce_holds_recent_events() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_secs(60));
        queue.push(ChangeEvent::Created(PathBuf::from("/a")));
        assert!(queue.poll().is_empty());
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_rename_touches_both_paths() {
        let event = ChangeEvent::Renamed {
            old: PathBuf::from("/a"),
            new: PathBuf::from("/b"),
        };
        assert_eq!(event.touched_paths().len(), 2);
        assert_eq!(event.path(), Path::new("/b"));
    }

    #[test]
    fn test_map_notify_create() {
        let event = notify::Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![PathBuf::from("/x")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_notify_event(&event),
            vec![ChangeEvent::Created(PathBuf::from("/x"))]
        );
    }
}
