//! Remote lister
//!
//! Walks the remote tree with depth-one listings, skipping subtrees whose
//! directory etag still matches the journal and whose descendants are not
//! in the touched set. Pruned directories are reported so discovery can
//! replay their journal records as "unchanged remote".

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, trace};

use davsync_core::domain::{Etag, RelativePath};
use davsync_core::ports::{RemoteClient, RemoteEntry, RemoteError};

/// Result of one remote discovery pass.
#[derive(Debug, Clone)]
pub struct RemoteSnapshot {
    /// Every entry seen, keyed by path; does not include the sync root.
    pub entries: BTreeMap<RelativePath, RemoteEntry>,
    /// Directories skipped by etag pruning; their subtree state lives in
    /// the journal.
    pub pruned: Vec<RelativePath>,
}

/// Depth-one tree walker over a [`RemoteClient`].
pub struct RemoteLister<'a> {
    client: &'a dyn RemoteClient,
}

impl<'a> RemoteLister<'a> {
    pub fn new(client: &'a dyn RemoteClient) -> Self {
        Self { client }
    }

    /// Lists the whole tree under the root.
    ///
    /// `known_dir_etags` are the directory etags the journal recorded;
    /// `touched` restricts pruning: a directory with a touched descendant
    /// is always descended into.
    pub async fn list_tree(
        &self,
        known_dir_etags: &BTreeMap<RelativePath, Etag>,
        touched: Option<&BTreeSet<RelativePath>>,
    ) -> Result<RemoteSnapshot, RemoteError> {
        let mut entries = BTreeMap::new();
        let mut pruned = Vec::new();
        let mut queue = VecDeque::from([RelativePath::root()]);

        while let Some(dir) = queue.pop_front() {
            let listing = self.client.list_directory(&dir).await?;
            trace!(dir = %dir, children = listing.entries.len(), "Listed remote directory");

            for entry in listing.entries {
                let path = entry.path.clone();
                let is_dir = entry.kind.is_directory();
                let etag = entry.etag.clone();
                entries.insert(path.clone(), entry);

                if !is_dir {
                    continue;
                }
                let unchanged = known_dir_etags.get(&path) == Some(&etag);
                if unchanged && !touched_under(touched, &path) {
                    debug!(dir = %path, etag = %etag, "Subtree unchanged, pruned");
                    pruned.push(path);
                } else {
                    queue.push_back(path);
                }
            }
        }

        debug!(
            entries = entries.len(),
            pruned = pruned.len(),
            "Remote discovery finished"
        );
        Ok(RemoteSnapshot { entries, pruned })
    }
}

fn touched_under(touched: Option<&BTreeSet<RelativePath>>, dir: &RelativePath) -> bool {
    match touched {
        // a full run touches everything; pruning stays purely etag-driven
        None => false,
        Some(set) => set
            .iter()
            .any(|t| t == dir || dir.is_ancestor_of(t) || t.is_ancestor_of(dir)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::Mutex;

    use bytes::Bytes;
    use chrono::{DateTime, Utc};

    use davsync_core::capabilities::ServerCapabilities;
    use davsync_core::domain::{FileId, ItemKind, RemotePermissions};
    use davsync_core::ports::{
        DirectoryListing, DownloadOutcome, FinalizeArgs, ProgressFn, PutOutcome, TransferPacer,
        TransferSession,
    };

    /// Listing-only fake; transfer methods are never reached by the lister.
    struct FakeRemote {
        dirs: HashMap<String, DirectoryListing>,
        listed: Mutex<Vec<String>>,
    }

    fn entry(path: &str, kind: ItemKind, etag: &str) -> RemoteEntry {
        RemoteEntry {
            path: RelativePath::new(path).unwrap(),
            kind,
            size: 1,
            mtime: None,
            etag: Etag::new(etag).unwrap(),
            file_id: FileId::new(format!("id-{path}")).unwrap(),
            permissions: RemotePermissions::unrestricted(),
            checksum: None,
            is_shared_mount: false,
        }
    }

    fn dir_listing(dir: &str, etag: &str, children: Vec<RemoteEntry>) -> DirectoryListing {
        let path = if dir.is_empty() {
            RelativePath::root()
        } else {
            RelativePath::new(dir).unwrap()
        };
        DirectoryListing {
            directory: RemoteEntry {
                path,
                kind: ItemKind::Directory,
                size: 0,
                mtime: None,
                etag: Etag::new(etag).unwrap(),
                file_id: FileId::new(format!("id-dir-{dir}")).unwrap(),
                permissions: RemotePermissions::unrestricted(),
                checksum: None,
                is_shared_mount: false,
            },
            entries: children,
        }
    }

    #[async_trait::async_trait]
    impl RemoteClient for FakeRemote {
        async fn capabilities(&self) -> Result<ServerCapabilities, RemoteError> {
            Ok(ServerCapabilities::default())
        }
        async fn root_etag(&self) -> Result<Etag, RemoteError> {
            Ok(Etag::new("root").unwrap())
        }
        async fn list_directory(
            &self,
            dir: &RelativePath,
        ) -> Result<DirectoryListing, RemoteError> {
            self.listed.lock().unwrap().push(dir.as_str().to_string());
            self.dirs
                .get(dir.as_str())
                .cloned()
                .ok_or_else(|| RemoteError::NotFound(dir.to_string()))
        }
        async fn download(
            &self,
            _: &RelativePath,
            _: &Path,
            _: u64,
            _: Option<&Etag>,
            _: Option<Arc<dyn TransferPacer>>,
            _: Option<ProgressFn>,
        ) -> Result<DownloadOutcome, RemoteError> {
            unimplemented!()
        }
        async fn put_file(
            &self,
            _: &RelativePath,
            _: Bytes,
            _: Option<&Etag>,
            _: Option<DateTime<Utc>>,
            _: Option<Arc<dyn TransferPacer>>,
        ) -> Result<PutOutcome, RemoteError> {
            unimplemented!()
        }
        async fn mkcol(&self, _: &RelativePath) -> Result<PutOutcome, RemoteError> {
            unimplemented!()
        }
        async fn delete(&self, _: &RelativePath) -> Result<(), RemoteError> {
            unimplemented!()
        }
        async fn move_item(
            &self,
            _: &RelativePath,
            _: &RelativePath,
        ) -> Result<PutOutcome, RemoteError> {
            unimplemented!()
        }
        async fn create_transfer(
            &self,
            _: &RelativePath,
            _: u64,
        ) -> Result<TransferSession, RemoteError> {
            unimplemented!()
        }
        async fn transfer_offset(&self, _: &TransferSession) -> Result<u64, RemoteError> {
            unimplemented!()
        }
        async fn upload_chunk(
            &self,
            _: &TransferSession,
            _: u64,
            _: Bytes,
            _: Option<Arc<dyn TransferPacer>>,
        ) -> Result<(), RemoteError> {
            unimplemented!()
        }
        async fn finalize_transfer(
            &self,
            _: &TransferSession,
            _: &RelativePath,
            _: FinalizeArgs,
        ) -> Result<PutOutcome, RemoteError> {
            unimplemented!()
        }
        async fn abort_transfer(&self, _: &TransferSession) -> Result<(), RemoteError> {
            unimplemented!()
        }
        fn is_http2(&self) -> bool {
            false
        }
    }

    fn fake_tree() -> FakeRemote {
        let mut dirs = HashMap::new();
        dirs.insert(
            String::new(),
            dir_listing(
                "",
                "root-e1",
                vec![
                    entry("a.txt", ItemKind::File, "fa"),
                    entry("d", ItemKind::Directory, "fd"),
                ],
            ),
        );
        dirs.insert(
            "d".to_string(),
            dir_listing("d", "fd", vec![entry("d/b.txt", ItemKind::File, "fb")]),
        );
        FakeRemote {
            dirs,
            listed: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_lists_whole_tree_without_known_etags() {
        let remote = fake_tree();
        let lister = RemoteLister::new(&remote);
        let snapshot = lister.list_tree(&BTreeMap::new(), None).await.unwrap();

        let paths: Vec<_> = snapshot.entries.keys().map(|p| p.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "d", "d/b.txt"]);
        assert!(snapshot.pruned.is_empty());
        assert_eq!(*remote.listed.lock().unwrap(), vec!["", "d"]);
    }

    #[tokio::test]
    async fn test_prunes_unchanged_subtree() {
        let remote = fake_tree();
        let lister = RemoteLister::new(&remote);
        let mut known = BTreeMap::new();
        known.insert(RelativePath::new("d").unwrap(), Etag::new("fd").unwrap());

        let snapshot = lister.list_tree(&known, None).await.unwrap();
        assert_eq!(snapshot.pruned, vec![RelativePath::new("d").unwrap()]);
        // the directory entry itself is still reported
        assert!(snapshot.entries.contains_key(&RelativePath::new("d").unwrap()));
        // but its children were never fetched
        assert!(!snapshot
            .entries
            .contains_key(&RelativePath::new("d/b.txt").unwrap()));
        assert_eq!(*remote.listed.lock().unwrap(), vec![""]);
    }

    #[tokio::test]
    async fn test_touched_descendant_defeats_pruning() {
        let remote = fake_tree();
        let lister = RemoteLister::new(&remote);
        let mut known = BTreeMap::new();
        known.insert(RelativePath::new("d").unwrap(), Etag::new("fd").unwrap());
        let mut touched = BTreeSet::new();
        touched.insert(RelativePath::new("d/b.txt").unwrap());

        let snapshot = lister.list_tree(&known, Some(&touched)).await.unwrap();
        assert!(snapshot.pruned.is_empty());
        assert!(snapshot
            .entries
            .contains_key(&RelativePath::new("d/b.txt").unwrap()));
    }

    #[tokio::test]
    async fn test_changed_etag_forces_descent() {
        let remote = fake_tree();
        let lister = RemoteLister::new(&remote);
        let mut known = BTreeMap::new();
        known.insert(RelativePath::new("d").unwrap(), Etag::new("stale").unwrap());

        let snapshot = lister.list_tree(&known, None).await.unwrap();
        assert!(snapshot.pruned.is_empty());
        assert_eq!(*remote.listed.lock().unwrap(), vec!["", "d"]);
    }
}
