//! Test fixtures: an in-memory WebDAV-shaped remote and folder setup.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use davsync_core::capabilities::{ChunkDialect, ServerCapabilities};
use davsync_core::config::Config;
use davsync_core::domain::{
    ChecksumAlgorithm, Etag, FileId, ItemKind, RelativePath, RemotePermissions, TransferId,
};
use davsync_core::ports::{
    DirectoryListing, DownloadOutcome, FinalizeArgs, ProgressFn, PutOutcome, RemoteClient,
    RemoteEntry, RemoteError, TransferPacer, TransferSession,
};
use davsync_engine::exclude::ExcludeEngine;
use davsync_engine::folder::Folder;
use davsync_engine::queue::JobQueue;
use davsync_journal::{JournalDb, SyncJournal};
use davsync_vfs::VfsOff;

#[derive(Debug, Clone)]
pub struct FakeNode {
    pub data: Option<Vec<u8>>,
    pub etag: String,
    pub file_id: String,
    pub mtime: DateTime<Utc>,
    pub permissions: RemotePermissions,
}

impl FakeNode {
    fn is_dir(&self) -> bool {
        self.data.is_none()
    }
}

#[derive(Default)]
struct FakeState {
    /// Path -> node; the empty path is the root collection.
    nodes: BTreeMap<String, FakeNode>,
    etag_counter: u64,
    file_id_counter: u64,
    sessions: HashMap<String, FakeSession>,
    session_counter: u64,
}

struct FakeSession {
    committed: Vec<u8>,
    #[allow(dead_code)]
    total: u64,
}

/// An in-memory remote implementing the full `RemoteClient` port.
pub struct FakeRemote {
    state: Mutex<FakeState>,
    capabilities: ServerCapabilities,
    /// Total body bytes received via put/chunk uploads.
    pub upload_bytes: AtomicU64,
    pub put_attempts: AtomicU64,
    pub chunk_uploads: AtomicU64,
    /// Fail every chunk upload after this many have been accepted.
    pub fail_chunks_after: Mutex<Option<u64>>,
    /// Inject an error for PUTs of specific paths.
    pub fail_put: Mutex<HashMap<String, RemoteError>>,
    /// Order of DELETE operations, for barrier assertions.
    pub delete_order: Mutex<Vec<String>>,
    /// MOVE operations performed.
    pub moves: Mutex<Vec<(String, String)>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        let mut capabilities = ServerCapabilities {
            resumable_upload: true,
            checksum_types: vec![ChecksumAlgorithm::Sha256],
            ..Default::default()
        };
        capabilities.chunking_ng.enabled = true;
        capabilities.chunking_ng.min_chunk_size = 1;

        let mut state = FakeState::default();
        state.nodes.insert(
            String::new(),
            FakeNode {
                data: None,
                etag: "root-0".to_string(),
                file_id: "root".to_string(),
                mtime: Utc::now(),
                permissions: RemotePermissions::unrestricted(),
            },
        );

        Arc::new(Self {
            state: Mutex::new(state),
            capabilities,
            upload_bytes: AtomicU64::new(0),
            put_attempts: AtomicU64::new(0),
            chunk_uploads: AtomicU64::new(0),
            fail_chunks_after: Mutex::new(None),
            fail_put: Mutex::new(HashMap::new()),
            delete_order: Mutex::new(Vec::new()),
            moves: Mutex::new(Vec::new()),
        })
    }

    fn bump(state: &mut FakeState) -> (String, String) {
        state.etag_counter += 1;
        state.file_id_counter += 1;
        (
            format!("etag-{}", state.etag_counter),
            format!("fid-{}", state.file_id_counter),
        )
    }

    fn touch_ancestors(state: &mut FakeState, path: &str) {
        // parent collections get fresh etags when content changes
        let mut cursor = parent_of(path);
        loop {
            state.etag_counter += 1;
            let etag = format!("etag-{}", state.etag_counter);
            if let Some(node) = state.nodes.get_mut(&cursor) {
                node.etag = etag;
            }
            if cursor.is_empty() {
                break;
            }
            cursor = parent_of(&cursor);
        }
    }

    /// Seeds a directory, creating missing ancestors.
    pub fn add_dir(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let mut so_far = String::new();
        for part in path.split('/') {
            if !so_far.is_empty() {
                so_far.push('/');
            }
            so_far.push_str(part);
            if !state.nodes.contains_key(&so_far) {
                let (etag, file_id) = Self::bump(&mut state);
                state.nodes.insert(
                    so_far.clone(),
                    FakeNode {
                        data: None,
                        etag,
                        file_id,
                        mtime: Utc::now(),
                        permissions: RemotePermissions::unrestricted(),
                    },
                );
            }
        }
        Self::touch_ancestors(&mut state, path);
    }

    /// Seeds a file, creating missing parent directories.
    pub fn add_file(&self, path: &str, data: &[u8]) -> (String, String) {
        if let Some(parent) = path.rsplit_once('/').map(|(p, _)| p) {
            self.add_dir(parent);
        }
        let mut state = self.state.lock().unwrap();
        let (etag, file_id) = Self::bump(&mut state);
        state.nodes.insert(
            path.to_string(),
            FakeNode {
                data: Some(data.to_vec()),
                etag: etag.clone(),
                file_id: file_id.clone(),
                mtime: Utc::now(),
                permissions: RemotePermissions::unrestricted(),
            },
        );
        Self::touch_ancestors(&mut state, path);
        (etag, file_id)
    }

    pub fn node(&self, path: &str) -> Option<FakeNode> {
        self.state.lock().unwrap().nodes.get(path).cloned()
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        self.node(path).and_then(|n| n.data)
    }

    pub fn paths(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .keys()
            .filter(|k| !k.is_empty())
            .cloned()
            .collect()
    }

    fn entry(path: &str, node: &FakeNode) -> RemoteEntry {
        RemoteEntry {
            path: RelativePath::new(path).unwrap(),
            kind: if node.is_dir() {
                ItemKind::Directory
            } else {
                ItemKind::File
            },
            size: node.data.as_ref().map(|d| d.len() as u64).unwrap_or(0),
            mtime: Some(node.mtime),
            etag: Etag::new(&node.etag).unwrap(),
            file_id: FileId::new(&node.file_id).unwrap(),
            permissions: node.permissions,
            checksum: None,
            is_shared_mount: false,
        }
    }
}

fn parent_of(path: &str) -> String {
    path.rsplit_once('/')
        .map(|(p, _)| p.to_string())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl RemoteClient for FakeRemote {
    async fn capabilities(&self) -> Result<ServerCapabilities, RemoteError> {
        Ok(self.capabilities.clone())
    }

    async fn root_etag(&self) -> Result<Etag, RemoteError> {
        let state = self.state.lock().unwrap();
        Ok(Etag::new(&state.nodes[""].etag).unwrap())
    }

    async fn list_directory(&self, dir: &RelativePath) -> Result<DirectoryListing, RemoteError> {
        let state = self.state.lock().unwrap();
        let key = dir.as_str().to_string();
        let node = state
            .nodes
            .get(&key)
            .ok_or_else(|| RemoteError::NotFound(key.clone()))?;
        if !node.is_dir() {
            return Err(RemoteError::Protocol(format!("{key} is not a collection")));
        }
        let directory = if key.is_empty() {
            RemoteEntry {
                path: RelativePath::root(),
                kind: ItemKind::Directory,
                size: 0,
                mtime: Some(node.mtime),
                etag: Etag::new(&node.etag).unwrap(),
                file_id: FileId::new(&node.file_id).unwrap(),
                permissions: node.permissions,
                checksum: None,
                is_shared_mount: false,
            }
        } else {
            Self::entry(&key, node)
        };
        let entries = state
            .nodes
            .iter()
            .filter(|(path, _)| !path.is_empty() && parent_of(path) == key)
            .map(|(path, node)| Self::entry(path, node))
            .collect();
        Ok(DirectoryListing { directory, entries })
    }

    async fn download(
        &self,
        path: &RelativePath,
        target: &Path,
        _resume_offset: u64,
        _resume_etag: Option<&Etag>,
        _pacer: Option<Arc<dyn TransferPacer>>,
        progress: Option<ProgressFn>,
    ) -> Result<DownloadOutcome, RemoteError> {
        let (data, etag, file_id) = {
            let state = self.state.lock().unwrap();
            let node = state
                .nodes
                .get(path.as_str())
                .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
            let data = node
                .data
                .clone()
                .ok_or_else(|| RemoteError::Protocol(format!("{path} is a collection")))?;
            (data, node.etag.clone(), node.file_id.clone())
        };
        tokio::fs::write(target, &data)
            .await
            .map_err(|e| RemoteError::Io(e.to_string()))?;
        if let Some(cb) = progress {
            cb(data.len() as u64, data.len() as u64);
        }
        Ok(DownloadOutcome {
            etag: Etag::new(&etag).unwrap(),
            file_id: Some(FileId::new(&file_id).unwrap()),
            size: data.len() as u64,
            checksum: None,
        })
    }

    async fn put_file(
        &self,
        path: &RelativePath,
        data: Bytes,
        if_match: Option<&Etag>,
        mtime: Option<DateTime<Utc>>,
        _pacer: Option<Arc<dyn TransferPacer>>,
    ) -> Result<PutOutcome, RemoteError> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_put.lock().unwrap().get(path.as_str()) {
            return Err(err.clone());
        }

        let mut state = self.state.lock().unwrap();
        let key = path.as_str().to_string();
        match (state.nodes.get(&key), if_match) {
            (Some(node), Some(expected)) if node.etag != expected.as_str() => {
                return Err(RemoteError::PreconditionFailed);
            }
            (Some(_), None) => return Err(RemoteError::PreconditionFailed),
            (None, Some(_)) => return Err(RemoteError::PreconditionFailed),
            _ => {}
        }

        self.upload_bytes
            .fetch_add(data.len() as u64, Ordering::SeqCst);
        let (etag, file_id) = Self::bump(&mut state);
        let file_id = match state.nodes.get(&key) {
            Some(existing) => existing.file_id.clone(),
            None => file_id,
        };
        state.nodes.insert(
            key.clone(),
            FakeNode {
                data: Some(data.to_vec()),
                etag: etag.clone(),
                file_id: file_id.clone(),
                mtime: mtime.unwrap_or_else(Utc::now),
                permissions: RemotePermissions::unrestricted(),
            },
        );
        Self::touch_ancestors(&mut state, &key);
        Ok(PutOutcome {
            etag: Etag::new(&etag).unwrap(),
            file_id: Some(FileId::new(&file_id).unwrap()),
        })
    }

    async fn mkcol(&self, path: &RelativePath) -> Result<PutOutcome, RemoteError> {
        let mut state = self.state.lock().unwrap();
        let key = path.as_str().to_string();
        if state.nodes.contains_key(&key) {
            return Err(RemoteError::Http {
                status: 405,
                message: "collection exists".to_string(),
            });
        }
        let (etag, file_id) = Self::bump(&mut state);
        state.nodes.insert(
            key.clone(),
            FakeNode {
                data: None,
                etag: etag.clone(),
                file_id: file_id.clone(),
                mtime: Utc::now(),
                permissions: RemotePermissions::unrestricted(),
            },
        );
        Self::touch_ancestors(&mut state, &key);
        Ok(PutOutcome {
            etag: Etag::new(&etag).unwrap(),
            file_id: Some(FileId::new(&file_id).unwrap()),
        })
    }

    async fn delete(&self, path: &RelativePath) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        let key = path.as_str().to_string();
        if !state.nodes.contains_key(&key) {
            return Err(RemoteError::NotFound(key));
        }
        self.delete_order.lock().unwrap().push(key.clone());
        let prefix = format!("{key}/");
        state
            .nodes
            .retain(|p, _| p != &key && !p.starts_with(&prefix));
        Self::touch_ancestors(&mut state, &key);
        Ok(())
    }

    async fn move_item(
        &self,
        from: &RelativePath,
        to: &RelativePath,
    ) -> Result<PutOutcome, RemoteError> {
        let mut state = self.state.lock().unwrap();
        let from_key = from.as_str().to_string();
        let to_key = to.as_str().to_string();
        let mut node = state
            .nodes
            .remove(&from_key)
            .ok_or_else(|| RemoteError::NotFound(from_key.clone()))?;

        // descendants follow the collection
        let prefix = format!("{from_key}/");
        let moved: Vec<(String, FakeNode)> = state
            .nodes
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix))
            .map(|(p, n)| (format!("{to_key}/{}", &p[prefix.len()..]), n.clone()))
            .collect();
        state.nodes.retain(|p, _| !p.starts_with(&prefix));
        for (p, n) in moved {
            state.nodes.insert(p, n);
        }

        state.etag_counter += 1;
        node.etag = format!("etag-{}", state.etag_counter);
        let outcome = PutOutcome {
            etag: Etag::new(&node.etag).unwrap(),
            file_id: Some(FileId::new(&node.file_id).unwrap()),
        };
        state.nodes.insert(to_key.clone(), node);
        Self::touch_ancestors(&mut state, &from_key);
        Self::touch_ancestors(&mut state, &to_key);
        self.moves.lock().unwrap().push((from_key, to_key));
        Ok(outcome)
    }

    async fn create_transfer(
        &self,
        _path: &RelativePath,
        total_size: u64,
    ) -> Result<TransferSession, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.session_counter += 1;
        let id = format!("tx-{}", state.session_counter);
        state.sessions.insert(
            id.clone(),
            FakeSession {
                committed: Vec::new(),
                total: total_size,
            },
        );
        Ok(TransferSession {
            id: TransferId::new(&id).unwrap(),
            dialect: ChunkDialect::Token,
            url: format!("fake://uploads/{id}"),
        })
    }

    async fn transfer_offset(&self, session: &TransferSession) -> Result<u64, RemoteError> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .get(session.id.as_str())
            .map(|s| s.committed.len() as u64)
            .ok_or_else(|| RemoteError::NotFound(session.id.to_string()))
    }

    async fn upload_chunk(
        &self,
        session: &TransferSession,
        offset: u64,
        data: Bytes,
        _pacer: Option<Arc<dyn TransferPacer>>,
    ) -> Result<(), RemoteError> {
        if let Some(limit) = *self.fail_chunks_after.lock().unwrap() {
            if self.chunk_uploads.load(Ordering::SeqCst) >= limit {
                return Err(RemoteError::Http {
                    status: 400,
                    message: "injected chunk failure".to_string(),
                });
            }
        }
        let mut state = self.state.lock().unwrap();
        let fake = state
            .sessions
            .get_mut(session.id.as_str())
            .ok_or_else(|| RemoteError::NotFound(session.id.to_string()))?;
        if fake.committed.len() as u64 != offset {
            return Err(RemoteError::Protocol(format!(
                "chunk at offset {offset}, committed {}",
                fake.committed.len()
            )));
        }
        fake.committed.extend_from_slice(&data);
        self.chunk_uploads.fetch_add(1, Ordering::SeqCst);
        self.upload_bytes
            .fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn finalize_transfer(
        &self,
        session: &TransferSession,
        path: &RelativePath,
        args: FinalizeArgs,
    ) -> Result<PutOutcome, RemoteError> {
        let mut state = self.state.lock().unwrap();
        let fake = state
            .sessions
            .remove(session.id.as_str())
            .ok_or_else(|| RemoteError::NotFound(session.id.to_string()))?;
        if fake.committed.len() as u64 != args.total_size {
            return Err(RemoteError::Protocol(format!(
                "incomplete upload: {} of {}",
                fake.committed.len(),
                args.total_size
            )));
        }
        let key = path.as_str().to_string();
        match (state.nodes.get(&key), &args.if_match) {
            (Some(node), Some(expected)) if node.etag != expected.as_str() => {
                return Err(RemoteError::PreconditionFailed);
            }
            (None, Some(_)) => return Err(RemoteError::PreconditionFailed),
            _ => {}
        }
        let (etag, file_id) = Self::bump(&mut state);
        let file_id = match state.nodes.get(&key) {
            Some(existing) => existing.file_id.clone(),
            None => file_id,
        };
        state.nodes.insert(
            key.clone(),
            FakeNode {
                data: Some(fake.committed),
                etag: etag.clone(),
                file_id: file_id.clone(),
                mtime: args.mtime.unwrap_or_else(Utc::now),
                permissions: RemotePermissions::unrestricted(),
            },
        );
        Self::touch_ancestors(&mut state, &key);
        Ok(PutOutcome {
            etag: Etag::new(&etag).unwrap(),
            file_id: Some(FileId::new(&file_id).unwrap()),
        })
    }

    async fn abort_transfer(&self, session: &TransferSession) -> Result<(), RemoteError> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .remove(session.id.as_str());
        Ok(())
    }

    fn is_http2(&self) -> bool {
        false
    }
}

/// A complete folder fixture over a temp dir, an in-memory journal and a
/// fake remote.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub remote: Arc<FakeRemote>,
    pub journal: Arc<SyncJournal>,
    pub folder: Arc<Folder>,
    _db: JournalDb,
}

pub async fn fixture() -> Fixture {
    fixture_with(Config {
        propagator: {
            let mut p = davsync_core::config::PropagatorConfig::default();
            p.retry_delays_ms = vec![1, 1];
            p
        },
        ..Default::default()
    })
    .await
}

pub async fn fixture_with(config: Config) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = JournalDb::in_memory().await.unwrap();
    let journal = Arc::new(SyncJournal::new(db.pool().clone()));
    let remote = FakeRemote::new();
    let excludes = Arc::new(ExcludeEngine::new(&[], false, None));
    let folder = Folder::new(
        "test",
        dir.path(),
        remote.clone() as Arc<dyn RemoteClient>,
        journal.clone(),
        Arc::new(VfsOff),
        excludes,
        Arc::new(JobQueue::new(8)),
        config,
        true,
    );
    Fixture {
        dir,
        remote,
        journal,
        folder,
        _db: db,
    }
}

pub fn rel(p: &str) -> RelativePath {
    RelativePath::new(p).unwrap()
}
