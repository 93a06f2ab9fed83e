//! Remote client port
//!
//! The WebDAV-shaped interface the engine drives. The concrete adapter
//! owns the HTTP transport (authenticated request/response with progress
//! and etag semantics); this trait only fixes the operations and their
//! error taxonomy.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{ChunkDialect, ServerCapabilities};
use crate::domain::newtypes::{Checksum, Etag, FileId, RelativePath, TransferId};
use crate::domain::permissions::RemotePermissions;
use crate::domain::sync_item::ItemKind;

/// Errors surfaced by the remote adapter.
///
/// The propagator needs precise HTTP semantics (412, 423, 507) to classify
/// failures, so the port carries a typed error instead of an opaque one.
#[derive(Debug, Error, Clone)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// 401; the credential provider has been told.
    #[error("credentials rejected by server")]
    Unauthorized,

    /// 403, or an operation the advertised permissions forbid.
    #[error("operation forbidden: {0}")]
    Forbidden(String),

    /// 404 on the addressed resource.
    #[error("remote resource not found: {0}")]
    NotFound(String),

    /// 412; the `If-Match` etag no longer matches (lost update).
    #[error("precondition failed (etag mismatch)")]
    PreconditionFailed,

    /// 423; the resource is locked by another client.
    #[error("resource is locked")]
    Locked { retry_after: Option<Duration> },

    /// 507; the server is out of space.
    #[error("insufficient storage on server")]
    InsufficientStorage,

    /// Any other HTTP error status.
    #[error("http status {status}: {message}")]
    Http { status: u16, message: String },

    /// Local filesystem failure while spooling a transfer.
    #[error("local i/o error: {0}")]
    Io(String),

    /// Unparseable response body, broken multistatus, etc.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// The HTTP status behind this error, when one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Unauthorized => Some(401),
            RemoteError::Forbidden(_) => Some(403),
            RemoteError::NotFound(_) => Some(404),
            RemoteError::PreconditionFailed => Some(412),
            RemoteError::Locked { .. } => Some(423),
            RemoteError::InsufficientStorage => Some(507),
            RemoteError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for errors where an in-run retry with backoff makes sense.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout => true,
            RemoteError::Http { status, .. } => {
                *status == 429 || (*status >= 500 && *status != 507)
            }
            _ => false,
        }
    }

    /// True for errors that must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RemoteError::Unauthorized | RemoteError::InsufficientStorage
        )
    }
}

/// One entry of a depth-1 listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    /// Path relative to the sync root.
    pub path: RelativePath,
    pub kind: ItemKind,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub etag: Etag,
    pub file_id: FileId,
    pub permissions: RemotePermissions,
    pub checksum: Option<Checksum>,
    pub is_shared_mount: bool,
}

/// A depth-1 listing: the collection itself plus its direct children.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryListing {
    pub directory: RemoteEntry,
    pub entries: Vec<RemoteEntry>,
}

/// Server-assigned identity after a write operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PutOutcome {
    pub etag: Etag,
    pub file_id: Option<FileId>,
}

/// Result of a finished download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOutcome {
    pub etag: Etag,
    pub file_id: Option<FileId>,
    pub size: u64,
    pub checksum: Option<Checksum>,
}

/// A chunked-upload session, journaled for resumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSession {
    pub id: TransferId,
    pub dialect: ChunkDialect,
    /// Session URL for the token dialect; collection URL otherwise.
    pub url: String,
}

/// Arguments for assembling a chunked upload.
#[derive(Debug, Clone)]
pub struct FinalizeArgs {
    pub total_size: u64,
    pub if_match: Option<Etag>,
    pub mtime: Option<DateTime<Utc>>,
    pub checksum: Option<Checksum>,
}

/// Progress callback `(bytes_done, bytes_total)`.
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Pacing hook applied at the transport buffer boundary, so cancellation
/// stays prompt while a limit is active.
#[async_trait::async_trait]
pub trait TransferPacer: Send + Sync {
    /// Suspends until `bytes` may be transferred.
    async fn allow(&self, bytes: u64);
}

/// Port trait for the WebDAV-style remote.
#[async_trait::async_trait]
pub trait RemoteClient: Send + Sync {
    /// Queries the capabilities document. Adapters may cache per session.
    async fn capabilities(&self) -> Result<ServerCapabilities, RemoteError>;

    /// Depth-0 etag of the sync root, for cheap change polling.
    async fn root_etag(&self) -> Result<Etag, RemoteError>;

    /// Depth-1 listing of one directory.
    async fn list_directory(&self, dir: &RelativePath) -> Result<DirectoryListing, RemoteError>;

    /// Streams a file into `target`, resuming at `resume_offset` when a
    /// previous partial download with a still-matching `resume_etag`
    /// exists. The pacer is consulted per transport buffer.
    async fn download(
        &self,
        path: &RelativePath,
        target: &Path,
        resume_offset: u64,
        resume_etag: Option<&Etag>,
        pacer: Option<Arc<dyn TransferPacer>>,
        progress: Option<ProgressFn>,
    ) -> Result<DownloadOutcome, RemoteError>;

    /// Single-request upload with an `If-Match` precondition against lost
    /// updates. `if_match == None` means the file must not exist yet
    /// (`If-None-Match: *`).
    async fn put_file(
        &self,
        path: &RelativePath,
        data: Bytes,
        if_match: Option<&Etag>,
        mtime: Option<DateTime<Utc>>,
        pacer: Option<Arc<dyn TransferPacer>>,
    ) -> Result<PutOutcome, RemoteError>;

    async fn mkcol(&self, path: &RelativePath) -> Result<PutOutcome, RemoteError>;

    async fn delete(&self, path: &RelativePath) -> Result<(), RemoteError>;

    async fn move_item(
        &self,
        from: &RelativePath,
        to: &RelativePath,
    ) -> Result<PutOutcome, RemoteError>;

    /// Opens a chunked-upload session in the server's preferred dialect.
    async fn create_transfer(
        &self,
        path: &RelativePath,
        total_size: u64,
    ) -> Result<TransferSession, RemoteError>;

    /// Bytes the server has committed for this session; resumption starts
    /// there, never retransmitting acknowledged chunks.
    async fn transfer_offset(&self, session: &TransferSession) -> Result<u64, RemoteError>;

    async fn upload_chunk(
        &self,
        session: &TransferSession,
        offset: u64,
        data: Bytes,
        pacer: Option<Arc<dyn TransferPacer>>,
    ) -> Result<(), RemoteError>;

    /// Assembles the chunks into the destination file.
    async fn finalize_transfer(
        &self,
        session: &TransferSession,
        path: &RelativePath,
        args: FinalizeArgs,
    ) -> Result<PutOutcome, RemoteError>;

    async fn abort_transfer(&self, session: &TransferSession) -> Result<(), RemoteError>;

    /// Whether the underlying connection negotiated HTTP/2; raises the
    /// parallelism budget when true.
    fn is_http2(&self) -> bool;
}
