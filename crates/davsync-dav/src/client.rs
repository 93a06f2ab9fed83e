//! WebDAV client
//!
//! Wraps `reqwest::Client` with credential signing, per-request timeouts
//! (60 s metadata, 5 min transfers) and the status-code mapping the
//! propagator relies on. Supports a custom base URL for tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use davsync_core::capabilities::ServerCapabilities;
use davsync_core::domain::{Etag, FileId, ItemKind, RelativePath, RemotePermissions};
use davsync_core::ports::{
    Credential, CredentialProvider, DirectoryListing, DownloadOutcome, FinalizeArgs, ProgressFn,
    PutOutcome, RemoteClient, RemoteEntry, RemoteError, TransferPacer, TransferSession,
};

use crate::capabilities::{to_server_capabilities, OcsEnvelope, CAPABILITIES_PATH};
use crate::propfind::{parse_multistatus, PropfindEntry, PROPFIND_BODY};
use crate::transfers;

/// WebDAV implementation of the [`RemoteClient`] port.
pub struct DavClient {
    http: reqwest::Client,
    /// Server base, e.g. `https://cloud.example.com/`.
    server_url: Url,
    /// DAV collection of the sync root, always with a trailing slash.
    files_url: Url,
    /// Namespace for chunked-upload sessions.
    uploads_url: Url,
    credentials: Arc<dyn CredentialProvider>,
    metadata_timeout: Duration,
    transfer_timeout: Duration,
    http2_seen: AtomicBool,
    capabilities_cache: Mutex<Option<ServerCapabilities>>,
}

impl DavClient {
    /// Creates a client for `username`'s files on `server_url`.
    pub fn new(
        server_url: Url,
        username: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, RemoteError> {
        let files_url = server_url
            .join(&format!("remote.php/dav/files/{username}/"))
            .map_err(|e| RemoteError::Protocol(format!("bad server url: {e}")))?;
        let uploads_url = server_url
            .join(&format!("remote.php/dav/uploads/{username}/"))
            .map_err(|e| RemoteError::Protocol(format!("bad server url: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            server_url,
            files_url,
            uploads_url,
            credentials,
            metadata_timeout: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(300),
            http2_seen: AtomicBool::new(false),
            capabilities_cache: Mutex::new(None),
        })
    }

    /// Overrides both timeouts; mainly for tests.
    pub fn with_timeouts(mut self, metadata: Duration, transfer: Duration) -> Self {
        self.metadata_timeout = metadata;
        self.transfer_timeout = transfer;
        self
    }

    pub(crate) fn transfer_timeout(&self) -> Duration {
        self.transfer_timeout
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Absolute URL of a path under the files collection.
    pub(crate) fn url_for(&self, path: &RelativePath) -> Url {
        let mut url = self.files_url.clone();
        if !path.is_root() {
            // push_segments percent-encodes each component
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().extend(path.as_str().split('/'));
            }
        }
        url
    }

    /// Absolute URL of a chunk-session resource.
    pub(crate) fn upload_session_url(&self, transfer_id: &str) -> Url {
        let mut url = self.uploads_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(transfer_id);
        }
        url
    }

    pub(crate) fn uploads_url(&self) -> &Url {
        &self.uploads_url
    }

    /// Builds a signed request with the metadata timeout applied; transfer
    /// paths override the timeout themselves.
    pub(crate) async fn signed(
        &self,
        method: Method,
        url: Url,
    ) -> Result<RequestBuilder, RemoteError> {
        let credential = self.credentials.credential().await.map_err(|e| {
            warn!(error = %e, "Credential provider failed to produce a credential");
            RemoteError::Unauthorized
        })?;
        let builder = self
            .http
            .request(method, url)
            .timeout(self.metadata_timeout);
        Ok(match credential {
            Credential::Basic { user, password } => builder.basic_auth(user, Some(password)),
            Credential::Bearer(token) => builder.bearer_auth(token),
        })
    }

    pub(crate) fn method(name: &str) -> Result<Method, RemoteError> {
        Method::from_bytes(name.as_bytes())
            .map_err(|e| RemoteError::Protocol(format!("bad method {name}: {e}")))
    }

    pub(crate) fn map_transport_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout
        } else {
            RemoteError::Network(e.to_string())
        }
    }

    /// Maps an error status onto the typed taxonomy; 401 additionally
    /// invalidates the credential provider.
    pub(crate) async fn check_status(&self, response: Response) -> Result<Response, RemoteError> {
        self.note_http_version(&response);
        let status = response.status();
        if status.is_success() || status == StatusCode::MULTI_STATUS {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let message = response.text().await.unwrap_or_default();

        Err(match status.as_u16() {
            401 => {
                self.credentials.report_invalidated();
                RemoteError::Unauthorized
            }
            403 => RemoteError::Forbidden(message),
            404 => RemoteError::NotFound(message),
            412 => RemoteError::PreconditionFailed,
            423 => RemoteError::Locked { retry_after },
            507 => RemoteError::InsufficientStorage,
            code => RemoteError::Http {
                status: code,
                message,
            },
        })
    }

    pub(crate) fn note_http_version(&self, response: &Response) {
        if response.version() == reqwest::Version::HTTP_2 {
            self.http2_seen.store(true, Ordering::Release);
        }
    }

    /// Converts a decoded multistatus href into a path relative to the
    /// sync root.
    fn path_from_href(&self, href: &str) -> Result<RelativePath, RemoteError> {
        let base = self.files_url.path();
        let trimmed = href.trim_end_matches('/');
        let base_trimmed = base.trim_end_matches('/');
        if trimmed == base_trimmed {
            return Ok(RelativePath::root());
        }
        let rest = trimmed.strip_prefix(base).ok_or_else(|| {
            RemoteError::Protocol(format!("href {href} outside of collection {base}"))
        })?;
        RelativePath::new(rest)
            .map_err(|e| RemoteError::Protocol(format!("bad href {href}: {e}")))
    }

    fn entry_from_propfind(&self, parsed: &PropfindEntry) -> Result<RemoteEntry, RemoteError> {
        let path = self.path_from_href(&parsed.href)?;
        let etag = parsed
            .etag
            .as_deref()
            .ok_or_else(|| RemoteError::Protocol(format!("entry {path} without etag")))
            .and_then(|e| {
                Etag::new(e).map_err(|err| RemoteError::Protocol(format!("{path}: {err}")))
            })?;
        let file_id = parsed
            .file_id
            .as_deref()
            .ok_or_else(|| RemoteError::Protocol(format!("entry {path} without file id")))
            .and_then(|f| {
                FileId::new(f).map_err(|err| RemoteError::Protocol(format!("{path}: {err}")))
            })?;
        let permissions = parsed
            .permissions
            .unwrap_or_else(RemotePermissions::unrestricted);
        let kind = if parsed.is_collection {
            ItemKind::Directory
        } else {
            ItemKind::File
        };
        // for directories oc:size carries the recursive size
        let size = if parsed.is_collection {
            parsed.size.unwrap_or(0)
        } else {
            parsed.content_length.or(parsed.size).unwrap_or(0)
        };

        Ok(RemoteEntry {
            path,
            kind,
            size,
            mtime: parsed.mtime,
            etag,
            file_id,
            permissions,
            checksum: parsed.checksum.clone(),
            is_shared_mount: permissions.is_mounted(),
        })
    }

    /// PROPFIND with the given depth against an absolute URL.
    pub(crate) async fn propfind_url(
        &self,
        url: Url,
        depth: u8,
    ) -> Result<Vec<PropfindEntry>, RemoteError> {
        let response = self
            .signed(Self::method("PROPFIND")?, url)
            .await?
            .header("Depth", depth.to_string())
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        let response = self.check_status(response).await?;
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        parse_multistatus(&body)
    }

    /// Depth-0 metadata of one path.
    pub(crate) async fn stat(&self, path: &RelativePath) -> Result<RemoteEntry, RemoteError> {
        let parsed = self.propfind_url(self.url_for(path), 0).await?;
        let first = parsed
            .first()
            .ok_or_else(|| RemoteError::Protocol(format!("empty multistatus for {path}")))?;
        self.entry_from_propfind(first)
    }

    /// Reads etag + file id from response headers, falling back to a
    /// depth-0 PROPFIND for servers that omit them.
    pub(crate) async fn outcome_from(
        &self,
        response: &Response,
        path: &RelativePath,
    ) -> Result<PutOutcome, RemoteError> {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let etag = header("OC-ETag").or_else(|| header("ETag"));
        let file_id = header("OC-FileId");

        match etag {
            Some(raw) => Ok(PutOutcome {
                etag: Etag::new(&raw)
                    .map_err(|e| RemoteError::Protocol(format!("{path}: {e}")))?,
                file_id: match file_id {
                    Some(f) => Some(
                        FileId::new(f)
                            .map_err(|e| RemoteError::Protocol(format!("{path}: {e}")))?,
                    ),
                    None => None,
                },
            }),
            None => {
                debug!(path = %path, "Write response without etag header, statting");
                let entry = self.stat(path).await?;
                Ok(PutOutcome {
                    etag: entry.etag,
                    file_id: Some(entry.file_id),
                })
            }
        }
    }
}

/// Unix-seconds value for the `X-OC-Mtime` header.
pub(crate) fn mtime_header(mtime: Option<DateTime<Utc>>) -> Option<String> {
    mtime.map(|m| m.timestamp().to_string())
}

#[async_trait::async_trait]
impl RemoteClient for DavClient {
    async fn capabilities(&self) -> Result<ServerCapabilities, RemoteError> {
        let mut cache = self.capabilities_cache.lock().await;
        if let Some(caps) = cache.as_ref() {
            return Ok(caps.clone());
        }

        let url = self
            .server_url
            .join(CAPABILITIES_PATH)
            .map_err(|e| RemoteError::Protocol(format!("capabilities url: {e}")))?;
        let response = self
            .signed(Method::GET, url)
            .await?
            .header("OCS-APIRequest", "true")
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        let response = self.check_status(response).await?;
        let envelope: OcsEnvelope = response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(format!("capabilities document: {e}")))?;

        let caps = to_server_capabilities(&envelope.ocs.data.capabilities);
        debug!(
            chunking_ng = caps.chunking_ng.enabled,
            resumable = caps.resumable_upload,
            "Capabilities fetched"
        );
        *cache = Some(caps.clone());
        Ok(caps)
    }

    async fn root_etag(&self) -> Result<Etag, RemoteError> {
        Ok(self.stat(&RelativePath::root()).await?.etag)
    }

    async fn list_directory(&self, dir: &RelativePath) -> Result<DirectoryListing, RemoteError> {
        let parsed = self.propfind_url(self.url_for(dir), 1).await?;
        let mut directory = None;
        let mut entries = Vec::with_capacity(parsed.len().saturating_sub(1));

        for item in &parsed {
            let entry = self.entry_from_propfind(item)?;
            if entry.path == *dir {
                directory = Some(entry);
            } else {
                entries.push(entry);
            }
        }

        let directory = directory.ok_or_else(|| {
            RemoteError::Protocol(format!("listing of {dir} did not include the collection"))
        })?;

        debug!(dir = %dir, children = entries.len(), "Directory listed");
        Ok(DirectoryListing { directory, entries })
    }

    async fn download(
        &self,
        path: &RelativePath,
        target: &Path,
        resume_offset: u64,
        resume_etag: Option<&Etag>,
        pacer: Option<Arc<dyn TransferPacer>>,
        progress: Option<ProgressFn>,
    ) -> Result<DownloadOutcome, RemoteError> {
        transfers::download(self, path, target, resume_offset, resume_etag, pacer, progress).await
    }

    async fn put_file(
        &self,
        path: &RelativePath,
        data: Bytes,
        if_match: Option<&Etag>,
        mtime: Option<DateTime<Utc>>,
        pacer: Option<Arc<dyn TransferPacer>>,
    ) -> Result<PutOutcome, RemoteError> {
        transfers::put_file(self, path, data, if_match, mtime, pacer).await
    }

    async fn mkcol(&self, path: &RelativePath) -> Result<PutOutcome, RemoteError> {
        let response = self
            .signed(Self::method("MKCOL")?, self.url_for(path))
            .await?
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        let response = self.check_status(response).await?;
        self.outcome_from(&response, path).await
    }

    async fn delete(&self, path: &RelativePath) -> Result<(), RemoteError> {
        let response = self
            .signed(Method::DELETE, self.url_for(path))
            .await?
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        self.check_status(response).await?;
        Ok(())
    }

    async fn move_item(
        &self,
        from: &RelativePath,
        to: &RelativePath,
    ) -> Result<PutOutcome, RemoteError> {
        let response = self
            .signed(Self::method("MOVE")?, self.url_for(from))
            .await?
            .header("Destination", self.url_for(to).to_string())
            .header("Overwrite", "F")
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        let response = self.check_status(response).await?;
        self.outcome_from(&response, to).await
    }

    async fn create_transfer(
        &self,
        path: &RelativePath,
        total_size: u64,
    ) -> Result<TransferSession, RemoteError> {
        transfers::create_transfer(self, path, total_size).await
    }

    async fn transfer_offset(&self, session: &TransferSession) -> Result<u64, RemoteError> {
        transfers::transfer_offset(self, session).await
    }

    async fn upload_chunk(
        &self,
        session: &TransferSession,
        offset: u64,
        data: Bytes,
        pacer: Option<Arc<dyn TransferPacer>>,
    ) -> Result<(), RemoteError> {
        transfers::upload_chunk(self, session, offset, data, pacer).await
    }

    async fn finalize_transfer(
        &self,
        session: &TransferSession,
        path: &RelativePath,
        args: FinalizeArgs,
    ) -> Result<PutOutcome, RemoteError> {
        transfers::finalize_transfer(self, session, path, args).await
    }

    async fn abort_transfer(&self, session: &TransferSession) -> Result<(), RemoteError> {
        transfers::abort_transfer(self, session).await
    }

    fn is_http2(&self) -> bool {
        self.http2_seen.load(Ordering::Acquire)
    }
}
