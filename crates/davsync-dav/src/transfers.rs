//! Download, upload and chunked-transfer operations
//!
//! Downloads stream to the caller-provided temp file, resuming with a
//! `Range`/`If-Range` pair when a matching partial exists. Uploads guard
//! against lost updates with `If-Match`. Chunked uploads speak one of
//! three dialects selected from the server capabilities; the committed
//! offset is always re-queried from the server on resume so acknowledged
//! chunks are never retransmitted.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Method, Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use davsync_core::capabilities::ChunkDialect;
use davsync_core::domain::{Checksum, Etag, FileId, RelativePath, TransferId};
use davsync_core::ports::{
    DownloadOutcome, FinalizeArgs, ProgressFn, PutOutcome, RemoteClient, RemoteError,
    TransferPacer, TransferSession,
};

use crate::client::{mtime_header, DavClient};

fn header_value(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn session_url(session: &TransferSession) -> Result<Url, RemoteError> {
    Url::parse(&session.url)
        .map_err(|e| RemoteError::Protocol(format!("bad session url {}: {e}", session.url)))
}

fn session_child(session: &TransferSession, name: &str) -> Result<Url, RemoteError> {
    let mut url = session_url(session)?;
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(name);
    }
    Ok(url)
}

// ============================================================================
// Download
// ============================================================================

pub(crate) async fn download(
    client: &DavClient,
    path: &RelativePath,
    target: &Path,
    resume_offset: u64,
    resume_etag: Option<&Etag>,
    pacer: Option<Arc<dyn TransferPacer>>,
    progress: Option<ProgressFn>,
) -> Result<DownloadOutcome, RemoteError> {
    let mut request = client
        .signed(Method::GET, client.url_for(path))
        .await?
        .timeout(client.transfer_timeout());

    let resuming = resume_offset > 0 && resume_etag.is_some();
    if let (true, Some(etag)) = (resuming, resume_etag) {
        request = request
            .header("Range", format!("bytes={resume_offset}-"))
            .header("If-Range", etag.quoted());
    }

    let response = request
        .send()
        .await
        .map_err(|e| client.map_transport_error(e))?;
    let response = client.check_status(response).await?;

    let etag = header_value(&response, "OC-ETag")
        .or_else(|| header_value(&response, "ETag"))
        .ok_or_else(|| RemoteError::Protocol(format!("download of {path} without etag")))
        .and_then(|raw| {
            Etag::new(&raw).map_err(|e| RemoteError::Protocol(format!("{path}: {e}")))
        })?;
    let file_id = match header_value(&response, "OC-FileId") {
        Some(f) => Some(
            FileId::new(f).map_err(|e| RemoteError::Protocol(format!("{path}: {e}")))?,
        ),
        None => None,
    };
    let checksum = header_value(&response, "OC-Checksum")
        .and_then(|h| Checksum::parse_header(&h).ok());

    // 206 appends to the partial file; anything else starts over
    let partial = response.status() == StatusCode::PARTIAL_CONTENT;
    let mut written = if partial { resume_offset } else { 0 };
    let total = written + response.content_length().unwrap_or(0);

    let io_err = |e: std::io::Error| RemoteError::Io(e.to_string());
    let mut file = if partial {
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(target)
            .await
            .map_err(io_err)?
    } else {
        tokio::fs::File::create(target).await.map_err(io_err)?
    };

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| client.map_transport_error(e))?;
        if let Some(pacer) = &pacer {
            pacer.allow(chunk.len() as u64).await;
        }
        file.write_all(&chunk).await.map_err(io_err)?;
        written += chunk.len() as u64;
        if let Some(cb) = &progress {
            cb(written, total);
        }
    }
    file.flush().await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;

    debug!(path = %path, bytes = written, resumed = partial, "Download finished");
    Ok(DownloadOutcome {
        etag,
        file_id,
        size: written,
        checksum,
    })
}

// ============================================================================
// Simple upload
// ============================================================================

pub(crate) async fn put_file(
    client: &DavClient,
    path: &RelativePath,
    data: Bytes,
    if_match: Option<&Etag>,
    mtime: Option<DateTime<Utc>>,
    pacer: Option<Arc<dyn TransferPacer>>,
) -> Result<PutOutcome, RemoteError> {
    if let Some(pacer) = &pacer {
        pacer.allow(data.len() as u64).await;
    }

    let mut request = client
        .signed(Method::PUT, client.url_for(path))
        .await?
        .timeout(client.transfer_timeout())
        .header("Content-Type", "application/octet-stream");

    // If-Match rejects lost updates; If-None-Match guards first creation
    request = match if_match {
        Some(etag) => request.header("If-Match", etag.quoted()),
        None => request.header("If-None-Match", "*"),
    };
    if let Some(value) = mtime_header(mtime) {
        request = request.header("X-OC-Mtime", value);
    }

    let response = request
        .body(data)
        .send()
        .await
        .map_err(|e| client.map_transport_error(e))?;
    let response = client.check_status(response).await?;
    client.outcome_from(&response, path).await
}

// ============================================================================
// Chunked uploads
// ============================================================================

pub(crate) async fn create_transfer(
    client: &DavClient,
    path: &RelativePath,
    total_size: u64,
) -> Result<TransferSession, RemoteError> {
    let caps = client.capabilities().await?;
    let dialect = caps.preferred_chunk_dialect().ok_or_else(|| {
        RemoteError::Protocol("server advertises no chunked-upload dialect".to_string())
    })?;

    match dialect {
        ChunkDialect::Token => {
            let response = client
                .signed(Method::POST, client.uploads_url().clone())
                .await?
                .header("Upload-Length", total_size.to_string())
                .header("Destination", client.url_for(path).to_string())
                .send()
                .await
                .map_err(|e| client.map_transport_error(e))?;
            let response = client.check_status(response).await?;
            let location = header_value(&response, "Location").ok_or_else(|| {
                RemoteError::Protocol("upload session created without Location".to_string())
            })?;
            let url = client
                .uploads_url()
                .join(&location)
                .map_err(|e| RemoteError::Protocol(format!("bad session location: {e}")))?;
            let id = url
                .path_segments()
                .and_then(|mut s| s.next_back())
                .unwrap_or_default()
                .to_string();
            let id = TransferId::new(id)
                .map_err(|e| RemoteError::Protocol(format!("session id: {e}")))?;
            info!(path = %path, transfer_id = %id, "Resumable upload session created");
            Ok(TransferSession {
                id,
                dialect,
                url: url.to_string(),
            })
        }
        ChunkDialect::Offsets | ChunkDialect::Numbered => {
            let id = format!("{:016x}", rand::random::<u64>());
            let url = client.upload_session_url(&id);
            let response = client
                .signed(DavClient::method("MKCOL")?, url.clone())
                .await?
                .send()
                .await
                .map_err(|e| client.map_transport_error(e))?;
            client.check_status(response).await?;
            let id = TransferId::new(id)
                .map_err(|e| RemoteError::Protocol(format!("session id: {e}")))?;
            info!(path = %path, transfer_id = %id, ?dialect, "Chunk session collection created");
            Ok(TransferSession {
                id,
                dialect,
                url: url.to_string(),
            })
        }
    }
}

pub(crate) async fn transfer_offset(
    client: &DavClient,
    session: &TransferSession,
) -> Result<u64, RemoteError> {
    match session.dialect {
        ChunkDialect::Token => {
            let response = client
                .signed(Method::HEAD, session_url(session)?)
                .await?
                .send()
                .await
                .map_err(|e| client.map_transport_error(e))?;
            let response = client.check_status(response).await?;
            header_value(&response, "Upload-Offset")
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| {
                    RemoteError::Protocol("session HEAD without Upload-Offset".to_string())
                })
        }
        ChunkDialect::Offsets | ChunkDialect::Numbered => {
            // the committed bytes are whatever chunk bodies the session
            // collection already holds
            let entries = client.propfind_url(session_url(session)?, 1).await?;
            Ok(entries
                .iter()
                .filter(|e| !e.is_collection)
                .filter_map(|e| e.content_length)
                .sum())
        }
    }
}

pub(crate) async fn upload_chunk(
    client: &DavClient,
    session: &TransferSession,
    offset: u64,
    data: Bytes,
    pacer: Option<Arc<dyn TransferPacer>>,
) -> Result<(), RemoteError> {
    if let Some(pacer) = &pacer {
        pacer.allow(data.len() as u64).await;
    }

    let response = match session.dialect {
        ChunkDialect::Token => client
            .signed(Method::PATCH, session_url(session)?)
            .await?
            .timeout(client.transfer_timeout())
            .header("Upload-Offset", offset.to_string())
            .header("Content-Type", "application/offset+octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| client.map_transport_error(e))?,
        // chunk names are byte offsets, zero padded so they sort in
        // file order for the assembling MOVE
        ChunkDialect::Offsets | ChunkDialect::Numbered => client
            .signed(Method::PUT, session_child(session, &format!("{offset:016}"))?)
            .await?
            .timeout(client.transfer_timeout())
            .header("Content-Type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| client.map_transport_error(e))?,
    };
    client.check_status(response).await?;
    Ok(())
}

pub(crate) async fn finalize_transfer(
    client: &DavClient,
    session: &TransferSession,
    path: &RelativePath,
    args: FinalizeArgs,
) -> Result<PutOutcome, RemoteError> {
    let destination = client.url_for(path).to_string();

    let mut request = match session.dialect {
        ChunkDialect::Token => client
            .signed(Method::POST, session_url(session)?)
            .await?
            .header("Destination", &destination),
        ChunkDialect::Offsets => client
            .signed(DavClient::method("MOVE")?, session_child(session, ".file")?)
            .await?
            .header("Destination", &destination)
            .header("Overwrite", "T"),
        ChunkDialect::Numbered => client
            .signed(DavClient::method("MOVE")?, session_url(session)?)
            .await?
            .header("Destination", &destination)
            .header("Overwrite", "T"),
    };

    request = request.header("OC-Total-Length", args.total_size.to_string());
    if let Some(etag) = &args.if_match {
        request = request.header("If-Match", etag.quoted());
    }
    if let Some(value) = mtime_header(args.mtime) {
        request = request.header("X-OC-Mtime", value);
    }
    if let Some(checksum) = &args.checksum {
        request = request.header("OC-Checksum", checksum.to_string());
    }

    let response = request
        .send()
        .await
        .map_err(|e| client.map_transport_error(e))?;
    let response = client.check_status(response).await?;
    info!(path = %path, transfer_id = %session.id, "Chunked upload assembled");
    client.outcome_from(&response, path).await
}

pub(crate) async fn abort_transfer(
    client: &DavClient,
    session: &TransferSession,
) -> Result<(), RemoteError> {
    let response = client
        .signed(Method::DELETE, session_url(session)?)
        .await?
        .send()
        .await
        .map_err(|e| client.map_transport_error(e))?;
    // a session that is already gone counts as aborted
    match client.check_status(response).await {
        Ok(_) => Ok(()),
        Err(RemoteError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
