//! Server capabilities model
//!
//! Queried once per session from the capabilities document. The engine
//! consumes a small subset: chunked-upload parameters, supported checksum
//! types, DAV report support and the advertised poll interval.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::newtypes::ChecksumAlgorithm;

/// Chunked-upload dialects, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkDialect {
    /// Resumable-upload token: session URL, HEAD for committed offset,
    /// PATCH appends.
    Token,
    /// Session collection with chunks named by byte offset, assembled by a
    /// final MOVE.
    Offsets,
    /// Session collection with zero-padded numbered chunks, assembled by a
    /// final MOVE.
    Numbered,
}

/// Parameters of the offset-based chunking dialect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingNg {
    pub enabled: bool,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Seconds one chunk upload should take; drives adaptive sizing.
    pub target_chunk_upload_duration: u64,
}

impl Default for ChunkingNg {
    fn default() -> Self {
        Self {
            enabled: false,
            min_chunk_size: 1024 * 1024,
            max_chunk_size: 1024 * 1024 * 1024,
            target_chunk_upload_duration: 60,
        }
    }
}

/// The subset of the capabilities document the engine consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub chunking_ng: ChunkingNg,
    /// Legacy numbered-chunk uploads.
    pub big_file_chunking: bool,
    /// Token-based resumable uploads.
    pub resumable_upload: bool,
    pub checksum_types: Vec<ChecksumAlgorithm>,
    pub dav_reports: Vec<String>,
    pub private_links: bool,
    /// Server-advertised override of the client's etag poll interval.
    pub remote_poll_interval: Option<Duration>,
}

impl ServerCapabilities {
    /// Picks the chunk dialect for uploads: the token dialect when the
    /// server advertises it, then server-assigned offsets, then numbered
    /// chunks. `None` means chunking is unavailable and large files go up
    /// as a single request.
    pub fn preferred_chunk_dialect(&self) -> Option<ChunkDialect> {
        if self.resumable_upload {
            Some(ChunkDialect::Token)
        } else if self.chunking_ng.enabled {
            Some(ChunkDialect::Offsets)
        } else if self.big_file_chunking {
            Some(ChunkDialect::Numbered)
        } else {
            None
        }
    }

    /// The strongest checksum both sides support, if any.
    pub fn preferred_checksum(&self) -> Option<ChecksumAlgorithm> {
        for algo in [
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Sha1,
            ChecksumAlgorithm::Md5,
        ] {
            if self.checksum_types.contains(&algo) {
                return Some(algo);
            }
        }
        None
    }
}
