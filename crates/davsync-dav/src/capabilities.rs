//! Capabilities document client
//!
//! Queried once per session from `ocs/v1.php/cloud/capabilities`. The DTOs
//! mirror the JSON envelope; [`to_server_capabilities`] maps the subset
//! the engine consumes onto the core model.

use std::time::Duration;

use serde::Deserialize;

use davsync_core::capabilities::{ChunkingNg, ServerCapabilities};
use davsync_core::domain::ChecksumAlgorithm;

/// Path of the capabilities endpoint, relative to the server base.
pub const CAPABILITIES_PATH: &str = "ocs/v1.php/cloud/capabilities?format=json";

#[derive(Debug, Deserialize)]
pub struct OcsEnvelope {
    pub ocs: OcsBody,
}

#[derive(Debug, Deserialize)]
pub struct OcsBody {
    pub data: OcsData,
}

#[derive(Debug, Deserialize)]
pub struct OcsData {
    pub capabilities: CapabilitiesDoc,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CapabilitiesDoc {
    pub core: CoreCaps,
    pub dav: DavCaps,
    pub files: FilesCaps,
    pub checksums: ChecksumCaps,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreCaps {
    /// Poll interval hint in milliseconds.
    pub pollinterval: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DavCaps {
    /// Version string of the offset-based chunking dialect ("1.0").
    pub chunking: Option<String>,
    pub min_chunk_size: Option<u64>,
    pub max_chunk_size: Option<u64>,
    pub target_chunk_upload_duration: Option<u64>,
    /// Token-based resumable uploads.
    pub resumable_upload: bool,
    pub reports: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilesCaps {
    pub bigfilechunking: bool,
    pub private_links: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChecksumCaps {
    pub supported_types: Vec<String>,
}

/// Maps the parsed document onto the core capabilities model.
pub fn to_server_capabilities(doc: &CapabilitiesDoc) -> ServerCapabilities {
    let defaults = ChunkingNg::default();
    let chunking_ng = ChunkingNg {
        enabled: doc.dav.chunking.as_deref().is_some_and(|v| !v.is_empty()),
        min_chunk_size: doc.dav.min_chunk_size.unwrap_or(defaults.min_chunk_size),
        max_chunk_size: doc.dav.max_chunk_size.unwrap_or(defaults.max_chunk_size),
        target_chunk_upload_duration: doc
            .dav
            .target_chunk_upload_duration
            .unwrap_or(defaults.target_chunk_upload_duration),
    };

    ServerCapabilities {
        chunking_ng,
        big_file_chunking: doc.files.bigfilechunking,
        resumable_upload: doc.dav.resumable_upload,
        checksum_types: doc
            .checksums
            .supported_types
            .iter()
            .filter_map(|t| ChecksumAlgorithm::parse(t))
            .collect(),
        dav_reports: doc.dav.reports.clone(),
        private_links: doc.files.private_links,
        remote_poll_interval: doc.core.pollinterval.map(Duration::from_millis),
    }
}
