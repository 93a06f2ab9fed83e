//! PROPFIND request bodies and multistatus parsing
//!
//! The engine asks for a fixed property set; the parser is tolerant of
//! namespace prefixes (it matches on local names) and of servers that
//! split properties across several `propstat` blocks.

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use quick_xml::events::Event;
use quick_xml::Reader;

use davsync_core::domain::{Checksum, RemotePermissions};
use davsync_core::ports::RemoteError;

/// The property set requested with every listing.
pub const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:prop>
    <d:getetag/>
    <d:getlastmodified/>
    <d:getcontentlength/>
    <d:resourcetype/>
    <oc:fileid/>
    <oc:permissions/>
    <oc:checksums/>
    <oc:size/>
  </d:prop>
</d:propfind>"#;

/// One `response` element of a multistatus document, with the properties
/// the engine consumes already decoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropfindEntry {
    /// Percent-decoded absolute href path (no scheme/host).
    pub href: String,
    pub is_collection: bool,
    pub content_length: Option<u64>,
    /// `oc:size` includes directory contents; used by the big-folder guard.
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub file_id: Option<String>,
    pub permissions: Option<RemotePermissions>,
    pub checksum: Option<Checksum>,
}

/// Strips a namespace prefix, keeping the local element name.
fn local_name(qualified: &[u8]) -> &[u8] {
    match qualified.iter().rposition(|&b| b == b':') {
        Some(idx) => &qualified[idx + 1..],
        None => qualified,
    }
}

/// Parses a `207 Multi-Status` body into entries, in document order.
pub fn parse_multistatus(xml: &str) -> Result<Vec<PropfindEntry>, RemoteError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<PropfindEntry> = None;
    // name of the property element whose text we are about to read
    let mut field: Vec<u8> = Vec::new();
    let mut in_href = false;
    let mut status_ok = true;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = local_name(e.name().as_ref()).to_vec();
                match name.as_slice() {
                    b"response" => {
                        current = Some(PropfindEntry::default());
                        status_ok = true;
                    }
                    b"href" => in_href = true,
                    b"collection" => {
                        if let Some(entry) = current.as_mut() {
                            entry.is_collection = true;
                        }
                    }
                    b"propstat" => status_ok = true,
                    _ => field = name,
                }
            }
            Ok(Event::Text(ref t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| RemoteError::Protocol(format!("bad multistatus text: {e}")))?
                    .into_owned();
                let Some(entry) = current.as_mut() else {
                    continue;
                };
                if in_href {
                    entry.href = percent_decode_str(&text)
                        .decode_utf8()
                        .map_err(|e| {
                            RemoteError::Protocol(format!("undecodable href '{text}': {e}"))
                        })?
                        .into_owned();
                    continue;
                }
                match field.as_slice() {
                    b"status" => {
                        status_ok = text.contains("200");
                    }
                    _ if !status_ok => {}
                    b"getetag" => entry.etag = Some(text),
                    b"getlastmodified" => {
                        entry.mtime = DateTime::parse_from_rfc2822(&text)
                            .ok()
                            .map(|dt| dt.with_timezone(&Utc));
                    }
                    b"getcontentlength" => entry.content_length = text.parse().ok(),
                    b"size" => entry.size = text.parse().ok(),
                    b"fileid" | b"id" => entry.file_id = Some(text),
                    b"permissions" => {
                        entry.permissions = Some(RemotePermissions::from_dav_string(&text));
                    }
                    b"checksum" => {
                        // servers may list several, space separated; the
                        // first parseable one wins
                        if entry.checksum.is_none() {
                            entry.checksum = text
                                .split_whitespace()
                                .find_map(|c| Checksum::parse_header(c).ok());
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                let name = local_name(e.name().as_ref()).to_vec();
                match name.as_slice() {
                    b"href" => in_href = false,
                    b"response" => {
                        if let Some(entry) = current.take() {
                            if entry.href.is_empty() {
                                return Err(RemoteError::Protocol(
                                    "multistatus response without href".to_string(),
                                ));
                            }
                            entries.push(entry);
                        }
                    }
                    _ => field.clear(),
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(RemoteError::Protocol(format!("invalid multistatus: {e}")));
            }
            _ => {}
        }
    }

    Ok(entries)
}
