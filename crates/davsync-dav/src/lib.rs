//! davsync-dav - WebDAV remote adapter
//!
//! Implements the [`RemoteClient`](davsync_core::ports::RemoteClient) port
//! against a WebDAV-style server:
//!
//! - PROPFIND listings (depth 0/1) with the custom properties the engine
//!   needs (file id, permissions, checksums)
//! - streamed, resumable downloads and `If-Match`-guarded uploads
//! - three chunked-upload dialects behind one session API
//! - the capabilities document client
//!
//! The adapter owns all HTTP concerns; the engine never sees reqwest.

pub mod capabilities;
pub mod client;
pub mod propfind;
pub mod transfers;

pub use client::DavClient;
