//! HTTP-level integration tests for the WebDAV adapter.

mod common;
mod test_listing;
mod test_transfers;
