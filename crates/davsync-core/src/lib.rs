//! davsync-core - Domain model and port traits
//!
//! The core crate is dependency-light and owns everything the other crates
//! agree on:
//!
//! - the domain model: [`domain::SyncFileItem`] work items, validated
//!   newtypes, journal records, pin states and remote permissions
//! - typed configuration with validation ([`config`])
//! - the server capabilities model ([`capabilities`])
//! - the port traits the engine is written against ([`ports`]): the WebDAV
//!   remote, the credential provider and the virtual-file strategy
//! - the event types published per sync root ([`events`])
//!
//! Adapters (SQLite journal, WebDAV client, VFS strategies) live in their
//! own crates and depend on this one, never the other way around.

pub mod capabilities;
pub mod config;
pub mod domain;
pub mod events;
pub mod ports;

pub use domain::errors::DomainError;
