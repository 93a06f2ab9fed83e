//! Domain model for the sync engine
//!
//! Everything in here is plain data with validation; no I/O.

pub mod errors;
pub mod newtypes;
pub mod permissions;
pub mod pin;
pub mod record;
pub mod sync_item;

pub use errors::DomainError;
pub use newtypes::{Checksum, ChecksumAlgorithm, Etag, FileId, RelativePath, TransferId};
pub use permissions::RemotePermissions;
pub use pin::{Availability, PinState};
pub use record::JournalRecord;
pub use sync_item::{Direction, Instruction, ItemKind, ItemStatus, SyncFileItem};
