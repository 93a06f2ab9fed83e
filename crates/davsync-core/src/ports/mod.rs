//! Port traits (driven/secondary ports)
//!
//! The engine is written against these interfaces; adapters implement them
//! in their own crates. DTOs here are port-level types, not domain
//! entities; discovery maps them onto [`crate::domain::SyncFileItem`]s.

pub mod credentials;
pub mod remote_client;
pub mod vfs;

pub use credentials::{Credential, CredentialProvider};
pub use remote_client::{
    DirectoryListing, DownloadOutcome, FinalizeArgs, ProgressFn, PutOutcome, RemoteClient,
    RemoteEntry, RemoteError, TransferPacer, TransferSession,
};
pub use vfs::{PlaceholderMetadata, Vfs};
