//! Domain error types

use thiserror::Error;

/// Errors raised by domain-level validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid relative path (absolute, backslashes, dot segments, ...)
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid etag value
    #[error("Invalid etag: {0}")]
    InvalidEtag(String),

    /// Invalid file id value
    #[error("Invalid file id: {0}")]
    InvalidFileId(String),

    /// Invalid checksum header (expected `<ALGO>:<hex>`)
    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),

    /// Invalid transfer id
    #[error("Invalid transfer id: {0}")]
    InvalidTransferId(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
