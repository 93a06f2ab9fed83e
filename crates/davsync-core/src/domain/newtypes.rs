//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the identifiers the sync engine passes
//! around. Each newtype validates at construction time so the rest of the
//! code can rely on well-formed values.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use super::errors::DomainError;

// ============================================================================
// RelativePath
// ============================================================================

/// A path relative to the sync root.
///
/// Invariants enforced at construction:
/// - forward-slash separated, never absolute
/// - NFC-normalized
/// - no empty, `.` or `..` segments, no backslashes
///
/// The empty path designates the sync root itself. Ordering is plain byte
/// order, which keeps plans and journal iteration deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelativePath(String);

impl RelativePath {
    /// Validates and normalizes a relative path.
    pub fn new(path: impl AsRef<str>) -> Result<Self, DomainError> {
        let path = path.as_ref();
        if path.is_empty() {
            return Ok(Self(String::new()));
        }
        if path.contains('\\') {
            return Err(DomainError::InvalidPath(format!(
                "backslash in path: {path}"
            )));
        }
        if path.starts_with('/') || path.ends_with('/') {
            return Err(DomainError::InvalidPath(format!(
                "leading or trailing slash: {path}"
            )));
        }
        for segment in path.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(DomainError::InvalidPath(format!(
                    "invalid segment in path: {path}"
                )));
            }
        }
        Ok(Self(path.nfc().collect()))
    }

    /// The sync root itself.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Returns true for the sync root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path component, `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            Some(self.0.rsplit('/').next().unwrap_or(&self.0))
        }
    }

    /// Parent path, `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Appends a single (already validated) name.
    pub fn join(&self, name: &str) -> Result<Self, DomainError> {
        if self.is_root() {
            Self::new(name)
        } else {
            Self::new(format!("{}/{}", self.0, name))
        }
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &RelativePath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Number of components (0 for the root).
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.split('/').count()
        }
    }

    /// Rewrites the `old_prefix` ancestor to `new_prefix`.
    ///
    /// Used when a directory rename is folded into its descendants.
    pub fn reparent(
        &self,
        old_prefix: &RelativePath,
        new_prefix: &RelativePath,
    ) -> Result<Self, DomainError> {
        if self == old_prefix {
            return Ok(new_prefix.clone());
        }
        if !old_prefix.is_ancestor_of(self) {
            return Err(DomainError::InvalidPath(format!(
                "{} is not under {}",
                self.0, old_prefix.0
            )));
        }
        let rest = &self.0[old_prefix.0.len() + usize::from(!old_prefix.is_root())..];
        if new_prefix.is_root() {
            Self::new(rest)
        } else {
            Self::new(format!("{}/{}", new_prefix.0, rest))
        }
    }
}

impl Display for RelativePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for RelativePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ============================================================================
// Etag
// ============================================================================

/// Opaque server-assigned version token.
///
/// Stored without surrounding quotes and without the `-gzip` suffix some
/// servers append; inequality implies a content or metadata change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Etag(String);

impl Etag {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, DomainError> {
        let normalized = Self::normalize(raw.as_ref());
        if normalized.is_empty() {
            return Err(DomainError::InvalidEtag("empty etag".to_string()));
        }
        Ok(Self(normalized))
    }

    /// Strips quotes, a weak-validator prefix and the `-gzip` suffix.
    fn normalize(raw: &str) -> String {
        let mut s = raw.trim();
        s = s.strip_prefix("W/").unwrap_or(s);
        s = s.trim_matches('"');
        s = s.strip_suffix("-gzip").unwrap_or(s);
        s.to_string()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quoted form for `If-Match` headers.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl Display for Etag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// FileId
// ============================================================================

/// Server-assigned identifier that is stable across renames.
///
/// Used by discovery to collapse a delete/create pair into a rename.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(DomainError::InvalidFileId("empty file id".to_string()));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// TransferId
// ============================================================================

/// Identifier of a chunked-upload session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(DomainError::InvalidTransferId(
                "empty transfer id".to_string(),
            ));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TransferId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Checksum
// ============================================================================

/// Checksum algorithms the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "MD5",
            ChecksumAlgorithm::Sha1 => "SHA1",
            ChecksumAlgorithm::Sha256 => "SHA256",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MD5" => Some(ChecksumAlgorithm::Md5),
            "SHA1" => Some(ChecksumAlgorithm::Sha1),
            "SHA256" => Some(ChecksumAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// A content checksum in `<ALGO>:<hex>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, hex: impl Into<String>) -> Result<Self, DomainError> {
        let hex = hex.into().to_ascii_lowercase();
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidChecksum(hex));
        }
        Ok(Self { algorithm, hex })
    }

    /// Parses the `<ALGO>:<hex>` header form.
    pub fn parse_header(header: &str) -> Result<Self, DomainError> {
        let (algo, hex) = header
            .split_once(':')
            .ok_or_else(|| DomainError::InvalidChecksum(header.to_string()))?;
        let algorithm = ChecksumAlgorithm::parse(algo)
            .ok_or_else(|| DomainError::InvalidChecksum(header.to_string()))?;
        Self::new(algorithm, hex)
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}
