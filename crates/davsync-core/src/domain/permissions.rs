//! Remote permission bits
//!
//! Servers advertise per-item permissions as a letter string in a custom
//! PROPFIND property. The engine consults these before dispatching jobs:
//! a forbidden operation becomes an error item instead of a doomed request.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Compact bitset over the permission letters a server may advertise.
///
/// | letter | meaning                    |
/// |--------|----------------------------|
/// | `C`    | may add files              |
/// | `K`    | may add sub-directories    |
/// | `W`    | may write (update content) |
/// | `D`    | may delete                 |
/// | `N`    | may rename                 |
/// | `V`    | may move                   |
/// | `R`    | may re-share               |
/// | `S`    | shared with me             |
/// | `M`    | mounted (external storage) |
///
/// A missing permissions property (legacy servers) means unrestricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemotePermissions(u16);

impl RemotePermissions {
    pub const ADD_FILE: u16 = 1 << 0;
    pub const ADD_SUBDIRS: u16 = 1 << 1;
    pub const WRITE: u16 = 1 << 2;
    pub const DELETE: u16 = 1 << 3;
    pub const RENAME: u16 = 1 << 4;
    pub const MOVE: u16 = 1 << 5;
    pub const RESHARE: u16 = 1 << 6;
    pub const SHARED: u16 = 1 << 7;
    pub const MOUNTED: u16 = 1 << 8;

    const ALL: u16 = Self::ADD_FILE
        | Self::ADD_SUBDIRS
        | Self::WRITE
        | Self::DELETE
        | Self::RENAME
        | Self::MOVE
        | Self::RESHARE;

    /// Permissions for servers that do not advertise any: everything allowed.
    pub fn unrestricted() -> Self {
        Self(Self::ALL)
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Parses the server's permission letter string. Unknown letters are
    /// ignored so newer servers stay compatible.
    pub fn from_dav_string(s: &str) -> Self {
        let mut bits = 0u16;
        for ch in s.chars() {
            bits |= match ch {
                'C' => Self::ADD_FILE,
                'K' => Self::ADD_SUBDIRS,
                'W' => Self::WRITE,
                'D' => Self::DELETE,
                'N' => Self::RENAME,
                'V' => Self::MOVE,
                'R' => Self::RESHARE,
                'S' => Self::SHARED,
                'M' => Self::MOUNTED,
                _ => 0,
            };
        }
        Self(bits)
    }

    fn has(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn can_add_file(&self) -> bool {
        self.has(Self::ADD_FILE)
    }

    pub fn can_add_subdirs(&self) -> bool {
        self.has(Self::ADD_SUBDIRS)
    }

    pub fn can_write(&self) -> bool {
        self.has(Self::WRITE)
    }

    pub fn can_delete(&self) -> bool {
        self.has(Self::DELETE)
    }

    pub fn can_rename(&self) -> bool {
        self.has(Self::RENAME)
    }

    pub fn can_move(&self) -> bool {
        self.has(Self::MOVE)
    }

    pub fn can_reshare(&self) -> bool {
        self.has(Self::RESHARE)
    }

    pub fn is_shared(&self) -> bool {
        self.has(Self::SHARED)
    }

    pub fn is_mounted(&self) -> bool {
        self.has(Self::MOUNTED)
    }
}

impl Default for RemotePermissions {
    fn default() -> Self {
        Self::unrestricted()
    }
}

impl Display for RemotePermissions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (flag, letter) in [
            (Self::ADD_FILE, 'C'),
            (Self::ADD_SUBDIRS, 'K'),
            (Self::WRITE, 'W'),
            (Self::DELETE, 'D'),
            (Self::RENAME, 'N'),
            (Self::MOVE, 'V'),
            (Self::RESHARE, 'R'),
            (Self::SHARED, 'S'),
            (Self::MOUNTED, 'M'),
        ] {
            if self.has(flag) {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}
