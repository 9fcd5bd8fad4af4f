//! Block identifiers for strata storage.

use serde::{Deserialize, Serialize};

/// Default block size in bytes (1 MiB), the unit the block manager stripes.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Identifier of a storage file registered with the block manager.
pub type FileId = u32;

/// Identifier of a physical disk (one disk queue and worker per disk).
pub type DiskId = u32;

/// Block identifier: names one fixed-size block inside a storage file.
///
/// Two BIDs are equal iff they name the same file and the same byte offset.
/// The derived ordering sorts by file first and offset second, which is the
/// order the iterator map relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bid {
    /// Storage file holding the block.
    pub file: FileId,
    /// Byte offset of the block within the file.
    pub offset: u64,
}

impl Bid {
    /// Encoded size of a BID inside a block (file: 4, offset: 8).
    pub const ENCODED_SIZE: usize = 12;

    /// Sentinel for "no block" (unlinked sibling, empty tree).
    pub const INVALID: Bid = Bid {
        file: FileId::MAX,
        offset: u64::MAX,
    };

    /// Creates a new Bid.
    pub fn new(file: FileId, offset: u64) -> Self {
        Self { file, offset }
    }

    /// Returns true unless this is the `INVALID` sentinel.
    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Maps the sentinel to `None`.
    #[inline]
    pub fn valid(self) -> Option<Bid> {
        if self.is_valid() {
            Some(self)
        } else {
            None
        }
    }

    /// Serializes the BID (little-endian).
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..4].copy_from_slice(&self.file.to_le_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    /// Deserializes a BID written by `to_bytes`.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let file = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let offset = u64::from_le_bytes([
            buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
        ]);
        Self { file, offset }
    }
}

impl From<Option<Bid>> for Bid {
    fn from(value: Option<Bid>) -> Self {
        value.unwrap_or(Bid::INVALID)
    }
}

impl std::fmt::Display for Bid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "[{}:{:#x}]", self.file, self.offset)
        } else {
            write!(f, "[invalid]")
        }
    }
}
