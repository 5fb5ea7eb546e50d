//! Core type definitions for tierstore
//!
//! Identifiers and small value types shared by the client, the disks and the
//! part store.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a table; keys its store directory on every disk
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct TableId(Uuid);

impl TableId {
    /// Generate a new random table ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Relative path of the table's store directory: `store/<uuid3>/<uuid>`
    #[must_use]
    pub fn store_path(&self) -> String {
        let uuid = self.0.to_string();
        format!("store/{}/{}", &uuid[..3], uuid)
    }
}

impl Default for TableId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TableId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of storage behind a disk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskKind {
    /// Plain files under a local directory
    Local,
    /// Objects in a remote blob store, with local metadata
    ObjectStore,
}

impl fmt::Display for DiskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::ObjectStore => write!(f, "object_store"),
        }
    }
}

/// A contiguous byte range within a file or object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    #[must_use]
    pub const fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// Range covering a whole file of the given size
    #[must_use]
    pub const fn full(size: u64) -> Self {
        Self { offset: 0, len: size }
    }

    /// Exclusive end offset
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clamp the range to a file of `size` bytes
    #[must_use]
    pub fn clamp_to(&self, size: u64) -> Self {
        let offset = self.offset.min(size);
        let end = self.end().min(size);
        Self {
            offset,
            len: end - offset,
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.offset, self.end())
    }
}

/// Data class of a file, used by the cache to decide pinning
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileClass {
    /// Column data and everything else
    Data,
    /// Primary/skip indices and mark files
    IndexOrMark,
}

impl FileClass {
    /// Classify a logical file path by its extension
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path);
        let ext = name.rsplit_once('.').map_or("", |(_, ext)| ext);
        if ext == "idx" || ext.starts_with("mrk") {
            Self::IndexOrMark
        } else {
            Self::Data
        }
    }
}

/// Current wall-clock time as seconds since the Unix epoch
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_store_path() {
        let uuid = Uuid::parse_str("00000000-1000-4000-8000-000000000001").unwrap();
        let id = TableId::from_uuid(uuid);
        assert_eq!(
            id.store_path(),
            "store/000/00000000-1000-4000-8000-000000000001"
        );
        assert_eq!(id.to_string().parse::<TableId>().unwrap(), id);
    }

    #[test]
    fn test_byte_range_clamp() {
        let range = ByteRange::new(90, 20);
        assert_eq!(range.end(), 110);
        assert_eq!(range.clamp_to(100), ByteRange::new(90, 10));
        assert_eq!(range.clamp_to(50), ByteRange::new(50, 0));
        assert!(range.clamp_to(50).is_empty());
    }

    #[test]
    fn test_file_class() {
        assert_eq!(FileClass::from_path("p/primary.idx"), FileClass::IndexOrMark);
        assert_eq!(FileClass::from_path("p/id.mrk2"), FileClass::IndexOrMark);
        assert_eq!(FileClass::from_path("p/data.mrk3"), FileClass::IndexOrMark);
        assert_eq!(
            FileClass::from_path("p/skp_idx_min_max.idx"),
            FileClass::IndexOrMark
        );
        assert_eq!(FileClass::from_path("p/id.bin"), FileClass::Data);
        assert_eq!(FileClass::from_path("p/count.txt"), FileClass::Data);
    }
}
