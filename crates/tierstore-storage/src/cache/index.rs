//! Persistent cache index backed by redb.
//!
//! One record per cached segment, keyed by disk, object key and offset.
//! The in-memory map in [`FileCache`](super::FileCache) is rebuilt from it on
//! open.

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SEGMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("segments");

/// Error type for cache index operations
#[derive(Debug, thiserror::Error)]
pub enum CacheIndexError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for CacheIndexError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<CacheIndexError> for tierstore_common::Error {
    fn from(e: CacheIndexError) -> Self {
        match e {
            CacheIndexError::Io(e) => Self::DiskIo(e),
            CacheIndexError::Bincode(e) => Self::Serialization(e.to_string()),
            other => Self::Internal(format!("cache index: {other}")),
        }
    }
}

pub type CacheIndexResult<T> = Result<T, CacheIndexError>;

/// Eviction class of a cached segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryClass {
    /// Never evicted (index and mark files under the pin policy)
    Pinned,
    Evictable,
}

/// Stored description of one cached segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub disk: String,
    pub key: String,
    pub offset: u64,
    pub size: u64,
    pub class: EntryClass,
}

impl SegmentRecord {
    pub fn index_key(disk: &str, key: &str, offset: u64) -> String {
        format!("{disk}\u{0}{key}\u{0}{offset:020}")
    }
}

/// Segment index database
pub struct CacheIndex {
    db: Database,
}

impl CacheIndex {
    /// Open (or create) the index database at the given path.
    pub fn open(path: impl AsRef<Path>) -> CacheIndexResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(SEGMENTS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    pub fn put(&self, record: &SegmentRecord) -> CacheIndexResult<()> {
        let key = SegmentRecord::index_key(&record.disk, &record.key, record.offset);
        let bytes = bincode::serialize(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SEGMENTS)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn remove_many(&self, keys: &[String]) -> CacheIndexResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SEGMENTS)?;
            for key in keys {
                table.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// All records; undecodable ones are skipped
    pub fn load(&self) -> CacheIndexResult<Vec<SegmentRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SEGMENTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            match bincode::deserialize::<SegmentRecord>(entry.1.value()) {
                Ok(record) => result.push(record),
                Err(e) => tracing::warn!(
                    "Skipping undecodable cache index record '{}': {}",
                    entry.0.value(),
                    e
                ),
            }
        }
        Ok(result)
    }

    pub fn clear(&self) -> CacheIndexResult<()> {
        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(SEGMENTS)?;
        {
            let _t = write_txn.open_table(SEGMENTS)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: u64, class: EntryClass) -> SegmentRecord {
        SegmentRecord {
            disk: "s3".into(),
            key: "data/abc/0123".into(),
            offset,
            size: 10,
            class,
        }
    }

    #[test]
    fn test_put_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::open(dir.path().join("cache_index.redb")).unwrap();

        index.put(&record(0, EntryClass::Evictable)).unwrap();
        index.put(&record(4096, EntryClass::Pinned)).unwrap();
        let mut loaded = index.load().unwrap();
        loaded.sort_by_key(|r| r.offset);
        assert_eq!(loaded, vec![record(0, EntryClass::Evictable), record(4096, EntryClass::Pinned)]);

        index
            .remove_many(&[SegmentRecord::index_key("s3", "data/abc/0123", 0)])
            .unwrap();
        assert_eq!(index.load().unwrap().len(), 1);

        index.clear().unwrap();
        assert!(index.load().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache_index.redb");
        {
            let index = CacheIndex::open(&path).unwrap();
            index.put(&record(0, EntryClass::Pinned)).unwrap();
        }
        let index = CacheIndex::open(&path).unwrap();
        assert_eq!(index.load().unwrap(), vec![record(0, EntryClass::Pinned)]);
    }
}
