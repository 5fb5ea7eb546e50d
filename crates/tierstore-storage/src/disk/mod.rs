//! Virtual disks
//!
//! A [`Disk`] exposes a small filesystem-like interface over relative,
//! `/`-separated paths. Local disks map it onto a directory; object-store
//! disks keep the namespace as local metadata files and the bytes in a remote
//! bucket.

pub mod local;
pub mod object;
pub mod registry;

pub use local::LocalDisk;
pub use object::{ObjectDisk, ObjectMetadata, ObjectRef};
pub use registry::DiskRegistry;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tierstore_common::config::DiskConfig;
use tierstore_common::{ByteRange, DiskKind, Error, Result};

/// Directory entry returned by [`Disk::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Space accounting of a disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub capacity: u64,
    pub available: u64,
    /// Bytes promised to in-flight writers
    pub reserved: u64,
}

impl DiskUsage {
    /// Space left after outstanding reservations
    #[must_use]
    pub fn unreserved(&self) -> u64 {
        self.available.saturating_sub(self.reserved)
    }
}

/// Filesystem-like storage backend
#[async_trait]
pub trait Disk: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn kind(&self) -> DiskKind;

    /// Read a file, or a byte range of it
    async fn read(&self, path: &str, range: Option<ByteRange>) -> Result<Bytes>;

    /// Create or replace a file with `data`
    async fn write_file(&self, path: &str, data: Bytes) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn file_size(&self, path: &str) -> Result<u64>;

    /// Immediate children of a directory, sorted by name; empty if missing
    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>>;

    async fn create_dirs(&self, path: &str) -> Result<()>;

    /// Remove a single file
    async fn remove(&self, path: &str) -> Result<()>;

    /// Remove a file or directory tree; missing paths are not an error
    async fn remove_recursive(&self, path: &str) -> Result<()>;

    /// Rename a file or directory
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Make `dst` a second name for the file at `src`
    async fn hard_link(&self, src: &str, dst: &str) -> Result<()>;

    /// Last modification time of a file or directory
    async fn modified(&self, path: &str) -> Result<SystemTime>;

    fn usage(&self) -> Result<DiskUsage>;

    /// Reservation counter shared by all reservations on this disk
    fn reservations(&self) -> &Arc<AtomicU64>;

    /// Apply the hot-reloadable part of a new disk definition
    fn reload_settings(&self, _config: &DiskConfig) -> Result<()> {
        Ok(())
    }

    /// Promise `bytes` of space to a writer until the reservation is dropped
    fn reserve(&self, bytes: u64) -> Result<Reservation> {
        let available = self.usage()?.available;
        Reservation::claim(Arc::clone(self.reservations()), available, bytes)
    }
}

/// Space held for a pending write
#[derive(Debug)]
pub struct Reservation {
    counter: Arc<AtomicU64>,
    bytes: u64,
}

impl Reservation {
    /// Add `bytes` to `counter` unless that would exceed `available`
    ///
    /// The check and the add are a single compare-and-swap, so concurrent
    /// writers can never jointly reserve more than `available`.
    fn claim(counter: Arc<AtomicU64>, available: u64, bytes: u64) -> Result<Self> {
        let claimed = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
            (available.saturating_sub(reserved) >= bytes).then(|| reserved + bytes)
        });
        match claimed {
            Ok(_) => Ok(Self { counter, bytes }),
            Err(reserved) => Err(Error::InsufficientSpace {
                required: bytes,
                available: available.saturating_sub(reserved),
            }),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Sequential sink for one file, committed by [`FileWriter::finish`]
pub struct FileWriter {
    disk: Arc<dyn Disk>,
    path: String,
    buf: BytesMut,
}

impl FileWriter {
    pub fn new(disk: Arc<dyn Disk>, path: impl Into<String>) -> Self {
        Self {
            disk,
            path: path.into(),
            buf: BytesMut::new(),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Upload the buffered bytes; returns the file size
    pub async fn finish(self) -> Result<u64> {
        let size = self.buf.len() as u64;
        self.disk.write_file(&self.path, self.buf.freeze()).await?;
        Ok(size)
    }
}

/// Join relative path components with `/`, skipping empty ones
#[must_use]
pub fn join(base: &str, name: &str) -> String {
    match (base.trim_end_matches('/'), name.trim_start_matches('/')) {
        ("", name) => name.to_string(),
        (base, "") => base.to_string(),
        (base, name) => format!("{base}/{name}"),
    }
}

/// Reject absolute paths and parent references
pub(crate) fn check_path(path: &str) -> Result<&str> {
    let path = path.trim_end_matches('/');
    if path.starts_with('/') || path.split('/').any(|c| c == "..") {
        return Err(Error::invalid_argument(format!("invalid disk path '{path}'")));
    }
    Ok(path)
}

/// Copy one file between disks (cross-disk moves and clones)
pub async fn copy_file(from: &dyn Disk, to: &dyn Disk, src: &str, dst: &str) -> Result<u64> {
    let data = from.read(src, None).await?;
    let size = data.len() as u64;
    to.write_file(dst, data).await?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join("store/abc", "part"), "store/abc/part");
        assert_eq!(join("store/abc/", "/part"), "store/abc/part");
        assert_eq!(join("", "part"), "part");
        assert_eq!(join("store", ""), "store");
    }

    #[test]
    fn test_check_path() {
        assert_eq!(check_path("store/a/").unwrap(), "store/a");
        assert!(check_path("/etc/passwd").is_err());
        assert!(check_path("store/../../x").is_err());
    }

    #[test]
    fn test_reservation_releases_on_drop() {
        let counter = Arc::new(AtomicU64::new(0));
        {
            let r = Reservation::claim(Arc::clone(&counter), 150, 100).unwrap();
            assert_eq!(r.bytes(), 100);
            assert_eq!(counter.load(Ordering::Relaxed), 100);
            let err = Reservation::claim(Arc::clone(&counter), 150, 100).unwrap_err();
            assert!(matches!(err, Error::InsufficientSpace { required: 100, available: 50 }));
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_concurrent_reservations_never_overcommit() {
        let dir = tempfile::tempdir().unwrap();
        let disk = LocalDisk::open("default", dir.path(), Some(1000)).unwrap();
        let barrier = std::sync::Barrier::new(32);
        let granted: Vec<Reservation> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..32)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        disk.reserve(100).ok()
                    })
                })
                .collect();
            handles.into_iter().filter_map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(granted.len(), 10);
        assert_eq!(disk.usage().unwrap().reserved, 1000);
        assert!(disk.reserve(1).is_err());
        drop(granted);
        assert_eq!(disk.usage().unwrap().reserved, 0);
    }
}
