//! Local directory disk

use super::{DirEntry, Disk, DiskUsage, check_path};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tierstore_common::{ByteRange, DiskKind, Error, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Disk backed by plain files under a root directory
pub struct LocalDisk {
    name: String,
    root: PathBuf,
    capacity: Option<u64>,
    reserved: Arc<AtomicU64>,
}

impl LocalDisk {
    pub fn open(name: impl Into<String>, root: impl Into<PathBuf>, capacity: Option<u64>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            name: name.into(),
            root,
            capacity,
            reserved: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let path = check_path(path)?;
        Ok(if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        })
    }

    fn map_err(&self, path: &str, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::file_not_found(&self.name, path)
        } else {
            Error::DiskIo(e)
        }
    }
}

/// Free and total bytes of the filesystem holding `path`
pub(crate) fn filesystem_space(path: &Path) -> Result<(u64, u64)> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| Error::DiskIo(std::io::Error::from(e)))?;
    let fragment = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * fragment;
    let free = stat.blocks_available() as u64 * fragment;
    Ok((free, total))
}

#[async_trait]
impl Disk for LocalDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DiskKind {
        DiskKind::Local
    }

    async fn read(&self, path: &str, range: Option<ByteRange>) -> Result<Bytes> {
        let full = self.full_path(path)?;
        let data = match range {
            None => tokio::fs::read(&full).await.map_err(|e| self.map_err(path, e))?,
            Some(range) => {
                let mut file = tokio::fs::File::open(&full)
                    .await
                    .map_err(|e| self.map_err(path, e))?;
                let size = file.metadata().await?.len();
                let range = range.clamp_to(size);
                let mut buf = vec![0u8; range.len as usize];
                file.seek(SeekFrom::Start(range.offset)).await?;
                file.read_exact(&mut buf).await?;
                buf
            }
        };
        Ok(Bytes::from(data))
    }

    async fn write_file(&self, path: &str, data: Bytes) -> Result<()> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // A hard-linked target must not be modified through the other name
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::write(&full, &data).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.full_path(path)?).await?)
    }

    async fn file_size(&self, path: &str) -> Result<u64> {
        let meta = tokio::fs::metadata(self.full_path(path)?)
            .await
            .map_err(|e| self.map_err(path, e))?;
        Ok(meta.len())
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let mut entries = match tokio::fs::read_dir(self.full_path(dir)?).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut result = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            result.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: entry.file_type().await?.is_dir(),
            });
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn create_dirs(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.full_path(path)?).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(self.full_path(path)?)
            .await
            .map_err(|e| self.map_err(path, e))
    }

    async fn remove_recursive(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        let result = match tokio::fs::symlink_metadata(&full).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&full).await,
            Ok(_) => tokio::fs::remove_file(&full).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!("Removed {}:{}", self.name, path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let dst = self.full_path(to)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.full_path(from)?, &dst)
            .await
            .map_err(|e| self.map_err(from, e))
    }

    async fn hard_link(&self, src: &str, dst: &str) -> Result<()> {
        let target = self.full_path(dst)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::hard_link(self.full_path(src)?, &target)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => Error::FileExists {
                    disk: self.name.clone(),
                    path: dst.to_string(),
                },
                _ => self.map_err(src, e),
            })
    }

    async fn modified(&self, path: &str) -> Result<SystemTime> {
        let meta = tokio::fs::metadata(self.full_path(path)?)
            .await
            .map_err(|e| self.map_err(path, e))?;
        Ok(meta.modified()?)
    }

    fn usage(&self) -> Result<DiskUsage> {
        let (free, total) = filesystem_space(&self.root)?;
        let capacity = self.capacity.map_or(total, |c| c.min(total));
        Ok(DiskUsage {
            capacity,
            available: free.min(capacity),
            reserved: self.reserved.load(Ordering::Relaxed),
        })
    }

    fn reservations(&self) -> &Arc<AtomicU64> {
        &self.reserved
    }
}
