//! Directory-backed object store
//!
//! One file per object under a root directory. Uploads are written to a
//! temporary name and renamed into place, so a key is either absent or
//! complete. Multipart parts are staged under `.multipart/<upload_id>/`.

use crate::store::{ObjectInfo, ObjectStore, RequestStats};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tierstore_common::{ByteRange, Error, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use uuid::Uuid;

const MULTIPART_DIR: &str = ".multipart";
const TMP_SUFFIX: &str = ".tmp";

/// Bucket stored as a directory tree
pub struct FsStore {
    root: PathBuf,
    bucket: String,
    stats: RequestStats,
}

impl FsStore {
    /// Open (or create) a bucket rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(MULTIPART_DIR))?;
        let bucket = root.display().to_string();
        Ok(Self {
            root,
            bucket,
            stats: RequestStats::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.starts_with(MULTIPART_DIR)
            || key.split('/').any(|c| c == ".." || c == ".")
        {
            return Err(Error::invalid_argument(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(key))
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(MULTIPART_DIR).join(upload_id)
    }

    fn not_found(&self, key: &str) -> Error {
        Error::ObjectNotFound {
            bucket: self.bucket.clone(),
            key: key.to_string(),
        }
    }

    fn map_missing(&self, key: &str, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            self.not_found(key)
        } else {
            Error::DiskIo(e)
        }
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("{}{}", Uuid::new_v4().simple(), TMP_SUFFIX));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn stats(&self) -> &RequestStats {
        &self.stats
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        self.stats.put_object.fetch_add(1, Ordering::Relaxed);
        let path = self.object_path(key)?;
        self.write_atomic(&path, &data).await?;
        self.stats.record_written(data.len());
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        self.stats.create_multipart.fetch_add(1, Ordering::Relaxed);
        self.object_path(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let dir = self.upload_dir(&upload_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("key"), key.as_bytes()).await?;
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<()> {
        self.stats.upload_part.fetch_add(1, Ordering::Relaxed);
        if part_number == 0 {
            return Err(Error::InvalidPart { part_number });
        }
        let dir = self.upload_dir(upload_id);
        match tokio::fs::read_to_string(dir.join("key")).await {
            Ok(owner) if owner == key => {}
            _ => {
                return Err(Error::NoSuchUpload {
                    upload_id: upload_id.to_string(),
                });
            }
        }
        tokio::fs::write(dir.join(format!("{part_number:05}.part")), &data).await?;
        self.stats.record_written(data.len());
        Ok(())
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.stats.complete_multipart.fetch_add(1, Ordering::Relaxed);
        let dir = self.upload_dir(upload_id);
        match tokio::fs::read_to_string(dir.join("key")).await {
            Ok(owner) if owner == key => {}
            _ => {
                return Err(Error::NoSuchUpload {
                    upload_id: upload_id.to_string(),
                });
            }
        }

        let mut parts = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(number) = name.strip_suffix(".part") {
                if let Ok(number) = number.parse::<u32>() {
                    parts.push((number, entry.path()));
                }
            }
        }
        parts.sort_by_key(|(number, _)| *number);

        let mut data = BytesMut::new();
        for (_, path) in &parts {
            data.extend_from_slice(&tokio::fs::read(path).await?);
        }
        let path = self.object_path(key)?;
        self.write_atomic(&path, &data).await?;
        tokio::fs::remove_dir_all(&dir).await?;
        debug!(
            "Completed multipart upload {} of {} ({} parts)",
            upload_id,
            key,
            parts.len()
        );
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.stats.abort_multipart.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::remove_dir_all(self.upload_dir(upload_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_object(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes> {
        let path = self.object_path(key)?;
        let data = match range {
            None => tokio::fs::read(&path)
                .await
                .map_err(|e| self.map_missing(key, e))?,
            Some(range) => {
                let mut file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| self.map_missing(key, e))?;
                let size = file.metadata().await?.len();
                let range = range.clamp_to(size);
                let mut buf = vec![0u8; range.len as usize];
                file.seek(SeekFrom::Start(range.offset)).await?;
                file.read_exact(&mut buf).await?;
                buf
            }
        };
        self.stats.record_read(data.len());
        Ok(Bytes::from(data))
    }

    async fn head_object(&self, key: &str) -> Result<u64> {
        self.stats.head_object.fetch_add(1, Ordering::Relaxed);
        let path = self.object_path(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| self.map_missing(key, e))?;
        Ok(meta.len())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.stats.list_objects.fetch_add(1, Ordering::Relaxed);
        let mut result = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel.to_string_lossy().replace('\\', "/");
                if key.starts_with(MULTIPART_DIR) || key.ends_with(TMP_SUFFIX) {
                    continue;
                }
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    // Only descend where the prefix can still match
                    if prefix.starts_with(&key) || key.starts_with(prefix) {
                        pending.push(path);
                    }
                } else if key.starts_with(prefix) {
                    let size = entry.metadata().await?.len();
                    result.push(ObjectInfo { key, size });
                }
            }
        }
        result.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(result)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.stats.delete_object.fetch_add(1, Ordering::Relaxed);
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<()> {
        self.stats.copy_object.fetch_add(1, Ordering::Relaxed);
        let data = tokio::fs::read(self.object_path(src)?)
            .await
            .map_err(|e| self.map_missing(src, e))?;
        let path = self.object_path(dst)?;
        self.write_atomic(&path, &data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();

        store
            .put_object("data/abc/one", Bytes::from_static(b"111"))
            .await
            .unwrap();
        store
            .put_object("data/def/two", Bytes::from_static(b"2222"))
            .await
            .unwrap();
        store
            .put_object("other/three", Bytes::from_static(b"3"))
            .await
            .unwrap();

        let listed = store.list_objects("data/").await.unwrap();
        assert_eq!(
            listed,
            vec![
                ObjectInfo {
                    key: "data/abc/one".into(),
                    size: 3
                },
                ObjectInfo {
                    key: "data/def/two".into(),
                    size: 4
                },
            ]
        );

        store.delete_object("data/abc/one").await.unwrap();
        store.delete_object("data/abc/one").await.unwrap();
        assert_eq!(store.list_objects("data/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_multipart_and_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();

        let id = store.create_multipart_upload("data/big").await.unwrap();
        store
            .upload_part("data/big", &id, 1, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        store
            .upload_part("data/big", &id, 2, Bytes::from_static(b"def"))
            .await
            .unwrap();
        store.complete_multipart_upload("data/big", &id).await.unwrap();

        assert_eq!(store.head_object("data/big").await.unwrap(), 6);
        let range = store
            .get_object("data/big", Some(ByteRange::new(2, 3)))
            .await
            .unwrap();
        assert_eq!(&range[..], b"cde");
        assert_eq!(store.list_objects("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_sees_objects() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsStore::open(dir.path()).unwrap();
            store
                .put_object("data/x", Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        let store = FsStore::open(dir.path()).unwrap();
        assert_eq!(&store.get_object("data/x", None).await.unwrap()[..], b"x");
        assert!(store.object_path("../escape").is_err());
    }
}
