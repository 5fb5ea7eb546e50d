//! Object-store disk
//!
//! The namespace lives in a local metadata directory that mirrors the
//! logical paths. Each logical file is a small JSON document listing the
//! remote object(s) holding its bytes. Objects are immutable and written
//! under fresh random keys, so renames only move metadata.
//!
//! Hard links are real links of the metadata file, and the document carries
//! a reference count of the extra names. Removing a name decrements the
//! count; only the last name deletes the remote objects.

use super::{DirEntry, Disk, DiskUsage, check_path};
use crate::cache::FileCache;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tierstore_client::{ObjectStore, RetryPolicy, with_retry};
use tierstore_common::config::DiskConfig;
use tierstore_common::{ByteRange, DiskKind, Error, FileClass, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

const METADATA_VERSION: u32 = 1;

/// One remote object backing (part of) a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub key: String,
    pub size: u64,
}

/// Local metadata document of a file on an object-store disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub version: u32,
    pub objects: Vec<ObjectRef>,
    pub total_size: u64,
    /// Number of additional hard links sharing these objects
    pub ref_count: u32,
}

impl ObjectMetadata {
    fn new(objects: Vec<ObjectRef>) -> Self {
        let total_size = objects.iter().map(|o| o.size).sum();
        Self {
            version: METADATA_VERSION,
            objects,
            total_size,
            ref_count: 0,
        }
    }

    fn load(path: &Path) -> std::io::Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Rewrite in place so that every hard link sees the update
    fn store_in_place(&self, path: &Path) -> std::io::Result<()> {
        let data = serde_json::to_vec(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&data)?;
        file.sync_data()
    }

    /// Create a fresh document; fails if the path exists
    fn store_new(&self, path: &Path) -> std::io::Result<()> {
        let data = serde_json::to_vec(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(&data)?;
        file.sync_data()
    }
}

/// Hot-reloadable part of the disk definition
#[derive(Debug, Clone)]
pub struct ObjectDiskSettings {
    pub upload_threshold: u64,
    pub multipart_part_size: u64,
    pub retry: RetryPolicy,
    pub no_delete: bool,
}

impl From<&DiskConfig> for ObjectDiskSettings {
    fn from(config: &DiskConfig) -> Self {
        Self {
            upload_threshold: config.upload_threshold,
            multipart_part_size: config.multipart_part_size.max(1),
            retry: RetryPolicy::from(&config.retry),
            no_delete: config.no_delete,
        }
    }
}

/// Disk storing file bytes in a remote bucket
pub struct ObjectDisk {
    name: String,
    store: Arc<dyn ObjectStore>,
    root_prefix: String,
    metadata_root: PathBuf,
    settings: RwLock<Arc<ObjectDiskSettings>>,
    cache: Option<Arc<FileCache>>,
    /// Serializes reference-count updates
    link_lock: Mutex<()>,
    reserved: Arc<AtomicU64>,
}

impl ObjectDisk {
    pub fn open(
        config: &DiskConfig,
        store: Arc<dyn ObjectStore>,
        cache: Option<Arc<FileCache>>,
    ) -> Result<Self> {
        let metadata_root = config.metadata_path.clone().ok_or_else(|| {
            Error::configuration(format!("disk '{}' has no metadata_path", config.name))
        })?;
        std::fs::create_dir_all(&metadata_root)?;
        info!(
            "Opened object store disk '{}' (bucket {}, prefix '{}', metadata {})",
            config.name,
            store.bucket(),
            config.root_prefix,
            metadata_root.display()
        );
        Ok(Self {
            name: config.name.clone(),
            store,
            root_prefix: config.root_prefix.trim_end_matches('/').to_string(),
            metadata_root,
            settings: RwLock::new(Arc::new(ObjectDiskSettings::from(config))),
            cache,
            link_lock: Mutex::new(()),
            reserved: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Current settings snapshot
    pub fn settings(&self) -> Arc<ObjectDiskSettings> {
        Arc::clone(&self.settings.read())
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<FileCache>> {
        self.cache.as_ref()
    }

    /// Metadata document of a logical file
    pub fn metadata(&self, path: &str) -> Result<ObjectMetadata> {
        let full = self.metadata_path(path)?;
        ObjectMetadata::load(&full).map_err(|e| self.map_err(path, e))
    }

    fn metadata_path(&self, path: &str) -> Result<PathBuf> {
        let path = check_path(path)?;
        Ok(if path.is_empty() {
            self.metadata_root.clone()
        } else {
            self.metadata_root.join(path)
        })
    }

    fn map_err(&self, path: &str, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::file_not_found(&self.name, path)
        } else {
            Error::DiskIo(e)
        }
    }

    /// Fresh key `<prefix>/<3 chars>/<uuid>`
    fn generate_key(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{}/{}/{}", self.root_prefix, &id[..3], id)
    }

    async fn upload(&self, key: &str, data: Bytes, settings: &ObjectDiskSettings) -> Result<()> {
        let store = &self.store;
        let policy = &settings.retry;
        if (data.len() as u64) < settings.upload_threshold {
            return with_retry(policy, "PutObject", || store.put_object(key, data.clone())).await;
        }

        let upload_id =
            with_retry(policy, "CreateMultipartUpload", || store.create_multipart_upload(key))
                .await?;
        let result = async {
            let part_size = settings.multipart_part_size as usize;
            let mut part_number = 1u32;
            let mut offset = 0usize;
            loop {
                let end = (offset + part_size).min(data.len());
                let chunk = data.slice(offset..end);
                with_retry(policy, "UploadPart", || {
                    store.upload_part(key, &upload_id, part_number, chunk.clone())
                })
                .await?;
                offset = end;
                if offset >= data.len() {
                    break;
                }
                part_number += 1;
            }
            with_retry(policy, "CompleteMultipartUpload", || {
                store.complete_multipart_upload(key, &upload_id)
            })
            .await
        }
        .await;

        if let Err(e) = &result {
            warn!(
                "Multipart upload of {} to disk '{}' failed: {}, aborting",
                key, self.name, e
            );
            if let Err(abort) = store.abort_multipart_upload(key, &upload_id).await {
                warn!("Failed to abort upload {}: {}", upload_id, abort);
            }
        }
        result
    }

    async fn read_object(
        &self,
        object: &ObjectRef,
        range: ByteRange,
        class: FileClass,
        settings: &ObjectDiskSettings,
    ) -> Result<Bytes> {
        let store = Arc::clone(&self.store);
        let policy = settings.retry.clone();
        let key = object.key.clone();
        let fetch = move |segment: ByteRange| {
            let store = Arc::clone(&store);
            let policy = policy.clone();
            let key = key.clone();
            async move {
                with_retry(&policy, "GetObject", || store.get_object(&key, Some(segment))).await
            }
        };
        match &self.cache {
            Some(cache) => {
                cache
                    .read(&self.name, &object.key, object.size, range, class, fetch)
                    .await
            }
            None => fetch(range).await,
        }
    }

    /// Drop one name of a file; deletes the objects when it was the last one
    ///
    /// The last name is unlinked while `link_lock` is held, so a concurrent
    /// [`Disk::hard_link`] either completes first and keeps the objects alive
    /// or fails with not-found.
    async fn remove_file(&self, path: &str) -> Result<()> {
        let full = self.metadata_path(path)?;
        let meta = {
            let _guard = self.link_lock.lock();
            let mut meta = ObjectMetadata::load(&full).map_err(|e| self.map_err(path, e))?;
            if meta.ref_count > 0 {
                meta.ref_count -= 1;
                meta.store_in_place(&full)?;
                std::fs::remove_file(&full)?;
                return Ok(());
            }
            std::fs::remove_file(&full).map_err(|e| self.map_err(path, e))?;
            meta
        };

        if let Err(e) = self.delete_objects(&meta.objects).await {
            // Keep the name so a retried remove can finish the delete
            if let Err(restore) = meta.store_new(&full) {
                warn!(
                    "Disk '{}' could not restore metadata of {} after failed delete: {}",
                    self.name, path, restore
                );
            }
            return Err(e);
        }
        Ok(())
    }

    async fn delete_objects(&self, objects: &[ObjectRef]) -> Result<()> {
        let settings = self.settings();
        for object in objects {
            if let Some(cache) = &self.cache {
                cache.invalidate_object(&self.name, &object.key);
            }
            if settings.no_delete {
                debug!(
                    "Disk '{}' keeps object {} (deletes disabled)",
                    self.name, object.key
                );
                continue;
            }
            let store = &self.store;
            with_retry(&settings.retry, "DeleteObject", || {
                store.delete_object(&object.key)
            })
            .await?;
        }
        Ok(())
    }

    /// Logical file paths under a metadata directory, depth first
    fn collect_files(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let logical = super::join(prefix, &name);
            if entry.file_type()?.is_dir() {
                self.collect_files(&entry.path(), &logical, out)?;
            } else {
                out.push(logical);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Disk for ObjectDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DiskKind {
        DiskKind::ObjectStore
    }

    async fn read(&self, path: &str, range: Option<ByteRange>) -> Result<Bytes> {
        let settings = self.settings();
        let meta = self.metadata(path)?;
        let range = range
            .unwrap_or(ByteRange::full(meta.total_size))
            .clamp_to(meta.total_size);
        let class = FileClass::from_path(path);

        let mut out = BytesMut::with_capacity(range.len as usize);
        let mut object_start = 0u64;
        for object in &meta.objects {
            let object_end = object_start + object.size;
            let start = range.offset.max(object_start);
            let end = range.end().min(object_end);
            if start < end {
                let local = ByteRange::new(start - object_start, end - start);
                let data = self.read_object(object, local, class, &settings).await?;
                out.extend_from_slice(&data);
            }
            object_start = object_end;
            if object_start >= range.end() {
                break;
            }
        }
        Ok(out.freeze())
    }

    async fn write_file(&self, path: &str, data: Bytes) -> Result<()> {
        let settings = self.settings();
        let full = self.metadata_path(path)?;
        if full.exists() {
            self.remove_file(path).await?;
        }

        let key = self.generate_key();
        let size = data.len() as u64;
        self.upload(&key, data, &settings).await?;

        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let meta = ObjectMetadata::new(vec![ObjectRef { key, size }]);
        if let Err(e) = meta.store_new(&full) {
            // Nothing references the object yet
            self.delete_objects(&meta.objects).await.ok();
            return Err(e.into());
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.metadata_path(path)?.exists())
    }

    async fn file_size(&self, path: &str) -> Result<u64> {
        Ok(self.metadata(path)?.total_size)
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let entries = match std::fs::read_dir(self.metadata_path(dir)?) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut result = Vec::new();
        for entry in entries {
            let entry = entry?;
            result.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn create_dirs(&self, path: &str) -> Result<()> {
        std::fs::create_dir_all(self.metadata_path(path)?)?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.remove_file(path).await
    }

    async fn remove_recursive(&self, path: &str) -> Result<()> {
        let full = self.metadata_path(path)?;
        let meta = match std::fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_dir() {
            return self.remove_file(path).await;
        }

        let mut files = Vec::new();
        self.collect_files(&full, path, &mut files)?;
        for file in &files {
            self.remove_file(file).await?;
        }
        match std::fs::remove_dir_all(&full) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!("Removed {}:{} ({} files)", self.name, path, files.len());
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let dst = self.metadata_path(to)?;
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(self.metadata_path(from)?, &dst).map_err(|e| self.map_err(from, e))
    }

    async fn hard_link(&self, src: &str, dst: &str) -> Result<()> {
        let src_full = self.metadata_path(src)?;
        let dst_full = self.metadata_path(dst)?;
        if let Some(parent) = dst_full.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let _guard = self.link_lock.lock();
        let mut meta = ObjectMetadata::load(&src_full).map_err(|e| self.map_err(src, e))?;
        std::fs::hard_link(&src_full, &dst_full).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => Error::FileExists {
                disk: self.name.clone(),
                path: dst.to_string(),
            },
            _ => Error::DiskIo(e),
        })?;
        meta.ref_count += 1;
        meta.store_in_place(&src_full)?;
        Ok(())
    }

    async fn modified(&self, path: &str) -> Result<SystemTime> {
        let meta = std::fs::metadata(self.metadata_path(path)?).map_err(|e| self.map_err(path, e))?;
        Ok(meta.modified()?)
    }

    fn usage(&self) -> Result<DiskUsage> {
        Ok(DiskUsage {
            capacity: u64::MAX,
            available: u64::MAX,
            reserved: self.reserved.load(Ordering::Relaxed),
        })
    }

    fn reservations(&self) -> &Arc<AtomicU64> {
        &self.reserved
    }

    fn reload_settings(&self, config: &DiskConfig) -> Result<()> {
        let settings = ObjectDiskSettings::from(config);
        info!(
            "Disk '{}' settings reloaded: upload_threshold={}, multipart_part_size={}, no_delete={}",
            self.name, settings.upload_threshold, settings.multipart_part_size, settings.no_delete
        );
        *self.settings.write() = Arc::new(settings);
        Ok(())
    }
}
