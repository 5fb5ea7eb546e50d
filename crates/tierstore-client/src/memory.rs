//! In-process object store
//!
//! Holds a whole bucket in memory. Besides serving as the backend of
//! `memory://` endpoints it can simulate the eventual consistency of real
//! listings: with a list lag of `n`, a deleted key keeps showing up in the
//! next `n` listings that cover it.

use crate::store::{ObjectInfo, ObjectStore, RequestStats, slice_range};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tierstore_common::{ByteRange, Error, Result};
use tracing::debug;
use uuid::Uuid;

/// Open multipart session
struct MultipartSession {
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

/// Deleted key still visible in listings
struct Tombstone {
    size: u64,
    remaining_lists: u32,
}

/// In-memory bucket
pub struct MemoryStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, Bytes>>,
    uploads: Mutex<HashMap<String, MultipartSession>>,
    tombstones: Mutex<BTreeMap<String, Tombstone>>,
    list_lag: AtomicU32,
    stats: RequestStats,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            uploads: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(BTreeMap::new()),
            list_lag: AtomicU32::new(0),
            stats: RequestStats::default(),
        }
    }

    /// Keep deleted keys visible for the next `lag` listings
    pub fn set_list_lag(&self, lag: u32) {
        self.list_lag.store(lag, Ordering::Relaxed);
    }

    /// Exact keys under a prefix, bypassing request accounting and list lag
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Exact object count under a prefix
    pub fn object_count(&self, prefix: &str) -> usize {
        self.keys(prefix).len()
    }

    /// Number of multipart sessions not yet completed or aborted
    pub fn open_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    fn insert(&self, key: &str, data: Bytes) {
        self.tombstones.lock().remove(key);
        self.objects.write().insert(key.to_string(), data);
    }

    fn not_found(&self, key: &str) -> Error {
        Error::ObjectNotFound {
            bucket: self.bucket.clone(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn stats(&self) -> &RequestStats {
        &self.stats
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        self.stats.put_object.fetch_add(1, Ordering::Relaxed);
        self.stats.record_written(data.len());
        self.insert(key, data);
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        self.stats.create_multipart.fetch_add(1, Ordering::Relaxed);
        let upload_id = Uuid::new_v4().to_string();
        self.uploads.lock().insert(
            upload_id.clone(),
            MultipartSession {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
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
        let mut uploads = self.uploads.lock();
        let session = uploads
            .get_mut(upload_id)
            .filter(|s| s.key == key)
            .ok_or_else(|| Error::NoSuchUpload {
                upload_id: upload_id.to_string(),
            })?;
        self.stats.record_written(data.len());
        session.parts.insert(part_number, data);
        Ok(())
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.stats.complete_multipart.fetch_add(1, Ordering::Relaxed);
        let session = {
            let mut uploads = self.uploads.lock();
            match uploads.get(upload_id) {
                Some(s) if s.key == key => uploads.remove(upload_id),
                _ => None,
            }
        }
        .ok_or_else(|| Error::NoSuchUpload {
            upload_id: upload_id.to_string(),
        })?;

        let total: usize = session.parts.values().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(total);
        for part in session.parts.values() {
            data.extend_from_slice(part);
        }
        self.insert(key, data.freeze());
        debug!(
            "Completed multipart upload {} of {} ({} parts, {} bytes)",
            upload_id,
            key,
            session.parts.len(),
            total
        );
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.stats.abort_multipart.fetch_add(1, Ordering::Relaxed);
        self.uploads.lock().remove(upload_id);
        Ok(())
    }

    async fn get_object(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes> {
        let data = self
            .objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| self.not_found(key))?;
        let data = slice_range(&data, range);
        self.stats.record_read(data.len());
        Ok(data)
    }

    async fn head_object(&self, key: &str) -> Result<u64> {
        self.stats.head_object.fetch_add(1, Ordering::Relaxed);
        self.objects
            .read()
            .get(key)
            .map(|d| d.len() as u64)
            .ok_or_else(|| self.not_found(key))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.stats.list_objects.fetch_add(1, Ordering::Relaxed);
        let mut listed: BTreeMap<String, u64> = self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.len() as u64))
            .collect();

        let mut tombstones = self.tombstones.lock();
        tombstones.retain(|key, tombstone| {
            if !key.starts_with(prefix) {
                return true;
            }
            listed.entry(key.clone()).or_insert(tombstone.size);
            tombstone.remaining_lists -= 1;
            tombstone.remaining_lists > 0
        });

        Ok(listed
            .into_iter()
            .map(|(key, size)| ObjectInfo { key, size })
            .collect())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.stats.delete_object.fetch_add(1, Ordering::Relaxed);
        let removed = self.objects.write().remove(key);
        let lag = self.list_lag.load(Ordering::Relaxed);
        if let Some(data) = removed {
            if lag > 0 {
                self.tombstones.lock().insert(
                    key.to_string(),
                    Tombstone {
                        size: data.len() as u64,
                        remaining_lists: lag,
                    },
                );
            }
        }
        Ok(())
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<()> {
        self.stats.copy_object.fetch_add(1, Ordering::Relaxed);
        let data = self
            .objects
            .read()
            .get(src)
            .cloned()
            .ok_or_else(|| self.not_found(src))?;
        self.insert(dst, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_range() {
        let store = MemoryStore::new("bucket");
        store
            .put_object("data/abc", Bytes::from_static(b"hello world"))
            .await
            .unwrap();

        let all = store.get_object("data/abc", None).await.unwrap();
        assert_eq!(&all[..], b"hello world");
        let part = store
            .get_object("data/abc", Some(ByteRange::new(6, 5)))
            .await
            .unwrap();
        assert_eq!(&part[..], b"world");
        assert_eq!(store.head_object("data/abc").await.unwrap(), 11);
        assert!(store.get_object("data/missing", None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_multipart_counts_three_requests() {
        let store = MemoryStore::new("bucket");
        let id = store.create_multipart_upload("data/big").await.unwrap();
        store
            .upload_part("data/big", &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        store
            .upload_part("data/big", &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        store.complete_multipart_upload("data/big", &id).await.unwrap();

        assert_eq!(store.stats().write_requests(), 4);
        assert_eq!(store.open_uploads(), 0);
        let data = store.get_object("data/big", None).await.unwrap();
        assert_eq!(&data[..], b"hello world");

        let err = store.complete_multipart_upload("data/big", &id).await;
        assert!(matches!(err, Err(Error::NoSuchUpload { .. })));
    }

    #[tokio::test]
    async fn test_list_lag_after_delete() {
        let store = MemoryStore::new("bucket");
        store.set_list_lag(2);
        store.put_object("data/a", Bytes::from_static(b"a")).await.unwrap();
        store.put_object("data/b", Bytes::from_static(b"b")).await.unwrap();
        store.delete_object("data/a").await.unwrap();

        assert_eq!(store.object_count("data/"), 1);
        assert_eq!(store.list_objects("data/").await.unwrap().len(), 2);
        assert_eq!(store.list_objects("data/").await.unwrap().len(), 2);
        assert_eq!(store.list_objects("data/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_copy_and_idempotent_delete() {
        let store = MemoryStore::new("bucket");
        store.put_object("data/src", Bytes::from_static(b"x")).await.unwrap();
        store.copy_object("data/src", "data/dst").await.unwrap();
        assert_eq!(store.keys("data/"), vec!["data/dst", "data/src"]);

        store.delete_object("data/src").await.unwrap();
        store.delete_object("data/src").await.unwrap();
        assert_eq!(store.object_count("data/"), 1);
    }
}
