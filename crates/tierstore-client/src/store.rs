//! Object store protocol
//!
//! The remote blob store is reached through the [`ObjectStore`] trait. Every
//! call is one request against the remote side and is counted in
//! [`RequestStats`], which is how the request multiplier of multipart uploads
//! is observed.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tierstore_common::{ByteRange, Result};

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Per-store request counters
#[derive(Debug, Default)]
pub struct RequestStats {
    pub put_object: AtomicU64,
    pub create_multipart: AtomicU64,
    pub upload_part: AtomicU64,
    pub complete_multipart: AtomicU64,
    pub abort_multipart: AtomicU64,
    pub get_object: AtomicU64,
    pub head_object: AtomicU64,
    pub list_objects: AtomicU64,
    pub delete_object: AtomicU64,
    pub copy_object: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl RequestStats {
    /// Requests that create or extend objects (PUT, multipart create/part/complete)
    pub fn write_requests(&self) -> u64 {
        self.put_object.load(Ordering::Relaxed)
            + self.create_multipart.load(Ordering::Relaxed)
            + self.upload_part.load(Ordering::Relaxed)
            + self.complete_multipart.load(Ordering::Relaxed)
    }

    /// GET and HEAD requests
    pub fn read_requests(&self) -> u64 {
        self.get_object.load(Ordering::Relaxed) + self.head_object.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.get_object.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.put_object,
            &self.create_multipart,
            &self.upload_part,
            &self.complete_multipart,
            &self.abort_multipart,
            &self.get_object,
            &self.head_object,
            &self.list_objects,
            &self.delete_object,
            &self.copy_object,
            &self.bytes_read,
            &self.bytes_written,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Remote blob store client
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Bucket (or root) name, used in error messages
    fn bucket(&self) -> &str;

    /// Request counters
    fn stats(&self) -> &RequestStats;

    /// Single-shot upload
    async fn put_object(&self, key: &str, data: Bytes) -> Result<()>;

    /// Open a multipart upload session, returning its id
    async fn create_multipart_upload(&self, key: &str) -> Result<String>;

    /// Upload one part (part numbers start at 1)
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<()>;

    /// Assemble the uploaded parts, in part-number order, into the object
    async fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Discard a multipart session and its parts
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Read an object, or a byte range of it (clamped to the object size)
    async fn get_object(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes>;

    /// Object size
    async fn head_object(&self, key: &str) -> Result<u64>;

    /// List objects under a prefix; may lag behind recent deletes
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Delete an object; deleting a missing key succeeds
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Server-side copy
    async fn copy_object(&self, src: &str, dst: &str) -> Result<()>;
}

/// Slice `data` by an optional range, clamping to its length
pub(crate) fn slice_range(data: &Bytes, range: Option<ByteRange>) -> Bytes {
    match range {
        None => data.clone(),
        Some(range) => {
            let range = range.clamp_to(data.len() as u64);
            data.slice(range.offset as usize..range.end() as usize)
        }
    }
}
