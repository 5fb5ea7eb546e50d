//! Fault injection
//!
//! [`FlakyStore`] sits between a disk and a real store and drops every Nth
//! GET or PUT with a retryable connection error, the way an unstable proxy in
//! front of the bucket would.

use crate::store::{ObjectInfo, ObjectStore, RequestStats};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tierstore_common::{ByteRange, Error, Result};
use tracing::debug;

/// Store wrapper failing a fraction of requests
pub struct FlakyStore<S> {
    inner: S,
    fail_every_get: AtomicU64,
    fail_every_put: AtomicU64,
    gets: AtomicU64,
    puts: AtomicU64,
    offline: AtomicBool,
    injected: AtomicU64,
}

impl<S: ObjectStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_every_get: AtomicU64::new(0),
            fail_every_put: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            offline: AtomicBool::new(false),
            injected: AtomicU64::new(0),
        }
    }

    /// Fail every `n`th GET (0 disables)
    #[must_use]
    pub fn fail_every_nth_get(self, n: u64) -> Self {
        self.fail_every_get.store(n, Ordering::Relaxed);
        self
    }

    /// Fail every `n`th PUT or upload-part (0 disables)
    #[must_use]
    pub fn fail_every_nth_put(self, n: u64) -> Self {
        self.fail_every_put.store(n, Ordering::Relaxed);
        self
    }

    /// Fail every request until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Number of failures injected so far
    pub fn injected_failures(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self, counter: &AtomicU64, every: &AtomicU64, op: &str, key: &str) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(self.inject(op, key));
        }
        let every = every.load(Ordering::Relaxed);
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if every > 0 && n % every == 0 {
            return Err(self.inject(op, key));
        }
        Ok(())
    }

    fn inject(&self, op: &str, key: &str) -> Error {
        self.injected.fetch_add(1, Ordering::Relaxed);
        debug!("Injecting failure into {} {}", op, key);
        Error::ConnectionFailed(format!("{op} {key}: connection reset by proxy"))
    }

    fn check_online(&self, op: &str, key: &str) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(self.inject(op, key));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for FlakyStore<S> {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    fn stats(&self) -> &RequestStats {
        self.inner.stats()
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        self.check(&self.puts, &self.fail_every_put, "PUT", key)?;
        self.inner.put_object(key, data).await
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        self.check_online("CreateMultipartUpload", key)?;
        self.inner.create_multipart_upload(key).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<()> {
        self.check(&self.puts, &self.fail_every_put, "UploadPart", key)?;
        self.inner.upload_part(key, upload_id, part_number, data).await
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.check_online("CompleteMultipartUpload", key)?;
        self.inner.complete_multipart_upload(key, upload_id).await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.inner.abort_multipart_upload(key, upload_id).await
    }

    async fn get_object(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes> {
        self.check(&self.gets, &self.fail_every_get, "GET", key)?;
        self.inner.get_object(key, range).await
    }

    async fn head_object(&self, key: &str) -> Result<u64> {
        self.check_online("HEAD", key)?;
        self.inner.head_object(key).await
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.check_online("LIST", prefix)?;
        self.inner.list_objects(prefix).await
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.check_online("DELETE", key)?;
        self.inner.delete_object(key).await
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<()> {
        self.check_online("COPY", src)?;
        self.inner.copy_object(src, dst).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn test_every_third_get_fails() {
        let store = FlakyStore::new(MemoryStore::new("bucket")).fail_every_nth_get(3);
        store
            .put_object("data/k", Bytes::from_static(b"v"))
            .await
            .unwrap();

        let mut failures = 0;
        for _ in 0..9 {
            if let Err(e) = store.get_object("data/k", None).await {
                assert!(e.is_retryable());
                failures += 1;
            }
        }
        assert_eq!(failures, 3);
        assert_eq!(store.injected_failures(), 3);
    }

    #[tokio::test]
    async fn test_offline() {
        let store = FlakyStore::new(MemoryStore::new("bucket"));
        store.set_offline(true);
        assert!(store.list_objects("").await.is_err());
        store.set_offline(false);
        assert!(store.list_objects("").await.unwrap().is_empty());
    }
}
