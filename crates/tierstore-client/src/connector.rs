//! Endpoint resolution
//!
//! Disks name their bucket by endpoint URL. `file://<dir>` opens a
//! directory-backed store on every connect; `memory://<name>` resolves to one
//! shared in-process bucket per name. Tests can register any store (for
//! example a [`FlakyStore`](crate::FlakyStore)) under an endpoint of their
//! choosing.

use crate::fs::FsStore;
use crate::memory::MemoryStore;
use crate::store::ObjectStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tierstore_common::{Error, Result};
use tracing::info;

/// Resolves endpoints to store clients
#[derive(Clone, Default)]
pub struct Connector {
    registered: Arc<RwLock<HashMap<String, Arc<dyn ObjectStore>>>>,
}

impl Connector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `endpoint` to an existing store
    pub fn register(&self, endpoint: impl Into<String>, store: Arc<dyn ObjectStore>) {
        self.registered.write().insert(endpoint.into(), store);
    }

    /// Open a client for `endpoint`
    pub fn connect(&self, endpoint: &str) -> Result<Arc<dyn ObjectStore>> {
        if let Some(store) = self.registered.read().get(endpoint) {
            return Ok(Arc::clone(store));
        }

        if let Some(path) = endpoint.strip_prefix("file://") {
            info!("Opening directory-backed bucket at {}", path);
            return Ok(Arc::new(FsStore::open(path)?));
        }

        if let Some(name) = endpoint.strip_prefix("memory://") {
            let mut registered = self.registered.write();
            let store = registered
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(MemoryStore::new(name)));
            return Ok(Arc::clone(store));
        }

        Err(Error::configuration(format!(
            "unsupported object store endpoint '{endpoint}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_memory_endpoint_is_shared() {
        let connector = Connector::new();
        let a = connector.connect("memory://bucket").unwrap();
        let b = connector.connect("memory://bucket").unwrap();
        a.put_object("data/x", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(b.head_object("data/x").await.unwrap(), 1);
    }

    #[test]
    fn test_unknown_scheme() {
        let connector = Connector::new();
        assert!(matches!(
            connector.connect("s3://bucket"),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_file_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = format!("file://{}", dir.path().display());
        let connector = Connector::new();
        let store = connector.connect(&endpoint).unwrap();
        store.put_object("data/y", Bytes::from_static(b"yy")).await.unwrap();
        let again = connector.connect(&endpoint).unwrap();
        assert_eq!(again.head_object("data/y").await.unwrap(), 2);
    }
}
