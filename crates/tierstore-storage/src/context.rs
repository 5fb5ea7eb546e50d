//! State shared by tables, the catalog, snapshots and the reclaimer

use crate::disk::DiskRegistry;
use crate::policy::StoragePolicy;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierstore_common::config::MergeTreeConfig;
use tierstore_common::Result;

/// Directory under `metadata_path` holding table metadata records
pub const METADATA_DIR: &str = "metadata";

/// A directory waiting for physical removal
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingDelete {
    pub disk: String,
    pub path: String,
    pub not_before: Instant,
}

pub struct Context {
    pub registry: DiskRegistry,
    metadata_path: PathBuf,
    merge_tree: RwLock<Arc<MergeTreeConfig>>,
    pending: Mutex<Vec<PendingDelete>>,
}

impl Context {
    pub fn new(registry: DiskRegistry, metadata_path: PathBuf, merge_tree: MergeTreeConfig) -> Self {
        Self {
            registry,
            metadata_path,
            merge_tree: RwLock::new(Arc::new(merge_tree)),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn metadata_path(&self) -> &PathBuf {
        &self.metadata_path
    }

    /// Local directory of table metadata records
    pub fn metadata_dir(&self) -> PathBuf {
        self.metadata_path.join(METADATA_DIR)
    }

    pub fn merge_tree(&self) -> Arc<MergeTreeConfig> {
        Arc::clone(&self.merge_tree.read())
    }

    pub fn set_merge_tree(&self, config: MergeTreeConfig) {
        *self.merge_tree.write() = Arc::new(config);
    }

    pub fn policy(&self, name: &str) -> Result<StoragePolicy> {
        StoragePolicy::resolve(&self.registry.config(), name)
    }

    /// Hand a directory to the reclaimer
    pub fn schedule_delete(&self, disk: &str, path: &str, delay: Duration) {
        let mut pending = self.pending.lock();
        if pending.iter().any(|p| p.disk == disk && p.path == path) {
            return;
        }
        pending.push(PendingDelete {
            disk: disk.to_string(),
            path: path.to_string(),
            not_before: Instant::now() + delay,
        });
    }

    /// Remove and return the entries that are due
    pub fn take_due(&self, now: Instant) -> Vec<PendingDelete> {
        let mut pending = self.pending.lock();
        let (due, waiting): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| p.not_before <= now);
        *pending = waiting;
        due
    }

    /// Put back entries whose removal failed
    pub fn requeue(&self, entries: Vec<PendingDelete>) {
        self.pending.lock().extend(entries);
    }

    pub fn pending_deletes(&self) -> usize {
        self.pending.lock().len()
    }
}
