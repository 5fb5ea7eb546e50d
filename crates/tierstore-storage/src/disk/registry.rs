//! Named disks with hot-swappable instances
//!
//! Each disk lives in a slot holding an `Arc<dyn Disk>`. Operations take the
//! `Arc` once when they start and keep it until they finish, so
//! [`DiskRegistry::restart`] can swap in a fresh instance while reads are in
//! flight. Caches are opened once and shared across restarts.

use super::{Disk, LocalDisk, ObjectDisk};
use crate::cache::{FileCache, FreeSpaceSource, StatvfsFreeSpace};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tierstore_client::Connector;
use tierstore_common::config::{DiskConfig, StorageConfig};
use tierstore_common::{DiskKind, Error, Result};
use tracing::info;

struct DiskSlot {
    disk: RwLock<Arc<dyn Disk>>,
    generation: AtomicU64,
}

/// Registry of disks and caches built from the storage configuration
pub struct DiskRegistry {
    connector: Connector,
    config: RwLock<Arc<StorageConfig>>,
    caches: RwLock<HashMap<String, Arc<FileCache>>>,
    slots: RwLock<HashMap<String, Arc<DiskSlot>>>,
}

impl DiskRegistry {
    /// Open every configured cache and disk
    pub fn open(config: &StorageConfig, connector: Connector) -> Result<Self> {
        Self::open_with_free_space(config, connector, Arc::new(StatvfsFreeSpace))
    }

    /// Like [`DiskRegistry::open`], with a custom free-space source for caches
    pub fn open_with_free_space(
        config: &StorageConfig,
        connector: Connector,
        space: Arc<dyn FreeSpaceSource>,
    ) -> Result<Self> {
        let mut caches = HashMap::new();
        for cache in &config.caches {
            let opened = FileCache::open_with_free_space(cache, Arc::clone(&space))?;
            caches.insert(cache.name.clone(), Arc::new(opened));
        }

        let registry = Self {
            connector,
            config: RwLock::new(Arc::new(config.clone())),
            caches: RwLock::new(caches),
            slots: RwLock::new(HashMap::new()),
        };

        let mut slots = HashMap::new();
        for disk_config in &config.disks {
            let disk = registry.build(disk_config)?;
            slots.insert(
                disk_config.name.clone(),
                Arc::new(DiskSlot {
                    disk: RwLock::new(disk),
                    generation: AtomicU64::new(0),
                }),
            );
        }
        *registry.slots.write() = slots;
        Ok(registry)
    }

    fn build(&self, config: &DiskConfig) -> Result<Arc<dyn Disk>> {
        match config.kind {
            DiskKind::Local => {
                let path = config.path.clone().ok_or_else(|| {
                    Error::configuration(format!("local disk '{}' requires a path", config.name))
                })?;
                Ok(Arc::new(LocalDisk::open(&config.name, path, config.capacity)?))
            }
            DiskKind::ObjectStore => {
                let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                    Error::configuration(format!(
                        "object store disk '{}' requires an endpoint",
                        config.name
                    ))
                })?;
                let store = self.connector.connect(endpoint)?;
                let cache = match &config.cache {
                    Some(name) => Some(self.cache(name)?),
                    None => None,
                };
                Ok(Arc::new(ObjectDisk::open(config, store, cache)?))
            }
        }
    }

    /// Current instance of a disk
    pub fn get(&self, name: &str) -> Result<Arc<dyn Disk>> {
        let slot = self
            .slots
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DiskNotFound(name.to_string()))?;
        let disk = Arc::clone(&slot.disk.read());
        Ok(disk)
    }

    pub fn cache(&self, name: &str) -> Result<Arc<FileCache>> {
        self.caches
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))
    }

    /// Names of all caches, sorted
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.caches.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of all disks, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.slots.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// All current disk instances, sorted by name
    pub fn disks(&self) -> Vec<Arc<dyn Disk>> {
        self.names()
            .iter()
            .filter_map(|name| self.get(name).ok())
            .collect()
    }

    /// Number of times a disk has been restarted
    pub fn generation(&self, name: &str) -> Result<u64> {
        let slots = self.slots.read();
        let slot = slots
            .get(name)
            .ok_or_else(|| Error::DiskNotFound(name.to_string()))?;
        Ok(slot.generation.load(Ordering::Relaxed))
    }

    /// Replace a disk with a fresh instance built from the current config
    pub fn restart(&self, name: &str) -> Result<()> {
        let config = Arc::clone(&self.config.read());
        let disk_config = config
            .disks
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::DiskNotFound(name.to_string()))?;
        let slot = self
            .slots
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DiskNotFound(name.to_string()))?;

        let fresh = self.build(disk_config)?;
        *slot.disk.write() = fresh;
        let generation = slot.generation.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Disk '{}' restarted (generation {})", name, generation);
        Ok(())
    }

    /// Apply the hot-reloadable settings of a new configuration
    ///
    /// Disks and caches cannot be added or removed at runtime; a definition
    /// that changes the set is rejected and nothing is applied.
    pub fn reload(&self, config: &StorageConfig) -> Result<()> {
        {
            let slots = self.slots.read();
            for name in slots.keys() {
                if !config.disks.iter().any(|d| &d.name == name) {
                    return Err(Error::configuration(format!(
                        "disk '{name}' cannot be removed while running"
                    )));
                }
            }
            for disk in &config.disks {
                if !slots.contains_key(&disk.name) {
                    return Err(Error::configuration(format!(
                        "disk '{}' cannot be added while running",
                        disk.name
                    )));
                }
            }
        }

        for disk in &config.disks {
            self.get(&disk.name)?.reload_settings(disk)?;
        }
        let caches = self.caches.read();
        for cache in &config.caches {
            if let Some(existing) = caches.get(&cache.name) {
                existing.reload(cache);
            }
        }
        drop(caches);
        *self.config.write() = Arc::new(config.clone());
        info!("Storage configuration reloaded ({} disks)", config.disks.len());
        Ok(())
    }

    /// Current storage configuration snapshot
    pub fn config(&self) -> Arc<StorageConfig> {
        Arc::clone(&self.config.read())
    }
}
