//! Storage engine entry point
//!
//! [`Storage`] wires the disk registry, the catalog, snapshots and the
//! reclaimer together and exposes the administrative operations.

use crate::cache::{CacheDescription, FreeSpaceSource, StatvfsFreeSpace};
use crate::catalog::Catalog;
use crate::context::Context;
use crate::disk::{DiskRegistry, DiskUsage};
use crate::reclaimer::{ReclaimStats, Reclaimer};
use crate::schema::{TableSchema, Value};
use crate::snapshot::{FreezeResult, Snapshots};
use crate::table::{Table, TableSettings};
use std::sync::Arc;
use tierstore_client::Connector;
use tierstore_common::{Config, DiskKind, Result, TableId};
use tracing::{info, warn};

/// Point-in-time view of one disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskInfo {
    pub name: String,
    pub kind: DiskKind,
    pub usage: DiskUsage,
}

pub struct Storage {
    ctx: Arc<Context>,
    catalog: Arc<Catalog>,
    snapshots: Snapshots,
    reclaimer: Arc<Reclaimer>,
}

impl Storage {
    /// Open disks and caches, load the catalog and sweep orphaned store
    /// directories
    ///
    /// Background work does not start until [`Storage::start_background`].
    ///
    /// # Errors
    /// Returns a configuration error for an invalid config, or the first
    /// error hit while opening disks or loading tables.
    pub async fn open(config: &Config, connector: Connector) -> Result<Self> {
        Self::open_with_free_space(config, connector, Arc::new(StatvfsFreeSpace)).await
    }

    pub async fn open_with_free_space(
        config: &Config,
        connector: Connector,
        space: Arc<dyn FreeSpaceSource>,
    ) -> Result<Self> {
        config.validate()?;
        let metadata_path = config.storage.metadata_path.clone();
        tokio::fs::create_dir_all(&metadata_path).await?;

        let registry = DiskRegistry::open_with_free_space(&config.storage, connector, space)?;
        let ctx = Arc::new(Context::new(registry, metadata_path, config.merge_tree.clone()));
        let catalog = Arc::new(Catalog::load(Arc::clone(&ctx)).await?);
        let snapshots = Snapshots::new(Arc::clone(&ctx));
        let reclaimer = Arc::new(Reclaimer::new(Arc::clone(&ctx), Arc::clone(&catalog)));

        let storage = Self {
            ctx,
            catalog,
            snapshots,
            reclaimer,
        };
        if let Err(e) = storage.reclaimer.sweep_store_orphans().await {
            warn!("Startup sweep of store directories failed: {}", e);
        }
        info!(
            "Storage opened: {} disks, {} tables",
            storage.ctx.registry.names().len(),
            storage.catalog.tables().len()
        );
        Ok(storage)
    }

    /// Start the periodic reclaimer
    pub fn start_background(&self) {
        self.reclaimer.spawn(self.ctx.merge_tree().cleanup_interval());
    }

    pub fn registry(&self) -> &DiskRegistry {
        &self.ctx.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // ---- Tables ----

    pub async fn create_table(
        &self,
        name: &str,
        schema: TableSchema,
        settings: TableSettings,
    ) -> Result<Arc<Table>> {
        self.catalog.create_table(name, schema, settings, None).await
    }

    /// Create a table that takes over a specific store directory identity
    pub async fn create_table_with_uuid(
        &self,
        name: &str,
        schema: TableSchema,
        settings: TableSettings,
        uuid: TableId,
    ) -> Result<Arc<Table>> {
        self.catalog.create_table(name, schema, settings, Some(uuid)).await
    }

    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.catalog.table(name)
    }

    pub fn tables(&self) -> Vec<String> {
        self.catalog.tables()
    }

    pub async fn drop_table(&self, name: &str, sync: bool) -> Result<()> {
        self.catalog.drop_table(name, sync).await
    }

    pub async fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        self.catalog.rename_table(from, to).await
    }

    pub async fn detach_table(&self, name: &str) -> Result<()> {
        self.catalog.detach_table(name).await
    }

    pub async fn attach_table(&self, name: &str) -> Result<Arc<Table>> {
        self.catalog.attach_table(name).await
    }

    // ---- Snapshots ----

    pub async fn freeze(
        &self,
        table: &str,
        partition: Option<&Value>,
        name: Option<&str>,
    ) -> Result<FreezeResult> {
        let table = self.catalog.table(table)?;
        self.snapshots.freeze(&table, partition, name).await
    }

    /// Schedule removal of a table's snapshot; returns the parts scheduled
    pub async fn unfreeze(&self, table: &str, name: &str, partition: Option<&Value>) -> Result<usize> {
        let table = self.catalog.table(table)?;
        let partition_id = partition.map(|p| table.partition_id(p)).transpose()?;
        self.snapshots
            .unfreeze(table.uuid(), name, partition_id.as_deref())
            .await
    }

    /// Schedule removal of a snapshot across all tables, dropped ones included
    pub async fn system_unfreeze(&self, name: &str) -> Result<usize> {
        self.snapshots.system_unfreeze(name).await
    }

    // ---- Administration ----

    /// Empty one cache, or all of them
    pub fn drop_cache(&self, name: Option<&str>) -> Result<()> {
        let names = match name {
            Some(name) => vec![name.to_string()],
            None => self.ctx.registry.cache_names(),
        };
        for name in names {
            self.ctx.registry.cache(&name)?.drop_all()?;
        }
        Ok(())
    }

    pub fn describe_cache(&self, name: &str) -> Result<CacheDescription> {
        Ok(self.ctx.registry.cache(name)?.describe())
    }

    /// Replace a disk instance; in-flight reads keep the old one
    pub fn restart_disk(&self, name: &str) -> Result<()> {
        self.ctx.registry.restart(name)
    }

    /// Apply hot-reloadable settings
    ///
    /// # Errors
    /// An invalid configuration is rejected and the running settings stay.
    pub fn reload_config(&self, config: &Config) -> Result<()> {
        config.validate()?;
        self.ctx.registry.reload(&config.storage)?;
        self.ctx.set_merge_tree(config.merge_tree.clone());
        Ok(())
    }

    pub async fn sweep_store_orphans(&self) -> Result<usize> {
        self.reclaimer.sweep_store_orphans().await
    }

    /// Run one reclaim cycle now
    pub async fn reclaim_now(&self) -> ReclaimStats {
        self.reclaimer.run_once().await
    }

    pub fn disks(&self) -> Result<Vec<DiskInfo>> {
        self.ctx
            .registry
            .disks()
            .into_iter()
            .map(|disk| {
                Ok(DiskInfo {
                    name: disk.name().to_string(),
                    kind: disk.kind(),
                    usage: disk.usage()?,
                })
            })
            .collect()
    }

    /// Stop background work
    pub async fn shutdown(&self) {
        self.reclaimer.shutdown().await;
        info!("Storage shut down");
    }
}
