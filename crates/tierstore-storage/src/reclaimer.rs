//! Background reclaimer
//!
//! Physically removes what the rest of the engine only marked for deletion:
//! outdated parts past their lifetime, directories of dropped tables and
//! unfrozen snapshots, and store directories no table owns anymore.

use crate::catalog::Catalog;
use crate::context::Context;
use crate::disk::join;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tierstore_common::{Result, TableId};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const STORE_DIR: &str = "store";

/// What one reclaim cycle removed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub parts: usize,
    pub directories: usize,
    pub failed: usize,
}

pub struct Reclaimer {
    ctx: Arc<Context>,
    catalog: Arc<Catalog>,
    /// When an unowned store directory was first seen, by (disk, path)
    orphans: Mutex<HashMap<(String, String), Instant>>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reclaimer {
    pub fn new(ctx: Arc<Context>, catalog: Arc<Catalog>) -> Self {
        Self {
            ctx,
            catalog,
            orphans: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// One pass over every table and the pending directory queue
    ///
    /// Failures are logged and left for the next pass.
    pub async fn run_once(&self) -> ReclaimStats {
        let mut stats = ReclaimStats::default();
        for name in self.catalog.tables() {
            let Ok(table) = self.catalog.table(&name) else {
                continue;
            };
            match table.clear_old_parts().await {
                Ok(removed) => stats.parts += removed,
                Err(e) => {
                    warn!("Failed to clear old parts of {}: {}", name, e);
                    stats.failed += 1;
                }
            }
        }

        let mut retry = Vec::new();
        for pending in self.ctx.take_due(Instant::now()) {
            let result = match self.ctx.registry.get(&pending.disk) {
                Ok(disk) => disk.remove_recursive(&pending.path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    debug!("Removed {}:{}", pending.disk, pending.path);
                    stats.directories += 1;
                }
                Err(e) => {
                    warn!("Failed to remove {}:{}: {}", pending.disk, pending.path, e);
                    stats.failed += 1;
                    retry.push(pending);
                }
            }
        }
        if !retry.is_empty() {
            self.ctx.requeue(retry);
        }
        stats
    }

    /// Remove store directories whose UUID has no table metadata
    ///
    /// A directory is removed once it has been unowned for at least
    /// `orphan_dir_min_age`, judged by its modification time or by how long
    /// ago this reclaimer first saw it, whichever is older.
    pub async fn sweep_store_orphans(&self) -> Result<usize> {
        let known = self.catalog.known_uuids();
        let min_age = self.ctx.merge_tree().orphan_dir_min_age();
        let now = Instant::now();
        let mut removed = 0;

        for disk in self.ctx.registry.disks() {
            for prefix in disk.list(STORE_DIR).await? {
                if !prefix.is_dir {
                    continue;
                }
                let prefix_path = join(STORE_DIR, &prefix.name);
                for entry in disk.list(&prefix_path).await? {
                    let Ok(uuid) = entry.name.parse::<TableId>() else {
                        continue;
                    };
                    if !entry.is_dir || !entry.name.starts_with(&prefix.name) {
                        continue;
                    }
                    let path = join(&prefix_path, &entry.name);
                    let key = (disk.name().to_string(), path.clone());
                    if known.contains(&uuid) {
                        self.orphans.lock().remove(&key);
                        continue;
                    }

                    let first_seen = *self.orphans.lock().entry(key.clone()).or_insert(now);
                    let observed = now.duration_since(first_seen);
                    let since_modified = disk
                        .modified(&path)
                        .await
                        .ok()
                        .and_then(|t| SystemTime::now().duration_since(t).ok())
                        .unwrap_or(Duration::ZERO);
                    if observed.max(since_modified) < min_age {
                        debug!(
                            "Store directory {}:{} is unowned but too young to remove",
                            disk.name(),
                            path
                        );
                        continue;
                    }

                    info!("Removing unused directory {}:{}", disk.name(), path);
                    disk.remove_recursive(&path).await?;
                    self.orphans.lock().remove(&key);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("Removed {} directories from store", removed);
        }
        Ok(removed)
    }

    /// Run `run_once` every `interval` until `shutdown`
    pub fn spawn(self: &Arc<Self>, interval: Duration) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.shutdown.store(false, Ordering::Relaxed);
        let reclaimer = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        *handle = Some(tokio::spawn(async move {
            info!("Background reclaimer started (interval {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while !shutdown.load(Ordering::Relaxed) {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let stats = reclaimer.run_once().await;
                if stats.failed > 0 {
                    error!("Reclaim cycle left {} failures for retry", stats.failed);
                } else if stats.parts + stats.directories > 0 {
                    debug!(
                        "Reclaimed {} parts and {} directories",
                        stats.parts, stats.directories
                    );
                }
            }
            info!("Background reclaimer stopped");
        }));
    }

    /// Stop the background loop
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Value;
    use crate::table::TableSettings;
    use crate::table::tests::{context, test_schema, values};
    use tempfile::TempDir;
    use tierstore_common::config::MergeTreeConfig;

    async fn setup(dir: &TempDir, lifetime: u64) -> (Arc<Context>, Arc<Catalog>, Reclaimer) {
        let ctx = context(dir);
        ctx.set_merge_tree(MergeTreeConfig {
            old_parts_lifetime_secs: lifetime,
            orphan_dir_min_age_secs: 0,
            index_granularity: 64,
            ..MergeTreeConfig::default()
        });
        let catalog = Arc::new(Catalog::load(Arc::clone(&ctx)).await.unwrap());
        let reclaimer = Reclaimer::new(Arc::clone(&ctx), Arc::clone(&catalog));
        (ctx, catalog, reclaimer)
    }

    #[tokio::test]
    async fn test_run_once_clears_due_parts_and_directories() {
        let dir = TempDir::new().unwrap();
        let (ctx, catalog, reclaimer) = setup(&dir, 0).await;
        let table = catalog
            .create_table("t", test_schema(), TableSettings::default().old_parts_lifetime(3600), None)
            .await
            .unwrap();
        table.insert(&values("2020-01-03", 10, 1)).await.unwrap();
        table.insert(&values("2020-01-03", 10, 1)).await.unwrap();
        table.optimize(None, true).await.unwrap();
        assert_eq!(table.outdated_parts(), 2);
        assert_eq!(reclaimer.run_once().await.parts, 0);

        table.drop_partition(&Value::from("2020-01-03")).await.unwrap();
        ctx.schedule_delete("default", "shadow/gone", Duration::ZERO);
        let stats = reclaimer.run_once().await;
        assert_eq!(stats.directories, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(ctx.pending_deletes(), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_orphans() {
        let dir = TempDir::new().unwrap();
        let (ctx, catalog, reclaimer) = setup(&dir, 0).await;
        let table = catalog
            .create_table("t", test_schema(), TableSettings::default(), None)
            .await
            .unwrap();
        table.insert(&values("2020-01-03", 10, 1)).await.unwrap();

        let orphan = TableId::new();
        let disk = ctx.registry.get("default").unwrap();
        disk.create_dirs(&join(&orphan.store_path(), "all_1_1_0")).await.unwrap();

        assert_eq!(reclaimer.sweep_store_orphans().await.unwrap(), 1);
        assert!(!disk.exists(&orphan.store_path()).await.unwrap());
        assert!(disk.exists(&table.store_path()).await.unwrap());
        assert_eq!(reclaimer.sweep_store_orphans().await.unwrap(), 0);

        // The UUID is free again
        let reused = catalog
            .create_table("u", test_schema(), TableSettings::default(), Some(orphan))
            .await
            .unwrap();
        assert_eq!(reused.uuid(), orphan);
    }

    #[tokio::test]
    async fn test_sweep_waits_for_min_age() {
        let dir = TempDir::new().unwrap();
        let (ctx, _catalog, reclaimer) = setup(&dir, 0).await;
        ctx.set_merge_tree(MergeTreeConfig {
            orphan_dir_min_age_secs: 3600,
            ..MergeTreeConfig::default()
        });
        let orphan = TableId::new();
        let disk = ctx.registry.get("hdd").unwrap();
        disk.create_dirs(&orphan.store_path()).await.unwrap();
        assert_eq!(reclaimer.sweep_store_orphans().await.unwrap(), 0);
        assert!(disk.exists(&orphan.store_path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let (ctx, _catalog, reclaimer) = setup(&dir, 0).await;
        let reclaimer = Arc::new(reclaimer);
        ctx.schedule_delete("default", "shadow/x", Duration::ZERO);
        reclaimer.spawn(Duration::from_millis(10));
        for _ in 0..100 {
            if ctx.pending_deletes() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ctx.pending_deletes(), 0);
        reclaimer.shutdown().await;
    }
}
