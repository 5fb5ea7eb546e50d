//! Table snapshots (`FREEZE` / `UNFREEZE`)
//!
//! A snapshot hard-links the files of active parts into
//! `shadow/<name>/store/<uuid3>/<uuid>/<part>/` on the disk holding each
//! part. On an object disk this only bumps reference counts. Removal is
//! handed to the reclaimer.

use crate::context::Context;
use crate::disk::join;
use crate::part::PartInfo;
use crate::schema::Value;
use crate::table::Table;
use std::sync::Arc;
use std::time::Duration;
use tierstore_common::{Error, Result, TableId};
use tracing::info;

pub const SHADOW_DIR: &str = "shadow";
const INCREMENT_FILE: &str = "shadow_increment.txt";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrozenPart {
    pub disk: String,
    pub part: String,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreezeResult {
    pub name: String,
    pub parts: Vec<FrozenPart>,
}

pub struct Snapshots {
    ctx: Arc<Context>,
    increment: tokio::sync::Mutex<()>,
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(Error::invalid_argument(format!("invalid snapshot name '{name}'")));
    }
    Ok(())
}

impl Snapshots {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            increment: tokio::sync::Mutex::new(()),
        }
    }

    /// Bump the persisted counter used for unnamed snapshots
    async fn next_increment(&self) -> Result<u64> {
        let _guard = self.increment.lock().await;
        let path = self.ctx.metadata_path().join(INCREMENT_FILE);
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|e| Error::corruption(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let next = current + 1;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, next.to_string()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(next)
    }

    /// Hard-link the active parts of `table` into a snapshot
    ///
    /// # Errors
    /// Returns an error if a link fails; links already made are left for
    /// `unfreeze` to remove.
    pub async fn freeze(
        &self,
        table: &Table,
        partition: Option<&Value>,
        name: Option<&str>,
    ) -> Result<FreezeResult> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.next_increment().await?.to_string(),
        };
        validate_name(&name)?;

        let partition_id = partition.map(|p| table.partition_id(p)).transpose()?;
        let parts: Vec<_> = table
            .parts()
            .into_iter()
            .filter(|p| partition_id.as_ref().is_none_or(|id| p.info.partition_id == *id))
            .collect();

        let root = join(&join(SHADOW_DIR, &name), &table.store_path());
        let mut frozen = Vec::with_capacity(parts.len());
        for part in &parts {
            let disk = self.ctx.registry.get(&part.disk)?;
            let dst = join(&root, &part.name);
            disk.create_dirs(&dst).await?;
            for file in part.file_names() {
                disk.hard_link(&join(&part.path, &file), &join(&dst, &file)).await?;
            }
            frozen.push(FrozenPart {
                disk: part.disk.clone(),
                part: part.name.clone(),
                path: dst,
            });
        }
        info!(
            "Froze {} parts of {} as snapshot '{}'",
            frozen.len(),
            table.name(),
            name
        );
        Ok(FreezeResult { name, parts: frozen })
    }

    /// Schedule removal of one table's parts in snapshot `name`
    ///
    /// Returns the number of part directories scheduled.
    pub async fn unfreeze(&self, table: TableId, name: &str, partition_id: Option<&str>) -> Result<usize> {
        validate_name(name)?;
        let root = join(&join(SHADOW_DIR, name), &table.store_path());
        let mut scheduled = 0;
        for disk in self.ctx.registry.disks() {
            for entry in disk.list(&root).await? {
                if !entry.is_dir {
                    continue;
                }
                let matches = match partition_id {
                    Some(id) => entry
                        .name
                        .parse::<PartInfo>()
                        .is_ok_and(|info| info.partition_id == id),
                    None => true,
                };
                if matches {
                    self.ctx
                        .schedule_delete(disk.name(), &join(&root, &entry.name), Duration::ZERO);
                    scheduled += 1;
                }
            }
        }
        info!("Unfreezing {} parts of {} from snapshot '{}'", scheduled, table, name);
        Ok(scheduled)
    }

    /// Schedule removal of snapshot `name` for every table, dropped ones included
    ///
    /// Returns the number of disks holding the snapshot.
    pub async fn system_unfreeze(&self, name: &str) -> Result<usize> {
        validate_name(name)?;
        let root = join(SHADOW_DIR, name);
        let mut scheduled = 0;
        for disk in self.ctx.registry.disks() {
            if disk.exists(&root).await? {
                self.ctx.schedule_delete(disk.name(), &root, Duration::ZERO);
                scheduled += 1;
            }
        }
        if scheduled == 0 {
            return Err(Error::SnapshotNotFound(name.to_string()));
        }
        info!("Unfreezing snapshot '{}' on {} disks", name, scheduled);
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::{context, table, values};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_freeze_links_parts() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let table = table(&ctx, "t").await;
        table.insert(&values("2020-01-03", 10, 1)).await.unwrap();
        table.insert(&values("2020-01-04", 10, 1)).await.unwrap();
        let snapshots = Snapshots::new(Arc::clone(&ctx));

        let first = snapshots.freeze(&table, None, None).await.unwrap();
        assert_eq!(first.name, "1");
        assert_eq!(first.parts.len(), 2);
        let second = snapshots
            .freeze(&table, Some(&Value::from("2020-01-04")), None)
            .await
            .unwrap();
        assert_eq!(second.name, "2");
        assert_eq!(second.parts.len(), 1);
        assert_eq!(second.parts[0].part, "20200104_2_2_0");

        let disk = ctx.registry.get("default").unwrap();
        let frozen = join(&second.parts[0].path, "id.bin");
        assert!(disk.exists(&frozen).await.unwrap());

        // Frozen files outlive the table's own copy
        table.truncate().await.unwrap();
        assert_eq!(table.count(), 0);
        assert!(disk.exists(&frozen).await.unwrap());
    }

    #[tokio::test]
    async fn test_unfreeze_schedules_removal() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let table = table(&ctx, "t").await;
        table.insert(&values("2020-01-03", 10, 1)).await.unwrap();
        table.insert(&values("2020-01-04", 10, 1)).await.unwrap();
        let snapshots = Snapshots::new(Arc::clone(&ctx));
        snapshots.freeze(&table, None, Some("backup")).await.unwrap();

        let id = table.partition_id(&Value::from("2020-01-03")).unwrap();
        assert_eq!(snapshots.unfreeze(table.uuid(), "backup", Some(&id)).await.unwrap(), 1);
        assert_eq!(ctx.pending_deletes(), 1);
        assert_eq!(snapshots.system_unfreeze("backup").await.unwrap(), 1);
        assert_eq!(ctx.pending_deletes(), 2);
        assert!(matches!(
            snapshots.system_unfreeze("missing").await,
            Err(Error::SnapshotNotFound(_))
        ));
    }
}
