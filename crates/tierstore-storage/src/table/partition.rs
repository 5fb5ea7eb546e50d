//! Partition-level transitions
//!
//! Detached parts live under `<store>/detached/` and are invisible to reads.
//! Same-disk clones (detach, attach, move or replace between tables) hard
//! link the files; cross-disk moves copy them.

use super::Table;
use crate::disk::{Disk, copy_file, join};
use crate::part::format::{CHECKSUMS_FILE, COLUMNS_FILE};
use crate::part::{Checksums, FileChecksum, Part, PartInfo, PartState};
use crate::schema::Value;
use bytes::Bytes;
use std::sync::Arc;
use tierstore_common::{Error, Result};
use tracing::{debug, info};

pub(crate) const DETACHED_DIR: &str = "detached";

const DETACHED_PREFIXES: [&str; 3] = ["broken_", "ignored_", "attaching_"];

/// Part name of a detached directory without its state prefix
pub(crate) fn strip_detached_prefix(name: &str) -> &str {
    DETACHED_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .unwrap_or(name)
}

/// Info of a detached part that can be attached back
pub(crate) fn detached_part_info(name: &str) -> Option<PartInfo> {
    if DETACHED_PREFIXES.iter().any(|p| name.starts_with(p)) || name.starts_with("tmp_") {
        return None;
    }
    name.parse().ok()
}

/// How files reach the new location
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloneMode {
    HardLink,
    Copy,
}

/// Clone the files of `part` into `dst_dir`
///
/// A part whose metadata comes from a mutation record gets its own
/// `columns.txt` and `checksums.txt`, so the clone no longer depends on the
/// record. Returns the checksums of the clone.
async fn clone_part_files(
    part: &Part,
    src: &dyn Disk,
    dst: &dyn Disk,
    dst_dir: &str,
    mode: CloneMode,
) -> Result<Checksums> {
    let mut checksums = part.checksums.clone();
    for file in part.checksums.keys() {
        if part.overridden && file == COLUMNS_FILE {
            continue;
        }
        let from = join(&part.path, file);
        let to = join(dst_dir, file);
        match mode {
            CloneMode::HardLink => dst.hard_link(&from, &to).await?,
            CloneMode::Copy => {
                copy_file(src, dst, &from, &to).await?;
            }
        }
    }

    if part.overridden {
        let columns = serde_json::to_vec(&part.columns)?;
        checksums.insert(COLUMNS_FILE.to_string(), FileChecksum::compute(&columns));
        dst.write_file(&join(dst_dir, COLUMNS_FILE), Bytes::from(columns)).await?;
        let encoded = serde_json::to_vec_pretty(&checksums)?;
        dst.write_file(&join(dst_dir, CHECKSUMS_FILE), Bytes::from(encoded)).await?;
    } else {
        let from = join(&part.path, CHECKSUMS_FILE);
        let to = join(dst_dir, CHECKSUMS_FILE);
        match mode {
            CloneMode::HardLink => dst.hard_link(&from, &to).await?,
            CloneMode::Copy => {
                copy_file(src, dst, &from, &to).await?;
            }
        }
    }
    Ok(checksums)
}

impl Table {
    fn detached_path(&self, name: &str) -> String {
        join(&self.store_path(), &format!("{DETACHED_DIR}/{name}"))
    }

    /// Outdate every part of a partition
    pub async fn drop_partition(&self, partition: &Value) -> Result<usize> {
        let id = self.partition_id(partition)?;
        let parts = self.parts_in_partition(&id);
        let _lease = self.lease(&parts, "drop")?;
        self.ensure_active(&parts)?;
        let dropped = parts.len();
        info!("Dropping partition {} of {} ({} parts)", id, self.name(), dropped);
        self.commit(Vec::new(), parts).await;
        Ok(dropped)
    }

    /// Outdate every part
    pub async fn truncate(&self) -> Result<usize> {
        let parts = self.parts();
        let _lease = self.lease(&parts, "truncate")?;
        self.ensure_active(&parts)?;
        let dropped = parts.len();
        info!("Truncating {} ({} parts)", self.name(), dropped);
        self.commit(Vec::new(), parts).await;
        Ok(dropped)
    }

    /// Move the parts of a partition under `detached/`
    pub async fn detach_partition(&self, partition: &Value) -> Result<Vec<String>> {
        let id = self.partition_id(partition)?;
        let parts = self.parts_in_partition(&id);
        let _lease = self.lease(&parts, "detach")?;
        self.ensure_active(&parts)?;

        let mut names = Vec::with_capacity(parts.len());
        for part in &parts {
            let disk = self.ctx.registry.get(&part.disk)?;
            let dst = self.detached_path(&part.name);
            disk.remove_recursive(&dst).await?;
            clone_part_files(part, disk.as_ref(), disk.as_ref(), &dst, CloneMode::HardLink).await?;
            debug!("Detached part {} of {}", part.name, self.name());
            names.push(part.name.clone());
        }
        self.commit(Vec::new(), parts).await;
        Ok(names)
    }

    /// Attach detached parts of a partition under new block numbers
    pub async fn attach_partition(&self, partition: &Value) -> Result<Vec<String>> {
        let id = self.partition_id(partition)?;
        let store = self.store_path();
        let policy = self.policy()?;

        let mut attached = Vec::new();
        for disk_name in &policy.disks {
            let disk = self.ctx.registry.get(disk_name)?;
            let detached_dir = join(&store, DETACHED_DIR);
            for entry in disk.list(&detached_dir).await? {
                let Some(info) = detached_part_info(&entry.name) else {
                    continue;
                };
                if !entry.is_dir || info.partition_id != id {
                    continue;
                }
                let src = join(&detached_dir, &entry.name);
                let part = Part::load(disk.as_ref(), &src, info.clone(), None).await?;

                let block = self.allocate_block();
                let new_info = PartInfo {
                    min_block: block,
                    max_block: block,
                    mutation: 0,
                    ..info
                };
                let dst = join(&store, &new_info.to_string());
                disk.rename(&src, &dst).await?;
                self.ensure_format_marker(&disk).await?;
                let part = Arc::new(part.relocated(new_info, disk_name, &dst));
                info!("Attached part {} of {} as {}", entry.name, self.name(), part.name);
                attached.push(part.name.clone());
                self.commit(vec![part], Vec::new()).await;
            }
        }
        Ok(attached)
    }

    /// Remove detached parts of a partition
    pub async fn drop_detached_partition(&self, partition: &Value) -> Result<usize> {
        let id = self.partition_id(partition)?;
        let detached_dir = join(&self.store_path(), DETACHED_DIR);
        let mut removed = 0;
        for disk_name in &self.policy()?.disks {
            let disk = self.ctx.registry.get(disk_name)?;
            for entry in disk.list(&detached_dir).await? {
                let name = strip_detached_prefix(&entry.name);
                let matches = name
                    .parse::<PartInfo>()
                    .is_ok_and(|info| info.partition_id == id);
                if matches {
                    disk.remove_recursive(&join(&detached_dir, &entry.name)).await?;
                    removed += 1;
                }
            }
        }
        info!("Dropped {} detached parts of partition {} of {}", removed, id, self.name());
        Ok(removed)
    }

    /// Names of the detached parts, including quarantined ones
    pub async fn detached_parts(&self) -> Result<Vec<String>> {
        let detached_dir = join(&self.store_path(), DETACHED_DIR);
        let mut names = Vec::new();
        for disk_name in &self.policy()?.disks {
            let disk = self.ctx.registry.get(disk_name)?;
            names.extend(disk.list(&detached_dir).await?.into_iter().map(|e| e.name));
        }
        Ok(names)
    }

    /// Copy the parts of a partition to another disk of the table's policy
    pub async fn move_partition_to_disk(&self, partition: &Value, disk_name: &str) -> Result<usize> {
        let id = self.partition_id(partition)?;
        if !self.policy()?.contains(disk_name) {
            return Err(Error::invalid_argument(format!(
                "disk '{disk_name}' is not part of the storage policy of {}",
                self.name()
            )));
        }
        let dst_disk = self.ctx.registry.get(disk_name)?;
        let parts: Vec<Arc<Part>> = self
            .parts_in_partition(&id)
            .into_iter()
            .filter(|p| p.disk != disk_name)
            .collect();
        let _lease = self.lease(&parts, "move")?;
        self.ensure_active(&parts)?;
        self.ensure_format_marker(&dst_disk).await?;

        let store = self.store_path();
        let mut moved = Vec::with_capacity(parts.len());
        for part in &parts {
            let src_disk = self.ctx.registry.get(&part.disk)?;
            let _reservation = dst_disk.reserve(part.bytes_on_disk())?;
            let tmp = join(&store, &format!("tmp_move_{}", part.name));
            let dst = join(&store, &part.name);
            dst_disk.remove_recursive(&tmp).await?;
            let checksums =
                clone_part_files(part, src_disk.as_ref(), dst_disk.as_ref(), &tmp, CloneMode::Copy).await?;
            self.remove_stale_outdated(disk_name, &dst).await?;
            dst_disk.rename(&tmp, &dst).await?;

            let mut new_part = part.relocated(part.info.clone(), disk_name, &dst);
            new_part.checksums = checksums;
            new_part.overridden = false;
            info!(
                "Moved part {} of {} from disk '{}' to '{}'",
                part.name,
                self.name(),
                part.disk,
                disk_name
            );
            moved.push(Arc::new(new_part));
        }
        let count = moved.len();
        self.commit(moved, parts).await;
        Ok(count)
    }

    /// Delete an outdated copy occupying `path` on `disk` (a part moved away
    /// and back before it was reclaimed)
    async fn remove_stale_outdated(&self, disk: &str, path: &str) -> Result<()> {
        let stale = {
            let mut set = self.parts.write();
            let index = set
                .outdated
                .iter()
                .position(|o| o.part.disk == disk && o.part.path == path);
            match index {
                Some(i) if Arc::strong_count(&set.outdated[i].part) == 1 => Some(set.outdated.remove(i)),
                Some(i) => {
                    return Err(Error::PartBusy {
                        part: set.outdated[i].part.name.clone(),
                        operation: "read".to_string(),
                    });
                }
                None => None,
            }
        };
        if let Some(stale) = stale {
            self.ctx.registry.get(disk)?.remove_recursive(path).await?;
            stale.part.set_state(PartState::Deleted);
        }
        Ok(())
    }

    fn check_compatible(&self, other: &Self) -> Result<()> {
        let (ours, theirs) = (self.schema(), other.schema());
        if ours.columns != theirs.columns
            || ours.order_by != theirs.order_by
            || ours.partition_by != theirs.partition_by
        {
            return Err(Error::invalid_argument(format!(
                "tables {} and {} have different structure",
                self.name(),
                other.name()
            )));
        }
        Ok(())
    }

    /// Hard-link parts of `source` into this table under new block numbers
    async fn clone_from(&self, source: &Self, parts: &[Arc<Part>]) -> Result<Vec<Arc<Part>>> {
        let store = self.store_path();
        let policy = self.policy()?;
        let mut cloned = Vec::with_capacity(parts.len());
        for part in parts {
            if !policy.contains(&part.disk) {
                return Err(Error::invalid_argument(format!(
                    "part {} of {} is on disk '{}' outside the storage policy of {}",
                    part.name,
                    source.name(),
                    part.disk,
                    self.name()
                )));
            }
            let disk = self.ctx.registry.get(&part.disk)?;
            self.ensure_format_marker(&disk).await?;
            let block = self.allocate_block();
            let info = PartInfo {
                min_block: block,
                max_block: block,
                mutation: 0,
                ..part.info.clone()
            };
            let tmp = join(&store, &format!("tmp_clone_{info}"));
            let dst = join(&store, &info.to_string());
            disk.remove_recursive(&tmp).await?;
            let checksums =
                clone_part_files(part, disk.as_ref(), disk.as_ref(), &tmp, CloneMode::HardLink).await?;
            disk.rename(&tmp, &dst).await?;

            let mut new_part = part.relocated(info, &part.disk, &dst);
            new_part.checksums = checksums;
            new_part.overridden = false;
            cloned.push(Arc::new(new_part));
        }
        Ok(cloned)
    }

    /// Move the parts of a partition into `dest`
    pub async fn move_partition_to_table(&self, partition: &Value, dest: &Self) -> Result<usize> {
        self.check_compatible(dest)?;
        let id = self.partition_id(partition)?;
        let parts = self.parts_in_partition(&id);
        let _lease = self.lease(&parts, "move")?;
        self.ensure_active(&parts)?;

        let cloned = dest.clone_from(self, &parts).await?;
        let count = cloned.len();
        info!(
            "Moved {} parts of partition {} from {} to {}",
            count,
            id,
            self.name(),
            dest.name()
        );
        dest.commit(cloned, Vec::new()).await;
        self.commit(Vec::new(), parts).await;
        Ok(count)
    }

    /// Replace a partition with a copy of the same partition of `source`
    pub async fn replace_partition_from(&self, partition: &Value, source: &Self) -> Result<usize> {
        self.check_compatible(source)?;
        let id = self.partition_id(partition)?;
        let source_parts = source.parts_in_partition(&id);
        let replaced = self.parts_in_partition(&id);
        let _lease = self.lease(&replaced, "replace")?;
        self.ensure_active(&replaced)?;

        let cloned = self.clone_from(source, &source_parts).await?;
        drop(source_parts);
        let count = cloned.len();
        info!(
            "Replaced partition {} of {} with {} parts from {}",
            id,
            self.name(),
            count,
            source.name()
        );
        self.commit(cloned, replaced).await;
        Ok(count)
    }
}
