//! Column mutations
//!
//! `MODIFY COLUMN` and `DROP COLUMN` produce a new version of every part.
//! The new version hard-links every file it does not rewrite; only the
//! affected column's files are written (or the shared data file of a
//! compact part). Each mutation leaves one `mutation_<version>.txt` record
//! in the table's store directory holding the effective columns and
//! checksums of the part versions it produced.

use super::Table;
use crate::disk::{Disk, join};
use crate::part::{
    ColumnDesc, Part, PartFormat, PartOverride, encode_data_files, write_files,
};
use crate::schema::{ColumnDef, ColumnType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tierstore_common::{Error, Result, unix_now};
use tracing::{info, warn};

pub const MUTATION_FILE_PREFIX: &str = "mutation_";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationCommand {
    ModifyColumn { column: String, to: ColumnType },
    DropColumn { column: String },
}

impl MutationCommand {
    fn column(&self) -> &str {
        match self {
            Self::ModifyColumn { column, .. } | Self::DropColumn { column } => column,
        }
    }
}

/// Contents of `mutation_<version>.txt`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub version: u64,
    pub command: MutationCommand,
    pub create_time: u64,
    /// Effective metadata of each part version produced, by part name
    pub parts: BTreeMap<String, PartOverride>,
}

fn record_file(version: u64) -> String {
    format!("{MUTATION_FILE_PREFIX}{version}.txt")
}

fn record_version(name: &str) -> Option<u64> {
    name.strip_prefix(MUTATION_FILE_PREFIX)?
        .strip_suffix(".txt")?
        .parse()
        .ok()
}

async fn read_records(disk: &dyn Disk, store: &str) -> Result<Vec<MutationRecord>> {
    let mut versions: Vec<u64> = disk
        .list(store)
        .await?
        .into_iter()
        .filter(|e| !e.is_dir)
        .filter_map(|e| record_version(&e.name))
        .collect();
    versions.sort_unstable();

    let mut records = Vec::with_capacity(versions.len());
    for version in versions {
        let path = join(store, &record_file(version));
        match serde_json::from_slice::<MutationRecord>(&disk.read(&path, None).await?) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Ignoring unreadable mutation record {}:{}: {}", disk.name(), path, e),
        }
    }
    Ok(records)
}

/// Part metadata overrides from all mutation records, and the last version
pub(super) async fn load_overrides(
    disk: &dyn Disk,
    store: &str,
) -> Result<(HashMap<String, PartOverride>, u64)> {
    let mut overrides = HashMap::new();
    let mut last = 0;
    for record in read_records(disk, store).await? {
        last = last.max(record.version);
        overrides.extend(record.parts);
    }
    Ok((overrides, last))
}

/// What a mutation does to one part
struct PartPlan {
    columns: Vec<ColumnDesc>,
    rewritten: Vec<(String, Vec<u8>)>,
    removed: Vec<String>,
}

async fn plan_part(part: &Part, disk: &dyn Disk, command: &MutationCommand) -> Result<PartPlan> {
    let column = command.column();
    let Some(stored) = part.column(column) else {
        // Column added after the part was written; nothing on disk to change
        return Ok(PartPlan {
            columns: part.columns.clone(),
            rewritten: Vec::new(),
            removed: Vec::new(),
        });
    };

    let mut columns = part.columns.clone();
    match command {
        MutationCommand::ModifyColumn { to, .. } => {
            if stored.ty == *to {
                return Ok(PartPlan {
                    columns,
                    rewritten: Vec::new(),
                    removed: Vec::new(),
                });
            }
            for c in &mut columns {
                if c.name == column {
                    c.ty = *to;
                }
            }
        }
        MutationCommand::DropColumn { .. } => columns.retain(|c| c.name != column),
    }

    let granularity = part.index_granularity(disk).await?;
    match part.format {
        PartFormat::Wide => match command {
            MutationCommand::ModifyColumn { to, .. } => {
                let values = part.read_column(disk, &ColumnDef::new(column, *to)).await?;
                let desc = ColumnDesc {
                    name: column.to_string(),
                    ty: *to,
                };
                Ok(PartPlan {
                    columns,
                    rewritten: encode_data_files(PartFormat::Wide, &[desc], &[values], granularity),
                    removed: Vec::new(),
                })
            }
            MutationCommand::DropColumn { .. } => {
                let (bin, mrk) = PartFormat::Wide.column_files(column);
                Ok(PartPlan {
                    columns,
                    rewritten: Vec::new(),
                    removed: vec![bin, mrk],
                })
            }
        },
        PartFormat::Compact => {
            let mut values = Vec::with_capacity(columns.len());
            for desc in &columns {
                values.push(part.read_column(disk, &ColumnDef::new(&desc.name, desc.ty)).await?);
            }
            Ok(PartPlan {
                rewritten: encode_data_files(PartFormat::Compact, &columns, &values, granularity),
                columns,
                removed: Vec::new(),
            })
        }
    }
}

impl Table {
    /// Add a column; existing parts read it as its default
    pub async fn add_column(&self, column: ColumnDef) -> Result<()> {
        let mut metadata = (*self.metadata()).clone();
        if metadata.schema.column(&column.name).is_some() {
            return Err(Error::invalid_argument(format!(
                "column '{}' already exists in {}",
                column.name, metadata.name
            )));
        }
        info!("Adding column {} {} to {}", column.name, column.ty, metadata.name);
        metadata.schema.columns.push(column);
        metadata.schema.validate()?;
        self.persist_metadata(metadata).await
    }

    /// Change the type of a column, rewriting its files
    ///
    /// Returns the mutation version.
    pub async fn modify_column(&self, column: &str, to: ColumnType) -> Result<u64> {
        self.mutate(MutationCommand::ModifyColumn {
            column: column.to_string(),
            to,
        })
        .await
    }

    /// Remove a column and its files
    pub async fn drop_column(&self, column: &str) -> Result<u64> {
        self.mutate(MutationCommand::DropColumn {
            column: column.to_string(),
        })
        .await
    }

    /// All mutation records of the table, oldest first
    pub async fn mutations(&self) -> Result<Vec<MutationRecord>> {
        let disk = self.ctx.registry.get(self.policy()?.main_disk()?)?;
        read_records(disk.as_ref(), &self.store_path()).await
    }

    async fn mutate(&self, command: MutationCommand) -> Result<u64> {
        let mut metadata = (*self.metadata()).clone();
        let column = command.column();
        if metadata.schema.column(column).is_none() {
            return Err(Error::ColumnNotFound(column.to_string()));
        }
        if metadata.schema.is_key_column(column) {
            return Err(Error::invalid_argument(format!(
                "column '{column}' is part of a key or index and cannot be changed"
            )));
        }
        match &command {
            MutationCommand::ModifyColumn { to, .. } => {
                for c in &mut metadata.schema.columns {
                    if c.name == column {
                        c.ty = *to;
                    }
                }
            }
            MutationCommand::DropColumn { .. } => metadata.schema.columns.retain(|c| c.name != column),
        }
        metadata.schema.validate()?;

        let parts = self.parts();
        let _lease = self.lease(&parts, "mutation")?;
        self.ensure_active(&parts)?;
        let version = self.allocate_block();
        let store = metadata.store_path();

        let mut tmp_dirs = Vec::with_capacity(parts.len());
        let result = self.stage_mutation(&command, version, &store, &parts, &mut tmp_dirs).await;
        let (record, staged) = match result {
            Ok(staged) => staged,
            Err(e) => {
                for (disk, tmp) in &tmp_dirs {
                    if let Err(cleanup) = disk.remove_recursive(tmp).await {
                        warn!("Failed to clean up {}:{}: {}", disk.name(), tmp, cleanup);
                    }
                }
                return Err(e);
            }
        };

        let main_disk = self.ctx.registry.get(self.policy()?.main_disk()?)?;
        let encoded = serde_json::to_vec_pretty(&record)?;
        main_disk
            .write_file(&join(&store, &record_file(version)), Bytes::from(encoded))
            .await?;

        let mut added = Vec::with_capacity(staged.len());
        for ((disk, tmp), part) in tmp_dirs.into_iter().zip(staged) {
            disk.rename(&tmp, &part.path).await?;
            added.push(Arc::new(part));
        }
        self.persist_metadata(metadata).await?;
        info!(
            "Applied mutation {} to {} ({} parts): {:?}",
            version,
            self.name(),
            added.len(),
            command
        );
        self.commit(added, parts).await;
        Ok(version)
    }

    /// Build the new part versions in temporary directories
    async fn stage_mutation(
        &self,
        command: &MutationCommand,
        version: u64,
        store: &str,
        parts: &[Arc<Part>],
        tmp_dirs: &mut Vec<(Arc<dyn Disk>, String)>,
    ) -> Result<(MutationRecord, Vec<Part>)> {
        let mut record = MutationRecord {
            version,
            command: command.clone(),
            create_time: unix_now(),
            parts: BTreeMap::new(),
        };
        let mut staged = Vec::with_capacity(parts.len());
        for part in parts {
            let disk = self.ctx.registry.get(&part.disk)?;
            let plan = plan_part(part, disk.as_ref(), command).await?;
            let info = part.info.mutated(version);
            let name = info.to_string();
            let tmp = join(store, &format!("tmp_mut_{name}"));
            let dst = join(store, &name);
            disk.remove_recursive(&tmp).await?;
            disk.create_dirs(&tmp).await?;
            tmp_dirs.push((Arc::clone(&disk), tmp.clone()));

            for file in part.file_names() {
                let replaced = plan.rewritten.iter().any(|(n, _)| *n == file);
                if !replaced && !plan.removed.contains(&file) {
                    disk.hard_link(&join(&part.path, &file), &join(&tmp, &file)).await?;
                }
            }
            let mut checksums = part.checksums.clone();
            for file in &plan.removed {
                checksums.remove(file);
            }
            checksums.extend(write_files(&disk, &tmp, plan.rewritten).await?);

            let overrides = PartOverride {
                columns: plan.columns,
                checksums,
            };
            record.parts.insert(name, overrides.clone());
            staged.push(part.with_override(info, &dst, overrides));
        }
        Ok((record, staged))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{context, table, values};
    use super::*;
    use crate::schema::{Predicate, Value};
    use crate::table::TableMetadata;
    use tempfile::TempDir;

    fn file_count(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| if e.path().is_dir() { file_count(&e.path()) } else { 1 })
                    .sum()
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_add_modify_drop_column() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let table = table(&ctx, "t").await;
        table.insert(&values("2020-01-03", 100, 1)).await.unwrap();
        table.insert(&values("2020-01-03", 100, -1)).await.unwrap();

        table
            .add_column(ColumnDef::new("col1", ColumnType::UInt64).with_default(Value::UInt64(1)))
            .await
            .unwrap();
        assert_eq!(table.sum("col1", None).await.unwrap(), 200);
        table.optimize(None, true).await.unwrap();
        assert_eq!(table.parts().len(), 1);
        assert_eq!(table.parts()[0].columns.len(), 4);
        assert_eq!(
            table.sum("col1", Some(Predicate::greater_than("id", 0i64))).await.unwrap(),
            100
        );

        let version = table.modify_column("col1", ColumnType::String).await.unwrap();
        let part = table.parts()[0].clone();
        assert_eq!(part.info.mutation, version);
        assert!(part.overridden);
        let distinct = table.distinct("col1").await.unwrap();
        assert_eq!(distinct.into_iter().collect::<Vec<_>>(), vec![Value::from("1")]);
        drop(part);

        table.drop_column("col1").await.unwrap();
        assert_eq!(table.parts()[0].columns.len(), 3);
        assert_eq!(table.mutations().await.unwrap().len(), 2);
        assert_eq!(table.sum("id", None).await.unwrap(), 0);

        let store = dir.path().join("default").join(table.store_path());
        // format marker, 2 mutation records, one wide part with 3 columns
        assert_eq!(file_count(&store), 1 + 2 + PartFormat::Wide.file_count(3, 1));
    }

    #[tokio::test]
    async fn test_mutation_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let table = table(&ctx, "t").await;
        table.insert(&values("2020-01-03", 10, 1)).await.unwrap();
        table
            .add_column(ColumnDef::new("col1", ColumnType::UInt64).with_default(Value::UInt64(7)))
            .await
            .unwrap();
        table.optimize(None, true).await.unwrap();
        table.modify_column("col1", ColumnType::String).await.unwrap();
        let metadata: TableMetadata = (*table.metadata()).clone();
        drop(table);

        let table = Table::open(Arc::clone(&ctx), metadata).await.unwrap();
        let part = table.parts()[0].clone();
        assert!(part.overridden);
        assert_eq!(part.column("col1").unwrap().ty, ColumnType::String);
        assert!(table.check().await.unwrap());
        let version = table.drop_column("data").await.unwrap();
        assert!(version > part.info.mutation);
    }

    #[tokio::test]
    async fn test_key_columns_are_protected() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let table = table(&ctx, "t").await;
        assert!(matches!(
            table.drop_column("id").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.modify_column("missing", ColumnType::String).await,
            Err(Error::ColumnNotFound(_))
        ));
        assert!(table.mutations().await.unwrap().is_empty());
    }
}
