//! Table catalog
//!
//! `metadata/<table>.json` is the only record of a table's existence. A
//! detached table keeps its record as `<table>.json.detached` and its parts
//! stay in the store directory until it is attached again.

use crate::context::Context;
use crate::schema::TableSchema;
use crate::table::{Table, TableMetadata, TableSettings, read_metadata_file, write_metadata_file};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tierstore_common::{Error, ErrorClass, Result, TableId};
use tracing::{debug, info, warn};

const METADATA_SUFFIX: &str = ".json";
const DETACHED_SUFFIX: &str = ".json.detached";

pub struct Catalog {
    ctx: Arc<Context>,
    tables: RwLock<BTreeMap<String, Arc<Table>>>,
    detached: RwLock<BTreeMap<String, TableMetadata>>,
    /// Serializes DDL; reads and part operations never take it
    ddl: tokio::sync::Mutex<()>,
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.ends_with(".tmp")
    {
        return Err(Error::invalid_argument(format!("invalid table name '{name}'")));
    }
    Ok(())
}

impl Catalog {
    /// Read every metadata record and open the tables
    ///
    /// # Errors
    /// Returns an error if the metadata directory cannot be read or a table
    /// fails to load its parts.
    pub async fn load(ctx: Arc<Context>) -> Result<Self> {
        let dir = ctx.metadata_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let mut tables = BTreeMap::new();
        let mut detached = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        paths.sort();

        for path in paths {
            let Some(file) = path.file_name().and_then(|f| f.to_str()).map(str::to_string) else {
                continue;
            };
            if file.ends_with(".tmp") {
                debug!("Removing leftover {}", path.display());
                tokio::fs::remove_file(&path).await?;
                continue;
            }
            let is_detached = file.ends_with(DETACHED_SUFFIX);
            if !is_detached && !file.ends_with(METADATA_SUFFIX) {
                continue;
            }
            let metadata = match read_metadata_file(&path).await {
                Ok(metadata) => metadata,
                Err(e) if matches!(e.class(), ErrorClass::Corruption) => {
                    warn!("Skipping unreadable table metadata {}: {}", path.display(), e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if is_detached {
                detached.insert(metadata.name.clone(), metadata);
            } else {
                let name = metadata.name.clone();
                let table = Table::open(Arc::clone(&ctx), metadata).await?;
                tables.insert(name, Arc::new(table));
            }
        }
        info!(
            "Catalog loaded: {} tables, {} detached",
            tables.len(),
            detached.len()
        );

        Ok(Self {
            ctx,
            tables: RwLock::new(tables),
            detached: RwLock::new(detached),
            ddl: tokio::sync::Mutex::new(()),
        })
    }

    fn metadata_file(&self, name: &str) -> PathBuf {
        self.ctx.metadata_dir().join(format!("{name}{METADATA_SUFFIX}"))
    }

    fn detached_file(&self, name: &str) -> PathBuf {
        self.ctx.metadata_dir().join(format!("{name}{DETACHED_SUFFIX}"))
    }

    fn ensure_free(&self, name: &str) -> Result<()> {
        if self.tables.read().contains_key(name) || self.detached.read().contains_key(name) {
            return Err(Error::TableAlreadyExists(name.to_string()));
        }
        Ok(())
    }

    /// Create a table; `uuid` reuses a known store directory identity
    ///
    /// # Errors
    /// Returns `TableAlreadyExists` if the name or UUID is taken, or a
    /// configuration error for an unknown storage policy.
    pub async fn create_table(
        &self,
        name: &str,
        schema: TableSchema,
        settings: TableSettings,
        uuid: Option<TableId>,
    ) -> Result<Arc<Table>> {
        validate_name(name)?;
        schema.validate()?;
        self.ctx.policy(&settings.storage_policy)?;

        let _ddl = self.ddl.lock().await;
        self.ensure_free(name)?;
        let uuid = uuid.unwrap_or_default();
        if self.known_uuids().contains(&uuid) {
            return Err(Error::TableAlreadyExists(format!("{name} (uuid {uuid})")));
        }

        let metadata = TableMetadata {
            name: name.to_string(),
            uuid,
            schema,
            settings,
        };
        write_metadata_file(&self.metadata_file(name), &metadata).await?;
        let table = match Table::create(Arc::clone(&self.ctx), metadata).await {
            Ok(table) => Arc::new(table),
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(self.metadata_file(name)).await {
                    warn!("Failed to remove metadata of table {} after failed create: {}", name, cleanup);
                }
                return Err(e);
            }
        };
        self.tables.write().insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// # Errors
    /// Returns `TableNotFound` if no attached table has this name.
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Names of attached tables
    pub fn tables(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    pub fn detached_tables(&self) -> Vec<String> {
        self.detached.read().keys().cloned().collect()
    }

    /// UUIDs of every table with metadata, attached or not
    pub fn known_uuids(&self) -> HashSet<TableId> {
        let mut uuids: HashSet<TableId> = self.tables.read().values().map(|t| t.uuid()).collect();
        uuids.extend(self.detached.read().values().map(|m| m.uuid));
        uuids
    }

    /// Drop a table, attached or detached
    ///
    /// With `sync` the store directories are removed before returning.
    ///
    /// # Errors
    /// Returns `TableNotFound` if the table does not exist.
    pub async fn drop_table(&self, name: &str, sync: bool) -> Result<()> {
        let _ddl = self.ddl.lock().await;
        let attached = self.tables.read().get(name).cloned();
        let table = match attached {
            Some(table) => {
                tokio::fs::remove_file(self.metadata_file(name)).await?;
                self.tables.write().remove(name);
                table
            }
            None => {
                let metadata = self
                    .detached
                    .read()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
                tokio::fs::remove_file(self.detached_file(name)).await?;
                self.detached.write().remove(name);
                Arc::new(Table::open(Arc::clone(&self.ctx), metadata).await?)
            }
        };
        table.drop_data(sync).await?;
        info!("Dropped table {} ({}){}", name, table.uuid(), if sync { " synchronously" } else { "" });
        Ok(())
    }

    /// # Errors
    /// Returns `TableNotFound` or `TableAlreadyExists`.
    pub async fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        validate_name(to)?;
        let _ddl = self.ddl.lock().await;
        let table = self.table(from)?;
        self.ensure_free(to)?;

        let mut metadata = (*table.metadata()).clone();
        metadata.name = to.to_string();
        write_metadata_file(&self.metadata_file(to), &metadata).await?;
        tokio::fs::remove_file(self.metadata_file(from)).await?;
        table.set_name(to);

        let mut tables = self.tables.write();
        tables.remove(from);
        tables.insert(to.to_string(), table);
        info!("Renamed table {} to {}", from, to);
        Ok(())
    }

    /// Forget a table without touching its data
    ///
    /// # Errors
    /// Returns `TableNotFound` if the table is not attached.
    pub async fn detach_table(&self, name: &str) -> Result<()> {
        let _ddl = self.ddl.lock().await;
        let table = self.table(name)?;
        tokio::fs::rename(self.metadata_file(name), self.detached_file(name)).await?;
        self.tables.write().remove(name);
        self.detached
            .write()
            .insert(name.to_string(), (*table.metadata()).clone());
        info!("Detached table {} ({})", name, table.uuid());
        Ok(())
    }

    /// Re-open a detached table from its store directory
    ///
    /// # Errors
    /// Returns `TableNotFound` if no detached table has this name.
    pub async fn attach_table(&self, name: &str) -> Result<Arc<Table>> {
        let _ddl = self.ddl.lock().await;
        let metadata = self
            .detached
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        let table = Arc::new(Table::open(Arc::clone(&self.ctx), metadata).await?);
        tokio::fs::rename(self.detached_file(name), self.metadata_file(name)).await?;
        self.detached.write().remove(name);
        self.tables.write().insert(name.to_string(), Arc::clone(&table));
        info!("Attached table {} ({})", name, table.uuid());
        Ok(table)
    }
}
