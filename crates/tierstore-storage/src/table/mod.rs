//! Tables
//!
//! A [`Table`] owns the set of parts of one table and performs every
//! transition between part states: inserts and merges create parts,
//! mutations replace them with new versions, partition operations detach,
//! attach, move or drop them. Superseded parts stay on disk as outdated
//! until no reader holds them and `old_parts_lifetime` has elapsed.
//!
//! Readers take `Arc` snapshots of the active parts and never block
//! transitions. Transitions lease the parts they consume; a second
//! transition touching a leased part fails with [`Error::PartBusy`].

mod mutation;
mod partition;

pub use mutation::{MutationCommand, MutationRecord, MUTATION_FILE_PREFIX};

use crate::context::Context;
use crate::disk::{Disk, Reservation, join};
use crate::part::format::FORMAT_VERSION_FILE;
use crate::part::name::ALL_PARTITION;
use crate::part::{ColumnDesc, Part, PartData, PartFormat, PartInfo, PartState, WriteOptions, partition_id, write_part};
use crate::policy::{DEFAULT_POLICY, StoragePolicy};
use crate::schema::{Block, ColumnDef, Predicate, Query, TableSchema, Value};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tierstore_common::{Error, ErrorClass, Result, TableId};
use tracing::{debug, info, warn};

/// Per-table overrides of the merge tree settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSettings {
    #[serde(default = "default_policy")]
    pub storage_policy: String,
    #[serde(default)]
    pub old_parts_lifetime_secs: Option<u64>,
    #[serde(default)]
    pub index_granularity: Option<usize>,
    #[serde(default)]
    pub min_rows_for_wide_part: Option<u64>,
}

fn default_policy() -> String {
    DEFAULT_POLICY.to_string()
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            storage_policy: default_policy(),
            old_parts_lifetime_secs: None,
            index_granularity: None,
            min_rows_for_wide_part: None,
        }
    }
}

impl TableSettings {
    pub fn with_policy(policy: impl Into<String>) -> Self {
        Self {
            storage_policy: policy.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn old_parts_lifetime(mut self, secs: u64) -> Self {
        self.old_parts_lifetime_secs = Some(secs);
        self
    }

    #[must_use]
    pub const fn index_granularity(mut self, rows: usize) -> Self {
        self.index_granularity = Some(rows);
        self
    }

    #[must_use]
    pub const fn min_rows_for_wide_part(mut self, rows: u64) -> Self {
        self.min_rows_for_wide_part = Some(rows);
        self
    }
}

/// Persistent description of a table (`metadata/<name>.json`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,
    pub uuid: TableId,
    pub schema: TableSchema,
    #[serde(default)]
    pub settings: TableSettings,
}

impl TableMetadata {
    /// Store directory of the table on every disk
    #[must_use]
    pub fn store_path(&self) -> String {
        self.uuid.store_path()
    }
}

/// Write a metadata record atomically
pub(crate) async fn write_metadata_file(path: &Path, metadata: &TableMetadata) -> Result<()> {
    let data = serde_json::to_vec_pretty(metadata)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub(crate) async fn read_metadata_file(path: &Path) -> Result<TableMetadata> {
    let data = tokio::fs::read(path).await?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::corruption(format!("{}: {e}", path.display())))
}

struct OutdatedPart {
    part: Arc<Part>,
    since: Instant,
}

#[derive(Default)]
struct PartSet {
    active: BTreeMap<String, Arc<Part>>,
    outdated: Vec<OutdatedPart>,
}

/// Exclusive claim on parts taking part in a transition
pub(crate) struct PartLease<'a> {
    table: &'a Table,
    names: Vec<String>,
}

impl Drop for PartLease<'_> {
    fn drop(&mut self) {
        let mut leases = self.table.leases.lock();
        for name in &self.names {
            leases.remove(name);
        }
    }
}

pub struct Table {
    ctx: Arc<Context>,
    metadata: RwLock<Arc<TableMetadata>>,
    parts: RwLock<PartSet>,
    leases: Mutex<HashMap<String, &'static str>>,
    next_block: AtomicU64,
    /// Disks known to carry the format marker in the store directory
    marked_disks: Mutex<HashSet<String>>,
}

impl Table {
    /// Create the store directory of a new table
    pub(crate) async fn create(ctx: Arc<Context>, metadata: TableMetadata) -> Result<Self> {
        let table = Self::new(ctx, metadata);
        let disk = table.ctx.registry.get(table.policy()?.main_disk()?)?;
        table.ensure_format_marker(&disk).await?;
        info!(
            "Created table {} ({}) on policy '{}'",
            table.name(),
            table.uuid(),
            table.metadata().settings.storage_policy
        );
        Ok(table)
    }

    /// Open an existing table and load its parts
    pub(crate) async fn open(ctx: Arc<Context>, metadata: TableMetadata) -> Result<Self> {
        let table = Self::new(ctx, metadata);
        table.load_parts().await?;
        Ok(table)
    }

    fn new(ctx: Arc<Context>, metadata: TableMetadata) -> Self {
        Self {
            ctx,
            metadata: RwLock::new(Arc::new(metadata)),
            parts: RwLock::new(PartSet::default()),
            leases: Mutex::new(HashMap::new()),
            next_block: AtomicU64::new(1),
            marked_disks: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> String {
        self.metadata.read().name.clone()
    }

    pub fn uuid(&self) -> TableId {
        self.metadata.read().uuid
    }

    pub fn metadata(&self) -> Arc<TableMetadata> {
        Arc::clone(&self.metadata.read())
    }

    pub fn schema(&self) -> TableSchema {
        self.metadata.read().schema.clone()
    }

    pub fn store_path(&self) -> String {
        self.metadata.read().store_path()
    }

    pub(crate) fn set_name(&self, name: &str) {
        let mut metadata = self.metadata.write();
        let mut updated = (**metadata).clone();
        updated.name = name.to_string();
        *metadata = Arc::new(updated);
    }

    fn policy(&self) -> Result<StoragePolicy> {
        self.ctx.policy(&self.metadata.read().settings.storage_policy)
    }

    fn old_parts_lifetime(&self) -> Duration {
        let secs = self.metadata.read().settings.old_parts_lifetime_secs;
        secs.map_or_else(|| self.ctx.merge_tree().old_parts_lifetime(), Duration::from_secs)
    }

    fn index_granularity(&self) -> usize {
        let rows = self.metadata.read().settings.index_granularity;
        rows.unwrap_or_else(|| self.ctx.merge_tree().index_granularity).max(1)
    }

    fn min_rows_for_wide_part(&self) -> u64 {
        let rows = self.metadata.read().settings.min_rows_for_wide_part;
        rows.unwrap_or_else(|| self.ctx.merge_tree().min_rows_for_wide_part)
    }

    /// Rewrite `metadata/<name>.json` after a schema change
    async fn persist_metadata(&self, metadata: TableMetadata) -> Result<()> {
        let path = self.ctx.metadata_dir().join(format!("{}.json", metadata.name));
        write_metadata_file(&path, &metadata).await?;
        *self.metadata.write() = Arc::new(metadata);
        Ok(())
    }

    /// Snapshot of the active parts, ordered by name
    pub fn parts(&self) -> Vec<Arc<Part>> {
        self.parts.read().active.values().cloned().collect()
    }

    pub fn part_names(&self) -> Vec<String> {
        self.parts.read().active.keys().cloned().collect()
    }

    /// Number of superseded parts still on disk
    pub fn outdated_parts(&self) -> usize {
        self.parts.read().outdated.len()
    }

    fn parts_in_partition(&self, partition_id: &str) -> Vec<Arc<Part>> {
        self.parts
            .read()
            .active
            .values()
            .filter(|p| p.info.partition_id == partition_id)
            .cloned()
            .collect()
    }

    /// Partition id for a partition key value
    pub fn partition_id(&self, partition: &Value) -> Result<String> {
        let metadata = self.metadata();
        match &metadata.schema.partition_by {
            Some(column) => {
                let def = metadata
                    .schema
                    .column(column)
                    .ok_or_else(|| Error::ColumnNotFound(column.clone()))?;
                Ok(partition_id(&partition.cast(def.ty)?))
            }
            None => Ok(ALL_PARTITION.to_string()),
        }
    }

    fn allocate_block(&self) -> u64 {
        self.next_block.fetch_add(1, Ordering::SeqCst)
    }

    fn observe_version(&self, version: u64) {
        self.next_block.fetch_max(version + 1, Ordering::SeqCst);
    }

    pub(crate) fn lease(&self, parts: &[Arc<Part>], operation: &'static str) -> Result<PartLease<'_>> {
        let mut leases = self.leases.lock();
        if let Some((name, op)) = parts
            .iter()
            .find_map(|p| leases.get(&p.name).map(|op| (p.name.clone(), *op)))
        {
            return Err(Error::PartBusy {
                part: name,
                operation: op.to_string(),
            });
        }
        let names: Vec<String> = parts.iter().map(|p| p.name.clone()).collect();
        for name in &names {
            leases.insert(name.clone(), operation);
        }
        Ok(PartLease { table: self, names })
    }

    fn ensure_active(&self, parts: &[Arc<Part>]) -> Result<()> {
        let set = self.parts.read();
        for part in parts {
            match set.active.get(&part.name) {
                Some(active) if Arc::ptr_eq(active, part) => {}
                _ => return Err(Error::PartNotFound(part.name.clone())),
            }
        }
        Ok(())
    }

    /// Swap parts in one step: `added` become active, `removed` outdated
    async fn commit(&self, added: Vec<Arc<Part>>, removed: Vec<Arc<Part>>) {
        {
            let mut set = self.parts.write();
            let now = Instant::now();
            let mut outdated = removed;
            for part in &added {
                let covered: Vec<String> = set
                    .active
                    .values()
                    .filter(|p| part.info.contains(&p.info))
                    .map(|p| p.name.clone())
                    .collect();
                for name in covered {
                    if let Some(p) = set.active.remove(&name) {
                        outdated.push(p);
                    }
                }
            }
            for part in outdated {
                if set.outdated.iter().any(|o| Arc::ptr_eq(&o.part, &part)) {
                    continue;
                }
                if set.active.get(&part.name).is_some_and(|a| Arc::ptr_eq(a, &part)) {
                    set.active.remove(&part.name);
                }
                part.set_state(PartState::Outdated);
                set.outdated.push(OutdatedPart { part, since: now });
            }
            for part in added {
                part.set_state(PartState::Active);
                self.observe_version(part.info.max_version());
                set.active.insert(part.name.clone(), part);
            }
        }
        if self.old_parts_lifetime().is_zero() {
            if let Err(e) = self.clear_old_parts().await {
                warn!("Failed to remove outdated parts of {}: {}", self.name(), e);
            }
        }
    }

    /// Remove outdated parts whose lifetime elapsed and that no reader holds
    pub async fn clear_old_parts(&self) -> Result<usize> {
        let lifetime = self.old_parts_lifetime();
        let now = Instant::now();
        let due: Vec<OutdatedPart> = {
            let mut set = self.parts.write();
            let (due, keep): (Vec<_>, Vec<_>) = set.outdated.drain(..).partition(|o| {
                now.duration_since(o.since) >= lifetime && Arc::strong_count(&o.part) == 1
            });
            set.outdated = keep;
            due
        };

        let mut removed = 0;
        let mut failed = Vec::new();
        for outdated in due {
            let part = &outdated.part;
            let result = match self.ctx.registry.get(&part.disk) {
                Ok(disk) => disk.remove_recursive(&part.path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    debug!("Removed outdated part {} from disk '{}'", part.name, part.disk);
                    part.set_state(PartState::Deleted);
                    removed += 1;
                }
                Err(e) => {
                    warn!("Failed to remove part {} from disk '{}': {}", part.name, part.disk, e);
                    failed.push(outdated);
                }
            }
        }
        if !failed.is_empty() {
            self.parts.write().outdated.extend(failed);
        }
        Ok(removed)
    }

    /// Write the format marker into the store directory of `disk` once
    async fn ensure_format_marker(&self, disk: &Arc<dyn Disk>) -> Result<()> {
        if self.marked_disks.lock().contains(disk.name()) {
            return Ok(());
        }
        let path = join(&self.store_path(), FORMAT_VERSION_FILE);
        if !disk.exists(&path).await? {
            disk.write_file(&path, Bytes::from_static(b"1")).await?;
        }
        self.marked_disks.lock().insert(disk.name().to_string());
        Ok(())
    }

    async fn load_parts(&self) -> Result<()> {
        let metadata = self.metadata();
        let store = metadata.store_path();
        let policy = self.policy()?;
        let main_disk = self.ctx.registry.get(policy.main_disk()?)?;
        let (overrides, last_mutation) = mutation::load_overrides(main_disk.as_ref(), &store).await?;
        self.observe_version(last_mutation);

        let mut loaded: Vec<Arc<Part>> = Vec::new();
        for disk_name in &policy.disks {
            let disk = self.ctx.registry.get(disk_name)?;
            if disk.exists(&join(&store, FORMAT_VERSION_FILE)).await? {
                self.marked_disks.lock().insert(disk_name.clone());
            }
            for entry in disk.list(&store).await? {
                if !entry.is_dir {
                    continue;
                }
                let path = join(&store, &entry.name);
                if entry.name.starts_with("tmp_") {
                    info!("Removing temporary directory {}:{}", disk_name, path);
                    disk.remove_recursive(&path).await?;
                    continue;
                }
                if entry.name == partition::DETACHED_DIR {
                    for detached in disk.list(&path).await? {
                        let name = partition::strip_detached_prefix(&detached.name);
                        if let Ok(info) = name.parse::<PartInfo>() {
                            self.observe_version(info.max_version());
                        }
                    }
                    continue;
                }
                let Ok(info) = entry.name.parse::<PartInfo>() else {
                    debug!("Skipping unknown directory {}:{}", disk_name, path);
                    continue;
                };
                self.observe_version(info.max_version());
                match Part::load(disk.as_ref(), &path, info, overrides.get(&entry.name)).await {
                    Ok(part) => loaded.push(Arc::new(part)),
                    Err(e) if matches!(e.class(), ErrorClass::Corruption | ErrorClass::NotFound) => {
                        let broken = join(&store, &format!("{}/broken_{}", partition::DETACHED_DIR, entry.name));
                        warn!(
                            "Part {}:{} is broken ({}), moving it to {}",
                            disk_name, path, e, broken
                        );
                        disk.remove_recursive(&broken).await?;
                        disk.rename(&path, &broken).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let mut set = PartSet::default();
        let now = Instant::now();
        for part in &loaded {
            let covered = loaded.iter().any(|other| other.info.contains(&part.info));
            if covered || set.active.contains_key(&part.name) {
                part.set_state(PartState::Outdated);
                set.outdated.push(OutdatedPart {
                    part: Arc::clone(part),
                    since: now,
                });
            } else {
                set.active.insert(part.name.clone(), Arc::clone(part));
            }
        }
        drop(loaded);
        info!(
            "Loaded table {}: {} active parts, {} outdated",
            metadata.name,
            set.active.len(),
            set.outdated.len()
        );
        let has_outdated = !set.outdated.is_empty();
        *self.parts.write() = set;
        if has_outdated && self.old_parts_lifetime().is_zero() {
            self.clear_old_parts().await?;
        }
        Ok(())
    }

    /// Write a new part into a temporary directory, then rename it into place
    async fn write_new_part(
        &self,
        disk: &Arc<dyn Disk>,
        info: PartInfo,
        data: &PartData,
        purpose: &str,
    ) -> Result<Arc<Part>> {
        let metadata = self.metadata();
        let store = metadata.store_path();
        self.ensure_format_marker(disk).await?;

        let name = info.to_string();
        let tmp = join(&store, &format!("tmp_{purpose}_{name}"));
        disk.remove_recursive(&tmp).await?;
        let options = WriteOptions {
            format: PartFormat::for_rows(data.rows() as u64, self.min_rows_for_wide_part()),
            granularity: self.index_granularity(),
            order_by: &metadata.schema.order_by,
            skip_indices: &metadata.schema.skip_indices,
        };
        let part = match write_part(disk, &tmp, info, data, options).await {
            Ok(part) => part,
            Err(e) => {
                if let Err(cleanup) = disk.remove_recursive(&tmp).await {
                    warn!("Failed to clean up {}:{}: {}", disk.name(), tmp, cleanup);
                }
                return Err(e);
            }
        };
        let path = join(&store, &name);
        disk.rename(&tmp, &path).await?;
        Ok(Arc::new(part.relocated(part.info.clone(), disk.name(), &path)))
    }

    /// Insert a block; one new part per partition
    ///
    /// The insert is all-or-nothing: every partition's part is written and
    /// its space stays reserved until all of them exist, then they are
    /// committed together. If any part fails, the parts already written are
    /// removed and none become visible. Returns the names of the new parts.
    pub async fn insert(&self, block: &Block) -> Result<Vec<String>> {
        let metadata = self.metadata();
        let schema = &metadata.schema;
        let rows = normalize_rows(schema, block)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let partition_column = schema.partition_by.as_deref().and_then(|c| schema.position(c));
        let mut partitions: BTreeMap<Option<Value>, Vec<Vec<Value>>> = BTreeMap::new();
        for row in rows {
            let key = partition_column.map(|p| row[p].clone());
            partitions.entry(key).or_default().push(row);
        }

        let policy = self.policy()?;
        let mut staged: Vec<Arc<Part>> = Vec::with_capacity(partitions.len());
        let mut reservations = Vec::with_capacity(partitions.len());
        for (partition, rows) in partitions {
            match self.stage_insert(&policy, schema, partition, rows).await {
                Ok((part, reservation)) => {
                    staged.push(part);
                    reservations.push(reservation);
                }
                Err(e) => {
                    self.discard_staged(&staged).await;
                    return Err(e);
                }
            }
        }

        let names: Vec<String> = staged.iter().map(|p| p.name.clone()).collect();
        for part in &staged {
            debug!(
                "Inserted part {} ({} rows) into {} on disk '{}'",
                part.name, part.rows, metadata.name, part.disk
            );
        }
        self.commit(staged, Vec::new()).await;
        drop(reservations);
        Ok(names)
    }

    /// Write one partition's part of an insert without committing it
    async fn stage_insert(
        &self,
        policy: &StoragePolicy,
        schema: &TableSchema,
        partition: Option<Value>,
        mut rows: Vec<Vec<Value>>,
    ) -> Result<(Arc<Part>, Reservation)> {
        sort_rows(schema, &mut rows)?;
        let partition_id = partition.as_ref().map_or_else(|| ALL_PARTITION.to_string(), partition_id);
        let data = part_data(schema, rows, partition);
        let (disk, reservation) = policy.reserve(&self.ctx.registry, data.estimated_size())?;
        let info = PartInfo::new_insert(partition_id, self.allocate_block());
        let part = self.write_new_part(&disk, info, &data, "insert").await?;
        Ok((part, reservation))
    }

    /// Remove parts written by an insert that did not commit
    async fn discard_staged(&self, parts: &[Arc<Part>]) {
        for part in parts {
            let removed = match self.ctx.registry.get(&part.disk) {
                Ok(disk) => disk.remove_recursive(&part.path).await,
                Err(e) => Err(e),
            };
            if let Err(e) = removed {
                warn!("Failed to remove uncommitted part {}:{}: {}", part.disk, part.path, e);
            }
        }
    }

    /// Rows matching `query`, in schema order of the requested columns
    pub async fn select(&self, query: &Query) -> Result<Vec<Vec<Value>>> {
        let metadata = self.metadata();
        let schema = &metadata.schema;
        let columns: Vec<&ColumnDef> = if query.columns.is_empty() {
            schema.columns.iter().collect()
        } else {
            query
                .columns
                .iter()
                .map(|c| schema.column(c).ok_or_else(|| Error::ColumnNotFound(c.clone())))
                .collect::<Result<_>>()?
        };
        let filter = query.filter.as_ref().map(|f| typed_filter(schema, f)).transpose()?;

        let mut rows = Vec::new();
        for part in self.parts() {
            let disk = self.ctx.registry.get(&part.disk)?;
            rows.extend(part.select(disk.as_ref(), schema, &columns, filter.as_ref()).await?);
        }
        Ok(rows)
    }

    /// Total number of rows in active parts
    pub fn count(&self) -> u64 {
        self.parts.read().active.values().map(|p| p.rows).sum()
    }

    pub async fn count_where(&self, filter: Predicate) -> Result<u64> {
        let column = filter.column().to_string();
        let rows = self.select(&Query::select(&[&column]).filter(filter)).await?;
        Ok(rows.len() as u64)
    }

    /// Sum of a numeric column over rows matching `filter`
    pub async fn sum(&self, column: &str, filter: Option<Predicate>) -> Result<i128> {
        let mut query = Query::select(&[column]);
        query.filter = filter;
        self.select(&query)
            .await?
            .iter()
            .map(|row| {
                row.first()
                    .and_then(Value::as_i128)
                    .ok_or_else(|| Error::invalid_argument(format!("column '{column}' is not numeric")))
            })
            .sum()
    }

    /// Distinct values of a column
    pub async fn distinct(&self, column: &str) -> Result<BTreeSet<Value>> {
        let rows = self.select(&Query::select(&[column])).await?;
        Ok(rows.into_iter().filter_map(|row| row.into_iter().next()).collect())
    }

    /// Merge the parts of each partition (or of one partition) into one
    ///
    /// With `final_merge`, a partition with a single part is rewritten when
    /// the part does not carry the current columns. Returns the new part names.
    pub async fn optimize(&self, partition: Option<&Value>, final_merge: bool) -> Result<Vec<String>> {
        let only = partition.map(|p| self.partition_id(p)).transpose()?;
        let schema = self.schema();
        let current: Vec<ColumnDesc> = schema.columns.iter().map(ColumnDesc::from).collect();

        let mut groups: BTreeMap<String, Vec<Arc<Part>>> = BTreeMap::new();
        for part in self.parts() {
            if only.as_ref().is_none_or(|id| *id == part.info.partition_id) {
                groups.entry(part.info.partition_id.clone()).or_default().push(part);
            }
        }

        let mut merged = Vec::new();
        for (_, parts) in groups {
            let stale = parts.iter().any(|p| p.columns != current);
            if parts.len() > 1 || (final_merge && stale) {
                merged.push(self.merge_parts(parts).await?);
            }
        }
        Ok(merged)
    }

    async fn merge_parts(&self, parts: Vec<Arc<Part>>) -> Result<String> {
        let _lease = self.lease(&parts, "merge")?;
        self.ensure_active(&parts)?;
        let metadata = self.metadata();
        let schema = &metadata.schema;

        let mut rows = Vec::new();
        for part in &parts {
            let disk = self.ctx.registry.get(&part.disk)?;
            let mut columns = Vec::with_capacity(schema.columns.len());
            for def in &schema.columns {
                columns.push(part.read_column(disk.as_ref(), def).await?);
            }
            rows.extend(transpose_columns(columns, part.rows as usize));
        }
        sort_rows(schema, &mut rows)?;

        let infos: Vec<&PartInfo> = parts.iter().map(|p| &p.info).collect();
        let info = PartInfo::merged(&infos)?;
        let data = part_data(schema, rows, parts[0].partition.clone());
        let disk = self.ctx.registry.get(&parts[0].disk)?;
        let _reservation = disk.reserve(data.estimated_size())?;
        let part = self.write_new_part(&disk, info, &data, "merge").await?;
        info!(
            "Merged {} parts into {} ({} rows) in {}",
            parts.len(),
            part.name,
            part.rows,
            metadata.name
        );
        let name = part.name.clone();
        self.commit(vec![part], parts).await;
        Ok(name)
    }

    /// Verify every file of every active part against its checksum
    pub async fn check(&self) -> Result<bool> {
        let mut healthy = true;
        for part in self.parts() {
            let disk = self.ctx.registry.get(&part.disk)?;
            for problem in part.check(disk.as_ref()).await? {
                warn!("Check of {} failed: {}", self.name(), problem);
                healthy = false;
            }
        }
        Ok(healthy)
    }

    /// Forget every part and remove the store directories
    ///
    /// With `sync` the files are removed before returning; otherwise the
    /// reclaimer removes them once `old_parts_lifetime` elapsed.
    pub(crate) async fn drop_data(&self, sync: bool) -> Result<()> {
        let store = self.store_path();
        let mut disks: BTreeSet<String> = self.policy()?.disks.into_iter().collect();
        {
            let mut set = self.parts.write();
            for part in set.active.values() {
                disks.insert(part.disk.clone());
                part.set_state(PartState::Deleted);
            }
            for outdated in &set.outdated {
                disks.insert(outdated.part.disk.clone());
                outdated.part.set_state(PartState::Deleted);
            }
            *set = PartSet::default();
        }

        let delay = self.old_parts_lifetime();
        for disk_name in disks {
            if sync {
                self.ctx.registry.get(&disk_name)?.remove_recursive(&store).await?;
            } else {
                self.ctx.schedule_delete(&disk_name, &store, delay);
            }
        }
        Ok(())
    }
}

enum Source {
    Column(usize),
    Default(Value),
}

/// Rows of `block` laid out in schema column order, defaults filled in
fn normalize_rows(schema: &TableSchema, block: &Block) -> Result<Vec<Vec<Value>>> {
    for name in &block.columns {
        if schema.column(name).is_none() {
            return Err(Error::ColumnNotFound(name.clone()));
        }
    }
    let mut sources = Vec::with_capacity(schema.columns.len());
    for def in &schema.columns {
        sources.push(match block.columns.iter().position(|c| *c == def.name) {
            Some(i) => Source::Column(i),
            None => Source::Default(def.default_value()?),
        });
    }

    block
        .rows
        .iter()
        .map(|row| {
            if row.len() != block.columns.len() {
                return Err(Error::invalid_argument(format!(
                    "row has {} values, block has {} columns",
                    row.len(),
                    block.columns.len()
                )));
            }
            schema
                .columns
                .iter()
                .zip(&sources)
                .map(|(def, source)| match source {
                    Source::Column(i) => row[*i].cast(def.ty),
                    Source::Default(value) => Ok(value.clone()),
                })
                .collect()
        })
        .collect()
}

fn sort_rows(schema: &TableSchema, rows: &mut [Vec<Value>]) -> Result<()> {
    let key: Vec<usize> = schema
        .order_by
        .iter()
        .map(|c| schema.position(c).ok_or_else(|| Error::ColumnNotFound(c.clone())))
        .collect::<Result<_>>()?;
    rows.sort_by(|a, b| {
        key.iter()
            .map(|&k| a[k].cmp(&b[k]))
            .find(|o| o.is_ne())
            .unwrap_or(CmpOrdering::Equal)
    });
    Ok(())
}

fn part_data(schema: &TableSchema, rows: Vec<Vec<Value>>, partition: Option<Value>) -> PartData {
    let mut values: Vec<Vec<Value>> = schema.columns.iter().map(|_| Vec::with_capacity(rows.len())).collect();
    for row in rows {
        for (column, value) in values.iter_mut().zip(row) {
            column.push(value);
        }
    }
    PartData {
        columns: schema.columns.iter().map(ColumnDesc::from).collect(),
        values,
        partition,
    }
}

fn transpose_columns(columns: Vec<Vec<Value>>, rows: usize) -> Vec<Vec<Value>> {
    let mut out: Vec<Vec<Value>> = (0..rows).map(|_| Vec::with_capacity(columns.len())).collect();
    for column in columns {
        for (row, value) in out.iter_mut().zip(column) {
            row.push(value);
        }
    }
    out
}

fn typed_filter(schema: &TableSchema, filter: &Predicate) -> Result<Predicate> {
    let def = schema
        .column(filter.column())
        .ok_or_else(|| Error::ColumnNotFound(filter.column().to_string()))?;
    filter.cast(def.ty)
}
