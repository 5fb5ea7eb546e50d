//! Immutable data parts
//!
//! A part is a directory of column, mark and index files written once and
//! never modified. Merges and mutations produce new parts; the old ones
//! become outdated and are reclaimed later.

pub mod codec;
pub mod format;
pub mod name;

pub use format::PartFormat;
pub use name::{PartInfo, partition_id};

use crate::disk::{Disk, FileWriter, join};
use crate::schema::{ColumnDef, ColumnType, Predicate, SkipIndexDef, TableSchema, Value};
use bytes::Bytes;
use codec::Mark;
use format::{
    CHECKSUMS_FILE, CODEC_FILE, COLUMNS_FILE, COMPACT_DATA_FILE, COMPACT_MARKS_FILE, COUNT_FILE,
    DEFAULT_CODEC, METADATA_VERSION_FILE, PARTITION_FILE, PRIMARY_INDEX_FILE, skip_index_files,
};
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tierstore_common::{ByteRange, Error, Result};
use tracing::debug;

/// Size and CRC32C of one file of a part
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    pub size: u64,
    pub crc32c: u32,
}

impl FileChecksum {
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            size: data.len() as u64,
            crc32c: crc32c::crc32c(data),
        }
    }
}

/// Read `dir/file` and compare it against its recorded checksum
async fn verify_file(disk: &dyn Disk, dir: &str, file: &str, expected: &FileChecksum) -> Result<()> {
    let path = join(dir, file);
    let data = match disk.read(&path, None).await {
        Ok(data) => data,
        Err(e) if e.is_not_found() => {
            return Err(Error::corruption(format!("{dir}: missing file {file}")));
        }
        Err(e) => return Err(e),
    };
    let actual = FileChecksum::compute(&data);
    if actual.size != expected.size {
        return Err(Error::corruption(format!(
            "{path}: size {}, expected {}",
            actual.size, expected.size
        )));
    }
    if actual.crc32c != expected.crc32c {
        return Err(Error::ChecksumMismatch {
            path,
            expected: expected.crc32c,
            actual: actual.crc32c,
        });
    }
    Ok(())
}

/// Checksums of every file of a part except `checksums.txt` itself
pub type Checksums = BTreeMap<String, FileChecksum>;

/// Column as stored in a part
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

impl From<&ColumnDef> for ColumnDesc {
    fn from(def: &ColumnDef) -> Self {
        Self {
            name: def.name.clone(),
            ty: def.ty,
        }
    }
}

/// Effective columns and checksums of a part produced by a mutation
///
/// Such a part shares `columns.txt` and `checksums.txt` with its source by
/// hard link, so the authoritative description lives in the table's
/// mutation record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartOverride {
    pub columns: Vec<ColumnDesc>,
    pub checksums: Checksums,
}

/// Lifecycle state of a part
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartState {
    /// Visible to reads
    Active,
    /// Superseded or dropped; waiting for the reclaimer
    Outdated,
    /// Moved under `detached/`; invisible to reads
    Detached,
    /// Files removed
    Deleted,
}

impl fmt::Display for PartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Outdated => write!(f, "Outdated"),
            Self::Detached => write!(f, "Detached"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Column-major rows of a new part, already sorted by the table order key
#[derive(Clone, Debug)]
pub struct PartData {
    pub columns: Vec<ColumnDesc>,
    pub values: Vec<Vec<Value>>,
    pub partition: Option<Value>,
}

impl PartData {
    #[must_use]
    pub fn rows(&self) -> usize {
        self.values.first().map_or(0, Vec::len)
    }

    fn position(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| Error::ColumnNotFound(column.to_string()))
    }

    /// Rough size estimate for space reservation
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        let cells: u64 = self
            .values
            .iter()
            .flatten()
            .map(|v| match v {
                Value::String(s) => 5 + s.len() as u64,
                Value::Date(_) => 5,
                _ => 9,
            })
            .sum();
        cells + 4096
    }
}

/// Layout parameters for writing a part
#[derive(Clone, Copy, Debug)]
pub struct WriteOptions<'a> {
    pub format: PartFormat,
    pub granularity: usize,
    pub order_by: &'a [String],
    pub skip_indices: &'a [SkipIndexDef],
}

/// Encode the data and mark files of a part
pub fn encode_data_files(
    format: PartFormat,
    columns: &[ColumnDesc],
    values: &[Vec<Value>],
    granularity: usize,
) -> Vec<(String, Vec<u8>)> {
    match format {
        PartFormat::Wide => columns
            .iter()
            .zip(values)
            .flat_map(|(column, values)| {
                let (data, marks) = codec::encode_column(values, granularity);
                let (bin, mrk) = format.column_files(&column.name);
                [(bin, data), (mrk, codec::encode_marks(&marks))]
            })
            .collect(),
        PartFormat::Compact => {
            let (data, marks) = codec::encode_compact(values, granularity);
            vec![
                (COMPACT_DATA_FILE.to_string(), data),
                (COMPACT_MARKS_FILE.to_string(), codec::encode_marks(&marks)),
            ]
        }
    }
}

/// Write files concurrently and return their checksums
pub async fn write_files(
    disk: &Arc<dyn Disk>,
    dir: &str,
    files: Vec<(String, Vec<u8>)>,
) -> Result<Checksums> {
    let writes = files.into_iter().map(|(name, data)| {
        let checksum = FileChecksum::compute(&data);
        let mut writer = FileWriter::new(Arc::clone(disk), join(dir, &name));
        writer.write(&data);
        async move {
            writer.finish().await?;
            Ok::<_, Error>((name, checksum))
        }
    });
    Ok(try_join_all(writes).await?.into_iter().collect())
}

/// Write a complete part into `dir`
pub async fn write_part(
    disk: &Arc<dyn Disk>,
    dir: &str,
    info: PartInfo,
    data: &PartData,
    options: WriteOptions<'_>,
) -> Result<Part> {
    let rows = data.rows();
    let granularity = options.granularity.max(1);
    let mut files = encode_data_files(options.format, &data.columns, &data.values, granularity);

    // Primary index: order key at the first row of each granule, plus the last row
    let key_positions = options
        .order_by
        .iter()
        .map(|c| data.position(c))
        .collect::<Result<Vec<_>>>()?;
    let key_at = |row: usize| -> Vec<Value> {
        key_positions
            .iter()
            .map(|&p| data.values[p][row].clone())
            .collect()
    };
    let mut primary_index: Vec<Vec<Value>> = (0..rows).step_by(granularity).map(key_at).collect();
    if rows > 0 {
        primary_index.push(key_at(rows - 1));
    }
    files.push((PRIMARY_INDEX_FILE.to_string(), codec::encode_rows(&primary_index)));

    for index in options.skip_indices {
        let values = &data.values[data.position(&index.column)?];
        let rows_per_entry = granularity * index.granularity.max(1);
        let mut entries = Vec::new();
        let mut marks = Vec::new();
        for (i, chunk) in values.chunks(rows_per_entry).enumerate() {
            let min = chunk.iter().min().cloned().unwrap_or_else(|| chunk[0].clone());
            let max = chunk.iter().max().cloned().unwrap_or_else(|| chunk[0].clone());
            entries.push(vec![min, max]);
            marks.push(Mark {
                offset: i as u64,
                rows: chunk.len().div_ceil(granularity) as u64,
            });
        }
        let (idx, mrk) = skip_index_files(&index.name);
        files.push((idx, codec::encode_rows(&entries)));
        files.push((mrk, codec::encode_marks(&marks)));
    }

    let partition_rows: Vec<Vec<Value>> = data.partition.iter().map(|v| vec![v.clone()]).collect();
    files.push((PARTITION_FILE.to_string(), codec::encode_rows(&partition_rows)));
    files.push((COUNT_FILE.to_string(), rows.to_string().into_bytes()));
    files.push((CODEC_FILE.to_string(), DEFAULT_CODEC.as_bytes().to_vec()));
    files.push((METADATA_VERSION_FILE.to_string(), b"0".to_vec()));
    files.push((COLUMNS_FILE.to_string(), serde_json::to_vec(&data.columns)?));

    let checksums = write_files(disk, dir, files).await?;
    let encoded = serde_json::to_vec_pretty(&checksums)?;
    disk.write_file(&join(dir, CHECKSUMS_FILE), Bytes::from(encoded))
        .await?;

    debug!(
        "Wrote part {} ({} rows, {}, {} files) to {}:{}",
        info,
        rows,
        options.format,
        checksums.len() + 1,
        disk.name(),
        dir
    );
    Ok(Part {
        name: info.to_string(),
        info,
        disk: disk.name().to_string(),
        path: dir.to_string(),
        format: options.format,
        rows: rows as u64,
        columns: data.columns.clone(),
        checksums,
        partition: data.partition.clone(),
        primary_index,
        overridden: false,
        state: Mutex::new(PartState::Active),
    })
}

/// Loaded description of a part directory
#[derive(Debug)]
pub struct Part {
    pub info: PartInfo,
    pub name: String,
    /// Disk holding the files
    pub disk: String,
    /// Directory relative to the disk root
    pub path: String,
    pub format: PartFormat,
    pub rows: u64,
    pub columns: Vec<ColumnDesc>,
    pub checksums: Checksums,
    pub partition: Option<Value>,
    /// Order key at each granule start, then at the last row
    pub primary_index: Vec<Vec<Value>>,
    /// Metadata comes from a mutation record rather than the part's own files
    pub overridden: bool,
    state: Mutex<PartState>,
}

impl Part {
    /// Load a part directory, verifying that every listed file is present
    /// with the recorded size
    pub async fn load(
        disk: &dyn Disk,
        dir: &str,
        info: PartInfo,
        overrides: Option<&PartOverride>,
    ) -> Result<Self> {
        let (columns, checksums) = match overrides {
            Some(o) => (o.columns.clone(), o.checksums.clone()),
            None => {
                let checksums: Checksums =
                    serde_json::from_slice(&disk.read(&join(dir, CHECKSUMS_FILE), None).await?)
                        .map_err(|e| Error::corruption(format!("{dir}/{CHECKSUMS_FILE}: {e}")))?;
                let columns: Vec<ColumnDesc> =
                    serde_json::from_slice(&disk.read(&join(dir, COLUMNS_FILE), None).await?)
                        .map_err(|e| Error::corruption(format!("{dir}/{COLUMNS_FILE}: {e}")))?;
                (columns, checksums)
            }
        };

        try_join_all(checksums.iter().map(|(file, expected)| verify_file(disk, dir, file, expected))).await?;

        let format = if checksums.contains_key(COMPACT_MARKS_FILE) {
            PartFormat::Compact
        } else {
            PartFormat::Wide
        };
        let count = disk.read(&join(dir, COUNT_FILE), None).await?;
        let rows = std::str::from_utf8(&count)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::corruption(format!("{dir}/{COUNT_FILE}: not a number")))?;
        let primary_index = codec::decode_rows(&disk.read(&join(dir, PRIMARY_INDEX_FILE), None).await?)?;
        let partition = codec::decode_rows(&disk.read(&join(dir, PARTITION_FILE), None).await?)?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next());

        Ok(Self {
            name: info.to_string(),
            info,
            disk: disk.name().to_string(),
            path: dir.to_string(),
            format,
            rows,
            columns,
            checksums,
            partition,
            primary_index,
            overridden: overrides.is_some(),
            state: Mutex::new(PartState::Active),
        })
    }

    /// Same part description at another location (rename, move, clone)
    #[must_use]
    pub fn relocated(&self, info: PartInfo, disk: &str, path: &str) -> Self {
        Self {
            name: info.to_string(),
            info,
            disk: disk.to_string(),
            path: path.to_string(),
            format: self.format,
            rows: self.rows,
            columns: self.columns.clone(),
            checksums: self.checksums.clone(),
            partition: self.partition.clone(),
            primary_index: self.primary_index.clone(),
            overridden: self.overridden,
            state: Mutex::new(PartState::Active),
        }
    }

    /// Same files with different effective metadata (mutations)
    #[must_use]
    pub fn with_override(&self, info: PartInfo, path: &str, overrides: PartOverride) -> Self {
        Self {
            columns: overrides.columns,
            checksums: overrides.checksums,
            overridden: true,
            ..self.relocated(info, &self.disk, path)
        }
    }

    pub fn state(&self) -> PartState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: PartState) {
        *self.state.lock() = state;
    }

    /// Number of granules
    #[must_use]
    pub fn granules(&self) -> usize {
        self.primary_index.len().saturating_sub(1)
    }

    /// Bytes of all files except `checksums.txt`
    #[must_use]
    pub fn bytes_on_disk(&self) -> u64 {
        self.checksums.values().map(|c| c.size).sum()
    }

    /// All file names of the part, including `checksums.txt`
    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        let mut files: Vec<String> = self.checksums.keys().cloned().collect();
        files.push(CHECKSUMS_FILE.to_string());
        files
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDesc> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The current effective metadata of this part
    #[must_use]
    pub fn overrides(&self) -> PartOverride {
        PartOverride {
            columns: self.columns.clone(),
            checksums: self.checksums.clone(),
        }
    }

    /// Re-read every file and compare against its checksum
    ///
    /// Returns a description of each problem found.
    pub async fn check(&self, disk: &dyn Disk) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        for (file, expected) in &self.checksums {
            match disk.read(&join(&self.path, file), None).await {
                Ok(data) => {
                    let actual = FileChecksum::compute(&data);
                    if actual != *expected {
                        problems.push(
                            Error::ChecksumMismatch {
                                path: join(&self.path, file),
                                expected: expected.crc32c,
                                actual: actual.crc32c,
                            }
                            .to_string(),
                        );
                    }
                }
                Err(e) if e.is_not_found() => problems.push(format!("{}: missing {file}", self.name)),
                Err(e) => return Err(e),
            }
        }
        Ok(problems)
    }

    async fn read_marks(&self, disk: &dyn Disk, column: &str) -> Result<(Vec<Mark>, Vec<u64>)> {
        let (_, mrk) = self.format.column_files(column);
        let all = codec::decode_marks(&disk.read(&join(&self.path, &mrk), None).await?)?;
        let offsets: Vec<u64> = all.iter().map(|m| m.offset).collect();
        let marks = match self.format {
            PartFormat::Wide => all,
            PartFormat::Compact => {
                let index = self
                    .columns
                    .iter()
                    .position(|c| c.name == column)
                    .ok_or_else(|| Error::ColumnNotFound(column.to_string()))?;
                codec::compact_column_marks(&all, self.columns.len(), index)?
            }
        };
        Ok((marks, offsets))
    }

    /// Read the given granules of a stored column
    ///
    /// Adjacent granules of wide parts are fetched with one range read; compact
    /// parts read their shared data file once.
    async fn read_granules(
        &self,
        disk: &dyn Disk,
        column: &ColumnDesc,
        granules: &[usize],
    ) -> Result<BTreeMap<usize, Vec<Value>>> {
        let mut result = BTreeMap::new();
        if granules.is_empty() {
            return Ok(result);
        }
        let (bin, _) = self.format.column_files(&column.name);
        let bin_path = join(&self.path, &bin);
        let file_size = self
            .checksums
            .get(&bin)
            .map(|c| c.size)
            .ok_or_else(|| Error::corruption(format!("{}: no checksum for {bin}", self.name)))?;
        let (marks, offsets) = self.read_marks(disk, &column.name).await?;
        let range_of = |g: usize| -> Result<(u64, u64)> {
            let mark = marks
                .get(g)
                .ok_or_else(|| Error::corruption(format!("{}: no mark {g} for {}", self.name, column.name)))?;
            Ok(codec::granule_range(&offsets, mark.offset, file_size))
        };

        match self.format {
            PartFormat::Compact => {
                let data = disk.read(&bin_path, None).await?;
                for &g in granules {
                    let (start, end) = range_of(g)?;
                    let slice = data
                        .get(start as usize..end as usize)
                        .ok_or_else(|| Error::corruption(format!("{bin_path}: granule {g} out of bounds")))?;
                    result.insert(g, codec::decode_values(slice, marks[g].rows as usize)?);
                }
            }
            PartFormat::Wide => {
                let mut i = 0;
                while i < granules.len() {
                    let mut j = i;
                    while j + 1 < granules.len() && granules[j + 1] == granules[j] + 1 {
                        j += 1;
                    }
                    let (start, _) = range_of(granules[i])?;
                    let (_, end) = range_of(granules[j])?;
                    let data = disk
                        .read(&bin_path, Some(ByteRange::new(start, end - start)))
                        .await?;
                    for &g in &granules[i..=j] {
                        let (g_start, g_end) = range_of(g)?;
                        let slice = data
                            .get((g_start - start) as usize..(g_end - start) as usize)
                            .ok_or_else(|| Error::corruption(format!("{bin_path}: granule {g} out of bounds")))?;
                        result.insert(g, codec::decode_values(slice, marks[g].rows as usize)?);
                    }
                    i = j + 1;
                }
            }
        }
        Ok(result)
    }

    /// Row count of every granule, taken from the marks of a stored column
    async fn granule_row_counts(&self, disk: &dyn Disk) -> Result<Vec<u64>> {
        let Some(first) = self.columns.first() else {
            return Ok(Vec::new());
        };
        let (marks, _) = self.read_marks(disk, &first.name).await?;
        Ok(marks.iter().map(|m| m.rows).collect())
    }

    /// Rows per granule the part was written with
    pub async fn index_granularity(&self, disk: &dyn Disk) -> Result<usize> {
        let counts = self.granule_row_counts(disk).await?;
        Ok(counts.first().copied().unwrap_or(1).max(1) as usize)
    }

    /// Read a whole column in table order, cast to `def`
    ///
    /// Columns the part does not carry yield the column default.
    pub async fn read_column(&self, disk: &dyn Disk, def: &ColumnDef) -> Result<Vec<Value>> {
        let granules: Vec<usize> = (0..self.granules()).collect();
        let values = self.read_column_granules(disk, def, &granules).await?;
        Ok(values.into_values().flatten().collect())
    }

    async fn read_column_granules(
        &self,
        disk: &dyn Disk,
        def: &ColumnDef,
        granules: &[usize],
    ) -> Result<BTreeMap<usize, Vec<Value>>> {
        match self.column(&def.name) {
            Some(stored) => {
                let values = self.read_granules(disk, stored, granules).await?;
                if stored.ty == def.ty {
                    return Ok(values);
                }
                values
                    .into_iter()
                    .map(|(g, vs)| Ok((g, vs.iter().map(|v| v.cast(def.ty)).collect::<Result<Vec<_>>>()?)))
                    .collect()
            }
            None => {
                let default = def.default_value()?;
                let counts = self.granule_row_counts(disk).await?;
                Ok(granules
                    .iter()
                    .map(|&g| {
                        let rows = counts.get(g).copied().unwrap_or(0) as usize;
                        (g, vec![default.clone(); rows])
                    })
                    .collect())
            }
        }
    }

    /// Granules that may contain rows matching `filter`
    async fn candidate_granules(
        &self,
        disk: &dyn Disk,
        schema: &TableSchema,
        filter: &Predicate,
    ) -> Result<Vec<usize>> {
        let granules = self.granules();
        let mut keep = vec![true; granules];

        // Primary index: usable when all preceding key columns are constant
        // across the granule
        if let Some(k) = schema.order_by.iter().position(|c| c == filter.column()) {
            for (g, slot) in keep.iter_mut().enumerate() {
                let (Some(lo), Some(hi)) = (self.primary_index.get(g), self.primary_index.get(g + 1)) else {
                    continue;
                };
                if lo.len() > k && hi.len() > k && lo[..k] == hi[..k] && !filter.may_match_range(&lo[k], &hi[k]) {
                    *slot = false;
                }
            }
        }

        for index in schema.skip_indices.iter().filter(|i| i.column == filter.column()) {
            let (idx, _) = skip_index_files(&index.name);
            if !self.checksums.contains_key(&idx) {
                continue;
            }
            let entries = codec::decode_rows(&disk.read(&join(&self.path, &idx), None).await?)?;
            let span = index.granularity.max(1);
            for (e, entry) in entries.iter().enumerate() {
                let [min, max] = entry.as_slice() else {
                    return Err(Error::corruption(format!("{}/{idx}: malformed entry", self.path)));
                };
                if !filter.may_match_range(min, max) {
                    for slot in keep.iter_mut().skip(e * span).take(span) {
                        *slot = false;
                    }
                }
            }
        }

        Ok(keep
            .iter()
            .enumerate()
            .filter_map(|(g, k)| k.then_some(g))
            .collect())
    }

    /// Rows of `columns` matching `filter`, reading only the granules needed
    pub async fn select(
        &self,
        disk: &dyn Disk,
        schema: &TableSchema,
        columns: &[&ColumnDef],
        filter: Option<&Predicate>,
    ) -> Result<Vec<Vec<Value>>> {
        let Some(filter) = filter else {
            let mut data = Vec::with_capacity(columns.len());
            for def in columns {
                data.push(self.read_column(disk, def).await?);
            }
            return Ok(transpose(data, self.rows as usize));
        };

        let filter_def = schema
            .column(filter.column())
            .ok_or_else(|| Error::ColumnNotFound(filter.column().to_string()))?;
        let candidates = self.candidate_granules(disk, schema, filter).await?;
        let filter_values = self.read_column_granules(disk, filter_def, &candidates).await?;

        let mut selected: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (g, values) in &filter_values {
            let rows: Vec<usize> = values
                .iter()
                .enumerate()
                .filter_map(|(i, v)| filter.matches(v).then_some(i))
                .collect();
            if !rows.is_empty() {
                selected.insert(*g, rows);
            }
        }
        let granules: Vec<usize> = selected.keys().copied().collect();

        let mut data = Vec::with_capacity(columns.len());
        for def in columns {
            let values = if def.name == filter_def.name {
                filter_values.clone()
            } else {
                self.read_column_granules(disk, def, &granules).await?
            };
            let mut column = Vec::new();
            for (g, rows) in &selected {
                let granule = values
                    .get(g)
                    .ok_or_else(|| Error::corruption(format!("{}: granule {g} missing", self.name)))?;
                column.extend(rows.iter().filter_map(|&r| granule.get(r).cloned()));
            }
            data.push(column);
        }
        let rows = selected.values().map(Vec::len).sum();
        Ok(transpose(data, rows))
    }
}

/// Column-major to row-major
fn transpose(columns: Vec<Vec<Value>>, rows: usize) -> Vec<Vec<Value>> {
    let mut out: Vec<Vec<Value>> = (0..rows).map(|_| Vec::with_capacity(columns.len())).collect();
    for column in columns {
        for (row, value) in out.iter_mut().zip(column) {
            row.push(value);
        }
    }
    out
}
