//! Local byte-range cache for object-store disks
//!
//! Remote objects are cached in aligned segments of `segment_size` bytes, so
//! a read only ever fetches the segments it touches. Segments live as files
//! under `<root>/<hash[0..3]>/<hash>/<offset>[_persistent]`, where the hash
//! is derived from disk name and object key, and are recorded in a redb index
//! so the cache survives restarts.
//!
//! Admission requires room on the cache filesystem (free space must stay
//! above `free_space_margin`) and room under `max_size`; otherwise the
//! segment is served without being cached. Segments of index and mark files
//! can be pinned, in which case they are never evicted.

pub mod index;

pub use index::{CacheIndex, EntryClass, SegmentRecord};

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tierstore_common::config::CacheConfig;
use tierstore_common::{ByteRange, FileClass, Result};
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;

const INDEX_FILE: &str = "cache_index.redb";
const PERSISTENT_SUFFIX: &str = "_persistent";

/// Source of free-space figures for admission control
pub trait FreeSpaceSource: Send + Sync {
    fn free_space(&self, path: &Path) -> Result<u64>;
}

/// Asks the filesystem via statvfs
#[derive(Debug, Default)]
pub struct StatvfsFreeSpace;

impl FreeSpaceSource for StatvfsFreeSpace {
    fn free_space(&self, path: &Path) -> Result<u64> {
        crate::disk::local::filesystem_space(path).map(|(free, _)| free)
    }
}

/// Reports a fixed, adjustable amount of free space
#[derive(Debug)]
pub struct FixedFreeSpace(AtomicU64);

impl FixedFreeSpace {
    pub fn new(free: u64) -> Self {
        Self(AtomicU64::new(free))
    }

    pub fn set(&self, free: u64) {
        self.0.store(free, Ordering::Relaxed);
    }
}

impl FreeSpaceSource for FixedFreeSpace {
    fn free_space(&self, _path: &Path) -> Result<u64> {
        Ok(self.0.load(Ordering::Relaxed))
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    /// Admissions refused for lack of space or capacity
    pub skipped_inserts: AtomicU64,
    /// Segment files that vanished underneath the index
    pub missing_files: AtomicU64,
    /// Segment files or index records that could not be removed
    pub failed_removals: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Snapshot returned by [`FileCache::describe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDescription {
    pub name: String,
    pub path: PathBuf,
    pub max_size: u64,
    pub current_size: u64,
    pub pinned_size: u64,
    pub entries: usize,
    pub segment_size: u64,
    pub pin_index_and_mark_files: bool,
}

struct Segment {
    size: u64,
    class: EntryClass,
    file: PathBuf,
    last_access: AtomicU64,
}

/// Segments of one remote object
#[derive(Default)]
struct CachedObject {
    segments: HashMap<u64, Segment>,
}

type ObjectKey = (String, String);

/// Disk-backed LRU cache of object segments
pub struct FileCache {
    name: String,
    root: PathBuf,
    segment_size: u64,
    max_size: AtomicU64,
    free_space_margin: AtomicU64,
    pin_index_and_mark_files: AtomicBool,
    objects: RwLock<HashMap<ObjectKey, CachedObject>>,
    size: AtomicU64,
    pinned_size: AtomicU64,
    clock: AtomicU64,
    index: CacheIndex,
    space: Arc<dyn FreeSpaceSource>,
    stats: CacheStats,
}

impl FileCache {
    /// Open the cache at `config.path`, reloading its index
    pub fn open(config: &CacheConfig) -> Result<Self> {
        Self::open_with_free_space(config, Arc::new(StatvfsFreeSpace))
    }

    pub fn open_with_free_space(config: &CacheConfig, space: Arc<dyn FreeSpaceSource>) -> Result<Self> {
        std::fs::create_dir_all(&config.path)?;
        let index = CacheIndex::open(config.path.join(INDEX_FILE))?;
        let cache = Self {
            name: config.name.clone(),
            root: config.path.clone(),
            segment_size: config.segment_size.max(1),
            max_size: AtomicU64::new(config.max_size),
            free_space_margin: AtomicU64::new(config.free_space_margin),
            pin_index_and_mark_files: AtomicBool::new(config.pin_index_and_mark_files),
            objects: RwLock::new(HashMap::new()),
            size: AtomicU64::new(0),
            pinned_size: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            index,
            space,
            stats: CacheStats::default(),
        };
        cache.restore()?;
        Ok(cache)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Apply the hot-reloadable settings of a new definition
    pub fn reload(&self, config: &CacheConfig) {
        self.max_size.store(config.max_size, Ordering::Relaxed);
        self.free_space_margin
            .store(config.free_space_margin, Ordering::Relaxed);
        self.pin_index_and_mark_files
            .store(config.pin_index_and_mark_files, Ordering::Relaxed);
    }

    /// Advance the logical clock and return the new value
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn object_dir(&self, disk: &str, key: &str) -> PathBuf {
        let hash = format!("{:016x}", xxh64(format!("{disk}/{key}").as_bytes(), 0));
        self.root.join(&hash[..3]).join(hash)
    }

    fn segment_file(&self, disk: &str, key: &str, offset: u64, class: EntryClass) -> PathBuf {
        let name = match class {
            EntryClass::Pinned => format!("{offset}{PERSISTENT_SUFFIX}"),
            EntryClass::Evictable => offset.to_string(),
        };
        self.object_dir(disk, key).join(name)
    }

    /// Rebuild the in-memory map from the index, dropping records whose
    /// file is gone
    fn restore(&self) -> Result<()> {
        let records = self.index.load()?;
        let mut stale = Vec::new();
        let mut objects = self.objects.write();
        for record in records {
            let file = self.segment_file(&record.disk, &record.key, record.offset, record.class);
            if !file.exists() {
                warn!(
                    "Cache '{}': segment file {} is missing, dropping entry",
                    self.name,
                    file.display()
                );
                self.stats.missing_files.fetch_add(1, Ordering::Relaxed);
                stale.push(SegmentRecord::index_key(&record.disk, &record.key, record.offset));
                continue;
            }
            self.size.fetch_add(record.size, Ordering::Relaxed);
            if record.class == EntryClass::Pinned {
                self.pinned_size.fetch_add(record.size, Ordering::Relaxed);
            }
            objects
                .entry((record.disk, record.key))
                .or_default()
                .segments
                .insert(
                    record.offset,
                    Segment {
                        size: record.size,
                        class: record.class,
                        file,
                        last_access: AtomicU64::new(self.tick()),
                    },
                );
        }
        let entries: usize = objects.values().map(|o| o.segments.len()).sum();
        drop(objects);
        self.index.remove_many(&stale)?;
        info!(
            "Cache '{}' loaded {} segments ({} bytes) from {}",
            self.name,
            entries,
            self.size.load(Ordering::Relaxed),
            self.root.display()
        );
        Ok(())
    }

    /// Read `range` of a remote object through the cache
    ///
    /// `fetch` is called with segment-aligned ranges for every segment that
    /// is not resident.
    pub async fn read<F, Fut>(
        &self,
        disk: &str,
        key: &str,
        object_size: u64,
        range: ByteRange,
        class: FileClass,
        fetch: F,
    ) -> Result<Bytes>
    where
        F: Fn(ByteRange) -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let range = range.clamp_to(object_size);
        if range.is_empty() {
            return Ok(Bytes::new());
        }

        let first = range.offset / self.segment_size;
        let last = (range.end() - 1) / self.segment_size;
        let mut out = BytesMut::with_capacity(range.len as usize);
        for index in first..=last {
            let seg_offset = index * self.segment_size;
            let seg_len = self.segment_size.min(object_size - seg_offset);

            let data = match self.lookup(disk, key, seg_offset).await {
                Some(data) => data,
                None => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    let data = fetch(ByteRange::new(seg_offset, seg_len)).await?;
                    self.admit(disk, key, seg_offset, &data, class).await;
                    data
                }
            };

            let start = range.offset.max(seg_offset) - seg_offset;
            let end = (range.end().min(seg_offset + seg_len) - seg_offset).min(data.len() as u64);
            if start < end {
                out.extend_from_slice(&data[start as usize..end as usize]);
            }
        }
        Ok(out.freeze())
    }

    /// Serve a resident segment; a vanished file counts as a miss
    async fn lookup(&self, disk: &str, key: &str, offset: u64) -> Option<Bytes> {
        let file = {
            let objects = self.objects.read();
            let segment = objects
                .get(&(disk.to_string(), key.to_string()))?
                .segments
                .get(&offset)?;
            segment.last_access.store(self.tick(), Ordering::Relaxed);
            segment.file.clone()
        };

        match tokio::fs::read(&file).await {
            Ok(data) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(Bytes::from(data))
            }
            Err(e) => {
                debug!(
                    "Cache '{}': segment {} unreadable ({}), treating as miss",
                    self.name,
                    file.display(),
                    e
                );
                self.forget(disk, key, offset);
                None
            }
        }
    }

    fn forget(&self, disk: &str, key: &str, offset: u64) {
        let removed = {
            let mut objects = self.objects.write();
            let object_key = (disk.to_string(), key.to_string());
            let removed = objects
                .get_mut(&object_key)
                .and_then(|o| o.segments.remove(&offset));
            if objects.get(&object_key).is_some_and(|o| o.segments.is_empty()) {
                objects.remove(&object_key);
            }
            removed
        };
        if let Some(segment) = removed {
            self.account_removed(&segment);
            self.stats.missing_files.fetch_add(1, Ordering::Relaxed);
            let record_key = SegmentRecord::index_key(disk, key, offset);
            if let Err(e) = self.index.remove_many(std::slice::from_ref(&record_key)) {
                warn!("Cache '{}': failed to drop index record {}: {}", self.name, record_key, e);
                self.stats.failed_removals.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn account_removed(&self, segment: &Segment) {
        self.size.fetch_sub(segment.size, Ordering::Relaxed);
        if segment.class == EntryClass::Pinned {
            self.pinned_size.fetch_sub(segment.size, Ordering::Relaxed);
        }
    }

    fn contains(&self, disk: &str, key: &str, offset: u64) -> bool {
        self.objects
            .read()
            .get(&(disk.to_string(), key.to_string()))
            .is_some_and(|o| o.segments.contains_key(&offset))
    }

    /// Try to keep a fetched segment; failures only cost future hits
    async fn admit(&self, disk: &str, key: &str, offset: u64, data: &Bytes, class: FileClass) {
        if self.contains(disk, key, offset) {
            return;
        }
        let size = data.len() as u64;
        let entry_class = if class == FileClass::IndexOrMark
            && self.pin_index_and_mark_files.load(Ordering::Relaxed)
        {
            EntryClass::Pinned
        } else {
            EntryClass::Evictable
        };

        let margin = self.free_space_margin.load(Ordering::Relaxed);
        match self.space.free_space(&self.root) {
            Ok(free) if free >= size + margin => {}
            Ok(free) => {
                warn!(
                    "Insert into cache is skipped due to insufficient disk space: cache '{}', segment of {} bytes, {} bytes free, margin {}",
                    self.name, size, free, margin
                );
                self.stats.skipped_inserts.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                warn!("Cache '{}': cannot read free space: {}", self.name, e);
                self.stats.skipped_inserts.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let file = self.segment_file(disk, key, offset, entry_class);
        if let Err(e) = write_segment(&file, data).await {
            warn!(
                "Cache '{}': failed to write segment {}: {}",
                self.name,
                file.display(),
                e
            );
            self.stats.skipped_inserts.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let (inserted, evicted) = self.insert_entry(disk, key, offset, size, entry_class, &file);
        for (record_key, segment) in &evicted {
            debug!("Cache '{}': evicting {}", self.name, record_key);
            self.remove_segment_file(&segment.file).await;
        }
        let evicted_keys: Vec<String> = evicted.into_iter().map(|(k, _)| k).collect();
        if let Err(e) = self.index.remove_many(&evicted_keys) {
            warn!("Cache '{}': failed to update index: {}", self.name, e);
            self.stats.failed_removals.fetch_add(1, Ordering::Relaxed);
        }

        if !inserted {
            self.remove_segment_file(&file).await;
            return;
        }
        let record = SegmentRecord {
            disk: disk.to_string(),
            key: key.to_string(),
            offset,
            size,
            class: entry_class,
        };
        if let Err(e) = self.index.put(&record) {
            warn!("Cache '{}': failed to persist segment record: {}", self.name, e);
        }
    }

    /// Delete a segment file that is no longer indexed; already gone is fine
    async fn remove_segment_file(&self, file: &Path) {
        match tokio::fs::remove_file(file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    "Cache '{}': failed to remove segment {}: {}",
                    self.name,
                    file.display(),
                    e
                );
                self.stats.failed_removals.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Evict LRU evictable segments until `size` fits, then insert.
    /// Returns whether the entry went in, and the evicted segments.
    fn insert_entry(
        &self,
        disk: &str,
        key: &str,
        offset: u64,
        size: u64,
        class: EntryClass,
        file: &Path,
    ) -> (bool, Vec<(String, Segment)>) {
        let max_size = self.max_size.load(Ordering::Relaxed);
        let mut objects = self.objects.write();
        let mut evicted = Vec::new();
        let object_key = (disk.to_string(), key.to_string());
        if objects
            .get(&object_key)
            .is_some_and(|o| o.segments.contains_key(&offset))
        {
            // Another reader admitted the same segment; the file is identical
            return (false, evicted);
        }

        while self.size.load(Ordering::Relaxed) + size > max_size {
            let Some((victim_key, victim_offset)) = find_lru_evictable(&objects) else {
                break;
            };
            if let Some(object) = objects.get_mut(&victim_key) {
                if let Some(segment) = object.segments.remove(&victim_offset) {
                    self.account_removed(&segment);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    evicted.push((
                        SegmentRecord::index_key(&victim_key.0, &victim_key.1, victim_offset),
                        segment,
                    ));
                }
                if object.segments.is_empty() {
                    objects.remove(&victim_key);
                }
            }
        }

        if self.size.load(Ordering::Relaxed) + size > max_size {
            debug!(
                "Cache '{}': segment of {} bytes does not fit under max_size {}",
                self.name, size, max_size
            );
            self.stats.skipped_inserts.fetch_add(1, Ordering::Relaxed);
            return (false, evicted);
        }

        self.size.fetch_add(size, Ordering::Relaxed);
        if class == EntryClass::Pinned {
            self.pinned_size.fetch_add(size, Ordering::Relaxed);
        }
        objects.entry(object_key).or_default().segments.insert(
            offset,
            Segment {
                size,
                class,
                file: file.to_path_buf(),
                last_access: AtomicU64::new(self.tick()),
            },
        );
        (true, evicted)
    }

    /// Drop every cached segment of a deleted object
    pub fn invalidate_object(&self, disk: &str, key: &str) {
        let Some(object) = self
            .objects
            .write()
            .remove(&(disk.to_string(), key.to_string()))
        else {
            return;
        };
        let mut keys = Vec::with_capacity(object.segments.len());
        for (offset, segment) in &object.segments {
            self.account_removed(segment);
            keys.push(SegmentRecord::index_key(disk, key, *offset));
        }
        if let Err(e) = std::fs::remove_dir_all(self.object_dir(disk, key)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Cache '{}': failed to remove segments of {}: {}", self.name, key, e);
            }
        }
        if let Err(e) = self.index.remove_many(&keys) {
            warn!("Cache '{}': failed to update index: {}", self.name, e);
        }
    }

    /// Remove every entry, pinned or not
    pub fn drop_all(&self) -> Result<()> {
        let mut objects = self.objects.write();
        objects.clear();
        self.size.store(0, Ordering::Relaxed);
        self.pinned_size.store(0, Ordering::Relaxed);
        self.index.clear()?;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_name() == INDEX_FILE {
                continue;
            }
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        info!("Cache '{}' dropped", self.name);
        Ok(())
    }

    pub fn describe(&self) -> CacheDescription {
        CacheDescription {
            name: self.name.clone(),
            path: self.root.clone(),
            max_size: self.max_size.load(Ordering::Relaxed),
            current_size: self.size.load(Ordering::Relaxed),
            pinned_size: self.pinned_size.load(Ordering::Relaxed),
            entries: self.len(),
            segment_size: self.segment_size,
            pin_index_and_mark_files: self.pin_index_and_mark_files.load(Ordering::Relaxed),
        }
    }

    /// Number of cached segments
    pub fn len(&self) -> usize {
        self.objects.read().values().map(|o| o.segments.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// On-disk paths of all cached segments
    pub fn segment_paths(&self) -> Vec<PathBuf> {
        self.objects
            .read()
            .values()
            .flat_map(|o| o.segments.values().map(|s| s.file.clone()))
            .collect()
    }
}

fn find_lru_evictable(objects: &HashMap<ObjectKey, CachedObject>) -> Option<(ObjectKey, u64)> {
    let mut lru: Option<(&ObjectKey, u64, u64)> = None;
    for (object_key, object) in objects {
        for (offset, segment) in &object.segments {
            if segment.class == EntryClass::Pinned {
                continue;
            }
            let access = segment.last_access.load(Ordering::Relaxed);
            match lru {
                Some((_, _, min_access)) if access >= min_access => {}
                _ => lru = Some((object_key, *offset, access)),
            }
        }
    }
    lru.map(|(key, offset, _)| (key.clone(), offset))
}

/// Write to a temporary name, then rename into place
async fn write_segment(file: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = file.with_extension(format!("tmp{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, file).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(dir: &Path, max_size: u64, segment_size: u64) -> CacheConfig {
        let mut config = CacheConfig::new("s3_cache", dir.join("cache"));
        config.max_size = max_size;
        config.segment_size = segment_size;
        config.free_space_margin = 0;
        config
    }

    fn object(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    async fn read_through(
        cache: &FileCache,
        key: &str,
        data: &Bytes,
        range: ByteRange,
        class: FileClass,
        fetches: &AtomicUsize,
    ) -> Bytes {
        cache
            .read("s3", key, data.len() as u64, range, class, |seg: ByteRange| {
                fetches.fetch_add(1, Ordering::SeqCst);
                let data = data.slice(seg.offset as usize..seg.end() as usize);
                async move { Ok::<_, tierstore_common::Error>(data) }
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(&config(dir.path(), 1 << 20, 100)).unwrap();
        let data = object(250);
        let fetches = AtomicUsize::new(0);

        let got = read_through(&cache, "k", &data, ByteRange::new(90, 20), FileClass::Data, &fetches).await;
        assert_eq!(got, data.slice(90..110));
        assert_eq!(fetches.load(Ordering::SeqCst), 2);

        let got = read_through(&cache, "k", &data, ByteRange::new(95, 10), FileClass::Data, &fetches).await;
        assert_eq!(got, data.slice(95..105));
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 2);

        // Tail segment is shorter than segment_size
        let got = read_through(&cache, "k", &data, ByteRange::new(200, 100), FileClass::Data, &fetches).await;
        assert_eq!(got, data.slice(200..250));
        assert_eq!(cache.describe().current_size, 250);
    }

    #[tokio::test]
    async fn test_lru_eviction_spares_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 300, 100);
        cfg.pin_index_and_mark_files = true;
        let cache = FileCache::open(&cfg).unwrap();
        let data = object(100);
        let fetches = AtomicUsize::new(0);

        read_through(&cache, "p/primary.idx", &data, ByteRange::full(100), FileClass::IndexOrMark, &fetches).await;
        read_through(&cache, "a", &data, ByteRange::full(100), FileClass::Data, &fetches).await;
        read_through(&cache, "b", &data, ByteRange::full(100), FileClass::Data, &fetches).await;
        // touch a so that b is the LRU evictable segment
        read_through(&cache, "a", &data, ByteRange::full(100), FileClass::Data, &fetches).await;
        read_through(&cache, "c", &data, ByteRange::full(100), FileClass::Data, &fetches).await;

        assert!(cache.contains("s3", "p/primary.idx", 0));
        assert!(cache.contains("s3", "a", 0));
        assert!(!cache.contains("s3", "b", 0));
        assert!(cache.contains("s3", "c", 0));
        let described = cache.describe();
        assert_eq!(described.current_size, 300);
        assert_eq!(described.pinned_size, 100);
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 1);
        assert!(cache
            .segment_paths()
            .iter()
            .any(|p| p.to_string_lossy().ends_with("0_persistent")));
    }

    #[tokio::test]
    async fn test_eviction_counts_failed_removals() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(&config(dir.path(), 200, 100)).unwrap();
        let data = object(100);
        let fetches = AtomicUsize::new(0);

        read_through(&cache, "a", &data, ByteRange::full(100), FileClass::Data, &fetches).await;
        read_through(&cache, "b", &data, ByteRange::full(100), FileClass::Data, &fetches).await;

        // A non-empty directory where a's segment was cannot be unlinked
        let blocked = cache.segment_file("s3", "a", 0, EntryClass::Evictable);
        std::fs::remove_file(&blocked).unwrap();
        std::fs::create_dir(&blocked).unwrap();
        std::fs::write(blocked.join("keep"), b"x").unwrap();
        // b's segment is already gone, which is not a failure
        std::fs::remove_file(cache.segment_file("s3", "b", 0, EntryClass::Evictable)).unwrap();

        read_through(&cache, "c", &data, ByteRange::full(100), FileClass::Data, &fetches).await;
        read_through(&cache, "d", &data, ByteRange::full(100), FileClass::Data, &fetches).await;

        assert!(!cache.contains("s3", "a", 0));
        assert!(!cache.contains("s3", "b", 0));
        assert!(cache.contains("s3", "d", 0));
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 2);
        assert_eq!(cache.stats().failed_removals.load(Ordering::Relaxed), 1);
        assert!(blocked.is_dir());
    }

    #[tokio::test]
    async fn test_insufficient_space_skips_insert() {
        let dir = tempfile::tempdir().unwrap();
        let space = Arc::new(FixedFreeSpace::new(50));
        let cache = FileCache::open_with_free_space(&config(dir.path(), 1 << 20, 100), space.clone()).unwrap();
        let data = object(100);
        let fetches = AtomicUsize::new(0);

        let got = read_through(&cache, "k", &data, ByteRange::full(100), FileClass::Data, &fetches).await;
        assert_eq!(got, data);
        assert_eq!(cache.stats().skipped_inserts.load(Ordering::Relaxed), 1);
        assert!(cache.is_empty());

        space.set(1 << 20);
        read_through(&cache, "k", &data, ByteRange::full(100), FileClass::Data, &fetches).await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_after_reopen_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), 1 << 20, 100);
        let data = object(200);
        let fetches = AtomicUsize::new(0);
        {
            let cache = FileCache::open(&cfg).unwrap();
            read_through(&cache, "k", &data, ByteRange::full(200), FileClass::Data, &fetches).await;
            assert_eq!(cache.len(), 2);
            let victim = cache.segment_file("s3", "k", 100, EntryClass::Evictable);
            std::fs::remove_file(victim).unwrap();
        }

        let cache = FileCache::open(&cfg).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().missing_files.load(Ordering::Relaxed), 1);
        let got = read_through(&cache, "k", &data, ByteRange::full(200), FileClass::Data, &fetches).await;
        assert_eq!(got, data);
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalidate_and_drop_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 1 << 20, 100);
        cfg.pin_index_and_mark_files = true;
        let cache = FileCache::open(&cfg).unwrap();
        let data = object(100);
        let fetches = AtomicUsize::new(0);

        read_through(&cache, "a", &data, ByteRange::full(100), FileClass::Data, &fetches).await;
        read_through(&cache, "b.mrk2", &data, ByteRange::full(100), FileClass::IndexOrMark, &fetches).await;
        cache.invalidate_object("s3", "a");
        assert_eq!(cache.len(), 1);

        cache.drop_all().unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.describe().pinned_size, 0);
        assert!(dir.path().join("cache").join(INDEX_FILE).exists());
    }
}
