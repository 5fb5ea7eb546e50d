//! Configuration types for tierstore
//!
//! This module defines the configuration tree (disks, caches, storage
//! policies, part retention) and the loader that reads it from a TOML file
//! with `TIERSTORE__` environment overrides.

use crate::error::{Error, Result};
use crate::types::DiskKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for tierstore
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Disks, caches and policies
    #[serde(default)]
    pub storage: StorageConfig,
    /// Part lifecycle settings
    #[serde(default)]
    pub merge_tree: MergeTreeConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file, applying `TIERSTORE__SECTION__KEY`
    /// environment overrides on top
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()))
            .add_source(
                ::config::Environment::with_prefix("TIERSTORE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross references and value ranges
    pub fn validate(&self) -> Result<()> {
        let mut disk_names = HashSet::new();
        for disk in &self.storage.disks {
            if !disk_names.insert(disk.name.as_str()) {
                return Err(Error::configuration(format!(
                    "duplicate disk name '{}'",
                    disk.name
                )));
            }
            disk.validate()?;
            if let Some(cache) = &disk.cache {
                if self.cache(cache).is_none() {
                    return Err(Error::configuration(format!(
                        "disk '{}' references unknown cache '{}'",
                        disk.name, cache
                    )));
                }
            }
        }

        let mut cache_names = HashSet::new();
        for cache in &self.storage.caches {
            if !cache_names.insert(cache.name.as_str()) {
                return Err(Error::configuration(format!(
                    "duplicate cache name '{}'",
                    cache.name
                )));
            }
            if cache.segment_size == 0 {
                return Err(Error::configuration(format!(
                    "cache '{}': segment_size must be positive",
                    cache.name
                )));
            }
        }

        for policy in &self.storage.policies {
            if policy.disks.is_empty() {
                return Err(Error::configuration(format!(
                    "storage policy '{}' has no disks",
                    policy.name
                )));
            }
            for disk in &policy.disks {
                if !disk_names.contains(disk.as_str()) {
                    return Err(Error::configuration(format!(
                        "storage policy '{}' references unknown disk '{}'",
                        policy.name, disk
                    )));
                }
            }
            if !(0.0..=1.0).contains(&policy.move_factor) {
                return Err(Error::configuration(format!(
                    "storage policy '{}': move_factor must be within [0, 1]",
                    policy.name
                )));
            }
        }

        if self.merge_tree.index_granularity == 0 {
            return Err(Error::configuration("index_granularity must be positive"));
        }
        Ok(())
    }

    /// Look up a disk definition by name
    #[must_use]
    pub fn disk(&self, name: &str) -> Option<&DiskConfig> {
        self.storage.disks.iter().find(|d| d.name == name)
    }

    /// Look up a cache definition by name
    #[must_use]
    pub fn cache(&self, name: &str) -> Option<&CacheConfig> {
        self.storage.caches.iter().find(|c| c.name == name)
    }

    /// Look up a storage policy by name
    #[must_use]
    pub fn policy(&self, name: &str) -> Option<&PolicyConfig> {
        self.storage.policies.iter().find(|p| p.name == name)
    }
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local directory holding table metadata records
    #[serde(default = "default_metadata_path")]
    pub metadata_path: PathBuf,
    /// Disk definitions
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
    /// Local byte-range caches
    #[serde(default)]
    pub caches: Vec<CacheConfig>,
    /// Named storage policies
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            metadata_path: default_metadata_path(),
            disks: Vec::new(),
            caches: Vec::new(),
            policies: Vec::new(),
        }
    }
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("/var/lib/tierstore")
}

/// Configuration for a single disk
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Disk name, referenced by policies
    pub name: String,
    /// Backend kind
    pub kind: DiskKind,
    /// Root directory (local disks)
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Capacity override in bytes (local disks; defaults to the filesystem size)
    #[serde(default)]
    pub capacity: Option<u64>,
    /// Object store endpoint, e.g. `file:///srv/bucket` or `memory://name`
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Prefix under which all objects of this disk are written
    #[serde(default = "default_root_prefix")]
    pub root_prefix: String,
    /// Local directory for per-file object metadata (object store disks)
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,
    /// Files of at least this many bytes use multipart upload (hot-reloadable)
    #[serde(default = "default_upload_threshold")]
    pub upload_threshold: u64,
    /// Size of each uploaded part in multipart mode (hot-reloadable)
    #[serde(default = "default_multipart_part_size")]
    pub multipart_part_size: u64,
    /// Name of the cache fronting reads of this disk
    #[serde(default)]
    pub cache: Option<String>,
    /// Accept deletes without removing remote objects (hot-reloadable)
    #[serde(default)]
    pub no_delete: bool,
    /// Retry policy for remote requests (hot-reloadable)
    #[serde(default)]
    pub retry: RetryConfig,
}

impl DiskConfig {
    /// Local disk rooted at `path`
    pub fn local(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: DiskKind::Local,
            path: Some(path.into()),
            capacity: None,
            endpoint: None,
            root_prefix: default_root_prefix(),
            metadata_path: None,
            upload_threshold: default_upload_threshold(),
            multipart_part_size: default_multipart_part_size(),
            cache: None,
            no_delete: false,
            retry: RetryConfig::default(),
        }
    }

    /// Object store disk with its metadata kept under `metadata_path`
    pub fn object_store(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        metadata_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: DiskKind::ObjectStore,
            path: None,
            endpoint: Some(endpoint.into()),
            metadata_path: Some(metadata_path.into()),
            ..Self::local(name, PathBuf::new())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::configuration("disk name must not be empty"));
        }
        match self.kind {
            DiskKind::Local => {
                if self.path.as_ref().is_none_or(|p| p.as_os_str().is_empty()) {
                    return Err(Error::configuration(format!(
                        "local disk '{}' requires a path",
                        self.name
                    )));
                }
            }
            DiskKind::ObjectStore => {
                if self.endpoint.is_none() {
                    return Err(Error::configuration(format!(
                        "object store disk '{}' requires an endpoint",
                        self.name
                    )));
                }
                if self.metadata_path.is_none() {
                    return Err(Error::configuration(format!(
                        "object store disk '{}' requires a metadata_path",
                        self.name
                    )));
                }
                if self.multipart_part_size == 0 {
                    return Err(Error::configuration(format!(
                        "disk '{}': multipart_part_size must be positive",
                        self.name
                    )));
                }
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::configuration(format!(
                "disk '{}': retry.max_attempts must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_root_prefix() -> String {
    "data".to_string()
}

fn default_upload_threshold() -> u64 {
    32 * 1024 * 1024 // 32 MB
}

fn default_multipart_part_size() -> u64 {
    16 * 1024 * 1024 // 16 MB
}

/// Retry policy for remote requests
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Backoff before the first retry (milliseconds)
    pub initial_backoff_ms: u64,
    /// Upper bound for a single backoff (milliseconds)
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 50,
            max_backoff_ms: 2000,
        }
    }
}

/// Local byte-range cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache name, referenced by disks
    pub name: String,
    /// Directory holding cached segments and the index
    pub path: PathBuf,
    /// Maximum resident bytes
    #[serde(default = "default_cache_max_size")]
    pub max_size: u64,
    /// Free space that must remain on the cache filesystem after an insert
    #[serde(default = "default_free_space_margin")]
    pub free_space_margin: u64,
    /// Granularity of cached byte ranges
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,
    /// Never evict index and mark files (hot-reloadable)
    #[serde(default)]
    pub pin_index_and_mark_files: bool,
}

impl CacheConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            max_size: default_cache_max_size(),
            free_space_margin: default_free_space_margin(),
            segment_size: default_segment_size(),
            pin_index_and_mark_files: false,
        }
    }
}

fn default_cache_max_size() -> u64 {
    1024 * 1024 * 1024 // 1 GB
}

fn default_free_space_margin() -> u64 {
    1024 * 1024 // 1 MB
}

fn default_segment_size() -> u64 {
    1024 * 1024 // 1 MB
}

/// Named storage policy: ordered disks for new parts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    pub disks: Vec<String>,
    /// Fraction of free space under which parts should move to the next disk
    #[serde(default = "default_move_factor")]
    pub move_factor: f64,
}

impl PolicyConfig {
    pub fn new(name: impl Into<String>, disks: &[&str]) -> Self {
        Self {
            name: name.into(),
            disks: disks.iter().map(|d| (*d).to_string()).collect(),
            move_factor: default_move_factor(),
        }
    }
}

fn default_move_factor() -> f64 {
    0.1
}

/// Part lifecycle configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeTreeConfig {
    /// Minimum delay between a part becoming outdated and its deletion (hot-reloadable)
    #[serde(default = "default_old_parts_lifetime_secs")]
    pub old_parts_lifetime_secs: u64,
    /// Background reclaimer period
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Minimum age before an orphaned store directory is removed
    #[serde(default = "default_orphan_dir_min_age_secs")]
    pub orphan_dir_min_age_secs: u64,
    /// Parts with fewer rows are written in compact format
    #[serde(default)]
    pub min_rows_for_wide_part: u64,
    /// Rows per granule (one mark per granule)
    #[serde(default = "default_index_granularity")]
    pub index_granularity: usize,
}

impl MergeTreeConfig {
    #[must_use]
    pub fn old_parts_lifetime(&self) -> Duration {
        Duration::from_secs(self.old_parts_lifetime_secs)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    #[must_use]
    pub fn orphan_dir_min_age(&self) -> Duration {
        Duration::from_secs(self.orphan_dir_min_age_secs)
    }
}

impl Default for MergeTreeConfig {
    fn default() -> Self {
        Self {
            old_parts_lifetime_secs: default_old_parts_lifetime_secs(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            orphan_dir_min_age_secs: default_orphan_dir_min_age_secs(),
            min_rows_for_wide_part: 0,
            index_granularity: default_index_granularity(),
        }
    }
}

fn default_old_parts_lifetime_secs() -> u64 {
    8 * 60
}

fn default_cleanup_interval_ms() -> u64 {
    1000
}

fn default_orphan_dir_min_age_secs() -> u64 {
    60 * 60
}

fn default_index_granularity() -> usize {
    8192
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> Config {
        let mut config = Config::default();
        config.storage.caches.push(CacheConfig::new("s3_cache", "/tmp/cache"));
        let mut s3 = DiskConfig::object_store("s3", "memory://bucket", "/tmp/meta/s3");
        s3.cache = Some("s3_cache".into());
        config.storage.disks.push(s3);
        config.storage.disks.push(DiskConfig::local("hdd", "/tmp/hdd"));
        config
            .storage
            .policies
            .push(PolicyConfig::new("s3", &["s3", "hdd"]));
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.merge_tree.old_parts_lifetime_secs, 480);
        assert_eq!(config.merge_tree.index_granularity, 8192);
        assert!(config.storage.disks.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_references() {
        let config = sample();
        assert!(config.validate().is_ok());
        assert_eq!(config.disk("s3").unwrap().upload_threshold, 33_554_432);

        let mut bad = sample();
        bad.storage.policies.push(PolicyConfig::new("broken", &["nvme"]));
        assert!(matches!(bad.validate(), Err(Error::Configuration(_))));

        let mut bad = sample();
        bad.storage.disks[0].cache = Some("missing".into());
        assert!(bad.validate().is_err());

        let mut bad = sample();
        bad.storage.disks[1].path = None;
        assert!(bad.validate().is_err());

        let mut bad = sample();
        bad.storage.disks.push(DiskConfig::local("hdd", "/tmp/other"));
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tierstore.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[storage]
metadata_path = "/srv/tierstore"

[[storage.disks]]
name = "s3"
kind = "object_store"
endpoint = "file:///srv/bucket"
metadata_path = "/srv/tierstore/disks/s3"
upload_threshold = 0

[[storage.policies]]
name = "s3"
disks = ["s3"]

[merge_tree]
old_parts_lifetime_secs = 0
"#
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let disk = config.disk("s3").unwrap();
        assert_eq!(disk.kind, DiskKind::ObjectStore);
        assert_eq!(disk.upload_threshold, 0);
        assert_eq!(disk.root_prefix, "data");
        assert_eq!(config.merge_tree.old_parts_lifetime(), Duration::ZERO);
        assert_eq!(config.policy("s3").unwrap().disks, vec!["s3".to_string()]);
    }
}
