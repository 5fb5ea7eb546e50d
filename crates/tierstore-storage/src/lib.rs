//! tierstore storage engine
//!
//! This crate stores MergeTree-style tables on tiered disks:
//! - Local and object-store disks behind one `Disk` trait, with hard links
//!   and reference-counted objects
//! - A segment cache for remote reads with pinned index and mark files
//! - Immutable parts with inserts, merges, mutations and partition moves
//! - Snapshots, a catalog of tables and a background reclaimer

pub mod cache;
pub mod catalog;
pub mod context;
pub mod disk;
pub mod engine;
pub mod part;
pub mod policy;
pub mod reclaimer;
pub mod schema;
pub mod snapshot;
pub mod table;

// Re-exports
pub use cache::{CacheDescription, CacheStats, FileCache, FixedFreeSpace, FreeSpaceSource};
pub use catalog::Catalog;
pub use disk::{Disk, DiskRegistry, DiskUsage, LocalDisk, ObjectDisk};
pub use engine::{DiskInfo, Storage};
pub use part::{Part, PartFormat, PartInfo, PartState};
pub use policy::StoragePolicy;
pub use reclaimer::ReclaimStats;
pub use schema::{Block, ColumnDef, ColumnType, Predicate, Query, SkipIndexDef, TableSchema, Value};
pub use snapshot::{FreezeResult, FrozenPart};
pub use table::{MutationCommand, MutationRecord, Table, TableMetadata, TableSettings};
