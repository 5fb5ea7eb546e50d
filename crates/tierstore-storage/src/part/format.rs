//! Part directory layout
//!
//! Wide parts keep one `.bin`/`.mrk2` pair per column; compact parts share a
//! single `data.bin`/`data.mrk3` pair. Both carry the same structural files,
//! one `.idx`/`.mrk2` pair per skip index and the metadata version marker.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const CHECKSUMS_FILE: &str = "checksums.txt";
pub const COLUMNS_FILE: &str = "columns.txt";
pub const COUNT_FILE: &str = "count.txt";
pub const CODEC_FILE: &str = "default_compression_codec.txt";
pub const PRIMARY_INDEX_FILE: &str = "primary.idx";
pub const PARTITION_FILE: &str = "partition.dat";
pub const METADATA_VERSION_FILE: &str = "metadata_version.txt";

/// Table-level marker written once per disk into the store directory
pub const FORMAT_VERSION_FILE: &str = "format_version.txt";

pub const COMPACT_DATA_FILE: &str = "data.bin";
pub const COMPACT_MARKS_FILE: &str = "data.mrk3";

pub const DEFAULT_CODEC: &str = "CODEC(NONE)";

/// Files present in every part regardless of schema
pub const STRUCTURAL_FILES: [&str; 6] = [
    CHECKSUMS_FILE,
    COLUMNS_FILE,
    COUNT_FILE,
    CODEC_FILE,
    PRIMARY_INDEX_FILE,
    PARTITION_FILE,
];

/// Data + mark file of one column
pub const FILES_PER_COLUMN: usize = 2;

/// Storage format of a part
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartFormat {
    Wide,
    Compact,
}

impl PartFormat {
    /// Choose the format for a part with `rows` rows
    #[must_use]
    pub const fn for_rows(rows: u64, min_rows_for_wide_part: u64) -> Self {
        if rows < min_rows_for_wide_part {
            Self::Compact
        } else {
            Self::Wide
        }
    }

    /// Data and mark file names holding `column`
    #[must_use]
    pub fn column_files(self, column: &str) -> (String, String) {
        match self {
            Self::Wide => (format!("{column}.bin"), format!("{column}.mrk2")),
            Self::Compact => (COMPACT_DATA_FILE.to_string(), COMPACT_MARKS_FILE.to_string()),
        }
    }

    /// Number of files in a part of this format
    #[must_use]
    pub const fn file_count(self, columns: usize, skip_indices: usize) -> usize {
        let data = match self {
            Self::Wide => FILES_PER_COLUMN * columns,
            Self::Compact => FILES_PER_COLUMN,
        };
        data + 2 * skip_indices + STRUCTURAL_FILES.len() + 1
    }
}

impl fmt::Display for PartFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wide => write!(f, "Wide"),
            Self::Compact => write!(f, "Compact"),
        }
    }
}

/// Index and mark file names of a skip index
#[must_use]
pub fn skip_index_files(name: &str) -> (String, String) {
    (format!("skp_idx_{name}.idx"), format!("skp_idx_{name}.mrk2"))
}
