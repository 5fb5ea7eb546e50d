//! Part names and partition ids
//!
//! A part is named `<partition>_<min_block>_<max_block>_<level>` with an
//! optional `_<mutation>` suffix once a mutation has produced it.

use crate::schema::Value;
use std::fmt;
use std::str::FromStr;
use tierstore_common::{Error, Result};
use xxhash_rust::xxh64::xxh64;

/// Partition id of tables without a partition key
pub const ALL_PARTITION: &str = "all";

/// Parsed part name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartInfo {
    pub partition_id: String,
    pub min_block: u64,
    pub max_block: u64,
    pub level: u32,
    pub mutation: u64,
}

impl PartInfo {
    /// Name of a freshly inserted part
    pub fn new_insert(partition_id: impl Into<String>, block: u64) -> Self {
        Self {
            partition_id: partition_id.into(),
            min_block: block,
            max_block: block,
            level: 0,
            mutation: 0,
        }
    }

    /// Name of the part produced by merging `parts`
    ///
    /// `parts` must be non-empty and share one partition.
    pub fn merged(parts: &[&Self]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| Error::invalid_argument("nothing to merge"))?;
        if parts.iter().any(|p| p.partition_id != first.partition_id) {
            return Err(Error::invalid_argument("cannot merge parts of different partitions"));
        }
        Ok(Self {
            partition_id: first.partition_id.clone(),
            min_block: parts.iter().map(|p| p.min_block).min().unwrap_or(0),
            max_block: parts.iter().map(|p| p.max_block).max().unwrap_or(0),
            level: parts.iter().map(|p| p.level).max().unwrap_or(0) + 1,
            mutation: parts.iter().map(|p| p.mutation).max().unwrap_or(0),
        })
    }

    /// Same block range, produced by mutation `version`
    #[must_use]
    pub fn mutated(&self, version: u64) -> Self {
        Self {
            mutation: version,
            ..self.clone()
        }
    }

    /// Whether this part's block range covers `other` and is newer
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self != other
            && self.partition_id == other.partition_id
            && self.min_block <= other.min_block
            && self.max_block >= other.max_block
            && (self.level, self.mutation) >= (other.level, other.mutation)
    }

    /// Highest version number carried by the name
    #[must_use]
    pub fn max_version(&self) -> u64 {
        self.max_block.max(self.mutation)
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.partition_id, self.min_block, self.max_block, self.level
        )?;
        if self.mutation > 0 {
            write!(f, "_{}", self.mutation)?;
        }
        Ok(())
    }
}

impl FromStr for PartInfo {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let invalid = || Error::invalid_argument(format!("invalid part name '{name}'"));
        let fields: Vec<&str> = name.split('_').collect();
        if !(fields.len() == 4 || fields.len() == 5) || fields[0].is_empty() {
            return Err(invalid());
        }
        let number = |s: &str| s.parse::<u64>().map_err(|_| invalid());
        let info = Self {
            partition_id: fields[0].to_string(),
            min_block: number(fields[1])?,
            max_block: number(fields[2])?,
            level: u32::try_from(number(fields[3])?).map_err(|_| invalid())?,
            mutation: fields.get(4).map_or(Ok(0), |m| number(*m))?,
        };
        if info.min_block > info.max_block {
            return Err(invalid());
        }
        Ok(info)
    }
}

/// Partition id for a partition key value
///
/// Dates become `YYYYMMDD` and integers keep their decimal form. Strings are
/// always hashed so that values differing only in punctuation never share a
/// partition.
#[must_use]
pub fn partition_id(value: &Value) -> String {
    match value {
        Value::UInt64(v) => v.to_string(),
        Value::Int64(v) => v.to_string(),
        Value::Date(d) => d.format("%Y%m%d").to_string(),
        Value::String(s) => format!("{:016x}", xxh64(s.as_bytes(), 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_parse_and_format() {
        let info: PartInfo = "20200103_1_6_2".parse().unwrap();
        assert_eq!(info.partition_id, "20200103");
        assert_eq!((info.min_block, info.max_block, info.level, info.mutation), (1, 6, 2, 0));
        assert_eq!(info.to_string(), "20200103_1_6_2");

        let mutated = info.mutated(9);
        assert_eq!(mutated.to_string(), "20200103_1_6_2_9");
        assert_eq!(mutated.to_string().parse::<PartInfo>().unwrap(), mutated);
        assert_eq!(mutated.max_version(), 9);

        assert!("tmp_insert_1".parse::<PartInfo>().is_err());
        assert!("all_3_1_0".parse::<PartInfo>().is_err());
        assert!("format_version.txt".parse::<PartInfo>().is_err());
    }

    #[test]
    fn test_merged_and_contains() {
        let a = PartInfo::new_insert("all", 1);
        let b = PartInfo::new_insert("all", 2);
        let merged = PartInfo::merged(&[&a, &b]).unwrap();
        assert_eq!(merged.to_string(), "all_1_2_1");
        assert!(merged.contains(&a));
        assert!(merged.contains(&b));
        assert!(!a.contains(&merged));
        assert!(!merged.contains(&merged));

        let mutated = merged.mutated(3);
        assert!(mutated.contains(&merged));
        assert!(!merged.contains(&mutated));

        let other = PartInfo::new_insert("x", 1);
        assert!(PartInfo::merged(&[&a, &other]).is_err());
    }

    #[test]
    fn test_partition_id() {
        let date = NaiveDate::from_ymd_opt(2020, 1, 3).unwrap();
        assert_eq!(partition_id(&Value::Date(date)), "20200103");
        assert_eq!(partition_id(&Value::UInt64(7)), "7");
        assert_eq!(partition_id(&Value::Int64(-7)), "-7");
        let hashed = partition_id(&Value::from("a b_c"));
        assert_eq!(hashed.len(), 16);
        assert!(!hashed.contains('_'));
    }

    #[test]
    fn test_string_partition_ids_keep_separators_distinct() {
        let dashed = partition_id(&Value::from("2020-01-03"));
        let plain = partition_id(&Value::from("20200103"));
        let slashed = partition_id(&Value::from("2020/01/03"));
        assert_ne!(dashed, plain);
        assert_ne!(dashed, slashed);
        assert_ne!(plain, slashed);
        assert_ne!(plain, "20200103");
        for id in [&dashed, &plain, &slashed] {
            assert!(PartInfo::new_insert(id.as_str(), 1)
                .to_string()
                .parse::<PartInfo>()
                .is_ok());
        }
    }
}
