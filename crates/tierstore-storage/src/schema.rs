//! Table schema, values and row predicates
//!
//! The part store only needs a handful of scalar types to make storage
//! behaviour observable: unsigned and signed 64-bit integers, dates and
//! strings.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tierstore_common::{Error, Result};

/// Column type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    UInt64,
    Int64,
    Date,
    String,
}

impl ColumnType {
    /// Zero value used when a column has no explicit default
    #[must_use]
    pub fn zero(self) -> Value {
        match self {
            Self::UInt64 => Value::UInt64(0),
            Self::Int64 => Value::Int64(0),
            Self::Date => Value::Date(NaiveDate::default()),
            Self::String => Value::String(String::new()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UInt64 => write!(f, "UInt64"),
            Self::Int64 => write!(f, "Int64"),
            Self::Date => write!(f, "Date"),
            Self::String => write!(f, "String"),
        }
    }
}

/// A single cell value
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    UInt64(u64),
    Int64(i64),
    Date(NaiveDate),
    String(String),
}

impl Value {
    #[must_use]
    pub const fn column_type(&self) -> ColumnType {
        match self {
            Self::UInt64(_) => ColumnType::UInt64,
            Self::Int64(_) => ColumnType::Int64,
            Self::Date(_) => ColumnType::Date,
            Self::String(_) => ColumnType::String,
        }
    }

    /// Numeric value for aggregation; dates and strings have none
    #[must_use]
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Self::UInt64(v) => Some(i128::from(*v)),
            Self::Int64(v) => Some(i128::from(*v)),
            Self::Date(_) | Self::String(_) => None,
        }
    }

    /// Convert to another column type (`MODIFY COLUMN`)
    pub fn cast(&self, ty: ColumnType) -> Result<Self> {
        let fail = || Error::invalid_argument(format!("cannot convert {self} to {ty}"));
        Ok(match (self, ty) {
            (v, t) if v.column_type() == t => v.clone(),
            (Self::UInt64(v), ColumnType::Int64) => {
                Self::Int64(i64::try_from(*v).map_err(|_| fail())?)
            }
            (Self::Int64(v), ColumnType::UInt64) => {
                Self::UInt64(u64::try_from(*v).map_err(|_| fail())?)
            }
            (Self::String(s), ColumnType::UInt64) => {
                Self::UInt64(s.trim().parse().map_err(|_| fail())?)
            }
            (Self::String(s), ColumnType::Int64) => {
                Self::Int64(s.trim().parse().map_err(|_| fail())?)
            }
            (Self::String(s), ColumnType::Date) => {
                Self::Date(NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| fail())?)
            }
            (v, ColumnType::String) => Self::String(v.to_string()),
            _ => return Err(fail()),
        })
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::UInt64(a), Self::UInt64(b)) => a.cmp(b),
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            // Mixed numeric comparisons go through i128
            (a, b) => match (a.as_i128(), b.as_i128()) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                // Only a Date and a String reach here; dates sort first
                (None, None) if matches!(a, Self::Date(_)) => Ordering::Less,
                (None, None) => Ordering::Greater,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Self::String(v) => write!(f, "{v}"),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt64(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Column definition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default)]
    pub default: Option<Value>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Value of this column for rows written before it existed
    pub fn default_value(&self) -> Result<Value> {
        match &self.default {
            Some(v) => v.cast(self.ty),
            None => Ok(self.ty.zero()),
        }
    }
}

/// Min/max skip index over one column
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipIndexDef {
    pub name: String,
    pub column: String,
    /// Granules summarised by one index entry
    pub granularity: usize,
}

impl SkipIndexDef {
    pub fn minmax(name: impl Into<String>, column: impl Into<String>, granularity: usize) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            granularity: granularity.max(1),
        }
    }
}

/// Table layout: columns, sort key, partition key and skip indices
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    pub order_by: Vec<String>,
    #[serde(default)]
    pub partition_by: Option<String>,
    #[serde(default)]
    pub skip_indices: Vec<SkipIndexDef>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>, order_by: &[&str]) -> Self {
        Self {
            columns,
            order_by: order_by.iter().map(|c| (*c).to_string()).collect(),
            partition_by: None,
            skip_indices: Vec::new(),
        }
    }

    #[must_use]
    pub fn partition_by(mut self, column: &str) -> Self {
        self.partition_by = Some(column.to_string());
        self
    }

    #[must_use]
    pub fn skip_index(mut self, index: SkipIndexDef) -> Self {
        self.skip_indices.push(index);
        self
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Whether the column takes part in the sort key, partition key or an index
    #[must_use]
    pub fn is_key_column(&self, name: &str) -> bool {
        self.order_by.iter().any(|c| c == name)
            || self.partition_by.as_deref() == Some(name)
            || self.skip_indices.iter().any(|i| i.column == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(Error::invalid_argument("table must have at least one column"));
        }
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(Error::invalid_argument(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
            if !is_identifier(&column.name) {
                return Err(Error::invalid_argument(format!(
                    "invalid column name '{}'",
                    column.name
                )));
            }
            column.default_value()?;
        }
        for key in self.order_by.iter().chain(self.partition_by.iter()) {
            if self.column(key).is_none() {
                return Err(Error::ColumnNotFound(key.clone()));
            }
        }
        for index in &self.skip_indices {
            if self.column(&index.column).is_none() {
                return Err(Error::ColumnNotFound(index.column.clone()));
            }
            if !is_identifier(&index.name) {
                return Err(Error::invalid_argument(format!(
                    "invalid index name '{}'",
                    index.name
                )));
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Rows to insert, with the column names they carry
///
/// Columns of the table that the block does not carry take their default.
#[derive(Clone, Debug, Default)]
pub struct Block {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Block {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Single-column row filter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    Equals { column: String, value: Value },
    GreaterThan { column: String, value: Value },
    /// Inclusive on both ends
    Between { column: String, low: Value, high: Value },
}

impl Predicate {
    pub fn equals(column: &str, value: impl Into<Value>) -> Self {
        Self::Equals {
            column: column.to_string(),
            value: value.into(),
        }
    }

    pub fn greater_than(column: &str, value: impl Into<Value>) -> Self {
        Self::GreaterThan {
            column: column.to_string(),
            value: value.into(),
        }
    }

    pub fn between(column: &str, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Self::Between {
            column: column.to_string(),
            low: low.into(),
            high: high.into(),
        }
    }

    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::Equals { column, .. }
            | Self::GreaterThan { column, .. }
            | Self::Between { column, .. } => column,
        }
    }

    #[must_use]
    pub fn matches(&self, v: &Value) -> bool {
        match self {
            Self::Equals { value, .. } => v == value,
            Self::GreaterThan { value, .. } => v > value,
            Self::Between { low, high, .. } => v >= low && v <= high,
        }
    }

    /// Whether any value within `[min, max]` can match
    #[must_use]
    pub fn may_match_range(&self, min: &Value, max: &Value) -> bool {
        match self {
            Self::Equals { value, .. } => min <= value && value <= max,
            Self::GreaterThan { value, .. } => max > value,
            Self::Between { low, high, .. } => max >= low && min <= high,
        }
    }

    /// Same predicate with its constants converted to `ty`
    pub fn cast(&self, ty: ColumnType) -> Result<Self> {
        Ok(match self {
            Self::Equals { column, value } => Self::Equals {
                column: column.clone(),
                value: value.cast(ty)?,
            },
            Self::GreaterThan { column, value } => Self::GreaterThan {
                column: column.clone(),
                value: value.cast(ty)?,
            },
            Self::Between { column, low, high } => Self::Between {
                column: column.clone(),
                low: low.cast(ty)?,
                high: high.cast(ty)?,
            },
        })
    }
}

/// Projection plus optional filter
#[derive(Clone, Debug, Default)]
pub struct Query {
    pub columns: Vec<String>,
    pub filter: Option<Predicate>,
}

impl Query {
    pub fn select(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            filter: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(predicate);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast() {
        assert_eq!(
            Value::UInt64(1).cast(ColumnType::String).unwrap(),
            Value::String("1".into())
        );
        assert_eq!(
            Value::from("42").cast(ColumnType::Int64).unwrap(),
            Value::Int64(42)
        );
        assert!(Value::Int64(-1).cast(ColumnType::UInt64).is_err());
        assert!(Value::from("x").cast(ColumnType::UInt64).is_err());

        let date = Value::from(" 2020-01-03").cast(ColumnType::Date).unwrap();
        assert_eq!(
            date,
            Value::Date(NaiveDate::from_ymd_opt(2020, 1, 3).unwrap())
        );
        assert_eq!(date.cast(ColumnType::String).unwrap(), Value::from("2020-01-03"));
        assert!(Value::from("20200103").cast(ColumnType::Date).is_err());
        assert!(date < Value::Date(NaiveDate::from_ymd_opt(2020, 1, 4).unwrap()));
    }

    #[test]
    fn test_predicate_ranges() {
        let p = Predicate::between("id", 10i64, 20i64);
        assert!(p.matches(&Value::Int64(10)));
        assert!(!p.matches(&Value::Int64(21)));
        assert!(p.may_match_range(&Value::Int64(0), &Value::Int64(10)));
        assert!(!p.may_match_range(&Value::Int64(21), &Value::Int64(30)));

        let gt = Predicate::greater_than("id", 0i64);
        assert!(!gt.may_match_range(&Value::Int64(-10), &Value::Int64(0)));
        assert!(gt.may_match_range(&Value::Int64(-10), &Value::Int64(1)));
    }

    #[test]
    fn test_schema_validation() {
        let schema = TableSchema::new(
            vec![
                ColumnDef::new("dt", ColumnType::Date),
                ColumnDef::new("id", ColumnType::Int64),
            ],
            &["dt", "id"],
        )
        .partition_by("dt")
        .skip_index(SkipIndexDef::minmax("min_max", "id", 3));
        assert!(schema.validate().is_ok());
        assert!(schema.is_key_column("id"));

        let bad = TableSchema::new(vec![ColumnDef::new("id", ColumnType::Int64)], &["missing"]);
        assert!(matches!(bad.validate(), Err(Error::ColumnNotFound(_))));

        let bad = TableSchema::new(
            vec![ColumnDef::new("x", ColumnType::UInt64).with_default(Value::from("nope"))],
            &["x"],
        );
        assert!(bad.validate().is_err());
    }
}
