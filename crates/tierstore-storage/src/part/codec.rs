//! Binary encoding of column data, marks and indices
//!
//! Values are tagged little-endian records. Column data is laid out granule
//! by granule; a mark records where a granule starts in the data file and
//! how many rows it holds, so a reader can fetch single granules with range
//! reads.

use crate::schema::Value;
use bytes::{Buf, BufMut};
use chrono::{Datelike, NaiveDate};
use tierstore_common::{Error, Result};

const TAG_UINT64: u8 = 0;
const TAG_INT64: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_DATE: u8 = 3;

/// Size of one encoded mark
pub const MARK_SIZE: usize = 16;

/// Start of a granule within a data file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mark {
    pub offset: u64,
    pub rows: u64,
}

pub fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::UInt64(v) => {
            out.put_u8(TAG_UINT64);
            out.put_u64_le(*v);
        }
        Value::Int64(v) => {
            out.put_u8(TAG_INT64);
            out.put_i64_le(*v);
        }
        Value::Date(d) => {
            out.put_u8(TAG_DATE);
            out.put_i32_le(d.num_days_from_ce());
        }
        Value::String(s) => {
            out.put_u8(TAG_STRING);
            out.put_u32_le(s.len() as u32);
            out.put_slice(s.as_bytes());
        }
    }
}

fn need(buf: &[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::corruption(format!(
            "truncated data: need {n} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn decode_value(buf: &mut &[u8]) -> Result<Value> {
    need(buf, 1)?;
    match buf.get_u8() {
        TAG_UINT64 => {
            need(buf, 8)?;
            Ok(Value::UInt64(buf.get_u64_le()))
        }
        TAG_INT64 => {
            need(buf, 8)?;
            Ok(Value::Int64(buf.get_i64_le()))
        }
        TAG_DATE => {
            need(buf, 4)?;
            let days = buf.get_i32_le();
            NaiveDate::from_num_days_from_ce_opt(days)
                .map(Value::Date)
                .ok_or_else(|| Error::corruption(format!("invalid date value: {days}")))
        }
        TAG_STRING => {
            need(buf, 4)?;
            let len = buf.get_u32_le() as usize;
            need(buf, len)?;
            let s = std::str::from_utf8(&buf[..len])
                .map_err(|e| Error::corruption(format!("invalid string value: {e}")))?
                .to_string();
            buf.advance(len);
            Ok(Value::String(s))
        }
        tag => Err(Error::corruption(format!("unknown value tag {tag}"))),
    }
}

/// Decode exactly `count` values
pub fn decode_values(mut data: &[u8], count: usize) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(decode_value(&mut data)?);
    }
    Ok(values)
}

pub fn encode_marks(marks: &[Mark]) -> Vec<u8> {
    let mut out = Vec::with_capacity(marks.len() * MARK_SIZE);
    for mark in marks {
        out.put_u64_le(mark.offset);
        out.put_u64_le(mark.rows);
    }
    out
}

pub fn decode_marks(mut data: &[u8]) -> Result<Vec<Mark>> {
    if data.len() % MARK_SIZE != 0 {
        return Err(Error::corruption(format!(
            "mark file size {} is not a multiple of {MARK_SIZE}",
            data.len()
        )));
    }
    let mut marks = Vec::with_capacity(data.len() / MARK_SIZE);
    while data.has_remaining() {
        marks.push(Mark {
            offset: data.get_u64_le(),
            rows: data.get_u64_le(),
        });
    }
    Ok(marks)
}

/// Encode one column of a wide part
pub fn encode_column(values: &[Value], granularity: usize) -> (Vec<u8>, Vec<Mark>) {
    let mut data = Vec::new();
    let mut marks = Vec::new();
    for granule in values.chunks(granularity.max(1)) {
        marks.push(Mark {
            offset: data.len() as u64,
            rows: granule.len() as u64,
        });
        for value in granule {
            encode_value(value, &mut data);
        }
    }
    (data, marks)
}

/// Encode all columns of a compact part into one data file
///
/// Marks are stored granule-major: granule 0 of every column, then
/// granule 1, and so on.
pub fn encode_compact(columns: &[Vec<Value>], granularity: usize) -> (Vec<u8>, Vec<Mark>) {
    let rows = columns.first().map_or(0, Vec::len);
    let granularity = granularity.max(1);
    let mut data = Vec::new();
    let mut marks = Vec::new();
    let mut start = 0;
    while start < rows {
        let end = (start + granularity).min(rows);
        for column in columns {
            marks.push(Mark {
                offset: data.len() as u64,
                rows: (end - start) as u64,
            });
            for value in &column[start..end] {
                encode_value(value, &mut data);
            }
        }
        start = end;
    }
    (data, marks)
}

/// Marks of column `index` out of granule-major compact marks
pub fn compact_column_marks(marks: &[Mark], columns: usize, index: usize) -> Result<Vec<Mark>> {
    if columns == 0 || marks.len() % columns != 0 || index >= columns {
        return Err(Error::corruption(format!(
            "{} compact marks do not fit {columns} columns",
            marks.len()
        )));
    }
    Ok(marks.iter().skip(index).step_by(columns).copied().collect())
}

/// Byte range of the granule starting at `start` in a data file
///
/// `offsets` are all mark offsets of the file in ascending order. Granules
/// of one column need not be adjacent (compact parts), so the end is the
/// next offset in the file rather than the next mark of the column.
pub fn granule_range(offsets: &[u64], start: u64, file_size: u64) -> (u64, u64) {
    let next = offsets.partition_point(|o| *o <= start);
    (start, offsets.get(next).copied().unwrap_or(file_size))
}

/// Encode rows of values (primary index, skip index entries)
pub fn encode_rows(rows: &[Vec<Value>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.put_u32_le(rows.len() as u32);
    for row in rows {
        out.put_u32_le(row.len() as u32);
        for value in row {
            encode_value(value, &mut out);
        }
    }
    out
}

pub fn decode_rows(mut data: &[u8]) -> Result<Vec<Vec<Value>>> {
    need(data, 4)?;
    let count = data.get_u32_le() as usize;
    let mut rows = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        need(data, 4)?;
        let width = data.get_u32_le() as usize;
        let mut row = Vec::with_capacity(width.min(1024));
        for _ in 0..width {
            row.push(decode_value(&mut data)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_granules_decode_independently() {
        let values: Vec<Value> = (0..10i64).map(Value::Int64).collect();
        let (data, marks) = encode_column(&values, 4);
        assert_eq!(marks.len(), 3);
        assert_eq!(marks[2].rows, 2);

        let offsets: Vec<u64> = marks.iter().map(|m| m.offset).collect();
        let (start, end) = granule_range(&offsets, marks[1].offset, data.len() as u64);
        let granule = decode_values(&data[start as usize..end as usize], 4).unwrap();
        assert_eq!(granule, (4..8i64).map(Value::Int64).collect::<Vec<_>>());

        let decoded = decode_marks(&encode_marks(&marks)).unwrap();
        assert_eq!(decoded, marks);
        assert!(decode_marks(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_compact_layout() {
        let ids: Vec<Value> = (0..5u64).map(Value::UInt64).collect();
        let names: Vec<Value> = (0..5).map(|i| Value::String(format!("n{i}"))).collect();
        let (data, marks) = encode_compact(&[ids.clone(), names.clone()], 2);
        assert_eq!(marks.len(), 6);

        let name_marks = compact_column_marks(&marks, 2, 1).unwrap();
        let offsets: Vec<u64> = marks.iter().map(|m| m.offset).collect();
        let mut decoded = Vec::new();
        for mark in &name_marks {
            let (start, end) = granule_range(&offsets, mark.offset, data.len() as u64);
            decoded.extend(decode_values(&data[start as usize..end as usize], mark.rows as usize).unwrap());
        }
        assert_eq!(decoded, names);
        assert!(compact_column_marks(&marks, 4, 0).is_err());
    }

    #[test]
    fn test_rows_and_corruption() {
        let day = NaiveDate::from_ymd_opt(2020, 1, 3).unwrap();
        let rows = vec![
            vec![Value::Date(day), Value::from("2020-01-03"), Value::Int64(-5)],
            vec![Value::Date(day), Value::from("2020-01-03"), Value::Int64(512)],
        ];
        assert_eq!(decode_rows(&encode_rows(&rows)).unwrap(), rows);

        let mut truncated = encode_rows(&rows);
        truncated.truncate(truncated.len() - 3);
        assert!(matches!(decode_rows(&truncated), Err(Error::Corruption(_))));
        assert!(decode_value(&mut &[9u8][..]).is_err());

        let mut bad_date = vec![TAG_DATE];
        bad_date.extend_from_slice(&i32::MAX.to_le_bytes());
        assert!(matches!(decode_value(&mut &bad_date[..]), Err(Error::Corruption(_))));
    }
}
