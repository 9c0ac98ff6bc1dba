//! Rows as they arrive from the ingestion path
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::timestamp::TimestampRange;

/// The value of a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    I64(i64),
    U64(u64),
    /// Stored as its bit pattern so NaN and infinities survive text formats
    F64(#[serde(with = "f64_bits")] f64),
    Bool(bool),
    String(String),
}

mod f64_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        u64::deserialize(deserializer).map(f64::from_bits)
    }
}

/// A single row of a table: a timestamp plus named field values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Nanoseconds since the epoch
    pub time: i64,

    pub fields: BTreeMap<String, FieldValue>,
}

impl Row {
    pub fn new(time: i64) -> Self {
        Self {
            time,
            fields: Default::default(),
        }
    }

    /// Builder-style helper to add a field
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Approximate memory footprint in bytes
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .fields
                .iter()
                .map(|(k, v)| {
                    let heap = match v {
                        FieldValue::String(s) => s.len(),
                        _ => 0,
                    };
                    k.len() + std::mem::size_of::<FieldValue>() + heap
                })
                .sum::<usize>()
    }
}

/// Returns the range of timestamps covered by `rows`, or `None` if empty
pub fn rows_timestamp_range(rows: &[Row]) -> Option<TimestampRange> {
    let min = rows.iter().map(|r| r.time).min()?;
    let max = rows.iter().map(|r| r.time).max()?;
    Some(TimestampRange::new(min, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_timestamp_range() {
        assert_eq!(rows_timestamp_range(&[]), None);

        let rows = vec![
            Row::new(30).with_field("temp", FieldValue::F64(1.5)),
            Row::new(10),
            Row::new(20).with_field("ok", FieldValue::Bool(true)),
        ];
        assert_eq!(rows_timestamp_range(&rows), Some(TimestampRange::new(10, 30)));
    }

    #[test]
    fn test_row_json() {
        let row = Row::new(1).with_field("host", FieldValue::String("a".into()));
        let json = serde_json::to_string(&row).unwrap();
        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(row, back);
    }

    #[test]
    fn test_non_finite_floats_json() {
        let values = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -0.0, 1.5];
        let row = values
            .iter()
            .enumerate()
            .fold(Row::new(1), |row, (i, v)| {
                row.with_field(format!("f{i}"), FieldValue::F64(*v))
            });

        let json = serde_json::to_string(&row).unwrap();
        let back: Row = serde_json::from_str(&json).unwrap();

        for (i, v) in values.iter().enumerate() {
            match &back.fields[&format!("f{i}")] {
                FieldValue::F64(f) => assert_eq!(f.to_bits(), v.to_bits()),
                other => panic!("unexpected value: {other:?}"),
            }
        }
    }
}
