//! Canonical data model for AirGradient measurements.
//!
//! A reading flows through three shapes: a [`RawBatch`] as delivered by the
//! API or a CSV file, a [`NormalizedRecord`] carrying the canonical columns
//! with identity still optional, and a [`Measurement`] whose [`IdentityKey`]
//! is complete and ready to merge.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

// ---

/// SQL column type of a canonical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Double,
    Text,
    Timestamp,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Text => "TEXT",
            ColumnType::Timestamp => "TIMESTAMPTZ",
        }
    }
}

/// Columns forming the primary key of the measures table.
pub const IDENTITY_COLUMNS: [&str; 3] = ["locationId", "timestamp", "serialno"];

/// Every canonical column, in table order.
pub const CANONICAL_COLUMNS: [(&str, ColumnType); 25] = [
    ("locationId", ColumnType::Integer),
    ("locationName", ColumnType::Text),
    ("pm01", ColumnType::Double),
    ("pm02", ColumnType::Double),
    ("pm10", ColumnType::Double),
    ("pm01_corrected", ColumnType::Double),
    ("pm02_corrected", ColumnType::Double),
    ("pm10_corrected", ColumnType::Double),
    ("pm003Count", ColumnType::Double),
    ("atmp", ColumnType::Double),
    ("rhum", ColumnType::Double),
    ("rco2", ColumnType::Double),
    ("atmp_corrected", ColumnType::Double),
    ("rhum_corrected", ColumnType::Double),
    ("rco2_corrected", ColumnType::Double),
    ("tvoc", ColumnType::Double),
    ("wifi", ColumnType::Double),
    ("timestamp", ColumnType::Timestamp),
    ("serialno", ColumnType::Text),
    ("model", ColumnType::Text),
    ("firmwareVersion", ColumnType::Text),
    ("tvocIndex", ColumnType::Double),
    ("noxIndex", ColumnType::Integer),
    ("datapoints", ColumnType::Integer),
    ("updated_at", ColumnType::Timestamp),
];

/// Canonical columns that are overwritten when a key already exists.
pub fn non_key_columns() -> impl Iterator<Item = &'static str> {
    CANONICAL_COLUMNS
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| !IDENTITY_COLUMNS.contains(name))
}

/// The merge key of one reading.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityKey {
    // ---
    pub location_id: i32,
    pub timestamp: DateTime<Utc>,
    pub serialno: String,
}

/// All non-identity attributes of a reading except `updated_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementValues {
    // ---
    pub location_name: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub pm01: Option<f64>,
    pub pm02: Option<f64>,
    pub pm10: Option<f64>,
    pub pm01_corrected: Option<f64>,
    pub pm02_corrected: Option<f64>,
    pub pm10_corrected: Option<f64>,
    pub pm003_count: Option<f64>,
    pub atmp: Option<f64>,
    pub rhum: Option<f64>,
    pub rco2: Option<f64>,
    pub atmp_corrected: Option<f64>,
    pub rhum_corrected: Option<f64>,
    pub rco2_corrected: Option<f64>,
    pub tvoc: Option<f64>,
    pub tvoc_index: Option<f64>,
    pub nox_index: Option<i32>,
    pub wifi: Option<f64>,
    pub datapoints: Option<i32>,
}

/// A reading after schema normalization. Identity may still be incomplete.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    // ---
    pub location_id: Option<i32>,
    pub timestamp: Option<DateTime<Utc>>,
    pub serialno: Option<String>,
    pub values: MeasurementValues,
}

/// A reading with a complete identity key, ready to merge.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    // ---
    pub key: IdentityKey,
    pub values: MeasurementValues,
}

/// A row as held by a store, including its provenance stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMeasurement {
    // ---
    pub measurement: Measurement,
    pub updated_at: DateTime<Utc>,
}

/// One fetch or file read before normalization.
///
/// `columns` follows the source's header order where it has one; each row
/// maps column name to cell. Missing cells and JSON `null` are equivalent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    // ---
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl RawBatch {
    // ---
    /// Build a batch from decoded JSON objects, collecting the column union.
    pub fn from_objects(rows: Vec<Map<String, Value>>) -> Self {
        // ---
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for name in row.keys() {
                if !columns.iter().any(|c| c == name) {
                    columns.push(name.clone());
                }
            }
        }
        RawBatch { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_from_objects_collects_column_union() {
        // ---
        let batch = RawBatch::from_objects(vec![
            object(json!({"locationId": 1, "pm02": 3.0})),
            object(json!({"locationId": 1, "rco2": 400})),
        ]);

        assert_eq!(batch.len(), 2);
        assert!(batch.has_column("locationId"));
        assert!(batch.has_column("pm02"));
        assert!(batch.has_column("rco2"));
        assert_eq!(batch.columns.len(), 3);
    }

    #[test]
    fn test_non_key_columns_excludes_identity() {
        // ---
        let columns: Vec<&str> = non_key_columns().collect();

        assert_eq!(columns.len(), CANONICAL_COLUMNS.len() - IDENTITY_COLUMNS.len());
        assert!(!columns.contains(&"locationId"));
        assert!(!columns.contains(&"timestamp"));
        assert!(!columns.contains(&"serialno"));
        assert!(columns.contains(&"updated_at"));
    }
}
