//! Schema normalization: maps API and legacy-export batches onto the
//! canonical column set.
//!
//! The variant is resolved once per batch by [`SchemaVariant::detect`]. Each
//! variant is described by data (signature column, optional label map,
//! optional serial prefix) so the per-row conversion is shared. Normalization
//! is all-or-nothing: the first malformed cell rejects the whole batch.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::error::IngestError;
use crate::models::{MeasurementValues, NormalizedRecord, RawBatch};

// ---

/// Literal prefix the legacy export puts in front of every serial number.
pub const LEGACY_SERIAL_PREFIX: &str = "airgradient:";

/// Legacy dashboard-export column labels and the canonical field each maps to.
///
/// Labels absent from this table are dropped. Canonical columns with no
/// label here (`pm01_corrected`, `pm10_corrected`, `wifi`, `model`,
/// `firmwareVersion`) come out null.
pub const LEGACY_COLUMN_MAP: &[(&str, &str)] = &[
    ("Location ID", "locationId"),
    ("Location Name", "locationName"),
    ("Sensor ID", "serialno"),
    ("UTC Date/Time", "timestamp"),
    ("# of aggregated records", "datapoints"),
    ("PM1 (μg/m³)", "pm01"),
    ("PM2.5 (μg/m³) raw", "pm02"),
    ("PM2.5 (μg/m³) corrected", "pm02_corrected"),
    ("PM10 (μg/m³)", "pm10"),
    ("0.3μm particle count", "pm003Count"),
    ("CO2 (ppm) raw", "rco2"),
    ("CO2 (ppm) corrected", "rco2_corrected"),
    ("Temperature (°C) raw", "atmp"),
    ("Temperature (°C) corrected", "atmp_corrected"),
    ("Humidity (%) raw", "rhum"),
    ("Humidity (%) corrected", "rhum_corrected"),
    ("TVOC (ppb)", "tvoc"),
    ("TVOC index", "tvocIndex"),
    ("NOX index", "noxIndex"),
];

/// Unzoned timestamp layouts; values in these are taken to be UTC.
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Zoned layouts not covered by RFC 3339.
const ZONED_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Input schema of a raw batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVariant {
    /// AirGradient public API records and our own archive files.
    Current,
    /// Human-labelled dashboard CSV export.
    Legacy,
}

impl SchemaVariant {
    /// Variants in detection priority order.
    pub const ALL: [SchemaVariant; 2] = [SchemaVariant::Current, SchemaVariant::Legacy];

    /// Column whose presence identifies the variant.
    pub fn signature_column(&self) -> &'static str {
        match self {
            SchemaVariant::Current => "locationId",
            SchemaVariant::Legacy => "Location ID",
        }
    }

    /// Label map for renaming; `None` means columns are already canonical.
    pub fn column_map(&self) -> Option<&'static [(&'static str, &'static str)]> {
        match self {
            SchemaVariant::Current => None,
            SchemaVariant::Legacy => Some(LEGACY_COLUMN_MAP),
        }
    }

    pub fn serial_prefix(&self) -> Option<&'static str> {
        match self {
            SchemaVariant::Current => None,
            SchemaVariant::Legacy => Some(LEGACY_SERIAL_PREFIX),
        }
    }

    /// Resolve the variant of a batch from its column names.
    pub fn detect(columns: &[String]) -> Result<Self, IngestError> {
        // ---
        Self::ALL
            .into_iter()
            .find(|variant| columns.iter().any(|c| c == variant.signature_column()))
            .ok_or_else(|| IngestError::UnrecognizedSchema {
                columns: columns.to_vec(),
            })
    }
}

/// A normalized batch: every record exposes every canonical column.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    // ---
    pub variant: SchemaVariant,
    pub records: Vec<NormalizedRecord>,
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Normalize a raw batch of either variant.
///
/// Fails with `UnrecognizedSchema` when no variant signature is present, and
/// with `MalformedTimestamp` / `MalformedValue` on the first cell that cannot
/// be coerced. No partial batch is ever returned.
pub fn normalize(raw: &RawBatch) -> Result<RecordBatch, IngestError> {
    // ---
    let variant = SchemaVariant::detect(&raw.columns)?;
    tracing::debug!("Normalizing {} rows as {:?} schema", raw.len(), variant);

    let records = raw
        .rows
        .iter()
        .enumerate()
        .map(|(row, cells)| match variant.column_map() {
            Some(map) => normalize_row(row, &rename(cells, map), variant),
            None => normalize_row(row, cells, variant),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RecordBatch { variant, records })
}

/// Parse a timestamp cell, attaching UTC to unzoned values.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    // ---
    let text = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ZONED_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(text, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }

    let naive = text
        .strip_suffix(" UTC")
        .or_else(|| text.strip_suffix('Z'))
        .unwrap_or(text);
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(naive, format).ok())
        .map(|ts| ts.and_utc())
}

// ---

fn rename(cells: &Map<String, Value>, map: &[(&str, &str)]) -> Map<String, Value> {
    // ---
    cells
        .iter()
        .filter_map(|(label, value)| {
            map.iter()
                .find(|(from, _)| from == label)
                .map(|(_, to)| (to.to_string(), value.clone()))
        })
        .collect()
}

fn normalize_row(
    row: usize,
    cells: &Map<String, Value>,
    variant: SchemaVariant,
) -> Result<NormalizedRecord, IngestError> {
    // ---
    // A bare prefix carries no serial and counts as missing.
    let serialno = text(cells, "serialno")
        .map(|serial| match variant.serial_prefix() {
            Some(prefix) => serial.strip_prefix(prefix).unwrap_or(&serial).trim().to_string(),
            None => serial,
        })
        .filter(|serial| !serial.is_empty());

    let timestamp = match cell(cells, "timestamp") {
        None => None,
        Some(value) => {
            let raw = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match parse_timestamp(&raw) {
                Some(ts) => Some(ts),
                None => return Err(IngestError::MalformedTimestamp { row, value: raw }),
            }
        }
    };

    let values = MeasurementValues {
        location_name: text(cells, "locationName"),
        model: text(cells, "model"),
        firmware_version: text(cells, "firmwareVersion"),
        pm01: float(row, cells, "pm01")?,
        pm02: float(row, cells, "pm02")?,
        pm10: float(row, cells, "pm10")?,
        pm01_corrected: float(row, cells, "pm01_corrected")?,
        pm02_corrected: float(row, cells, "pm02_corrected")?,
        pm10_corrected: float(row, cells, "pm10_corrected")?,
        pm003_count: float(row, cells, "pm003Count")?,
        atmp: float(row, cells, "atmp")?,
        rhum: float(row, cells, "rhum")?,
        rco2: float(row, cells, "rco2")?,
        atmp_corrected: float(row, cells, "atmp_corrected")?,
        rhum_corrected: float(row, cells, "rhum_corrected")?,
        rco2_corrected: float(row, cells, "rco2_corrected")?,
        tvoc: float(row, cells, "tvoc")?,
        tvoc_index: float(row, cells, "tvocIndex")?,
        nox_index: integer(row, cells, "noxIndex")?,
        wifi: float(row, cells, "wifi")?,
        datapoints: integer(row, cells, "datapoints")?,
    };

    Ok(NormalizedRecord {
        location_id: integer(row, cells, "locationId")?,
        timestamp,
        serialno,
        values,
    })
}

/// Cell lookup treating absent, `null` and blank strings alike.
fn cell<'a>(cells: &'a Map<String, Value>, column: &str) -> Option<&'a Value> {
    match cells.get(column) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(value) => Some(value),
    }
}

fn text(cells: &Map<String, Value>, column: &str) -> Option<String> {
    cell(cells, column).map(|value| match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    })
}

fn malformed(row: usize, column: &'static str, value: &Value) -> IngestError {
    IngestError::MalformedValue {
        row,
        column,
        value: value.to_string(),
    }
}

fn float(
    row: usize,
    cells: &Map<String, Value>,
    column: &'static str,
) -> Result<Option<f64>, IngestError> {
    // ---
    let Some(value) = cell(cells, column) else {
        return Ok(None);
    };
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| malformed(row, column, value))
}

fn integer(
    row: usize,
    cells: &Map<String, Value>,
    column: &'static str,
) -> Result<Option<i32>, IngestError> {
    // ---
    let Some(value) = cell(cells, column) else {
        return Ok(None);
    };
    let as_float = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    // Integral floats ("12.0") show up in CSV round trips.
    as_float
        .filter(|f| f.fract() == 0.0 && *f >= f64::from(i32::MIN) && *f <= f64::from(i32::MAX))
        .map(|f| Some(f as i32))
        .ok_or_else(|| malformed(row, column, value))
}
